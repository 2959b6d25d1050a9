mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderValue, Method, header::{AUTHORIZATION, CONTENT_TYPE}},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use medibridge_api::auth::{self, AppState, AppStateInner};
use medibridge_api::error::ApiError;
use medibridge_api::messages;
use medibridge_api::middleware::require_auth;
use medibridge_api::relay::Relay;
use medibridge_api::translator::{MockTranslator, OpenAiTranslator, Translator};
use medibridge_gateway::connection;
use medibridge_gateway::dispatcher::Dispatcher;

use crate::config::Config;

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "medibridge=debug,medibridge_api=debug,medibridge_gateway=debug,medibridge_db=debug,tower_http=debug".into()
            }),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(medibridge_db::Database::open(&config.db_path)?);

    let translator: Arc<dyn Translator> = if config.ai_token.is_empty() {
        warn!("MEDIBRIDGE_AI_TOKEN is empty, using mock translations");
        Arc::new(MockTranslator)
    } else {
        Arc::new(OpenAiTranslator::new(
            &config.ai_endpoint,
            &config.ai_token,
            &config.translation_model,
        )?)
    };

    // Shared state
    let dispatcher = Dispatcher::new();
    let relay = Relay::new(db.clone(), dispatcher.clone(), translator);
    let state: AppState = Arc::new(AppStateInner {
        db,
        dispatcher,
        relay,
        jwt_secret: config.jwt_secret.clone(),
    });

    // Routes
    let protected_routes = Router::new()
        .route("/sessions/{session_id}/messages", get(messages::get_messages))
        .route("/sessions/{session_id}/send", post(messages::send_message))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(protected_routes)
        .merge(ws_route)
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http());

    let addr = config.bind_addr()?;
    info!("MediBridge relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        let values: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin '{}'", o);
                    None
                }
            })
            .collect();
        AllowOrigin::list(values)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
}

/// The token is checked before upgrading so a bad one gets a plain 401.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match query.token.as_deref().map(|t| auth::decode_token(&state.jwt_secret, t)) {
        Some(Ok(claims)) => claims,
        _ => {
            warn!("Gateway connection rejected: missing or invalid token");
            return ApiError::Unauthorized.into_response();
        }
    };

    let dispatcher = state.dispatcher.clone();
    let db = state.db.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher, db, claims.sub))
}
