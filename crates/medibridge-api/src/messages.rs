use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tracing::{error, warn};
use uuid::Uuid;

use medibridge_db::PageError;
use medibridge_types::api::{Claims, MessageQuery, SendMessageRequest};
use medibridge_types::models::Message;

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

/// GET /sessions/{session_id}/messages?limit=&cursor=
///
/// Oldest first. With a cursor, only messages strictly newer than the
/// cursor message. Only the session's participants may read it.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<Message>>> {
    let limit = query.effective_limit();
    let cursor = match query.cursor.as_deref().filter(|c| !c.is_empty()) {
        Some(raw) => Some(raw.parse::<Uuid>().map_err(|_| {
            warn!("Malformed cursor '{}' for session {}", raw, session_id);
            ApiError::InvalidCursor
        })?),
        None => None,
    };

    // Run all blocking DB queries off the async runtime
    let db = state.db.clone();
    let page = tokio::task::spawn_blocking(move || {
        let session = db
            .get_session(session_id)
            .map_err(ApiError::Storage)?
            .ok_or(ApiError::SessionNotFound)?;
        if !session.is_participant(claims.sub) {
            return Err(ApiError::NotParticipant);
        }

        db.get_messages_page(session_id, limit, cursor).map_err(|e| match e {
            PageError::UnknownCursor(id) => {
                warn!("Unknown cursor {} for session {}", id, session_id);
                ApiError::InvalidCursor
            }
            PageError::Storage(e) => ApiError::Storage(e),
        })
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Storage(e.into())
    })??;

    Ok(Json(page))
}

/// POST /sessions/{session_id}/send
///
/// Returns the persisted message before its translation exists; the
/// translation follows as a `message_updated` event.
pub async fn send_message(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let message = state
        .relay
        .send(session_id, claims.sub, req.content, req.sender_language)
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use medibridge_db::Database;
    use medibridge_gateway::dispatcher::Dispatcher;
    use medibridge_types::models::{ConsultationSession, Role};

    use crate::auth::AppStateInner;
    use crate::relay::Relay;
    use crate::translator::MockTranslator;

    fn state() -> (AppState, ConsultationSession) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let session = db.create_session(Uuid::new_v4(), Some("es")).unwrap();
        db.assign_doctor(session.id, Uuid::new_v4(), Some("en")).unwrap();
        let session = db.get_session(session.id).unwrap().unwrap();

        let dispatcher = Dispatcher::new();
        let relay = Relay::new(db.clone(), dispatcher.clone(), Arc::new(MockTranslator));
        let state = Arc::new(AppStateInner {
            db,
            dispatcher,
            relay,
            jwt_secret: "test".into(),
        });
        (state, session)
    }

    fn claims(user: Uuid, role: Role) -> Extension<Claims> {
        Extension(Claims { sub: user, role, exp: usize::MAX })
    }

    fn query(limit: Option<u32>, cursor: Option<String>) -> Query<MessageQuery> {
        Query(MessageQuery { limit, cursor })
    }

    async fn send(state: &AppState, session: &ConsultationSession, text: &str) -> Message {
        let (status, Json(msg)) = send_message(
            State(state.clone()),
            Path(session.id),
            claims(session.patient_id, Role::Patient),
            Json(SendMessageRequest { content: text.into(), sender_language: None }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        msg
    }

    #[tokio::test]
    async fn test_send_then_page_through_history() {
        let (state, session) = state();
        let mut sent = Vec::new();
        for i in 0..7 {
            sent.push(send(&state, &session, &format!("line {}", i)).await.id);
        }

        let mut seen = Vec::new();
        let mut cursor: Option<Uuid> = None;
        loop {
            let Json(page) = get_messages(
                State(state.clone()),
                Path(session.id),
                query(Some(3), cursor.map(|c| c.to_string())),
                claims(session.patient_id, Role::Patient),
            )
            .await
            .unwrap();
            let short = page.len() < 3;
            cursor = page.last().map(|m| m.id).or(cursor);
            seen.extend(page.into_iter().map(|m| m.id));
            if short {
                break;
            }
        }
        assert_eq!(seen, sent);
    }

    #[tokio::test]
    async fn test_bad_cursors_are_client_errors() {
        let (state, session) = state();
        send(&state, &session, "hi").await;

        for cursor in ["not-a-uuid".to_string(), Uuid::new_v4().to_string()] {
            let err = get_messages(
                State(state.clone()),
                Path(session.id),
                query(None, Some(cursor)),
                claims(session.patient_id, Role::Patient),
            )
            .await
            .unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_outsiders_are_forbidden() {
        let (state, session) = state();

        let err = get_messages(
            State(state.clone()),
            Path(session.id),
            query(None, None),
            claims(Uuid::new_v4(), Role::Doctor),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let err = send_message(
            State(state.clone()),
            Path(Uuid::new_v4()),
            claims(session.patient_id, Role::Patient),
            Json(SendMessageRequest { content: "x".into(), sender_language: None }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
