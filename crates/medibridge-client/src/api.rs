use std::future::Future;
use std::sync::Arc;

use reqwest::StatusCode;
use tracing::{debug, warn};
use uuid::Uuid;

use medibridge_types::api::{ErrorBody, MAX_PAGE_LIMIT, SendMessageRequest};
use medibridge_types::models::Message;

use crate::error::ClientError;
use crate::transport::WsTransport;

/// Error text the relay uses for a rejected pagination cursor.
const INVALID_CURSOR_ERROR: &str = "invalid cursor";

/// REST surface of the relay as the session engine sees it.
pub trait ChatApi {
    /// One page of history, oldest first, strictly newer than `cursor`.
    fn fetch_page(
        &self,
        session_id: Uuid,
        limit: u32,
        cursor: Option<Uuid>,
    ) -> impl Future<Output = Result<Vec<Message>, ClientError>> + Send;

    fn send_message(
        &self,
        session_id: Uuid,
        req: &SendMessageRequest,
    ) -> impl Future<Output = Result<Message, ClientError>> + Send;
}

impl<A: ChatApi + Send + Sync> ChatApi for Arc<A> {
    fn fetch_page(
        &self,
        session_id: Uuid,
        limit: u32,
        cursor: Option<Uuid>,
    ) -> impl Future<Output = Result<Vec<Message>, ClientError>> + Send {
        (**self).fetch_page(session_id, limit, cursor)
    }

    fn send_message(
        &self,
        session_id: Uuid,
        req: &SendMessageRequest,
    ) -> impl Future<Output = Result<Message, ClientError>> + Send {
        (**self).send_message(session_id, req)
    }
}

/// Where the relay lives and who we are to it.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `http://localhost:8000`
    pub base_url: String,
    pub token: String,
    pub page_size: u32,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            page_size: MAX_PAGE_LIMIT,
        }
    }

    /// Websocket URL of the relay gateway, with the token as a query param.
    pub fn gateway_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/gateway?token={}", ws_base, self.token)
    }

    pub fn http_api(&self) -> HttpChatApi {
        HttpChatApi {
            client: reqwest::Client::new(),
            base_url: self.base_url.trim_end_matches('/').to_string(),
            token: self.token.clone(),
        }
    }

    /// Starts the reconnecting websocket. Must be called inside a tokio runtime.
    pub fn connect_transport(&self) -> WsTransport {
        WsTransport::connect(self.gateway_url())
    }
}

#[derive(Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpChatApi {
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let invalid_cursor = status == StatusCode::BAD_REQUEST
            && serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error == INVALID_CURSOR_ERROR)
                .unwrap_or(false);
        if invalid_cursor {
            return Err(ClientError::InvalidCursor);
        }
        Err(ClientError::Status { status: status.as_u16(), body })
    }
}

impl ChatApi for HttpChatApi {
    async fn fetch_page(
        &self,
        session_id: Uuid,
        limit: u32,
        cursor: Option<Uuid>,
    ) -> Result<Vec<Message>, ClientError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let resp = self
            .client
            .get(format!("{}/sessions/{}/messages", self.base_url, session_id))
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn send_message(
        &self,
        session_id: Uuid,
        req: &SendMessageRequest,
    ) -> Result<Message, ClientError> {
        let resp = self
            .client
            .post(format!("{}/sessions/{}/send", self.base_url, session_id))
            .bearer_auth(&self.token)
            .json(req)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }
}

/// Walk the whole history of a session, oldest first.
///
/// Stops at the first page shorter than the page size. A transient failure
/// of a page is retried once; an invalid cursor is returned immediately.
pub async fn fetch_full_history<A: ChatApi>(
    api: &A,
    session_id: Uuid,
    page_size: u32,
) -> Result<Vec<Message>, ClientError> {
    // A page larger than the server cap would come back short and end the walk early.
    let page_size = page_size.clamp(1, MAX_PAGE_LIMIT);
    let mut all: Vec<Message> = Vec::new();
    let mut cursor: Option<Uuid> = None;

    loop {
        let page = match api.fetch_page(session_id, page_size, cursor).await {
            Ok(page) => page,
            Err(e) if e.is_transient() => {
                warn!("History page for {} failed ({}), retrying once", session_id, e);
                api.fetch_page(session_id, page_size, cursor).await?
            }
            Err(e) => return Err(e),
        };

        let short = (page.len() as u32) < page_size;
        if let Some(last) = page.last() {
            cursor = Some(last.id);
        }
        all.extend(page);
        if short {
            break;
        }
    }

    debug!("Fetched {} messages for session {}", all.len(), session_id);
    Ok(all)
}
