#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The server did not recognise the pagination cursor. This is a bug in
    /// the caller's paging state, never worth retrying.
    #[error("server rejected the pagination cursor")]
    InvalidCursor,

    #[error("no session is open")]
    SessionClosed,
}

impl ClientError {
    /// Whether a single retry of the same request is reasonable.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Status { status, .. } => *status >= 500,
            Self::InvalidCursor | Self::SessionClosed => false,
        }
    }
}
