//! Participant-side view of a consultation chat.
//!
//! [`engine::SessionEngine`] keeps one ordered, de-duplicated message list per
//! open session, merging REST history, optimistic local sends and events
//! pushed by the relay. The connection it listens on is injected through the
//! [`transport::Transport`] trait; [`transport::WsTransport`] is the real one.

pub mod api;
pub mod backoff;
pub mod engine;
pub mod error;
pub mod message;
pub mod transport;

pub use api::{ChatApi, ClientConfig, HttpChatApi, fetch_full_history};
pub use engine::{FollowUp, SessionEngine, ViewState};
pub use error::ClientError;
pub use message::{LocalMessage, MessageId, TranslationState};
pub use transport::{Transport, TransportEvent, WsTransport};
