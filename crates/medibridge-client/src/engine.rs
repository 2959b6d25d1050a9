use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use medibridge_types::api::SendMessageRequest;
use medibridge_types::events::{RelayCommand, RelayEvent};
use medibridge_types::models::{Message, MessagePatch};

use crate::api::{ChatApi, ClientConfig, HttpChatApi, fetch_full_history};
use crate::error::ClientError;
use crate::message::{LocalMessage, MessageId};
use crate::transport::{Transport, TransportEvent};

/// Work a transport event leaves for the caller to do asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// Re-fetch the full history and merge it in.
    Resync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Closed,
    /// Initial history fetch in progress
    Fetching,
    /// History loaded, no relay connection seen yet
    Idle,
    Live { connected: bool },
}

/// One participant's view of one consultation session.
///
/// Owned by a single task; every handler runs to completion before the next
/// event is looked at. Events are buffered in the transport listener while
/// an `open`, `send` or resync is awaiting the network.
pub struct SessionEngine<T: Transport, A: ChatApi> {
    transport: T,
    api: A,
    user_id: Uuid,
    page_size: u32,

    session_id: Option<Uuid>,
    fetching: bool,
    went_live: bool,
    needs_resync: bool,
    messages: Vec<LocalMessage>,
    connected: bool,
    room_joined: bool,
    listener: Option<broadcast::Receiver<TransportEvent>>,
    next_temp: u64,
}

impl<T: Transport, A: ChatApi> SessionEngine<T, A> {
    pub fn new(transport: T, api: A, user_id: Uuid, page_size: u32) -> Self {
        Self {
            transport,
            api,
            user_id,
            page_size,
            session_id: None,
            fetching: false,
            went_live: false,
            needs_resync: false,
            messages: Vec::new(),
            connected: false,
            room_joined: false,
            listener: None,
            next_temp: 0,
        }
    }

    /// Load the session's history and start listening to the relay.
    ///
    /// The listener is attached and the room joined before the history is
    /// fetched, so nothing published in between is lost; duplicates are
    /// absorbed by the id check in [`handle_new_message`]. On failure the
    /// engine is left closed.
    ///
    /// [`handle_new_message`]: Self::handle_new_message
    pub async fn open(&mut self, session_id: Uuid) -> Result<(), ClientError> {
        if self.session_id.is_some() {
            self.close();
        }

        self.session_id = Some(session_id);
        self.fetching = true;
        self.listener = Some(self.transport.subscribe());

        if self.transport.is_connected() {
            self.connected = true;
            self.went_live = true;
            self.join_room();
        } else {
            // Whatever is published before the first connect never reaches us.
            self.needs_resync = true;
        }

        match fetch_full_history(&self.api, session_id, self.page_size).await {
            Ok(history) => {
                self.messages = history.into_iter().map(LocalMessage::from).collect();
                self.fetching = false;
                info!("Opened session {} with {} messages", session_id, self.messages.len());
                Ok(())
            }
            Err(e) => {
                warn!("Failed to load history for session {}: {}", session_id, e);
                self.close();
                Err(e)
            }
        }
    }

    /// Stop listening. `leave_room` is only sent while connected; a leave
    /// replayed after a reconnect could evict the next `open` of the same
    /// session.
    pub fn close(&mut self) {
        if let Some(session_id) = self.session_id {
            if self.transport.is_connected() {
                self.transport.emit(RelayCommand::LeaveRoom { session_id });
            }
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.session_id = None;
        self.fetching = false;
        self.went_live = false;
        self.needs_resync = false;
        self.messages.clear();
        self.connected = false;
        self.room_joined = false;
        self.listener = None;
    }

    fn join_room(&mut self) {
        if let Some(session_id) = self.session_id {
            self.room_joined = self.transport.emit(RelayCommand::JoinRoom { session_id });
            debug!("join_room {} sent: {}", session_id, self.room_joined);
        }
    }

    /// Apply one transport event. Returns what still has to be awaited.
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Option<FollowUp> {
        if self.session_id.is_none() {
            return None;
        }

        match event {
            TransportEvent::Connected => {
                self.connected = true;
                self.went_live = true;
                // Always re-join: the relay forgets rooms with the connection.
                self.join_room();
                if self.needs_resync {
                    return Some(FollowUp::Resync);
                }
            }
            TransportEvent::Disconnected => {
                self.connected = false;
                self.room_joined = false;
                self.needs_resync = true;
            }
            TransportEvent::Relay(RelayEvent::NewMessage(msg)) => self.handle_new_message(msg),
            TransportEvent::Relay(RelayEvent::MessageUpdated(patch)) => {
                self.handle_message_updated(patch)
            }
            TransportEvent::Relay(RelayEvent::Ready { .. } | RelayEvent::UserJoined { .. }) => {}
        }
        None
    }

    /// Replace the matching optimistic placeholder, then append unless the
    /// id is already present.
    pub fn handle_new_message(&mut self, msg: Message) {
        if self.session_id != Some(msg.session_id) {
            return;
        }

        if let Some(pos) = self.messages.iter().position(|m| m.is_placeholder_for(&msg)) {
            let placeholder = self.messages.remove(pos);
            debug!("{} superseded by {}", placeholder.id, msg.id);
        }

        if self.position_of(msg.id).is_some() {
            debug!("Discarding duplicate message {}", msg.id);
            return;
        }
        self.messages.push(msg.into());
    }

    /// Updates for messages not in the list are dropped; the next history
    /// fetch carries their final state. Fields absent from the patch are
    /// left as they are.
    pub fn handle_message_updated(&mut self, patch: MessagePatch) {
        match self.position_of(patch.id) {
            Some(pos) => {
                if let Some(text) = patch.translated_content {
                    self.messages[pos].translated_content = Some(text);
                }
            }
            None => debug!("Discarding update for unknown message {}", patch.id),
        }
    }

    /// Show `content` at once under a temporary id, then post it.
    ///
    /// On success the placeholder stays until the relay's `new_message`
    /// replaces it. On failure it is removed and the error returned so the
    /// caller can restore the input.
    pub async fn send(
        &mut self,
        content: String,
        sender_language: Option<String>,
    ) -> Result<Message, ClientError> {
        let session_id = self.session_id.ok_or(ClientError::SessionClosed)?;

        self.next_temp += 1;
        let temp_id = MessageId::Optimistic(self.next_temp);
        self.messages.push(LocalMessage::optimistic(
            self.next_temp,
            session_id,
            self.user_id,
            content.clone(),
        ));

        let req = SendMessageRequest { content, sender_language };
        match self.api.send_message(session_id, &req).await {
            Ok(persisted) => Ok(persisted),
            Err(e) => {
                warn!("Send failed in session {}, rolling back {}: {}", session_id, temp_id, e);
                self.messages.retain(|m| m.id != temp_id);
                Err(e)
            }
        }
    }

    /// Re-fetch the full history and merge it in without dropping anything.
    ///
    /// A pending resync stays pending until one succeeds.
    pub async fn resync(&mut self) -> Result<(), ClientError> {
        let session_id = self.session_id.ok_or(ClientError::SessionClosed)?;
        let history = fetch_full_history(&self.api, session_id, self.page_size).await?;
        self.needs_resync = false;
        let before = self.messages.len();
        self.merge_history(history);
        info!(
            "Resynced session {} ({} -> {} messages)",
            session_id,
            before,
            self.messages.len()
        );
        Ok(())
    }

    fn merge_history(&mut self, history: Vec<Message>) {
        for msg in history {
            if let Some(pos) = self.position_of(msg.id) {
                if msg.translated_content.is_some() {
                    self.messages[pos].translated_content = msg.translated_content;
                }
                continue;
            }

            if let Some(pos) = self.messages.iter().position(|m| m.is_placeholder_for(&msg)) {
                self.messages.remove(pos);
            }

            let at = self
                .messages
                .iter()
                .position(|m| m.is_optimistic() || m.created_at > msg.created_at)
                .unwrap_or(self.messages.len());
            self.messages.insert(at, msg.into());
        }
    }

    /// Wait for the next transport event and apply it, including any resync
    /// still owed. Returns false once there is nothing left to listen to.
    ///
    /// A failed resync is returned as an error and tried again on the next
    /// call while connected.
    pub async fn pump(&mut self) -> Result<bool, ClientError> {
        let Some(listener) = self.listener.as_mut() else {
            return Ok(false);
        };
        let received = listener.recv().await;

        match received {
            Ok(event) => {
                self.handle_transport_event(event);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Listener lagged by {} events, resyncing", skipped);
                self.recover_from_lag();
            }
            Err(RecvError::Closed) => {
                self.listener = None;
                return Ok(false);
            }
        }

        if self.needs_resync && self.connected {
            self.resync().await?;
        }
        Ok(true)
    }

    /// Skipped events may have included a disconnect and reconnect, so the
    /// connection state is re-read from the transport and the room re-joined.
    fn recover_from_lag(&mut self) {
        if self.session_id.is_none() {
            return;
        }
        self.needs_resync = true;
        self.connected = self.transport.is_connected();
        if self.connected {
            self.went_live = true;
            self.join_room();
        } else {
            self.room_joined = false;
        }
    }

    fn position_of(&self, id: Uuid) -> Option<usize> {
        let id = MessageId::Server(id);
        self.messages.iter().position(|m| m.id == id)
    }

    pub fn messages(&self) -> &[LocalMessage] {
        &self.messages
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn state(&self) -> ViewState {
        match self.session_id {
            None => ViewState::Closed,
            Some(_) if self.fetching => ViewState::Fetching,
            Some(_) if !self.went_live => ViewState::Idle,
            Some(_) => ViewState::Live { connected: self.connected },
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn room_joined(&self) -> bool {
        self.room_joined
    }

    /// Drives the non-blocking "reconnecting" indicator.
    pub fn is_reconnecting(&self) -> bool {
        self.session_id.is_some() && !self.connected
    }
}

impl<T: Transport> SessionEngine<T, HttpChatApi> {
    pub fn from_config(transport: T, config: &ClientConfig, user_id: Uuid) -> Self {
        Self::new(transport, config.http_api(), user_id, config.page_size)
    }
}
