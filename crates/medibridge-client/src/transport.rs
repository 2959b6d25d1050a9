use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use medibridge_types::events::{RelayCommand, RelayEvent};

use crate::backoff::reconnect_delay;

/// Capacity of the fan-out channel; slower listeners see `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Relay(RelayEvent),
}

/// A relay connection shared by every open session view.
///
/// Listeners are the `broadcast::Receiver`s handed out by [`subscribe`];
/// dropping one is how a view stops listening.
///
/// [`subscribe`]: Transport::subscribe
pub trait Transport {
    fn is_connected(&self) -> bool;

    /// Queue a command for the relay. Returns false, and drops the command,
    /// while disconnected.
    fn emit(&self, cmd: RelayCommand) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn emit(&self, cmd: RelayCommand) -> bool {
        (**self).emit(cmd)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        (**self).subscribe()
    }
}

/// Websocket transport that reconnects forever with backoff.
pub struct WsTransport {
    connected: Arc<AtomicBool>,
    cmd_tx: mpsc::UnboundedSender<RelayCommand>,
    events: broadcast::Sender<TransportEvent>,
    task: JoinHandle<()>,
}

impl WsTransport {
    pub fn connect(url: String) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let task = tokio::spawn(run(url, connected.clone(), cmd_rx, events.clone()));

        Self { connected, cmd_tx, events, task }
    }
}

impl Transport for WsTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn emit(&self, cmd: RelayCommand) -> bool {
        if !self.is_connected() {
            debug!("Dropping {:?} while disconnected", cmd);
            return false;
        }
        self.cmd_tx.send(cmd).is_ok()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    url: String,
    connected: Arc<AtomicBool>,
    mut cmd_rx: mpsc::UnboundedReceiver<RelayCommand>,
    events: broadcast::Sender<TransportEvent>,
) {
    let mut attempt: u32 = 0;

    loop {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                attempt = 0;
                // Commands queued by a previous connection are stale.
                while cmd_rx.try_recv().is_ok() {}

                info!("Relay connection established");
                connected.store(true, Ordering::Release);
                let _ = events.send(TransportEvent::Connected);

                let keep_going = pump(ws, &mut cmd_rx, &events).await;

                connected.store(false, Ordering::Release);
                let _ = events.send(TransportEvent::Disconnected);
                if !keep_going {
                    debug!("Transport handle dropped, stopping");
                    return;
                }
                warn!("Relay connection lost");
            }
            Err(e) => {
                warn!("Relay connect failed: {}", e);
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = reconnect_delay(attempt);
        debug!("Reconnecting in {:?} (attempt {})", delay, attempt);
        tokio::time::sleep(delay).await;
    }
}

/// Moves frames both ways until the socket closes. Returns false once the
/// command side is gone, meaning nobody owns the transport anymore.
async fn pump<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    cmd_rx: &mut mpsc::UnboundedReceiver<RelayCommand>,
    events: &broadcast::Sender<TransportEvent>,
) -> bool
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    let _ = ws_tx.close().await;
                    return false;
                };
                let text = match serde_json::to_string(&cmd) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Failed to encode {:?}: {}", cmd, e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                    warn!("Relay send failed: {}", e);
                    return true;
                }
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<RelayEvent>(&text) {
                            Ok(event) => {
                                let _ = events.send(TransportEvent::Relay(event));
                            }
                            Err(e) => warn!("Ignoring malformed relay event: {}", e),
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!("Relay closed the connection: {:?}", frame);
                        return true;
                    }
                    // tungstenite answers pings on its own
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Relay websocket error: {}", e);
                        return true;
                    }
                    None => return true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use uuid::Uuid;

    async fn next_lifecycle(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("transport channel closed")
    }

    async fn next_command<S>(ws: &mut tokio_tungstenite::WebSocketStream<S>) -> RelayCommand
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for command")
            .expect("socket closed")
            .expect("socket error");
        serde_json::from_str(frame.to_text().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_commands_are_dropped_while_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = WsTransport::connect(format!("ws://{}/gateway?token=t", addr));
        let mut events = transport.subscribe();

        // The handshake cannot finish until the server accepts.
        let stale = RelayCommand::JoinRoom { session_id: Uuid::new_v4() };
        assert!(!transport.is_connected());
        assert!(!transport.emit(stale));

        let (stream, _) = listener.accept().await.unwrap();
        let mut server = tokio_tungstenite::accept_async(stream).await.unwrap();
        assert_eq!(next_lifecycle(&mut events).await, TransportEvent::Connected);
        assert!(transport.is_connected());

        let fresh = RelayCommand::JoinRoom { session_id: Uuid::new_v4() };
        assert!(transport.emit(fresh.clone()));
        assert_eq!(next_command(&mut server).await, fresh);
    }

    #[tokio::test]
    async fn test_reconnects_and_relays_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = WsTransport::connect(format!("ws://{}/gateway?token=t", addr));
        let mut events = transport.subscribe();

        let (stream, _) = listener.accept().await.unwrap();
        let mut server = tokio_tungstenite::accept_async(stream).await.unwrap();
        assert_eq!(next_lifecycle(&mut events).await, TransportEvent::Connected);

        let ready = RelayEvent::Ready { user_id: Uuid::new_v4() };
        server
            .send(WsMessage::Text(serde_json::to_string(&ready).unwrap().into()))
            .await
            .unwrap();
        assert_eq!(next_lifecycle(&mut events).await, TransportEvent::Relay(ready));

        server.close(None).await.unwrap();
        drop(server);
        assert_eq!(next_lifecycle(&mut events).await, TransportEvent::Disconnected);
        assert!(!transport.is_connected());
        assert!(!transport.emit(RelayCommand::LeaveRoom { session_id: Uuid::new_v4() }));

        // The second connection only sees what was emitted after it came up.
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = tokio_tungstenite::accept_async(stream).await.unwrap();
        assert_eq!(next_lifecycle(&mut events).await, TransportEvent::Connected);

        let rejoin = RelayCommand::JoinRoom { session_id: Uuid::new_v4() };
        assert!(transport.emit(rejoin.clone()));
        assert_eq!(next_command(&mut server).await, rejoin);
    }
}
