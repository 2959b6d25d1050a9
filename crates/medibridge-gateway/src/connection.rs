use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use medibridge_db::Database;
use medibridge_types::events::{RelayCommand, RelayEvent};

use crate::dispatcher::{ConnId, Dispatcher};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a websocket whose JWT was already validated at the HTTP upgrade.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    user_id: Uuid,
) {
    let (mut sender, receiver) = socket.split();

    info!("{} connected to gateway", user_id);

    let ready = RelayEvent::Ready { user_id };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    let (conn_id, events_rx) = dispatcher.register_connection(user_id);

    run_connection_loop(sender, receiver, events_rx, dispatcher.clone(), db, user_id, conn_id).await;

    dispatcher.unregister_connection(conn_id);
    info!("{} disconnected from gateway (conn {})", user_id, conn_id);
}

async fn run_connection_loop(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    mut events_rx: mpsc::UnboundedReceiver<RelayEvent>,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    user_id: Uuid,
    conn_id: ConnId,
) {
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward room events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<RelayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&dispatcher, &db, user_id, conn_id, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} (conn {}) bad command: {} -- raw: {}",
                            user_id,
                            conn_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &RelayEvent,
) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("failed to encode relay event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    user_id: Uuid,
    conn_id: ConnId,
    cmd: RelayCommand,
) {
    match cmd {
        RelayCommand::JoinRoom { session_id } => {
            if !may_join(db, session_id, user_id).await {
                warn!("join_room BLOCKED: {} is not a participant of session {}", user_id, session_id);
                return;
            }

            let added = dispatcher.join(session_id, conn_id);
            info!(
                "{} joined room {} ({} members)",
                user_id,
                session_id,
                dispatcher.room_size(session_id)
            );

            if added {
                dispatcher.broadcast_to_room_except(
                    session_id,
                    RelayEvent::UserJoined { session_id, user_id },
                    conn_id,
                );
            }
        }

        RelayCommand::LeaveRoom { session_id } => {
            if dispatcher.leave(session_id, conn_id) {
                info!("{} left room {}", user_id, session_id);
            } else {
                debug!("{} leave_room for {} ignored, not a member", user_id, session_id);
            }
        }
    }
}

/// A connection may join a session room unless the session exists and the
/// user is not one of its participants. Unknown sessions get a room lazily.
async fn may_join(db: &Arc<Database>, session_id: Uuid, user_id: Uuid) -> bool {
    let db = db.clone();
    let lookup = tokio::task::spawn_blocking(move || db.get_session(session_id)).await;

    match lookup {
        Ok(Ok(Some(session))) => session.is_participant(user_id),
        Ok(Ok(None)) => true,
        Ok(Err(e)) => {
            error!("join_room session lookup failed: {}", e);
            false
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{Router, extract::WebSocketUpgrade, routing::get};
    use medibridge_types::models::ConsultationSession;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;

    fn fixture() -> (Dispatcher, Arc<Database>, ConsultationSession) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let session = db.create_session(Uuid::new_v4(), Some("es")).unwrap();
        db.assign_doctor(session.id, Uuid::new_v4(), Some("en")).unwrap();
        let session = db.get_session(session.id).unwrap().unwrap();
        (Dispatcher::new(), db, session)
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_outsider_cannot_join_existing_session() {
        let (dispatcher, db, session) = fixture();
        let stranger = Uuid::new_v4();
        let (conn, _rx) = dispatcher.register_connection(stranger);

        handle_command(&dispatcher, &db, stranger, conn, RelayCommand::JoinRoom { session_id: session.id })
            .await;

        assert_eq!(dispatcher.room_size(session.id), 0);
        assert_eq!(dispatcher.room_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_gets_a_room() {
        let (dispatcher, db, _) = fixture();
        let user = Uuid::new_v4();
        let unknown = Uuid::new_v4();
        let (conn, _rx) = dispatcher.register_connection(user);

        handle_command(&dispatcher, &db, user, conn, RelayCommand::JoinRoom { session_id: unknown }).await;

        assert_eq!(dispatcher.room_size(unknown), 1);
    }

    #[tokio::test]
    async fn test_user_joined_goes_to_the_others_once() {
        let (dispatcher, db, session) = fixture();
        let patient = session.patient_id;
        let doctor = session.doctor_id.unwrap();
        let (patient_conn, mut patient_rx) = dispatcher.register_connection(patient);
        let (doctor_conn, mut doctor_rx) = dispatcher.register_connection(doctor);
        let join = RelayCommand::JoinRoom { session_id: session.id };

        handle_command(&dispatcher, &db, patient, patient_conn, join.clone()).await;
        assert!(patient_rx.try_recv().is_err());

        handle_command(&dispatcher, &db, doctor, doctor_conn, join.clone()).await;
        assert_eq!(
            patient_rx.try_recv().unwrap(),
            RelayEvent::UserJoined { session_id: session.id, user_id: doctor }
        );
        assert!(doctor_rx.try_recv().is_err());

        // Joining again changes nothing and announces nothing.
        handle_command(&dispatcher, &db, doctor, doctor_conn, join).await;
        assert_eq!(dispatcher.room_size(session.id), 2);
        assert!(patient_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leave_room() {
        let (dispatcher, db, session) = fixture();
        let patient = session.patient_id;
        let (conn, _rx) = dispatcher.register_connection(patient);

        handle_command(&dispatcher, &db, patient, conn, RelayCommand::JoinRoom { session_id: session.id })
            .await;
        handle_command(&dispatcher, &db, patient, conn, RelayCommand::LeaveRoom { session_id: session.id })
            .await;
        // A second leave is ignored.
        handle_command(&dispatcher, &db, patient, conn, RelayCommand::LeaveRoom { session_id: session.id })
            .await;

        assert_eq!(dispatcher.room_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_socket_leaves_its_rooms() {
        let (dispatcher, db, session) = fixture();
        let patient = session.patient_id;

        let app = Router::new().route(
            "/gateway",
            get({
                let dispatcher = dispatcher.clone();
                let db = db.clone();
                move |ws: WebSocketUpgrade| async move {
                    ws.on_upgrade(move |socket| handle_connection(socket, dispatcher, db, patient))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/gateway", addr))
            .await
            .unwrap();

        let frame = ws.next().await.unwrap().unwrap();
        let ready: RelayEvent = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(ready, RelayEvent::Ready { user_id: patient });

        // A bad frame is logged and skipped, the connection stays usable.
        ws.send(ClientMessage::Text("not a command".into())).await.unwrap();
        let join = serde_json::to_string(&RelayCommand::JoinRoom { session_id: session.id }).unwrap();
        ws.send(ClientMessage::Text(join.into())).await.unwrap();
        wait_for(|| dispatcher.room_size(session.id) == 1).await;

        ws.close(None).await.unwrap();
        wait_for(|| dispatcher.room_count() == 0).await;
    }
}
