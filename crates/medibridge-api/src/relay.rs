use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use medibridge_db::Database;
use medibridge_gateway::dispatcher::Dispatcher;
use medibridge_types::events::RelayEvent;
use medibridge_types::models::{Message, MessagePatch, Role};

use crate::translator::Translator;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("session not found")]
    SessionNotFound,
    #[error("sender is not a participant of the session")]
    NotParticipant,
    #[error("message content is empty")]
    EmptyContent,
    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Routes messages between the Message Store, the room registry and the
/// translation worker using a two-phase broadcast:
///
/// 1. persist the original and push `new_message` to the room at once;
/// 2. translate in the background, persist, push `message_updated`.
///
/// Phase 1 for a message is always queued to every member before its
/// Phase 2 is started.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    translator: Arc<dyn Translator>,
    /// Serialises persist+broadcast so broadcast order equals insert order.
    send_lock: Mutex<()>,
}

/// What Phase 2 has to do for a freshly persisted message.
struct Persisted {
    message: Message,
    sender_language: String,
    target_language: String,
}

impl Relay {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher, translator: Arc<dyn Translator>) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                db,
                dispatcher,
                translator,
                send_lock: Mutex::new(()),
            }),
        }
    }

    /// Persist and broadcast a text message, then start its translation.
    ///
    /// Returns the persisted message as soon as Phase 1 is done. A storage
    /// failure returns an error and nothing is broadcast.
    pub async fn send(
        &self,
        session_id: Uuid,
        sender_id: Uuid,
        content: String,
        sender_language: Option<String>,
    ) -> Result<Message, RelayError> {
        if content.trim().is_empty() {
            return Err(RelayError::EmptyContent);
        }

        let persisted = {
            let _guard = self.inner.send_lock.lock().await;

            let db = self.inner.db.clone();
            let persisted = tokio::task::spawn_blocking(move || {
                persist(&db, session_id, sender_id, &content, sender_language.as_deref())
            })
            .await
            .map_err(|e| RelayError::Storage(anyhow::anyhow!("spawn_blocking join error: {}", e)))??;

            let delivered = self
                .inner
                .dispatcher
                .broadcast_to_room(session_id, RelayEvent::NewMessage(persisted.message.clone()));
            info!(
                "Phase 1 done for {} in session {} ({} connections)",
                persisted.message.id, session_id, delivered
            );
            persisted
        };

        let message = persisted.message.clone();

        if persisted.sender_language.eq_ignore_ascii_case(&persisted.target_language) {
            debug!(
                "Skipping translation for {}, both sides speak '{}'",
                message.id, persisted.target_language
            );
            // Phase 1 already went out; a Phase 2 failure must not fail the send.
            if let Err(e) = self
                .on_translation_complete(message.id, message.content.clone())
                .await
            {
                error!("Phase 2 failed for {}: {}", message.id, e);
            }
        } else {
            let relay = self.clone();
            tokio::spawn(async move {
                let Persisted { message, target_language, .. } = persisted;
                let translated = relay
                    .inner
                    .translator
                    .translate(&message.content, &target_language)
                    .await;
                if let Err(e) = relay.on_translation_complete(message.id, translated).await {
                    error!("Phase 2 failed for {}: {}", message.id, e);
                }
            });
        }

        Ok(message)
    }

    /// Persist a finished translation and push it to the message's room.
    ///
    /// Returns false if the message does not exist. The update is stored
    /// even if nobody is in the room; nothing is queued for later delivery.
    pub async fn on_translation_complete(
        &self,
        message_id: Uuid,
        translated: String,
    ) -> Result<bool, RelayError> {
        let db = self.inner.db.clone();
        let text = translated.clone();
        let session_id = tokio::task::spawn_blocking(move || db.update_translation(message_id, &text))
            .await
            .map_err(|e| RelayError::Storage(anyhow::anyhow!("spawn_blocking join error: {}", e)))??;

        let Some(session_id) = session_id else {
            warn!("Translation finished for unknown message {}", message_id);
            return Ok(false);
        };

        let delivered = self.inner.dispatcher.broadcast_to_room(
            session_id,
            RelayEvent::MessageUpdated(MessagePatch::translation(message_id, translated)),
        );
        info!(
            "Phase 2 done for {} in session {} ({} connections)",
            message_id, session_id, delivered
        );
        Ok(true)
    }
}

fn persist(
    db: &Database,
    session_id: Uuid,
    sender_id: Uuid,
    content: &str,
    sender_language: Option<&str>,
) -> Result<Persisted, RelayError> {
    let mut session = db.get_session(session_id)?.ok_or(RelayError::SessionNotFound)?;
    let role = session.role_of(sender_id).ok_or(RelayError::NotParticipant)?;

    if let Some(lang) = sender_language.filter(|l| !l.trim().is_empty()) {
        if session.language_of(role) != lang {
            db.set_participant_language(session_id, role, lang)?;
            match role {
                Role::Patient => session.patient_language = Some(lang.to_string()),
                Role::Doctor => session.doctor_language = Some(lang.to_string()),
            }
        }
    }

    let message = db.insert_message(session_id, sender_id, content, None, None)?;

    Ok(Persisted {
        message,
        sender_language: session.language_of(role).to_string(),
        target_language: session.target_language_for(role).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use medibridge_types::models::{ConsultationSession, TRANSLATION_UNAVAILABLE};
    use std::time::Duration;
    use tokio::sync::{Notify, mpsc};

    /// Holds each translation until released, so tests control Phase 2 timing.
    struct GatedTranslator {
        gate: Notify,
        output: String,
    }

    impl Translator for GatedTranslator {
        fn translate<'a>(&'a self, _text: &'a str, _target: &'a str) -> BoxFuture<'a, String> {
            Box::pin(async move {
                self.gate.notified().await;
                self.output.clone()
            })
        }
    }

    struct Fixture {
        db: Arc<Database>,
        dispatcher: Dispatcher,
        relay: Relay,
        translator: Arc<GatedTranslator>,
        session: ConsultationSession,
        doctor: Uuid,
    }

    fn fixture(output: &str) -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let patient = Uuid::new_v4();
        let doctor = Uuid::new_v4();
        let session = db.create_session(patient, Some("es")).unwrap();
        db.assign_doctor(session.id, doctor, Some("en")).unwrap();
        let session = db.get_session(session.id).unwrap().unwrap();

        let dispatcher = Dispatcher::new();
        let translator = Arc::new(GatedTranslator {
            gate: Notify::new(),
            output: output.to_string(),
        });
        let relay = Relay::new(db.clone(), dispatcher.clone(), translator.clone());
        Fixture { db, dispatcher, relay, translator, session, doctor }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<RelayEvent>) -> RelayEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_two_phase_broadcast_order() {
        let f = fixture("Hello");
        let (conn, mut rx) = f.dispatcher.register_connection(f.doctor);
        f.dispatcher.join(f.session.id, conn);

        let sent = f
            .relay
            .send(f.session.id, f.session.patient_id, "Hola".into(), None)
            .await
            .unwrap();
        assert_eq!(sent.translated_content, None);

        match next_event(&mut rx).await {
            RelayEvent::NewMessage(m) => {
                assert_eq!(m.id, sent.id);
                assert_eq!(m.translated_content, None);
            }
            other => panic!("expected new_message, got {:?}", other),
        }

        f.translator.gate.notify_one();
        match next_event(&mut rx).await {
            RelayEvent::MessageUpdated(patch) => {
                assert_eq!(patch.id, sent.id);
                assert_eq!(patch.translated_content.as_deref(), Some("Hello"));
            }
            other => panic!("expected message_updated, got {:?}", other),
        }

        let stored = f.db.get_message(sent.id).unwrap().unwrap();
        assert_eq!(stored.translated_content.as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn test_failed_translation_is_broadcast_as_sentinel() {
        let f = fixture(TRANSLATION_UNAVAILABLE);
        let (conn, mut rx) = f.dispatcher.register_connection(f.doctor);
        f.dispatcher.join(f.session.id, conn);

        let sent = f
            .relay
            .send(f.session.id, f.session.patient_id, "Hola".into(), None)
            .await
            .unwrap();
        let _ = next_event(&mut rx).await;
        f.translator.gate.notify_one();

        match next_event(&mut rx).await {
            RelayEvent::MessageUpdated(patch) => {
                assert_eq!(patch.id, sent.id);
                assert_eq!(patch.translated_content.as_deref(), Some(TRANSLATION_UNAVAILABLE));
            }
            other => panic!("expected message_updated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_translation_persists_when_room_is_empty() {
        let f = fixture("Hello");
        let sent = f
            .relay
            .send(f.session.id, f.session.patient_id, "Hola".into(), None)
            .await
            .unwrap();

        assert!(f.relay.on_translation_complete(sent.id, "Hello".into()).await.unwrap());
        let stored = f.db.get_message(sent.id).unwrap().unwrap();
        assert_eq!(stored.translated_content.as_deref(), Some("Hello"));
        assert_eq!(f.dispatcher.room_count(), 0);
    }

    #[tokio::test]
    async fn test_same_language_skips_translation() {
        let f = fixture("unused");
        let (conn, mut rx) = f.dispatcher.register_connection(f.doctor);
        f.dispatcher.join(f.session.id, conn);

        // The doctor declares Spanish, same as the patient.
        let sent = f
            .relay
            .send(f.session.id, f.doctor, "Hola".into(), Some("es".into()))
            .await
            .unwrap();

        let _ = next_event(&mut rx).await;
        match next_event(&mut rx).await {
            RelayEvent::MessageUpdated(patch) => {
                assert_eq!(patch.translated_content.as_deref(), Some("Hola"));
            }
            other => panic!("expected message_updated, got {:?}", other),
        }
        let session = f.db.get_session(f.session.id).unwrap().unwrap();
        assert_eq!(session.doctor_language.as_deref(), Some("es"));
        assert_eq!(
            f.db.get_message(sent.id).unwrap().unwrap().translated_content.as_deref(),
            Some("Hola")
        );
    }

    #[tokio::test]
    async fn test_phase_two_storage_failure_keeps_send_successful() {
        let f = fixture("unused");
        let (conn, mut rx) = f.dispatcher.register_connection(f.doctor);
        f.dispatcher.join(f.session.id, conn);

        f.db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_translation BEFORE UPDATE OF translated_content ON messages
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )?;
            Ok(())
        })
        .unwrap();

        // Same language on both sides, so Phase 2 runs inside send.
        let sent = f
            .relay
            .send(f.session.id, f.doctor, "Hola".into(), Some("es".into()))
            .await
            .unwrap();

        match next_event(&mut rx).await {
            RelayEvent::NewMessage(m) => assert_eq!(m.id, sent.id),
            other => panic!("expected new_message, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        let stored = f.db.get_message(sent.id).unwrap().unwrap();
        assert_eq!(stored.content, "Hola");
        assert_eq!(stored.translated_content, None);
    }

    #[tokio::test]
    async fn test_rejected_send_broadcasts_nothing() {
        let f = fixture("Hello");
        let (conn, mut rx) = f.dispatcher.register_connection(f.doctor);
        f.dispatcher.join(f.session.id, conn);

        let err = f
            .relay
            .send(f.session.id, Uuid::new_v4(), "Hola".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotParticipant));

        let err = f
            .relay
            .send(Uuid::new_v4(), f.session.patient_id, "Hola".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::SessionNotFound));

        let err = f
            .relay
            .send(f.session.id, f.session.patient_id, "   ".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::EmptyContent));

        assert!(rx.try_recv().is_err());
        assert!(f.db.get_messages_page(f.session.id, 10, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_message_translation_is_ignored() {
        let f = fixture("Hello");
        assert!(!f.relay.on_translation_complete(Uuid::new_v4(), "x".into()).await.unwrap());
    }
}
