use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::action::Delivery;
use crate::envelope::{CloseError, Envelope, EnvelopeState, RecipientRejectedError};

const EVENT_QUEUE_DEPTH: usize = 64;

#[derive(Debug)]
pub enum EnvelopeEvent {
    Recipient {
        address: String,
        reply: oneshot::Sender<Result<(), RecipientRejectedError>>,
    },
    DataStart,
    DataChunk(Vec<u8>),
    Close {
        reply: oneshot::Sender<Result<Delivery, CloseError>>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Envelope worker stopped")]
    WorkerStopped,
    #[error(transparent)]
    Rejected(#[from] RecipientRejectedError),
    #[error(transparent)]
    Close(#[from] CloseError),
}

/// Connection-side handle on an envelope owned by its own task.
///
/// Events are applied in the order they are sent. Dropping the handle
/// without `close` stops the worker and discards the buffered message.
pub struct EnvelopeHandle {
    tx: mpsc::Sender<EnvelopeEvent>,
}

impl EnvelopeHandle {
    pub fn spawn(envelope: Box<dyn Envelope>) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        tokio::spawn(run_envelope(envelope, rx));
        Self { tx }
    }

    pub async fn recipient(&self, address: &str) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(EnvelopeEvent::Recipient {
            address: address.to_string(),
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| SessionError::WorkerStopped)??)
    }

    pub async fn data_start(&self) -> Result<(), SessionError> {
        self.send(EnvelopeEvent::DataStart).await
    }

    pub async fn data_chunk(&self, bytes: Vec<u8>) -> Result<(), SessionError> {
        self.send(EnvelopeEvent::DataChunk(bytes)).await
    }

    pub async fn close(self) -> Result<Delivery, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(EnvelopeEvent::Close { reply }).await?;
        Ok(rx.await.map_err(|_| SessionError::WorkerStopped)??)
    }

    async fn send(&self, event: EnvelopeEvent) -> Result<(), SessionError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| SessionError::WorkerStopped)
    }
}

async fn run_envelope(mut envelope: Box<dyn Envelope>, mut rx: mpsc::Receiver<EnvelopeEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            EnvelopeEvent::Recipient { address, reply } => {
                let _ = reply.send(envelope.on_recipient(&address));
            }
            EnvelopeEvent::DataStart => envelope.on_data_start(),
            EnvelopeEvent::DataChunk(bytes) => envelope.on_data_chunk(&bytes),
            EnvelopeEvent::Close { reply } => {
                let outcome = envelope.on_close().await;
                if reply.send(outcome).is_err() {
                    warn!("Session went away before the envelope closed");
                }
                return;
            }
        }
    }

    if envelope.state() != EnvelopeState::Closed {
        debug!("Envelope abandoned in state {:?}", envelope.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::counter::Reconciled;
    use std::sync::{Arc, Mutex};

    /// Records every callback it receives
    struct Recording {
        log: Arc<Mutex<Vec<String>>>,
        state: EnvelopeState,
        raw: Vec<u8>,
    }

    impl Recording {
        fn new(log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                log,
                state: EnvelopeState::New,
                raw: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Envelope for Recording {
        fn state(&self) -> EnvelopeState {
            self.state
        }

        fn on_recipient(&mut self, address: &str) -> Result<(), RecipientRejectedError> {
            self.log.lock().unwrap().push(format!("rcpt {address}"));
            if self.state != EnvelopeState::New {
                return Err(RecipientRejectedError::AlreadyAccepted);
            }
            if address.ends_with("@blocked.test") {
                return Err(RecipientRejectedError::Domain("blocked.test".to_string()));
            }
            self.state = EnvelopeState::RecipientAccepted;
            Ok(())
        }

        fn on_data_start(&mut self) {
            self.log.lock().unwrap().push("data".to_string());
            self.state = EnvelopeState::DataStarted;
        }

        fn on_data_chunk(&mut self, bytes: &[u8]) {
            self.raw.extend_from_slice(bytes);
        }

        async fn on_close(&mut self) -> Result<Delivery, CloseError> {
            let raw = String::from_utf8_lossy(&self.raw).to_string();
            self.log.lock().unwrap().push(format!("close {raw}"));
            self.state = EnvelopeState::Closed;
            Ok(Delivery {
                url: raw,
                delivered: true,
                mirrored: false,
                counter: Reconciled {
                    observed: 0,
                    committed: 1,
                    attempts: 1,
                },
            })
        }
    }

    #[tokio::test]
    async fn test_events_applied_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = EnvelopeHandle::spawn(Box::new(Recording::new(log.clone())));

        handle.recipient("foo@example.com").await.unwrap();
        handle.data_start().await.unwrap();
        handle.data_chunk(b"line one\r\n".to_vec()).await.unwrap();
        handle.data_chunk(b"line two\r\n".to_vec()).await.unwrap();
        let delivery = handle.close().await.unwrap();

        assert_eq!(delivery.url, "line one\r\nline two\r\n");
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "rcpt foo@example.com".to_string(),
                "data".to_string(),
                "close line one\r\nline two\r\n".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_rejection_reaches_caller() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = EnvelopeHandle::spawn(Box::new(Recording::new(log.clone())));

        let err = handle.recipient("x@blocked.test").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Rejected(RecipientRejectedError::Domain(_))
        ));
        handle.recipient("x@example.com").await.unwrap();
        let err = handle.recipient("y@example.com").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Rejected(RecipientRejectedError::AlreadyAccepted)
        ));
    }

    #[tokio::test]
    async fn test_dropped_handle_never_closes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = EnvelopeHandle::spawn(Box::new(Recording::new(log.clone())));
        handle.recipient("foo@example.com").await.unwrap();
        handle.data_start().await.unwrap();
        handle.data_chunk(b"partial".to_vec()).await.unwrap();
        drop(handle);

        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(log.lock().unwrap().iter().all(|entry| !entry.starts_with("close")));
    }
}
