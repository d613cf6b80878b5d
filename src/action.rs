use log::{debug, error, warn};

use crate::config::Config;
use crate::counter::{CounterError, DatastoreCounter, IncrementError, Reconciled};
use crate::http::JsonClient;
use crate::message::Message;

/// A webhook call built from a parsed message.
///
/// Mail to `foo+add@example.com` is posted to `http://example.com/foo/add`.
#[derive(Debug, Clone)]
pub struct Action {
    url: String,
    body: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Message has no route")]
    Unrouted,
    #[error("Failed to encode message for send: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to get count of mails sent: {0}")]
    CounterRead(CounterError),
    #[error("Count of mails sent not updated after {attempts} attempts (observed {observed})")]
    CounterReconcileExhausted { observed: i64, attempts: u32 },
}

impl DispatchError {
    /// The webhook was called but the delivery counter could not be advanced
    pub fn is_delivered_uncounted(&self) -> bool {
        matches!(
            self,
            DispatchError::CounterRead(_) | DispatchError::CounterReconcileExhausted { .. }
        )
    }
}

impl From<IncrementError<CounterError>> for DispatchError {
    fn from(e: IncrementError<CounterError>) -> Self {
        match e {
            IncrementError::Read(e) => DispatchError::CounterRead(e),
            IncrementError::Exhausted { observed, attempts } => {
                DispatchError::CounterReconcileExhausted { observed, attempts }
            }
        }
    }
}

impl Action {
    pub fn new(message: &Message, scheme: &str) -> Result<Self, DispatchError> {
        let route = message.route().ok_or(DispatchError::Unrouted)?;
        let url = format!("{}://{}{}", scheme, route.domain, route.path);
        let body = serde_json::to_vec(message)?;
        Ok(Self { url, body })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// What happened to a dispatched message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub url: String,
    pub delivered: bool,
    pub mirrored: bool,
    pub counter: Reconciled,
}

/// Posts messages to their webhook and the mirror store, then counts them
pub struct Dispatcher {
    client: JsonClient,
    scheme: &'static str,
    mirror_url: String,
    counter: DatastoreCounter,
}

impl Dispatcher {
    pub fn new(config: &Config, client: JsonClient) -> Self {
        let counter = DatastoreCounter::new(
            client.clone(),
            config.datastore.count_url.clone(),
            config.datastore.max_retries,
        );

        Self {
            client,
            scheme: config.scheme(),
            mirror_url: config.datastore.url.clone(),
            counter,
        }
    }

    pub fn action_for(&self, message: &Message) -> Result<Action, DispatchError> {
        Action::new(message, self.scheme)
    }

    pub async fn dispatch(&self, message: &Message) -> Result<Delivery, DispatchError> {
        let action = self.action_for(message)?;
        self.execute(&action).await
    }

    /// Webhook and mirror posts are best effort; only the counter can fail
    /// the dispatch, and by then the webhook has been called.
    pub async fn execute(&self, action: &Action) -> Result<Delivery, DispatchError> {
        let delivered = match self.client.post(action.url(), action.body()).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to post message to {}: {}", action.url(), e);
                false
            }
        };

        let mirrored = if self.mirror_url.is_empty() {
            debug!("No datastore URL configured, not mirroring");
            false
        } else {
            match self.client.post(&self.mirror_url, action.body()).await {
                Ok(_) => true,
                Err(e) => {
                    warn!("Failed to push message to datastore: {}", e);
                    false
                }
            }
        };

        let counter = self.counter.increment().await.map_err(|e| {
            let e = DispatchError::from(e);
            error!("Message for {} delivered but not counted: {}", action.url(), e);
            e
        })?;

        Ok(Delivery {
            url: action.url().to_string(),
            delivered,
            mirrored,
            counter,
        })
    }
}
