use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;

use crate::http::{HttpError, JsonClient};

/// Outcome of an accepted increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    /// Value read before the first proposal
    pub observed: i64,
    /// Value the store accepted
    pub committed: i64,
    pub attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum IncrementError<E> {
    #[error("Failed to read counter: {0}")]
    Read(E),
    #[error("No proposal accepted after {attempts} attempts (observed {observed})")]
    Exhausted { observed: i64, attempts: u32 },
}

/// Optimistic increment against a store that refuses any value not strictly
/// greater than the one it holds.
///
/// Reads once, then proposes `observed + 1`, `observed + 2`, ... up to
/// `observed + max_retries`, stopping at the first proposal `write` reports
/// as accepted. The counter is not re-read between attempts, so a burst of
/// concurrent writers larger than `max_retries` exhausts the loop even though
/// a fresh read would have succeeded. This is a bounded best-effort counter,
/// not a linearizable one.
pub async fn optimistic_increment<E, R, RFut, W, WFut>(
    read: R,
    mut write: W,
    max_retries: u32,
) -> Result<Reconciled, IncrementError<E>>
where
    R: FnOnce() -> RFut,
    RFut: Future<Output = Result<i64, E>>,
    W: FnMut(i64) -> WFut,
    WFut: Future<Output = bool>,
{
    let observed = read().await.map_err(IncrementError::Read)?;

    for attempt in 1..=max_retries {
        let proposed = observed.saturating_add(i64::from(attempt));
        if write(proposed).await {
            return Ok(Reconciled {
                observed,
                committed: proposed,
                attempts: attempt,
            });
        }
        debug!("Counter proposal {} refused (attempt {})", proposed, attempt);
    }

    Err(IncrementError::Exhausted {
        observed,
        attempts: max_retries,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("Failed to unmarshal count: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CounterDoc {
    #[serde(default)]
    count: i64,
}

/// Delivery counter kept in the remote datastore as `{"count": n}`
#[derive(Clone)]
pub struct DatastoreCounter {
    client: JsonClient,
    url: String,
    max_retries: u32,
}

impl DatastoreCounter {
    pub fn new(client: JsonClient, url: impl Into<String>, max_retries: u32) -> Self {
        Self {
            client,
            url: url.into(),
            max_retries,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current value; a store that holds nothing yet (`null`) counts as zero
    pub async fn read(&self) -> Result<i64, CounterError> {
        let body = self.client.get(&self.url).await?;
        let doc: Option<CounterDoc> = serde_json::from_str(&body)?;
        Ok(doc.unwrap_or_default().count)
    }

    /// True when the store echoed a `count` back, i.e. took the value
    pub async fn propose(&self, value: i64) -> bool {
        let payload = match serde_json::to_vec(&CounterDoc { count: value }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode counter proposal {}: {}", value, e);
                return false;
            }
        };

        match self.client.patch(&self.url, &payload).await {
            Ok(body) => serde_json::from_str::<Value>(&body)
                .map(|v| v.get("count").is_some())
                .unwrap_or(false),
            Err(e) => {
                warn!("Counter update {} failed: {}", value, e);
                false
            }
        }
    }

    pub async fn increment(&self) -> Result<Reconciled, IncrementError<CounterError>> {
        optimistic_increment(|| self.read(), |value| self.propose(value), self.max_retries).await
    }
}
