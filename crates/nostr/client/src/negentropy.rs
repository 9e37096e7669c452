//! NIP-77 sync of a cached result set against one relay.
//!
//! The flow only learns which ids the relay has that we lack. Fetching them
//! is a normal REQ built from [`SyncOutcome::filters`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nostr::{EventId, Filter, Negentropy, NegentropyStorageVector, TaggedEvent};
use serde_json::{Value, json};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::relay::{ConnectionEvent, RelayConnection};

/// Result of a sync session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Hex ids the relay holds and we do not.
    pub need: Vec<String>,
    /// Set when the session ended abnormally. `need` may be partial.
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// `[{ids: need}]`, or nothing when nothing is missing.
    pub fn filters(&self) -> Vec<Filter> {
        if self.need.is_empty() {
            return Vec::new();
        }
        vec![Filter::new().ids(self.need.iter().cloned())]
    }

    fn failed(need: Vec<String>, error: impl Into<String>) -> Self {
        Self {
            need,
            error: Some(error.into()),
        }
    }
}

/// One negentropy session on one connection.
pub struct NegentropyFlow {
    id: String,
    connection: Arc<RelayConnection>,
    filters: Vec<Filter>,
    negentropy: Negentropy,
    need: Vec<String>,
    seen: HashSet<String>,
    listener: Option<broadcast::Receiver<ConnectionEvent>>,
}

impl NegentropyFlow {
    /// Seal the local set. Events with malformed ids are left out.
    pub fn new(
        id: impl Into<String>,
        connection: Arc<RelayConnection>,
        events: &[TaggedEvent],
        filters: Vec<Filter>,
    ) -> Result<Self> {
        let mut storage = NegentropyStorageVector::with_capacity(events.len());
        let mut unique = HashSet::with_capacity(events.len());
        for tagged in events {
            if !unique.insert(tagged.id()) {
                continue;
            }
            match decode_id(tagged.id()) {
                Some(id) => storage.insert(tagged.event.created_at, id)?,
                None => debug!(event = %tagged.id(), "skipping event with malformed id"),
            }
        }
        storage.seal()?;

        let frame_limit = connection.config().negentropy_frame_size_limit;
        let negentropy = Negentropy::new(storage, (frame_limit > 0).then_some(frame_limit))?;
        let listener = Some(connection.subscribe());
        Ok(Self {
            id: id.into(),
            connection,
            filters: filters.iter().map(Filter::without_internal).collect(),
            negentropy,
            need: Vec::new(),
            seen: HashSet::new(),
            listener,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send `NEG-OPEN` with the initial message.
    pub async fn start(&mut self) -> Result<()> {
        let initial = self.negentropy.initiate()?;
        let filter = match self.filters.as_slice() {
            [single] => serde_json::to_value(single)?,
            many => serde_json::to_value(many)?,
        };
        self.connection
            .send_raw(&json!(["NEG-OPEN", self.id, filter, hex::encode(initial)]))
            .await?;
        debug!(relay = %self.connection.address(), session = %self.id, "sent NEG-OPEN");
        Ok(())
    }

    /// Drive the session until it finishes or fails. Consumes the listener.
    pub async fn run(&mut self) -> SyncOutcome {
        let Some(mut listener) = self.listener.take() else {
            return SyncOutcome::failed(self.need.clone(), "session already ran");
        };

        loop {
            let message = match listener.recv().await {
                Ok(message) => message,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(relay = %self.connection.address(), skipped, "negentropy listener lagged");
                    continue;
                }
                Err(RecvError::Closed) => {
                    return SyncOutcome::failed(self.need.clone(), "connection gone");
                }
            };

            match message {
                ConnectionEvent::UnknownMessage(raw) => {
                    if raw.get(1).and_then(Value::as_str) != Some(self.id.as_str()) {
                        continue;
                    }
                    match raw.first().and_then(Value::as_str) {
                        Some("NEG-MSG") => {
                            if let Some(outcome) = self.on_message(&raw).await {
                                return outcome;
                            }
                        }
                        Some("NEG-ERR" | "NEG-ERROR") => {
                            let reason = raw.get(2).and_then(Value::as_str).unwrap_or("unknown");
                            warn!(relay = %self.connection.address(), session = %self.id, reason, "negentropy error");
                            return SyncOutcome::failed(self.need.clone(), reason);
                        }
                        _ => {}
                    }
                }
                ConnectionEvent::Notice(notice)
                    if notice.contains("negentropy disabled")
                        || notice.contains("negentropy error") =>
                {
                    return SyncOutcome::failed(self.need.clone(), notice);
                }
                ConnectionEvent::Disconnected { .. } => {
                    return SyncOutcome::failed(self.need.clone(), "disconnected");
                }
                _ => {}
            }
        }
    }

    /// [`start`](Self::start) then [`run`](Self::run), bounded by `limit`.
    pub async fn sync(mut self, limit: Option<Duration>) -> SyncOutcome {
        if let Err(error) = self.start().await {
            return SyncOutcome::failed(Vec::new(), error.to_string());
        }

        let outcome = match limit {
            Some(limit) => match timeout(limit, self.run()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.send_close().await;
                    SyncOutcome::failed(self.need.clone(), "timeout")
                }
            },
            None => self.run().await,
        };
        info!(
            relay = %self.connection.address(),
            session = %self.id,
            need = outcome.need.len(),
            error = outcome.error.as_deref().unwrap_or(""),
            "negentropy sync finished"
        );
        outcome
    }

    /// Returns the final outcome once the session is over.
    async fn on_message(&mut self, raw: &[Value]) -> Option<SyncOutcome> {
        let step = raw
            .get(2)
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Protocol("invalid NEG-MSG payload".to_string()))
            .and_then(|payload| self.reconcile(payload));

        match step {
            Ok(Some(reply)) => {
                let frame = json!(["NEG-MSG", self.id, hex::encode(reply)]);
                match self.connection.send_raw(&frame).await {
                    Ok(()) => None,
                    Err(error) => Some(SyncOutcome::failed(self.need.clone(), error.to_string())),
                }
            }
            Ok(None) => {
                self.send_close().await;
                Some(SyncOutcome {
                    need: self.need.clone(),
                    error: None,
                })
            }
            Err(error) => {
                self.send_close().await;
                Some(SyncOutcome::failed(self.need.clone(), error.to_string()))
            }
        }
    }

    fn reconcile(&mut self, payload: &str) -> Result<Option<Vec<u8>>> {
        let bytes = hex::decode(payload)
            .map_err(|error| ClientError::Protocol(format!("invalid NEG-MSG hex: {error}")))?;
        let step = self.negentropy.reconcile(&bytes)?;
        for id in step.need {
            let id = hex::encode(id);
            if self.seen.insert(id.clone()) {
                self.need.push(id);
            }
        }
        Ok(step.output)
    }

    async fn send_close(&self) {
        if let Err(error) = self
            .connection
            .send_raw(&json!(["NEG-CLOSE", self.id]))
            .await
        {
            debug!(relay = %self.connection.address(), %error, "NEG-CLOSE failed");
        }
    }
}

fn decode_id(id: &str) -> Option<EventId> {
    hex::decode(id).ok()?.try_into().ok()
}
