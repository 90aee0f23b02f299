//! Correlation registry
//!
//! Reunites asynchronous responses with the call that is waiting for them.
//! One registry is owned by each connection; there is no process-wide state.
//!
//! A pending record exists from registration until a terminal response
//! arrives, the timeout fires, the caller cancels or drops its
//! [`PendingResponse`], or [`CorrelationRegistry::reject_all`] drains it.
//! Every one of those paths removes the record.

use crate::error::{HubError, HubResult};
use crate::protocol::ResponseMessage;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default time to wait for a terminal response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Observer for `pending`/`running` responses of one call
pub type ProgressHandler = Arc<dyn Fn(ResponseMessage) + Send + Sync>;

/// Receives responses that match no pending call
pub type UnsolicitedHandler = Arc<dyn Fn(ResponseMessage) + Send + Sync>;

struct PendingCall {
    tx: oneshot::Sender<HubResult<ResponseMessage>>,
    progress: Option<ProgressHandler>,
    created_at: Instant,
}

pub struct CorrelationRegistry {
    pending: Mutex<HashMap<String, PendingCall>>,
    default_timeout: Duration,
    unsolicited: RwLock<Option<UnsolicitedHandler>>,
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl CorrelationRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            default_timeout,
            unsolicited: RwLock::new(None),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Install the handler for late, duplicate or unknown responses
    pub fn set_unsolicited_handler(&self, handler: Option<UnsolicitedHandler>) {
        *self.unsolicited.write() = handler;
    }

    /// Create a pending record and return the handle to await it.
    ///
    /// Fails when the correlation ID is empty or already pending.
    pub fn register(
        self: &Arc<Self>,
        correlation_id: &str,
        timeout: Option<Duration>,
        progress: Option<ProgressHandler>,
    ) -> HubResult<PendingResponse> {
        if correlation_id.is_empty() {
            return Err(HubError::protocol("cannot register an empty correlation ID"));
        }
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(correlation_id) {
                return Err(HubError::protocol(format!(
                    "correlation ID {correlation_id} is already pending"
                )));
            }
            pending.insert(
                correlation_id.to_string(),
                PendingCall {
                    tx,
                    progress,
                    created_at: Instant::now(),
                },
            );
        }

        Ok(PendingResponse {
            registry: Arc::downgrade(self),
            correlation_id: correlation_id.to_string(),
            rx,
            deadline: Instant::now() + timeout,
            timeout,
            cancel: None,
        })
    }

    /// Deliver a response to its pending call.
    ///
    /// Terminal responses complete and remove the record. Progress responses
    /// go to the call's progress observer and keep the record. A response
    /// with no pending call goes to the unsolicited handler.
    /// Returns true if a pending call matched.
    pub fn resolve(&self, response: ResponseMessage) -> bool {
        let correlation_id = response.correlation_id.clone();

        if response.is_terminal() {
            let call = self.pending.lock().remove(&correlation_id);
            match call {
                Some(call) => {
                    debug!(
                        correlation_id = %correlation_id,
                        status = ?response.status,
                        elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                        "Resolved pending call"
                    );
                    if call.tx.send(Ok(response)).is_err() {
                        debug!(correlation_id = %correlation_id, "Caller stopped waiting");
                    }
                    true
                }
                None => {
                    self.unsolicited(response);
                    false
                }
            }
        } else {
            let progress = self
                .pending
                .lock()
                .get(&correlation_id)
                .map(|call| call.progress.clone());
            match progress {
                Some(Some(observer)) => {
                    observer(response);
                    true
                }
                Some(None) => {
                    debug!(
                        correlation_id = %correlation_id,
                        status = ?response.status,
                        "Progress response without observer"
                    );
                    true
                }
                None => {
                    self.unsolicited(response);
                    false
                }
            }
        }
    }

    fn unsolicited(&self, response: ResponseMessage) {
        let handler = self.unsolicited.read().clone();
        match handler {
            Some(handler) => handler(response),
            None => warn!(
                correlation_id = %response.correlation_id,
                operation = %response.operation,
                thing_id = %response.thing_id,
                "Response for unknown correlation ID"
            ),
        }
    }

    /// Reject every pending call with a connection-closed error.
    ///
    /// Returns the number of calls rejected.
    pub fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingCall)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (correlation_id, call) in drained {
            debug!(correlation_id = %correlation_id, reason, "Rejecting pending call");
            let _ = call.tx.send(Err(HubError::connection_closed(reason)));
        }
        count
    }

    /// Remove a record without completing it
    pub fn remove(&self, correlation_id: &str) -> bool {
        self.pending.lock().remove(correlation_id).is_some()
    }

    pub fn has(&self, correlation_id: &str) -> bool {
        self.pending.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Handle for one pending call
///
/// Dropping the handle removes the record, so an abandoned caller never
/// leaks a registry entry.
pub struct PendingResponse {
    registry: Weak<CorrelationRegistry>,
    correlation_id: String,
    rx: oneshot::Receiver<HubResult<ResponseMessage>>,
    deadline: Instant,
    timeout: Duration,
    cancel: Option<CancellationToken>,
}

impl PendingResponse {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Reject with [`HubError::Cancelled`] when the token is cancelled
    pub fn with_cancel(mut self, cancel: Option<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wait for the terminal response, the timeout, or cancellation
    pub async fn wait(mut self) -> HubResult<ResponseMessage> {
        let deadline = self.deadline;
        let cancel = self.cancel.clone();
        let rx = &mut self.rx;

        tokio::select! {
            result = rx => match result {
                Ok(result) => result,
                Err(_) => Err(HubError::connection_closed("pending call dropped")),
            },
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    correlation_id = %self.correlation_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Request timed out"
                );
                Err(HubError::timeout(
                    self.correlation_id.clone(),
                    self.timeout.as_millis() as u64,
                ))
            }
            _ = cancelled(cancel) => Err(HubError::Cancelled),
        }
    }
}

async fn cancelled(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.correlation_id);
        }
    }
}
