//! Supervised hub connection
//!
//! [`HubConnection`] owns the correlation registry, the inbound dispatcher
//! and the active transport adapter. A supervisor task watches the adapter
//! for unexpected closure, drains pending calls, reconnects with backoff
//! using the last known credentials and replays subscriptions.

use crate::config::{ClientConfig, Credentials};
use crate::correlation::{CorrelationRegistry, ProgressHandler};
use crate::error::{HubError, HubResult};
use crate::protocol::{AddressTokens, NotificationMessage, RequestMessage, ResponseMessage};
use crate::transport::{
    Dispatcher, HubTransportFactory, Subscription, SubscriptionMode, Transport, TransportEvent,
    TransportFactory,
};
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

pub mod subscriptions;
pub mod supervisor;

pub use subscriptions::SubscriptionSet;
pub use supervisor::{
    ConnectionEvent, ConnectionStatus, ReconnectPolicy, ReconnectionDecision, Supervisor,
};

/// Receives every connection status change.
///
/// Must not call `connect` itself; the supervisor already retries.
pub type ConnectHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Per-call overrides for a request
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Overrides the configured request timeout
    pub timeout: Option<Duration>,
    /// Rejects the call with [`HubError::Cancelled`] when cancelled
    pub cancel: Option<CancellationToken>,
    /// Observer for `pending`/`running` responses
    pub progress: Option<ProgressHandler>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(ResponseMessage) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }
}

struct Shared {
    client_id: String,
    config: ClientConfig,
    policy: ReconnectPolicy,
    factory: Arc<dyn TransportFactory>,
    registry: Arc<CorrelationRegistry>,
    dispatcher: Dispatcher,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Last known credentials; replaced by the session token once issued
    credentials: Mutex<Option<Credentials>>,
    subscriptions: SubscriptionSet,
    status: watch::Sender<ConnectionStatus>,
    connect_handler: RwLock<Option<ConnectHandler>>,
    /// Cancels the supervisor of the current session
    session: Mutex<Option<CancellationToken>>,
    /// Fails in-flight calls that bypass the registry when the session ends
    calls: Mutex<CancellationToken>,
    lifecycle: tokio::sync::Mutex<()>,
}

/// One logical connection to the hub, shared by the consumer and agent roles
pub struct HubConnection {
    shared: Arc<Shared>,
}

impl HubConnection {
    /// Create a connection whose adapter is chosen by the hub URL scheme
    pub fn new(config: ClientConfig) -> HubResult<Self> {
        config.validate()?;
        let factory = Arc::new(HubTransportFactory::new(config.clone()));
        Ok(Self::with_factory(config, factory))
    }

    /// Create a connection with a custom adapter factory
    pub fn with_factory(config: ClientConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let client_id = config.client.id.clone();
        let registry = Arc::new(CorrelationRegistry::new(config.request_timeout()));
        let dispatcher = Dispatcher::new(&client_id, registry.clone());
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);

        Self {
            shared: Arc::new(Shared {
                policy: ReconnectPolicy::from_config(&config.reconnect),
                client_id,
                config,
                factory,
                registry,
                dispatcher,
                transport: RwLock::new(None),
                credentials: Mutex::new(None),
                subscriptions: SubscriptionSet::new(),
                status,
                connect_handler: RwLock::new(None),
                session: Mutex::new(None),
                calls: Mutex::new(CancellationToken::new()),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.shared.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Watch status changes without registering a handler
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Install the status handler; the last registration wins
    pub fn set_connect_handler(&self, handler: Option<ConnectHandler>) {
        *self.shared.connect_handler.write() = handler;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Address grammar of the active transport
    pub fn address_tokens(&self) -> Option<AddressTokens> {
        self.shared
            .transport
            .read()
            .as_ref()
            .map(|t| t.address_tokens())
    }

    /// Session token issued by the hub, if any
    pub fn token(&self) -> Option<String> {
        self.shared
            .credentials
            .lock()
            .as_ref()
            .and_then(|c| c.token().map(str::to_string))
    }

    /// Connect with the credentials named in the configuration
    pub async fn connect_with_config(&self) -> HubResult<()> {
        let credentials = self.shared.config.credentials()?;
        self.connect(credentials).await
    }

    /// Establish the session and start supervising it.
    ///
    /// The first attempt is not retried; its failure is reported as
    /// `ConnectFailed` or `Unauthorized`.
    pub async fn connect(&self, credentials: Credentials) -> HubResult<()> {
        let shared = &self.shared;
        let _guard = shared.lifecycle.lock().await;
        let span = crate::lifecycle_span!(action = "connect", client_id = %shared.client_id);

        async move {
            if shared.is_connected() {
                debug!("Already connected");
                return Ok(());
            }
            shared.stop_session();

            let session = CancellationToken::new();
            *shared.session.lock() = Some(session.clone());
            shared.transition(ConnectionEvent::ConnectStarted);

            match shared.establish(&credentials, &session).await {
                Ok(events) => {
                    shared.transition(ConnectionEvent::ConnectSucceeded);
                    let task_span =
                        crate::lifecycle_span!(action = "supervise", client_id = %shared.client_id);
                    tokio::spawn(supervise(shared.clone(), events, session).instrument(task_span));
                    Ok(())
                }
                Err(err) => {
                    session.cancel();
                    shared.transition(Supervisor::failure_event(&err));
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Close the session, stop reconnecting and reject every pending call
    pub async fn disconnect(&self) {
        let _guard = self.shared.lifecycle.lock().await;
        let span = crate::lifecycle_span!(action = "disconnect", client_id = %self.shared.client_id);
        self.shared.shutdown().instrument(span).await;
    }

    /// Exchange the session token for a fresh one; reconnects use the new token
    pub async fn refresh_token(&self) -> HubResult<String> {
        let transport = self.shared.current_transport()?;
        let token = transport.refresh_token().await?;
        *self.shared.credentials.lock() = Some(Credentials::Token {
            client_id: self.shared.client_id.clone(),
            token: token.clone(),
        });
        info!(client_id = %self.shared.client_id, "Session token refreshed");
        Ok(token)
    }

    /// Invalidate the session token at the hub and disconnect
    pub async fn logout(&self) -> HubResult<()> {
        let transport = self.shared.current_transport()?;
        let result = transport.logout().await;
        *self.shared.credentials.lock() = None;
        self.disconnect().await;
        result
    }

    /// Send a request and wait for its terminal response
    pub async fn send_request(
        &self,
        request: RequestMessage,
        options: RequestOptions,
    ) -> HubResult<ResponseMessage> {
        self.shared.request(request, options).await
    }

    /// Send a request without waiting; returns its correlation ID.
    ///
    /// The response is delivered to the application response handler.
    pub async fn send_request_nowait(&self, request: RequestMessage) -> HubResult<String> {
        self.shared.request_nowait(request).await
    }

    pub async fn send_response(&self, mut response: ResponseMessage) -> HubResult<()> {
        if response.sender_id.is_empty() {
            response.sender_id = self.shared.client_id.clone();
        }
        let transport = self.shared.current_transport()?;
        transport.send_response(&response).await
    }

    pub async fn send_notification(&self, mut notification: NotificationMessage) -> HubResult<()> {
        if notification.sender_id.is_empty() {
            notification.sender_id = self.shared.client_id.clone();
        }
        let transport = self.shared.current_transport()?;
        transport.send_notification(&notification).await
    }

    /// Track a subscription and apply it when connected.
    ///
    /// Tracked subscriptions are replayed after every reconnect.
    pub async fn subscribe(&self, subscription: Subscription) -> HubResult<()> {
        let added = self.shared.subscriptions.add(subscription.clone());
        let transport = self.shared.transport.read().clone();
        let Some(transport) = transport else {
            return Ok(());
        };
        if let Err(err) = self.shared.apply(&transport, &subscription, true).await {
            if added {
                self.shared.subscriptions.remove(&subscription);
            }
            return Err(err);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, subscription: Subscription) -> HubResult<()> {
        self.shared.subscriptions.remove(&subscription);
        let transport = self.shared.transport.read().clone();
        match transport {
            Some(transport) => self.shared.apply(&transport, &subscription, false).await,
            None => Ok(()),
        }
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.subscriptions.snapshot()
    }

    /// Start receiving requests for Things served by this client
    pub async fn serve_requests(&self) -> HubResult<()> {
        self.shared.subscriptions.set_serving(true);
        let transport = self.shared.transport.read().clone();
        match transport {
            Some(transport) => transport.serve_requests(&self.shared.client_id).await,
            None => Ok(()),
        }
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        self.shared.stop_session();
        self.shared.transport.write().take();
        self.shared.close_calls();
        self.shared.registry.reject_all("connection dropped");
    }
}

impl Shared {
    fn is_connected(&self) -> bool {
        self.transport
            .read()
            .as_ref()
            .is_some_and(|t| t.is_connected())
    }

    fn current_transport(&self) -> HubResult<Arc<dyn Transport>> {
        self.transport.read().clone().ok_or(HubError::NotConnected)
    }

    /// Fail every native call of the ending session; later calls get a fresh token
    fn close_calls(&self) {
        let ended = std::mem::replace(&mut *self.calls.lock(), CancellationToken::new());
        ended.cancel();
    }

    fn stop_session(&self) {
        if let Some(session) = self.session.lock().take() {
            session.cancel();
        }
    }

    fn transition(&self, event: ConnectionEvent) -> ConnectionStatus {
        let status = Supervisor::determine_next_state(event);
        let previous = self.status.send_replace(status);
        if previous == status {
            return status;
        }
        debug!(client_id = %self.client_id, from = %previous, to = %status, "Connection status changed");

        let handler = self.connect_handler.read().clone();
        if let Some(handler) = handler {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(status))).is_err() {
                error!(client_id = %self.client_id, status = %status, "Connect handler panicked");
            }
        }
        status
    }

    /// Create and connect a fresh adapter, install it and replay interest
    async fn establish(
        &self,
        credentials: &Credentials,
        session: &CancellationToken,
    ) -> HubResult<mpsc::UnboundedReceiver<TransportEvent>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self.factory.create(self.dispatcher.clone(), events_tx)?;

        let token = tokio::select! {
            _ = session.cancelled() => return Err(HubError::Cancelled),
            result = transport.connect(credentials) => result?,
        };

        let installed = {
            let mut slot = self.transport.write();
            if session.is_cancelled() {
                false
            } else {
                *slot = Some(transport.clone());
                true
            }
        };
        if !installed {
            transport.disconnect().await;
            return Err(HubError::Cancelled);
        }

        *self.credentials.lock() = Some(match token {
            Some(token) => Credentials::Token {
                client_id: credentials.client_id().to_string(),
                token,
            },
            None => credentials.clone(),
        });
        info!(
            client_id = %self.client_id,
            transport = transport.name(),
            "Transport connected"
        );

        self.replay(&transport).await;
        Ok(events_rx)
    }

    async fn replay(&self, transport: &Arc<dyn Transport>) {
        let subscriptions = self.subscriptions.snapshot();
        if !subscriptions.is_empty() {
            debug!(count = subscriptions.len(), "Replaying subscriptions");
        }
        for subscription in subscriptions {
            if let Err(err) = self.apply(transport, &subscription, true).await {
                warn!(
                    thing_id = %subscription.thing_id,
                    name = %subscription.name,
                    error = %err,
                    "Failed to replay subscription"
                );
            }
        }
        if self.subscriptions.is_serving() {
            if let Err(err) = transport.serve_requests(&self.client_id).await {
                warn!(error = %err, "Failed to resume serving requests");
            }
        }
    }

    /// Subscribe or unsubscribe the way the transport expects
    async fn apply(
        &self,
        transport: &Arc<dyn Transport>,
        subscription: &Subscription,
        subscribe: bool,
    ) -> HubResult<()> {
        match transport.subscription_mode() {
            SubscriptionMode::Broker if subscribe => transport.subscribe(subscription).await,
            SubscriptionMode::Broker => transport.unsubscribe(subscription).await,
            SubscriptionMode::HubRequest => {
                let operation = if subscribe {
                    subscription.subscribe_operation()
                } else {
                    subscription.unsubscribe_operation()
                };
                let request = RequestMessage::new(
                    operation,
                    subscription.thing_id.as_str(),
                    subscription.name.as_str(),
                    None,
                );
                let response = self.request(request, RequestOptions::default()).await?;
                if !response.is_failed() {
                    return Ok(());
                }
                Err(HubError::Application(
                    response
                        .error
                        .unwrap_or_else(|| format!("{operation} failed")),
                ))
            }
        }
    }

    async fn request(
        &self,
        mut request: RequestMessage,
        options: RequestOptions,
    ) -> HubResult<ResponseMessage> {
        if request.sender_id.is_empty() {
            request.sender_id = self.client_id.clone();
        }
        let correlation_id = request.ensure_correlation_id().to_string();
        let transport = self.current_transport()?;
        let timeout = options.timeout.unwrap_or(self.registry.default_timeout());
        let span = crate::request_span!(
            correlation_id = %correlation_id,
            operation = %request.operation,
            thing_id = %request.thing_id,
            name = %request.name
        );

        async move {
            if transport.native_request_reply() {
                let cancel = options.cancel.unwrap_or_else(CancellationToken::new);
                let closed = self.calls.lock().clone();
                let reply = tokio::select! {
                    _ = cancel.cancelled() => return Err(HubError::Cancelled),
                    _ = closed.cancelled() => {
                        return Err(HubError::connection_closed("session ended"))
                    }
                    _ = tokio::time::sleep(timeout) => {
                        return Err(HubError::timeout(correlation_id, timeout.as_millis() as u64))
                    }
                    result = transport.send_request(&request, timeout) => result?,
                };
                return reply.ok_or_else(|| {
                    HubError::protocol(format!("{} returned no reply", transport.name()))
                });
            }

            let pending = self
                .registry
                .register(&correlation_id, Some(timeout), options.progress)?
                .with_cancel(options.cancel);

            // The deadline, cancellation and rejection all apply while the send is in flight
            let wait = pending.wait();
            tokio::pin!(wait);
            tokio::select! {
                result = &mut wait => return result,
                sent = transport.send_request(&request, timeout) => {
                    if let Some(response) = sent? {
                        self.dispatcher.on_response(response);
                    }
                }
            }
            let response = wait.await?;
            debug!(status = ?response.status, "Request completed");
            Ok(response)
        }
        .instrument(span)
        .await
    }

    async fn request_nowait(&self, mut request: RequestMessage) -> HubResult<String> {
        if request.sender_id.is_empty() {
            request.sender_id = self.client_id.clone();
        }
        let correlation_id = request.ensure_correlation_id().to_string();
        let transport = self.current_transport()?;
        if let Some(response) = transport
            .send_request(&request, self.registry.default_timeout())
            .await?
        {
            self.dispatcher.on_response(response);
        }
        Ok(correlation_id)
    }

    /// Drop the lost adapter and fail everything that was waiting on it
    async fn session_lost(&self, reason: &str) {
        let lost = self.transport.write().take();
        self.close_calls();
        let rejected = self.registry.reject_all(&format!("connection lost: {reason}"));
        if rejected > 0 {
            warn!(rejected, "Rejected pending calls after connection loss");
        }
        if let Some(lost) = lost {
            lost.disconnect().await;
        }
        self.transition(ConnectionEvent::SessionLost(reason.to_string()));
    }

    async fn shutdown(&self) {
        self.stop_session();
        let transport = self.transport.write().take();
        self.close_calls();
        let rejected = self.registry.reject_all("disconnected");
        if rejected > 0 {
            debug!(rejected, "Rejected pending calls on disconnect");
        }
        if let Some(transport) = transport {
            transport.disconnect().await;
        }
        self.transition(ConnectionEvent::DisconnectRequested);
    }

    /// Retry until a new session is up; `None` means supervision ends
    async fn reconnect(
        &self,
        session: &CancellationToken,
    ) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        let mut attempts = 0;
        let mut last_error: Option<HubError> = None;

        loop {
            let decision = Supervisor::should_attempt_reconnection(
                attempts,
                &self.policy,
                session.is_cancelled(),
                last_error.as_ref(),
            );
            match decision {
                ReconnectionDecision::Proceed { attempt, delay } => {
                    info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
                    if !interruptible_sleep(delay, session).await {
                        return None;
                    }
                    let credentials = self.credentials.lock().clone();
                    let Some(credentials) = credentials else {
                        error!("No credentials left to reconnect with");
                        self.transition(ConnectionEvent::ConnectFailed(
                            "no credentials".to_string(),
                        ));
                        return None;
                    };

                    self.transition(ConnectionEvent::ConnectStarted);
                    match self.establish(&credentials, session).await {
                        Ok(events) => {
                            self.transition(ConnectionEvent::ConnectSucceeded);
                            return Some(events);
                        }
                        Err(HubError::Cancelled) if session.is_cancelled() => return None,
                        Err(err) => {
                            self.transition(Supervisor::failure_event(&err));
                            attempts = attempt;
                            last_error = Some(err);
                        }
                    }
                }
                ReconnectionDecision::AbortUnauthorized => {
                    error!("Reconnect stopped, credentials were rejected");
                    return None;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    error!(attempts, "Reconnect stopped, maximum attempts reached");
                    return None;
                }
                ReconnectionDecision::AbortShutdownRequested => return None,
            }
        }
    }
}

/// Watch one session; reconnect when it closes unexpectedly
async fn supervise(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    session: CancellationToken,
) {
    loop {
        let reason = tokio::select! {
            _ = session.cancelled() => return,
            event = events.recv() => match event {
                Some(TransportEvent::Closed { reason }) => reason,
                None => return,
            },
        };
        if session.is_cancelled() {
            return;
        }

        shared.session_lost(&reason).await;
        match shared.reconnect(&session).await {
            Some(next) => events = next,
            None => return,
        }
    }
}

/// Sleep unless the session is cancelled first; returns false when cancelled
async fn interruptible_sleep(delay: Duration, session: &CancellationToken) -> bool {
    tokio::select! {
        _ = session.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interruptible_sleep_stops_on_cancel() {
        let session = CancellationToken::new();
        session.cancel();
        assert!(!interruptible_sleep(Duration::from_secs(60), &session).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interruptible_sleep_completes() {
        let session = CancellationToken::new();
        assert!(interruptible_sleep(Duration::from_millis(10), &session).await);
    }

    #[tokio::test]
    async fn test_request_without_transport_is_not_connected() {
        let conn = HubConnection::new(ClientConfig::new("c1", "https://localhost:8444")).unwrap();
        let result = conn
            .send_request(
                RequestMessage::new("invoke-action", "dtw:lamp1", "toggle", None),
                RequestOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(HubError::NotConnected)));
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_is_tracked() {
        let conn = HubConnection::new(ClientConfig::new("c1", "https://localhost:8444")).unwrap();
        conn.subscribe(Subscription::event("dtw:lamp1", "switched"))
            .await
            .unwrap();
        assert_eq!(conn.subscriptions().len(), 1);
    }

    #[test]
    fn test_request_options_builders() {
        let options = RequestOptions::default()
            .with_timeout(Duration::from_millis(50))
            .with_progress(|_| {});
        assert_eq!(options.timeout, Some(Duration::from_millis(50)));
        assert!(options.progress.is_some());
        assert!(options.cancel.is_none());
    }
}
