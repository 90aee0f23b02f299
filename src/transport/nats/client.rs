//! NATS adapter built on native request-reply

use crate::config::{ClientConfig, Credentials};
use crate::error::{HubError, HubResult};
use crate::protocol::{
    Address, AddressTokens, NotificationMessage, RequestMessage, ResponseMessage,
    AGENT_REQUEST_OPERATIONS,
};
use crate::transport::dispatch::{decode_addressed_notification, decode_addressed_request};
use crate::transport::{
    malformed_request_reply, Dispatcher, ReplyRoutes, Subscription, SubscriptionMode, Transport,
    TransportEvent,
};
use async_nats::{ConnectErrorKind, ConnectOptions, Event, RequestErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

const TOKENS: AddressTokens = AddressTokens::NATS;

/// What a pull loop does with the messages of its subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inbound {
    Requests,
    Notifications,
}

struct NatsInner {
    config: Arc<ClientConfig>,
    client_id: String,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedSender<TransportEvent>,
    client: RwLock<Option<async_nats::Client>>,
    connected: AtomicBool,
    shutdown: CancellationToken,
    /// Cancels the pull loop of each subscribed subject
    subscriptions: Mutex<HashMap<String, CancellationToken>>,
    /// Reply subjects of requests answered later with `send_response`
    reply_subjects: ReplyRoutes<String>,
}

impl NatsInner {
    fn client(&self) -> HubResult<async_nats::Client> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(HubError::NotConnected);
        }
        self.client.read().clone().ok_or(HubError::NotConnected)
    }

    async fn publish(&self, subject: String, payload: Vec<u8>) -> HubResult<()> {
        let client = self.client()?;
        client
            .publish(subject.clone(), Bytes::from(payload))
            .await
            .map_err(|e| HubError::connection_failed(format!("publish to {subject} failed: {e}")))
    }

    async fn reply(&self, subject: String, response: &ResponseMessage) -> HubResult<()> {
        self.publish(subject, response.to_json()?).await
    }
}

/// NATS adapter.
///
/// Requests use the client's own request-reply, so replies never pass
/// through the correlation registry. Subscriptions run as pull loops.
pub struct NatsTransport {
    inner: Arc<NatsInner>,
}

impl NatsTransport {
    pub fn new(
        config: Arc<ClientConfig>,
        dispatcher: Dispatcher,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(NatsInner {
                client_id: config.client.id.clone(),
                config,
                dispatcher,
                events,
                client: RwLock::new(None),
                connected: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                subscriptions: Mutex::new(HashMap::new()),
                reply_subjects: ReplyRoutes::default(),
            }),
        }
    }

    fn connect_options(&self, credentials: &Credentials) -> ConnectOptions {
        let config = &self.inner.config;
        let mut options = match credentials {
            Credentials::Token { token, .. } => ConnectOptions::with_token(token.clone()),
            Credentials::Password {
                client_id,
                password,
            } => ConnectOptions::with_user_and_password(client_id.clone(), password.clone()),
            Credentials::Anonymous { .. } => ConnectOptions::new(),
        };
        options = options
            .name(&self.inner.client_id)
            .connection_timeout(config.connect_timeout())
            .request_timeout(Some(config.request_timeout()));

        if config.hub.url.starts_with("tls://") {
            options = options.require_tls(true);
        }
        if let Some(ca) = &config.hub.ca_cert {
            options = options.add_root_certificates(ca.clone());
        }

        let inner = Arc::downgrade(&self.inner);
        options.event_callback(move |event| {
            let inner = inner.clone();
            async move {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                match event {
                    Event::Connected => debug!("NATS connection (re)established"),
                    Event::Disconnected => {
                        let was_connected = inner.connected.swap(false, Ordering::SeqCst);
                        if was_connected && !inner.shutdown.is_cancelled() {
                            // The supervisor replaces this adapter with a fresh one
                            inner.shutdown.cancel();
                            let _ = inner.events.send(TransportEvent::Closed {
                                reason: "NATS connection lost".to_string(),
                            });
                        }
                    }
                    other => warn!(event = %other, "NATS client event"),
                }
            }
        })
    }

    async fn start_pull_loop(&self, subject: String, inbound: Inbound) -> HubResult<()> {
        let client = self.inner.client()?;
        if self.inner.subscriptions.lock().contains_key(&subject) {
            return Ok(());
        }
        let subscriber = client
            .subscribe(subject.clone())
            .await
            .map_err(|e| HubError::connection_failed(format!("subscribe to {subject} failed: {e}")))?;

        let cancel = self.inner.shutdown.child_token();
        self.inner
            .subscriptions
            .lock()
            .insert(subject.clone(), cancel.clone());

        let span = crate::transport_span!(transport = "nats", subject = %subject);
        tokio::spawn(pull_loop(self.inner.clone(), subscriber, inbound, cancel).instrument(span));
        debug!(subject = %subject, "Subscribed");
        Ok(())
    }

    fn stop_pull_loop(&self, subject: &str) {
        if let Some(cancel) = self.inner.subscriptions.lock().remove(subject) {
            cancel.cancel();
        }
    }
}

impl Drop for NatsTransport {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

fn map_connect_error(error: async_nats::ConnectError) -> HubError {
    match error.kind() {
        ConnectErrorKind::Authentication | ConnectErrorKind::AuthorizationViolation => {
            HubError::unauthorized(error.to_string())
        }
        _ => HubError::connection_failed(error.to_string()),
    }
}

#[async_trait]
impl Transport for NatsTransport {
    fn name(&self) -> &'static str {
        "nats"
    }

    fn address_tokens(&self) -> AddressTokens {
        TOKENS
    }

    async fn connect(&self, credentials: &Credentials) -> HubResult<Option<String>> {
        let options = self.connect_options(credentials);
        if self.inner.config.hub.disable_cert_check {
            warn!("disable_cert_check is not supported by the NATS transport, certificates are verified");
        }
        let url = self.inner.config.hub.url.clone();
        let client = tokio::time::timeout(self.inner.config.connect_timeout(), options.connect(url.as_str()))
            .await
            .map_err(|_| HubError::connection_failed(format!("timed out connecting to {url}")))?
            .map_err(map_connect_error)?;

        *self.inner.client.write() = Some(client);
        self.inner.connected.store(true, Ordering::SeqCst);
        info!(client_id = %self.inner.client_id, url = %url, "Connected to NATS server");
        Ok(None)
    }

    async fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        self.inner.subscriptions.lock().clear();
        self.inner.reply_subjects.clear();
        let client = self.inner.client.write().take();
        if let Some(client) = client {
            if let Err(e) = client.flush().await {
                debug!(error = %e, "Flush on disconnect failed");
            }
        }
        debug!(client_id = %self.inner.client_id, "NATS transport disconnected");
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn native_request_reply(&self) -> bool {
        true
    }

    async fn send_request(
        &self,
        request: &RequestMessage,
        timeout: Duration,
    ) -> HubResult<Option<ResponseMessage>> {
        let client = self.inner.client()?;
        let address = Address::for_thing(
            &request.operation,
            &request.thing_id,
            &request.name,
            &self.inner.client_id,
        );
        let subject = TOKENS.publish_address(&address);
        let payload = Bytes::from(request.to_json()?);

        let timeout_ms = timeout.as_millis() as u64;
        let message = tokio::time::timeout(timeout, client.request(subject.clone(), payload))
            .await
            .map_err(|_| HubError::timeout(request.correlation_id.clone(), timeout_ms))?
            .map_err(|e| match e.kind() {
                RequestErrorKind::TimedOut => {
                    HubError::timeout(request.correlation_id.clone(), timeout_ms)
                }
                RequestErrorKind::NoResponders => {
                    HubError::connection_failed(format!("no agent serves {subject}"))
                }
                _ => HubError::connection_failed(format!("request on {subject} failed: {e}")),
            })?;

        let mut response = ResponseMessage::from_json(&message.payload)?;
        if response.correlation_id.is_empty() {
            response.correlation_id = request.correlation_id.clone();
        }
        Ok(Some(response))
    }

    async fn send_response(&self, response: &ResponseMessage) -> HubResult<()> {
        if !response.is_terminal() {
            // Native request-reply delivers a single message; progress stays local
            debug!(correlation_id = %response.correlation_id, "Progress not forwarded over NATS");
            return Ok(());
        }
        let subject = self
            .inner
            .reply_subjects
            .route_for(response)
            .ok_or_else(|| {
                HubError::protocol(format!(
                    "no pending request '{}' to answer",
                    response.correlation_id
                ))
            })?;
        self.inner.reply(subject, response).await
    }

    async fn send_notification(&self, notification: &NotificationMessage) -> HubResult<()> {
        let address = Address::for_thing(
            &notification.operation,
            &notification.thing_id,
            &notification.name,
            &self.inner.client_id,
        );
        self.inner
            .publish(TOKENS.publish_address(&address), notification.to_json()?)
            .await
    }

    fn subscription_mode(&self) -> SubscriptionMode {
        SubscriptionMode::Broker
    }

    async fn subscribe(&self, subscription: &Subscription) -> HubResult<()> {
        for operation in subscription.notification_operations() {
            let address =
                Address::for_thing(operation, &subscription.thing_id, &subscription.name, "");
            self.start_pull_loop(TOKENS.subscribe_filter(&address), Inbound::Notifications)
                .await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> HubResult<()> {
        for operation in subscription.notification_operations() {
            let address =
                Address::for_thing(operation, &subscription.thing_id, &subscription.name, "");
            self.stop_pull_loop(&TOKENS.subscribe_filter(&address));
        }
        Ok(())
    }

    async fn serve_requests(&self, agent_id: &str) -> HubResult<()> {
        for operation in AGENT_REQUEST_OPERATIONS {
            let address = Address {
                operation: operation.to_string(),
                agent_id: agent_id.to_string(),
                ..Default::default()
            };
            self.start_pull_loop(TOKENS.subscribe_filter(&address), Inbound::Requests)
                .await?;
        }
        Ok(())
    }
}

/// Forward messages of one subscription until it is cancelled or closed
async fn pull_loop(
    inner: Arc<NatsInner>,
    mut subscriber: async_nats::Subscriber,
    inbound: Inbound,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = subscriber.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let subject = message.subject.to_string();
        match inbound {
            Inbound::Notifications => {
                match decode_addressed_notification(&subject, &message.payload, &TOKENS) {
                    Ok(notification) => inner.dispatcher.on_notification(notification),
                    Err(e) => warn!(subject = %subject, error = %e, "Malformed notification"),
                }
            }
            Inbound::Requests => {
                let Some(reply) = message.reply.as_ref().map(|r| r.to_string()) else {
                    warn!(subject = %subject, "Request without reply subject dropped");
                    continue;
                };
                tokio::spawn(handle_request(inner.clone(), subject, message.payload, reply));
            }
        }
    }
    if let Err(e) = subscriber.unsubscribe().await {
        debug!(error = %e, "Unsubscribe after pull loop failed");
    }
}

async fn handle_request(inner: Arc<NatsInner>, subject: String, payload: Bytes, reply: String) {
    let request = match decode_addressed_request(&subject, &payload, &TOKENS) {
        Ok(request) => request,
        Err(e) => {
            warn!(subject = %subject, error = %e, "Malformed request");
            if let Some(response) = malformed_request_reply(&payload, &e) {
                if let Err(e) = inner.reply(reply, &response).await {
                    warn!(error = %e, "Failed to reject malformed request");
                }
            }
            return;
        }
    };

    let correlation_id = request.correlation_id.clone();
    let response = inner.dispatcher.on_request(request).await;

    if !response.is_terminal() && !correlation_id.is_empty() {
        // Answered later through send_response
        inner.reply_subjects.insert(correlation_id, reply);
        return;
    }
    if let Err(e) = inner.reply(reply, &response).await {
        error!(correlation_id = %correlation_id, error = %e, "Failed to send reply");
    }
}
