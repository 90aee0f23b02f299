//! Transport layer
//!
//! A [`Transport`] owns one physical session with the hub and converts
//! envelopes to and from its native primitives. Adapters are created per
//! connect by a [`TransportFactory`] and discarded on reconnect; they never
//! outlive their session.

use crate::config::{ClientConfig, Credentials, TransportKind};
use crate::error::{HubError, HubResult};
use crate::protocol::{
    AddressTokens, FormProvider, NotificationMessage, RequestMessage, ResponseMessage,
    OP_OBSERVE_ALL_PROPERTIES, OP_OBSERVE_PROPERTY, OP_PUBLISH_EVENT, OP_SUBSCRIBE_ALL_EVENTS,
    OP_SUBSCRIBE_EVENT, OP_UNOBSERVE_ALL_PROPERTIES, OP_UNOBSERVE_PROPERTY,
    OP_UNSUBSCRIBE_ALL_EVENTS, OP_UNSUBSCRIBE_EVENT, OP_UPDATE_MULTIPLE_PROPERTIES,
    OP_UPDATE_PROPERTY,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod dispatch;
pub mod http;
pub mod mqtt;
pub mod nats;
pub mod replies;

pub use dispatch::{
    malformed_request_reply, request_handler_fn, Dispatcher, NotificationHandler,
    RequestHandler, ResponseHandler,
};
pub use replies::ReplyRoutes;

/// Lifecycle events reported by an adapter to its supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The session ended without an explicit disconnect
    Closed { reason: String },
}

/// How subscriptions reach the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// The adapter subscribes to broker addresses itself
    Broker,
    /// The facade asks the hub with a subscribe/observe request
    HubRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Event,
    Property,
}

/// Interest in events or property updates; empty fields match everything
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub kind: SubscriptionKind,
    pub thing_id: String,
    pub name: String,
}

impl Subscription {
    pub fn event(thing_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: SubscriptionKind::Event,
            thing_id: thing_id.into(),
            name: name.into(),
        }
    }

    pub fn property(thing_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: SubscriptionKind::Property,
            thing_id: thing_id.into(),
            name: name.into(),
        }
    }

    /// Request operation that registers this subscription with a hub
    pub fn subscribe_operation(&self) -> &'static str {
        match (self.kind, self.name.is_empty()) {
            (SubscriptionKind::Event, false) => OP_SUBSCRIBE_EVENT,
            (SubscriptionKind::Event, true) => OP_SUBSCRIBE_ALL_EVENTS,
            (SubscriptionKind::Property, false) => OP_OBSERVE_PROPERTY,
            (SubscriptionKind::Property, true) => OP_OBSERVE_ALL_PROPERTIES,
        }
    }

    pub fn unsubscribe_operation(&self) -> &'static str {
        match (self.kind, self.name.is_empty()) {
            (SubscriptionKind::Event, false) => OP_UNSUBSCRIBE_EVENT,
            (SubscriptionKind::Event, true) => OP_UNSUBSCRIBE_ALL_EVENTS,
            (SubscriptionKind::Property, false) => OP_UNOBSERVE_PROPERTY,
            (SubscriptionKind::Property, true) => OP_UNOBSERVE_ALL_PROPERTIES,
        }
    }

    /// Notification operations carried by a broker subscription
    pub fn notification_operations(&self) -> &'static [&'static str] {
        match self.kind {
            SubscriptionKind::Event => &[OP_PUBLISH_EVENT],
            SubscriptionKind::Property => &[OP_UPDATE_PROPERTY, OP_UPDATE_MULTIPLE_PROPERTIES],
        }
    }
}

/// One physical session with the hub
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Short transport name for logs
    fn name(&self) -> &'static str;

    /// Separator and wildcard tokens of this transport's address grammar
    fn address_tokens(&self) -> AddressTokens;

    /// Establish the session; completes once the return channel is usable.
    ///
    /// Returns the session token when the transport issues one.
    async fn connect(&self, credentials: &Credentials) -> HubResult<Option<String>>;

    /// Close the session. No [`TransportEvent::Closed`] is reported.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// True when the transport matches replies itself and the correlation
    /// registry is bypassed
    fn native_request_reply(&self) -> bool {
        false
    }

    /// Send a request.
    ///
    /// A response that arrives synchronously (an HTTP body or a native reply)
    /// is returned; `None` means the response arrives on the return channel.
    async fn send_request(
        &self,
        request: &RequestMessage,
        timeout: Duration,
    ) -> HubResult<Option<ResponseMessage>>;

    async fn send_response(&self, response: &ResponseMessage) -> HubResult<()>;

    async fn send_notification(&self, notification: &NotificationMessage) -> HubResult<()>;

    fn subscription_mode(&self) -> SubscriptionMode;

    /// Subscribe at the broker; only used in [`SubscriptionMode::Broker`]
    async fn subscribe(&self, subscription: &Subscription) -> HubResult<()>;

    async fn unsubscribe(&self, subscription: &Subscription) -> HubResult<()>;

    /// Start receiving requests addressed to Things of this agent
    async fn serve_requests(&self, agent_id: &str) -> HubResult<()>;

    /// Exchange the session token for a fresh one
    async fn refresh_token(&self) -> HubResult<String> {
        Err(HubError::Unsupported(format!(
            "token refresh over {}",
            self.name()
        )))
    }

    async fn logout(&self) -> HubResult<()> {
        Err(HubError::Unsupported(format!("logout over {}", self.name())))
    }
}

/// Creates a fresh adapter for each connection attempt
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        dispatcher: Dispatcher,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> HubResult<Arc<dyn Transport>>;
}

/// Factory that picks the adapter from the hub URL scheme
pub struct HubTransportFactory {
    config: Arc<ClientConfig>,
    forms: Option<Arc<dyn FormProvider>>,
}

impl HubTransportFactory {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
            forms: None,
        }
    }

    /// Use Thing Description forms for HTTP requests when available
    pub fn with_forms(mut self, forms: Arc<dyn FormProvider>) -> Self {
        self.forms = Some(forms);
        self
    }
}

impl TransportFactory for HubTransportFactory {
    fn create(
        &self,
        dispatcher: Dispatcher,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> HubResult<Arc<dyn Transport>> {
        match self.config.transport_kind()? {
            TransportKind::HttpSse => Ok(Arc::new(http::HttpSseTransport::new(
                self.config.clone(),
                dispatcher,
                events,
                self.forms.clone(),
            )?)),
            TransportKind::Mqtt => Ok(Arc::new(mqtt::MqttTransport::new(
                self.config.clone(),
                dispatcher,
                events,
            )?)),
            TransportKind::Nats => Ok(Arc::new(nats::NatsTransport::new(
                self.config.clone(),
                dispatcher,
                events,
            ))),
        }
    }
}
