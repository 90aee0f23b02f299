//! Inbound message routing
//!
//! Every adapter hands decoded envelopes to a [`Dispatcher`]: responses go to
//! the correlation registry, notifications and requests go to the handlers
//! registered by the application. Each handler slot holds at most one
//! handler; the last registration wins.

use crate::correlation::CorrelationRegistry;
use crate::error::{sanitize_error_message, HubError, HubResult};
use crate::protocol::{
    AddressTokens, Envelope, NotificationMessage, RequestMessage, ResponseMessage,
};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Serves requests addressed to Things of this agent
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produce the response for a request.
    ///
    /// Returning a `running` response acknowledges the request; the terminal
    /// response is then sent later with `Agent::send_response`.
    async fn handle_request(&self, request: RequestMessage) -> ResponseMessage;
}

struct FnRequestHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(RequestMessage) -> Fut + Send + Sync,
    Fut: Future<Output = ResponseMessage> + Send + 'static,
{
    async fn handle_request(&self, request: RequestMessage) -> ResponseMessage {
        (self.0)(request).await
    }
}

/// Wrap an async closure as a [`RequestHandler`]
pub fn request_handler_fn<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(RequestMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ResponseMessage> + Send + 'static,
{
    Arc::new(FnRequestHandler(f))
}

pub type NotificationHandler = Arc<dyn Fn(NotificationMessage) + Send + Sync>;
pub type ResponseHandler = Arc<dyn Fn(ResponseMessage) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    request: RwLock<Option<Arc<dyn RequestHandler>>>,
    notification: RwLock<Option<NotificationHandler>>,
    response: RwLock<Option<ResponseHandler>>,
}

/// Routes inbound envelopes of one connection
#[derive(Clone)]
pub struct Dispatcher {
    client_id: Arc<str>,
    registry: Arc<CorrelationRegistry>,
    handlers: Arc<Handlers>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("client_id", &self.client_id)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher for a registry.
    ///
    /// Responses that match no pending call are passed on to the application
    /// response handler, if one is set.
    pub fn new(client_id: &str, registry: Arc<CorrelationRegistry>) -> Self {
        let handlers = Arc::new(Handlers::default());
        let weak: Weak<Handlers> = Arc::downgrade(&handlers);
        registry.set_unsolicited_handler(Some(Arc::new(move |response: ResponseMessage| {
            let handler = weak.upgrade().and_then(|h| h.response.read().clone());
            match handler {
                Some(handler) => handler(response),
                None => warn!(
                    correlation_id = %response.correlation_id,
                    operation = %response.operation,
                    "Unsolicited response dropped, no response handler"
                ),
            }
        })));

        Self {
            client_id: Arc::from(client_id),
            registry,
            handlers,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    pub fn set_request_handler(&self, handler: Option<Arc<dyn RequestHandler>>) {
        *self.handlers.request.write() = handler;
    }

    pub fn set_notification_handler(&self, handler: Option<NotificationHandler>) {
        *self.handlers.notification.write() = handler;
    }

    pub fn set_response_handler(&self, handler: Option<ResponseHandler>) {
        *self.handlers.response.write() = handler;
    }

    pub fn has_request_handler(&self) -> bool {
        self.handlers.request.read().is_some()
    }

    /// Deliver a response; returns true if it matched a pending call
    pub fn on_response(&self, response: ResponseMessage) -> bool {
        self.registry.resolve(response)
    }

    pub fn on_notification(&self, notification: NotificationMessage) {
        let handler = self.handlers.notification.read().clone();
        let Some(handler) = handler else {
            debug!(
                operation = %notification.operation,
                thing_id = %notification.thing_id,
                name = %notification.name,
                "Notification dropped, no notification handler"
            );
            return;
        };
        let operation = notification.operation.clone();
        if std::panic::catch_unwind(AssertUnwindSafe(|| handler(notification))).is_err() {
            error!(operation = %operation, "Notification handler panicked");
        }
    }

    /// Run the request handler and return the response to send back.
    ///
    /// A missing or panicking handler yields a failed response.
    pub async fn on_request(&self, request: RequestMessage) -> ResponseMessage {
        let handler = self.handlers.request.read().clone();
        let Some(handler) = handler else {
            warn!(
                operation = %request.operation,
                thing_id = %request.thing_id,
                correlation_id = %request.correlation_id,
                "Request received without a request handler"
            );
            let err = format!(
                "no request handler for {} on {}",
                request.operation, request.thing_id
            );
            return self.stamp(request.create_response(None, Some(err)));
        };

        let result = AssertUnwindSafe(handler.handle_request(request.clone()))
            .catch_unwind()
            .await;

        let mut response = match result {
            Ok(response) => response,
            Err(_) => {
                error!(
                    operation = %request.operation,
                    correlation_id = %request.correlation_id,
                    "Request handler panicked"
                );
                request.create_response(None, Some("request handler panicked".to_string()))
            }
        };
        if response.correlation_id.is_empty() {
            response.correlation_id = request.correlation_id.clone();
        }
        if let Some(err) = response.error.take() {
            response.error = Some(sanitize_error_message(&err));
        }
        self.stamp(response)
    }

    /// Route any envelope. A request yields the response to send back.
    pub async fn on_envelope(&self, envelope: Envelope) -> Option<ResponseMessage> {
        match envelope {
            Envelope::Response(response) => {
                self.on_response(response);
                None
            }
            Envelope::Notification(notification) => {
                self.on_notification(notification);
                None
            }
            Envelope::Request(request) => Some(self.on_request(request).await),
        }
    }

    fn stamp(&self, mut response: ResponseMessage) -> ResponseMessage {
        if response.sender_id.is_empty() {
            response.sender_id = self.client_id.to_string();
        }
        response
    }
}

/// Build a failure response for an inbound request that couldn't be decoded.
///
/// Only possible when the payload is JSON with a correlation ID; anything
/// else can only be dropped.
pub fn malformed_request_reply(payload: &[u8], err: &HubError) -> Option<ResponseMessage> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let correlation_id = value.get("correlationID")?.as_str()?;
    if correlation_id.is_empty() {
        return None;
    }
    let field = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let request = RequestMessage::new(field("operation"), field("thingID"), field("name"), None)
        .with_correlation_id(correlation_id);
    Some(request.create_response(None, Some(sanitize_error_message(&err.to_string()))))
}

/// Decode a request received on a broker address.
///
/// Fields the envelope leaves empty are taken from the address.
pub fn decode_addressed_request(
    address: &str,
    payload: &[u8],
    tokens: &AddressTokens,
) -> HubResult<RequestMessage> {
    let mut request = match Envelope::from_json(payload)? {
        Envelope::Request(request) => request,
        other => {
            return Err(HubError::protocol(format!(
                "expected a request on {address}, got {other:?}"
            )))
        }
    };
    if let Ok(parsed) = tokens.parse(address) {
        fill(&mut request.operation, parsed.operation);
        fill(&mut request.thing_id, parsed.thing_id);
        fill(&mut request.name, parsed.name);
        fill(&mut request.sender_id, parsed.sender_id);
    }
    if request.operation.is_empty() {
        return Err(HubError::protocol(format!(
            "request on {address} has no operation"
        )));
    }
    Ok(request)
}

/// Decode a notification received on a broker address
pub fn decode_addressed_notification(
    address: &str,
    payload: &[u8],
    tokens: &AddressTokens,
) -> HubResult<NotificationMessage> {
    let mut notification = NotificationMessage::from_json(payload)?;
    if let Ok(parsed) = tokens.parse(address) {
        fill(&mut notification.operation, parsed.operation);
        fill(&mut notification.thing_id, parsed.thing_id);
        fill(&mut notification.name, parsed.name);
        fill(&mut notification.sender_id, parsed.sender_id);
    }
    Ok(notification)
}

fn fill(field: &mut String, value: String) {
    if field.is_empty() {
        *field = value;
    }
}
