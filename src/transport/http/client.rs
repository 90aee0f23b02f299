//! HTTP request channel paired with an SSE return channel

use super::auth::{
    self, bearer, build_http_client, status_error, CONNECTION_ID_HEADER, CORRELATION_ID_HEADER,
    MESSAGE_ID_HEADER, NOTIFICATION_PATH, REQUEST_PATH, RESPONSE_PATH,
};
use super::sse::{SseDecoder, SseEvent, SseItem};
use crate::config::{ClientConfig, Credentials};
use crate::error::{HubError, HubResult};
use crate::protocol::{
    AddressTokens, Envelope, FormProvider, NotificationMessage, RequestMessage, RequestStatus,
    ResponseMessage, MESSAGE_TYPE_REQUEST, MESSAGE_TYPE_RESPONSE,
};
use crate::transport::{
    malformed_request_reply, Dispatcher, Subscription, SubscriptionMode, Transport,
    TransportEvent,
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, ORIGIN};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use url::Url;

/// SSE path used when the hub URL carries none
pub const DEFAULT_SSE_PATH: &str = "/hiveot/sse";

pub const EVENT_PING: &str = "ping";
pub const EVENT_CLOSE: &str = "close";

/// Path value substituted for an empty thingID or name in a form href
const FORM_ANY: &str = "+";

struct HttpInner {
    client_id: String,
    base_url: Url,
    sse_url: Url,
    connect_timeout: Duration,
    request_timeout: Duration,
    http: reqwest::Client,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedSender<TransportEvent>,
    forms: Option<Arc<dyn FormProvider>>,
    token: RwLock<Option<String>>,
    connection_id: String,
    connected: AtomicBool,
    shutdown: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl HttpInner {
    fn current_token(&self) -> HubResult<String> {
        self.token.read().clone().ok_or(HubError::NotConnected)
    }

    fn ensure_connected(&self) -> HubResult<String> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(HubError::NotConnected);
        }
        self.current_token()
    }

    async fn post_envelope(
        &self,
        path: &str,
        body: Vec<u8>,
        correlation_id: &str,
        timeout: Duration,
    ) -> HubResult<reqwest::Response> {
        let token = self.ensure_connected()?;
        let url = auth::join(&self.base_url, path)?;
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .header(AUTHORIZATION, bearer(&token))
            .header(CONNECTION_ID_HEADER, &self.connection_id)
            .header(CONTENT_TYPE, "application/json")
            .header(CORRELATION_ID_HEADER, correlation_id)
            .header(MESSAGE_ID_HEADER, correlation_id)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HubError::timeout(correlation_id, timeout.as_millis() as u64)
                } else {
                    HubError::connection_failed(format!("POST {path} failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, path));
        }
        Ok(response)
    }

    async fn post_response(&self, response: &ResponseMessage) -> HubResult<()> {
        let body = response.to_json()?;
        self.post_envelope(
            RESPONSE_PATH,
            body,
            &response.correlation_id,
            self.request_timeout,
        )
        .await?;
        Ok(())
    }
}

/// HTTP+SSE adapter.
///
/// Requests and replies are POSTed; responses, notifications and requests
/// for this agent arrive on a single SSE stream opened at connect.
pub struct HttpSseTransport {
    inner: Arc<HttpInner>,
}

impl HttpSseTransport {
    pub fn new(
        config: Arc<ClientConfig>,
        dispatcher: Dispatcher,
        events: mpsc::UnboundedSender<TransportEvent>,
        forms: Option<Arc<dyn FormProvider>>,
    ) -> HubResult<Self> {
        let sse_url = Url::parse(&config.hub.url)
            .map_err(|e| HubError::connection_failed(format!("invalid hub URL: {e}")))?;
        let sse_url = if sse_url.path().is_empty() || sse_url.path() == "/" {
            auth::join(&sse_url, DEFAULT_SSE_PATH)?
        } else {
            sse_url
        };
        let base_url = auth::join(&sse_url, "/")?;
        let http = build_http_client(&config)?;

        Ok(Self {
            inner: Arc::new(HttpInner {
                client_id: config.client.id.clone(),
                base_url,
                sse_url,
                connect_timeout: config.connect_timeout(),
                request_timeout: config.request_timeout(),
                http,
                dispatcher,
                events,
                forms,
                token: RwLock::new(None),
                connection_id: format!("http-{}", uuid::Uuid::new_v4()),
                connected: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                reader: Mutex::new(None),
            }),
        })
    }

    /// Connection ID sent to the hub in the `cid` header
    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    pub fn token(&self) -> Option<String> {
        self.inner.token.read().clone()
    }

    async fn open_stream(&self, token: &str) -> HubResult<reqwest::Response> {
        let inner = &self.inner;
        let origin = inner.sse_url.origin().ascii_serialization();
        let request = inner
            .http
            .get(inner.sse_url.clone())
            .header(AUTHORIZATION, bearer(token))
            .header(CONNECTION_ID_HEADER, &inner.connection_id)
            .header(ACCEPT, "text/event-stream")
            .header(ORIGIN, origin)
            .send();

        let response = tokio::time::timeout(inner.connect_timeout, request)
            .await
            .map_err(|_| HubError::connection_failed("timed out opening the SSE stream"))?
            .map_err(|e| HubError::connection_failed(format!("SSE connect failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "SSE stream rejected"));
        }
        Ok(response)
    }

    /// WoT form path: the body is the raw input and the reply body the raw output
    async fn send_form_request(
        &self,
        request: &RequestMessage,
        form: crate::protocol::Form,
        timeout: Duration,
    ) -> HubResult<Option<ResponseMessage>> {
        let token = self.inner.ensure_connected()?;
        let thing = if request.thing_id.is_empty() {
            FORM_ANY
        } else {
            &request.thing_id
        };
        let name = if request.name.is_empty() {
            FORM_ANY
        } else {
            &request.name
        };
        let url = auth::join(&self.inner.base_url, &form.resolve_href(thing, name))?;
        let method = Method::from_bytes(form.method.as_bytes())
            .map_err(|_| HubError::protocol(format!("invalid form method '{}'", form.method)))?;

        let mut builder = self
            .inner
            .http
            .request(method, url)
            .timeout(timeout)
            .header(AUTHORIZATION, bearer(&token))
            .header(CONNECTION_ID_HEADER, &self.inner.connection_id)
            .header(CORRELATION_ID_HEADER, &request.correlation_id)
            .header(MESSAGE_ID_HEADER, &request.correlation_id);
        if let Some(input) = &request.input {
            builder = builder
                .header(CONTENT_TYPE, form.content_type.as_str())
                .body(serde_json::to_vec(input)?);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HubError::timeout(request.correlation_id.clone(), timeout.as_millis() as u64)
            } else {
                HubError::connection_failed(format!("{} {} failed: {e}", form.method, form.href))
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(status_error(status, &form.href));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| HubError::connection_failed(format!("reading reply failed: {e}")))?;

        Ok(Some(form_reply(request, status, &body)))
    }
}

/// Interpret the reply of a form request
fn form_reply(request: &RequestMessage, status: StatusCode, body: &[u8]) -> ResponseMessage {
    let output = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice::<Value>(body).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(body).into_owned())
        }))
    };

    if status == StatusCode::OK {
        request.create_response(output, None)
    } else if status.is_success() {
        request.create_progress(RequestStatus::Pending, output)
    } else {
        let detail = match output {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let err = if detail.is_empty() {
            format!("request failed: {status}")
        } else {
            format!("request failed: {status}: {detail}")
        };
        request.create_response(None, Some(err))
    }
}

impl Drop for HttpSseTransport {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[async_trait]
impl Transport for HttpSseTransport {
    fn name(&self) -> &'static str {
        "http-sse"
    }

    fn address_tokens(&self) -> AddressTokens {
        AddressTokens::HTTP
    }

    async fn connect(&self, credentials: &Credentials) -> HubResult<Option<String>> {
        let inner = &self.inner;
        let token = match credentials {
            Credentials::Token { token, .. } => token.clone(),
            Credentials::Password {
                client_id,
                password,
            } => {
                let login = auth::login(&inner.http, &inner.base_url, client_id, password);
                tokio::time::timeout(inner.connect_timeout, login)
                    .await
                    .map_err(|_| HubError::connection_failed("login timed out"))??
            }
            Credentials::Anonymous { .. } => {
                return Err(HubError::unauthorized(
                    "the HTTP transport requires a password or token",
                ))
            }
        };

        let response = self.open_stream(&token).await?;
        *inner.token.write() = Some(token.clone());
        inner.connected.store(true, Ordering::SeqCst);

        info!(
            client_id = %inner.client_id,
            connection_id = %inner.connection_id,
            url = %inner.sse_url,
            "SSE return channel open"
        );

        let reader_inner = inner.clone();
        let span = crate::transport_span!(transport = "http-sse", client_id = %inner.client_id);
        let handle = tokio::spawn(read_stream(reader_inner, response).instrument(span));
        if let Some(previous) = inner.reader.lock().replace(handle) {
            previous.abort();
        }
        Ok(Some(token))
    }

    async fn disconnect(&self) {
        let inner = &self.inner;
        inner.connected.store(false, Ordering::SeqCst);
        inner.shutdown.cancel();
        let reader = inner.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
        debug!(connection_id = %inner.connection_id, "HTTP transport disconnected");
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn send_request(
        &self,
        request: &RequestMessage,
        timeout: Duration,
    ) -> HubResult<Option<ResponseMessage>> {
        let form = self
            .inner
            .forms
            .as_ref()
            .and_then(|f| f.get_form(&request.operation, &request.thing_id, &request.name));
        if let Some(form) = form {
            return self.send_form_request(request, form, timeout).await;
        }

        let body = request.to_json()?;
        let response = self
            .inner
            .post_envelope(REQUEST_PATH, body, &request.correlation_id, timeout)
            .await?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| HubError::connection_failed(format!("reading reply failed: {e}")))?;

        // Anything but a 200 with a body is an ack; the answer follows on SSE
        if status != StatusCode::OK || body.is_empty() {
            return Ok(None);
        }
        let mut reply = ResponseMessage::from_json(&body)?;
        if reply.correlation_id.is_empty() {
            reply.correlation_id = request.correlation_id.clone();
        }
        Ok(Some(reply))
    }

    async fn send_response(&self, response: &ResponseMessage) -> HubResult<()> {
        self.inner.post_response(response).await
    }

    async fn send_notification(&self, notification: &NotificationMessage) -> HubResult<()> {
        let body = notification.to_json()?;
        let correlation_id = notification.correlation_id.clone().unwrap_or_default();
        self.inner
            .post_envelope(
                NOTIFICATION_PATH,
                body,
                &correlation_id,
                self.inner.request_timeout,
            )
            .await?;
        Ok(())
    }

    fn subscription_mode(&self) -> SubscriptionMode {
        SubscriptionMode::HubRequest
    }

    async fn subscribe(&self, _subscription: &Subscription) -> HubResult<()> {
        Ok(())
    }

    async fn unsubscribe(&self, _subscription: &Subscription) -> HubResult<()> {
        Ok(())
    }

    /// Requests for this client are routed to its SSE stream by the hub
    async fn serve_requests(&self, _agent_id: &str) -> HubResult<()> {
        Ok(())
    }

    async fn refresh_token(&self) -> HubResult<String> {
        let old = self.inner.current_token()?;
        let token =
            auth::refresh(&self.inner.http, &self.inner.base_url, &self.inner.client_id, &old)
                .await?;
        *self.inner.token.write() = Some(token.clone());
        info!(client_id = %self.inner.client_id, "Session token refreshed");
        Ok(token)
    }

    async fn logout(&self) -> HubResult<()> {
        let token = self.inner.current_token()?;
        auth::logout(&self.inner.http, &self.inner.base_url, &token).await?;
        *self.inner.token.write() = None;
        Ok(())
    }
}

async fn read_stream(inner: Arc<HttpInner>, response: reqwest::Response) {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();

    let reason = loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    let mut closed = false;
                    for item in decoder.feed(&bytes) {
                        match item {
                            SseItem::Event(event) => {
                                if !handle_event(&inner, event) {
                                    closed = true;
                                    break;
                                }
                            }
                            SseItem::Oversized { size } => {
                                error!(size, "SSE event exceeds the size limit, dropped");
                            }
                        }
                    }
                    if closed {
                        break "closed by hub".to_string();
                    }
                }
                Some(Err(e)) => break format!("SSE stream error: {e}"),
                None => break "SSE stream ended".to_string(),
            }
        }
    };

    inner.connected.store(false, Ordering::SeqCst);
    if inner.shutdown.is_cancelled() {
        return;
    }
    warn!(connection_id = %inner.connection_id, reason = %reason, "SSE return channel lost");
    let _ = inner.events.send(TransportEvent::Closed { reason });
}

/// Route one SSE event; returns false when the hub closes the stream
fn handle_event(inner: &Arc<HttpInner>, event: SseEvent) -> bool {
    match event.event.as_str() {
        EVENT_PING => {}
        EVENT_CLOSE => return false,
        MESSAGE_TYPE_REQUEST => handle_request(inner, event.data.as_bytes()),
        MESSAGE_TYPE_RESPONSE => match ResponseMessage::from_json(event.data.as_bytes()) {
            Ok(response) => {
                inner.dispatcher.on_response(response);
            }
            Err(e) => warn!(error = %e, "Malformed response on SSE stream"),
        },
        other => match Envelope::from_json(event.data.as_bytes()) {
            Ok(Envelope::Request(_)) => handle_request(inner, event.data.as_bytes()),
            Ok(Envelope::Response(response)) => {
                inner.dispatcher.on_response(response);
            }
            Ok(Envelope::Notification(notification)) => {
                inner.dispatcher.on_notification(notification);
            }
            Err(e) => warn!(event = %other, error = %e, "Malformed message on SSE stream"),
        },
    }
    true
}

fn handle_request(inner: &Arc<HttpInner>, payload: &[u8]) {
    let inner = inner.clone();
    match RequestMessage::from_json(payload) {
        Ok(request) => {
            tokio::spawn(async move {
                let response = inner.dispatcher.on_request(request).await;
                post_reply(&inner, response).await;
            });
        }
        Err(e) => {
            warn!(error = %e, "Malformed request on SSE stream");
            if let Some(response) = malformed_request_reply(payload, &e) {
                tokio::spawn(async move {
                    post_reply(&inner, response).await;
                });
            }
        }
    }
}

async fn post_reply(inner: &HttpInner, response: ResponseMessage) {
    if let Err(e) = inner.post_response(&response).await {
        warn!(
            correlation_id = %response.correlation_id,
            error = %e,
            "Failed to send response"
        );
    }
}
