//! MQTT v5 adapter: request-reply over response topics and correlation data

use super::connection::{configure_mqtt_options, instance_id, CHANNEL_CAPACITY};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::{ClientConfig, Credentials};
use crate::error::{HubError, HubResult};
use crate::protocol::{
    Address, AddressTokens, NotificationMessage, RequestMessage, ResponseMessage,
    AGENT_REQUEST_OPERATIONS,
};
use crate::transport::dispatch::decode_addressed_notification;
use crate::transport::{
    malformed_request_reply, Dispatcher, ReplyRoutes, Subscription, SubscriptionMode, Transport,
    TransportEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::v5::mqttbytes::v5::PublishProperties;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

const TOKENS: AddressTokens = AddressTokens::MQTT;

/// Where the answer to an inbound request goes
#[derive(Debug, Clone)]
struct ReplyRoute {
    topic: String,
    correlation_data: Option<Bytes>,
}

struct MqttInner {
    config: Arc<ClientConfig>,
    client_id: String,
    instance_id: String,
    inbox: String,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedSender<TransportEvent>,
    client: RwLock<Option<AsyncClient>>,
    connected: AtomicBool,
    shutdown: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    reply_routes: ReplyRoutes<ReplyRoute>,
}

impl MqttInner {
    fn client(&self) -> HubResult<AsyncClient> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(HubError::NotConnected);
        }
        self.client.read().clone().ok_or(HubError::NotConnected)
    }

    async fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        properties: Option<PublishProperties>,
    ) -> HubResult<()> {
        let client = self.client()?;
        let result = match properties {
            Some(properties) => {
                client
                    .publish_with_properties(topic.clone(), QoS::AtLeastOnce, false, payload, properties)
                    .await
            }
            None => client.publish(topic.clone(), QoS::AtLeastOnce, false, payload).await,
        };
        result.map_err(|e| HubError::connection_failed(format!("publish to {topic} failed: {e}")))
    }

    async fn publish_reply(&self, route: &ReplyRoute, response: &ResponseMessage) -> HubResult<()> {
        let properties = MessageHandler::reply_properties(response, route.correlation_data.clone());
        self.publish(route.topic.clone(), response.to_json()?, Some(properties))
            .await
    }

    /// Answer a request received earlier; the route is dropped once terminal
    async fn send_reply(&self, response: &ResponseMessage) -> HubResult<()> {
        let route = self.reply_routes.route_for(response).ok_or_else(|| {
            HubError::protocol(format!(
                "no pending request '{}' to answer",
                response.correlation_id
            ))
        })?;
        self.publish_reply(&route, response).await
    }
}

/// MQTT v5 adapter.
///
/// Requests carry this session's inbox as response topic and the
/// correlation ID as correlation data; replies arrive on the inbox.
pub struct MqttTransport {
    inner: Arc<MqttInner>,
}

impl MqttTransport {
    pub fn new(
        config: Arc<ClientConfig>,
        dispatcher: Dispatcher,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> HubResult<Self> {
        let client_id = config.client.id.clone();
        let instance_id = instance_id(&client_id);
        let inbox = TOKENS.inbox(&instance_id);
        Ok(Self {
            inner: Arc::new(MqttInner {
                config,
                client_id,
                instance_id,
                inbox,
                dispatcher,
                events,
                client: RwLock::new(None),
                connected: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                event_loop: Mutex::new(None),
                reply_routes: ReplyRoutes::default(),
            }),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Topic replies to this session are published on
    pub fn inbox(&self) -> &str {
        &self.inner.inbox
    }

    async fn subscribe_filter(&self, filter: String) -> HubResult<()> {
        let client = self.inner.client()?;
        debug!(filter = %filter, "Subscribing");
        client
            .subscribe(filter.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| HubError::connection_failed(format!("subscribe to {filter} failed: {e}")))
    }

    async fn unsubscribe_filter(&self, filter: String) -> HubResult<()> {
        let client = self.inner.client()?;
        client
            .unsubscribe(filter.clone())
            .await
            .map_err(|e| HubError::connection_failed(format!("unsubscribe from {filter} failed: {e}")))
    }

    fn stop(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        let dropped = self.inner.reply_routes.clear();
        if dropped > 0 {
            debug!(dropped, "Unanswered requests dropped with the session");
        }
        if let Some(handle) = self.inner.event_loop.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn address_tokens(&self) -> AddressTokens {
        TOKENS
    }

    async fn connect(&self, credentials: &Credentials) -> HubResult<Option<String>> {
        let inner = &self.inner;
        let options = configure_mqtt_options(&inner.config, &inner.instance_id, credentials)?;
        if inner.config.hub.disable_cert_check {
            warn!("disable_cert_check is not supported by the MQTT transport, certificates are verified");
        }

        let (client, event_loop) = AsyncClient::new(options, CHANNEL_CAPACITY);
        // Queued until the session is up; the inbox must exist before any request
        client
            .subscribe(inner.inbox.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| HubError::connection_failed(format!("inbox subscribe failed: {e}")))?;
        *inner.client.write() = Some(client);

        let (ready_tx, ready_rx) = oneshot::channel();
        let span = crate::transport_span!(transport = "mqtt", client_id = %inner.client_id);
        let handle = tokio::spawn(run_event_loop(inner.clone(), event_loop, ready_tx).instrument(span));
        *inner.event_loop.lock() = Some(handle);

        let connect_timeout = inner.config.connect_timeout();
        let result = match tokio::time::timeout(connect_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HubError::connection_failed("MQTT event loop stopped")),
            Err(_) => Err(HubError::connection_failed(format!(
                "no ConnAck within {}ms",
                connect_timeout.as_millis()
            ))),
        };

        match result {
            Ok(()) => {
                info!(
                    client_id = %inner.client_id,
                    instance_id = %inner.instance_id,
                    url = %inner.config.hub.url,
                    "Connected to MQTT broker"
                );
                Ok(None)
            }
            Err(e) => {
                self.stop();
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        let client = self.inner.client.write().take();
        if let Some(client) = client {
            let _ = client.try_disconnect();
        }
        self.stop();
        debug!(instance_id = %self.inner.instance_id, "MQTT transport disconnected");
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn send_request(
        &self,
        request: &RequestMessage,
        _timeout: Duration,
    ) -> HubResult<Option<ResponseMessage>> {
        let address = Address::for_thing(
            &request.operation,
            &request.thing_id,
            &request.name,
            &self.inner.client_id,
        );
        let topic = TOKENS.publish_address(&address);
        let properties =
            MessageHandler::request_properties(&self.inner.inbox, &request.correlation_id);
        self.inner
            .publish(topic, request.to_json()?, Some(properties))
            .await?;
        Ok(None)
    }

    async fn send_response(&self, response: &ResponseMessage) -> HubResult<()> {
        self.inner.send_reply(response).await
    }

    async fn send_notification(&self, notification: &NotificationMessage) -> HubResult<()> {
        let address = Address::for_thing(
            &notification.operation,
            &notification.thing_id,
            &notification.name,
            &self.inner.client_id,
        );
        let topic = TOKENS.publish_address(&address);
        self.inner.publish(topic, notification.to_json()?, None).await
    }

    fn subscription_mode(&self) -> SubscriptionMode {
        SubscriptionMode::Broker
    }

    async fn subscribe(&self, subscription: &Subscription) -> HubResult<()> {
        for operation in subscription.notification_operations() {
            let address =
                Address::for_thing(operation, &subscription.thing_id, &subscription.name, "");
            self.subscribe_filter(TOKENS.subscribe_filter(&address))
                .await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> HubResult<()> {
        for operation in subscription.notification_operations() {
            let address =
                Address::for_thing(operation, &subscription.thing_id, &subscription.name, "");
            self.unsubscribe_filter(TOKENS.subscribe_filter(&address))
                .await?;
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
            self.subscribe_filter(TOKENS.subscribe_filter(&address))
                .await?;
        }
        Ok(())
    }
}

async fn run_event_loop(
    inner: Arc<MqttInner>,
    mut event_loop: EventLoop,
    ready: oneshot::Sender<HubResult<()>>,
) {
    let mut ready = Some(ready);

    let reason = loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            event = event_loop.poll() => event,
        };

        let event = match event {
            Ok(event) => event,
            Err(e) => {
                let err = MessageHandler::map_connection_error(&e);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(err));
                    inner.connected.store(false, Ordering::SeqCst);
                    return;
                }
                break err.to_string();
            }
        };

        match MessageHandler::route_mqtt_event(&event, &TOKENS) {
            EventRoute::ConnectionAcknowledged => {
                inner.connected.store(true, Ordering::SeqCst);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            EventRoute::ConnectionRejected(code) => {
                let err = HubError::connection_failed(format!("broker rejected connection: {code}"));
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(err));
                    inner.connected.store(false, Ordering::SeqCst);
                    return;
                }
                break err.to_string();
            }
            EventRoute::Response {
                payload,
                correlation_data,
                error,
            } => match MessageHandler::decode_response(&payload, correlation_data.as_ref(), error) {
                Ok(response) => {
                    inner.dispatcher.on_response(response);
                }
                Err(e) => warn!(error = %e, "Malformed reply on inbox"),
            },
            EventRoute::Request {
                topic,
                payload,
                response_topic,
                correlation_data,
            } => {
                let route = ReplyRoute {
                    topic: response_topic,
                    correlation_data,
                };
                tokio::spawn(handle_request(inner.clone(), topic, payload, route));
            }
            EventRoute::Notification { topic, payload } => {
                match decode_addressed_notification(&topic, &payload, &TOKENS) {
                    Ok(notification) => inner.dispatcher.on_notification(notification),
                    Err(e) => warn!(topic = %topic, error = %e, "Malformed notification"),
                }
            }
            EventRoute::Disconnected => break "broker sent DISCONNECT".to_string(),
            EventRoute::Ignored => {}
        }
    };

    inner.connected.store(false, Ordering::SeqCst);
    if inner.shutdown.is_cancelled() {
        return;
    }
    error!(instance_id = %inner.instance_id, reason = %reason, "MQTT session lost");
    let _ = inner.events.send(TransportEvent::Closed { reason });
}

async fn handle_request(inner: Arc<MqttInner>, topic: String, payload: Bytes, route: ReplyRoute) {
    let request = match MessageHandler::decode_request(
        &topic,
        &payload,
        route.correlation_data.as_ref(),
        &TOKENS,
    ) {
        Ok(request) => request,
        Err(e) => {
            warn!(topic = %topic, error = %e, "Malformed request");
            if let Some(reply) = malformed_request_reply(&payload, &e) {
                if let Err(e) = inner.publish_reply(&route, &reply).await {
                    warn!(error = %e, "Failed to reject malformed request");
                }
            }
            return;
        }
    };

    let correlation_id = request.correlation_id.clone();
    if !correlation_id.is_empty() {
        inner
            .reply_routes
            .insert(correlation_id.clone(), route.clone());
    }

    let response = inner.dispatcher.on_request(request).await;

    let result = if correlation_id.is_empty() {
        inner.publish_reply(&route, &response).await
    } else {
        inner.send_reply(&response).await
    };
    if let Err(e) = result {
        warn!(correlation_id = %correlation_id, error = %e, "Failed to send reply");
    }
}
