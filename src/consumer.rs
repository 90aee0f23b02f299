//! Consumer facade
//!
//! Invokes actions, reads and writes properties and subscribes to events of
//! Things this process does not own. Every call goes through the shared
//! [`HubConnection`], so the same code works over HTTP+SSE, MQTT and NATS.

use crate::config::{ClientConfig, Credentials};
use crate::connection::{ConnectionStatus, HubConnection, RequestOptions};
use crate::error::HubResult;
use crate::protocol::{
    new_correlation_id, NotificationMessage, RequestMessage, ResponseMessage, OP_INVOKE_ACTION,
    OP_PING, OP_QUERY_ACTION, OP_READ_ALL_PROPERTIES, OP_READ_PROPERTY, OP_WRITE_PROPERTY,
};
use crate::transport::Subscription;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Correlation ID prefix of calls made through [`Consumer::rpc`]
pub const RPC_PREFIX: &str = "rpc-";

#[derive(Clone)]
pub struct Consumer {
    connection: Arc<HubConnection>,
}

impl Consumer {
    pub fn new(config: ClientConfig) -> HubResult<Self> {
        Ok(Self::from_connection(Arc::new(HubConnection::new(config)?)))
    }

    /// Share an existing connection, for example with an [`crate::Agent`]
    pub fn from_connection(connection: Arc<HubConnection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<HubConnection> {
        &self.connection
    }

    pub async fn connect(&self, credentials: Credentials) -> HubResult<()> {
        self.connection.connect(credentials).await
    }

    pub async fn connect_with_config(&self) -> HubResult<()> {
        self.connection.connect_with_config().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn set_connect_handler<F>(&self, handler: F)
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.connection.set_connect_handler(Some(Arc::new(handler)));
    }

    /// Handler for events and property updates; the last registration wins
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(NotificationMessage) + Send + Sync + 'static,
    {
        self.connection
            .dispatcher()
            .set_notification_handler(Some(Arc::new(handler)));
    }

    /// Handler for responses of fire-and-forget requests and for responses
    /// that match no pending call
    pub fn set_response_handler<F>(&self, handler: F)
    where
        F: Fn(ResponseMessage) + Send + Sync + 'static,
    {
        self.connection
            .dispatcher()
            .set_response_handler(Some(Arc::new(handler)));
    }

    /// Number of calls waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.connection.registry().len()
    }

    /// Send a request and wait for the terminal response.
    ///
    /// A `failed` response is returned as data, not as an error.
    pub async fn send_request(&self, request: RequestMessage) -> HubResult<ResponseMessage> {
        self.connection
            .send_request(request, RequestOptions::default())
            .await
    }

    pub async fn send_request_with(
        &self,
        request: RequestMessage,
        options: RequestOptions,
    ) -> HubResult<ResponseMessage> {
        self.connection.send_request(request, options).await
    }

    /// Send without waiting; the response goes to the response handler
    pub async fn send_request_nowait(&self, request: RequestMessage) -> HubResult<String> {
        self.connection.send_request_nowait(request).await
    }

    pub async fn invoke_action(
        &self,
        thing_id: &str,
        name: &str,
        input: Option<Value>,
    ) -> HubResult<ResponseMessage> {
        self.send_request(RequestMessage::new(OP_INVOKE_ACTION, thing_id, name, input))
            .await
    }

    /// Invoke an action and decode its output; a failure becomes an error
    pub async fn rpc<T: DeserializeOwned>(
        &self,
        thing_id: &str,
        name: &str,
        input: Option<Value>,
    ) -> HubResult<T> {
        let correlation_id = format!("{RPC_PREFIX}{}", new_correlation_id());
        let request = RequestMessage::new(OP_INVOKE_ACTION, thing_id, name, input)
            .with_correlation_id(correlation_id);
        self.send_request(request).await?.decode()
    }

    /// Current progress of an action invocation
    pub async fn query_action(&self, thing_id: &str, name: &str) -> HubResult<ResponseMessage> {
        self.send_request(RequestMessage::new(OP_QUERY_ACTION, thing_id, name, None))
            .await
    }

    pub async fn write_property(&self, thing_id: &str, name: &str, value: Value) -> HubResult<()> {
        let request = RequestMessage::new(OP_WRITE_PROPERTY, thing_id, name, Some(value));
        self.send_request(request).await?.into_output()?;
        Ok(())
    }

    pub async fn read_property(&self, thing_id: &str, name: &str) -> HubResult<Value> {
        let request = RequestMessage::new(OP_READ_PROPERTY, thing_id, name, None);
        let output = self.send_request(request).await?.into_output()?;
        Ok(output.unwrap_or(Value::Null))
    }

    /// All property values of a Thing as a JSON object
    pub async fn read_all_properties(&self, thing_id: &str) -> HubResult<Value> {
        let request = RequestMessage::new(OP_READ_ALL_PROPERTIES, thing_id, "", None);
        let output = self.send_request(request).await?.into_output()?;
        Ok(output.unwrap_or(Value::Null))
    }

    /// Round trip to the hub
    pub async fn ping(&self) -> HubResult<Duration> {
        let started = Instant::now();
        self.send_request(RequestMessage::new(OP_PING, "", "", None))
            .await?
            .into_output()?;
        let elapsed = started.elapsed();
        debug!(elapsed_ms = elapsed.as_millis() as u64, "Ping answered");
        Ok(elapsed)
    }

    /// Subscribe to an event; an empty `name` means all events of the Thing
    pub async fn subscribe(&self, thing_id: &str, name: &str) -> HubResult<()> {
        self.connection
            .subscribe(Subscription::event(thing_id, name))
            .await
    }

    pub async fn unsubscribe(&self, thing_id: &str, name: &str) -> HubResult<()> {
        self.connection
            .unsubscribe(Subscription::event(thing_id, name))
            .await
    }

    /// Observe a property; an empty `name` means all properties of the Thing
    pub async fn observe_property(&self, thing_id: &str, name: &str) -> HubResult<()> {
        self.connection
            .subscribe(Subscription::property(thing_id, name))
            .await
    }

    pub async fn unobserve_property(&self, thing_id: &str, name: &str) -> HubResult<()> {
        self.connection
            .unsubscribe(Subscription::property(thing_id, name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubError;
    use crate::testing::MockHub;
    use serde_json::json;

    fn token() -> Credentials {
        Credentials::Token {
            client_id: "consumer1".to_string(),
            token: "t".to_string(),
        }
    }

    #[tokio::test]
    async fn test_rpc_uses_prefixed_correlation_id() {
        let hub = MockHub::new();
        hub.reply_completed(Some(json!({"on": true})));
        let consumer = Consumer::from_connection(Arc::new(hub.connection("consumer1")));
        consumer.connect(token()).await.unwrap();

        let output: Value = consumer.rpc("dtw:a:lamp1", "toggle", None).await.unwrap();

        assert_eq!(output["on"], json!(true));
        assert!(hub.requests()[0].correlation_id.starts_with(RPC_PREFIX));
    }

    #[tokio::test]
    async fn test_write_property_failure_is_application_error() {
        let hub = MockHub::new();
        hub.reply_failed("read-only");
        let consumer = Consumer::from_connection(Arc::new(hub.connection("consumer1")));
        consumer.connect(token()).await.unwrap();

        let result = consumer.write_property("dtw:a:lamp1", "name", json!("x")).await;

        assert!(matches!(result, Err(HubError::Application(e)) if e == "read-only"));
        assert_eq!(consumer.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_read_all_properties_has_no_name() {
        let hub = MockHub::new();
        hub.reply_completed(Some(json!({"on": false, "level": 3})));
        let consumer = Consumer::from_connection(Arc::new(hub.connection("consumer1")));
        consumer.connect(token()).await.unwrap();

        let values = consumer.read_all_properties("dtw:a:lamp1").await.unwrap();

        assert_eq!(values["level"], json!(3));
        let sent = &hub.requests()[0];
        assert_eq!(sent.operation, OP_READ_ALL_PROPERTIES);
        assert!(sent.name.is_empty());
        assert_eq!(sent.sender_id, "consumer1");
    }
}
