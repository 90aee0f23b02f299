//! Agent facade
//!
//! Serves requests for the Things this process owns and publishes their
//! events, property values and Thing Descriptions.

use crate::config::{ClientConfig, Credentials};
use crate::connection::{ConnectionStatus, HubConnection};
use crate::consumer::Consumer;
use crate::error::{HubError, HubResult};
use crate::protocol::{
    NotificationMessage, ResponseMessage, OP_PUBLISH_EVENT, OP_UPDATE_MULTIPLE_PROPERTIES,
    OP_UPDATE_PROPERTY, OP_UPDATE_TD,
};
use crate::transport::RequestHandler;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct Agent {
    connection: Arc<HubConnection>,
}

impl Agent {
    pub fn new(config: ClientConfig) -> HubResult<Self> {
        Ok(Self::from_connection(Arc::new(HubConnection::new(config)?)))
    }

    pub fn from_connection(connection: Arc<HubConnection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<HubConnection> {
        &self.connection
    }

    /// Consumer sharing this agent's connection
    pub fn consumer(&self) -> Consumer {
        Consumer::from_connection(self.connection.clone())
    }

    pub fn agent_id(&self) -> &str {
        self.connection.client_id()
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

    /// Install the request handler and start receiving requests.
    ///
    /// There is one handler per agent; the last registration wins. The
    /// registration is replayed after a reconnect.
    pub async fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) -> HubResult<()> {
        self.connection.dispatcher().set_request_handler(Some(handler));
        self.connection.serve_requests().await?;
        info!(agent_id = %self.agent_id(), "Serving requests");
        Ok(())
    }

    /// Requests received afterwards are answered with a failure
    pub fn clear_request_handler(&self) {
        self.connection.dispatcher().set_request_handler(None);
    }

    /// Send a response outside the handler, e.g. the terminal response after
    /// the handler acknowledged with `running`
    pub async fn send_response(&self, response: ResponseMessage) -> HubResult<()> {
        self.connection.send_response(response).await
    }

    pub async fn send_notification(&self, notification: NotificationMessage) -> HubResult<()> {
        self.connection.send_notification(notification).await
    }

    pub async fn pub_event(&self, thing_id: &str, name: &str, data: Option<Value>) -> HubResult<()> {
        self.send_notification(NotificationMessage::new(OP_PUBLISH_EVENT, thing_id, name, data))
            .await
    }

    pub async fn pub_property(&self, thing_id: &str, name: &str, value: Value) -> HubResult<()> {
        self.send_notification(NotificationMessage::new(
            OP_UPDATE_PROPERTY,
            thing_id,
            name,
            Some(value),
        ))
        .await
    }

    /// Publish several property values in one notification
    pub async fn pub_multiple_properties(
        &self,
        thing_id: &str,
        values: Map<String, Value>,
    ) -> HubResult<()> {
        self.send_notification(NotificationMessage::new(
            OP_UPDATE_MULTIPLE_PROPERTIES,
            thing_id,
            "",
            Some(Value::Object(values)),
        ))
        .await
    }

    /// Publish a Thing Description; its `id` is the notification's thingID
    pub async fn pub_td(&self, td: &Value) -> HubResult<()> {
        let thing_id = td
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| HubError::protocol("Thing Description has no id"))?;
        self.send_notification(NotificationMessage::new(
            OP_UPDATE_TD,
            thing_id,
            "",
            Some(td.clone()),
        ))
        .await
    }
}
