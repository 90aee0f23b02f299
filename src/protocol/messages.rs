//! Message envelopes exchanged with the hub
//!
//! Three flows exist: requests (consumer to agent), responses (agent back to
//! the requester) and notifications (events and property updates, no reply).
//! Envelopes are plain data; they are created per call and never mutated
//! after they are handed to a transport.

use crate::error::{HubError, HubResult};
use crate::protocol::operations::is_notification_operation;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const MESSAGE_TYPE_REQUEST: &str = "request";
pub const MESSAGE_TYPE_RESPONSE: &str = "response";
pub const MESSAGE_TYPE_NOTIFICATION: &str = "notification";

fn request_type() -> String {
    MESSAGE_TYPE_REQUEST.to_string()
}

fn response_type() -> String {
    MESSAGE_TYPE_RESPONSE.to_string()
}

fn notification_type() -> String {
    MESSAGE_TYPE_NOTIFICATION.to_string()
}

/// Generate a new correlation ID
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Progress of a request as reported by its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Accepted but not yet delivered to the agent
    Pending,
    /// Delivered and being processed
    Running,
    /// Finished successfully
    Completed,
    /// Delivery or processing failed
    Failed,
}

impl RequestStatus {
    /// Terminal statuses end the request; at most one is sent per correlation ID
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

impl Default for RequestStatus {
    fn default() -> Self {
        RequestStatus::Completed
    }
}

/// Request for an operation on a Thing
///
/// # Examples
/// ```
/// use hubconnect::protocol::{RequestMessage, RequestStatus, OP_INVOKE_ACTION};
/// use serde_json::json;
///
/// let req = RequestMessage::new(OP_INVOKE_ACTION, "dtw:lamp1", "toggle", None)
///     .with_correlation_id("c-1");
/// let resp = req.create_response(Some(json!({"on": true})), None);
/// assert_eq!(resp.correlation_id, "c-1");
/// assert_eq!(resp.status, RequestStatus::Completed);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestMessage {
    #[serde(rename = "messageType", default = "request_type")]
    pub message_type: String,
    pub operation: String,
    #[serde(rename = "thingID", default)]
    pub thing_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Set by the sender when empty; unique for the lifetime of the pending call
    #[serde(rename = "correlationID", default)]
    pub correlation_id: String,
    #[serde(rename = "senderID", default)]
    pub sender_id: String,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
}

impl RequestMessage {
    pub fn new(
        operation: impl Into<String>,
        thing_id: impl Into<String>,
        name: impl Into<String>,
        input: Option<Value>,
    ) -> Self {
        Self {
            message_type: request_type(),
            operation: operation.into(),
            thing_id: thing_id.into(),
            name: name.into(),
            input,
            correlation_id: String::new(),
            sender_id: String::new(),
            created: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    /// Generate a correlation ID if the request has none and return it
    pub fn ensure_correlation_id(&mut self) -> &str {
        if self.correlation_id.is_empty() {
            self.correlation_id = new_correlation_id();
        }
        &self.correlation_id
    }

    /// Derive the terminal response for this request.
    ///
    /// The status is `completed` without an error and `failed` with one.
    pub fn create_response(&self, output: Option<Value>, error: Option<String>) -> ResponseMessage {
        let status = if error.is_some() {
            RequestStatus::Failed
        } else {
            RequestStatus::Completed
        };
        ResponseMessage {
            message_type: response_type(),
            operation: self.operation.clone(),
            thing_id: self.thing_id.clone(),
            name: self.name.clone(),
            output,
            error,
            status,
            correlation_id: self.correlation_id.clone(),
            sender_id: String::new(),
            updated: Utc::now(),
        }
    }

    /// Derive an intermediate `pending` or `running` response
    pub fn create_progress(&self, status: RequestStatus, output: Option<Value>) -> ResponseMessage {
        let mut resp = self.create_response(output, None);
        resp.status = status;
        resp
    }

    pub fn to_json(&self) -> HubResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(HubError::Serialization)
    }

    pub fn from_json(payload: &[u8]) -> HubResult<Self> {
        serde_json::from_slice(payload).map_err(HubError::Serialization)
    }
}

/// Answer to a [`RequestMessage`]
///
/// Zero or more `pending`/`running` responses may precede the single terminal
/// one. An application failure is carried in `error` and is not a transport
/// error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseMessage {
    #[serde(rename = "messageType", default = "response_type")]
    pub message_type: String,
    #[serde(default)]
    pub operation: String,
    #[serde(rename = "thingID", default)]
    pub thing_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub status: RequestStatus,
    #[serde(rename = "correlationID", default)]
    pub correlation_id: String,
    #[serde(rename = "senderID", default)]
    pub sender_id: String,
    #[serde(default = "Utc::now")]
    pub updated: DateTime<Utc>,
}

impl ResponseMessage {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_failed(&self) -> bool {
        self.status == RequestStatus::Failed
    }

    /// Decode the output into a typed value.
    ///
    /// A failed response yields [`HubError::Application`].
    pub fn decode<T: DeserializeOwned>(&self) -> HubResult<T> {
        if let Some(err) = self.application_error() {
            return Err(HubError::Application(err));
        }
        let value = self.output.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(HubError::Serialization)
    }

    /// Take the output, turning an application failure into an error
    pub fn into_output(self) -> HubResult<Option<Value>> {
        match self.application_error() {
            Some(err) => Err(HubError::Application(err)),
            None => Ok(self.output),
        }
    }

    fn application_error(&self) -> Option<String> {
        match (&self.error, self.status) {
            (Some(err), _) => Some(err.clone()),
            (None, RequestStatus::Failed) => Some("request failed".to_string()),
            _ => None,
        }
    }

    pub fn to_json(&self) -> HubResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(HubError::Serialization)
    }

    /// Parse a response; a response that carries an error but no explicit
    /// status is treated as failed.
    pub fn from_json(payload: &[u8]) -> HubResult<Self> {
        let value: Value = serde_json::from_slice(payload).map_err(HubError::Serialization)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> HubResult<Self> {
        let has_status = value.get("status").is_some();
        let mut resp: ResponseMessage =
            serde_json::from_value(value).map_err(HubError::Serialization)?;
        if !has_status && resp.error.is_some() {
            resp.status = RequestStatus::Failed;
        }
        Ok(resp)
    }
}

/// Event or property update pushed to subscribers; never answered
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationMessage {
    #[serde(rename = "messageType", default = "notification_type")]
    pub message_type: String,
    pub operation: String,
    #[serde(rename = "thingID", default)]
    pub thing_id: String,
    #[serde(default)]
    pub name: String,
    /// Any JSON value; `None` for parameterless events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "senderID", default)]
    pub sender_id: String,
    #[serde(
        rename = "correlationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
}

impl NotificationMessage {
    pub fn new(
        operation: impl Into<String>,
        thing_id: impl Into<String>,
        name: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            message_type: notification_type(),
            operation: operation.into(),
            thing_id: thing_id.into(),
            name: name.into(),
            data,
            sender_id: String::new(),
            correlation_id: None,
            created: Utc::now(),
        }
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    pub fn to_json(&self) -> HubResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(HubError::Serialization)
    }

    pub fn from_json(payload: &[u8]) -> HubResult<Self> {
        serde_json::from_slice(payload).map_err(HubError::Serialization)
    }
}

/// Any of the three envelopes, for channels that carry all of them
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(RequestMessage),
    Response(ResponseMessage),
    Notification(NotificationMessage),
}

impl Envelope {
    /// Decode an envelope using its `messageType`.
    ///
    /// Without a `messageType`, a message with a status, output or error is a
    /// response, a notification operation is a notification, and anything
    /// else is a request.
    pub fn from_json(payload: &[u8]) -> HubResult<Self> {
        let value: Value = serde_json::from_slice(payload).map_err(HubError::Serialization)?;
        if !value.is_object() {
            return Err(HubError::Protocol(
                "message envelope is not a JSON object".to_string(),
            ));
        }
        let message_type = match value.get("messageType").and_then(Value::as_str) {
            Some(t) => t.to_string(),
            None => Self::infer_type(&value).to_string(),
        };
        match message_type.as_str() {
            MESSAGE_TYPE_RESPONSE => Ok(Envelope::Response(ResponseMessage::from_value(value)?)),
            MESSAGE_TYPE_NOTIFICATION => Ok(Envelope::Notification(
                serde_json::from_value(value).map_err(HubError::Serialization)?,
            )),
            MESSAGE_TYPE_REQUEST => Ok(Envelope::Request(
                serde_json::from_value(value).map_err(HubError::Serialization)?,
            )),
            other => Err(HubError::Protocol(format!(
                "unknown message type '{other}'"
            ))),
        }
    }

    fn infer_type(value: &Value) -> &'static str {
        if value.get("status").is_some()
            || value.get("output").is_some()
            || value.get("error").is_some()
        {
            return MESSAGE_TYPE_RESPONSE;
        }
        let operation = value.get("operation").and_then(Value::as_str).unwrap_or("");
        if is_notification_operation(operation) {
            MESSAGE_TYPE_NOTIFICATION
        } else {
            MESSAGE_TYPE_REQUEST
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => Some(r.correlation_id.as_str()),
            Envelope::Response(r) => Some(r.correlation_id.as_str()),
            Envelope::Notification(n) => n.correlation_id.as_deref(),
        }
        .filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::operations::{OP_INVOKE_ACTION, OP_PUBLISH_EVENT, OP_WRITE_PROPERTY};
    use serde_json::json;

    #[test]
    fn test_create_response_completed() {
        let req = RequestMessage::new(OP_INVOKE_ACTION, "dtw:lamp1", "toggle", None)
            .with_correlation_id("c-42");

        let resp = req.create_response(Some(json!({"on": true})), None);

        assert_eq!(resp.correlation_id, "c-42");
        assert_eq!(resp.operation, OP_INVOKE_ACTION);
        assert_eq!(resp.thing_id, "dtw:lamp1");
        assert_eq!(resp.name, "toggle");
        assert_eq!(resp.status, RequestStatus::Completed);
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_create_response_failed() {
        let req = RequestMessage::new(OP_WRITE_PROPERTY, "dtw:lamp1", "level", Some(json!(5)));

        let resp = req.create_response(None, Some("out of range".to_string()));

        assert_eq!(resp.status, RequestStatus::Failed);
        assert_eq!(resp.error.as_deref(), Some("out of range"));
        assert!(resp.is_terminal());
    }

    #[test]
    fn test_create_progress_is_not_terminal() {
        let req = RequestMessage::new(OP_INVOKE_ACTION, "t", "a", None);
        let resp = req.create_progress(RequestStatus::Running, None);
        assert_eq!(resp.status, RequestStatus::Running);
        assert!(!resp.is_terminal());
    }

    #[test]
    fn test_ensure_correlation_id_generates_once() {
        let mut req = RequestMessage::new(OP_INVOKE_ACTION, "t", "a", None);
        let first = req.ensure_correlation_id().to_string();
        assert!(!first.is_empty());
        let second = req.ensure_correlation_id().to_string();
        assert_eq!(first, second);

        let mut preset = RequestMessage::new(OP_INVOKE_ACTION, "t", "a", None)
            .with_correlation_id("mine");
        assert_eq!(preset.ensure_correlation_id(), "mine");
    }

    #[test]
    fn test_wire_field_names() {
        let req = RequestMessage::new(OP_INVOKE_ACTION, "dtw:lamp1", "toggle", None)
            .with_correlation_id("c-1")
            .with_sender("consumer1");
        let value = serde_json::to_value(&req).unwrap();

        assert_eq!(value["thingID"], "dtw:lamp1");
        assert_eq!(value["correlationID"], "c-1");
        assert_eq!(value["senderID"], "consumer1");
        assert_eq!(value["messageType"], "request");
        assert!(value.get("input").is_none(), "absent input is omitted");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(RequestStatus::Running).unwrap(),
            json!("running")
        );
        let status: RequestStatus = serde_json::from_value(json!("failed")).unwrap();
        assert_eq!(status, RequestStatus::Failed);
    }

    #[test]
    fn test_response_without_status_and_error_is_failed() {
        let resp = ResponseMessage::from_json(br#"{"correlationID":"x","error":"boom"}"#).unwrap();
        assert_eq!(resp.status, RequestStatus::Failed);

        let resp = ResponseMessage::from_json(br#"{"correlationID":"x","output":1}"#).unwrap();
        assert_eq!(resp.status, RequestStatus::Completed);
    }

    #[test]
    fn test_decode_output_and_application_error() {
        let req = RequestMessage::new(OP_INVOKE_ACTION, "t", "a", None);

        let ok = req.create_response(Some(json!({"on": true})), None);
        let value: serde_json::Value = ok.decode().unwrap();
        assert_eq!(value["on"], true);

        let failed = req.create_response(None, Some("device offline".to_string()));
        match failed.decode::<serde_json::Value>() {
            Err(HubError::Application(msg)) => assert_eq!(msg, "device offline"),
            other => panic!("expected application error, got {other:?}"),
        }
    }

    #[test]
    fn test_notification_without_data() {
        let notif = NotificationMessage::new(OP_PUBLISH_EVENT, "dtw:lamp1", "pressed", None);
        let json = notif.to_json().unwrap();
        let parsed = NotificationMessage::from_json(&json).unwrap();
        assert_eq!(parsed.data, None);
        assert_eq!(parsed.correlation_id, None);
    }

    #[test]
    fn test_envelope_uses_message_type() {
        let notif = NotificationMessage::new(OP_PUBLISH_EVENT, "dtw:lamp1", "switched", Some(json!(true)));
        let env = Envelope::from_json(&notif.to_json().unwrap()).unwrap();
        assert!(matches!(env, Envelope::Notification(n) if n.data == Some(json!(true))));
    }

    #[test]
    fn test_envelope_infers_missing_message_type() {
        let env = Envelope::from_json(br#"{"correlationID":"c","status":"running"}"#).unwrap();
        assert!(matches!(env, Envelope::Response(_)));

        let env =
            Envelope::from_json(br#"{"operation":"publish-event","thingID":"t","name":"e"}"#)
                .unwrap();
        assert!(matches!(env, Envelope::Notification(_)));

        let env =
            Envelope::from_json(br#"{"operation":"invoke-action","thingID":"t","name":"a"}"#)
                .unwrap();
        assert!(matches!(env, Envelope::Request(_)));
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        assert!(Envelope::from_json(b"not json").is_err());
        assert!(matches!(
            Envelope::from_json(b"[1,2]"),
            Err(HubError::Protocol(_))
        ));
        assert!(matches!(
            Envelope::from_json(br#"{"messageType":"gossip"}"#),
            Err(HubError::Protocol(_))
        ));
    }
}
