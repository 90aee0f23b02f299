//! Pure routing and payload handling for MQTT events
//!
//! Nothing here touches the network; the client feeds events in and acts on
//! the [`EventRoute`] that comes out.

use crate::error::{HubError, HubResult};
use crate::protocol::{AddressTokens, RequestMessage, RequestStatus, ResponseMessage};
use crate::transport::dispatch::decode_addressed_request;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, PublishProperties};
use rumqttc::v5::{ConnectionError, Event};

/// User property carrying the error text of a failed reply
pub const ERROR_PROPERTY: &str = "error";

/// Routing decision for one MQTT event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    ConnectionRejected(String),
    /// Reply delivered to this session's inbox
    Response {
        payload: Bytes,
        correlation_data: Option<Bytes>,
        error: Option<String>,
    },
    /// Request from a consumer; reply goes to `response_topic`
    Request {
        topic: String,
        payload: Bytes,
        response_topic: String,
        correlation_data: Option<Bytes>,
    },
    Notification {
        topic: String,
        payload: Bytes,
    },
    Disconnected,
    /// Acks, pings and outgoing traffic
    Ignored,
}

pub struct MessageHandler;

impl MessageHandler {
    /// Classify an event received from the event loop
    pub fn route_mqtt_event(event: &Event, tokens: &AddressTokens) -> EventRoute {
        let Event::Incoming(packet) = event else {
            return EventRoute::Ignored;
        };
        match packet {
            Packet::ConnAck(ack) => {
                if ack.code == ConnectReturnCode::Success {
                    EventRoute::ConnectionAcknowledged
                } else {
                    EventRoute::ConnectionRejected(format!("{:?}", ack.code))
                }
            }
            Packet::Publish(publish) => {
                let topic = String::from_utf8_lossy(&publish.topic).to_string();
                let properties = publish.properties.as_ref();
                let correlation_data = properties.and_then(|p| p.correlation_data.clone());

                if tokens.is_inbox(&topic) {
                    return EventRoute::Response {
                        payload: publish.payload.clone(),
                        correlation_data,
                        error: properties.and_then(Self::error_property),
                    };
                }
                match properties.and_then(|p| p.response_topic.clone()) {
                    Some(response_topic) => EventRoute::Request {
                        topic,
                        payload: publish.payload.clone(),
                        response_topic,
                        correlation_data,
                    },
                    None => EventRoute::Notification {
                        topic,
                        payload: publish.payload.clone(),
                    },
                }
            }
            Packet::Disconnect(_) => EventRoute::Disconnected,
            _ => EventRoute::Ignored,
        }
    }

    /// True when a connection error means the broker refused our credentials
    pub fn is_auth_rejection(error: &ConnectionError) -> bool {
        matches!(
            error,
            ConnectionError::ConnectionRefused(
                ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword
            )
        )
    }

    /// Map an event loop error to the crate error
    pub fn map_connection_error(error: &ConnectionError) -> HubError {
        if Self::is_auth_rejection(error) {
            HubError::unauthorized(format!("broker refused credentials: {error}"))
        } else {
            HubError::connection_failed(error.to_string())
        }
    }

    fn error_property(properties: &PublishProperties) -> Option<String> {
        properties
            .user_properties
            .iter()
            .find(|(key, _)| key == ERROR_PROPERTY)
            .map(|(_, value)| value.clone())
    }

    /// Decode a reply, filling what the envelope left out from MQTT properties
    pub fn decode_response(
        payload: &[u8],
        correlation_data: Option<&Bytes>,
        error: Option<String>,
    ) -> HubResult<ResponseMessage> {
        let mut response = ResponseMessage::from_json(payload)?;
        if response.correlation_id.is_empty() {
            if let Some(data) = correlation_data {
                response.correlation_id = String::from_utf8_lossy(data).to_string();
            }
        }
        if response.correlation_id.is_empty() {
            return Err(HubError::protocol("reply without correlation ID"));
        }
        if let Some(error) = error {
            if response.error.is_none() {
                response.error = Some(error);
            }
            response.status = RequestStatus::Failed;
        }
        Ok(response)
    }

    /// Decode an inbound request; missing fields come from the topic
    pub fn decode_request(
        topic: &str,
        payload: &[u8],
        correlation_data: Option<&Bytes>,
        tokens: &AddressTokens,
    ) -> HubResult<RequestMessage> {
        let mut request = decode_addressed_request(topic, payload, tokens)?;
        if request.correlation_id.is_empty() {
            if let Some(data) = correlation_data {
                request.correlation_id = String::from_utf8_lossy(data).to_string();
            }
        }
        Ok(request)
    }

    /// Properties of a request: where to reply and how to match it
    pub fn request_properties(inbox: &str, correlation_id: &str) -> PublishProperties {
        PublishProperties {
            response_topic: Some(inbox.to_string()),
            correlation_data: Some(Bytes::copy_from_slice(correlation_id.as_bytes())),
            content_type: Some("application/json".to_string()),
            ..Default::default()
        }
    }

    /// Properties of a reply; a failed reply carries the `error` user property
    pub fn reply_properties(
        response: &ResponseMessage,
        correlation_data: Option<Bytes>,
    ) -> PublishProperties {
        let mut properties = PublishProperties {
            correlation_data: correlation_data
                .or_else(|| Some(Bytes::copy_from_slice(response.correlation_id.as_bytes()))),
            content_type: Some("application/json".to_string()),
            ..Default::default()
        };
        if let Some(error) = &response.error {
            properties
                .user_properties
                .push((ERROR_PROPERTY.to_string(), error.clone()));
        }
        properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NotificationMessage, OP_INVOKE_ACTION, OP_PUBLISH_EVENT};
    use rumqttc::v5::mqttbytes::v5::{ConnAck, Publish};
    use rumqttc::v5::mqttbytes::QoS;
    use serde_json::json;

    const TOKENS: AddressTokens = AddressTokens::MQTT;

    fn publish(
        topic: &'static str,
        payload: Vec<u8>,
        properties: Option<PublishProperties>,
    ) -> Event {
        Event::Incoming(Packet::Publish(Publish::new(
            topic,
            QoS::AtLeastOnce,
            payload,
            properties,
        )))
    }

    #[test]
    fn test_connack_routes() {
        let ok = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&ok, &TOKENS),
            EventRoute::ConnectionAcknowledged
        );

        let denied = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&denied, &TOKENS),
            EventRoute::ConnectionRejected(_)
        ));
    }

    #[test]
    fn test_inbox_publish_is_response() {
        let props = PublishProperties {
            correlation_data: Some(Bytes::from_static(b"c-1")),
            user_properties: vec![(ERROR_PROPERTY.to_string(), "boom".to_string())],
            ..Default::default()
        };
        let event = publish("_INBOX/me-1", b"{}".to_vec(), Some(props));

        match MessageHandler::route_mqtt_event(&event, &TOKENS) {
            EventRoute::Response {
                correlation_data,
                error,
                ..
            } => {
                assert_eq!(correlation_data, Some(Bytes::from_static(b"c-1")));
                assert_eq!(error.as_deref(), Some("boom"));
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn test_request_and_notification_routes() {
        let props = MessageHandler::request_properties("_INBOX/c-1", "r-1");
        let request = publish("invoke-action/agent1/_/toggle/c", b"{}".to_vec(), Some(props));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&request, &TOKENS),
            EventRoute::Request { response_topic, .. } if response_topic == "_INBOX/c-1"
        ));

        let event = publish("publish-event/agent1/lamp/switched/agent1", b"{}".to_vec(), None);
        assert!(matches!(
            MessageHandler::route_mqtt_event(&event, &TOKENS),
            EventRoute::Notification { .. }
        ));
    }

    #[test]
    fn test_decode_response_uses_correlation_data_and_error() {
        let payload = json!({"messageType": "response", "operation": OP_INVOKE_ACTION, "status": "completed"});
        let data = Bytes::from_static(b"c-9");

        let response = MessageHandler::decode_response(
            payload.to_string().as_bytes(),
            Some(&data),
            Some("denied".to_string()),
        )
        .unwrap();

        assert_eq!(response.correlation_id, "c-9");
        assert_eq!(response.status, RequestStatus::Failed);
        assert_eq!(response.error.as_deref(), Some("denied"));
    }

    #[test]
    fn test_decode_response_without_any_correlation_fails() {
        let payload = json!({"messageType": "response", "status": "completed"});
        assert!(MessageHandler::decode_response(payload.to_string().as_bytes(), None, None).is_err());
    }

    #[test]
    fn test_decode_request_fills_from_topic() {
        let payload = json!({
            "messageType": "request",
            "operation": OP_INVOKE_ACTION,
            "input": 5,
            "correlationID": "r-2"
        });
        let request = MessageHandler::decode_request(
            "invoke-action/agent1/dtw:agent1:lamp/dim/consumer1",
            payload.to_string().as_bytes(),
            None,
            &TOKENS,
        )
        .unwrap();
        assert_eq!(request.correlation_id, "r-2");
        assert_eq!(request.thing_id, "dtw:agent1:lamp");
        assert_eq!(request.name, "dim");
        assert_eq!(request.sender_id, "consumer1");
        assert_eq!(request.input, Some(json!(5)));
    }

    #[test]
    fn test_decode_notification() {
        let n = NotificationMessage::new(OP_PUBLISH_EVENT, "dtw:a:lamp", "switched", Some(json!(1)));
        let decoded = crate::transport::dispatch::decode_addressed_notification(
            "publish-event/a/dtw:a:lamp/switched/a",
            &n.to_json().unwrap(),
            &TOKENS,
        )
        .unwrap();
        assert_eq!(decoded.data, Some(json!(1)));
        assert_eq!(decoded.sender_id, "a");
    }

    #[test]
    fn test_reply_properties_carry_error() {
        let request = RequestMessage::new(OP_INVOKE_ACTION, "t", "a", None).with_correlation_id("r-3");
        let failed = request.create_response(None, Some("nope".to_string()));

        let props = MessageHandler::reply_properties(&failed, None);

        assert_eq!(props.correlation_data, Some(Bytes::from_static(b"r-3")));
        assert_eq!(
            props.user_properties,
            vec![(ERROR_PROPERTY.to_string(), "nope".to_string())]
        );
    }

    #[test]
    fn test_auth_rejection() {
        let err = ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword);
        assert!(MessageHandler::is_auth_rejection(&err));
        assert!(matches!(
            MessageHandler::map_connection_error(&err),
            HubError::Unauthorized(_)
        ));
        let other = ConnectionError::ConnectionRefused(ConnectReturnCode::ServerUnavailable);
        assert!(!MessageHandler::is_auth_rejection(&other));
    }
}
