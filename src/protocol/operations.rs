//! Operation vocabulary for requests and notifications
//!
//! The message model does not validate operations against this list; it is
//! a shared vocabulary for the facade, the adapters and applications.

/// Invoke an action on a Thing.
pub const OP_INVOKE_ACTION: &str = "invoke-action";
/// Query the status of a running or completed action.
pub const OP_QUERY_ACTION: &str = "query-action";
/// Write a property value.
pub const OP_WRITE_PROPERTY: &str = "write-property";
/// Read a single property value.
pub const OP_READ_PROPERTY: &str = "read-property";
/// Read all property values of a Thing.
pub const OP_READ_ALL_PROPERTIES: &str = "read-all-properties";
/// Subscribe to a single event of a Thing.
pub const OP_SUBSCRIBE_EVENT: &str = "subscribe-event";
/// Subscribe to all events of a Thing (or of all Things).
pub const OP_SUBSCRIBE_ALL_EVENTS: &str = "subscribe-all-events";
pub const OP_UNSUBSCRIBE_EVENT: &str = "unsubscribe-event";
pub const OP_UNSUBSCRIBE_ALL_EVENTS: &str = "unsubscribe-all-events";
/// Observe changes of a single property.
pub const OP_OBSERVE_PROPERTY: &str = "observe-property";
/// Observe changes of all properties.
pub const OP_OBSERVE_ALL_PROPERTIES: &str = "observe-all-properties";
pub const OP_UNOBSERVE_PROPERTY: &str = "unobserve-property";
pub const OP_UNOBSERVE_ALL_PROPERTIES: &str = "unobserve-all-properties";
/// Liveness check answered by the hub.
pub const OP_PING: &str = "ping";

/// Notification: an event was emitted.
pub const OP_PUBLISH_EVENT: &str = "publish-event";
/// Notification: a single property changed.
pub const OP_UPDATE_PROPERTY: &str = "update-property";
/// Notification: a batch of property values, keyed by property name.
pub const OP_UPDATE_MULTIPLE_PROPERTIES: &str = "update-multiple-properties";
/// Notification: a Thing Description was created or changed.
pub const OP_UPDATE_TD: &str = "update-td";

/// Request operations that an agent serves on behalf of its Things.
pub const AGENT_REQUEST_OPERATIONS: [&str; 4] = [
    OP_INVOKE_ACTION,
    OP_WRITE_PROPERTY,
    OP_READ_PROPERTY,
    OP_QUERY_ACTION,
];

/// Check whether an operation names a notification rather than a request
pub fn is_notification_operation(operation: &str) -> bool {
    matches!(
        operation,
        OP_PUBLISH_EVENT | OP_UPDATE_PROPERTY | OP_UPDATE_MULTIPLE_PROPERTIES | OP_UPDATE_TD
    )
}
