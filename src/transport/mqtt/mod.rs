//! MQTT v5 transport
//!
//! Split the same way as the rest of the adapters: pure parts are testable
//! without a broker.
//!
//! - [`connection`] - broker options and per-connection instance IDs
//! - [`message_handler`] - event routing and payload decoding
//! - [`client`] - the adapter and its event loop

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttTransport;
pub use connection::{configure_mqtt_options, instance_id};
pub use message_handler::{EventRoute, MessageHandler, ERROR_PROPERTY};
