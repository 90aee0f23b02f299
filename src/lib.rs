//! hubconnect - transport-independent client for Thing-oriented IoT hubs
//!
//! A process connects to a hub as a **consumer** (invoke actions, read and
//! write properties, subscribe to events) or an **agent** (serve requests
//! for its own Things and publish their events and property values). The
//! same request/response/notification protocol runs over HTTP+SSE, MQTT v5
//! and NATS; the hub URL scheme picks the transport.
//!
//! # Overview
//!
//! - [`protocol`]: request, response and notification envelopes, the
//!   operation vocabulary, broker addresses and TD forms
//! - [`correlation`]: per-connection registry matching responses to calls
//! - [`transport`]: the [`Transport`] seam and the three adapters
//! - [`connection`]: [`HubConnection`] with its reconnection supervisor
//! - [`Consumer`] and [`Agent`]: the application-facing facades
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use hubconnect::{ClientConfig, Consumer};
//! use serde_json::json;
//!
//! # async fn run() -> hubconnect::HubResult<()> {
//! let config = ClientConfig::new("dashboard", "mqtts://hub.local:8883");
//! let consumer = Consumer::new(config)?;
//! consumer.connect_with_config().await?;
//!
//! consumer.set_notification_handler(|n| println!("{} {} = {:?}", n.thing_id, n.name, n.data));
//! consumer.subscribe("dtw:zwave:lamp1", "switched").await?;
//!
//! let response = consumer
//!     .invoke_action("dtw:zwave:lamp1", "toggle", Some(json!(true)))
//!     .await?;
//! println!("{:?}", response.output);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod correlation;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use agent::Agent;
pub use config::{ClientConfig, ConfigError, Credentials, TransportKind};
pub use connection::{ConnectionStatus, HubConnection, RequestOptions};
pub use consumer::Consumer;
pub use correlation::CorrelationRegistry;
pub use error::{HubError, HubResult};
pub use protocol::*;
pub use transport::{
    request_handler_fn, RequestHandler, Subscription, SubscriptionKind, Transport,
    TransportFactory,
};
