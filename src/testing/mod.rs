//! Test doubles
//!
//! A loopback hub that stands in for every transport, so the facades can be
//! tested without a broker or HTTP server.
//!
//! ```rust
//! use hubconnect::testing::MockHub;
//! use hubconnect::{Consumer, Credentials};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let hub = MockHub::new();
//! hub.reply_completed(Some(json!(42)));
//! let consumer = Consumer::from_connection(Arc::new(hub.connection("dashboard")));
//! consumer
//!     .connect(Credentials::Token {
//!         client_id: "dashboard".to_string(),
//!         token: "t".to_string(),
//!     })
//!     .await
//!     .unwrap();
//!
//! let value = consumer.read_property("dtw:lamp1", "level").await.unwrap();
//! assert_eq!(value, json!(42));
//! assert_eq!(hub.requests().len(), 1);
//! # });
//! ```

pub mod mocks;

pub use mocks::*;
