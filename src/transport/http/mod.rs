//! HTTP+SSE transport
//!
//! Requests go out as HTTP POSTs; responses, notifications and inbound
//! requests come back on a Server-Sent Events stream.

pub mod auth;
pub mod client;
pub mod sse;

pub use client::HttpSseTransport;
pub use sse::{SseDecoder, SseEvent, SseItem, MAX_SSE_MESSAGE_SIZE};
