//! NATS transport
//!
//! Thin compared to the other adapters: NATS matches replies itself, so
//! only subscriptions and inbound requests need handling here.

pub mod client;

pub use client::NatsTransport;
