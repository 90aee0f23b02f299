//! Observability for the hub client
//!
//! Structured logging via `tracing`, with span macros for requests,
//! transport operations and connection lifecycle.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

pub use logging::{lifecycle_span, request_span, transport_span};
