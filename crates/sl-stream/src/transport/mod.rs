//! Transport layer for stream sessions
//!
//! The channel itself (socket connection, reconnect policy) lives outside this
//! crate. Sessions only need named-event emit, request/ack, and an ordered
//! feed of inbound events, which is what [`Transport`] describes.
//!
//! - [`MockTransport`] is an in-memory channel for tests and demos

mod adapter;
pub mod error;
pub mod mock;

pub use adapter::{Transport, TransportEvent};
pub use error::TransportError;
pub use mock::{MockTransport, MockTransportConfig, SentMessage};
