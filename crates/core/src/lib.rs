//! Tether Core - resilient JSON message transport
//!
//! This crate provides:
//! - [`Transport`]: an always-on logical connection over WebSocket
//! - Heartbeat monitoring over an HTTP side channel, with error classification
//! - Outbound queueing and in-order replay across reconnects
//! - Disposable event subscriptions
//! - Mock connector and probe for tests

pub mod error;
pub mod events;
pub mod protocol;
pub mod transport;
pub mod types;

// Re-export common types
pub use error::{CoreError, Result};
pub use events::{EventHub, Listeners, Subscription};
pub use protocol::MessageCodec;
pub use reqwest::Method;
pub use transport::{
    HeartbeatConfig, MockConnector, MockProbe, ReconnectConfig, TlsCredentials, Transport,
    TransportOptions,
};
pub use types::{
    ConnectionState, FaultCode, HeartbeatCode, HeartbeatError, Liveness, ProbeError, TransportId,
};
