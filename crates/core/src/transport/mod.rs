//! Resilient socket transport
//!
//! This module provides the pieces behind [`Transport`]:
//! - Backoff scheduling for reconnect attempts
//! - Heartbeat probing over an HTTP side channel
//! - The outbound queue replayed after every (re)connect
//! - Connection sessions over WebSocket (or a mock link in tests)

pub mod heartbeat;
pub mod mock;
pub mod queue;
pub mod reconnect;
pub mod session;
pub mod side_channel;
pub mod socket;
pub mod tls;
pub mod ws;

pub use heartbeat::{classify, HeartbeatConfig, HeartbeatMonitor, HeartbeatProbe, HttpProbe};
pub use mock::{MockAttempt, MockConnector, MockPeer, MockProbe, MockServer};
pub use queue::{MessageId, OutboundQueue, QueuedMessage};
pub use reconnect::{Backoff, ReconnectConfig, ReconnectScheduler};
pub use session::{Connector, FrameReader, FrameWriter, Link, SessionId};
pub use side_channel::SideChannel;
pub use socket::{socket_url, Transport};
pub use tls::TlsCredentials;
pub use ws::WsConnector;

/// Everything needed to build a [`Transport`]
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub credentials: TlsCredentials,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
}

impl TransportOptions {
    pub fn with_credentials(mut self, credentials: TlsCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}
