//! Heartbeat monitoring over the HTTP side channel
//!
//! The monitor probes the server on a fixed interval, independently of the
//! socket. A failure marks the server `away`; a success after an `away` period
//! or after a long silence tells the transport to replace its session, since
//! the socket may have stayed open over a path that is no longer usable.

use async_trait::async_trait;
use reqwest::Method;
use std::time::Duration;
use tokio::time::Instant;

use super::side_channel::SideChannel;
use crate::types::{FaultCode, HeartbeatCode, HeartbeatError, Liveness, ProbeError};

/// Path of the heartbeat endpoint, relative to the server URI
pub const HEARTBEAT_PATH: &str = "heartbeat";

/// Heartbeat configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between probes; the first probe runs immediately
    pub interval: Duration,
    /// A success this long after the previous one forces a session rebuild
    pub stale_after: Duration,
    /// Per-request timeout; expiry counts as ETIMEDOUT
    pub timeout: Duration,
    /// Endpoint path relative to the server URI
    pub path: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
            stale_after: Duration::from_millis(60_000),
            timeout: Duration::from_secs(15),
            path: HEARTBEAT_PATH.to_string(),
        }
    }
}

impl HeartbeatConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One liveness probe against the server
#[async_trait]
pub trait HeartbeatProbe: Send + Sync {
    async fn probe(&self) -> std::result::Result<(), ProbeError>;
}

/// Probe that POSTs to the heartbeat endpoint
pub struct HttpProbe {
    channel: SideChannel,
    path: String,
}

impl HttpProbe {
    pub fn new(channel: SideChannel, path: impl Into<String>) -> Self {
        Self {
            channel,
            path: path.into(),
        }
    }
}

#[async_trait]
impl HeartbeatProbe for HttpProbe {
    async fn probe(&self) -> std::result::Result<(), ProbeError> {
        self.channel.probe(Method::POST, &self.path).await
    }
}

/// Liveness bookkeeping
#[derive(Debug)]
pub struct HeartbeatMonitor {
    stale_after: Duration,
    last: Option<Liveness>,
    last_success: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            last: None,
            last_success: None,
        }
    }

    /// Record a successful probe
    ///
    /// Returns true when the current session should be torn down and rebuilt:
    /// the previous probe failed, or the previous success is older than
    /// `stale_after`.
    pub fn record_success(&mut self, now: Instant) -> bool {
        let previous_success = *self.last_success.get_or_insert(now);
        let rebuild = self.last == Some(Liveness::Away)
            || now.saturating_duration_since(previous_success) > self.stale_after;
        self.last = Some(Liveness::Here);
        self.last_success = Some(now);
        rebuild
    }

    pub fn record_failure(&mut self) {
        self.last = Some(Liveness::Away);
    }

    pub fn liveness(&self) -> Option<Liveness> {
        self.last
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }
}

/// Map a probe failure onto an operator-facing code
///
/// `server_reached` is whether a socket handshake or a heartbeat ever
/// succeeded; it separates a crashed server from a port that was never open.
pub fn classify(err: &ProbeError, server_reached: bool) -> HeartbeatError {
    let code = match &err.fault {
        FaultCode::HostNotFound
        | FaultCode::NetworkDown
        | FaultCode::AddrNotAvailable
        | FaultCode::HostUnreachable
        | FaultCode::TimedOut => HeartbeatCode::NetworkAway,
        FaultCode::ConnectionRefused if server_reached => HeartbeatCode::ServerCrashed,
        FaultCode::ConnectionRefused => HeartbeatCode::PortNotAccessible,
        FaultCode::ConnectionReset => HeartbeatCode::InvalidCertificate,
        other => HeartbeatCode::Unclassified(other.clone()),
    };
    HeartbeatError::new(code, err.fault.clone(), err.message.clone())
}
