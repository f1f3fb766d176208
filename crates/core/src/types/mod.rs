//! Domain types for the transport

mod heartbeat;
mod state;

pub use heartbeat::{FaultCode, HeartbeatCode, HeartbeatError, ProbeError};
pub use state::{ConnectionState, Liveness, TransportId};
