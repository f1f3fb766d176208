//! Tether Echo Host
//!
//! Reference server for Tether clients:
//! - `POST /heartbeat` answers liveness probes
//! - `GET /` upgrades to a WebSocket; the first frame is the client identity,
//!   every later JSON frame is echoed back as `{client, attempt, echo}`
//! - `GET /stats` reports heartbeats and attachments per client
//! - `POST /kick` drops every open socket so clients have to reconnect

pub mod server;

pub use server::{EchoServer, EchoState};
