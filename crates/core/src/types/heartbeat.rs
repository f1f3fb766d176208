//! Heartbeat failure types
//!
//! A failed probe carries a low-level [`FaultCode`]; the heartbeat monitor maps
//! it onto an operator-facing [`HeartbeatCode`] and reports both.

use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;
use std::io;
use thiserror::Error;

/// Low-level cause of a failed side-channel request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FaultCode {
    /// DNS lookup failed (ENOTFOUND)
    HostNotFound,
    /// ENETDOWN
    NetworkDown,
    /// Local ephemeral ports exhausted (EADDRNOTAVAIL)
    AddrNotAvailable,
    /// EHOSTUNREACH
    HostUnreachable,
    /// ETIMEDOUT
    TimedOut,
    /// ECONNREFUSED
    ConnectionRefused,
    /// ECONNRESET
    ConnectionReset,
    /// Server answered with an error status
    HttpStatus(u16),
    /// Anything else, kept verbatim
    Other(String),
}

impl FaultCode {
    /// Wire form of the code, e.g. `ECONNREFUSED` or `HTTP_503`
    pub fn as_code(&self) -> Cow<'_, str> {
        match self {
            Self::HostNotFound => Cow::Borrowed("ENOTFOUND"),
            Self::NetworkDown => Cow::Borrowed("ENETDOWN"),
            Self::AddrNotAvailable => Cow::Borrowed("EADDRNOTAVAIL"),
            Self::HostUnreachable => Cow::Borrowed("EHOSTUNREACH"),
            Self::TimedOut => Cow::Borrowed("ETIMEDOUT"),
            Self::ConnectionRefused => Cow::Borrowed("ECONNREFUSED"),
            Self::ConnectionReset => Cow::Borrowed("ECONNRESET"),
            Self::HttpStatus(status) => Cow::Owned(format!("HTTP_{}", status)),
            Self::Other(code) => Cow::Borrowed(code.as_str()),
        }
    }

    /// Map an I/O error kind onto a fault code, if it is one we recognize
    pub fn from_io_kind(kind: io::ErrorKind) -> Option<Self> {
        match kind {
            io::ErrorKind::ConnectionRefused => Some(Self::ConnectionRefused),
            io::ErrorKind::ConnectionReset => Some(Self::ConnectionReset),
            io::ErrorKind::TimedOut => Some(Self::TimedOut),
            io::ErrorKind::AddrNotAvailable => Some(Self::AddrNotAvailable),
            io::ErrorKind::HostUnreachable => Some(Self::HostUnreachable),
            io::ErrorKind::NetworkDown => Some(Self::NetworkDown),
            _ => None,
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_code())
    }
}

impl Serialize for FaultCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_code())
    }
}

/// Classified heartbeat failure
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HeartbeatCode {
    NetworkAway,
    ServerCrashed,
    PortNotAccessible,
    InvalidCertificate,
    /// No mapping applies; the original code is passed through
    Unclassified(FaultCode),
}

impl HeartbeatCode {
    pub fn as_code(&self) -> Cow<'_, str> {
        match self {
            Self::NetworkAway => Cow::Borrowed("NETWORK_AWAY"),
            Self::ServerCrashed => Cow::Borrowed("SERVER_CRASHED"),
            Self::PortNotAccessible => Cow::Borrowed("PORT_NOT_ACCESSIBLE"),
            Self::InvalidCertificate => Cow::Borrowed("INVALID_CERTIFICATE"),
            Self::Unclassified(fault) => fault.as_code(),
        }
    }
}

impl fmt::Display for HeartbeatCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_code())
    }
}

impl Serialize for HeartbeatCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_code())
    }
}

/// Payload of the `heartbeat.error` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{code} ({original_code}): {message}")]
pub struct HeartbeatError {
    pub code: HeartbeatCode,
    pub original_code: FaultCode,
    pub message: String,
}

impl HeartbeatError {
    pub fn new(code: HeartbeatCode, original_code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            original_code,
            message: message.into(),
        }
    }
}

/// Raw failure of a liveness probe, before classification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{fault}: {message}")]
pub struct ProbeError {
    pub fault: FaultCode,
    pub message: String,
}

impl ProbeError {
    pub fn new(fault: FaultCode, message: impl Into<String>) -> Self {
        Self {
            fault,
            message: message.into(),
        }
    }
}
