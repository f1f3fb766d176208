//! HTTP side channel to the server
//!
//! Requests go to `<server_uri>/<path>` with the same TLS configuration as the
//! persistent socket. The heartbeat probe is one such request.

use reqwest::{Client, Method};
use rustls::ClientConfig;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::types::{FaultCode, ProbeError};
use crate::{CoreError, Result};

/// Reusable HTTP client bound to one server
#[derive(Debug, Clone)]
pub struct SideChannel {
    client: Client,
    base: Url,
}

impl SideChannel {
    pub fn new(server: &Url, tls: Arc<ClientConfig>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .use_preconfigured_tls((*tls).clone())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base: http_base(server)?,
        })
    }

    /// Absolute URL for a path relative to the server URI
    pub fn url_for(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Ok(Url::parse(&joined)?)
    }

    /// Issue one request and return the response body
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<String> {
        let url = self.url_for(path)?;
        self.send(method, url, body).await.map_err(|e| match e {
            RequestFailure::Status { url, status } => CoreError::HttpStatus { url, status },
            RequestFailure::Transport(err) => CoreError::from(err),
        })
    }

    /// Same as [`request`](Self::request) but failures keep their low-level cause
    pub async fn probe(&self, method: Method, path: &str) -> std::result::Result<(), ProbeError> {
        let url = self
            .url_for(path)
            .map_err(|e| ProbeError::new(FaultCode::Other("EINVAL".to_string()), e.to_string()))?;
        match self.send(method, url, None).await {
            Ok(_) => Ok(()),
            Err(RequestFailure::Status { url, status }) => Err(ProbeError::new(
                FaultCode::HttpStatus(status),
                format!("{} returned status {}", url, status),
            )),
            Err(RequestFailure::Transport(err)) => Err(probe_error_from(&err)),
        }
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> std::result::Result<String, RequestFailure> {
        let mut request = self.client.request(method, url.clone());
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request.send().await.map_err(RequestFailure::Transport)?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(RequestFailure::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.text().await.map_err(RequestFailure::Transport)
    }
}

enum RequestFailure {
    Status { url: String, status: u16 },
    Transport(reqwest::Error),
}

/// HTTP(S) form of the server URI (`ws` → `http`, `wss` → `https`)
pub fn http_base(server: &Url) -> Result<Url> {
    let scheme = match server.scheme() {
        "http" | "ws" => "http",
        "https" | "wss" => "https",
        other => return Err(CoreError::InvalidUri(format!("unsupported scheme: {}", other))),
    };
    let mut base = server.clone();
    base.set_scheme(scheme)
        .map_err(|_| CoreError::InvalidUri(format!("cannot use {} with {}", scheme, server)))?;
    Ok(base)
}

/// Recover the low-level cause of a failed request
///
/// reqwest hides the socket error a few layers down its source chain; DNS
/// failures only show up in the message text.
pub fn probe_error_from(err: &reqwest::Error) -> ProbeError {
    let message = describe(err);
    if err.is_timeout() {
        return ProbeError::new(FaultCode::TimedOut, message);
    }

    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if let Some(fault) = FaultCode::from_io_kind(io.kind()) {
                return ProbeError::new(fault, message);
            }
        }
        let text = cause.to_string();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return ProbeError::new(FaultCode::HostNotFound, message);
        }
        source = cause.source();
    }

    let code = if err.is_connect() { "ECONNECT" } else { "EUNKNOWN" };
    ProbeError::new(FaultCode::Other(code.to_string()), message)
}

/// Error text including its causes, e.g.
/// "error sending request: tcp connect error: Connection refused"
fn describe(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
