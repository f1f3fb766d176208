//! WebSocket links over tokio-tungstenite

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::session::{Connector, FrameReader, FrameWriter, Link};
use crate::{CoreError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` and `wss://` links with the transport's TLS configuration
pub struct WsConnector {
    tls: Arc<ClientConfig>,
}

impl WsConnector {
    pub fn new(tls: Arc<ClientConfig>) -> Self {
        Self { tls }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Link> {
        let connector = tokio_tungstenite::Connector::Rustls(Arc::clone(&self.tls));
        let (stream, response) =
            connect_async_tls_with_config(url.as_str(), None, false, Some(connector)).await?;
        tracing::debug!("WebSocket handshake with {} ({})", url, response.status());

        let (sink, stream) = stream.split();
        Ok(Link::new(WsWriter { sink }, WsReader { stream }))
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn write(&mut self, frame: String) -> Result<()> {
        self.sink.send(Message::text(frame)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn read(&mut self) -> Option<Result<String>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return None,
                Err(e) => return Some(Err(e.into())),
            };
            match message {
                Message::Text(text) => return Some(Ok(text.as_str().to_owned())),
                Message::Binary(data) => {
                    return Some(String::from_utf8(data.to_vec()).map_err(|e| {
                        CoreError::InvalidMessageFormat(format!("binary frame is not UTF-8: {}", e))
                    }))
                }
                Message::Close(frame) => {
                    tracing::debug!("Server closed WebSocket: {:?}", frame);
                    return None;
                }
                // Pings are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}
