//! One physical connection attempt
//!
//! A session task opens a link through a [`Connector`], writes the transport
//! identity as its first frame, then pumps inbound frames to the transport and
//! outbound frames from it. Every notification carries the session's
//! [`SessionId`]; the transport drops notifications from any session that is
//! no longer current, so a late open or message from a superseded attempt is
//! inert even though its task may still be running.
//!
//! Dropping the [`SessionHandle`] is how the transport releases a session: the
//! task closes the link and exits without writing anything still buffered for
//! it, since the transport replays those frames on the next session.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use super::queue::MessageId;
use crate::{CoreError, Result};

/// Opens physical links to the server
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Link>;
}

/// Write half of a link
#[async_trait]
pub trait FrameWriter: Send {
    /// Returns once the frame has been handed to the underlying socket
    async fn write(&mut self, frame: String) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Read half of a link
#[async_trait]
pub trait FrameReader: Send {
    /// Next inbound text frame; `None` once the peer closed the link
    ///
    /// Must be cancel safe.
    async fn read(&mut self) -> Option<Result<String>>;
}

/// An open bidirectional link
pub struct Link {
    pub writer: Box<dyn FrameWriter>,
    pub reader: Box<dyn FrameReader>,
}

impl Link {
    pub fn new(writer: impl FrameWriter + 'static, reader: impl FrameReader + 'static) -> Self {
        Self {
            writer: Box::new(writer),
            reader: Box::new(reader),
        }
    }
}

/// Identity of one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn first() -> Self {
        Self(1)
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Notification from a session task
#[derive(Debug)]
pub struct SessionEvent {
    pub session: SessionId,
    pub kind: SessionEventKind,
}

#[derive(Debug)]
pub enum SessionEventKind {
    /// Physical link is open
    Opened,
    /// Identity frame was written; the session may carry user data
    Handshaken,
    /// Raw inbound text frame
    Message(String),
    /// Outcome of writing a queued message
    Delivered { message: MessageId, result: Result<()> },
    /// Open or I/O failure; the session is finished
    Failed(CoreError),
    /// Peer closed the link; the session is finished
    Closed,
}

/// Frame the transport asks the session to write
#[derive(Debug)]
pub(crate) struct Outbound {
    pub message: MessageId,
    pub frame: String,
}

/// Transport's reference to the current session
#[derive(Debug)]
pub(crate) struct SessionHandle {
    id: SessionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    // Never sent; dropping it releases the task
    _release: oneshot::Sender<()>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a frame for writing; false if the session task already exited
    pub fn dispatch(&self, message: MessageId, frame: String) -> bool {
        self.outbound.send(Outbound { message, frame }).is_ok()
    }
}

/// Start a session task
pub(crate) fn spawn(
    id: SessionId,
    connector: Arc<dyn Connector>,
    url: Url,
    identity: String,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> SessionHandle {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = oneshot::channel();
    tokio::spawn(run(id, connector, url, identity, events, outbound_rx, release_rx));
    SessionHandle {
        id,
        outbound: outbound_tx,
        _release: release_tx,
    }
}

async fn run(
    id: SessionId,
    connector: Arc<dyn Connector>,
    url: Url,
    identity: String,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut released: oneshot::Receiver<()>,
) {
    let notify = |kind: SessionEventKind| {
        // The transport may be gone already; nothing left to tell
        let _ = events.send(SessionEvent { session: id, kind });
    };

    tracing::debug!("{} connecting to {}", id, url);
    let link = tokio::select! {
        result = connector.connect(&url) => result,
        _ = &mut released => {
            tracing::debug!("{} released before open", id);
            return;
        }
    };

    let Link { mut writer, mut reader } = match link {
        Ok(link) => link,
        Err(e) => {
            notify(SessionEventKind::Failed(e));
            return;
        }
    };
    notify(SessionEventKind::Opened);

    // Identity first, before any user data
    if let Err(e) = writer.write(identity).await {
        notify(SessionEventKind::Failed(e));
        return;
    }
    notify(SessionEventKind::Handshaken);

    loop {
        tokio::select! {
            biased;

            // Checked first so frames still buffered for a released session stay unwritten
            _ = &mut released => {
                tracing::debug!("{} released, closing link", id);
                if let Err(e) = writer.close().await {
                    tracing::trace!("{} close failed: {}", id, e);
                }
                break;
            }
            inbound = reader.read() => match inbound {
                Some(Ok(frame)) => notify(SessionEventKind::Message(frame)),
                Some(Err(e)) => {
                    notify(SessionEventKind::Failed(e));
                    break;
                }
                None => {
                    notify(SessionEventKind::Closed);
                    break;
                }
            },
            Some(Outbound { message, frame }) = outbound.recv() => {
                let result = writer.write(frame).await;
                notify(SessionEventKind::Delivered { message, result });
            }
        }
    }
}
