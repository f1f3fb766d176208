//! In-memory connector and heartbeat probe
//!
//! Used by the unit tests and by embedders that want to drive a transport
//! without a network. Every connection attempt surfaces on a [`MockServer`],
//! which decides whether to accept or refuse it; accepted links hand the
//! test a [`MockPeer`] playing the server side.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use super::heartbeat::HeartbeatProbe;
use super::session::{Connector, FrameReader, FrameWriter, Link};
use crate::types::{FaultCode, ProbeError};
use crate::{CoreError, Result};

/// Connector whose attempts are answered by a [`MockServer`]
pub struct MockConnector {
    attempts: mpsc::UnboundedSender<MockAttempt>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, MockServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { attempts: tx }), MockServer { attempts: rx })
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<Link> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.attempts
            .send(MockAttempt {
                url: url.clone(),
                reply: reply_tx,
            })
            .map_err(|_| CoreError::Connection("mock server is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| CoreError::Connection("attempt dropped by mock server".to_string()))?
    }
}

/// Server side of a [`MockConnector`]
pub struct MockServer {
    attempts: mpsc::UnboundedReceiver<MockAttempt>,
}

impl MockServer {
    /// Wait for the next connection attempt
    pub async fn next_attempt(&mut self) -> Option<MockAttempt> {
        self.attempts.recv().await
    }

    /// Attempt already waiting, if any
    pub fn try_next_attempt(&mut self) -> Option<MockAttempt> {
        self.attempts.try_recv().ok()
    }

    /// Accept the next attempt
    pub async fn accept(&mut self) -> Option<MockPeer> {
        Some(self.next_attempt().await?.accept())
    }

    /// Refuse the next attempt with ECONNREFUSED; returns the URL it targeted
    pub async fn refuse(&mut self) -> Option<Url> {
        let attempt = self.next_attempt().await?;
        let url = attempt.url.clone();
        attempt.refuse(CoreError::Io(std::io::ErrorKind::ConnectionRefused.into()));
        Some(url)
    }
}

/// One pending connection attempt
pub struct MockAttempt {
    pub url: Url,
    reply: oneshot::Sender<Result<Link>>,
}

impl MockAttempt {
    pub fn accept(self) -> MockPeer {
        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(LinkFlags::default());

        let link = Link::new(
            MockWriter {
                frames: Some(to_server_tx),
                flags: Arc::clone(&shared),
            },
            MockReader {
                inbound: to_client_rx,
            },
        );
        // The session may have been released while the attempt was pending
        let _ = self.reply.send(Ok(link));

        MockPeer {
            url: self.url,
            received: to_server_rx,
            inbound: Some(to_client_tx),
            flags: shared,
        }
    }

    pub fn refuse(self, err: CoreError) {
        let _ = self.reply.send(Err(err));
    }
}

#[derive(Default)]
struct LinkFlags {
    client_closed: AtomicBool,
    reject_writes: AtomicBool,
}

/// Server end of an accepted mock link
pub struct MockPeer {
    pub url: Url,
    received: mpsc::UnboundedReceiver<String>,
    inbound: Option<mpsc::UnboundedSender<Result<String>>>,
    flags: Arc<LinkFlags>,
}

impl MockPeer {
    /// Next frame written by the client; `None` once the client side is gone
    pub async fn next_frame(&mut self) -> Option<String> {
        self.received.recv().await
    }

    /// Frame already written by the client, if any
    pub fn try_next_frame(&mut self) -> Option<String> {
        self.received.try_recv().ok()
    }

    /// Deliver a text frame to the client
    pub fn push(&self, frame: impl Into<String>) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Ok(frame.into()));
        }
    }

    /// Fail the client's read side with an I/O error
    pub fn fail(&mut self, kind: std::io::ErrorKind) {
        if let Some(inbound) = self.inbound.take() {
            let _ = inbound.send(Err(CoreError::Io(kind.into())));
        }
    }

    /// Close the link from the server side
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Make every further client write fail
    pub fn reject_writes(&self) {
        self.flags.reject_writes.store(true, Ordering::SeqCst);
    }

    pub fn client_closed(&self) -> bool {
        self.flags.client_closed.load(Ordering::SeqCst)
    }
}

struct MockWriter {
    frames: Option<mpsc::UnboundedSender<String>>,
    flags: Arc<LinkFlags>,
}

#[async_trait]
impl FrameWriter for MockWriter {
    async fn write(&mut self, frame: String) -> Result<()> {
        if self.flags.reject_writes.load(Ordering::SeqCst) {
            return Err(CoreError::Io(std::io::ErrorKind::BrokenPipe.into()));
        }
        match &self.frames {
            Some(frames) => frames.send(frame).map_err(|_| CoreError::NotConnected),
            None => Err(CoreError::NotConnected),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.flags.client_closed.store(true, Ordering::SeqCst);
        self.frames = None;
        Ok(())
    }
}

struct MockReader {
    inbound: mpsc::UnboundedReceiver<Result<String>>,
}

#[async_trait]
impl FrameReader for MockReader {
    async fn read(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await
    }
}

/// Heartbeat probe with a scripted outcome
pub struct MockProbe {
    outcome: Mutex<ProbeOutcome>,
    calls: AtomicUsize,
}

#[derive(Clone)]
enum ProbeOutcome {
    Reply(std::result::Result<(), ProbeError>),
    Hang,
}

impl MockProbe {
    /// Probe that succeeds until told otherwise
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(ProbeOutcome::Reply(Ok(()))),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn succeed(&self) {
        self.set(ProbeOutcome::Reply(Ok(())));
    }

    pub fn fail(&self, fault: FaultCode, message: impl Into<String>) {
        self.set(ProbeOutcome::Reply(Err(ProbeError::new(fault, message))));
    }

    /// Make later probes never complete
    pub fn hang(&self) {
        self.set(ProbeOutcome::Hang);
    }

    /// Number of probes issued so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set(&self, outcome: ProbeOutcome) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
    }
}

#[async_trait]
impl HeartbeatProbe for MockProbe {
    async fn probe(&self) -> std::result::Result<(), ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match outcome {
            ProbeOutcome::Reply(result) => result,
            ProbeOutcome::Hang => std::future::pending().await,
        }
    }
}
