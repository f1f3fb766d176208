//! Transport handle and the task that drives it
//!
//! All mutable transport state (current session, queue, backoff, heartbeat
//! bookkeeping) lives in one driver task. The [`Transport`] handle only sends
//! it commands and reads the published connection state, so state changes
//! never interleave and event callbacks always run in transition order.

use reqwest::Method;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use url::Url;

use super::heartbeat::{classify, HeartbeatMonitor, HeartbeatProbe, HttpProbe};
use super::queue::{MessageId, OutboundQueue};
use super::reconnect::ReconnectScheduler;
use super::session::{self, Connector, SessionEvent, SessionEventKind, SessionHandle, SessionId};
use super::side_channel::SideChannel;
use super::ws::WsConnector;
use super::TransportOptions;
use crate::events::{EventHub, Subscription};
use crate::protocol::MessageCodec;
use crate::types::{ConnectionState, HeartbeatError, ProbeError, TransportId};
use crate::{CoreError, Result};

/// Socket form of a server URI: `http` → `ws`, `https` → `wss`, path kept
pub fn socket_url(server: &Url) -> Result<Url> {
    let scheme = match server.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(CoreError::InvalidUri(format!("unsupported scheme: {}", other))),
    };
    let mut url = server.clone();
    url.set_scheme(scheme)
        .map_err(|_| CoreError::InvalidUri(format!("cannot use {} with {}", scheme, server)))?;
    Ok(url)
}

/// State read by the handle and written by the driver
#[derive(Default)]
struct Shared {
    events: EventHub,
    server_reached: AtomicBool,
    queued: AtomicUsize,
}

enum Command {
    Send(String),
    Close(oneshot::Sender<()>),
}

/// Always-on logical connection to one server
///
/// Construction starts the heartbeat and the first connection attempt, so it
/// must happen inside a tokio runtime. Dropping the handle closes the
/// transport.
pub struct Transport {
    id: TransportId,
    server_uri: Url,
    socket_url: Url,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    shared: Arc<Shared>,
    side_channel: SideChannel,
    heartbeat_probe: Arc<dyn HeartbeatProbe>,
}

impl Transport {
    /// Connect over WebSocket, probing `<server_uri>/heartbeat` over HTTP(S)
    pub fn connect(server_uri: &str, options: TransportOptions) -> Result<Self> {
        let server = Url::parse(server_uri)?;
        let tls = options.credentials.client_config()?;
        let side_channel = SideChannel::new(&server, Arc::clone(&tls), options.heartbeat.timeout)?;
        let probe = Arc::new(HttpProbe::new(
            side_channel.clone(),
            options.heartbeat.path.clone(),
        ));
        let connector = Arc::new(WsConnector::new(tls));
        Self::start(server, options, connector, probe, side_channel)
    }

    /// Build a transport over an explicit connector and heartbeat probe
    pub fn with_parts(
        server_uri: &str,
        options: TransportOptions,
        connector: Arc<dyn Connector>,
        probe: Arc<dyn HeartbeatProbe>,
    ) -> Result<Self> {
        let server = Url::parse(server_uri)?;
        let tls = options.credentials.client_config()?;
        let side_channel = SideChannel::new(&server, tls, options.heartbeat.timeout)?;
        Self::start(server, options, connector, probe, side_channel)
    }

    fn start(
        server_uri: Url,
        options: TransportOptions,
        connector: Arc<dyn Connector>,
        probe: Arc<dyn HeartbeatProbe>,
        side_channel: SideChannel,
    ) -> Result<Self> {
        let socket_url = socket_url(&server_uri)?;
        let id = TransportId::generate();
        let shared = Arc::new(Shared::default());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let (driver, session_rx) = Driver::new(
            id,
            socket_url.clone(),
            connector,
            Arc::clone(&probe),
            &options,
            Arc::clone(&shared),
            state_tx,
        );
        tokio::spawn(driver.run(command_rx, session_rx));
        tracing::info!("Transport {} started for {}", id, server_uri);

        Ok(Self {
            id,
            server_uri,
            socket_url,
            commands: command_tx,
            state: state_rx,
            shared,
            side_channel,
            heartbeat_probe: probe,
        })
    }

    /// Queue a payload; it is written now if connected, else after the next connect
    pub fn send(&self, payload: Value) {
        let frame = match MessageCodec::encode(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping unsendable payload: {}", e);
                return;
            }
        };
        if self.commands.send(Command::Send(frame)).is_err() {
            tracing::debug!("Transport {} is closed, payload dropped", self.id);
        }
    }

    /// Resolve on the next connect, or at once when already connected
    pub async fn wait_for_connect(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let on_connect_tx = tx.clone();
        let mut on_connect = self.shared.events.connect.subscribe(move |_| {
            let _ = on_connect_tx.send(());
        });
        let mut on_reconnect = self.shared.events.reconnect.subscribe(move |_| {
            let _ = tx.send(());
        });

        let mut state = self.state.clone();
        let result = loop {
            match *state.borrow_and_update() {
                ConnectionState::Connected => break Ok(()),
                ConnectionState::Closed => break Err(CoreError::Closed),
                ConnectionState::Disconnected => {}
            }
            tokio::select! {
                Some(()) = rx.recv() => break Ok(()),
                changed = state.changed() => {
                    if changed.is_err() {
                        break Err(CoreError::Closed);
                    }
                }
            }
        };

        on_connect.dispose();
        on_reconnect.dispose();
        result
    }

    /// One out-of-band heartbeat; failures come back classified
    pub async fn probe(&self) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(CoreError::Closed);
        }
        match self.heartbeat_probe.probe().await {
            Ok(()) => {
                self.shared.server_reached.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                let reached = self.shared.server_reached.load(Ordering::SeqCst);
                Err(classify(&err, reached).into())
            }
        }
    }

    /// HTTP request to `<server_uri>/<path>` with the transport's TLS settings
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<String> {
        if self.state() == ConnectionState::Closed {
            return Err(CoreError::Closed);
        }
        self.side_channel.request(method, path, body).await
    }

    /// Stop everything; returns once the driver has shut down
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Close(ack_tx)).is_ok() {
            // Err means another close won the race; the driver is gone either way
            let _ = ack_rx.await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn current_uri(&self) -> &Url {
        &self.server_uri
    }

    pub fn socket_url(&self) -> &Url {
        &self.socket_url
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Messages not yet confirmed written
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub fn on_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.shared.events.status.subscribe(move |connected| callback(*connected))
    }

    pub fn on_connect<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.events.connect.subscribe(move |_| callback())
    }

    pub fn on_reconnect<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.events.reconnect.subscribe(move |_| callback())
    }

    pub fn on_disconnect<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.events.disconnect.subscribe(move |_| callback())
    }

    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.events.message.subscribe(callback)
    }

    pub fn on_heartbeat<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.events.heartbeat.subscribe(move |_| callback())
    }

    pub fn on_heartbeat_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&HeartbeatError) + Send + Sync + 'static,
    {
        self.shared.events.heartbeat_error.subscribe(callback)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("server_uri", &self.server_uri.as_str())
            .field("state", &self.state())
            .finish()
    }
}

/// Owner of all mutable transport state
struct Driver {
    id: TransportId,
    socket_url: Url,
    connector: Arc<dyn Connector>,
    heartbeat_probe: Arc<dyn HeartbeatProbe>,
    heartbeat_interval: Duration,
    shared: Arc<Shared>,
    state: watch::Sender<ConnectionState>,
    queue: OutboundQueue,
    scheduler: ReconnectScheduler,
    monitor: HeartbeatMonitor,
    session: Option<SessionHandle>,
    next_session: SessionId,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    ever_connected: bool,
    probes: JoinSet<std::result::Result<(), ProbeError>>,
}

impl Driver {
    fn new(
        id: TransportId,
        socket_url: Url,
        connector: Arc<dyn Connector>,
        heartbeat_probe: Arc<dyn HeartbeatProbe>,
        options: &TransportOptions,
        shared: Arc<Shared>,
        state: watch::Sender<ConnectionState>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let driver = Self {
            id,
            socket_url,
            connector,
            heartbeat_probe,
            // tokio intervals reject a zero period
            heartbeat_interval: options.heartbeat.interval.max(Duration::from_millis(1)),
            shared,
            state,
            queue: OutboundQueue::new(),
            scheduler: ReconnectScheduler::new(options.reconnect.clone()),
            monitor: HeartbeatMonitor::new(options.heartbeat.stale_after),
            session: None,
            next_session: SessionId::first(),
            session_tx,
            ever_connected: false,
            probes: JoinSet::new(),
        };
        (driver, session_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.start_session();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send(frame)) => self.enqueue(frame),
                    Some(Command::Close(ack)) => {
                        self.shutdown();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        tracing::debug!("Transport {} handle dropped", self.id);
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = session_events.recv() => self.on_session_event(event),
                _ = heartbeat.tick() => self.spawn_probe(),
                Some(joined) = self.probes.join_next() => match joined {
                    Ok(result) => self.on_probe_result(result),
                    Err(e) => tracing::debug!("Heartbeat probe task ended: {}", e),
                },
                _ = self.scheduler.due() => self.start_session(),
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Replace the current session with a fresh attempt
    fn start_session(&mut self) {
        self.scheduler.cancel();
        let id = self.next_session;
        self.next_session = id.next();
        // Dropping the previous handle releases its link
        self.session = Some(session::spawn(
            id,
            Arc::clone(&self.connector),
            self.socket_url.clone(),
            MessageCodec::handshake(&self.id),
            self.session_tx.clone(),
        ));
    }

    fn schedule_reconnect(&mut self) {
        match self.scheduler.schedule() {
            Some(delay) => tracing::debug!("Reconnecting in {:?}", delay),
            None => tracing::trace!("Reconnect already scheduled"),
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        let current = self.session.as_ref().map(SessionHandle::id);
        if current != Some(event.session) {
            tracing::trace!("Ignoring {:?} from superseded {}", event.kind, event.session);
            return;
        }

        match event.kind {
            SessionEventKind::Opened => {
                tracing::debug!("{} open, sending identity", event.session);
            }
            SessionEventKind::Handshaken => self.on_handshake(),
            SessionEventKind::Message(frame) => match MessageCodec::decode(&frame) {
                Ok(payload) => self.shared.events.message.emit(&payload),
                Err(e) => tracing::warn!("Dropping malformed frame: {}", e),
            },
            SessionEventKind::Delivered { message, result } => match result {
                Ok(()) => {
                    self.queue.acknowledge(message);
                    self.sync_queued();
                }
                Err(e) => {
                    tracing::warn!("Failed to send message {}, kept for replay: {}", message, e)
                }
            },
            SessionEventKind::Failed(e) => {
                tracing::warn!("{} failed: {}", event.session, e);
                self.on_session_lost();
            }
            SessionEventKind::Closed => {
                tracing::info!("{} closed by server", event.session);
                self.on_session_lost();
            }
        }
    }

    fn on_handshake(&mut self) {
        self.scheduler.reset();
        self.shared.server_reached.store(true, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Connected);
        self.shared.events.status.emit(&true);
        if self.ever_connected {
            tracing::info!("Transport {} reconnected", self.id);
            self.shared.events.reconnect.emit(&());
        } else {
            tracing::info!("Transport {} connected to {}", self.id, self.socket_url);
            self.shared.events.connect.emit(&());
        }
        self.ever_connected = true;
        self.flush();
    }

    fn on_session_lost(&mut self) {
        self.session = None;
        self.leave_connected();
        self.schedule_reconnect();
    }

    fn leave_connected(&mut self) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        self.state.send_replace(ConnectionState::Disconnected);
        self.shared.events.status.emit(&false);
        self.shared.events.disconnect.emit(&());
    }

    fn enqueue(&mut self, frame: String) {
        let id = self.queue.enqueue(frame);
        self.sync_queued();
        self.deliver(id);
    }

    /// Hand one queued frame to the session if it may carry user data
    fn deliver(&self, id: MessageId) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let (Some(session), Some(entry)) = (&self.session, self.queue.get(id)) else {
            return;
        };
        if !session.dispatch(entry.id, entry.frame.clone()) {
            tracing::debug!("{} ended before message {} was written", session.id(), id);
        }
    }

    /// Replay every queued frame, oldest first
    fn flush(&self) {
        let Some(session) = &self.session else {
            return;
        };
        if !self.queue.is_empty() {
            tracing::debug!("Replaying {} queued messages", self.queue.len());
        }
        for entry in self.queue.iter() {
            if !session.dispatch(entry.id, entry.frame.clone()) {
                break;
            }
        }
    }

    fn sync_queued(&self) {
        self.shared.queued.store(self.queue.len(), Ordering::SeqCst);
    }

    fn spawn_probe(&mut self) {
        let probe = Arc::clone(&self.heartbeat_probe);
        self.probes.spawn(async move { probe.probe().await });
    }

    fn on_probe_result(&mut self, result: std::result::Result<(), ProbeError>) {
        match result {
            Ok(()) => {
                self.shared.server_reached.store(true, Ordering::SeqCst);
                let now = Instant::now();
                let previous = self.monitor.liveness();
                let since = self
                    .monitor
                    .last_success()
                    .map(|at| now.saturating_duration_since(at));
                if self.monitor.record_success(now) {
                    // The socket may look open over a path that no longer works
                    tracing::info!(
                        "Heartbeat recovered (was {:?}, last success {:?} ago), rebuilding session",
                        previous,
                        since
                    );
                    self.session = None;
                    self.leave_connected();
                    self.schedule_reconnect();
                }
                self.shared.events.heartbeat.emit(&());
            }
            Err(err) => {
                self.leave_connected();
                self.monitor.record_failure();
                let classified = classify(&err, self.shared.server_reached.load(Ordering::SeqCst));
                tracing::warn!("Heartbeat failed: {}", classified);
                self.shared.events.heartbeat_error.emit(&classified);
            }
        }
    }

    fn shutdown(&mut self) {
        self.scheduler.cancel();
        self.probes.abort_all();
        self.session = None;
        let dropped = self.queue.drain();
        self.sync_queued();

        let was_connected = self.state() == ConnectionState::Connected;
        self.state.send_replace(ConnectionState::Closed);
        if was_connected {
            self.shared.events.status.emit(&false);
            self.shared.events.disconnect.emit(&());
        }
        if dropped > 0 {
            tracing::info!("Transport {} closed, {} queued messages dropped", self.id, dropped);
        } else {
            tracing::info!("Transport {} closed", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::heartbeat::HeartbeatConfig;
    use crate::transport::mock::{MockConnector, MockPeer, MockProbe, MockServer};
    use crate::types::{FaultCode, HeartbeatCode};
    use serde_json::json;

    fn start(options: TransportOptions) -> (Transport, MockServer, Arc<MockProbe>) {
        let (connector, server) = MockConnector::new();
        let probe = MockProbe::new();
        let transport =
            Transport::with_parts("http://localhost:8080", options, connector, probe.clone())
                .unwrap();
        (transport, server, probe)
    }

    /// Let every runnable task finish its current work
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    /// Accept the next attempt and consume its identity frame
    async fn accept(server: &mut MockServer, transport: &Transport) -> MockPeer {
        let mut peer = server.accept().await.unwrap();
        assert_eq!(peer.next_frame().await, Some(transport.id().to_string()));
        peer
    }

    struct Recorder {
        rx: mpsc::UnboundedReceiver<String>,
        _subscriptions: Vec<Subscription>,
    }

    impl Recorder {
        fn attach(transport: &Transport) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let sender = |tx: &mpsc::UnboundedSender<String>| {
                let tx = tx.clone();
                move |text: String| {
                    let _ = tx.send(text);
                }
            };
            let status = sender(&tx);
            let connect = sender(&tx);
            let reconnect = sender(&tx);
            let disconnect = sender(&tx);
            let message = sender(&tx);
            let error = sender(&tx);
            Self {
                rx,
                _subscriptions: vec![
                    transport.on_status(move |up| status(format!("status:{}", up))),
                    transport.on_connect(move || connect("connect".into())),
                    transport.on_reconnect(move || reconnect("reconnect".into())),
                    transport.on_disconnect(move || disconnect("disconnect".into())),
                    transport.on_message(move |v| message(format!("message:{}", v))),
                    transport.on_heartbeat_error(move |e| {
                        error(format!("heartbeat.error:{}", e.code))
                    }),
                ],
            }
        }

        async fn next(&mut self) -> String {
            self.rx.recv().await.unwrap()
        }

        async fn expect(&mut self, expected: &[&str]) {
            for want in expected {
                assert_eq!(self.next().await, *want);
            }
        }

        fn pending(&mut self) -> Vec<String> {
            let mut seen = Vec::new();
            while let Ok(text) = self.rx.try_recv() {
                seen.push(text);
            }
            seen
        }
    }

    #[test]
    fn test_socket_url_derivation() {
        let url = |s: &str| socket_url(&Url::parse(s).unwrap()).unwrap().to_string();
        assert_eq!(url("http://host:9090"), "ws://host:9090/");
        assert_eq!(url("https://host:9090/base/"), "wss://host:9090/base/");
        assert_eq!(url("ws://host/"), "ws://host/");
        assert_eq!(url("wss://host/x"), "wss://host/x");
        assert!(socket_url(&Url::parse("ftp://host").unwrap()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_before_connect_flushes_after_handshake() {
        let (transport, mut server, _probe) = start(TransportOptions::default());
        let mut events = Recorder::attach(&transport);
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        transport.send(json!({"a": 1}));
        settle().await;
        assert_eq!(transport.queued(), 1);

        let mut peer = server.accept().await.unwrap();
        assert_eq!(peer.url.as_str(), "ws://localhost:8080/");
        assert_eq!(peer.next_frame().await, Some(transport.id().to_string()));
        events.expect(&["status:true", "connect"]).await;
        assert_eq!(peer.next_frame().await.as_deref(), Some(r#"{"a":1}"#));

        settle().await;
        assert!(transport.is_connected());
        assert_eq!(transport.queued(), 0);
        assert_eq!(peer.try_next_frame(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_connected_goes_straight_out() {
        let (transport, mut server, _probe) = start(TransportOptions::default());
        let mut peer = accept(&mut server, &transport).await;
        transport.wait_for_connect().await.unwrap();

        transport.send(json!([1, "two"]));
        assert_eq!(peer.next_frame().await.as_deref(), Some(r#"[1,"two"]"#));
        settle().await;
        assert_eq!(transport.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_while_refused_and_resets_after_connect() {
        let (transport, mut server, _probe) = start(TransportOptions::default());

        server.refuse().await.unwrap();
        let mut last = Instant::now();
        let mut gaps = Vec::new();
        for _ in 0..12 {
            server.refuse().await.unwrap();
            let now = Instant::now();
            gaps.push(now - last);
            last = now;
        }
        assert!(gaps[0] >= Duration::from_millis(10) && gaps[0] < Duration::from_millis(20));
        assert!(gaps.windows(2).all(|pair| pair[0] <= pair[1]));
        let longest = *gaps.last().unwrap();
        assert!(longest >= Duration::from_millis(5000) && longest < Duration::from_millis(5010));

        let mut peer = accept(&mut server, &transport).await;
        settle().await;
        assert!(transport.is_connected());

        peer.hang_up();
        let dropped_at = Instant::now();
        let _attempt = server.next_attempt().await.unwrap();
        assert!(Instant::now() - dropped_at < Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_payloads_replayed_once_in_order() {
        let (transport, mut server, _probe) = start(TransportOptions::default());
        let mut events = Recorder::attach(&transport);
        let mut first = accept(&mut server, &transport).await;
        events.expect(&["status:true", "connect"]).await;

        first.hang_up();
        events.expect(&["status:false", "disconnect"]).await;

        transport.send(json!({"n": 1}));
        transport.send(json!({"n": 1}));
        transport.send(json!({"n": 2}));
        settle().await;
        assert_eq!(transport.queued(), 3);

        let mut second = accept(&mut server, &transport).await;
        events.expect(&["status:true", "reconnect"]).await;
        for want in [r#"{"n":1}"#, r#"{"n":1}"#, r#"{"n":2}"#] {
            assert_eq!(second.next_frame().await.as_deref(), Some(want));
        }
        settle().await;
        assert_eq!(transport.queued(), 0);
        assert_eq!(second.try_next_frame(), None);
        assert_eq!(first.try_next_frame(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_stays_queued_for_next_connect() {
        let (transport, mut server, _probe) = start(TransportOptions::default());
        let mut events = Recorder::attach(&transport);
        let mut first = accept(&mut server, &transport).await;
        events.expect(&["status:true", "connect"]).await;

        first.reject_writes();
        transport.send(json!({"keep": true}));
        settle().await;
        assert_eq!(transport.queued(), 1);

        first.hang_up();
        let mut second = accept(&mut server, &transport).await;
        assert_eq!(second.next_frame().await.as_deref(), Some(r#"{"keep":true}"#));
        settle().await;
        assert_eq!(transport.queued(), 0);
        events
            .expect(&["status:false", "disconnect", "status:true", "reconnect"])
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_frames_become_message_events() {
        let (transport, mut server, _probe) = start(TransportOptions::default());
        let mut events = Recorder::attach(&transport);
        let peer = accept(&mut server, &transport).await;
        events.expect(&["status:true", "connect"]).await;

        peer.push("not json");
        peer.push(r#"{"reply":42}"#);
        events.expect(&[r#"message:{"reply":42}"#]).await;
        settle().await;
        assert!(events.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disposed_listener_is_not_called() {
        let (transport, mut server, _probe) = start(TransportOptions::default());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut subscription = transport.on_message(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let peer = accept(&mut server, &transport).await;
        transport.wait_for_connect().await.unwrap();

        peer.push("1");
        settle().await;
        subscription.dispose();
        peer.push("2");
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_failure_then_success_rebuilds_session() {
        let (transport, mut server, probe) = start(TransportOptions::default());
        let mut events = Recorder::attach(&transport);
        let mut first = accept(&mut server, &transport).await;
        events.expect(&["status:true", "connect"]).await;

        probe.fail(FaultCode::TimedOut, "request timed out");
        events
            .expect(&["status:false", "disconnect", "heartbeat.error:NETWORK_AWAY"])
            .await;

        // The session survives the failure but carries no user data
        transport.send(json!({"held": true}));
        settle().await;
        assert_eq!(first.try_next_frame(), None);
        assert_eq!(transport.queued(), 1);

        probe.succeed();
        let mut second = accept(&mut server, &transport).await;
        events.expect(&["status:true", "reconnect"]).await;
        assert_eq!(second.next_frame().await.as_deref(), Some(r#"{"held":true}"#));

        // The old link was released
        assert_eq!(first.next_frame().await, None);
        assert!(first.client_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_heartbeat_rebuilds_session() {
        let heartbeat = HeartbeatConfig::default().with_interval(Duration::from_secs(70));
        let (transport, mut server, _probe) =
            start(TransportOptions::default().with_heartbeat(heartbeat));
        let mut events = Recorder::attach(&transport);
        let _first = accept(&mut server, &transport).await;
        events.expect(&["status:true", "connect"]).await;

        // Next success lands 70s after the previous one
        events.expect(&["status:false", "disconnect"]).await;
        let _second = accept(&mut server, &transport).await;
        events.expect(&["status:true", "reconnect"]).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_heartbeat_classification_tracks_prior_contact() {
        let (transport, mut server, probe) = start(TransportOptions::default());
        let mut events = Recorder::attach(&transport);
        probe.fail(FaultCode::ConnectionRefused, "connect ECONNREFUSED");

        // The first attempt stays pending, so the server was never reached
        let attempt = server.next_attempt().await.unwrap();
        events
            .expect(&[
                "heartbeat.error:PORT_NOT_ACCESSIBLE",
                "heartbeat.error:PORT_NOT_ACCESSIBLE",
            ])
            .await;
        match transport.probe().await {
            Err(CoreError::Heartbeat(err)) => {
                assert_eq!(err.code, HeartbeatCode::PortNotAccessible);
                assert_eq!(err.original_code, FaultCode::ConnectionRefused);
            }
            other => panic!("unexpected probe result: {:?}", other),
        }

        let mut peer = attempt.accept();
        assert_eq!(peer.next_frame().await, Some(transport.id().to_string()));
        events.expect(&["status:true", "connect"]).await;
        events
            .expect(&["status:false", "disconnect", "heartbeat.error:SERVER_CRASHED"])
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_connect_resolves_on_connect() {
        let (transport, mut server, _probe) = start(TransportOptions::default());
        let (waited, _peer) = tokio::join!(
            transport.wait_for_connect(),
            accept(&mut server, &transport)
        );
        assert!(waited.is_ok());
        // Already connected: resolves at once
        transport.wait_for_connect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_connect_fails_when_closed_first() {
        let (transport, _server, _probe) = start(TransportOptions::default());
        let (waited, ()) = tokio::join!(transport.wait_for_connect(), transport.close());
        assert!(matches!(waited, Err(CoreError::Closed)));
        assert!(matches!(transport.wait_for_connect().await, Err(CoreError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_final() {
        let (transport, mut server, probe) = start(TransportOptions::default());
        let mut events = Recorder::attach(&transport);
        let heartbeats = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&heartbeats);
        let _on_heartbeat = transport.on_heartbeat(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut peer = accept(&mut server, &transport).await;
        events.expect(&["status:true", "connect"]).await;

        peer.hang_up();
        events.expect(&["status:false", "disconnect"]).await;
        transport.send(json!({"dropped": true}));

        transport.close().await;
        transport.close().await;
        assert_eq!(transport.state(), ConnectionState::Closed);
        assert!(!transport.is_connected());
        assert_eq!(transport.queued(), 0);

        let probes = probe.calls();
        let beats = heartbeats.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(probe.calls(), probes);
        assert_eq!(heartbeats.load(Ordering::SeqCst), beats);
        assert!(server.try_next_attempt().is_none());
        assert!(events.pending().is_empty());

        transport.send(json!({"after": "close"}));
        assert!(matches!(transport.probe().await, Err(CoreError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_connected_reports_disconnect() {
        let (transport, mut server, probe) = start(TransportOptions::default());
        let mut events = Recorder::attach(&transport);
        let mut peer = accept(&mut server, &transport).await;
        events.expect(&["status:true", "connect"]).await;

        probe.hang();
        transport.close().await;
        assert_eq!(events.pending(), vec!["status:false", "disconnect"]);
        assert_eq!(peer.next_frame().await, None);
        assert!(peer.client_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_closes_link() {
        let (transport, mut server, _probe) = start(TransportOptions::default());
        let mut peer = accept(&mut server, &transport).await;
        drop(transport);
        assert_eq!(peer.next_frame().await, None);
        assert!(peer.client_closed());
    }

    #[tokio::test]
    async fn test_notifications_from_superseded_session_are_dropped() {
        let (connector, _server) = MockConnector::new();
        let shared = Arc::new(Shared::default());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (mut driver, _session_rx) = Driver::new(
            TransportId::generate(),
            Url::parse("ws://localhost:1/").unwrap(),
            connector,
            MockProbe::new(),
            &TransportOptions::default(),
            Arc::clone(&shared),
            state_tx,
        );
        let messages = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&messages);
        let _on_message = shared.events.message.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        driver.start_session();
        let stale = driver.session.as_ref().map(SessionHandle::id).unwrap();
        driver.start_session();
        let current = driver.session.as_ref().map(SessionHandle::id).unwrap();
        assert_ne!(stale, current);

        for kind in [
            SessionEventKind::Handshaken,
            SessionEventKind::Message("{}".to_string()),
            SessionEventKind::Closed,
        ] {
            driver.on_session_event(SessionEvent { session: stale, kind });
        }
        assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);
        assert_eq!(messages.load(Ordering::SeqCst), 0);
        assert!(!driver.scheduler.is_pending());
        assert_eq!(driver.session.as_ref().map(SessionHandle::id), Some(current));

        driver.on_session_event(SessionEvent {
            session: current,
            kind: SessionEventKind::Handshaken,
        });
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
    }

    /// Feed session notifications to the driver until the current session handshakes
    async fn drive_to_handshake(
        driver: &mut Driver,
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            let event = rx.recv().await.unwrap();
            let current = driver.session.as_ref().map(SessionHandle::id);
            let done = current == Some(event.session)
                && matches!(event.kind, SessionEventKind::Handshaken);
            driver.on_session_event(event);
            if done {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_rebuild_does_not_write_to_released_session() {
        let (connector, mut server) = MockConnector::new();
        let shared = Arc::new(Shared::default());
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let id = TransportId::generate();
        let (mut driver, mut session_rx) = Driver::new(
            id,
            Url::parse("ws://localhost:1/").unwrap(),
            connector,
            MockProbe::new(),
            &TransportOptions::default(),
            shared,
            state_tx,
        );

        driver.start_session();
        let mut old = server.accept().await.unwrap();
        assert_eq!(old.next_frame().await, Some(id.to_string()));
        drive_to_handshake(&mut driver, &mut session_rx).await;

        // Dispatched to the first session, then released before it is written
        driver.enqueue("{\"x\":1}".to_string());
        driver.monitor.record_failure();
        driver.on_probe_result(Ok(()));
        assert!(driver.session.is_none());
        assert_eq!(old.next_frame().await, None);
        assert!(old.client_closed());

        driver.start_session();
        let mut new = server.accept().await.unwrap();
        assert_eq!(new.next_frame().await, Some(id.to_string()));
        drive_to_handshake(&mut driver, &mut session_rx).await;
        assert_eq!(new.next_frame().await.as_deref(), Some("{\"x\":1}"));
        assert_eq!(new.try_next_frame(), None);
    }
}
