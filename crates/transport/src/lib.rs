//! Keel transport: the persistent, reconnecting channel to the control plane.
//!
//! A supervisor task walks `Connecting -> Connected -> Backoff(n) -> Connecting`.
//! On every connect it sends `Hello`, requests a full resync and replays
//! status frames the control plane has not acknowledged yet, oldest first.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use keel_core::{Backoff, BackoffConfig, ClusterEvent, ConvergenceStatus};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[cfg(any(test, feature = "testing"))]
pub mod channel;
pub mod connector;
pub mod protocol;

#[cfg(any(test, feature = "testing"))]
pub use channel::{ChannelConnector, ChannelPeer, PeerSession};
pub use connector::{Connector, Session, TcpConnector};
pub use protocol::{DesiredMessage, Inbound, Outbound, ResourceEntry};

pub const RESYNC_ON_RECONNECT: &str = "reconnect";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("io: {0}")]
    Io(String),
    /// A single frame could not be encoded or decoded; the session survives.
    #[error("codec: {0}")]
    Codec(String),
    #[error("connect timed out")]
    Timeout,
    #[error("closed by peer")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub endpoint: String,
    /// Cluster identity announced in `Hello`.
    pub cluster: String,
    pub agent_version: String,
    pub backoff: BackoffConfig,
    /// Connect attempts allowed before the first session; later reconnects are unbounded.
    pub initial_connect_attempts: u32,
    pub connect_timeout_ms: u64,
    /// Capacity of the status queue between `publish` and the wire.
    pub outbound_queue: usize,
    /// Unacknowledged status frames kept for replay.
    pub replay_buffer: usize,
    pub event_queue: usize,
    /// Capacity of the cluster-event queue; events are dropped while disconnected.
    pub cluster_event_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:7443".into(),
            cluster: String::new(),
            agent_version: env!("CARGO_PKG_VERSION").into(),
            backoff: BackoffConfig::default(),
            initial_connect_attempts: 10,
            connect_timeout_ms: 5_000,
            outbound_queue: 1024,
            replay_buffer: 4096,
            event_queue: 256,
            cluster_event_queue: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A session is up; the resync request has already been sent on it.
    Connected { session: u64 },
    Desired(DesiredMessage),
    Disconnected { session: u64, reason: String },
    /// The initial connect budget ran out; the supervisor has stopped.
    Exhausted { attempts: u32, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Backoff(u32),
    Stopped,
}

enum Control {
    Resync(String),
}

/// Cloneable publishing side of the transport.
#[derive(Clone)]
pub struct TransportHandle {
    out_tx: mpsc::Sender<ConvergenceStatus>,
    evt_tx: mpsc::Sender<ClusterEvent>,
    ctl_tx: mpsc::UnboundedSender<Control>,
    state_rx: watch::Receiver<LinkState>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl TransportHandle {
    /// Queue a status report. Never waits; when the queue is full the report
    /// is dropped and `false` returned.
    pub fn publish(&self, status: ConvergenceStatus) -> bool {
        match self.out_tx.try_send(status) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(s)) => {
                counter!("status_dropped_total", 1u64);
                warn!(descriptor = %s.descriptor, "status queue full; dropping report");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a cluster event for the current session. Never waits.
    pub fn publish_event(&self, event: ClusterEvent) -> bool {
        match self.evt_tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!("cluster_events_dropped_total", 1u64);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the control plane for a full snapshot on the current session.
    /// Ignored while disconnected: every new session requests one anyway.
    pub fn request_resync(&self, reason: &str) { let _ = self.ctl_tx.send(Control::Resync(reason.to_string())); }

    pub fn state(&self) -> LinkState { *self.state_rx.borrow() }
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> { self.state_rx.clone() }

    /// Stop the supervisor after flushing queued status frames to the current session.
    pub fn shutdown(&self) { let _ = self.stop_tx.send(true); }
}

pub struct Transport;

impl Transport {
    /// Spawn the connection supervisor. The returned receiver is the lazy
    /// sequence of sessions and the desired-state messages they carry.
    pub fn spawn(connector: Arc<dyn Connector>, cfg: TransportConfig) -> (TransportHandle, mpsc::Receiver<TransportEvent>) {
        let (out_tx, out_rx) = mpsc::channel(cfg.outbound_queue.max(1));
        let (evt_tx, evt_rx) = mpsc::channel(cfg.cluster_event_queue.max(1));
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::channel(cfg.event_queue.max(1));
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (stop_tx, stop_rx) = watch::channel(false);
        let sup = Supervisor {
            connector,
            backoff: Backoff::new(cfg.backoff),
            cfg,
            out_rx,
            evt_rx,
            ctl_rx,
            ev_tx,
            state_tx,
            stop_rx,
            replay: VecDeque::new(),
            seq: 0,
            session: 0,
        };
        tokio::spawn(sup.run());
        (TransportHandle { out_tx, evt_tx, ctl_tx, state_rx, stop_tx: Arc::new(stop_tx) }, ev_rx)
    }
}

enum SessionEnd {
    Lost(String),
    Stop,
}

struct Supervisor {
    connector: Arc<dyn Connector>,
    cfg: TransportConfig,
    backoff: Backoff,
    out_rx: mpsc::Receiver<ConvergenceStatus>,
    evt_rx: mpsc::Receiver<ClusterEvent>,
    ctl_rx: mpsc::UnboundedReceiver<Control>,
    ev_tx: mpsc::Sender<TransportEvent>,
    state_tx: watch::Sender<LinkState>,
    stop_rx: watch::Receiver<bool>,
    replay: VecDeque<(u64, ConvergenceStatus)>,
    seq: u64,
    session: u64,
}

impl Supervisor {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        loop {
            if *self.stop_rx.borrow() { break; }
            self.set_state(LinkState::Connecting);
            let timeout = Duration::from_millis(self.cfg.connect_timeout_ms);
            let attempt = match tokio::time::timeout(timeout, self.connector.connect(&self.cfg.endpoint)).await {
                Ok(r) => r,
                Err(_) => Err(TransportError::Timeout),
            };
            match attempt {
                Ok(session) => {
                    self.backoff.reset();
                    failures = 0;
                    self.session += 1;
                    let id = self.session;
                    match self.run_session(session).await {
                        SessionEnd::Stop => break,
                        SessionEnd::Lost(reason) => {
                            warn!(session = id, %reason, "control-plane session lost");
                            counter!("transport_reconnects_total", 1u64);
                            if self.ev_tx.send(TransportEvent::Disconnected { session: id, reason }).await.is_err() { break; }
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(endpoint = %self.cfg.endpoint, attempt = failures, error = %e, "connect failed");
                    if self.session == 0 && failures >= self.cfg.initial_connect_attempts {
                        let _ = self.ev_tx.send(TransportEvent::Exhausted { attempts: failures, reason: e.to_string() }).await;
                        break;
                    }
                }
            }
            if !self.wait_backoff().await { break; }
        }
        self.set_state(LinkState::Stopped);
        info!("transport stopped");
    }

    fn set_state(&self, s: LinkState) {
        gauge!("transport_connected", if s == LinkState::Connected { 1.0 } else { 0.0 });
        self.state_tx.send_replace(s);
    }

    /// Sleep out the backoff while still accepting status reports into the replay buffer.
    async fn wait_backoff(&mut self) -> bool {
        let n = self.backoff.attempt() + 1;
        let delay = self.backoff.next_delay();
        self.set_state(LinkState::Backoff(n));
        debug!(attempt = n, delay_ms = delay.as_millis() as u64, "backing off before reconnect");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = self.stop_rx.changed() => if changed.is_err() || *self.stop_rx.borrow() { return false; },
                status = self.out_rx.recv() => match status {
                    Some(s) => { self.stage(s); }
                    None => return false,
                },
                // Resync requests are implied by the next connect.
                Some(_) = self.ctl_rx.recv() => {}
                Some(_) = self.evt_rx.recv() => { counter!("cluster_events_dropped_total", 1u64); }
            }
        }
    }

    /// Assign the next sequence number and keep the frame until acknowledged.
    fn stage(&mut self, status: ConvergenceStatus) -> Outbound {
        self.seq += 1;
        if self.replay.len() >= self.cfg.replay_buffer.max(1) {
            self.replay.pop_front();
            counter!("status_dropped_total", 1u64);
        }
        self.replay.push_back((self.seq, status.clone()));
        Outbound::Status { seq: self.seq, status }
    }

    async fn run_session(&mut self, mut session: Session) -> SessionEnd {
        let id = self.session;
        let hello = Outbound::Hello { cluster: self.cfg.cluster.clone(), agent_version: self.cfg.agent_version.clone() };
        if let Err(e) = session.outbound.send(hello).await { return SessionEnd::Lost(e.to_string()); }
        let resync = Outbound::ResyncRequest { reason: RESYNC_ON_RECONNECT.to_string() };
        if let Err(e) = session.outbound.send(resync).await { return SessionEnd::Lost(e.to_string()); }
        let pending: Vec<Outbound> = self.replay.iter().map(|(seq, s)| Outbound::Status { seq: *seq, status: s.clone() }).collect();
        if !pending.is_empty() {
            info!(session = id, frames = pending.len(), "replaying unacknowledged status");
        }
        for frame in pending {
            if let Err(e) = session.outbound.send(frame).await { return SessionEnd::Lost(e.to_string()); }
        }
        // Resync requests queued before this session are covered by the one just sent.
        while self.ctl_rx.try_recv().is_ok() {}

        self.set_state(LinkState::Connected);
        info!(session = id, endpoint = %self.cfg.endpoint, "control-plane session established");
        if self.ev_tx.send(TransportEvent::Connected { session: id }).await.is_err() { return SessionEnd::Stop; }

        loop {
            tokio::select! {
                frame = session.inbound.next() => match frame {
                    Some(Ok(Inbound::Ack { seq })) => {
                        self.replay.retain(|(s, _)| *s > seq);
                    }
                    Some(Ok(msg)) => {
                        if let Some(desired) = msg.into_desired() {
                            debug!(session = id, generation = desired.generation(), "desired state received");
                            if self.ev_tx.send(TransportEvent::Desired(desired)).await.is_err() { return SessionEnd::Stop; }
                        }
                    }
                    Some(Err(TransportError::Codec(reason))) => {
                        counter!("transport_bad_frames_total", 1u64);
                        warn!(session = id, %reason, "skipping undecodable frame");
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost(TransportError::Closed.to_string()),
                },
                status = self.out_rx.recv() => match status {
                    Some(s) => {
                        let frame = self.stage(s);
                        if let Err(e) = session.outbound.send(frame).await { return SessionEnd::Lost(e.to_string()); }
                    }
                    None => return SessionEnd::Stop,
                },
                Some(event) = self.evt_rx.recv() => {
                    counter!("cluster_events_forwarded_total", 1u64);
                    if let Err(e) = session.outbound.send(Outbound::Event { event }).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                Some(Control::Resync(reason)) = self.ctl_rx.recv() => {
                    info!(session = id, %reason, "requesting full resync");
                    if let Err(e) = session.outbound.send(Outbound::ResyncRequest { reason }).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        self.flush(&mut session).await;
                        return SessionEnd::Stop;
                    }
                }
            }
        }
    }

    async fn flush(&mut self, session: &mut Session) {
        let mut sent = 0usize;
        while let Ok(s) = self.out_rx.try_recv() {
            let frame = self.stage(s);
            if session.outbound.send(frame).await.is_err() { break; }
            sent += 1;
        }
        let _ = session.outbound.close().await;
        debug!(frames = sent, "flushed status before shutdown");
    }
}
