//! One tunnel connection and the loops that keep it relaying.
//!
//! Every connection runs a sender, a receiver and a heartbeat ticker against
//! the queues of its [`ConnectionPool`]. Self-dialing connections also run a
//! redial loop that replaces the link whenever a transfer fails; accepted
//! connections simply terminate.

use crate::link::TunnelLink;
use crate::pool::ConnectionPool;
use crate::tunnel_info_bridge::TunnelInfoBridge;
use crate::udp::UdpPacket;
use crate::HEARTBEAT_QUEUE_DEPTH;
use anyhow::anyhow;
use backon::{ConstantBuilder, Retryable};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

const LINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// The link is usable.
    Connected,
    /// The link failed and is being replaced.
    Reconnecting,
    /// No further transfers or reconnect attempts.
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Dials `url` and dials it again whenever the link fails.
    SelfDialing { url: String },
    /// Produced by an inbound handshake; a failure ends it for good.
    Accepted,
}

impl ConnectionMode {
    pub fn can_dial(&self) -> bool {
        matches!(self, ConnectionMode::SelfDialing { .. })
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::SelfDialing { url } => write!(f, "self-dialing to {url}"),
            ConnectionMode::Accepted => write!(f, "accepted"),
        }
    }
}

/// What the loop that hit a transfer error should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Keep looping, the link is being replaced.
    Resumable,
    /// Exit, the connection is gone.
    Terminal,
}

pub struct TunnelConnection {
    id: u64,
    mode: ConnectionMode,
    /// Loops performing I/O hold a read guard for the duration of each call;
    /// the redial loop holds the write guard while it swaps the link.
    link: RwLock<Option<TunnelLink>>,
    state: watch::Sender<ConnectionState>,
    redial_tx: Option<mpsc::Sender<()>>,
    info_bridge: TunnelInfoBridge,
}

impl TunnelConnection {
    /// Wraps an established link. For self-dialing connections the returned
    /// receiver must be handed to [`TunnelConnection::run`].
    pub(crate) fn new(
        id: u64,
        mode: ConnectionMode,
        link: TunnelLink,
        info_bridge: TunnelInfoBridge,
    ) -> (Arc<Self>, Option<mpsc::Receiver<()>>) {
        let (redial_tx, redial_rx) = if mode.can_dial() {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (state, _) = watch::channel(ConnectionState::Connected);

        let conn = Arc::new(TunnelConnection {
            id,
            mode,
            link: RwLock::new(Some(link)),
            state,
            redial_tx,
            info_bridge,
        });
        (conn, redial_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> &ConnectionMode {
        &self.mode
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_closing(&self) -> bool {
        self.state() == ConnectionState::Terminated
    }

    /// Reports a failed transfer on the current link.
    ///
    /// A self-dialing connection moves to `Reconnecting` and wakes its redial
    /// loop; repeated reports while already reconnecting are ignored. An
    /// accepted connection terminates.
    pub fn fail(&self, reason: &dyn fmt::Display) -> FailureOutcome {
        match &self.mode {
            ConnectionMode::SelfDialing { .. } => {
                let reconnecting = self.state.send_if_modified(|state| {
                    if *state == ConnectionState::Connected {
                        *state = ConnectionState::Reconnecting;
                        true
                    } else {
                        false
                    }
                });
                if reconnecting {
                    warn!("connection {} failed, will reconnect: {reason}", self.id);
                    self.info_bridge
                        .post_state(self.id, ConnectionState::Reconnecting);
                    if let Some(redial_tx) = &self.redial_tx {
                        // a pending signal already covers this failure
                        let _ = redial_tx.try_send(());
                    }
                }

                if self.is_closing() {
                    FailureOutcome::Terminal
                } else {
                    FailureOutcome::Resumable
                }
            }
            ConnectionMode::Accepted => {
                if self.terminate() {
                    warn!("connection {} failed, closing: {reason}", self.id);
                }
                FailureOutcome::Terminal
            }
        }
    }

    /// Moves to `Terminated`. Returns `false` if it already was.
    pub fn terminate(&self) -> bool {
        let terminated = self.state.send_if_modified(|state| {
            if *state != ConnectionState::Terminated {
                *state = ConnectionState::Terminated;
                true
            } else {
                false
            }
        });
        if terminated {
            debug!("connection {} terminated", self.id);
            self.info_bridge
                .post_state(self.id, ConnectionState::Terminated);
        }
        terminated
    }

    fn mark_connected(&self) -> bool {
        let connected = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Reconnecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if connected {
            self.info_bridge
                .post_state(self.id, ConnectionState::Connected);
        }
        connected
    }

    /// Waits out a reconnect. Returns `false` if the connection terminated.
    async fn wait_connected(&self) -> bool {
        let mut state = self.state.subscribe();
        let connected = match state
            .wait_for(|state| *state != ConnectionState::Reconnecting)
            .await
        {
            Ok(state) => *state == ConnectionState::Connected,
            Err(_) => false,
        };
        connected
    }

    /// Resolves as soon as the link may no longer be used.
    async fn disconnected(&self) {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|state| *state != ConnectionState::Connected)
            .await;
    }

    async fn terminated(&self) {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Terminated)
            .await;
    }

    /// Runs every loop of this connection and returns once all have exited.
    pub(crate) async fn run(
        self: Arc<Self>,
        pool: Arc<ConnectionPool>,
        redial_rx: Option<mpsc::Receiver<()>>,
    ) {
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(HEARTBEAT_QUEUE_DEPTH);
        let heartbeat_interval = pool.config().heartbeat_interval();
        let redial_delay = pool.config().redial_delay();

        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().run_sender(pool.clone(), heartbeat_rx));
        tasks.spawn(self.clone().run_receiver(pool.clone()));
        tasks.spawn(self.clone().run_heartbeat(heartbeat_tx, heartbeat_interval));
        if let (ConnectionMode::SelfDialing { url }, Some(redial_rx)) = (&self.mode, redial_rx) {
            tasks.spawn(
                self.clone()
                    .run_redial(url.clone(), redial_rx, redial_delay),
            );
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("connection {} task failed: {e}", self.id);
            }
            // the loops only return when the connection or the pool is done
            self.terminate();
        }

        let link = self.link.write().await.take();
        if let Some(link) = link {
            if timeout(LINK_CLOSE_TIMEOUT, link.close()).await.is_err() {
                debug!("connection {} timed out closing its link", self.id);
            }
        }
        info!("connection {} closed ({})", self.id, self.mode);
    }

    async fn run_sender(
        self: Arc<Self>,
        pool: Arc<ConnectionPool>,
        mut heartbeat_rx: mpsc::Receiver<()>,
    ) {
        let _active = pool.counters().track_sender();
        let mut heartbeat_open = true;
        while self.wait_connected().await {
            tokio::select! {
                packet = pool.to_tunnel().pop() => {
                    let Some(packet) = packet else {
                        break;
                    };
                    if self.is_closing() {
                        pool.to_tunnel().requeue(packet);
                        break;
                    }
                    if !self.send_packet(&pool, packet).await {
                        break;
                    }
                }
                tick = heartbeat_rx.recv(), if heartbeat_open => match tick {
                    Some(()) => {
                        if !self.send_ping().await {
                            break;
                        }
                    }
                    None => heartbeat_open = false,
                },
                _ = self.terminated() => break,
            }
        }
        debug!("connection {} sender exited", self.id);
    }

    /// Writes one packet. Returns whether the sender should keep running.
    async fn send_packet(&self, pool: &ConnectionPool, packet: UdpPacket) -> bool {
        let link = self.link.read().await;
        let result = match link.as_ref() {
            Some(current) => tokio::select! {
                biased;
                _ = self.disconnected() => Err(anyhow!("link interrupted")),
                result = current.send_packet(packet.data()) => result,
            },
            None => Err(anyhow!("no link")),
        };

        match result {
            Ok(()) => {
                drop(link);
                pool.counters().inc_sent_tunnel_packets();
                trace!("connection {} sent {} bytes", self.id, packet.len());
                packet.release();
                true
            }
            Err(e) => {
                drop(link);
                pool.to_tunnel().requeue(packet);
                self.fail(&e) == FailureOutcome::Resumable
            }
        }
    }

    async fn send_ping(&self) -> bool {
        let link = self.link.read().await;
        let result = match link.as_ref() {
            Some(current) => tokio::select! {
                biased;
                _ = self.disconnected() => Err(anyhow!("link interrupted")),
                result = current.send_ping() => result,
            },
            None => Err(anyhow!("no link")),
        };

        match result {
            Ok(()) => true,
            Err(e) => self.fail(&e) == FailureOutcome::Resumable,
        }
    }

    async fn run_receiver(self: Arc<Self>, pool: Arc<ConnectionPool>) {
        let _active = pool.counters().track_receiver();
        while self.wait_connected().await {
            let link = self.link.read().await;
            let Some(current) = link.as_ref() else {
                if self.fail(&"no link") == FailureOutcome::Terminal {
                    break;
                }
                continue;
            };

            let message = tokio::select! {
                message = current.recv() => message,
                _ = self.disconnected() => continue,
            };

            let reason = match message {
                Some(Ok(Message::Binary(data))) => {
                    drop(link);
                    let mut packet = UdpPacket::acquire();
                    if packet.fill_from(&data) < data.len() {
                        debug!(
                            "connection {} truncated a {} byte message to {} bytes",
                            self.id,
                            data.len(),
                            packet.len()
                        );
                    }
                    pool.counters().inc_recv_tunnel_packets();
                    trace!("connection {} received {} bytes", self.id, packet.len());
                    if !pool.to_udp().push(packet).await {
                        break;
                    }
                    continue;
                }
                Some(Ok(Message::Close(frame))) => anyhow!("closed by peer: {frame:?}"),
                // pings, pongs and text are not tunnel traffic
                Some(Ok(_)) => continue,
                Some(Err(e)) => e,
                None => anyhow!("stream ended"),
            };

            let outcome = self.fail(&reason);
            drop(link);
            if outcome == FailureOutcome::Terminal {
                break;
            }
        }
        debug!("connection {} receiver exited", self.id);
    }

    async fn run_heartbeat(self: Arc<Self>, heartbeat_tx: mpsc::Sender<()>, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // the sender is behind if the channel is full, drop the tick
                    let _ = heartbeat_tx.try_send(());
                }
                _ = self.terminated() => break,
            }
        }
        // dropping heartbeat_tx closes the channel
        debug!("connection {} heartbeat exited", self.id);
    }

    async fn run_redial(
        self: Arc<Self>,
        url: String,
        mut redial_rx: mpsc::Receiver<()>,
        delay: Duration,
    ) {
        loop {
            tokio::select! {
                signal = redial_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
                _ = self.terminated() => break,
            }

            let mut link = tokio::select! {
                link = self.link.write() => link,
                _ = self.terminated() => break,
            };

            if let Some(stale) = link.take() {
                if timeout(LINK_CLOSE_TIMEOUT, stale.close()).await.is_err() {
                    debug!("connection {} timed out closing the stale link", self.id);
                }
            }

            let backoff = ConstantBuilder::default()
                .with_delay(delay)
                .with_max_times(usize::MAX);
            let redial = (|| TunnelLink::dial(&url))
                .retry(backoff)
                .notify(|err: &anyhow::Error, dur: Duration| {
                    warn!(
                        "connection {} failed to redial: {err:#}, retry in {}s",
                        self.id,
                        dur.as_secs_f32()
                    );
                });

            let fresh = tokio::select! {
                fresh = redial => fresh,
                _ = self.terminated() => break,
            };

            match fresh {
                Ok(fresh) => {
                    *link = Some(fresh);
                    drop(link);
                    if self.mark_connected() {
                        info!("connection {} reconnected to {url}", self.id);
                    }
                }
                Err(e) => {
                    error!("connection {} gave up redialing: {e:#}", self.id);
                    drop(link);
                    self.terminate();
                    break;
                }
            }
        }
        debug!("connection {} redial loop exited", self.id);
    }
}

impl fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish()
    }
}
