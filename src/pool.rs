//! The UDP side of the tunnel and the registry of tunnel connections.

use crate::config::TunnelConfig;
use crate::connection::{ConnectionMode, ConnectionState, TunnelConnection};
use crate::link::TunnelLink;
use crate::queue::RelayQueue;
use crate::stats::Stats;
use crate::tunnel_info_bridge::{TunnelInfoBridge, TunnelTraffic};
use crate::udp::UdpPacket;
use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use log::{debug, info, trace, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tokio::time::{interval_at, Instant};

/// How a new tunnel connection comes to exist.
pub enum TunnelEndpoint {
    /// Dial this `ws://` URL now, and again whenever the link fails.
    Dial(String),
    /// A link produced by an inbound handshake.
    Accepted(TunnelLink),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub mode: ConnectionMode,
    pub state: ConnectionState,
}

/// Owns the UDP socket, both relay queues, the traffic counters and every
/// live [`TunnelConnection`].
///
/// Datagrams read from the socket go to `to_tunnel`, where any connection's
/// sender picks them up. Messages read by any connection's receiver go to
/// `to_udp`, which a single pump writes to the target address.
pub struct ConnectionPool {
    /// Taken by [`ConnectionPool::close`]; the pumps hold a clone only while
    /// they use it.
    socket: RwLock<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    udp_target_addr: SocketAddr,
    to_tunnel: RelayQueue,
    to_udp: RelayQueue,
    stats: Stats,
    config: TunnelConfig,
    closing: watch::Sender<bool>,
    connections: DashMap<u64, Arc<TunnelConnection>>,
    next_connection_id: AtomicU64,
    drained: Notify,
    active_pumps: watch::Sender<usize>,
    info_bridge: RwLock<TunnelInfoBridge>,
}

/// Counts a running pump for as long as it is alive.
struct PumpGuard<'a>(&'a watch::Sender<usize>);

impl<'a> PumpGuard<'a> {
    fn enter(active_pumps: &'a watch::Sender<usize>) -> Self {
        active_pumps.send_modify(|n| *n += 1);
        PumpGuard(active_pumps)
    }
}

impl Drop for PumpGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}

impl ConnectionPool {
    /// Binds the UDP socket and allocates the relay queues.
    pub async fn bind(
        udp_listen_addr: SocketAddr,
        udp_target_addr: SocketAddr,
        config: TunnelConfig,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(udp_listen_addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {udp_listen_addr}"))?;
        let local_addr = socket.local_addr()?;
        info!("UDP socket bound on {local_addr}, relaying to {udp_target_addr}");

        let (closing, _) = watch::channel(false);
        let (active_pumps, _) = watch::channel(0);
        Ok(Arc::new(ConnectionPool {
            socket: RwLock::new(Some(Arc::new(socket))),
            local_addr,
            udp_target_addr,
            to_tunnel: RelayQueue::new(config.queue_capacity),
            to_udp: RelayQueue::new(config.queue_capacity),
            stats: Stats::new(),
            config,
            closing,
            connections: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            drained: Notify::new(),
            active_pumps,
            info_bridge: RwLock::new(TunnelInfoBridge::new()),
        }))
    }

    /// The address the UDP socket was bound to, also after it was closed.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        match self.socket.read() {
            Ok(socket) => socket.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn take_socket(&self) -> Option<Arc<UdpSocket>> {
        match self.socket.write() {
            Ok(mut socket) => socket.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn udp_target_addr(&self) -> SocketAddr {
        self.udp_target_addr
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// A snapshot of the packet counters.
    pub fn stats(&self) -> TunnelTraffic {
        self.stats.snapshot()
    }

    pub fn queued_to_tunnel(&self) -> usize {
        self.to_tunnel.len()
    }

    pub fn queued_to_udp(&self) -> usize {
        self.to_udp.len()
    }

    pub(crate) fn counters(&self) -> &Stats {
        &self.stats
    }

    pub(crate) fn to_tunnel(&self) -> &RelayQueue {
        &self.to_tunnel
    }

    pub(crate) fn to_udp(&self) -> &RelayQueue {
        &self.to_udp
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Live connections ordered by id.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|entry| ConnectionInfo {
                id: *entry.key(),
                mode: entry.value().mode().clone(),
                state: entry.value().state(),
            })
            .collect();
        connections.sort_by_key(|conn| conn.id);
        connections
    }

    /// Installs a listener for JSON state and traffic records. Connections
    /// registered before this call keep reporting to the previous listener.
    pub fn set_info_listener(&self, listener: impl FnMut(&str) + 'static + Send + Sync) {
        match self.info_bridge.write() {
            Ok(mut bridge) => bridge.set_listener(listener),
            Err(poisoned) => poisoned.into_inner().set_listener(listener),
        }
    }

    fn info_bridge(&self) -> TunnelInfoBridge {
        match self.info_bridge.read() {
            Ok(bridge) => bridge.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Resolves once [`ConnectionPool::close`] has been called.
    pub async fn closed(&self) {
        let mut closing = self.closing.subscribe();
        let _ = closing.wait_for(|closing| *closing).await;
    }

    /// Registers a tunnel connection and starts its loops. Dialing happens
    /// here, so an unreachable URL fails the call.
    pub async fn new_connection(self: &Arc<Self>, endpoint: TunnelEndpoint) -> Result<u64> {
        if self.is_closing() {
            bail!("connection pool is closed");
        }

        let (mode, link) = match endpoint {
            TunnelEndpoint::Dial(url) => {
                let link = TunnelLink::dial(&url).await?;
                (ConnectionMode::SelfDialing { url }, link)
            }
            TunnelEndpoint::Accepted(link) => (ConnectionMode::Accepted, link),
        };

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let info_bridge = self.info_bridge();
        info_bridge.post_state(id, ConnectionState::Connected);
        let (conn, redial_rx) = TunnelConnection::new(id, mode, link, info_bridge);
        self.connections.insert(id, conn.clone());
        info!("connection {id} registered ({})", conn.mode());

        if self.is_closing() {
            // lost the race with close(), which did not see this connection
            conn.terminate();
        }

        let pool = self.clone();
        tokio::spawn(async move {
            conn.run(pool.clone(), redial_rx).await;
            pool.unregister(id);
        });
        Ok(id)
    }

    fn unregister(&self, id: u64) {
        if self.connections.remove(&id).is_some() {
            debug!("connection {id} unregistered");
        }
        self.drained.notify_waiters();
    }

    /// Reads datagrams from the UDP socket into `to_tunnel` until the pool
    /// closes. Blocks whenever `to_tunnel` is full.
    pub async fn forward_udp_to_tunnel(&self) {
        let _pump = PumpGuard::enter(&self.active_pumps);
        let Some(socket) = self.socket() else {
            return;
        };
        let mut closing = self.closing.subscribe();
        while !self.is_closing() {
            let mut packet = UdpPacket::acquire();
            let result = tokio::select! {
                result = socket.recv_from(packet.buf_mut()) => result,
                _ = closing.wait_for(|closing| *closing) => break,
            };

            match result {
                Ok((len, peer)) => {
                    packet.set_len(len);
                    self.stats.inc_recv_udp_packets();
                    trace!("received {len} bytes from {peer}");
                    if !self.to_tunnel.push(packet).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!("failed to read from UDP socket: {e}");
                    packet.release();
                }
            }
        }
        debug!("UDP to tunnel forwarding stopped");
    }

    /// Writes everything arriving on `to_udp` to the target address until the
    /// pool closes and the queue is drained.
    pub async fn forward_tunnel_to_udp(&self) {
        let _pump = PumpGuard::enter(&self.active_pumps);
        while let Some(packet) = self.to_udp.pop().await {
            let Some(socket) = self.socket() else {
                packet.release();
                break;
            };
            match socket.send_to(packet.data(), self.udp_target_addr).await {
                Ok(_) => {
                    self.stats.inc_sent_udp_packets();
                    trace!("sent {} bytes to {}", packet.len(), self.udp_target_addr);
                }
                Err(e) => warn!(
                    "failed to send {} bytes to {}: {e}",
                    packet.len(),
                    self.udp_target_addr
                ),
            }
            packet.release();
        }
        debug!("tunnel to UDP forwarding stopped");
    }

    /// Spawns both pumps, plus the traffic reporter if one is configured.
    pub fn spawn_relays(self: &Arc<Self>) {
        tokio::spawn({
            let pool = self.clone();
            async move { pool.forward_udp_to_tunnel().await }
        });
        tokio::spawn({
            let pool = self.clone();
            async move { pool.forward_tunnel_to_udp().await }
        });
        if let Some(period) = self.config.stats_interval() {
            let pool = self.clone();
            tokio::spawn(async move { pool.report_traffic(period).await });
        }
    }

    /// Logs and publishes a traffic snapshot every `period` until the pool
    /// closes.
    pub async fn report_traffic(&self, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let traffic = self.stats();
                    info!("traffic: {traffic}");
                    self.info_bridge().post_traffic(traffic);
                }
                _ = self.closed() => break,
            }
        }
    }

    /// Stops relaying: closes both queues, drops the UDP socket and terminates
    /// every connection. Pumps and connection loops exit on their own shortly
    /// after; a pump in the middle of a socket call keeps the socket open
    /// until that call returns.
    pub fn close(&self) {
        if self.closing.send_replace(true) {
            return;
        }
        info!("closing connection pool");

        self.to_tunnel.close();
        self.to_udp.close();
        drop(self.take_socket());
        let connections: Vec<Arc<TunnelConnection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in connections {
            conn.terminate();
        }
    }

    /// Closes the pool and waits until every connection and pump has
    /// finished, so the UDP address is free again when this returns.
    pub async fn shutdown(&self) {
        self.close();
        loop {
            let drained = self.drained.notified();
            if self.connections.is_empty() {
                break;
            }
            drained.await;
        }
        let mut active_pumps = self.active_pumps.subscribe();
        let _ = active_pumps.wait_for(|n| *n == 0).await;
        info!("connection pool shut down");
    }
}
