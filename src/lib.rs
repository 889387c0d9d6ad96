//! Relays UDP datagrams over a pool of multiplexed WebSocket connections.
//!
//! A [`ConnectionPool`] owns one UDP socket and two bounded relay queues. Any
//! number of [`TunnelConnection`]s share those queues, so datagrams fan out
//! over every live connection. The [`Server`] role accepts connections and
//! the [`Client`] role dials them and keeps them alive.

mod client;
mod config;
mod connection;
mod link;
mod pool;
mod queue;
mod server;
mod stats;
mod tunnel_info_bridge;
mod udp;

use byte_pool::BytePool;
use lazy_static::lazy_static;
use std::time::Duration;

pub use client::Client;
pub use config::{ClientConfig, Config, Mode, ServerConfig, TunnelConfig};
pub use connection::{ConnectionMode, ConnectionState, FailureOutcome, TunnelConnection};
pub use link::TunnelLink;
pub use pool::{ConnectionInfo, ConnectionPool, TunnelEndpoint};
pub use queue::RelayQueue;
pub use server::Server;
pub use stats::Stats;
pub use tunnel_info_bridge::TunnelTraffic;
pub use udp::UdpPacket;

/// Capacity of every packet buffer, larger than any datagram we expect to relay.
pub const UDP_PACKET_SIZE: usize = 4096;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_REDIAL_DELAY: Duration = Duration::from_secs(5);
pub const HEARTBEAT_QUEUE_DEPTH: usize = 3;

lazy_static! {
    static ref BUFFER_POOL: BytePool::<Vec<u8>> = BytePool::<Vec<u8>>::new();
}
