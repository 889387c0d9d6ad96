use crate::config::{resolve_addr, ClientConfig, TunnelConfig};
use crate::pool::{ConnectionPool, TunnelEndpoint};
use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;

/// Dials a fixed number of self-dialing connections and relays the local
/// UDP endpoint over them.
pub struct Client {
    pool: Arc<ConnectionPool>,
}

impl Client {
    /// Binds the UDP socket and dials `n_mux` connections. Any failed dial
    /// aborts startup and tears down whatever was already dialed.
    pub async fn init(config: &ClientConfig, tunnel: &TunnelConfig) -> Result<Self> {
        let udp_listen_addr = resolve_addr(&config.udp_listen_addr).await?;
        let udp_target_addr = resolve_addr(&config.udp_target_addr).await?;
        let pool = ConnectionPool::bind(udp_listen_addr, udp_target_addr, tunnel.clone()).await?;

        for i in 0..config.n_mux {
            let dialed = pool
                .new_connection(TunnelEndpoint::Dial(config.ws_url.clone()))
                .await
                .with_context(|| format!("failed to establish connection {}/{}", i + 1, config.n_mux));
            if let Err(e) = dialed {
                pool.shutdown().await;
                return Err(e);
            }
        }
        info!(
            "client relaying {udp_listen_addr} over {} connections to {}",
            config.n_mux, config.ws_url
        );

        Ok(Client { pool })
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    /// Runs both pumps until the pool is closed.
    pub async fn listen_and_serve(self) -> Result<()> {
        self.pool.spawn_relays();
        self.pool.closed().await;
        info!("client stopped relaying");
        Ok(())
    }
}
