use crate::config::{resolve_addr, ServerConfig, TunnelConfig};
use crate::link::TunnelLink;
use crate::pool::{ConnectionPool, TunnelEndpoint};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Accepts WebSocket upgrades on `listen_path` and relays everything they
/// carry to the configured UDP target. Serves the traffic counters as text
/// on `stats_path`; every other path is a 404.
pub struct Server {
    pool: Arc<ConnectionPool>,
    listener: TcpListener,
    listen_path: String,
    stats_path: String,
}

impl Server {
    pub async fn init(config: &ServerConfig, tunnel: &TunnelConfig) -> Result<Self> {
        config.validate()?;
        let udp_listen_addr = resolve_addr(&config.udp_listen_addr).await?;
        let udp_target_addr = resolve_addr(&config.udp_target_addr).await?;
        let ws_listen_addr = resolve_addr(&config.ws_listen_addr).await?;

        let pool = ConnectionPool::bind(udp_listen_addr, udp_target_addr, tunnel.clone()).await?;
        let listener = TcpListener::bind(ws_listen_addr)
            .await
            .with_context(|| format!("failed to listen on {ws_listen_addr}"))?;
        info!(
            "server listening on ws://{}{}",
            listener.local_addr()?,
            config.listen_path
        );

        Ok(Server {
            pool,
            listener,
            listen_path: config.listen_path.clone(),
            stats_path: config.stats_path.clone(),
        })
    }

    /// Address of the WebSocket listener.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    fn router(&self) -> Router {
        Router::new()
            .route(&self.listen_path, get(upgrade_tunnel))
            .route(&self.stats_path, get(serve_stats))
            .with_state(self.pool.clone())
    }

    /// Runs the pumps and the HTTP server until the pool is closed.
    pub async fn listen_and_serve(self) -> Result<()> {
        self.pool.spawn_relays();

        let app = self.router();
        let pool = self.pool.clone();
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { pool.closed().await })
        .await
        .context("HTTP server failed")?;

        info!("server stopped accepting connections");
        Ok(())
    }
}

async fn upgrade_tunnel(
    State(pool): State<Arc<ConnectionPool>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let link = TunnelLink::from_axum(socket);
        match pool.new_connection(TunnelEndpoint::Accepted(link)).await {
            Ok(id) => info!("accepted connection {id} from {peer}"),
            Err(e) => warn!("dropped upgrade from {peer}: {e:#}"),
        }
    })
}

async fn serve_stats(State(pool): State<Arc<ConnectionPool>>) -> impl IntoResponse {
    ([(CONTENT_TYPE, "text/plain")], pool.stats().to_string())
}
