//! Configuration file support.
//!
//! Everything lives under a `[wsudp]` table. `mode` selects which of the
//! `[wsudp.client]` or `[wsudp.server]` sections is used; `[wsudp.tunnel]`
//! holds optional tuning shared by both roles.

use crate::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_QUEUE_CAPACITY, DEFAULT_REDIAL_DELAY};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::net::lookup_host;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Server,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Client => write!(f, "client"),
            Mode::Server => write!(f, "server"),
        }
    }
}

/// Dials `n_mux` tunnel connections to `ws_url`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub ws_url: String,
    pub udp_listen_addr: String,
    pub udp_target_addr: String,
    pub n_mux: usize,
}

/// Accepts tunnel connections upgraded on `listen_path`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub udp_listen_addr: String,
    pub udp_target_addr: String,
    pub ws_listen_addr: String,
    pub listen_path: String,
    #[serde(default = "default_stats_path")]
    pub stats_path: String,
}

fn default_stats_path() -> String {
    "/stats".to_string()
}

impl ServerConfig {
    /// Both paths become literal HTTP routes.
    pub fn validate(&self) -> Result<()> {
        check_route("server.listen_path", &self.listen_path)?;
        check_route("server.stats_path", &self.stats_path)?;
        if self.stats_path == self.listen_path {
            bail!("server.stats_path and server.listen_path must differ");
        }
        Ok(())
    }
}

fn check_route(name: &str, path: &str) -> Result<()> {
    if !path.starts_with('/') {
        bail!("{name} must start with /, got {path}");
    }
    if path.contains(&[':', '*', '{', '}'][..]) {
        bail!("{name} must be a literal path, got {path}");
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelConfig {
    pub heartbeat_interval_ms: u64,
    pub redial_delay_ms: u64,
    pub queue_capacity: usize,
    /// Seconds between traffic log lines, 0 disables them.
    pub stats_interval_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            redial_delay_ms: DEFAULT_REDIAL_DELAY.as_millis() as u64,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stats_interval_secs: 0,
        }
    }
}

impl TunnelConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn redial_delay(&self) -> Duration {
        Duration::from_millis(self.redial_delay_ms)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            bail!("tunnel.queue_capacity must be at least 1");
        }
        if self.heartbeat_interval_ms == 0 {
            bail!("tunnel.heartbeat_interval_ms must be positive");
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

#[derive(Serialize, Deserialize)]
struct ConfigFile {
    wsudp: Config,
}

impl Config {
    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content).context("failed to parse TOML")?;
        file.wsudp.validate()?;
        Ok(file.wsudp)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(&ConfigFile {
            wsudp: self.clone(),
        })
        .context("failed to serialize config")
    }

    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Mode::Client => {
                let client = self.client()?;
                if !client.ws_url.starts_with("ws://") {
                    bail!("client.ws_url must start with ws://, got {}", client.ws_url);
                }
                if client.n_mux == 0 {
                    bail!("client.n_mux must be at least 1");
                }
            }
            Mode::Server => self.server()?.validate()?,
        }
        self.tunnel.validate()
    }

    pub fn client(&self) -> Result<&ClientConfig> {
        self.client
            .as_ref()
            .context("mode is client but [wsudp.client] is missing")
    }

    pub fn server(&self) -> Result<&ServerConfig> {
        self.server
            .as_ref()
            .context("mode is server but [wsudp.server] is missing")
    }

    pub fn example(mode: Mode) -> Self {
        match mode {
            Mode::Client => Config {
                mode,
                client: Some(ClientConfig {
                    ws_url: "ws://127.0.0.1:8080/tunnel".to_string(),
                    udp_listen_addr: "127.0.0.1:51820".to_string(),
                    udp_target_addr: "127.0.0.1:51821".to_string(),
                    n_mux: 3,
                }),
                server: None,
                tunnel: TunnelConfig::default(),
            },
            Mode::Server => Config {
                mode,
                client: None,
                server: Some(ServerConfig {
                    udp_listen_addr: "0.0.0.0:0".to_string(),
                    udp_target_addr: "127.0.0.1:51820".to_string(),
                    ws_listen_addr: "0.0.0.0:8080".to_string(),
                    listen_path: "/tunnel".to_string(),
                    stats_path: default_stats_path(),
                }),
                tunnel: TunnelConfig::default(),
            },
        }
    }
}

/// Resolves `host:port`, preferring the first address returned.
pub(crate) async fn resolve_addr(addr: &str) -> Result<SocketAddr> {
    lookup_host(addr)
        .await
        .with_context(|| format!("failed to resolve {addr}"))?
        .next()
        .with_context(|| format!("no address found for {addr}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_with_default_tuning() {
        let config = Config::from_toml(
            r#"
            [wsudp]
            mode = "client"

            [wsudp.client]
            ws_url = "ws://example.org:8080/tunnel"
            udp_listen_addr = "127.0.0.1:51820"
            udp_target_addr = "127.0.0.1:51821"
            n_mux = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.client().unwrap().n_mux, 3);
        assert!(config.server().is_err());
        assert_eq!(config.tunnel, TunnelConfig::default());
        assert_eq!(config.tunnel.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(config.tunnel.redial_delay(), Duration::from_secs(5));
        assert_eq!(config.tunnel.queue_capacity, 1024);
        assert_eq!(config.tunnel.stats_interval(), None);
    }

    #[test]
    fn parses_server_with_partial_tuning() {
        let config = Config::from_toml(
            r#"
            [wsudp]
            mode = "server"

            [wsudp.server]
            udp_listen_addr = "0.0.0.0:0"
            udp_target_addr = "127.0.0.1:51820"
            ws_listen_addr = "0.0.0.0:8080"
            listen_path = "/tunnel"

            [wsudp.tunnel]
            redial_delay_ms = 100
            stats_interval_secs = 30
            "#,
        )
        .unwrap();

        let server = config.server().unwrap();
        assert_eq!(server.stats_path, "/stats");
        assert_eq!(config.tunnel.redial_delay(), Duration::from_millis(100));
        assert_eq!(config.tunnel.heartbeat_interval_ms, 2000);
        assert_eq!(config.tunnel.stats_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn rejects_missing_mode_section() {
        let err = Config::from_toml(
            r#"
            [wsudp]
            mode = "server"
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("[wsudp.server] is missing"));
    }

    #[test]
    fn rejects_invalid_values() {
        let mut config = Config::example(Mode::Client);
        config.client.as_mut().unwrap().n_mux = 0;
        assert!(config.validate().is_err());

        let mut config = Config::example(Mode::Client);
        config.client.as_mut().unwrap().ws_url = "http://example.org/tunnel".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::example(Mode::Server);
        config.server.as_mut().unwrap().listen_path = "tunnel".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::example(Mode::Server);
        config.server.as_mut().unwrap().listen_path = "/tunnel/:id".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::example(Mode::Server);
        config.server.as_mut().unwrap().stats_path = "/*rest".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::example(Mode::Server);
        let server = config.server.as_mut().unwrap();
        server.stats_path = server.listen_path.clone();
        assert!(config.validate().is_err());

        let mut config = Config::example(Mode::Server);
        config.tunnel.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn examples_survive_toml() {
        for mode in [Mode::Client, Mode::Server] {
            let example = Config::example(mode);
            let text = example.to_toml().unwrap();
            assert!(text.contains("[wsudp]"));
            assert_eq!(Config::from_toml(&text).unwrap(), example);
        }
    }

    #[tokio::test]
    async fn resolves_literal_addresses() {
        let addr = resolve_addr("127.0.0.1:8080").await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
        assert!(resolve_addr("not an address").await.is_err());
    }
}
