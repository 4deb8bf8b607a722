use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 4221;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_BOOK_DEPTH: u32 = 3;
pub const DEFAULT_API_BASE: &str = "https://test.deribit.com/api/v2";

/// Startup configuration for the relay. Sources, lowest precedence first:
/// built-in defaults, optional `lobcast.toml`, `LOBCAST_*` environment
/// variables. CLI flags override individual fields on top of this.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Listening port for the websocket server.
    pub port: u16,
    /// Delay between poll cycles, in seconds.
    pub poll_interval_secs: u64,
    /// Order-book depth requested from the upstream per snapshot.
    pub book_depth: u32,
    /// Base URL of the Deribit HTTP API.
    pub api_base: String,
    /// Prometheus exporter port (used with the `metrics-exporter` feature).
    pub metrics_port: u16,
}

impl RelayConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("port", i64::from(DEFAULT_PORT))?
            .set_default("poll_interval_secs", DEFAULT_POLL_INTERVAL_SECS as i64)?
            .set_default("book_depth", i64::from(DEFAULT_BOOK_DEPTH))?
            .set_default("api_base", DEFAULT_API_BASE)?
            .set_default("metrics_port", 9000_i64)?;

        builder = match path {
            Some(p) => builder.add_source(File::from(p)),
            None => builder.add_source(File::with_name("lobcast").required(false)),
        };

        builder
            .add_source(Environment::with_prefix("LOBCAST").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn bind_addr(&self) -> SocketAddr {
        (Ipv4Addr::UNSPECIFIED, self.port).into()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            book_depth: DEFAULT_BOOK_DEPTH,
            api_base: DEFAULT_API_BASE.to_string(),
            metrics_port: 9000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_without_file_yields_defaults_then_env_overrides() {
        let cfg = RelayConfig::load(None).unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(cfg.book_depth, DEFAULT_BOOK_DEPTH);
        assert_eq!(cfg.api_base, DEFAULT_API_BASE);

        std::env::set_var("LOBCAST_PORT", "9100");
        std::env::set_var("LOBCAST_BOOK_DEPTH", "10");
        let cfg = RelayConfig::load(None).unwrap();
        std::env::remove_var("LOBCAST_PORT");
        std::env::remove_var("LOBCAST_BOOK_DEPTH");

        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.book_depth, 10);
        assert_eq!(cfg.api_base, DEFAULT_API_BASE);
    }

    #[test]
    fn derived_accessors() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.bind_addr().port(), DEFAULT_PORT);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(5));
    }
}
