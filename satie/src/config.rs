// src/config.rs
use crate::error::{SatieError, SatieResult};
use serde::Deserialize;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory to serve (required).
    pub root_path: String,

    /// Default index file name looked up inside directories.
    pub index_html: String,

    /// Seconds an idle keep-alive connection survives before reaping.
    pub keep_alive_timeout: u32,

    /// Number of worker threads (default: all cores).
    pub worker_threads: usize,

    /// Per-worker connection slab size; fds at or above it are refused.
    pub worker_max_fd: usize,

    /// Listen host (default: 127.0.0.1).
    pub server_host: String,

    /// Listen port (default: 8080).
    pub server_port: u16,

    /// Seconds a cached artifact stays fresh.
    pub cache_ttl: u64,
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    /// ROOT_PATH is the only required setting.
    pub fn from_env() -> SatieResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let root_path = std::env::var("ROOT_PATH")
            .map_err(|_| SatieError::Config("ROOT_PATH is not set".to_string()))?;

        let mut config = Self::for_root(root_path);
        config.index_html =
            std::env::var("INDEX_HTML").unwrap_or_else(|_| config.index_html.clone());
        config.keep_alive_timeout = env_parsed("KEEP_ALIVE_TIMEOUT", config.keep_alive_timeout);
        config.worker_threads = env_parsed("WORKER_THREADS", config.worker_threads);
        config.worker_max_fd = env_parsed("WORKER_MAX_FD", config.worker_max_fd);
        config.server_host =
            std::env::var("SERVER_HOST").unwrap_or_else(|_| config.server_host.clone());
        config.server_port = env_parsed("SERVER_PORT", config.server_port);
        config.cache_ttl = env_parsed("CACHE_TTL", config.cache_ttl);

        config.validate()?;
        Ok(config)
    }

    /// Defaults for serving `root_path`.
    pub fn for_root(root_path: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            index_html: "index.html".to_string(),
            keep_alive_timeout: 15,
            worker_threads: num_cpus::get(),
            worker_max_fd: 1024,
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            cache_ttl: 5,
        }
    }

    pub fn validate(&self) -> SatieResult<()> {
        if self.worker_threads == 0 {
            return Err(SatieError::Config("worker_threads must be > 0".to_string()));
        }
        if self.worker_max_fd == 0 {
            return Err(SatieError::Config("worker_max_fd must be > 0".to_string()));
        }
        Ok(())
    }

    /// Full listen address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

fn env_parsed<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::for_root("/srv/www");
        assert_eq!(config.root_path, "/srv/www");
        assert_eq!(config.index_html, "index.html");
        assert_eq!(config.keep_alive_timeout, 15);
        assert_eq!(config.cache_ttl, 5);
        assert!(config.worker_threads > 0);
        assert_eq!(config.server_addr(), "127.0.0.1:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let mut config = Config::for_root("/srv/www");
        config.worker_threads = 0;
        assert!(config.validate().is_err());
    }
}
