//! Server configuration
//!
//! Values come from a TOML file, command-line flags, or both. Every field
//! has a default except the slot list, which must name at least one slot.
//!
//! ```toml
//! listen_addr = "0.0.0.0"
//! listen_port = 5060
//! cmd_listen_addr = "127.0.0.1"
//! cmd_listen_port = 22223
//! slots = [5061, 5067, 5068]
//! queue_ttl = 32.0
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bridge::DEFAULT_BACKLOG;
use crate::error::{Error, Result};
use crate::listener::DEFAULT_WILDCARD_WORKERS;

/// Default SIP port for the primary UDP listener
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Default port of the control channel
pub const DEFAULT_CMD_PORT: u16 = 22223;

/// Configuration of a [`SocketServer`](crate::server::SocketServer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Primary UDP listen address
    pub listen_addr: String,
    /// Primary UDP listen port
    pub listen_port: u16,
    /// Control channel listen address
    pub cmd_listen_addr: String,
    /// Control channel listen port
    pub cmd_listen_port: u16,
    /// Control channel listen backlog
    pub cmd_backlog: i32,
    /// Slot identifiers, in routing order
    pub slots: Vec<u32>,
    /// Seconds after which queued inbound datagrams may be evicted, 0 disables
    pub queue_ttl: f64,
    /// Receive loops on the primary listener
    pub wildcard_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: DEFAULT_SIP_PORT,
            cmd_listen_addr: "127.0.0.1".to_string(),
            cmd_listen_port: DEFAULT_CMD_PORT,
            cmd_backlog: DEFAULT_BACKLOG,
            slots: Vec::new(),
            queue_ttl: 0.0,
            wildcard_workers: DEFAULT_WILDCARD_WORKERS,
        }
    }
}

impl ServerConfig {
    /// Create a configuration with default addresses for the given slots
    pub fn new(slots: impl Into<Vec<u32>>) -> Self {
        Self {
            slots: slots.into(),
            ..Default::default()
        }
    }

    /// Set the primary UDP listen address
    pub fn with_listen(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.listen_addr = addr.into();
        self.listen_port = port;
        self
    }

    /// Set the control channel listen address
    pub fn with_cmd_listen(mut self, addr: impl Into<String>, port: u16) -> Self {
        self.cmd_listen_addr = addr.into();
        self.cmd_listen_port = port;
        self
    }

    /// Enable TTL eviction on slot queues
    pub fn with_queue_ttl(mut self, seconds: f64) -> Self {
        self.queue_ttl = seconds;
        self
    }

    /// Set the number of receive loops on the primary listener
    pub fn with_wildcard_workers(mut self, workers: usize) -> Self {
        self.wildcard_workers = workers;
        self
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(e.to_string()))
    }

    /// Check the configuration for values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.slots.is_empty() {
            return Err(Error::config("at least one slot id is required"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.slots.iter().find(|id| !seen.insert(**id)) {
            return Err(Error::config(format!("duplicate slot id {}", dup)));
        }
        if self.listen_addr.trim().is_empty() {
            return Err(Error::config("listen address must not be empty"));
        }
        if self.cmd_listen_addr.trim().is_empty() {
            return Err(Error::config("control listen address must not be empty"));
        }
        if !self.queue_ttl.is_finite() || self.queue_ttl < 0.0 {
            return Err(Error::config(format!("invalid queue TTL {}", self.queue_ttl)));
        }
        if self.wildcard_workers == 0 {
            return Err(Error::config("at least one wildcard receive worker is required"));
        }
        if self.cmd_backlog <= 0 {
            return Err(Error::config(format!("invalid control backlog {}", self.cmd_backlog)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new(vec![5061]);
        assert_eq!(config.listen_addr, "0.0.0.0");
        assert_eq!(config.listen_port, 5060);
        assert_eq!(config.cmd_listen_port, DEFAULT_CMD_PORT);
        assert_eq!(config.wildcard_workers, 10);
        assert_eq!(config.queue_ttl, 0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ServerConfig::default().validate().is_err());
        assert!(ServerConfig::new(vec![1, 2, 1]).validate().is_err());
        assert!(ServerConfig::new(vec![1]).with_queue_ttl(-1.0).validate().is_err());
        assert!(ServerConfig::new(vec![1]).with_wildcard_workers(0).validate().is_err());
        assert!(ServerConfig::new(vec![1]).with_listen("", 5060).validate().is_err());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ServerConfig::from_toml("slots = [5061, 5067]\nqueue_ttl = 32.0\nlisten_port = 5070\n").unwrap();
        assert_eq!(
            config,
            ServerConfig::new(vec![5061, 5067])
                .with_listen("0.0.0.0", 5070)
                .with_queue_ttl(32.0)
        );
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(matches!(ServerConfig::from_toml("slots = \"many\""), Err(Error::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cmd_listen_addr = \"0.0.0.0\"").unwrap();
        writeln!(file, "cmd_listen_port = 4000").unwrap();
        writeln!(file, "slots = [5061]").unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cmd_listen_addr, "0.0.0.0");
        assert_eq!(config.cmd_listen_port, 4000);
        assert_eq!(config.slots, vec![5061]);
    }

    #[test]
    fn test_from_missing_file() {
        assert!(matches!(
            ServerConfig::from_file("/nonexistent/socket_server.toml"),
            Err(Error::Config(_))
        ));
    }
}
