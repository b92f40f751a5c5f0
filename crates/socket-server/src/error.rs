//! Error types for the socket server
//!
//! Only startup failures ever leave the crate as an `Err`; everything that
//! happens per datagram or per control record is logged and dropped where it
//! occurs.

use thiserror::Error;

/// Result type for socket server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the socket server
#[derive(Debug, Error)]
pub enum Error {
    /// Generic I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A socket could not be bound to the requested local address
    #[error("Failed to bind {addr}:{port}: {source}")]
    Bind {
        addr: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// A textual host/port pair did not resolve to a usable address
    #[error("Cannot resolve {host}:{port}: {reason}")]
    Resolve {
        host: String,
        port: String,
        reason: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A worker thread could not be started
    #[error("Failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A long-running thread ended by panicking
    #[error("Thread '{0}' panicked")]
    Panicked(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a resolution error
    pub fn resolve(host: impl Into<String>, port: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolve {
            host: host.into(),
            port: port.into(),
            reason: reason.into(),
        }
    }
}

/// Spawn a named OS thread, mapping the failure into [`Error::Spawn`]
pub(crate) fn spawn_named<F>(name: String, f: F) -> Result<std::thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| Error::Spawn { name, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::resolve("example.invalid", "sip", "invalid port");
        assert_eq!(err.to_string(), "Cannot resolve example.invalid:sip: invalid port");
        assert_eq!(Error::Panicked("lthread-mgr".to_string()).to_string(), "Thread 'lthread-mgr' panicked");

        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        assert!(matches!(Error::from(io), Error::Io(_)));
    }

    #[test]
    fn test_spawn_named_sets_thread_name() {
        let handle = spawn_named("b2b-test".to_string(), || {
            assert_eq!(std::thread::current().name(), Some("b2b-test"));
        })
        .unwrap();
        handle.join().unwrap();
    }
}
