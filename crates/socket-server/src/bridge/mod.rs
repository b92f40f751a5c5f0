//! TCP bridge between the slots and the external B2BUA controller
//!
//! The acceptor owns the listening socket and spawns one receive thread per
//! accepted connection (see [`connection`]). Finished connections are reaped
//! before every accept.

pub mod connection;
pub mod protocol;

pub use connection::{Connection, Exchange, ExchangeStatus};
pub use protocol::{ControlRecord, ProtocolError};

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use crate::error::{spawn_named, Result};
use crate::net;
use crate::queue::WorkQueue;
use crate::slot::SlotTable;

/// Default listen backlog of the control socket
pub const DEFAULT_BACKLOG: i32 = 32;

struct ConnectionHandle {
    exchange: Arc<Exchange>,
    thread: JoinHandle<()>,
}

/// Acceptor for controller connections
pub struct ControlBridge {
    listener: TcpListener,
    slots: Arc<SlotTable>,
    distribution: Arc<WorkQueue>,
    connections: Vec<ConnectionHandle>,
}

impl ControlBridge {
    /// Bind the control socket
    pub fn bind(
        addr: &str,
        port: u16,
        backlog: i32,
        slots: Arc<SlotTable>,
        distribution: Arc<WorkQueue>,
    ) -> Result<Self> {
        let listener = net::bind_tcp(addr, port, backlog)?;
        info!("control channel listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            slots,
            distribution,
            connections: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of connections not yet reaped
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accept connections forever on the calling thread
    pub fn run(mut self) {
        loop {
            self.reap();
            if let Err(e) = self.accept_one() {
                warn!("control accept failed: {}", e);
            }
        }
    }

    fn accept_one(&mut self) -> Result<()> {
        let (stream, peer) = self.listener.accept()?;
        info!("control connection from {}", peer);

        let exchange = Arc::new(Exchange::new(stream, peer));
        let connection = Connection::new(exchange.clone(), self.slots.clone(), self.distribution.clone());
        let thread = spawn_named(format!("b2b-rx-{}", peer.port()), move || connection.run())?;

        self.connections.push(ConnectionHandle { exchange, thread });
        Ok(())
    }

    fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.connections)
            .into_iter()
            .partition(|handle| handle.thread.is_finished());
        self.connections = running;

        for handle in finished {
            debug!(
                "collecting dead control connection {} ({:?})",
                handle.exchange.peer(),
                handle.exchange.status()
            );
            if handle.thread.join().is_err() {
                error!("control {}: receive thread panicked", handle.exchange.peer());
            }
        }
    }
}
