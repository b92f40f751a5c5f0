//! Wiring of slots, listeners and the control bridge
//!
//! ```text
//!               ┌──────────── SlotTable ────────────┐
//!  UDP ──► ListenerPool rx ──► slot queue ──► ControlBridge tx ──► controller
//!  UDP ◄── reply listener tx ◄── ListenerPool ◄── sorter queue ◄── ControlBridge rx
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::info;

use crate::bridge::ControlBridge;
use crate::config::ServerConfig;
use crate::error::{spawn_named, Error, Result};
use crate::listener::ListenerPool;
use crate::queue::WorkQueue;
use crate::slot::SlotTable;

/// A running socket server
pub struct SocketServer {
    slots: Arc<SlotTable>,
    distribution: Arc<WorkQueue>,
    udp_addr: SocketAddr,
    cmd_addr: SocketAddr,
    distributor: JoinHandle<()>,
    acceptor: JoinHandle<()>,
}

impl SocketServer {
    /// Bind every socket and start the distribution and accept threads.
    ///
    /// Any bind failure here is returned; nothing keeps running in that case
    /// except listener threads that were already started.
    pub fn start(config: &ServerConfig) -> Result<Self> {
        config.validate()?;

        let slots = Arc::new(SlotTable::new(&config.slots, config.queue_ttl)?);
        let distribution = Arc::new(WorkQueue::new("B2B->NET (sorter)"));

        let pool = ListenerPool::start(
            &config.listen_addr,
            config.listen_port,
            config.wildcard_workers,
            slots.clone(),
            distribution.clone(),
        )?;
        let udp_addr = pool.wildcard_addr()?;

        let bridge = ControlBridge::bind(
            &config.cmd_listen_addr,
            config.cmd_listen_port,
            config.cmd_backlog,
            slots.clone(),
            distribution.clone(),
        )?;
        let cmd_addr = bridge.local_addr()?;

        let distributor = spawn_named("lthread-mgr".to_string(), move || pool.run())?;
        let acceptor = spawn_named("b2b-acceptor".to_string(), move || bridge.run())?;

        info!(
            "socket server up: SIP on {}, control on {}, slots {:?}",
            udp_addr, cmd_addr, config.slots
        );

        Ok(Self {
            slots,
            distribution,
            udp_addr,
            cmd_addr,
            distributor,
            acceptor,
        })
    }

    /// Address of the primary UDP listener
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Address of the control channel
    pub fn cmd_addr(&self) -> SocketAddr {
        self.cmd_addr
    }

    pub fn slots(&self) -> &Arc<SlotTable> {
        &self.slots
    }

    /// Central queue of datagrams waiting for a reply listener
    pub fn distribution_queue(&self) -> &Arc<WorkQueue> {
        &self.distribution
    }

    /// Block until the distribution loop ends, which only happens on a panic
    pub fn wait(self) -> Result<()> {
        let distributor = self.distributor.join();
        drop(self.acceptor);
        distributor.map_err(|_| Error::Panicked("lthread-mgr".to_string()))
    }
}
