//! Listener pool and reply-path learning
//!
//! The pool owns every [`Listener`] and is driven by a single distribution
//! thread: it pops outbound items from the central queue fed by the control
//! bridge and hands each one to the listener bound to the item's declared
//! source address, binding a new one the first time an address shows up.
//! Replies therefore always leave from the exact address the controller
//! asked for.
//!
//! The listener collection lives inside the pool and the pool is moved into
//! the distribution thread by [`ListenerPool::run`], so no other thread can
//! reach it and it needs no lock. Listeners are never removed, so a long run
//! over many distinct source addresses keeps accumulating sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{Listener, ListenerKind};
use crate::error::Result;
use crate::queue::WorkQueue;
use crate::slot::SlotTable;
use crate::work_item::{OutboundPacket, WorkItem};

/// What [`ListenerPool::dispatch`] did with an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to an existing listener
    Routed,
    /// A new listener was bound and the item handed to it
    Created,
    /// The item was discarded
    Dropped,
}

/// Owner of all UDP listeners
pub struct ListenerPool {
    wildcard: Listener,
    listeners: Vec<Listener>,
    distribution: Arc<WorkQueue>,
    slots: Arc<SlotTable>,
}

impl ListenerPool {
    /// Bind the wildcard listener on the primary address.
    ///
    /// Failing to bind here is fatal for the caller.
    pub fn start(
        listen_addr: &str,
        listen_port: u16,
        wildcard_workers: usize,
        slots: Arc<SlotTable>,
        distribution: Arc<WorkQueue>,
    ) -> Result<Self> {
        let wildcard = Listener::start(
            listen_addr,
            listen_port,
            ListenerKind::Wildcard {
                workers: wildcard_workers,
            },
            slots.clone(),
        )?;

        Ok(Self {
            wildcard,
            listeners: Vec::new(),
            distribution,
            slots,
        })
    }

    /// Address the wildcard listener is bound to
    pub fn wildcard_addr(&self) -> std::io::Result<SocketAddr> {
        self.wildcard.bound_addr()
    }

    /// Number of reply listeners created so far
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Reply listeners in creation order
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    /// Queue the pool drains
    pub fn distribution_queue(&self) -> &Arc<WorkQueue> {
        &self.distribution
    }

    /// Route one item to its listener, creating the listener if needed
    pub fn dispatch(&mut self, item: WorkItem) -> DispatchOutcome {
        match item {
            WorkItem::Outbound(packet) => self.dispatch_outbound(packet),
            WorkItem::Inbound(packet) => {
                warn!(
                    "{}: ignoring inbound item from {}:{}",
                    self.distribution.name(),
                    packet.remote_addr,
                    packet.remote_port
                );
                DispatchOutcome::Dropped
            }
        }
    }

    fn dispatch_outbound(&mut self, packet: OutboundPacket) -> DispatchOutcome {
        let (addr, port) = packet.source_key();

        if let Some(listener) = self.listeners.iter().find(|l| l.serves(addr, port)) {
            if let Some(queue) = listener.outbound() {
                queue.push(WorkItem::Outbound(packet));
                return DispatchOutcome::Routed;
            }
        }

        let listener = match Listener::start(addr, port, ListenerKind::Reply, self.slots.clone()) {
            Ok(listener) => listener,
            Err(e) => {
                error!("cannot create listener for {}:{}: {}", addr, port, e);
                return DispatchOutcome::Dropped;
            }
        };
        info!("new reply listener {}:{}", addr, port);

        match listener.outbound() {
            Some(queue) => queue.push(WorkItem::Outbound(packet)),
            None => debug!("listener {}:{} has no outbound queue", addr, port),
        }
        self.listeners.push(listener);
        DispatchOutcome::Created
    }

    /// Run the distribution loop on the calling thread; never returns
    pub fn run(mut self) {
        info!(
            "distributing outbound datagrams, primary listener {:?}",
            self.wildcard.bound_addr().ok()
        );
        loop {
            let item = self.distribution.pop();
            self.dispatch(item);
        }
    }
}

impl std::fmt::Debug for ListenerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerPool")
            .field("wildcard", &self.wildcard)
            .field("listeners", &self.listeners)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ListenerPool {
        let slots = Arc::new(SlotTable::new(&[1], 0.0).unwrap());
        let distribution = Arc::new(WorkQueue::new("B2B->NET (sorter)"));
        ListenerPool::start("127.0.0.1", 0, 1, slots, distribution).unwrap()
    }

    #[test]
    fn test_inbound_items_are_dropped() {
        let mut pool = pool();
        let item = WorkItem::Inbound(crate::work_item::InboundPacket {
            payload: vec![0; 200],
            received_at: 0.0,
            remote_addr: "192.0.2.1".parse().unwrap(),
            remote_port: 5060,
            local_addr: "127.0.0.1".parse().unwrap(),
            local_port: 5060,
        });
        assert_eq!(pool.dispatch(item), DispatchOutcome::Dropped);
        assert_eq!(pool.listener_count(), 0);
    }

    #[test]
    fn test_bind_failure_drops_item() {
        let mut pool = pool();
        let item = WorkItem::Outbound(OutboundPacket {
            payload: b"x".to_vec(),
            remote_addr: "127.0.0.1".to_string(),
            remote_port: "5060".to_string(),
            // TEST-NET-1 is never a local address
            local_addr: "192.0.2.55".to_string(),
            local_port: 5060,
        });
        assert_eq!(pool.dispatch(item), DispatchOutcome::Dropped);
        assert_eq!(pool.listener_count(), 0);
    }
}
