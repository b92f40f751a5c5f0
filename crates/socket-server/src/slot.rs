//! B2BUA slots and Call-ID based slot selection
//!
//! A slot is a worker unit on the controller side. Every inbound datagram is
//! parked on exactly one slot's queue, chosen by hashing its Call-ID, so all
//! traffic of a dialog ends up in front of the same controller worker.
//!
//! The table is built once at startup and only read afterwards, which is why
//! it is shared as a plain `Arc<SlotTable>` without a lock. Each slot's queue
//! carries its own synchronization.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::queue::WorkQueue;

/// Seed fed into [`call_id_hash`] by the router
pub const CALL_ID_HASH_SEED: u32 = 2;

/// A controller worker slot owning one inbound queue
#[derive(Debug)]
pub struct Slot {
    id: u32,
    queue: WorkQueue,
}

impl Slot {
    /// Create a slot with an inbound queue expiring items after `queue_ttl` seconds
    pub fn new(id: u32, queue_ttl: f64) -> Self {
        Self {
            id,
            queue: WorkQueue::with_ttl(format!("NET->B2B (slot {})", id), queue_ttl),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Inbound queue drained by the control connection bound to this slot
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }
}

/// Fixed, ordered collection of slots
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Arc<Slot>>,
}

impl SlotTable {
    /// Build the table from configured slot ids, keeping their order.
    ///
    /// At least one id is required and ids must be unique.
    pub fn new(ids: &[u32], queue_ttl: f64) -> Result<Self> {
        if ids.is_empty() {
            return Err(Error::config("at least one slot id is required"));
        }
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(*id) {
                return Err(Error::config(format!("duplicate slot id {}", id)));
            }
        }
        Ok(Self {
            slots: ids.iter().map(|&id| Arc::new(Slot::new(id, queue_ttl))).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Slot>> {
        self.slots.iter()
    }

    /// Index of the slot serving `call_id`
    pub fn index_for(&self, call_id: &[u8]) -> usize {
        call_id_hash(call_id, CALL_ID_HASH_SEED) as usize % self.slots.len()
    }

    /// Slot serving `call_id`; stable for the lifetime of the table
    pub fn select(&self, call_id: &[u8]) -> &Arc<Slot> {
        &self.slots[self.index_for(call_id)]
    }

    /// Slot with the given configured id
    pub fn get(&self, id: u32) -> Option<&Arc<Slot>> {
        self.slots.iter().find(|slot| slot.id == id)
    }
}

const CRC32_TABLE: [u32; 256] = crc32_table();

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-32 (IEEE) of `data`, chained from `seed`.
///
/// A seed of zero gives the plain CRC-32 of the input.
pub fn call_id_hash(data: &[u8], seed: u32) -> u32 {
    let mut crc = !seed;
    for &byte in data {
        crc = CRC32_TABLE[((crc ^ byte as u32) & 0xff) as usize] ^ (crc >> 8);
    }
    !crc
}
