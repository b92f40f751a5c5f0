//! Units of work moved between listeners, slots and control connections
//!
//! A [`WorkItem`] is owned by exactly one queue or one consumer at a time.
//! Whoever pops it last drops it; producers never touch it after a push.

use std::fmt;
use std::net::IpAddr;

/// A datagram travelling through the relay
#[derive(Debug, Clone, PartialEq)]
pub enum WorkItem {
    /// Received from the network, heading to the controller
    Inbound(InboundPacket),
    /// Produced by the controller, heading to the network
    Outbound(OutboundPacket),
}

/// A datagram received on one of the UDP listeners
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPacket {
    /// Raw datagram bytes, exactly as received
    pub payload: Vec<u8>,
    /// Receive time in seconds since the Unix epoch
    pub received_at: f64,
    /// Sender address
    pub remote_addr: IpAddr,
    /// Sender port
    pub remote_port: u16,
    /// Local address the datagram was delivered to
    pub local_addr: IpAddr,
    /// Local port the datagram was delivered to
    pub local_port: u16,
}

/// A datagram the controller asked us to send
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPacket {
    /// Raw bytes to put on the wire
    pub payload: Vec<u8>,
    /// Destination host, as given by the controller
    pub remote_addr: String,
    /// Destination port, kept textual until transmit time
    pub remote_port: String,
    /// Local address the datagram must leave from
    pub local_addr: String,
    /// Local port the datagram must leave from
    pub local_port: u16,
}

impl InboundPacket {
    /// Size of the received datagram
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

impl OutboundPacket {
    /// Size of the datagram to send
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// The `(address, port)` pair identifying the listener that must emit this datagram
    pub fn source_key(&self) -> (&str, u16) {
        (self.local_addr.as_str(), self.local_port)
    }
}

impl WorkItem {
    /// Receive time of an inbound item; outbound items carry none
    pub fn received_at(&self) -> Option<f64> {
        match self {
            WorkItem::Inbound(packet) => Some(packet.received_at),
            WorkItem::Outbound(_) => None,
        }
    }

    /// Payload bytes regardless of direction
    pub fn payload(&self) -> &[u8] {
        match self {
            WorkItem::Inbound(packet) => &packet.payload,
            WorkItem::Outbound(packet) => &packet.payload,
        }
    }
}

impl From<InboundPacket> for WorkItem {
    fn from(packet: InboundPacket) -> Self {
        WorkItem::Inbound(packet)
    }
}

impl From<OutboundPacket> for WorkItem {
    fn from(packet: OutboundPacket) -> Self {
        WorkItem::Outbound(packet)
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::Inbound(p) => write!(
                f,
                "inbound {} bytes {}:{} -> {}:{}",
                p.size(),
                p.remote_addr,
                p.remote_port,
                p.local_addr,
                p.local_port
            ),
            WorkItem::Outbound(p) => write!(
                f,
                "outbound {} bytes {}:{} -> {}:{}",
                p.size(),
                p.local_addr,
                p.local_port,
                p.remote_addr,
                p.remote_port
            ),
        }
    }
}
