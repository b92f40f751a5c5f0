//! UDP listeners and their receive/transmit loops
//!
//! A [`Listener`] is one bound UDP socket for one local `(address, port)`.
//! Two kinds exist:
//!
//! - the **wildcard** listener on the primary configured address. It runs
//!   several receive loops over one socket and learns, per datagram, which
//!   local address the datagram was actually sent to. It never transmits.
//! - **reply** listeners, created on demand by the [`ListenerPool`] when the
//!   controller asks to send from an address nobody is bound to yet. Each runs
//!   one receive loop and one transmit loop draining its own outbound queue.
//!
//! ```text
//!   network ──► receive loop ──► Call-ID ──► slot queue ──► control bridge
//!   network ◄── transmit loop ◄── listener queue ◄── pool ◄── control bridge
//! ```

mod pktinfo;
mod pool;

pub use pool::{DispatchOutcome, ListenerPool};

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::call_id::extract_call_id;
use crate::error::{spawn_named, Result};
use crate::net;
use crate::queue::WorkQueue;
use crate::slot::{Slot, SlotTable};
use crate::work_item::{InboundPacket, WorkItem};

/// Size of the per-datagram receive buffer
pub const RECV_BUFFER_SIZE: usize = 8 * 1024;

/// Datagrams shorter than this cannot carry a useful SIP header and are dropped
pub const MIN_DATAGRAM_SIZE: usize = 128;

/// Default number of receive loops on the wildcard listener
pub const DEFAULT_WILDCARD_WORKERS: usize = 10;

/// Why a received datagram was not queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Shorter than [`MIN_DATAGRAM_SIZE`]
    TooShort,
    /// Filled the receive buffer and has no Call-ID; most likely cut off
    Truncated,
    /// No usable Call-ID header
    NoCallId,
}

/// Decide whether a datagram can be routed, returning its Call-ID.
///
/// `capacity` is the most the receive call could have returned; a datagram
/// of exactly that size without a Call-ID is reported as [`Rejection::Truncated`].
pub fn classify(datagram: &[u8], capacity: usize) -> std::result::Result<&[u8], Rejection> {
    if datagram.len() < MIN_DATAGRAM_SIZE {
        return Err(Rejection::TooShort);
    }
    match extract_call_id(datagram) {
        Some(call_id) => Ok(call_id),
        None if datagram.len() >= capacity => Err(Rejection::Truncated),
        None => Err(Rejection::NoCallId),
    }
}

/// Classify a datagram and pick its slot, logging anything that gets dropped
pub(crate) fn route_datagram<'a>(
    slots: &'a SlotTable,
    datagram: &[u8],
    capacity: usize,
) -> Option<&'a Arc<Slot>> {
    match classify(datagram, capacity) {
        Ok(call_id) => Some(slots.select(call_id)),
        Err(Rejection::TooShort) => {
            trace!("dropping {} byte datagram: too short", datagram.len());
            None
        }
        Err(Rejection::Truncated) => {
            trace!("dropping {} byte datagram: probably truncated", datagram.len());
            None
        }
        Err(Rejection::NoCallId) => {
            error!("can't extract Call-ID: {}", datagram.len());
            None
        }
    }
}

/// Role of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// Primary listener with `workers` receive loops and no transmit loop
    Wildcard { workers: usize },
    /// On-demand listener with one receive and one transmit loop
    Reply,
}

/// A bound UDP socket and the threads serving it
pub struct Listener {
    local_addr: String,
    local_port: u16,
    socket: Arc<UdpSocket>,
    outbound: Option<Arc<WorkQueue>>,
    kind: ListenerKind,
    _threads: Vec<JoinHandle<()>>,
}

impl Listener {
    /// Bind `local_addr:local_port` and start the loops for `kind`.
    ///
    /// The threads run for the lifetime of the process.
    pub fn start(local_addr: &str, local_port: u16, kind: ListenerKind, slots: Arc<SlotTable>) -> Result<Self> {
        let socket = Arc::new(net::bind_udp(local_addr, local_port)?);
        let bound = socket.local_addr()?;

        let capture_destination = match kind {
            ListenerKind::Wildcard { .. } => match pktinfo::enable(&socket) {
                Ok(()) => true,
                Err(e) => {
                    warn!("destination capture unavailable on {}: {}, using route lookup", bound, e);
                    false
                }
            },
            ListenerKind::Reply => false,
        };

        let ctx = Arc::new(ReceiveContext {
            socket: socket.clone(),
            slots,
            bound,
            wildcard: matches!(kind, ListenerKind::Wildcard { .. }),
            capture_destination,
        });

        let mut jobs: Vec<(String, Job)> = Vec::new();
        let outbound = match kind {
            ListenerKind::Wildcard { workers } => {
                for n in 0..workers.max(1) {
                    let ctx = ctx.clone();
                    jobs.push((format!("udp-rx-{}-{}", bound.port(), n), Box::new(move || receive_loop(ctx))));
                }
                None
            }
            ListenerKind::Reply => {
                let queue = Arc::new(WorkQueue::new(format!("B2B->NET ({}:{})", local_addr, local_port)));
                jobs.push((format!("udp-rx-{}", bound.port()), Box::new(move || receive_loop(ctx))));
                let tx_socket = socket.clone();
                let tx_queue = queue.clone();
                jobs.push((
                    format!("udp-tx-{}", bound.port()),
                    Box::new(move || transmit_loop(tx_socket, tx_queue)),
                ));
                Some(queue)
            }
        };
        let threads = spawn_all(jobs, |name, job| spawn_named(name, job))?;

        info!("listening for SIP datagrams on {} ({:?})", bound, kind);

        Ok(Self {
            local_addr: local_addr.to_string(),
            local_port,
            socket,
            outbound,
            kind,
            _threads: threads,
        })
    }

    /// Address text this listener was created for
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Port this listener was created for
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Address the socket is actually bound to
    pub fn bound_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self.kind, ListenerKind::Wildcard { .. })
    }

    /// Whether this listener emits datagrams declared as coming from `addr:port`
    pub fn serves(&self, addr: &str, port: u16) -> bool {
        !self.is_wildcard() && self.local_port == port && self.local_addr == addr
    }

    /// Outbound queue drained by the transmit loop; the wildcard listener has none
    pub fn outbound(&self) -> Option<&Arc<WorkQueue>> {
        self.outbound.as_ref()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("local_port", &self.local_port)
            .field("kind", &self.kind)
            .finish()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Holds started threads back until every sibling thread was started too
#[derive(Default)]
struct StartGate {
    decision: Mutex<Option<bool>>,
    cond: Condvar,
}

impl StartGate {
    fn open(&self, run: bool) {
        *self.decision.lock() = Some(run);
        self.cond.notify_all();
    }

    fn wait(&self) -> bool {
        let mut decision = self.decision.lock();
        loop {
            if let Some(run) = *decision {
                return run;
            }
            self.cond.wait(&mut decision);
        }
    }
}

/// Start one thread per job. Jobs only run once all threads exist.
///
/// If any spawn fails, the threads already started return without running
/// their job, so nothing they captured (the socket in particular) outlives
/// the failed start.
fn spawn_all<S>(jobs: Vec<(String, Job)>, mut spawn: S) -> Result<Vec<JoinHandle<()>>>
where
    S: FnMut(String, Job) -> Result<JoinHandle<()>>,
{
    let gate = Arc::new(StartGate::default());
    let mut threads = Vec::with_capacity(jobs.len());
    for (name, job) in jobs {
        let gate_ref = gate.clone();
        let gated: Job = Box::new(move || {
            if gate_ref.wait() {
                job();
            }
        });
        match spawn(name, gated) {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                gate.open(false);
                return Err(e);
            }
        }
    }
    gate.open(true);
    Ok(threads)
}

/// Pause after the first failed receive; doubles per consecutive failure
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Upper bound of the pause between failing receives
const MAX_RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);

fn recv_backoff(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(10);
    (RECV_ERROR_BACKOFF * (1u32 << exponent)).min(MAX_RECV_ERROR_BACKOFF)
}

struct ReceiveContext {
    socket: Arc<UdpSocket>,
    slots: Arc<SlotTable>,
    bound: SocketAddr,
    wildcard: bool,
    capture_destination: bool,
}

impl ReceiveContext {
    fn receive(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, Option<IpAddr>)> {
        if self.capture_destination {
            pktinfo::recv(&self.socket, buf)
        } else {
            let (len, remote) = self.socket.recv_from(buf)?;
            Ok((len, remote, None))
        }
    }

    fn local_ip(&self, remote: SocketAddr, destination: Option<IpAddr>) -> IpAddr {
        if !self.wildcard {
            return self.bound.ip();
        }
        if let Some(ip) = destination {
            return ip;
        }
        match net::local_for_remote(remote) {
            Ok(ip) => ip,
            Err(e) => {
                debug!("route lookup for {} failed: {}", remote, e);
                self.bound.ip()
            }
        }
    }
}

fn receive_loop(ctx: Arc<ReceiveContext>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    // One byte of headroom so a full read means the datagram did not fit
    let capacity = RECV_BUFFER_SIZE - 1;
    let mut failures = 0u32;

    loop {
        let (len, remote, destination) = match ctx.receive(&mut buf[..capacity]) {
            Ok(received) => received,
            Err(e) => {
                failures = failures.saturating_add(1);
                if failures == 1 || failures % 100 == 0 {
                    error!("recv on {} failed ({} in a row): {}", ctx.bound, failures, e);
                }
                thread::sleep(recv_backoff(failures));
                continue;
            }
        };
        failures = 0;
        let received_at = net::now_dtime();
        let datagram = &buf[..len];

        let Some(slot) = route_datagram(&ctx.slots, datagram, capacity) else {
            continue;
        };

        let packet = InboundPacket {
            payload: datagram.to_vec(),
            received_at,
            remote_addr: remote.ip(),
            remote_port: remote.port(),
            local_addr: ctx.local_ip(remote, destination),
            local_port: ctx.bound.port(),
        };
        trace!(
            "{} bytes from {} to {}:{} -> slot {}",
            len,
            remote,
            packet.local_addr,
            packet.local_port,
            slot.id()
        );
        slot.queue().push(WorkItem::Inbound(packet));
    }
}

fn transmit_loop(socket: Arc<UdpSocket>, queue: Arc<WorkQueue>) {
    loop {
        let packet = match queue.pop() {
            WorkItem::Outbound(packet) => packet,
            WorkItem::Inbound(packet) => {
                warn!("{}: ignoring inbound item from {}", queue.name(), packet.remote_addr);
                continue;
            }
        };

        let destination = match net::resolve(&packet.remote_addr, &packet.remote_port) {
            Ok(destination) => destination,
            Err(e) => {
                warn!("{}: dropping {} byte datagram: {}", queue.name(), packet.size(), e);
                continue;
            }
        };

        match socket.send_to(&packet.payload, destination) {
            Ok(sent) => debug!("{}: sent {} bytes to {}", queue.name(), sent, destination),
            Err(e) => warn!("{}: send to {} failed: {}", queue.name(), destination, e),
        }
    }
}
