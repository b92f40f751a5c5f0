//! One control connection: receive side, transmit side and teardown
//!
//! The receive side runs on the thread the acceptor spawned for the
//! connection. It parses records straight off the socket and acts on them
//! in-line. Once the controller binds a slot, a transmit thread starts
//! draining that slot's queue onto the socket.
//!
//! Both sides can discover that the socket is gone. Whichever does first
//! flips the status to [`ExchangeStatus::Dead`] and shuts the socket down;
//! the flip happens once. The transmit thread has no cancellation of its
//! own: it sleeps inside the slot queue, so the receive side keeps
//! broadcasting on that queue, with a short sleep between rounds, until the
//! transmit thread is seen to have finished. A single wake-up is not enough
//! because the transmit thread may be between its status check and its
//! next wait when it arrives.

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, error, info, warn};

use super::protocol::{self, ControlRecord};
use crate::error::spawn_named;
use crate::queue::WorkQueue;
use crate::slot::{Slot, SlotTable};
use crate::work_item::WorkItem;

/// Pause between wake-up broadcasts while waiting for the transmit thread
pub const TEARDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Consecutive markup errors tolerated before the stream is considered unusable
const MAX_MARKUP_ERRORS: usize = 32;

/// Lifecycle of a control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    Running,
    Dead,
}

/// State shared by the receive and transmit sides of one connection
pub struct Exchange {
    stream: TcpStream,
    peer: SocketAddr,
    status: Mutex<ExchangeStatus>,
}

impl Exchange {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            status: Mutex::new(ExchangeStatus::Running),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn status(&self) -> ExchangeStatus {
        *self.status.lock()
    }

    /// Move to `Dead` and shut the socket down, unless already dead.
    ///
    /// Returns `true` for the caller that performed the transition.
    pub fn mark_dead(&self) -> bool {
        let mut status = self.status.lock();
        if *status == ExchangeStatus::Dead {
            return false;
        }
        *status = ExchangeStatus::Dead;
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("control {}: shutdown: {}", self.peer, e);
        }
        true
    }

    fn send(&self, data: &[u8]) -> std::io::Result<()> {
        (&self.stream).write_all(data)
    }
}

/// Receive-side state of one connection
pub struct Connection {
    exchange: Arc<Exchange>,
    slots: Arc<SlotTable>,
    distribution: Arc<WorkQueue>,
    bound: Option<(Arc<Slot>, JoinHandle<()>)>,
}

impl Connection {
    pub fn new(exchange: Arc<Exchange>, slots: Arc<SlotTable>, distribution: Arc<WorkQueue>) -> Self {
        Self {
            exchange,
            slots,
            distribution,
            bound: None,
        }
    }

    /// Slot this connection is bound to, if any
    pub fn bound_slot(&self) -> Option<u32> {
        self.bound.as_ref().map(|(slot, _)| slot.id())
    }

    /// Serve the connection until the socket fails, then tear it down
    pub fn run(mut self) {
        let peer = self.exchange.peer();
        if let Err(e) = self.exchange.send(protocol::PROLOGUE.as_bytes()) {
            warn!("control {}: cannot write prologue: {}", peer, e);
            self.exchange.mark_dead();
        } else {
            self.receive();
        }
        self.teardown();
    }

    fn receive(&mut self) {
        let peer = self.exchange.peer();
        let stream = match self.exchange.stream.try_clone() {
            Ok(stream) => stream,
            Err(e) => {
                error!("control {}: cannot clone socket: {}", peer, e);
                return;
            }
        };

        let mut reader = control_reader(BufReader::new(stream));
        let mut buf = Vec::new();
        let mut markup_errors = 0;
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(element)) | Ok(Event::Empty(element)) => {
                    markup_errors = 0;
                    match ControlRecord::from_element(&element) {
                        Ok(Some(record)) => self.handle_record(record),
                        Ok(None) => {}
                        Err(e) => warn!("control {}: record rejected: {}", peer, e),
                    }
                }
                Ok(Event::Eof) => {
                    info!("control {}: connection closed by peer", peer);
                    return;
                }
                Ok(_) => markup_errors = 0,
                Err(quick_xml::Error::Io(e)) => {
                    info!("control {}: socket gone: {}", peer, e);
                    return;
                }
                Err(e) => {
                    markup_errors += 1;
                    warn!("control {}: malformed markup: {}", peer, e);
                    if markup_errors >= MAX_MARKUP_ERRORS {
                        error!("control {}: giving up after {} markup errors", peer, markup_errors);
                        return;
                    }
                    // The reader stays failed after a syntax error; restart at the next element
                    let mut input = reader.into_inner();
                    if let Err(e) = skip_to_markup(&mut input) {
                        info!("control {}: socket gone: {}", peer, e);
                        return;
                    }
                    reader = control_reader(input);
                }
            }
            buf.clear();
        }
    }

    /// Act on one parsed record
    pub fn handle_record(&mut self, record: ControlRecord) {
        let peer = self.exchange.peer();
        match record {
            ControlRecord::Outgoing(packet) => {
                debug!(
                    "control {}: outgoing {} bytes {}:{} -> {}:{}",
                    peer,
                    packet.size(),
                    packet.local_addr,
                    packet.local_port,
                    packet.remote_addr,
                    packet.remote_port
                );
                self.distribution.push(WorkItem::Outbound(packet));
            }
            ControlRecord::BindSlot { id } => self.bind_slot(id),
        }
    }

    fn bind_slot(&mut self, id: u32) {
        let peer = self.exchange.peer();
        if let Some((slot, _)) = &self.bound {
            warn!("control {}: slot is already assigned ({}), ignoring bind to {}", peer, slot.id(), id);
            return;
        }
        let Some(slot) = self.slots.get(id).cloned() else {
            warn!("control {}: unknown slot id={}", peer, id);
            return;
        };

        let exchange = self.exchange.clone();
        let tx_slot = slot.clone();
        match spawn_named(format!("b2b-tx-{}", id), move || transmit_loop(exchange, tx_slot)) {
            Ok(handle) => {
                info!("control {} associated with the slot {}", peer, id);
                self.bound = Some((slot, handle));
            }
            Err(e) => error!("control {}: {}", peer, e),
        }
    }

    fn teardown(&mut self) {
        let peer = self.exchange.peer();
        self.exchange.mark_dead();

        if let Some((slot, handle)) = self.bound.take() {
            while !handle.is_finished() {
                slot.queue().wake_all();
                thread::sleep(TEARDOWN_POLL_INTERVAL);
            }
            if handle.join().is_err() {
                error!("control {}: transmit thread panicked", peer);
            }
        }
        info!("control {}: connection torn down", peer);
    }
}

fn control_reader<R: BufRead>(input: R) -> Reader<R> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().check_end_names = false;
    reader.config_mut().trim_text(true);
    reader
}

/// Discard buffered input up to, not including, the next `<`
fn skip_to_markup<R: BufRead>(input: &mut R) -> std::io::Result<()> {
    loop {
        let available = input.fill_buf()?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|&b| b == b'<') {
            Some(at) => {
                input.consume(at);
                return Ok(());
            }
            None => {
                let len = available.len();
                input.consume(len);
            }
        }
    }
}

fn transmit_loop(exchange: Arc<Exchange>, slot: Arc<Slot>) {
    let queue = slot.queue();
    loop {
        let Some(item) = queue.pop_or_wake() else {
            if exchange.status() != ExchangeStatus::Running {
                return;
            }
            continue;
        };

        let packet = match item {
            WorkItem::Inbound(packet) => packet,
            WorkItem::Outbound(packet) => {
                warn!("{}: ignoring outbound item for {}", queue.name(), packet.remote_addr);
                continue;
            }
        };

        let record = match protocol::encode_incoming(&packet) {
            Ok(record) => record,
            Err(e) => {
                error!("{}: cannot encode record: {}", queue.name(), e);
                continue;
            }
        };

        if let Err(e) = exchange.send(&record) {
            warn!("control {}: send failed: {}", exchange.peer(), e);
            exchange.mark_dead();
            queue.requeue(WorkItem::Inbound(packet));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_item::{InboundPacket, OutboundPacket};
    use std::net::TcpListener;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn connection(slots: &[u32]) -> (Connection, Arc<WorkQueue>, TcpStream) {
        let (server, client) = socket_pair();
        let peer = client.local_addr().unwrap();
        let exchange = Arc::new(Exchange::new(server, peer));
        let slots = Arc::new(SlotTable::new(slots, 0.0).unwrap());
        let distribution = Arc::new(WorkQueue::new("B2B->NET (sorter)"));
        (Connection::new(exchange, slots, distribution.clone()), distribution, client)
    }

    #[test]
    fn test_skip_to_markup_stops_before_next_element() {
        let mut input: &[u8] = b"bogus>\n  <b2bua_slot id=\"1\"/>";
        skip_to_markup(&mut input).unwrap();
        assert_eq!(input, br#"<b2bua_slot id="1"/>"#);

        let mut garbage: &[u8] = b"no markup at all";
        skip_to_markup(&mut garbage).unwrap();
        assert!(garbage.is_empty());
    }

    #[test]
    fn test_reader_recovers_after_syntax_error() {
        let mut reader = control_reader(&b"<!bogus>\n<b2bua_slot id=\"7\"/>"[..]);
        let mut buf = Vec::new();
        assert!(reader.read_event_into(&mut buf).is_err());

        let mut input = reader.into_inner();
        skip_to_markup(&mut input).unwrap();
        let mut reader = control_reader(input);
        buf.clear();
        let Event::Empty(element) = reader.read_event_into(&mut buf).unwrap() else {
            panic!("expected the slot record");
        };
        assert_eq!(
            ControlRecord::from_element(&element),
            Ok(Some(ControlRecord::BindSlot { id: 7 }))
        );
    }

    #[test]
    fn test_mark_dead_only_once() {
        let (server, client) = socket_pair();
        let exchange = Exchange::new(server, client.local_addr().unwrap());
        assert_eq!(exchange.status(), ExchangeStatus::Running);
        assert!(exchange.mark_dead());
        assert!(!exchange.mark_dead());
        assert_eq!(exchange.status(), ExchangeStatus::Dead);
    }

    #[test]
    fn test_outgoing_record_reaches_distribution() {
        let (mut conn, distribution, _client) = connection(&[1]);
        conn.handle_record(ControlRecord::Outgoing(OutboundPacket {
            payload: b"hello".to_vec(),
            remote_addr: "192.0.2.1".to_string(),
            remote_port: "5060".to_string(),
            local_addr: "127.0.0.1".to_string(),
            local_port: 5060,
        }));
        assert_eq!(distribution.len(), 1);
        assert_eq!(distribution.pop().payload(), b"hello");
        conn.teardown();
    }

    #[test]
    fn test_unknown_slot_and_rebind_ignored() {
        let (mut conn, _distribution, _client) = connection(&[5061, 5067]);
        conn.handle_record(ControlRecord::BindSlot { id: 9999 });
        assert_eq!(conn.bound_slot(), None);

        conn.handle_record(ControlRecord::BindSlot { id: 5061 });
        assert_eq!(conn.bound_slot(), Some(5061));

        conn.handle_record(ControlRecord::BindSlot { id: 5067 });
        assert_eq!(conn.bound_slot(), Some(5061));

        conn.teardown();
    }

    #[test]
    fn test_teardown_releases_idle_transmit_thread() {
        let (mut conn, _distribution, client) = connection(&[7]);
        conn.handle_record(ControlRecord::BindSlot { id: 7 });
        thread::sleep(Duration::from_millis(20));

        drop(client);
        conn.teardown();
        assert_eq!(conn.exchange.status(), ExchangeStatus::Dead);
        assert!(conn.bound.is_none());
    }

    #[test]
    fn test_failed_send_requeues_item() {
        let (mut conn, _distribution, client) = connection(&[7]);
        let slot = conn.slots.get(7).unwrap().clone();
        conn.exchange.mark_dead();
        drop(client);

        slot.queue().push(WorkItem::Inbound(InboundPacket {
            payload: vec![b'x'; 200],
            received_at: 1.0,
            remote_addr: "192.0.2.1".parse().unwrap(),
            remote_port: 5060,
            local_addr: "127.0.0.1".parse().unwrap(),
            local_port: 5060,
        }));
        conn.handle_record(ControlRecord::BindSlot { id: 7 });
        conn.teardown();

        assert_eq!(slot.queue().len(), 1);
    }
}
