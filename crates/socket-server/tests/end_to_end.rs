//! End-to-end tests over real loopback sockets
//!
//! A controller is simulated with a plain TCP client speaking the record
//! protocol; SIP peers are plain UDP sockets.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use quick_xml::events::Event;
use quick_xml::Reader;

use rvoip_socket_server::{ServerConfig, SocketServer};

const TIMEOUT: Duration = Duration::from_secs(5);

fn start_server(slots: &[u32]) -> SocketServer {
    let config = ServerConfig::new(slots.to_vec())
        .with_listen("127.0.0.1", 0)
        .with_cmd_listen("127.0.0.1", 0)
        .with_wildcard_workers(2);
    SocketServer::start(&config).expect("server starts")
}

fn sip_datagram(call_id: &str, size: usize) -> Vec<u8> {
    let mut msg = format!(
        "INVITE sip:bob@example.com SIP/2.0\r\nVia: SIP/2.0/UDP 127.0.0.1\r\nCall-ID: {}\r\nCSeq: 1 INVITE\r\n\r\n",
        call_id
    )
    .into_bytes();
    msg.resize(size, b'a');
    msg
}

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

struct Controller {
    stream: TcpStream,
    reader: Reader<BufReader<TcpStream>>,
    buf: Vec<u8>,
}

#[derive(Debug)]
struct IncomingRecord {
    src_addr: String,
    src_port: u16,
    dst_port: u16,
    rtime: f64,
    msg: Vec<u8>,
}

impl Controller {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let reader = Reader::from_reader(BufReader::new(stream.try_clone().unwrap()));
        Self {
            stream,
            reader,
            buf: Vec::new(),
        }
    }

    fn send(&mut self, record: &str) {
        self.stream.write_all(record.as_bytes()).unwrap();
        self.stream.write_all(b"\n").unwrap();
    }

    fn bind(&mut self, slot: u32) {
        self.send(&format!(r#"<b2bua_slot id="{}"/>"#, slot));
    }

    fn next_incoming(&mut self) -> IncomingRecord {
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf).expect("control stream readable") {
                Event::Empty(e) if e.name().as_ref() == b"incoming_packet" => {
                    let mut record = IncomingRecord {
                        src_addr: String::new(),
                        src_port: 0,
                        dst_port: 0,
                        rtime: 0.0,
                        msg: Vec::new(),
                    };
                    for attr in e.attributes() {
                        let attr = attr.unwrap();
                        let value = attr.unescape_value().unwrap().into_owned();
                        match attr.key.as_ref() {
                            b"src_addr" => record.src_addr = value,
                            b"src_port" => record.src_port = value.parse().unwrap(),
                            b"dst_port" => record.dst_port = value.parse().unwrap(),
                            b"rtime" => record.rtime = value.parse().unwrap(),
                            b"msg" => record.msg = STANDARD.decode(value).unwrap(),
                            _ => {}
                        }
                    }
                    return record;
                }
                Event::Eof => panic!("control stream closed"),
                _ => {}
            }
        }
    }
}

#[test]
fn test_inbound_datagram_reaches_bound_controller() {
    let server = start_server(&[5061, 5067, 5068]);
    let slot = server.slots().select(b"abc123@test").id();

    let mut controller = Controller::connect(server.cmd_addr());
    controller.bind(slot);

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    // Too short to be routed, must never show up
    peer.send_to(&sip_datagram("abc123@test", 200)[..64], server.udp_addr()).unwrap();
    let datagram = sip_datagram("abc123@test", 200);
    peer.send_to(&datagram, server.udp_addr()).unwrap();

    let record = controller.next_incoming();
    assert_eq!(record.msg, datagram);
    assert_eq!(record.src_addr, "127.0.0.1");
    assert_eq!(record.src_port, peer.local_addr().unwrap().port());
    assert_eq!(record.dst_port, server.udp_addr().port());
    assert!(record.rtime > 0.0);

    // Nothing else is pending for this slot
    controller.stream.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    controller.buf.clear();
    let extra = controller.reader.read_event_into(&mut controller.buf);
    assert!(
        !matches!(extra, Ok(Event::Empty(_))),
        "unexpected second record"
    );
    assert_eq!(server.slots().select(b"abc123@test").queue().len(), 0);
}

#[test]
fn test_outgoing_record_sent_from_declared_source() {
    let server = start_server(&[1]);
    let mut controller = Controller::connect(server.cmd_addr());

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(TIMEOUT)).unwrap();
    let source_port = free_udp_port();
    let payload = b"SIP/2.0 200 OK\r\nCall-ID: reply@test\r\n\r\n";

    for _ in 0..2 {
        controller.send(&format!(
            r#"<outgoing_packet dst_addr="127.0.0.1" dst_port="{}" src_addr="127.0.0.1" src_port="{}" msg="{}"/>"#,
            peer.local_addr().unwrap().port(),
            source_port,
            STANDARD.encode(payload)
        ));

        let mut buf = [0u8; 1024];
        let (len, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], payload);
        assert_eq!(from, SocketAddr::from(([127, 0, 0, 1], source_port)));
    }
}

#[test]
fn test_malformed_records_keep_connection_open() {
    let server = start_server(&[1]);
    let mut controller = Controller::connect(server.cmd_addr());

    controller.send(r#"<outgoing_packet dst_addr="127.0.0.1" dst_port="5060" src_addr="127.0.0.1" msg="AAAA"/>"#);
    controller.send(r#"<outgoing_packet dst_addr="127.0.0.1" dst_port="5060" src_addr="127.0.0.1" src_port="5999" msg="***"/>"#);
    controller.send(r#"<b2bua_slot id="42"/>"#);
    controller.send(r#"<something_else/>"#);
    controller.bind(1);

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let datagram = sip_datagram("still-alive@test", 300);
    peer.send_to(&datagram, server.udp_addr()).unwrap();

    assert_eq!(controller.next_incoming().msg, datagram);
}

#[test]
fn test_markup_syntax_error_keeps_connection_open() {
    let server = start_server(&[3]);
    let mut controller = Controller::connect(server.cmd_addr());

    controller.send("<!bogus>");
    controller.bind(3);

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let datagram = sip_datagram("after-garbage@test", 220);
    peer.send_to(&datagram, server.udp_addr()).unwrap();
    assert_eq!(controller.next_incoming().msg, datagram);

    // Still accepting records after the stream was resynchronized
    peer.set_read_timeout(Some(TIMEOUT)).unwrap();
    let source_port = free_udp_port();
    controller.send(&format!(
        r#"<outgoing_packet dst_addr="127.0.0.1" dst_port="{}" src_addr="127.0.0.1" src_port="{}" msg="{}"/>"#,
        peer.local_addr().unwrap().port(),
        source_port,
        STANDARD.encode(b"SIP/2.0 100 Trying\r\n\r\n")
    ));
    let mut buf = [0u8; 256];
    let (len, _) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"SIP/2.0 100 Trying\r\n\r\n");
}

#[test]
fn test_rebind_after_reconnect_resumes_slot() {
    let server = start_server(&[7]);

    let mut first = Controller::connect(server.cmd_addr());
    first.bind(7);
    drop(first);
    // Let the server notice the close and retire the first transmit thread
    std::thread::sleep(Duration::from_millis(300));

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let datagram = sip_datagram("resume@test", 256);
    peer.send_to(&datagram, server.udp_addr()).unwrap();

    let mut second = Controller::connect(server.cmd_addr());
    second.bind(7);
    assert_eq!(second.next_incoming().msg, datagram);
}
