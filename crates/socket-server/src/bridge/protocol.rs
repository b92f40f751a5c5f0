//! Control channel record format
//!
//! The controller and the relay exchange a stream of XML elements. The relay
//! opens with a fixed prologue and then writes one `incoming_packet` element
//! per received datagram:
//!
//! ```text
//! <?xml version='1.0'?>
//!  <stream:stream>
//! <incoming_packet src_addr="192.0.2.1" src_port="5060" dst_addr="198.51.100.7"
//!     dst_port="5060" rtime="1700000000.123456" msg="SU5WSVRFIHNpcDo..."/>
//! ```
//!
//! The controller first binds its connection to a slot, then sends packets
//! to put on the wire:
//!
//! ```text
//! <b2bua_slot id="5061"/>
//! <outgoing_packet dst_addr="192.0.2.1" dst_port="5060" src_addr="198.51.100.7"
//!     src_port="5060" msg="U0lQLzIuMCAyMDAgT0s..."/>
//! ```
//!
//! `msg` always carries the raw datagram in standard base64.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Writer;
use thiserror::Error;

use crate::work_item::{InboundPacket, OutboundPacket};

/// Written once at the start of every control connection
pub const PROLOGUE: &str = "<?xml version='1.0'?>\n <stream:stream>\n";

/// Largest decoded `msg` payload accepted from the controller
pub const MAX_PAYLOAD_SIZE: usize = 8 * 1024;

pub const SLOT_RECORD: &str = "b2bua_slot";
pub const OUTGOING_RECORD: &str = "outgoing_packet";
pub const INCOMING_RECORD: &str = "incoming_packet";

const STREAM_ELEMENT: &[u8] = b"stream:stream";

/// Why a control record was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown record <{0}>")]
    UnknownRecord(String),

    #[error("unknown attribute: {name}='{value}'")]
    UnknownAttribute { name: String, value: String },

    #[error("'{0}' attribute is missing")]
    MissingAttribute(&'static str),

    #[error("'{name}' attribute is not a valid number: '{value}'")]
    InvalidNumber { name: &'static str, value: String },

    #[error("'msg' attribute is not valid base64")]
    InvalidPayload,

    #[error("'msg' attribute decodes to an empty payload")]
    EmptyPayload,

    #[error("payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),

    #[error("malformed attribute: {0}")]
    MalformedAttribute(String),
}

/// A record received from the controller
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRecord {
    /// Bind this connection to a slot
    BindSlot { id: u32 },
    /// Send a datagram
    Outgoing(OutboundPacket),
}

impl ControlRecord {
    /// Interpret one element from the control stream.
    ///
    /// Returns `Ok(None)` for the stream wrapper element, which carries no record.
    pub fn from_element(element: &BytesStart<'_>) -> Result<Option<Self>, ProtocolError> {
        match element.name().as_ref() {
            STREAM_ELEMENT => Ok(None),
            name if name == SLOT_RECORD.as_bytes() => parse_slot(element).map(Some),
            name if name == OUTGOING_RECORD.as_bytes() => parse_outgoing(element).map(Some),
            other => Err(ProtocolError::UnknownRecord(String::from_utf8_lossy(other).into_owned())),
        }
    }
}

fn attributes(element: &BytesStart<'_>) -> Result<Vec<(String, String)>, ProtocolError> {
    element
        .attributes()
        .map(|attr| {
            let attr = attr.map_err(|e| ProtocolError::MalformedAttribute(e.to_string()))?;
            let name = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| ProtocolError::MalformedAttribute(e.to_string()))?
                .into_owned();
            Ok((name, value))
        })
        .collect()
}

fn parse_slot(element: &BytesStart<'_>) -> Result<ControlRecord, ProtocolError> {
    let attrs = attributes(element)?;
    let (name, value) = attrs.first().ok_or(ProtocolError::MissingAttribute("id"))?;
    if name != "id" {
        return Err(ProtocolError::MissingAttribute("id"));
    }
    let id = value.trim().parse().map_err(|_| ProtocolError::InvalidNumber {
        name: "id",
        value: value.clone(),
    })?;
    Ok(ControlRecord::BindSlot { id })
}

fn parse_outgoing(element: &BytesStart<'_>) -> Result<ControlRecord, ProtocolError> {
    let mut remote_addr = None;
    let mut remote_port = None;
    let mut local_addr = None;
    let mut local_port = None;
    let mut payload = None;

    for (name, value) in attributes(element)? {
        match name.as_str() {
            "dst_addr" => remote_addr = Some(value),
            "dst_port" => remote_port = Some(value),
            "src_addr" => local_addr = Some(value),
            "src_port" => local_port = Some(parse_port(&value)?),
            "msg" => payload = Some(decode_payload(&value)?),
            _ => return Err(ProtocolError::UnknownAttribute { name, value }),
        }
    }

    Ok(ControlRecord::Outgoing(OutboundPacket {
        remote_addr: remote_addr.ok_or(ProtocolError::MissingAttribute("dst_addr"))?,
        local_addr: local_addr.ok_or(ProtocolError::MissingAttribute("src_addr"))?,
        remote_port: remote_port.ok_or(ProtocolError::MissingAttribute("dst_port"))?,
        local_port: local_port.ok_or(ProtocolError::MissingAttribute("src_port"))?,
        payload: payload.ok_or(ProtocolError::MissingAttribute("msg"))?,
    }))
}

fn parse_port(value: &str) -> Result<u16, ProtocolError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ProtocolError::InvalidNumber {
            name: "src_port",
            value: value.to_string(),
        }),
    }
}

/// Decode a base64 `msg` attribute, ignoring embedded whitespace
pub fn decode_payload(text: &str) -> Result<Vec<u8>, ProtocolError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let payload = STANDARD.decode(compact).map_err(|_| ProtocolError::InvalidPayload)?;
    if payload.is_empty() {
        return Err(ProtocolError::EmptyPayload);
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    Ok(payload)
}

/// Serialize an inbound datagram as an `incoming_packet` record, newline terminated
pub fn encode_incoming(packet: &InboundPacket) -> std::io::Result<Vec<u8>> {
    let src_port = packet.remote_port.to_string();
    let dst_port = packet.local_port.to_string();
    let src_addr = packet.remote_addr.to_string();
    let dst_addr = packet.local_addr.to_string();
    let rtime = format!("{:.6}", packet.received_at);
    let msg = STANDARD.encode(&packet.payload);

    let record = BytesStart::new(INCOMING_RECORD).with_attributes([
        ("src_addr", src_addr.as_str()),
        ("src_port", src_port.as_str()),
        ("dst_addr", dst_addr.as_str()),
        ("dst_port", dst_port.as_str()),
        ("rtime", rtime.as_str()),
        ("msg", msg.as_str()),
    ]);

    let mut writer = Writer::new(Vec::with_capacity(msg.len() + 160));
    writer
        .write_event(Event::Empty(record))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    let mut out = writer.into_inner();
    out.push(b'\n');
    Ok(out)
}
