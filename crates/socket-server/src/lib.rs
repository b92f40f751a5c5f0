//! SIP socket server for the rvoip B2BUA
//!
//! This crate is the transport half of a back-to-back user agent. It owns
//! the UDP sockets, sorts every received datagram onto a worker slot by
//! Call-ID, and relays slots to an external controller over a TCP control
//! channel that carries base64 payloads in a small XML record stream.
//!
//! ```text
//!  network ─UDP─► ListenerPool ──Call-ID──► Slot queues ──► ControlBridge ─TCP─► controller
//!  network ◄─UDP─ reply listeners ◄── sorter queue ◄──────── ControlBridge ◄─TCP─ controller
//! ```
//!
//! Every concurrent activity runs on its own OS thread and every hand-off
//! goes through a [`WorkQueue`].
//!
//! ```rust,no_run
//! use rvoip_socket_server::{ServerConfig, SocketServer};
//!
//! let config = ServerConfig::new(vec![5061, 5067, 5068])
//!     .with_listen("0.0.0.0", 5060)
//!     .with_cmd_listen("127.0.0.1", 22223);
//! let server = SocketServer::start(&config)?;
//! server.wait()?;
//! # Ok::<(), rvoip_socket_server::Error>(())
//! ```

pub mod bridge;
pub mod call_id;
pub mod config;
pub mod error;
pub mod listener;
pub mod logging;
pub mod net;
pub mod queue;
pub mod server;
pub mod slot;
pub mod work_item;

pub use bridge::{ControlBridge, ControlRecord, ExchangeStatus, ProtocolError};
pub use call_id::extract_call_id;
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use listener::{DispatchOutcome, Listener, ListenerKind, ListenerPool};
pub use logging::{setup_logging, LoggingConfig};
pub use queue::WorkQueue;
pub use server::SocketServer;
pub use slot::{Slot, SlotTable};
pub use work_item::{InboundPacket, OutboundPacket, WorkItem};
