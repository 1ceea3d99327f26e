//! # CCI - Common Communications Interface
//!
//! A transport-agnostic messaging layer for high-performance computing.
//! Applications target one small API - connect, send short messages,
//! remote-memory access, poll events - and the runtime dispatches to a
//! pluggable wire transport. This crate ships the transport framework and
//! the reference UDP ("sock") transport implementing the full semantics:
//!
//! - **Connections** with negotiated reliability and ordering: reliable
//!   ordered (RO), reliable unordered (RU), unreliable (UU), and
//!   unreliable multicast (UU_MC_TX/RX), established through a three-way
//!   datagram handshake carrying an application payload.
//! - **Reliable delivery** with per-connection sliding windows,
//!   retransmission with exponential backoff, cumulative + selective
//!   acknowledgements, and receiver-not-ready NACK flow control.
//! - **RMA**: one-sided READ/WRITE against registered remote memory,
//!   segmented over reliable fragments, with optional completion messages
//!   and per-connection fencing.
//! - **Events** with a strict lease discipline over pre-allocated receive
//!   buffers, plus a pollable OS wake handle for blocking callers.
//!
//! ## Usage
//!
//! ```ignore
//! use cci::{ConnAttribute, EventKind, MsgFlags, ABI_VERSION};
//!
//! // CCI_CONFIG names an INI-style file describing the devices.
//! cci::init(ABI_VERSION, 0)?;
//! let endpoint = cci::create_endpoint(None, 0)?;
//! println!("listening on {}", endpoint.uri());
//!
//! endpoint.connect("sock://10.0.0.2:5555", b"hello", ConnAttribute::Ru, 1, None)?;
//! loop {
//!     match endpoint.get_event()? {
//!         Some(ev) => {
//!             match ev.kind() {
//!                 EventKind::Connect { connection: Some(conn), .. } => {
//!                     conn.send(b"ping", 0, MsgFlags::empty())?;
//!                 }
//!                 EventKind::Recv { .. } => println!("got {:?}", ev.data()),
//!                 _ => {}
//!             }
//!             endpoint.return_event(ev)?;
//!         }
//!         None => { /* poll endpoint.os_handle() to block */ }
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`status`]: the status taxonomy shared by every transport
//! - [`config`]: `CCI_CONFIG` parsing and endpoint tunables
//! - [`transport`]: the plugin contract ([`transport::Transport`],
//!   [`transport::EndpointOps`]) and device registry types
//! - [`packet`]: the bit-exact wire codec
//! - [`reliability`]: sequence arithmetic and the receive window
//! - [`buffer`]: TX/RX buffer pools with lease semantics
//! - [`event`]: typed events ([`EventKind`])
//! - [`rma`]: RMA registration table and handles
//! - [`sock`]: the reference UDP transport and its progress engine
//! - [`ids`]: sparse ID allocation

pub mod buffer;
pub mod config;
pub mod connection;
pub mod endpoint;
mod env;
pub mod event;
pub mod ids;
pub mod packet;
pub mod reliability;
pub mod rma;
pub mod sock;
pub mod status;
pub mod transport;

/// ABI version checked by [`init`].
pub const ABI_VERSION: u32 = 2;

/// Maximum connect-request payload length in bytes.
pub const CONN_REQ_LEN: usize = 1024;

pub use buffer::BufferCounts;
pub use connection::{ConnAttribute, Connection};
pub use endpoint::Endpoint;
pub use env::{create_endpoint, create_endpoint_at, finalize, get_devices, init};
pub use event::{Event, EventKind};
pub use rma::{RmaHandle, RMA_HANDLE_SIZE};
pub use status::{strerror, Result, Status};
pub use transport::{
    Caps, Device, MsgFlags, OptName, OptValue, RmaAlignment, RmaFlags, RmaProt,
};
