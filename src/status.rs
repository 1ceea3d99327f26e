//! Status codes shared by every transport.
//!
//! API calls report failures synchronously through [`Result`]; asynchronous
//! outcomes (send completions, connect results, keepalive expiry) carry a
//! [`Status`] inside the corresponding event.

use std::fmt;
use std::io;

/// Outcome of a CCI operation or an asynchronously completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Normal completion.
    Success,
    /// Last-resort error.
    Generic,
    /// The peer or the local side tore the connection down.
    Disconnected,
    /// The receiver stayed out of receive buffers for the full timeout.
    Rnr,
    /// The local device is gone and not coming back.
    DeviceDead,
    /// The remote peer rejected an RMA handle as unknown or unauthorized.
    RmaHandle,
    /// The remote peer cannot perform the requested RMA variant.
    RmaOp,
    /// Feature unsupported by this transport.
    NotImplemented,
    /// Config file or resource missing.
    NotFound,
    /// Invalid argument.
    Invalid,
    /// A reliable send or a connect did not finish before its deadline.
    TimedOut,
    /// Allocation failure.
    NoMemory,
    /// Device missing or down.
    NoDevice,
    /// The device's network is down.
    NetworkDown,
    /// Resource busy (e.g. port already in use).
    Busy,
    /// Value out of range (e.g. no port available).
    Range,
    /// Resource temporarily unavailable.
    Again,
    /// TX/RX pool or OS queue exhausted.
    NoBufferSpace,
    /// Message longer than the connection allows.
    MessageTooLong,
    /// No message of the desired type.
    NoMessage,
    /// Address not available.
    AddrNotAvailable,
    /// The peer rejected the connection request.
    ConnRefused,
}

impl Status {
    /// Stable human-readable form, suitable for logs and diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Generic => "generic error",
            Status::Disconnected => "connection closed",
            Status::Rnr => "receiver not ready",
            Status::DeviceDead => "device is dead",
            Status::RmaHandle => "RMA handle rejected by peer",
            Status::RmaOp => "RMA operation not supported by peer",
            Status::NotImplemented => "not implemented",
            Status::NotFound => "not found",
            Status::Invalid => "invalid argument",
            Status::TimedOut => "timed out",
            Status::NoMemory => "out of memory",
            Status::NoDevice => "no device available",
            Status::NetworkDown => "network is down",
            Status::Busy => "resource busy",
            Status::Range => "value out of range",
            Status::Again => "resource temporarily unavailable",
            Status::NoBufferSpace => "no buffer space available",
            Status::MessageTooLong => "message too long",
            Status::NoMessage => "no message of desired type",
            Status::AddrNotAvailable => "address not available",
            Status::ConnRefused => "connection refused",
        }
    }
}

/// Returns the string form of a status.
pub fn strerror(status: Status) -> &'static str {
    status.as_str()
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for Status {}

impl From<io::Error> for Status {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::OutOfMemory => Status::NoMemory,
            io::ErrorKind::AddrInUse => Status::Busy,
            io::ErrorKind::AddrNotAvailable => Status::AddrNotAvailable,
            io::ErrorKind::TimedOut => Status::TimedOut,
            io::ErrorKind::WouldBlock => Status::Again,
            io::ErrorKind::ConnectionRefused => Status::ConnRefused,
            io::ErrorKind::NotFound => Status::NotFound,
            io::ErrorKind::InvalidInput => Status::Invalid,
            _ => Status::Generic,
        }
    }
}

/// Result type for CCI operations.
pub type Result<T> = std::result::Result<T, Status>;
