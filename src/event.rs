//! Typed events and the lease discipline.
//!
//! An [`Event`] owns the receive buffer backing its payload (when it has
//! one): the buffer leaves the endpoint's free list inside the event and
//! goes back when the application returns it. Exactly one holder exists at
//! any time, so no reference counting is needed.

use std::fmt;
use std::sync::Weak;

use crate::buffer::RxBuffer;
use crate::connection::{ConnAttribute, Connection};
use crate::status::Status;
use crate::transport::EndpointOps;

/// What happened, with the payload of the variant.
#[derive(Debug)]
pub enum EventKind {
    /// A send or RMA completed.
    Send {
        status: Status,
        context: u64,
        connection: Connection,
    },
    /// A message arrived; the bytes live in the leased buffer.
    Recv { connection: Connection },
    /// An outgoing connection request finished.
    Connect {
        status: Status,
        context: u64,
        connection: Option<Connection>,
    },
    /// An incoming connection request; the payload lives in the leased
    /// buffer. Must be passed to accept or reject before being returned.
    ConnectRequest { attribute: ConnAttribute },
    /// An accepted connection finished its handshake.
    Accept {
        status: Status,
        context: u64,
        connection: Option<Connection>,
    },
    /// A keepalive went unanswered for a full period.
    KeepaliveTimedout { connection: Connection },
    /// The endpoint's device failed irrecoverably.
    EndpointDeviceFailed,
}

impl EventKind {
    /// Stable name of the event type.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Send { .. } => "SEND",
            EventKind::Recv { .. } => "RECV",
            EventKind::Connect { .. } => "CONNECT",
            EventKind::ConnectRequest { .. } => "CONNECT_REQUEST",
            EventKind::Accept { .. } => "ACCEPT",
            EventKind::KeepaliveTimedout { .. } => "KEEPALIVE_TIMEDOUT",
            EventKind::EndpointDeviceFailed => "ENDPOINT_DEVICE_FAILED",
        }
    }
}

/// One leased event popped from an endpoint's ready queue.
pub struct Event {
    kind: EventKind,
    buffer: Option<RxBuffer>,
    token: u64,
    endpoint: Weak<dyn EndpointOps>,
}

impl Event {
    pub(crate) fn new(
        kind: EventKind,
        buffer: Option<RxBuffer>,
        token: u64,
        endpoint: Weak<dyn EndpointOps>,
    ) -> Self {
        Self {
            kind,
            buffer,
            token,
            endpoint,
        }
    }

    /// The event variant.
    #[inline]
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Payload bytes for `Recv` and `ConnectRequest` events; empty
    /// otherwise.
    pub fn data(&self) -> &[u8] {
        self.buffer.as_ref().map(RxBuffer::bytes).unwrap_or(&[])
    }

    /// The connection the event refers to, if any.
    pub fn connection(&self) -> Option<&Connection> {
        match &self.kind {
            EventKind::Send { connection, .. }
            | EventKind::Recv { connection }
            | EventKind::KeepaliveTimedout { connection } => Some(connection),
            EventKind::Connect { connection, .. } | EventKind::Accept { connection, .. } => {
                connection.as_ref()
            }
            EventKind::ConnectRequest { .. } | EventKind::EndpointDeviceFailed => None,
        }
    }

    #[inline]
    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    pub(crate) fn endpoint(&self) -> &Weak<dyn EndpointOps> {
        &self.endpoint
    }

    pub(crate) fn into_parts(self) -> (EventKind, Option<RxBuffer>, u64) {
        (self.kind, self.buffer, self.token)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("type", &self.kind.name())
            .field("kind", &self.kind)
            .field("data_len", &self.data().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dangling() -> Weak<dyn EndpointOps> {
        Weak::<crate::sock::SockEndpoint>::new()
    }

    #[test]
    fn test_event_names() {
        let ev = Event::new(EventKind::EndpointDeviceFailed, None, 1, dangling());
        assert_eq!(ev.kind().name(), "ENDPOINT_DEVICE_FAILED");
        assert!(ev.data().is_empty());
        assert!(ev.connection().is_none());
    }

    #[test]
    fn test_event_data_leases_buffer() {
        let mut pool = crate::buffer::RxPool::new(1, 32, 9);
        let mut buf = pool.take().unwrap();
        buf.fill(b"payload");
        let ev = Event::new(
            EventKind::ConnectRequest {
                attribute: ConnAttribute::Ru,
            },
            Some(buf),
            7,
            dangling(),
        );
        assert_eq!(ev.data(), b"payload");
        assert_eq!(ev.token(), 7);
        let (_, buf, _) = ev.into_parts();
        pool.put(buf.unwrap()).unwrap();
        assert_eq!(pool.available(), 1);
    }
}
