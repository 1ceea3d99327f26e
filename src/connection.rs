//! Connection handles.
//!
//! A [`Connection`] is a non-owning handle: a weak reference to its
//! endpoint plus the local connection ID, validated against the endpoint's
//! table on every call. Destroying the endpoint or disconnecting makes the
//! handle stale; stale handles answer `Invalid`.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::rma::RmaHandle;
use crate::status::{Result, Status};
use crate::transport::{EndpointOps, MsgFlags, OptName, OptValue, RmaFlags};

/// Reliability and ordering of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAttribute {
    /// Reliable ordered: delivery and completions follow issue order.
    Ro,
    /// Reliable unordered: delivery guaranteed, order is not.
    Ru,
    /// Unreliable unordered.
    Uu,
    /// Unreliable multicast, send side.
    UuMcTx,
    /// Unreliable multicast, receive side.
    UuMcRx,
}

impl ConnAttribute {
    /// Whether the connection retransmits and acknowledges.
    #[inline]
    pub fn is_reliable(self) -> bool {
        matches!(self, ConnAttribute::Ro | ConnAttribute::Ru)
    }

    /// Whether delivery and completion order is guaranteed.
    #[inline]
    pub fn is_ordered(self) -> bool {
        self == ConnAttribute::Ro
    }

    #[inline]
    pub fn is_multicast(self) -> bool {
        matches!(self, ConnAttribute::UuMcTx | ConnAttribute::UuMcRx)
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            ConnAttribute::Ro => 0,
            ConnAttribute::Ru => 1,
            ConnAttribute::Uu => 2,
            ConnAttribute::UuMcTx => 3,
            ConnAttribute::UuMcRx => 4,
        }
    }

    pub(crate) fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(ConnAttribute::Ro),
            1 => Some(ConnAttribute::Ru),
            2 => Some(ConnAttribute::Uu),
            3 => Some(ConnAttribute::UuMcTx),
            4 => Some(ConnAttribute::UuMcRx),
            _ => None,
        }
    }
}

/// Handle to one connection of an endpoint.
#[derive(Clone)]
pub struct Connection {
    ep: Weak<dyn EndpointOps>,
    id: u32,
}

impl Connection {
    pub(crate) fn new(ep: Weak<dyn EndpointOps>, id: u32) -> Self {
        Self { ep, id }
    }

    fn ops(&self) -> Result<Arc<dyn EndpointOps>> {
        self.ep.upgrade().ok_or(Status::Invalid)
    }

    /// Local connection ID, unique within the endpoint.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Queue a short message.
    ///
    /// On reliable connections the completion is reported through a `Send`
    /// event unless `SILENT`; with `BLOCKING` the call waits and reports
    /// the completion status synchronously instead.
    pub fn send(&self, msg: &[u8], context: u64, flags: MsgFlags) -> Result<()> {
        self.ops()?.send(self.id, &[msg], context, flags)
    }

    /// Queue a gathered message; the segments are sent as one message.
    pub fn sendv(&self, segments: &[&[u8]], context: u64, flags: MsgFlags) -> Result<()> {
        self.ops()?.send(self.id, segments, context, flags)
    }

    /// Start an RMA operation against the peer's registered region.
    ///
    /// Exactly one of `READ`/`WRITE` must be set in `flags`; the
    /// connection must be reliable. `completion_msg`, when given, arrives
    /// at the peer as an ordinary receive once the data is fully written.
    #[allow(clippy::too_many_arguments)]
    pub fn rma(
        &self,
        completion_msg: Option<&[u8]>,
        local: &RmaHandle,
        local_offset: u64,
        remote: &RmaHandle,
        remote_offset: u64,
        len: u64,
        context: u64,
        flags: RmaFlags,
    ) -> Result<()> {
        self.ops()?.rma(
            self.id,
            completion_msg,
            local,
            local_offset,
            remote,
            remote_offset,
            len,
            context,
            flags,
        )
    }

    /// Locally tear the connection down, aborting in-flight operations
    /// with `Disconnected`. The peer is not notified.
    pub fn disconnect(&self) -> Result<()> {
        self.ops()?.disconnect(self.id)
    }

    pub fn attribute(&self) -> Result<ConnAttribute> {
        self.ops()?.conn_attribute(self.id)
    }

    /// Maximum message size on this connection.
    pub fn max_send_size(&self) -> Result<u32> {
        self.ops()?.conn_max_send_size(self.id)
    }

    /// Application context attached to the connection.
    pub fn context(&self) -> Result<u64> {
        self.ops()?.conn_context(self.id)
    }

    pub fn set_context(&self, context: u64) -> Result<()> {
        self.ops()?.conn_set_context(self.id, context)
    }

    /// Set a connection-level option (`ConnSendTimeout`,
    /// `ConnKeepaliveTimeout`).
    pub fn set_opt(&self, name: OptName, value: u32) -> Result<()> {
        self.ops()?.set_opt(Some(self.id), name, value)
    }

    pub fn get_opt(&self, name: OptName) -> Result<OptValue> {
        self.ops()?.get_opt(Some(self.id), name)
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.ep.ptr_eq(&other.ep)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_predicates() {
        assert!(ConnAttribute::Ro.is_reliable());
        assert!(ConnAttribute::Ro.is_ordered());
        assert!(ConnAttribute::Ru.is_reliable());
        assert!(!ConnAttribute::Ru.is_ordered());
        assert!(!ConnAttribute::Uu.is_reliable());
        assert!(ConnAttribute::UuMcTx.is_multicast());
        assert!(ConnAttribute::UuMcRx.is_multicast());
        assert!(!ConnAttribute::Uu.is_multicast());
    }

    #[test]
    fn test_attribute_wire_roundtrip() {
        for attr in [
            ConnAttribute::Ro,
            ConnAttribute::Ru,
            ConnAttribute::Uu,
            ConnAttribute::UuMcTx,
            ConnAttribute::UuMcRx,
        ] {
            assert_eq!(ConnAttribute::from_wire(attr.to_wire()), Some(attr));
        }
        assert_eq!(ConnAttribute::from_wire(9), None);
    }

    #[test]
    fn test_stale_handle_is_invalid() {
        // A connection whose endpoint is gone answers Invalid everywhere.
        let ep: Weak<dyn EndpointOps> = Weak::<crate::sock::SockEndpoint>::new();
        let conn = Connection { ep, id: 42 };
        assert_eq!(conn.send(b"x", 0, MsgFlags::empty()), Err(Status::Invalid));
        assert_eq!(conn.attribute(), Err(Status::Invalid));
        assert_eq!(conn.disconnect(), Err(Status::Invalid));
    }
}
