//! Public endpoint handle.
//!
//! An [`Endpoint`] owns the transport-side endpoint object; dropping (or
//! explicitly destroying) it tears everything down and makes every child
//! connection, RMA handle, and event stale.

use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::BufferCounts;
use crate::connection::ConnAttribute;
use crate::event::{Event, EventKind};
use crate::rma::RmaHandle;
use crate::status::{Result, Status};
use crate::transport::{EndpointOps, OptName, OptValue, RmaProt};

/// A local communication resource collection bound to one device.
pub struct Endpoint {
    ops: Arc<dyn EndpointOps>,
}

impl Endpoint {
    pub(crate) fn new(ops: Arc<dyn EndpointOps>) -> Self {
        Self { ops }
    }

    /// The endpoint's listening URI, unique within the process.
    pub fn uri(&self) -> String {
        self.ops.uri()
    }

    /// Pollable OS handle for blocking until the endpoint has work.
    ///
    /// The handle becomes readable when the event queue turns non-empty;
    /// the application must never read from or write to it directly.
    pub fn os_handle(&self) -> RawFd {
        self.ops.os_handle()
    }

    /// Re-arm level signalling of the wake handle.
    pub fn arm_wake(&self) -> Result<()> {
        self.ops.arm_wake()
    }

    /// Start a connection handshake toward a peer endpoint's URI.
    ///
    /// `payload` (up to [`crate::CONN_REQ_LEN`] bytes) is delivered inside
    /// the peer's `ConnectRequest` event. The outcome arrives as a
    /// `Connect` event; `timeout` of `None` uses the transport default.
    pub fn connect(
        &self,
        server_uri: &str,
        payload: &[u8],
        attribute: ConnAttribute,
        context: u64,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.ops
            .connect(server_uri, payload, attribute, context, timeout)
    }

    /// Accept a pending connection request event.
    ///
    /// The new connection arrives later in an `Accept` event carrying
    /// `context`. The request event must still be returned afterwards.
    pub fn accept(&self, event: &Event, context: u64) -> Result<()> {
        self.check_event(event)?;
        self.ops.accept(event.token(), context)
    }

    /// Reject a pending connection request event.
    pub fn reject(&self, event: &Event) -> Result<()> {
        self.check_event(event)?;
        self.ops.reject(event.token())
    }

    fn check_event(&self, event: &Event) -> Result<()> {
        if !matches!(event.kind(), EventKind::ConnectRequest { .. }) {
            return Err(Status::Invalid);
        }
        let same = event
            .endpoint()
            .upgrade()
            .is_some_and(|ops| ops.endpoint_id() == self.ops.endpoint_id());
        if !same {
            return Err(Status::Invalid);
        }
        Ok(())
    }

    /// Poll for the next event, driving transport progress.
    ///
    /// Never blocks. `Ok(None)` means nothing is pending;
    /// `Err(NoBufferSpace)` additionally means the receive pool is empty
    /// and events must be returned before more messages can arrive.
    pub fn get_event(&self) -> Result<Option<Event>> {
        self.ops.get_event()
    }

    /// Return an event, releasing its buffer lease.
    ///
    /// A `ConnectRequest` event that was neither accepted nor rejected is
    /// refused with `Invalid` and redelivered by a later `get_event`.
    pub fn return_event(&self, event: Event) -> Result<()> {
        self.ops.return_event(event)
    }

    /// Set an endpoint-level option.
    pub fn set_opt(&self, name: OptName, value: u32) -> Result<()> {
        self.ops.set_opt(None, name, value)
    }

    /// Get an endpoint-level option.
    pub fn get_opt(&self, name: OptName) -> Result<OptValue> {
        self.ops.get_opt(None, name)
    }

    /// Register a memory region for RMA and mint its handle.
    ///
    /// Overlapping registrations are allowed. The serialized handle
    /// ([`RmaHandle::to_bytes`]) is safe to send to peers.
    ///
    /// # Safety
    ///
    /// `start..start + length` must be valid for reads and writes and stay
    /// valid until the handle is deregistered or the endpoint destroyed;
    /// remote peers access the region concurrently with local code.
    pub unsafe fn rma_register(
        &self,
        start: *mut u8,
        length: u64,
        prot: RmaProt,
    ) -> Result<RmaHandle> {
        self.ops.rma_register(start, length, prot)
    }

    /// Deregister a region. In-flight RMA that still uses it aborts with
    /// `Disconnected`; fragments arriving for the stale token are refused.
    pub fn rma_deregister(&self, handle: &RmaHandle) -> Result<()> {
        self.ops.rma_deregister(handle)
    }

    /// Current TX/RX pool occupancy.
    pub fn buffer_counts(&self) -> BufferCounts {
        self.ops.buffer_counts()
    }

    /// Tear the endpoint down, invalidating every child object.
    ///
    /// Equivalent to dropping the endpoint.
    pub fn destroy(self) {
        self.ops.destroy();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.ops.destroy();
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").field("uri", &self.uri()).finish()
    }
}
