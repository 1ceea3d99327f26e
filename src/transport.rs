//! Transport plugin contract.
//!
//! Every transport implements [`Transport`] for device enumeration and
//! endpoint creation, and [`EndpointOps`] for the per-endpoint operation
//! set. The public API types are thin wrappers that dispatch through the
//! trait object stored on each device; the core never switches on the
//! transport kind.

use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;

use crate::buffer::BufferCounts;
use crate::config::DeviceProfile;
use crate::connection::ConnAttribute;
use crate::event::Event;
use crate::rma::RmaHandle;
use crate::status::Result;

bitflags! {
    /// Library capabilities reported by `init`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        /// All operations may be invoked concurrently from any thread.
        const THREAD_SAFETY = 1 << 0;
    }
}

bitflags! {
    /// Flags accepted by `send` and `sendv`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u32 {
        /// Wait for the completion and report it synchronously; no event
        /// is generated.
        const BLOCKING = 1 << 0;
        /// The caller keeps the buffer stable until completion, allowing
        /// zero-copy transmission where the transport supports it.
        const NO_COPY = 1 << 1;
        /// Suppress the completion event.
        const SILENT = 1 << 3;
    }
}

bitflags! {
    /// Flags accepted by `rma`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RmaFlags: u32 {
        const BLOCKING = 1 << 0;
        const NO_COPY = 1 << 1;
        const SILENT = 1 << 3;
        /// Move remote memory to local memory.
        const READ = 1 << 4;
        /// Move local memory to remote memory.
        const WRITE = 1 << 5;
        /// Complete all prior RMA on the connection remotely before this
        /// operation; later operations wait for it.
        const FENCE = 1 << 6;
    }
}

bitflags! {
    /// Protection flags for `rma_register`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RmaProt: u32 {
        /// Remote endpoints may read the region.
        const READ = 1 << 4;
        /// Remote endpoints may write the region.
        const WRITE = 1 << 5;
    }
}

/// Endpoint and connection option names for `set_opt`/`get_opt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptName {
    /// Default send timeout for new connections, microseconds.
    EndptSendTimeout,
    /// Receive buffer count on the endpoint.
    EndptRecvBufCount,
    /// Send buffer count on the endpoint.
    EndptSendBufCount,
    /// Keepalive period applied to every reliable connection, microseconds.
    EndptKeepaliveTimeout,
    /// The endpoint's listening URI. Get-only.
    EndptUri,
    /// RMA alignment requirements. Get-only.
    EndptRmaAlign,
    /// Reliable send timeout of one connection, microseconds.
    ConnSendTimeout,
    /// Keepalive period of one connection, microseconds.
    ConnKeepaliveTimeout,
}

/// Value returned by `get_opt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptValue {
    U32(u32),
    Uri(String),
    RmaAlign(RmaAlignment),
}

/// Per-operation RMA alignment requirements; 0 means unconstrained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RmaAlignment {
    pub rma_write_local_addr: u32,
    pub rma_write_remote_addr: u32,
    pub rma_write_length: u32,
    pub rma_read_local_addr: u32,
    pub rma_read_remote_addr: u32,
    pub rma_read_length: u32,
}

/// PCI location of a device; all-ones for non-PCI devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u32,
    pub dev: u32,
    pub func: u32,
}

impl PciAddress {
    /// Marker for devices without a PCI identity (e.g. sockets, shmem).
    pub const NONE: PciAddress = PciAddress {
        domain: !0,
        bus: !0,
        dev: !0,
        func: !0,
    };
}

/// Device description produced by a transport during enumeration.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub name: String,
    pub up: bool,
    pub info: String,
    pub conf: Vec<String>,
    pub max_send_size: u32,
    pub rate: u64,
    pub pci: PciAddress,
    pub priority: u8,
    pub is_default: bool,
}

/// One enumerated device, immutable after `init`.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    spec: DeviceSpec,
    transport: Arc<dyn Transport>,
}

impl Device {
    pub(crate) fn new(spec: DeviceSpec, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(DeviceInner { spec, transport }),
        }
    }

    /// Section name from the config file.
    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    /// Name of the transport that owns this device.
    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    /// Whether the device is up and usable.
    pub fn up(&self) -> bool {
        self.inner.spec.up
    }

    /// Human-readable description.
    pub fn info(&self) -> &str {
        &self.inner.spec.info
    }

    /// The `key=value` parameters passed through from the config.
    pub fn conf(&self) -> &[String] {
        &self.inner.spec.conf
    }

    /// Maximum send size supported by the device.
    pub fn max_send_size(&self) -> u32 {
        self.inner.spec.max_send_size
    }

    /// Nominal data rate in bits per second, 0 if unknown.
    pub fn rate(&self) -> u64 {
        self.inner.spec.rate
    }

    pub fn pci(&self) -> PciAddress {
        self.inner.spec.pci
    }

    pub fn priority(&self) -> u8 {
        self.inner.spec.priority
    }

    pub fn is_default(&self) -> bool {
        self.inner.spec.is_default
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("transport", &self.transport_name())
            .field("up", &self.up())
            .field("priority", &self.priority())
            .finish()
    }
}

/// A wire transport known to the core.
pub trait Transport: Send + Sync {
    /// Transport tag matched against the config `transport =` key.
    fn name(&self) -> &'static str;

    /// Build device descriptions for the profiles that name this transport.
    fn enumerate(&self, profiles: &[DeviceProfile]) -> Result<Vec<DeviceSpec>>;

    /// Allocate endpoint resources and bind the wire resource.
    ///
    /// `service` is a transport-specific binding hint (a port number for
    /// socket transports).
    fn create_endpoint(&self, device: &Device, service: Option<&str>)
        -> Result<Arc<dyn EndpointOps>>;
}

/// Per-endpoint operations a transport must implement.
///
/// The public `Endpoint`, `Connection`, and `Event` types dispatch here.
pub trait EndpointOps: Send + Sync {
    /// Process-unique endpoint ID.
    fn endpoint_id(&self) -> u32;

    /// The endpoint's listening URI.
    fn uri(&self) -> String;

    /// Pollable OS handle signalled when the event queue becomes non-empty.
    fn os_handle(&self) -> RawFd;

    /// Re-arm level signalling of the wake handle.
    fn arm_wake(&self) -> Result<()>;

    /// Tear down the endpoint and invalidate every child object.
    fn destroy(&self);

    /// Start the three-way handshake toward `server_uri`.
    fn connect(
        &self,
        server_uri: &str,
        payload: &[u8],
        attribute: ConnAttribute,
        context: u64,
        timeout: Option<Duration>,
    ) -> Result<()>;

    /// Accept the connection request identified by an event token.
    fn accept(&self, event_token: u64, context: u64) -> Result<()>;

    /// Reject the connection request identified by an event token.
    fn reject(&self, event_token: u64) -> Result<()>;

    /// Locally tear down one connection, aborting in-flight operations.
    fn disconnect(&self, conn_id: u32) -> Result<()>;

    /// Queue a (gathered) message on a connection.
    fn send(&self, conn_id: u32, segments: &[&[u8]], context: u64, flags: MsgFlags)
        -> Result<()>;

    fn conn_attribute(&self, conn_id: u32) -> Result<ConnAttribute>;
    fn conn_max_send_size(&self, conn_id: u32) -> Result<u32>;
    fn conn_context(&self, conn_id: u32) -> Result<u64>;
    fn conn_set_context(&self, conn_id: u32, context: u64) -> Result<()>;

    /// Set an endpoint-level (`conn_id == None`) or connection-level option.
    fn set_opt(&self, conn_id: Option<u32>, name: OptName, value: u32) -> Result<()>;

    /// Get an endpoint-level or connection-level option.
    fn get_opt(&self, conn_id: Option<u32>, name: OptName) -> Result<OptValue>;

    /// Register `length` bytes at `start` for RMA.
    ///
    /// The caller guarantees the region outlives the registration.
    fn rma_register(&self, start: *mut u8, length: u64, prot: RmaProt) -> Result<RmaHandle>;

    /// Drop a registration, aborting in-flight RMA that still uses it.
    fn rma_deregister(&self, handle: &RmaHandle) -> Result<()>;

    /// Start an RMA operation on a reliable connection.
    #[allow(clippy::too_many_arguments)]
    fn rma(
        &self,
        conn_id: u32,
        completion_msg: Option<&[u8]>,
        local: &RmaHandle,
        local_offset: u64,
        remote: &RmaHandle,
        remote_offset: u64,
        len: u64,
        context: u64,
        flags: RmaFlags,
    ) -> Result<()>;

    /// Poll for the next event, driving progress.
    fn get_event(&self) -> Result<Option<Event>>;

    /// Return an event's buffer lease to the endpoint.
    fn return_event(&self, event: Event) -> Result<()>;

    /// Current buffer-pool occupancy.
    fn buffer_counts(&self) -> BufferCounts;
}
