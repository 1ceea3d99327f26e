//! Reference datagram transport over UDP sockets.
//!
//! Implements the full CCI semantics on top of unreliable datagrams: the
//! three-way connection handshake, per-connection reliable delivery with
//! retransmission and cumulative + selective ACKs, RNR NACK flow control,
//! RMA emulation over reliable segments, keepalives, and the polling
//! progress engine that drives all of it.
//!
//! Lock order, outermost first: device send queue, endpoint core,
//! connection state, RMA registry, event queue. User code is never called
//! with any of them held.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::buffer::{BufferCounts, RxBuffer, RxPool, TxPool};
use crate::config::{DeviceProfile, EndpointConfig};
use crate::connection::{ConnAttribute, Connection};
use crate::event::{Event, EventKind};
use crate::ids::IdPool;
use crate::packet::{
    Header, PktType, RmaReadReplyHdr, RmaReadReqHdr, RmaWriteHdr, HEADER_SIZE, NACK_RMA_HANDLE,
    NACK_RNR, RMA_READ_REPLY_HDR_SIZE, RMA_READ_REQ_HDR_SIZE, RMA_WRITE_HDR_SIZE,
};
use crate::reliability::{backoff_us, seq_after, Arrival, RecvWindow};
use crate::rma::{RmaHandle, RmaRegistry};
use crate::status::{Result, Status};
use crate::transport::{
    Device, DeviceSpec, EndpointOps, MsgFlags, OptName, OptValue, PciAddress, RmaAlignment,
    RmaFlags, RmaProt, Transport,
};
use crate::CONN_REQ_LEN;

/// Default maximum send size of a sock device.
const DEFAULT_MSS: u32 = 8192;

/// Largest configurable send size; bounded by the receive scratch buffer.
const MAX_MSS: u32 = 60_000;

/// Nominal rate reported for sock devices, bits per second.
const DEFAULT_RATE: u64 = 10_000_000_000;

/// Protocol bound on unacknowledged reliable segments per connection,
/// dictated by the 32-bit selective-ACK bitmap.
const SEND_WINDOW: u32 = 32;

/// Bound on the reordering hold queue of an RO connection.
const HOLD_LIMIT: usize = 64;

/// Cap on in-flight fragments per RMA operation.
const RMA_INFLIGHT: u32 = 16;

/// Datagram receive scratch size.
const SCRATCH_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Wake handle
// ---------------------------------------------------------------------------

/// Pollable pipe signalled when the event queue becomes non-empty.
struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    fn new() -> Result<Self> {
        let mut fds = [0i32; 2];
        // SAFETY: plain pipe2 call with a valid two-element array.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(Status::Generic);
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    fn signal(&self) {
        let byte = [1u8];
        // SAFETY: write to an open pipe fd; if the pipe is full the level
        // signal is already pending.
        unsafe {
            libc::write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: read from an open non-blocking pipe fd.
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, 64) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        // SAFETY: fds were created by pipe2 and are closed exactly once.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

// ---------------------------------------------------------------------------
// TX descriptors and the device send queue
// ---------------------------------------------------------------------------

/// Synchronous completion slot for BLOCKING sends.
struct BlockSlot {
    state: Mutex<Option<Status>>,
    cv: Condvar,
}

impl BlockSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    fn complete(&self, status: Status) {
        let mut st = self.state.lock().unwrap();
        if st.is_none() {
            *st = Some(status);
            self.cv.notify_all();
        }
    }

    fn poll_wait(&self, timeout: Duration) -> Option<Status> {
        let st = self.state.lock().unwrap();
        let (st, _) = self.cv.wait_timeout(st, timeout).unwrap();
        *st
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxKind {
    ConnRequest,
    ConnReply,
    Msg,
    Keepalive,
    RmaWrite { op: u64, len: u32 },
    RmaRead { op: u64, len: u32 },
}

/// One queued or in-flight outgoing packet.
struct Tx {
    kind: TxKind,
    ep: Weak<SockEndpoint>,
    conn_id: u32,
    seq: u32,
    reliable: bool,
    deadline: Instant,
    last_send: Option<Instant>,
    resends: u32,
    silent: bool,
    context: u64,
    blocking: Option<Arc<BlockSlot>>,
    peer: SocketAddr,
    buf: Vec<u8>,
}

impl Tx {
    /// Whether a cumulative/selective ACK pair covers this segment.
    fn acked_by(&self, ack: u32, sack: u32, selective: bool) -> bool {
        if !seq_after(self.seq, ack) {
            return true;
        }
        if !selective {
            return false;
        }
        let dist = self.seq.wrapping_sub(ack);
        (2..=33).contains(&dist) && sack & (1u32 << (dist - 2)) != 0
    }
}

#[derive(Default)]
struct DevQueue {
    queued: VecDeque<Box<Tx>>,
    pending: Vec<Box<Tx>>,
}

/// Shared per-device state: the ready-to-send and in-flight lists.
struct SockDevice {
    queue: Mutex<DevQueue>,
}

impl SockDevice {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(DevQueue::default()),
        })
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// The UDP reference transport.
pub struct SockTransport {
    endpoint_ids: Mutex<IdPool>,
    devices: Mutex<HashMap<String, Arc<SockDevice>>>,
    self_weak: OnceLock<Weak<SockTransport>>,
}

impl SockTransport {
    pub fn new() -> Arc<Self> {
        let t = Arc::new(Self {
            endpoint_ids: Mutex::new(IdPool::new(4)),
            devices: Mutex::new(HashMap::new()),
            self_weak: OnceLock::new(),
        });
        t.self_weak.set(Arc::downgrade(&t)).ok();
        t
    }

    fn device_queue(&self, name: &str) -> Arc<SockDevice> {
        let mut devs = self.devices.lock().unwrap();
        devs.entry(name.to_string())
            .or_insert_with(SockDevice::new)
            .clone()
    }
}

impl Transport for SockTransport {
    fn name(&self) -> &'static str {
        "sock"
    }

    fn enumerate(&self, profiles: &[DeviceProfile]) -> Result<Vec<DeviceSpec>> {
        let mut specs = Vec::new();
        for p in profiles {
            if p.transport != "sock" {
                continue;
            }
            let ip = p.arg("ip");
            let up = ip.is_some_and(|s| s.parse::<Ipv4Addr>().is_ok());
            let mss = p
                .arg("mss")
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(DEFAULT_MSS)
                .min(MAX_MSS);
            specs.push(DeviceSpec {
                name: p.name.clone(),
                up,
                info: format!("sock/{}", ip.unwrap_or("unconfigured")),
                conf: p.conf_strings(),
                max_send_size: mss,
                rate: DEFAULT_RATE,
                pci: PciAddress::NONE,
                priority: p.priority,
                is_default: p.is_default,
            });
        }
        Ok(specs)
    }

    fn create_endpoint(
        &self,
        device: &Device,
        service: Option<&str>,
    ) -> Result<Arc<dyn EndpointOps>> {
        if !device.up() {
            return Err(Status::NoDevice);
        }
        let me = self
            .self_weak
            .get()
            .and_then(Weak::upgrade)
            .ok_or(Status::Generic)?;
        let dev_queue = self.device_queue(device.name());
        SockEndpoint::create(&me, device, dev_queue, service)
    }
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnPhase {
    /// Connect request sent, waiting for the reply.
    Active,
    /// Request received, the application has not decided yet.
    Passive,
    /// Accepted and replied, waiting for the handshake ACK.
    PassiveReplied,
    /// Fully established.
    Ready,
}

/// One RMA operation queued on a connection.
struct RmaOp {
    id: u64,
    write: bool,
    local_token: u64,
    local_offset: u64,
    remote_token: u64,
    remote_offset: u64,
    len: u64,
    frag: u32,
    next_off: u64,
    inflight: u32,
    done: u64,
    fence: bool,
    silent: bool,
    context: u64,
    completion: Option<Vec<u8>>,
    blocking: Option<Arc<BlockSlot>>,
}

impl RmaOp {
    fn data_done(&self) -> bool {
        self.done >= self.len
    }

    fn has_work(&self) -> bool {
        self.next_off < self.len && self.inflight < RMA_INFLIGHT
    }
}

struct ConnState {
    phase: ConnPhase,
    peer_id: u32,
    max_send_size: u32,
    context: u64,
    send_timeout_us: Option<u32>,
    keepalive_us: u32,
    ka_last: Instant,
    ka_pending: bool,
    local_initial_seq: u32,
    next_seq: u32,
    send_base: u32,
    recv: RecvWindow,
    hold: HashMap<u32, Option<RxBuffer>>,
    ack_due: bool,
    last_ack: Instant,
    rnr_peer: bool,
    failed: Option<Status>,
    rma_ops: VecDeque<RmaOp>,
    rma_next_id: u64,
    read_frag_seq: u32,
}

struct SockConn {
    id: u32,
    attribute: ConnAttribute,
    peer: SocketAddr,
    state: Mutex<ConnState>,
}

impl SockConn {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: u32,
        attribute: ConnAttribute,
        peer: SocketAddr,
        phase: ConnPhase,
        peer_id: u32,
        initial_seq: u32,
        peer_initial_seq: u32,
        max_send_size: u32,
        context: u64,
        now: Instant,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            attribute,
            peer,
            state: Mutex::new(ConnState {
                phase,
                peer_id,
                max_send_size,
                context,
                send_timeout_us: None,
                keepalive_us: 0,
                ka_last: now,
                ka_pending: false,
                local_initial_seq: initial_seq,
                next_seq: initial_seq.wrapping_add(1),
                send_base: initial_seq.wrapping_add(1),
                recv: RecvWindow::new(peer_initial_seq),
                hold: HashMap::new(),
                ack_due: false,
                last_ack: now,
                rnr_peer: false,
                failed: None,
                rma_ops: VecDeque::new(),
                rma_next_id: 1,
                read_frag_seq: 0,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

struct ConnReq {
    conn_id: u32,
    handled: bool,
}

struct EpCore {
    cfg: EndpointConfig,
    tx: TxPool,
    rx: RxPool,
    conns: HashMap<u32, Arc<SockConn>>,
    conn_ids: IdPool,
    peer_index: HashMap<(SocketAddr, u32), u32>,
    conn_requests: HashMap<u64, ConnReq>,
    next_token: u64,
    mc_rx: Vec<u32>,
}

struct EventQueue {
    ready: VecDeque<Event>,
}

/// Endpoint state of the sock transport.
pub(crate) struct SockEndpoint {
    id: u32,
    uri: String,
    local_ip: Ipv4Addr,
    mss: u32,
    socket: UdpSocket,
    wake: WakePipe,
    device: Arc<SockDevice>,
    transport: Weak<SockTransport>,
    self_weak: OnceLock<Weak<SockEndpoint>>,
    self_ops: OnceLock<Weak<dyn EndpointOps>>,
    closed: AtomicBool,
    device_failed: AtomicBool,
    core: Mutex<EpCore>,
    registry: Mutex<RmaRegistry>,
    events: Mutex<EventQueue>,
    scratch: Mutex<Box<[u8]>>,
}

impl SockEndpoint {
    fn create(
        transport: &Arc<SockTransport>,
        device: &Device,
        dev_queue: Arc<SockDevice>,
        service: Option<&str>,
    ) -> Result<Arc<dyn EndpointOps>> {
        let ip = conf_lookup(device.conf(), "ip")
            .and_then(|s| s.parse::<Ipv4Addr>().ok())
            .ok_or(Status::NoDevice)?;
        let port: u16 = match service {
            Some(s) => {
                let v: u32 = s.parse().map_err(|_| Status::Invalid)?;
                u16::try_from(v).map_err(|_| Status::Range)?
            }
            None => 0,
        };

        let socket = UdpSocket::bind((ip, port)).map_err(Status::from)?;
        socket.set_nonblocking(true).map_err(Status::from)?;
        let local = socket.local_addr().map_err(Status::from)?;
        let uri = format!("sock://{}", local);

        let mss = device.max_send_size();
        let cfg = EndpointConfig::default();
        let id = transport.endpoint_ids.lock().unwrap().alloc();
        let buf_size = mss as usize + HEADER_SIZE;

        let ep = Arc::new(SockEndpoint {
            id,
            uri,
            local_ip: ip,
            mss,
            socket,
            wake: WakePipe::new()?,
            device: dev_queue,
            transport: Arc::downgrade(transport),
            self_weak: OnceLock::new(),
            self_ops: OnceLock::new(),
            closed: AtomicBool::new(false),
            device_failed: AtomicBool::new(false),
            core: Mutex::new(EpCore {
                tx: TxPool::new(cfg.tx_buf_count as usize, buf_size),
                rx: RxPool::new(cfg.rx_buf_count as usize, buf_size, id),
                cfg,
                conns: HashMap::new(),
                conn_ids: IdPool::new(4),
                peer_index: HashMap::new(),
                conn_requests: HashMap::new(),
                next_token: 1,
                mc_rx: Vec::new(),
            }),
            registry: Mutex::new(RmaRegistry::new()),
            events: Mutex::new(EventQueue {
                ready: VecDeque::new(),
            }),
            scratch: Mutex::new(vec![0u8; SCRATCH_SIZE].into_boxed_slice()),
        });

        let ops: Arc<dyn EndpointOps> = ep.clone();
        ep.self_weak.set(Arc::downgrade(&ep)).ok();
        ep.self_ops.set(Arc::downgrade(&ops)).ok();

        if conf_lookup(device.conf(), "progress") == Some("thread") {
            let weak = Arc::downgrade(&ep);
            std::thread::Builder::new()
                .name("cci-sock-progress".into())
                .spawn(move || loop {
                    let Some(ep) = weak.upgrade() else { break };
                    if ep.closed.load(Ordering::Acquire) {
                        break;
                    }
                    ep.progress();
                    drop(ep);
                    std::thread::sleep(Duration::from_micros(500));
                })
                .map_err(|_| Status::Generic)?;
        }

        debug!(uri = %ops.uri(), "sock endpoint created");
        Ok(ops)
    }

    fn weak(&self) -> Weak<SockEndpoint> {
        self.self_weak.get().cloned().unwrap_or_default()
    }

    fn ops_weak(&self) -> Weak<dyn EndpointOps> {
        self.self_ops
            .get()
            .cloned()
            .expect("endpoint weak set at creation")
    }

    fn conn_handle(&self, id: u32) -> Connection {
        Connection::new(self.ops_weak(), id)
    }

    fn lookup_conn(&self, id: u32) -> Option<Arc<SockConn>> {
        self.core.lock().unwrap().conns.get(&id).cloned()
    }

    fn push_event(&self, kind: EventKind, buffer: Option<RxBuffer>, token: u64) {
        let ev = Event::new(kind, buffer, token, self.ops_weak());
        let mut q = self.events.lock().unwrap();
        let was_empty = q.ready.is_empty();
        q.ready.push_back(ev);
        if was_empty {
            self.wake.signal();
        }
    }

    fn alloc_token(&self) -> u64 {
        let mut core = self.core.lock().unwrap();
        let t = core.next_token;
        core.next_token += 1;
        t
    }

    fn default_send_timeout(&self) -> u32 {
        self.core.lock().unwrap().cfg.send_timeout_us
    }

    fn send_raw(&self, buf: &[u8], to: SocketAddr) {
        match self.socket.send_to(buf, to) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                trace!("socket backpressure, dropping control packet");
            }
            Err(e) => {
                trace!(error = %e, "send_to failed");
            }
        }
    }

    /// Direct-send a header-only control packet.
    fn send_control(&self, hdr: Header, to: SocketAddr) {
        self.send_raw(&hdr.encode(), to);
    }

    // -----------------------------------------------------------------------
    // Progress engine
    // -----------------------------------------------------------------------

    fn progress(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.recv_loop();
        let now = Instant::now();
        self.progress_device(now);
        self.flush_acks(now);
        self.tick_keepalives(now);
    }

    fn recv_loop(&self) {
        // One thread drains the socket at a time; others skip.
        let Ok(mut scratch) = self.scratch.try_lock() else {
            return;
        };
        loop {
            match self.socket.recv_from(&mut scratch) {
                Ok((n, from)) => {
                    let data = scratch[..n].to_vec();
                    self.handle_packet(&data, from);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // The socket itself broke; raise the device failure
                    // once and stop reading.
                    warn!(error = %e, "receive socket failed");
                    if !self.device_failed.swap(true, Ordering::AcqRel) {
                        self.push_event(
                            EventKind::EndpointDeviceFailed,
                            None,
                            self.alloc_token(),
                        );
                    }
                    break;
                }
            }
        }
    }

    fn handle_packet(&self, data: &[u8], from: SocketAddr) {
        let Some(hdr) = Header::decode(data) else {
            trace!(len = data.len(), "dropping undecodable datagram");
            return;
        };
        let body = &data[HEADER_SIZE..];
        if body.len() < hdr.len as usize {
            return;
        }
        let payload = &body[..hdr.len as usize];
        trace!(kind = ?hdr.kind, seq = hdr.seq, src = hdr.src_id, dst = hdr.dst_id, "rx");
        match hdr.kind {
            PktType::Request => self.on_request(hdr, payload, from),
            PktType::Reply => self.on_reply(hdr, payload, from),
            PktType::HandshakeAck => self.on_handshake_ack(hdr),
            PktType::Reject => self.on_reject(hdr),
            PktType::Msg => self.on_msg(hdr, payload),
            PktType::Ack => self.on_ack(hdr),
            PktType::Nack => self.on_nack(hdr),
            PktType::RmaWrite => self.on_rma_write(hdr, payload),
            PktType::RmaReadRequest => self.on_rma_read_request(hdr, payload),
            PktType::RmaReadReply => self.on_rma_read_reply(hdr, payload),
            PktType::Keepalive => self.on_keepalive(hdr),
        }
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    fn on_request(&self, hdr: Header, payload: &[u8], from: SocketAddr) {
        let Some(attribute) = ConnAttribute::from_wire(hdr.attr) else {
            return;
        };
        if payload.len() > CONN_REQ_LEN {
            return;
        }

        // Retransmitted request for a connection we already know.
        let existing = {
            let core = self.core.lock().unwrap();
            core.peer_index
                .get(&(from, hdr.src_id))
                .and_then(|id| core.conns.get(id))
                .cloned()
        };
        if let Some(conn) = existing {
            let st = conn.state.lock().unwrap();
            if st.phase == ConnPhase::PassiveReplied || st.phase == ConnPhase::Ready {
                let reply = Header {
                    kind: PktType::Reply,
                    attr: conn.attribute.to_wire(),
                    src_id: conn.id,
                    dst_id: st.peer_id,
                    seq: st.local_initial_seq,
                    ack: st.recv.cumulative(),
                    sack: st.recv.sack(),
                    len: 1,
                };
                drop(st);
                let mut buf = reply.encode().to_vec();
                buf.push(0);
                self.send_raw(&buf, from);
            }
            return;
        }

        let (conn_id, buffer, token) = {
            let mut core = self.core.lock().unwrap();
            let Some(mut buffer) = core.rx.take() else {
                // The initiator retransmits; wait for a free buffer.
                return;
            };
            buffer.fill(payload);
            let conn_id = core.conn_ids.alloc();
            let conn = SockConn::new(
                conn_id,
                attribute,
                from,
                ConnPhase::Passive,
                hdr.src_id,
                0,
                hdr.seq,
                self.mss,
                0,
                Instant::now(),
            );
            core.conns.insert(conn_id, conn);
            core.peer_index.insert((from, hdr.src_id), conn_id);
            let token = core.next_token;
            core.next_token += 1;
            core.conn_requests.insert(
                token,
                ConnReq {
                    conn_id,
                    handled: false,
                },
            );
            (conn_id, buffer, token)
        };
        debug!(conn = conn_id, peer = %from, ?attribute, "connection request");
        self.push_event(EventKind::ConnectRequest { attribute }, Some(buffer), token);
    }

    fn on_reply(&self, hdr: Header, payload: &[u8], from: SocketAddr) {
        let Some(conn) = self.lookup_conn(hdr.dst_id) else {
            return;
        };
        if payload.is_empty() {
            return;
        }
        let mut st = conn.state.lock().unwrap();
        match st.phase {
            ConnPhase::Active => {
                st.peer_id = hdr.src_id;
                st.recv = RecvWindow::new(hdr.seq);
                st.phase = ConnPhase::Ready;
                let ack = Header {
                    kind: PktType::HandshakeAck,
                    attr: 0,
                    src_id: conn.id,
                    dst_id: st.peer_id,
                    seq: 0,
                    ack: st.recv.cumulative(),
                    sack: st.recv.sack(),
                    len: 0,
                };
                let context = st.context;
                drop(st);
                if let Some(tx) = self.remove_device_tx(conn.id, TxKind::ConnRequest) {
                    self.recycle_tx(tx);
                }
                self.send_control(ack, from);
                debug!(conn = conn.id, peer = %from, "connection established");
                self.push_event(
                    EventKind::Connect {
                        status: Status::Success,
                        context,
                        connection: Some(self.conn_handle(conn.id)),
                    },
                    None,
                    self.alloc_token(),
                );
            }
            ConnPhase::Ready => {
                // Duplicate reply: our handshake ACK was lost.
                let ack = Header {
                    kind: PktType::HandshakeAck,
                    attr: 0,
                    src_id: conn.id,
                    dst_id: st.peer_id,
                    seq: 0,
                    ack: st.recv.cumulative(),
                    sack: st.recv.sack(),
                    len: 0,
                };
                drop(st);
                self.send_control(ack, from);
            }
            _ => {}
        }
    }

    fn on_handshake_ack(&self, hdr: Header) {
        let Some(conn) = self.lookup_conn(hdr.dst_id) else {
            return;
        };
        let mut st = conn.state.lock().unwrap();
        if st.phase != ConnPhase::PassiveReplied {
            return;
        }
        st.phase = ConnPhase::Ready;
        let context = st.context;
        drop(st);
        if let Some(tx) = self.remove_device_tx(conn.id, TxKind::ConnReply) {
            self.recycle_tx(tx);
        }
        debug!(conn = conn.id, "accept completed");
        self.push_event(
            EventKind::Accept {
                status: Status::Success,
                context,
                connection: Some(self.conn_handle(conn.id)),
            },
            None,
            self.alloc_token(),
        );
    }

    fn on_reject(&self, hdr: Header) {
        let Some(conn) = self.lookup_conn(hdr.dst_id) else {
            return;
        };
        let context = {
            let st = conn.state.lock().unwrap();
            if st.phase != ConnPhase::Active {
                return;
            }
            st.context
        };
        if let Some(tx) = self.remove_device_tx(conn.id, TxKind::ConnRequest) {
            self.recycle_tx(tx);
        }
        self.free_conn(&conn);
        debug!(conn = conn.id, "connect refused by peer");
        self.push_event(
            EventKind::Connect {
                status: Status::ConnRefused,
                context,
                connection: None,
            },
            None,
            self.alloc_token(),
        );
    }

    /// Promote a replied passive connection when the handshake ACK was
    /// lost but traffic already flows.
    fn implicit_accept(&self, conn: &Arc<SockConn>) {
        let mut st = conn.state.lock().unwrap();
        if st.phase != ConnPhase::PassiveReplied {
            return;
        }
        st.phase = ConnPhase::Ready;
        let context = st.context;
        drop(st);
        if let Some(tx) = self.remove_device_tx(conn.id, TxKind::ConnReply) {
            self.recycle_tx(tx);
        }
        self.push_event(
            EventKind::Accept {
                status: Status::Success,
                context,
                connection: Some(self.conn_handle(conn.id)),
            },
            None,
            self.alloc_token(),
        );
    }

    /// Pull one TX of the given kind for `conn_id` off the device lists.
    fn remove_device_tx(&self, conn_id: u32, kind: TxKind) -> Option<Box<Tx>> {
        let mut q = self.device.queue.lock().unwrap();
        let matcher = |tx: &Box<Tx>| {
            tx.conn_id == conn_id
                && tx.kind == kind
                && tx.ep.upgrade().is_some_and(|e| e.id == self.id)
        };
        if let Some(pos) = q.pending.iter().position(matcher) {
            return Some(q.pending.remove(pos));
        }
        if let Some(pos) = q.queued.iter().position(matcher) {
            return q.queued.remove(pos);
        }
        None
    }

    // -----------------------------------------------------------------------
    // Data path: receive
    // -----------------------------------------------------------------------

    fn on_msg(&self, hdr: Header, payload: &[u8]) {
        let conn = if hdr.dst_id != 0 {
            self.lookup_conn(hdr.dst_id)
        } else {
            // Multicast data carries no destination ID.
            let core = self.core.lock().unwrap();
            core.mc_rx
                .first()
                .and_then(|id| core.conns.get(id))
                .cloned()
        };
        let Some(conn) = conn else { return };

        self.implicit_accept(&conn);

        if !conn.attribute.is_reliable() {
            {
                let st = conn.state.lock().unwrap();
                if st.phase != ConnPhase::Ready {
                    return;
                }
            }
            let buffer = self.core.lock().unwrap().rx.take();
            let Some(mut buffer) = buffer else { return };
            buffer.fill(payload);
            self.push_event(
                EventKind::Recv {
                    connection: self.conn_handle(conn.id),
                },
                Some(buffer),
                self.alloc_token(),
            );
            return;
        }

        self.process_acks(&conn, hdr.ack, hdr.sack);

        let decision = {
            let st = conn.state.lock().unwrap();
            if st.failed.is_some() || st.phase != ConnPhase::Ready {
                return;
            }
            st.recv.classify(hdr.seq)
        };

        match decision {
            Arrival::Duplicate => {
                conn.state.lock().unwrap().ack_due = true;
            }
            Arrival::TooFar => {}
            Arrival::InOrder { .. } | Arrival::OutOfOrder => {
                let buffer = self.core.lock().unwrap().rx.take();
                let Some(mut buffer) = buffer else {
                    self.send_rnr_nack(&conn, hdr.seq);
                    return;
                };
                buffer.fill(payload);
                self.deliver_segment(&conn, hdr.seq, Some(buffer));
            }
        }
    }

    fn on_keepalive(&self, hdr: Header) {
        let Some(conn) = self.lookup_conn(hdr.dst_id) else {
            return;
        };
        if !conn.attribute.is_reliable() {
            return;
        }
        self.implicit_accept(&conn);
        self.process_acks(&conn, hdr.ack, hdr.sack);
        {
            let st = conn.state.lock().unwrap();
            if st.failed.is_some() || st.phase != ConnPhase::Ready {
                return;
            }
        }
        // A keepalive occupies a sequence slot but carries nothing.
        self.deliver_segment(&conn, hdr.seq, None);
    }

    /// Record a reliable segment and deliver whatever became contiguous.
    ///
    /// `payload` is `Some` for messages and `None` for segments without an
    /// application payload (keepalives, already-applied RMA fragments).
    fn deliver_segment(&self, conn: &Arc<SockConn>, seq: u32, payload: Option<RxBuffer>) {
        let ordered = conn.attribute.is_ordered();
        let mut events: Vec<RxBuffer> = Vec::new();
        let mut returned: Vec<RxBuffer> = Vec::new();
        let mut overflow = false;
        {
            let mut st = conn.state.lock().unwrap();
            match st.recv.record(seq) {
                Arrival::InOrder { run } => {
                    if let Some(buf) = payload {
                        events.push(buf);
                    }
                    if ordered {
                        for k in 1..=run {
                            let s = seq.wrapping_add(k);
                            if let Some(slot) = st.hold.remove(&s) {
                                if let Some(buf) = slot {
                                    events.push(buf);
                                }
                            }
                        }
                    }
                    st.ack_due = true;
                }
                Arrival::OutOfOrder => {
                    if ordered {
                        if st.hold.len() >= HOLD_LIMIT {
                            overflow = true;
                            if let Some(buf) = payload {
                                returned.push(buf);
                            }
                        } else {
                            st.hold.insert(seq, payload);
                        }
                    } else if let Some(buf) = payload {
                        // RU delivers immediately; the window only
                        // suppresses duplicates.
                        events.push(buf);
                    }
                    st.ack_due = true;
                }
                Arrival::Duplicate => {
                    st.ack_due = true;
                    if let Some(buf) = payload {
                        returned.push(buf);
                    }
                }
                Arrival::TooFar => {
                    if let Some(buf) = payload {
                        returned.push(buf);
                    }
                }
            }
        }
        if overflow {
            warn!(conn = conn.id, "reorder hold queue overflow");
            self.fail_conn(conn, Status::Generic);
        }
        if !returned.is_empty() {
            let mut core = self.core.lock().unwrap();
            for buf in returned {
                let _ = core.rx.put(buf);
            }
        }
        for buffer in events {
            self.push_event(
                EventKind::Recv {
                    connection: self.conn_handle(conn.id),
                },
                Some(buffer),
                self.alloc_token(),
            );
        }
    }

    fn send_rnr_nack(&self, conn: &Arc<SockConn>, seq: u32) {
        let st = conn.state.lock().unwrap();
        let hdr = Header {
            kind: PktType::Nack,
            attr: NACK_RNR,
            src_id: conn.id,
            dst_id: st.peer_id,
            seq,
            ack: st.recv.cumulative(),
            sack: st.recv.sack(),
            len: 0,
        };
        drop(st);
        trace!(conn = conn.id, seq, "receiver not ready");
        self.send_control(hdr, conn.peer);
    }

    fn send_rma_handle_nack(&self, conn: &Arc<SockConn>, seq: u32) {
        let st = conn.state.lock().unwrap();
        let hdr = Header {
            kind: PktType::Nack,
            attr: NACK_RMA_HANDLE,
            src_id: conn.id,
            dst_id: st.peer_id,
            seq,
            ack: st.recv.cumulative(),
            sack: st.recv.sack(),
            len: 0,
        };
        drop(st);
        self.send_control(hdr, conn.peer);
    }

    // -----------------------------------------------------------------------
    // Acknowledgement processing
    // -----------------------------------------------------------------------

    fn on_ack(&self, hdr: Header) {
        let Some(conn) = self.lookup_conn(hdr.dst_id) else {
            return;
        };
        self.implicit_accept(&conn);
        self.process_acks(&conn, hdr.ack, hdr.sack);
    }

    fn on_nack(&self, hdr: Header) {
        let Some(conn) = self.lookup_conn(hdr.dst_id) else {
            return;
        };
        match hdr.attr {
            NACK_RNR => {
                trace!(conn = conn.id, seq = hdr.seq, "peer reported RNR");
                conn.state.lock().unwrap().rnr_peer = true;
            }
            NACK_RMA_HANDLE => {
                let hit = {
                    let mut q = self.device.queue.lock().unwrap();
                    let pos = q.pending.iter().position(|tx| {
                        tx.conn_id == conn.id
                            && tx.seq == hdr.seq
                            && matches!(tx.kind, TxKind::RmaWrite { .. } | TxKind::RmaRead { .. })
                            && tx.ep.upgrade().is_some_and(|e| e.id == self.id)
                    });
                    pos.map(|p| q.pending.remove(p))
                };
                if let Some(tx) = hit {
                    let op = match tx.kind {
                        TxKind::RmaWrite { op, .. } | TxKind::RmaRead { op, .. } => op,
                        _ => unreachable!(),
                    };
                    self.recycle_tx(tx);
                    self.fail_rma_op(&conn, op, Status::RmaHandle);
                }
            }
            _ => {}
        }
    }

    /// Complete in-flight segments covered by a cumulative + selective ACK.
    fn process_acks(&self, conn: &Arc<SockConn>, ack: u32, sack: u32) {
        if !conn.attribute.is_reliable() {
            return;
        }
        {
            let st = conn.state.lock().unwrap();
            if st.phase != ConnPhase::Ready {
                return;
            }
        }
        // RU may complete on selective ACKs; RO must preserve issue order
        // and completes on the cumulative point only.
        let selective = !conn.attribute.is_ordered();

        let mut completed: Vec<Box<Tx>> = Vec::new();
        {
            let mut q = self.device.queue.lock().unwrap();
            let pending = std::mem::take(&mut q.pending);
            for tx in pending {
                let ours = tx.conn_id == conn.id
                    && tx.ep.upgrade().is_some_and(|e| e.id == self.id)
                    && matches!(
                        tx.kind,
                        TxKind::Msg | TxKind::Keepalive | TxKind::RmaWrite { .. }
                    );
                if ours && tx.acked_by(ack, sack, selective) {
                    completed.push(tx);
                } else {
                    q.pending.push(tx);
                }
            }
        }

        let mut rma_done: Vec<(u64, u32)> = Vec::new();
        {
            let mut st = conn.state.lock().unwrap();
            if seq_after(ack.wrapping_add(1), st.send_base) {
                st.send_base = ack.wrapping_add(1);
                st.rnr_peer = false;
            }
            for tx in &completed {
                match tx.kind {
                    TxKind::Keepalive => st.ka_pending = false,
                    TxKind::RmaWrite { op, len } => rma_done.push((op, len)),
                    _ => {}
                }
            }
        }

        for tx in completed {
            match tx.kind {
                TxKind::Msg => self.complete_msg_tx(tx, Status::Success),
                _ => self.recycle_tx(tx),
            }
        }
        for (op, len) in rma_done {
            self.note_rma_progress(conn, op, len);
        }
        self.rma_advance(conn);
    }

    /// Finish a message TX: blocking slot or SEND event, then recycle.
    fn complete_msg_tx(&self, tx: Box<Tx>, status: Status) {
        let Some(ep) = tx.ep.upgrade() else { return };
        if let Some(slot) = &tx.blocking {
            slot.complete(status);
        } else if !tx.silent {
            ep.push_event(
                EventKind::Send {
                    status,
                    context: tx.context,
                    connection: ep.conn_handle(tx.conn_id),
                },
                None,
                ep.alloc_token(),
            );
        }
        ep.core.lock().unwrap().tx.put(tx.buf);
    }

    /// Recycle a TX without producing a completion.
    fn recycle_tx(&self, tx: Box<Tx>) {
        if let Some(ep) = tx.ep.upgrade() {
            ep.core.lock().unwrap().tx.put(tx.buf);
        }
    }

    // -----------------------------------------------------------------------
    // Device queue progression
    // -----------------------------------------------------------------------

    fn progress_device(&self, now: Instant) {
        // Retransmit or expire the in-flight list.
        let mut expired: Vec<Box<Tx>> = Vec::new();
        {
            let mut q = self.device.queue.lock().unwrap();
            let pending = std::mem::take(&mut q.pending);
            for mut tx in pending {
                let Some(ep) = tx.ep.upgrade() else { continue };
                if now >= tx.deadline {
                    expired.push(tx);
                    continue;
                }
                let (base, ceiling) = {
                    let core = ep.core.lock().unwrap();
                    (core.cfg.retrans_base_us, core.cfg.retrans_ceiling_us)
                };
                let due = match tx.last_send {
                    None => true,
                    Some(last) => {
                        now >= last + Duration::from_micros(backoff_us(base, ceiling, tx.resends))
                    }
                };
                if due {
                    ep.stamp_acks(&mut tx);
                    ep.send_raw(&tx.buf, tx.peer);
                    if tx.last_send.is_some() {
                        tx.resends += 1;
                        trace!(conn = tx.conn_id, seq = tx.seq, resends = tx.resends, "resend");
                    }
                    tx.last_send = Some(now);
                }
                q.pending.push(tx);
            }
        }
        for tx in expired {
            self.expire_tx(tx);
        }

        // Drain the ready-to-send list.
        let mut unreliable_done: Vec<Box<Tx>> = Vec::new();
        {
            let mut q = self.device.queue.lock().unwrap();
            let queued = std::mem::take(&mut q.queued);
            let mut blocked = false;
            for mut tx in queued {
                if blocked {
                    q.queued.push_back(tx);
                    continue;
                }
                let Some(ep) = tx.ep.upgrade() else { continue };
                if tx.reliable && !ep.within_window(&tx) {
                    q.queued.push_back(tx);
                    continue;
                }
                ep.stamp_acks(&mut tx);
                match ep.socket.send_to(&tx.buf, tx.peer) {
                    Ok(_) => {
                        tx.last_send = Some(now);
                        if tx.reliable {
                            q.pending.push(tx);
                        } else {
                            unreliable_done.push(tx);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        q.queued.push_back(tx);
                        blocked = true;
                    }
                    Err(e) => {
                        trace!(error = %e, "send_to failed, will retry");
                        q.queued.push_back(tx);
                        blocked = true;
                    }
                }
            }
        }
        for tx in unreliable_done {
            self.complete_msg_tx(tx, Status::Success);
        }
    }

    /// Whether a reliable segment fits the peer's selective-ACK window.
    fn within_window(&self, tx: &Tx) -> bool {
        match tx.kind {
            TxKind::ConnRequest | TxKind::ConnReply => return true,
            // Read requests ride outside the sequence window.
            TxKind::RmaRead { .. } => return true,
            _ => {}
        }
        let Some(conn) = self.lookup_conn(tx.conn_id) else {
            return true;
        };
        let st = conn.state.lock().unwrap();
        tx.seq.wrapping_sub(st.send_base) < SEND_WINDOW
    }

    /// Stamp the current receive-window state into an outgoing packet.
    fn stamp_acks(&self, tx: &mut Tx) {
        if matches!(tx.kind, TxKind::ConnRequest) {
            return;
        }
        let Some(conn) = self.lookup_conn(tx.conn_id) else {
            return;
        };
        let mut st = conn.state.lock().unwrap();
        Header::patch_ack(&mut tx.buf, st.recv.cumulative(), st.recv.sack());
        if tx.reliable {
            // The piggyback counts as an acknowledgement.
            st.ack_due = false;
            st.last_ack = Instant::now();
        }
    }

    fn expire_tx(&self, tx: Box<Tx>) {
        let Some(ep) = tx.ep.upgrade() else { return };
        let conn = ep.lookup_conn(tx.conn_id);
        match tx.kind {
            TxKind::ConnRequest => {
                let context = conn
                    .as_ref()
                    .map(|c| c.state.lock().unwrap().context)
                    .unwrap_or(tx.context);
                if let Some(conn) = conn {
                    ep.free_conn(&conn);
                }
                ep.recycle_tx(tx);
                debug!("connect timed out");
                ep.push_event(
                    EventKind::Connect {
                        status: Status::TimedOut,
                        context,
                        connection: None,
                    },
                    None,
                    ep.alloc_token(),
                );
            }
            TxKind::ConnReply => {
                let context = conn
                    .as_ref()
                    .map(|c| c.state.lock().unwrap().context)
                    .unwrap_or(tx.context);
                if let Some(conn) = conn {
                    ep.free_conn(&conn);
                }
                ep.recycle_tx(tx);
                ep.push_event(
                    EventKind::Accept {
                        status: Status::TimedOut,
                        context,
                        connection: None,
                    },
                    None,
                    ep.alloc_token(),
                );
            }
            TxKind::Keepalive => {
                if let Some(ref conn) = conn {
                    let mut st = conn.state.lock().unwrap();
                    st.ka_pending = false;
                    st.keepalive_us = 0;
                    drop(st);
                    debug!(conn = conn.id, "keepalive timed out");
                    ep.push_event(
                        EventKind::KeepaliveTimedout {
                            connection: ep.conn_handle(conn.id),
                        },
                        None,
                        ep.alloc_token(),
                    );
                }
                ep.recycle_tx(tx);
            }
            TxKind::Msg => {
                let status = conn
                    .as_ref()
                    .map(|c| {
                        if c.state.lock().unwrap().rnr_peer {
                            Status::Rnr
                        } else {
                            Status::TimedOut
                        }
                    })
                    .unwrap_or(Status::TimedOut);
                match conn {
                    Some(ref c) if c.attribute.is_ordered() => {
                        debug!(conn = c.id, seq = tx.seq, ?status, "reliable send expired");
                        ep.complete_msg_tx(tx, status);
                        ep.fail_conn(c, status);
                    }
                    _ => ep.complete_msg_tx(tx, status),
                }
            }
            TxKind::RmaWrite { op, .. } | TxKind::RmaRead { op, .. } => {
                let status = conn
                    .as_ref()
                    .map(|c| {
                        if c.state.lock().unwrap().rnr_peer {
                            Status::Rnr
                        } else {
                            Status::TimedOut
                        }
                    })
                    .unwrap_or(Status::TimedOut);
                ep.recycle_tx(tx);
                if let Some(ref c) = conn {
                    ep.fail_rma_op(c, op, status);
                    if c.attribute.is_ordered() {
                        ep.fail_conn(c, status);
                    }
                }
            }
        }
    }

    /// Fail a reliable connection: complete every in-flight operation with
    /// `status` and refuse further sends until disconnect.
    fn fail_conn(&self, conn: &Arc<SockConn>, status: Status) {
        let ops: Vec<RmaOp> = {
            let mut st = conn.state.lock().unwrap();
            if st.failed.is_some() {
                return;
            }
            st.failed = Some(status);
            st.ka_pending = false;
            st.keepalive_us = 0;
            st.rma_ops.drain(..).collect()
        };
        debug!(conn = conn.id, ?status, "connection failed");

        let mut txs: Vec<Box<Tx>> = Vec::new();
        {
            let mut q = self.device.queue.lock().unwrap();
            let matcher = |tx: &Box<Tx>| {
                tx.conn_id == conn.id && tx.ep.upgrade().is_some_and(|e| e.id == self.id)
            };
            let pending = std::mem::take(&mut q.pending);
            for tx in pending {
                if matcher(&tx) {
                    txs.push(tx);
                } else {
                    q.pending.push(tx);
                }
            }
            let queued = std::mem::take(&mut q.queued);
            for tx in queued {
                if matcher(&tx) {
                    txs.push(tx);
                } else {
                    q.queued.push_back(tx);
                }
            }
        }
        for tx in txs {
            match tx.kind {
                TxKind::Msg => self.complete_msg_tx(tx, status),
                _ => self.recycle_tx(tx),
            }
        }
        for op in ops {
            self.complete_rma_op(conn, op, status);
        }

        // Parked out-of-order buffers go back to the pool.
        let held: Vec<RxBuffer> = {
            let mut st = conn.state.lock().unwrap();
            st.hold.drain().filter_map(|(_, b)| b).collect()
        };
        if !held.is_empty() {
            let mut core = self.core.lock().unwrap();
            for buf in held {
                let _ = core.rx.put(buf);
            }
        }
    }

    /// Drop a connection from the endpoint tables.
    fn free_conn(&self, conn: &Arc<SockConn>) {
        let mut core = self.core.lock().unwrap();
        if core.conns.remove(&conn.id).is_some() {
            core.conn_ids.release(conn.id);
        }
        core.mc_rx.retain(|&id| id != conn.id);
        let (peer_id, held) = {
            let mut st = conn.state.lock().unwrap();
            let held: Vec<RxBuffer> = st.hold.drain().filter_map(|(_, b)| b).collect();
            (st.peer_id, held)
        };
        core.peer_index.remove(&(conn.peer, peer_id));
        for buf in held {
            let _ = core.rx.put(buf);
        }
    }

    // -----------------------------------------------------------------------
    // Delayed ACKs and keepalives
    // -----------------------------------------------------------------------

    fn snapshot_conns(&self) -> Vec<Arc<SockConn>> {
        self.core.lock().unwrap().conns.values().cloned().collect()
    }

    fn flush_acks(&self, now: Instant) {
        let delay = Duration::from_micros(self.core.lock().unwrap().cfg.ack_delay_us as u64);
        for conn in self.snapshot_conns() {
            if !conn.attribute.is_reliable() {
                continue;
            }
            let mut st = conn.state.lock().unwrap();
            if st.phase != ConnPhase::Ready || !st.ack_due {
                continue;
            }
            if now.duration_since(st.last_ack) < delay {
                continue;
            }
            let hdr = Header {
                kind: PktType::Ack,
                attr: 0,
                src_id: conn.id,
                dst_id: st.peer_id,
                seq: 0,
                ack: st.recv.cumulative(),
                sack: st.recv.sack(),
                len: 0,
            };
            st.ack_due = false;
            st.last_ack = now;
            drop(st);
            self.send_control(hdr, conn.peer);
        }
    }

    fn tick_keepalives(&self, now: Instant) {
        let mut due: Vec<Arc<SockConn>> = Vec::new();
        for conn in self.snapshot_conns() {
            if !conn.attribute.is_reliable() {
                continue;
            }
            let st = conn.state.lock().unwrap();
            if st.phase == ConnPhase::Ready
                && st.failed.is_none()
                && st.keepalive_us > 0
                && !st.ka_pending
                && now.duration_since(st.ka_last) >= Duration::from_micros(st.keepalive_us as u64)
            {
                due.push(conn.clone());
            }
        }
        for conn in due {
            let Some(buf) = self.core.lock().unwrap().tx.take() else {
                continue;
            };
            let mut recycled = None;
            let tx = {
                let mut st = conn.state.lock().unwrap();
                if st.ka_pending || st.keepalive_us == 0 {
                    recycled = Some(buf);
                    None
                } else {
                    let seq = st.next_seq;
                    st.next_seq = st.next_seq.wrapping_add(1);
                    st.ka_pending = true;
                    st.ka_last = now;
                    let hdr = Header {
                        kind: PktType::Keepalive,
                        attr: 0,
                        src_id: conn.id,
                        dst_id: st.peer_id,
                        seq,
                        ack: st.recv.cumulative(),
                        sack: st.recv.sack(),
                        len: 0,
                    };
                    let mut buf = buf;
                    buf.extend_from_slice(&hdr.encode());
                    Some(Box::new(Tx {
                        kind: TxKind::Keepalive,
                        ep: self.weak(),
                        conn_id: conn.id,
                        seq,
                        reliable: true,
                        deadline: now + Duration::from_micros(st.keepalive_us as u64),
                        last_send: None,
                        resends: 0,
                        silent: true,
                        context: 0,
                        blocking: None,
                        peer: conn.peer,
                        buf,
                    }))
                }
            };
            if let Some(buf) = recycled {
                self.core.lock().unwrap().tx.put(buf);
            }
            if let Some(tx) = tx {
                trace!(conn = conn.id, seq = tx.seq, "keepalive probe");
                self.device.queue.lock().unwrap().queued.push_back(tx);
            }
        }
    }

    // -----------------------------------------------------------------------
    // RMA engine
    // -----------------------------------------------------------------------

    fn on_rma_write(&self, hdr: Header, payload: &[u8]) {
        let Some(conn) = self.lookup_conn(hdr.dst_id) else {
            return;
        };
        if !conn.attribute.is_reliable() {
            return;
        }
        self.implicit_accept(&conn);
        self.process_acks(&conn, hdr.ack, hdr.sack);

        let Ok(sub) = RmaWriteHdr::decode(payload) else {
            return;
        };
        let data = &payload[RMA_WRITE_HDR_SIZE..];

        let fresh = {
            let st = conn.state.lock().unwrap();
            if st.failed.is_some() || st.phase != ConnPhase::Ready {
                return;
            }
            !matches!(
                st.recv.classify(hdr.seq),
                Arrival::Duplicate | Arrival::TooFar
            )
        };

        if fresh {
            let ok = {
                let registry = self.registry.lock().unwrap();
                match registry.lookup(sub.token) {
                    Some(reg) if reg.prot().contains(RmaProt::WRITE) => {
                        reg.copy_in(sub.offset, data).is_ok()
                    }
                    _ => false,
                }
            };
            if !ok {
                trace!(token = sub.token, "RMA write rejected");
                self.send_rma_handle_nack(&conn, hdr.seq);
                return;
            }
            // The fragment is applied; it occupies its sequence slot with
            // no deliverable payload.
            self.deliver_segment(&conn, hdr.seq, None);
        } else {
            conn.state.lock().unwrap().ack_due = true;
        }
    }

    fn on_rma_read_request(&self, hdr: Header, payload: &[u8]) {
        let Some(conn) = self.lookup_conn(hdr.dst_id) else {
            return;
        };
        if !conn.attribute.is_reliable() {
            return;
        }
        self.implicit_accept(&conn);
        self.process_acks(&conn, hdr.ack, hdr.sack);

        let Ok(sub) = RmaReadReqHdr::decode(payload) else {
            return;
        };
        let max_window = (self.mss as usize).saturating_sub(RMA_READ_REPLY_HDR_SIZE);
        if sub.length as usize > max_window {
            self.send_rma_handle_nack(&conn, hdr.seq);
            return;
        }

        let mut out = vec![0u8; HEADER_SIZE + RMA_READ_REPLY_HDR_SIZE + sub.length as usize];
        let ok = {
            let registry = self.registry.lock().unwrap();
            match registry.lookup(sub.token) {
                Some(reg) if reg.prot().contains(RmaProt::READ) => reg
                    .copy_out(
                        sub.offset,
                        &mut out[HEADER_SIZE + RMA_READ_REPLY_HDR_SIZE..],
                    )
                    .is_ok(),
                _ => false,
            }
        };
        if !ok {
            trace!(token = sub.token, "RMA read rejected");
            self.send_rma_handle_nack(&conn, hdr.seq);
            return;
        }

        let st = conn.state.lock().unwrap();
        let reply_hdr = Header {
            kind: PktType::RmaReadReply,
            attr: 0,
            src_id: conn.id,
            dst_id: st.peer_id,
            seq: hdr.seq,
            ack: st.recv.cumulative(),
            sack: st.recv.sack(),
            len: (RMA_READ_REPLY_HDR_SIZE + sub.length as usize) as u16,
        };
        drop(st);
        out[..HEADER_SIZE].copy_from_slice(&reply_hdr.encode());
        out[HEADER_SIZE..HEADER_SIZE + RMA_READ_REPLY_HDR_SIZE].copy_from_slice(
            &RmaReadReplyHdr {
                req_token: sub.req_token,
                req_offset: sub.req_offset,
            }
            .encode(),
        );
        self.send_raw(&out, conn.peer);
    }

    fn on_rma_read_reply(&self, hdr: Header, payload: &[u8]) {
        let Some(conn) = self.lookup_conn(hdr.dst_id) else {
            return;
        };
        self.process_acks(&conn, hdr.ack, hdr.sack);

        // The reply completes the matching read-request descriptor; a
        // missing descriptor means this is a duplicate.
        let tx = {
            let mut q = self.device.queue.lock().unwrap();
            let matcher = |tx: &Box<Tx>| {
                tx.conn_id == conn.id
                    && tx.seq == hdr.seq
                    && matches!(tx.kind, TxKind::RmaRead { .. })
                    && tx.ep.upgrade().is_some_and(|e| e.id == self.id)
            };
            if let Some(pos) = q.pending.iter().position(matcher) {
                Some(q.pending.remove(pos))
            } else {
                q.queued
                    .iter()
                    .position(matcher)
                    .and_then(|pos| q.queued.remove(pos))
            }
        };
        let Some(tx) = tx else { return };
        let (op, frag_len) = match tx.kind {
            TxKind::RmaRead { op, len } => (op, len),
            _ => unreachable!(),
        };

        let Ok(sub) = RmaReadReplyHdr::decode(payload) else {
            self.recycle_tx(tx);
            return;
        };
        let data = &payload[RMA_READ_REPLY_HDR_SIZE..];
        if data.len() != frag_len as usize {
            self.recycle_tx(tx);
            return;
        }
        {
            let registry = self.registry.lock().unwrap();
            if let Some(reg) = registry.lookup(sub.req_token) {
                // Local destination; registration protection applies to
                // remote access only.
                let _ = reg.copy_in(sub.req_offset, data);
            }
        }
        self.recycle_tx(tx);
        self.note_rma_progress(&conn, op, frag_len);
        self.rma_advance(&conn);
    }

    /// Account completed bytes to an operation.
    fn note_rma_progress(&self, conn: &Arc<SockConn>, op_id: u64, len: u32) {
        let mut st = conn.state.lock().unwrap();
        if let Some(op) = st.rma_ops.iter_mut().find(|o| o.id == op_id) {
            op.done += len as u64;
            op.inflight = op.inflight.saturating_sub(1);
        }
    }

    /// Issue fragments and completion messages for eligible RMA operations.
    fn rma_advance(&self, conn: &Arc<SockConn>) {
        let default_timeout_us = self.default_send_timeout();
        loop {
            {
                let st = conn.state.lock().unwrap();
                if st.failed.is_some()
                    || st.phase != ConnPhase::Ready
                    || st.rma_ops.is_empty()
                {
                    return;
                }
            }
            // Secure buffers first; window sequence numbers are only
            // assigned once a buffer is in hand, keeping the space
            // gap-free.
            let mut bufs: Vec<Vec<u8>> = {
                let mut core = self.core.lock().unwrap();
                (0..4).filter_map(|_| core.tx.take()).collect()
            };
            if bufs.is_empty() {
                return;
            }

            let mut txs: Vec<Box<Tx>> = Vec::new();
            let mut finished: Vec<(RmaOp, Status)> = Vec::new();
            {
                let mut st = conn.state.lock().unwrap();
                let now = Instant::now();
                let timeout = Duration::from_micros(
                    st.send_timeout_us.unwrap_or(default_timeout_us) as u64,
                );

                while let Some(buf) = bufs.pop() {
                    let Some(idx) = eligible_rma_op(&st.rma_ops) else {
                        bufs.push(buf);
                        break;
                    };
                    let (op_id, write, data_done, local_token, local_offset, remote_token,
                        remote_offset, op_len, frag, next_off) = {
                        let op = &st.rma_ops[idx];
                        (
                            op.id,
                            op.write,
                            op.data_done(),
                            op.local_token,
                            op.local_offset,
                            op.remote_token,
                            op.remote_offset,
                            op.len,
                            op.frag,
                            op.next_off,
                        )
                    };

                    if data_done {
                        // Data fully acknowledged: emit the completion
                        // message if any, then retire the operation.
                        let msg = st.rma_ops[idx].completion.take();
                        if let Some(msg) = msg {
                            let seq = st.next_seq;
                            st.next_seq = st.next_seq.wrapping_add(1);
                            let hdr = Header {
                                kind: PktType::Msg,
                                attr: 0,
                                src_id: conn.id,
                                dst_id: st.peer_id,
                                seq,
                                ack: st.recv.cumulative(),
                                sack: st.recv.sack(),
                                len: msg.len() as u16,
                            };
                            let mut buf = buf;
                            buf.extend_from_slice(&hdr.encode());
                            buf.extend_from_slice(&msg);
                            txs.push(Box::new(Tx {
                                kind: TxKind::Msg,
                                ep: self.weak(),
                                conn_id: conn.id,
                                seq,
                                reliable: true,
                                deadline: now + timeout,
                                last_send: None,
                                resends: 0,
                                silent: true,
                                context: 0,
                                blocking: None,
                                peer: conn.peer,
                                buf,
                            }));
                        } else {
                            bufs.push(buf);
                        }
                        if let Some(op) = st.rma_ops.remove(idx) {
                            finished.push((op, Status::Success));
                        }
                        continue;
                    }

                    let off = next_off;
                    let len = (op_len - off).min(frag as u64) as u32;

                    if write {
                        let mut data = vec![0u8; len as usize];
                        let read_ok = {
                            let registry = self.registry.lock().unwrap();
                            registry
                                .lookup(local_token)
                                .map(|reg| reg.copy_out(local_offset + off, &mut data).is_ok())
                                .unwrap_or(false)
                        };
                        if !read_ok {
                            // Local registration vanished mid-operation.
                            bufs.push(buf);
                            if let Some(op) = st.rma_ops.remove(idx) {
                                finished.push((op, Status::Disconnected));
                            }
                            continue;
                        }
                        let seq = st.next_seq;
                        st.next_seq = st.next_seq.wrapping_add(1);
                        let hdr = Header {
                            kind: PktType::RmaWrite,
                            attr: 0,
                            src_id: conn.id,
                            dst_id: st.peer_id,
                            seq,
                            ack: st.recv.cumulative(),
                            sack: st.recv.sack(),
                            len: (RMA_WRITE_HDR_SIZE + len as usize) as u16,
                        };
                        let mut buf = buf;
                        buf.extend_from_slice(&hdr.encode());
                        buf.extend_from_slice(
                            &RmaWriteHdr {
                                token: remote_token,
                                offset: remote_offset + off,
                            }
                            .encode(),
                        );
                        buf.extend_from_slice(&data);
                        txs.push(Box::new(Tx {
                            kind: TxKind::RmaWrite { op: op_id, len },
                            ep: self.weak(),
                            conn_id: conn.id,
                            seq,
                            reliable: true,
                            deadline: now + timeout,
                            last_send: None,
                            resends: 0,
                            silent: true,
                            context: 0,
                            blocking: None,
                            peer: conn.peer,
                            buf,
                        }));
                    } else {
                        let seq = st.read_frag_seq;
                        st.read_frag_seq = st.read_frag_seq.wrapping_add(1);
                        let hdr = Header {
                            kind: PktType::RmaReadRequest,
                            attr: 0,
                            src_id: conn.id,
                            dst_id: st.peer_id,
                            seq,
                            ack: st.recv.cumulative(),
                            sack: st.recv.sack(),
                            len: RMA_READ_REQ_HDR_SIZE as u16,
                        };
                        let mut buf = buf;
                        buf.extend_from_slice(&hdr.encode());
                        buf.extend_from_slice(
                            &RmaReadReqHdr {
                                req_token: local_token,
                                req_offset: local_offset + off,
                                token: remote_token,
                                offset: remote_offset + off,
                                length: len,
                            }
                            .encode(),
                        );
                        txs.push(Box::new(Tx {
                            kind: TxKind::RmaRead { op: op_id, len },
                            ep: self.weak(),
                            conn_id: conn.id,
                            seq,
                            reliable: true,
                            deadline: now + timeout,
                            last_send: None,
                            resends: 0,
                            silent: true,
                            context: 0,
                            blocking: None,
                            peer: conn.peer,
                            buf,
                        }));
                    }

                    let op = &mut st.rma_ops[idx];
                    op.next_off += len as u64;
                    op.inflight += 1;
                }
            }

            let made_progress = !txs.is_empty() || !finished.is_empty();
            if !bufs.is_empty() {
                let mut core = self.core.lock().unwrap();
                for b in bufs {
                    core.tx.put(b);
                }
            }
            if !txs.is_empty() {
                let mut q = self.device.queue.lock().unwrap();
                for tx in txs {
                    q.queued.push_back(tx);
                }
            }
            for (op, status) in finished {
                self.complete_rma_op(conn, op, status);
            }
            if !made_progress {
                return;
            }
        }
    }

    /// Produce the local completion for a retired RMA operation.
    fn complete_rma_op(&self, conn: &Arc<SockConn>, op: RmaOp, status: Status) {
        if status != Status::Success {
            debug!(conn = conn.id, op = op.id, ?status, "RMA operation failed");
        }
        if let Some(slot) = &op.blocking {
            slot.complete(status);
        } else if !op.silent {
            self.push_event(
                EventKind::Send {
                    status,
                    context: op.context,
                    connection: self.conn_handle(conn.id),
                },
                None,
                self.alloc_token(),
            );
        }
    }

    /// Abort one RMA operation and scrap its in-flight fragments.
    fn fail_rma_op(&self, conn: &Arc<SockConn>, op_id: u64, status: Status) {
        let op = {
            let mut st = conn.state.lock().unwrap();
            let pos = st.rma_ops.iter().position(|o| o.id == op_id);
            pos.and_then(|p| st.rma_ops.remove(p))
        };
        let Some(op) = op else { return };

        let mut txs: Vec<Box<Tx>> = Vec::new();
        {
            let mut q = self.device.queue.lock().unwrap();
            let matcher = |tx: &Box<Tx>| {
                matches!(tx.kind,
                    TxKind::RmaWrite { op, .. } | TxKind::RmaRead { op, .. } if op == op_id)
                    && tx.conn_id == conn.id
                    && tx.ep.upgrade().is_some_and(|e| e.id == self.id)
            };
            let pending = std::mem::take(&mut q.pending);
            for tx in pending {
                if matcher(&tx) {
                    txs.push(tx);
                } else {
                    q.pending.push(tx);
                }
            }
            let queued = std::mem::take(&mut q.queued);
            for tx in queued {
                if matcher(&tx) {
                    txs.push(tx);
                } else {
                    q.queued.push_back(tx);
                }
            }
        }
        for tx in txs {
            self.recycle_tx(tx);
        }
        self.complete_rma_op(conn, op, status);
    }

    // -----------------------------------------------------------------------
    // Blocking helper
    // -----------------------------------------------------------------------

    /// Drive progress until a blocking slot completes.
    fn wait_blocking(&self, slot: &Arc<BlockSlot>) -> Result<()> {
        loop {
            if let Some(status) = slot.poll_wait(Duration::from_millis(1)) {
                return match status {
                    Status::Success => Ok(()),
                    other => Err(other),
                };
            }
            self.progress();
        }
    }
}

/// Index of the first operation allowed to issue work, honoring fences.
fn eligible_rma_op(ops: &VecDeque<RmaOp>) -> Option<usize> {
    for i in 0..ops.len() {
        let prior_done = ops.iter().take(i).all(|o| o.data_done());
        if ops[i].fence && !prior_done {
            return None;
        }
        if i > 0 && ops.iter().take(i).any(|o| o.fence && !o.data_done()) {
            return None;
        }
        if ops[i].has_work() || (ops[i].data_done() && ops[i].inflight == 0) {
            return Some(i);
        }
    }
    None
}

fn conf_lookup<'a>(conf: &'a [String], key: &str) -> Option<&'a str> {
    conf.iter()
        .find_map(|kv| kv.split_once('=').filter(|(k, _)| *k == key).map(|(_, v)| v))
}

/// Parse a `sock://host:port` URI into a socket address.
fn parse_uri(uri: &str) -> Result<SocketAddr> {
    let rest = uri.strip_prefix("sock://").ok_or(Status::Invalid)?;
    rest.to_socket_addrs()
        .map_err(|_| Status::AddrNotAvailable)?
        .find(|a| a.is_ipv4())
        .ok_or(Status::AddrNotAvailable)
}

// ---------------------------------------------------------------------------
// EndpointOps
// ---------------------------------------------------------------------------

impl EndpointOps for SockEndpoint {
    fn endpoint_id(&self) -> u32 {
        self.id
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn os_handle(&self) -> RawFd {
        self.wake.read_fd
    }

    fn arm_wake(&self) -> Result<()> {
        self.wake.drain();
        if !self.events.lock().unwrap().ready.is_empty() {
            self.wake.signal();
        }
        Ok(())
    }

    fn destroy(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(uri = %self.uri, "destroying endpoint");
        // Scrap every TX of this endpoint still sitting on the device.
        let mut txs: Vec<Box<Tx>> = Vec::new();
        {
            let mut q = self.device.queue.lock().unwrap();
            let matcher =
                |tx: &Box<Tx>| tx.ep.upgrade().map(|e| e.id == self.id).unwrap_or(true);
            let pending = std::mem::take(&mut q.pending);
            for tx in pending {
                if matcher(&tx) {
                    txs.push(tx);
                } else {
                    q.pending.push(tx);
                }
            }
            let queued = std::mem::take(&mut q.queued);
            for tx in queued {
                if matcher(&tx) {
                    txs.push(tx);
                } else {
                    q.queued.push_back(tx);
                }
            }
        }
        for tx in txs {
            if let Some(slot) = &tx.blocking {
                slot.complete(Status::Disconnected);
            }
            // Buffers die with the endpoint.
        }
        {
            let mut core = self.core.lock().unwrap();
            core.conns.clear();
            core.peer_index.clear();
            core.conn_requests.clear();
            core.mc_rx.clear();
        }
        self.events.lock().unwrap().ready.clear();
    }

    fn connect(
        &self,
        server_uri: &str,
        payload: &[u8],
        attribute: ConnAttribute,
        context: u64,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::Invalid);
        }
        if payload.len() > CONN_REQ_LEN {
            return Err(Status::Invalid);
        }
        if attribute.is_multicast() && !payload.is_empty() {
            return Err(Status::Invalid);
        }
        let peer = parse_uri(server_uri)?;

        if attribute.is_multicast() {
            let group = match peer {
                SocketAddr::V4(v4) => *v4.ip(),
                SocketAddr::V6(_) => return Err(Status::Invalid),
            };
            if !group.is_multicast() {
                return Err(Status::Invalid);
            }
            if attribute == ConnAttribute::UuMcRx {
                self.socket
                    .join_multicast_v4(&group, &self.local_ip)
                    .map_err(Status::from)?;
            }
            let conn_id = {
                let mut core = self.core.lock().unwrap();
                let conn_id = core.conn_ids.alloc();
                let conn = SockConn::new(
                    conn_id,
                    attribute,
                    peer,
                    ConnPhase::Ready,
                    0,
                    0,
                    0,
                    self.mss,
                    context,
                    Instant::now(),
                );
                core.conns.insert(conn_id, conn);
                if attribute == ConnAttribute::UuMcRx {
                    core.mc_rx.push(conn_id);
                }
                conn_id
            };
            debug!(conn = conn_id, group = %peer, ?attribute, "multicast joined");
            self.push_event(
                EventKind::Connect {
                    status: Status::Success,
                    context,
                    connection: Some(self.conn_handle(conn_id)),
                },
                None,
                self.alloc_token(),
            );
            return Ok(());
        }

        let initial_seq = rand::random::<u32>();
        let (conn_id, buf, connect_timeout_us) = {
            let mut core = self.core.lock().unwrap();
            let Some(buf) = core.tx.take() else {
                return Err(Status::NoBufferSpace);
            };
            let conn_id = core.conn_ids.alloc();
            let conn = SockConn::new(
                conn_id,
                attribute,
                peer,
                ConnPhase::Active,
                0,
                initial_seq,
                0,
                self.mss,
                context,
                Instant::now(),
            );
            core.conns.insert(conn_id, conn);
            (conn_id, buf, core.cfg.connect_timeout_us)
        };

        let hdr = Header {
            kind: PktType::Request,
            attr: attribute.to_wire(),
            src_id: conn_id,
            dst_id: 0,
            seq: initial_seq,
            ack: 0,
            sack: 0,
            len: payload.len() as u16,
        };
        let mut buf = buf;
        buf.extend_from_slice(&hdr.encode());
        buf.extend_from_slice(payload);
        let deadline =
            Instant::now() + timeout.unwrap_or(Duration::from_micros(connect_timeout_us as u64));
        let tx = Box::new(Tx {
            kind: TxKind::ConnRequest,
            ep: self.weak(),
            conn_id,
            seq: initial_seq,
            reliable: true,
            deadline,
            last_send: None,
            resends: 0,
            silent: false,
            context,
            blocking: None,
            peer,
            buf,
        });
        debug!(conn = conn_id, peer = %peer, ?attribute, "connecting");
        self.device.queue.lock().unwrap().queued.push_back(tx);
        self.progress();
        Ok(())
    }

    fn accept(&self, event_token: u64, context: u64) -> Result<()> {
        let (conn, buf, connect_timeout_us) = {
            let mut core = self.core.lock().unwrap();
            let req = core
                .conn_requests
                .get(&event_token)
                .ok_or(Status::Invalid)?;
            if req.handled {
                return Err(Status::Invalid);
            }
            let conn_id = req.conn_id;
            let Some(buf) = core.tx.take() else {
                return Err(Status::NoBufferSpace);
            };
            if let Some(req) = core.conn_requests.get_mut(&event_token) {
                req.handled = true;
            }
            let conn = core.conns.get(&conn_id).cloned().ok_or(Status::Invalid)?;
            (conn, buf, core.cfg.connect_timeout_us)
        };

        let initial_seq = rand::random::<u32>();
        let tx = {
            let mut st = conn.state.lock().unwrap();
            if st.phase != ConnPhase::Passive {
                drop(st);
                self.core.lock().unwrap().tx.put(buf);
                return Err(Status::Invalid);
            }
            st.phase = ConnPhase::PassiveReplied;
            st.context = context;
            st.local_initial_seq = initial_seq;
            st.next_seq = initial_seq.wrapping_add(1);
            st.send_base = initial_seq.wrapping_add(1);
            let hdr = Header {
                kind: PktType::Reply,
                attr: conn.attribute.to_wire(),
                src_id: conn.id,
                dst_id: st.peer_id,
                seq: initial_seq,
                ack: st.recv.cumulative(),
                sack: st.recv.sack(),
                len: 1,
            };
            let mut buf = buf;
            buf.extend_from_slice(&hdr.encode());
            buf.push(0);
            Box::new(Tx {
                kind: TxKind::ConnReply,
                ep: self.weak(),
                conn_id: conn.id,
                seq: initial_seq,
                reliable: true,
                deadline: Instant::now() + Duration::from_micros(connect_timeout_us as u64),
                last_send: None,
                resends: 0,
                silent: false,
                context,
                blocking: None,
                peer: conn.peer,
                buf,
            })
        };
        debug!(conn = conn.id, "accepting connection");
        self.device.queue.lock().unwrap().queued.push_back(tx);
        self.progress();
        Ok(())
    }

    fn reject(&self, event_token: u64) -> Result<()> {
        let conn = {
            let mut core = self.core.lock().unwrap();
            let req = core
                .conn_requests
                .get_mut(&event_token)
                .ok_or(Status::Invalid)?;
            if req.handled {
                return Err(Status::Invalid);
            }
            req.handled = true;
            let conn_id = req.conn_id;
            core.conns.get(&conn_id).cloned().ok_or(Status::Invalid)?
        };
        let peer_id = conn.state.lock().unwrap().peer_id;
        self.free_conn(&conn);
        let hdr = Header {
            kind: PktType::Reject,
            attr: 0,
            src_id: 0,
            dst_id: peer_id,
            seq: 0,
            ack: 0,
            sack: 0,
            len: 0,
        };
        debug!(peer = %conn.peer, "rejecting connection request");
        self.send_control(hdr, conn.peer);
        Ok(())
    }

    fn disconnect(&self, conn_id: u32) -> Result<()> {
        let conn = self.lookup_conn(conn_id).ok_or(Status::Invalid)?;
        if conn.attribute == ConnAttribute::UuMcRx {
            if let SocketAddr::V4(v4) = conn.peer {
                let _ = self.socket.leave_multicast_v4(v4.ip(), &self.local_ip);
            }
        }
        // Abort everything in flight with Disconnected, then drop the
        // connection from the tables.
        self.fail_conn(&conn, Status::Disconnected);
        self.free_conn(&conn);
        debug!(conn = conn_id, "disconnected");
        Ok(())
    }

    fn send(
        &self,
        conn_id: u32,
        segments: &[&[u8]],
        context: u64,
        flags: MsgFlags,
    ) -> Result<()> {
        let conn = self.lookup_conn(conn_id).ok_or(Status::Invalid)?;
        if conn.attribute == ConnAttribute::UuMcRx {
            return Err(Status::Invalid);
        }
        let total: usize = segments.iter().map(|s| s.len()).sum();

        {
            let st = conn.state.lock().unwrap();
            if let Some(status) = st.failed {
                return Err(status);
            }
            if st.phase != ConnPhase::Ready {
                return Err(Status::Invalid);
            }
            if total > st.max_send_size as usize {
                return Err(Status::MessageTooLong);
            }
        }

        if !conn.attribute.is_reliable() {
            // Unreliable: one shot on the wire, local completion.
            let hdr = {
                let st = conn.state.lock().unwrap();
                Header {
                    kind: PktType::Msg,
                    attr: 0,
                    src_id: conn.id,
                    dst_id: st.peer_id,
                    seq: 0,
                    ack: 0,
                    sack: 0,
                    len: total as u16,
                }
            };
            let mut pkt = Vec::with_capacity(HEADER_SIZE + total);
            pkt.extend_from_slice(&hdr.encode());
            for seg in segments {
                pkt.extend_from_slice(seg);
            }
            self.send_raw(&pkt, conn.peer);
            if !flags.contains(MsgFlags::SILENT) && !flags.contains(MsgFlags::BLOCKING) {
                self.push_event(
                    EventKind::Send {
                        status: Status::Success,
                        context,
                        connection: self.conn_handle(conn.id),
                    },
                    None,
                    self.alloc_token(),
                );
            }
            return Ok(());
        }

        let default_timeout_us = self.default_send_timeout();
        let Some(buf) = self.core.lock().unwrap().tx.take() else {
            return Err(Status::NoBufferSpace);
        };
        let blocking = flags.contains(MsgFlags::BLOCKING).then(BlockSlot::new);
        let tx = {
            let mut st = conn.state.lock().unwrap();
            if let Some(status) = st.failed {
                drop(st);
                self.core.lock().unwrap().tx.put(buf);
                return Err(status);
            }
            let seq = st.next_seq;
            st.next_seq = st.next_seq.wrapping_add(1);
            let timeout =
                Duration::from_micros(st.send_timeout_us.unwrap_or(default_timeout_us) as u64);
            let hdr = Header {
                kind: PktType::Msg,
                attr: 0,
                src_id: conn.id,
                dst_id: st.peer_id,
                seq,
                ack: st.recv.cumulative(),
                sack: st.recv.sack(),
                len: total as u16,
            };
            let mut buf = buf;
            buf.extend_from_slice(&hdr.encode());
            for seg in segments {
                buf.extend_from_slice(seg);
            }
            Box::new(Tx {
                kind: TxKind::Msg,
                ep: self.weak(),
                conn_id: conn.id,
                seq,
                reliable: true,
                deadline: Instant::now() + timeout,
                last_send: None,
                resends: 0,
                silent: flags.contains(MsgFlags::SILENT),
                context,
                blocking: blocking.clone(),
                peer: conn.peer,
                buf,
            })
        };
        trace!(conn = conn.id, seq = tx.seq, len = total, "send queued");
        self.device.queue.lock().unwrap().queued.push_back(tx);
        self.progress();

        match blocking {
            Some(slot) => self.wait_blocking(&slot),
            None => Ok(()),
        }
    }

    fn conn_attribute(&self, conn_id: u32) -> Result<ConnAttribute> {
        let conn = self.lookup_conn(conn_id).ok_or(Status::Invalid)?;
        Ok(conn.attribute)
    }

    fn conn_max_send_size(&self, conn_id: u32) -> Result<u32> {
        let conn = self.lookup_conn(conn_id).ok_or(Status::Invalid)?;
        let size = conn.state.lock().unwrap().max_send_size;
        Ok(size)
    }

    fn conn_context(&self, conn_id: u32) -> Result<u64> {
        let conn = self.lookup_conn(conn_id).ok_or(Status::Invalid)?;
        let context = conn.state.lock().unwrap().context;
        Ok(context)
    }

    fn conn_set_context(&self, conn_id: u32, context: u64) -> Result<()> {
        let conn = self.lookup_conn(conn_id).ok_or(Status::Invalid)?;
        conn.state.lock().unwrap().context = context;
        Ok(())
    }

    fn set_opt(&self, conn_id: Option<u32>, name: OptName, value: u32) -> Result<()> {
        match (conn_id, name) {
            (None, OptName::EndptSendTimeout) => {
                self.core.lock().unwrap().cfg.send_timeout_us = value;
                Ok(())
            }
            (None, OptName::EndptRecvBufCount) => {
                let mut core = self.core.lock().unwrap();
                core.rx.resize(value as usize)?;
                core.cfg.rx_buf_count = value;
                Ok(())
            }
            (None, OptName::EndptSendBufCount) => {
                let mut core = self.core.lock().unwrap();
                core.tx.resize(value as usize)?;
                core.cfg.tx_buf_count = value;
                Ok(())
            }
            (None, OptName::EndptKeepaliveTimeout) => {
                let now = Instant::now();
                self.core.lock().unwrap().cfg.keepalive_us = value;
                for conn in self.snapshot_conns() {
                    if conn.attribute.is_reliable() {
                        let mut st = conn.state.lock().unwrap();
                        st.keepalive_us = value;
                        st.ka_last = now;
                    }
                }
                Ok(())
            }
            (Some(id), OptName::ConnSendTimeout) => {
                let conn = self.lookup_conn(id).ok_or(Status::Invalid)?;
                conn.state.lock().unwrap().send_timeout_us = Some(value);
                Ok(())
            }
            (Some(id), OptName::ConnKeepaliveTimeout) => {
                let conn = self.lookup_conn(id).ok_or(Status::Invalid)?;
                let mut st = conn.state.lock().unwrap();
                st.keepalive_us = value;
                st.ka_last = Instant::now();
                Ok(())
            }
            _ => Err(Status::Invalid),
        }
    }

    fn get_opt(&self, conn_id: Option<u32>, name: OptName) -> Result<OptValue> {
        match (conn_id, name) {
            (None, OptName::EndptSendTimeout) => {
                Ok(OptValue::U32(self.core.lock().unwrap().cfg.send_timeout_us))
            }
            (None, OptName::EndptRecvBufCount) => {
                Ok(OptValue::U32(self.core.lock().unwrap().cfg.rx_buf_count))
            }
            (None, OptName::EndptSendBufCount) => {
                Ok(OptValue::U32(self.core.lock().unwrap().cfg.tx_buf_count))
            }
            (None, OptName::EndptKeepaliveTimeout) => {
                Ok(OptValue::U32(self.core.lock().unwrap().cfg.keepalive_us))
            }
            (None, OptName::EndptUri) => Ok(OptValue::Uri(self.uri.clone())),
            (None, OptName::EndptRmaAlign) => {
                // The datagram transport copies; nothing needs alignment.
                Ok(OptValue::RmaAlign(RmaAlignment::default()))
            }
            (Some(id), OptName::ConnSendTimeout) => {
                let default = self.default_send_timeout();
                let conn = self.lookup_conn(id).ok_or(Status::Invalid)?;
                let us = conn.state.lock().unwrap().send_timeout_us.unwrap_or(default);
                Ok(OptValue::U32(us))
            }
            (Some(id), OptName::ConnKeepaliveTimeout) => {
                let conn = self.lookup_conn(id).ok_or(Status::Invalid)?;
                let us = conn.state.lock().unwrap().keepalive_us;
                Ok(OptValue::U32(us))
            }
            _ => Err(Status::Invalid),
        }
    }

    fn rma_register(&self, start: *mut u8, length: u64, prot: RmaProt) -> Result<RmaHandle> {
        if start.is_null() || length == 0 {
            return Err(Status::Invalid);
        }
        let handle = self.registry.lock().unwrap().register(start, length, prot);
        debug!(token = handle.token(), length, "RMA region registered");
        Ok(handle)
    }

    fn rma_deregister(&self, handle: &RmaHandle) -> Result<()> {
        self.registry.lock().unwrap().deregister(handle.token())?;
        // Abort in-flight operations that still use the registration.
        for conn in self.snapshot_conns() {
            let stale: Vec<u64> = {
                let st = conn.state.lock().unwrap();
                st.rma_ops
                    .iter()
                    .filter(|o| o.local_token == handle.token())
                    .map(|o| o.id)
                    .collect()
            };
            for op_id in stale {
                self.fail_rma_op(&conn, op_id, Status::Disconnected);
            }
        }
        Ok(())
    }

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
    ) -> Result<()> {
        let conn = self.lookup_conn(conn_id).ok_or(Status::Invalid)?;
        if !conn.attribute.is_reliable() {
            return Err(Status::Invalid);
        }
        if len == 0 {
            return Err(Status::Invalid);
        }
        let write = flags.contains(RmaFlags::WRITE);
        let read = flags.contains(RmaFlags::READ);
        if write == read {
            return Err(Status::Invalid);
        }
        if local_offset
            .checked_add(len)
            .is_none_or(|e| e > local.length())
            || remote_offset
                .checked_add(len)
                .is_none_or(|e| e > remote.length())
        {
            return Err(Status::Invalid);
        }
        if self.registry.lock().unwrap().lookup(local.token()).is_none() {
            return Err(Status::Invalid);
        }
        if let Some(msg) = completion_msg {
            let max = conn.state.lock().unwrap().max_send_size;
            if msg.is_empty() || msg.len() > max as usize {
                return Err(Status::Invalid);
            }
        }

        let overhead = if write {
            RMA_WRITE_HDR_SIZE
        } else {
            RMA_READ_REPLY_HDR_SIZE
        };
        let frag = (self.mss as usize - overhead) as u32;

        let blocking = flags.contains(RmaFlags::BLOCKING).then(BlockSlot::new);
        {
            let mut st = conn.state.lock().unwrap();
            if let Some(status) = st.failed {
                return Err(status);
            }
            if st.phase != ConnPhase::Ready {
                return Err(Status::Invalid);
            }
            let id = st.rma_next_id;
            st.rma_next_id += 1;
            st.rma_ops.push_back(RmaOp {
                id,
                write,
                local_token: local.token(),
                local_offset,
                remote_token: remote.token(),
                remote_offset,
                len,
                frag,
                next_off: 0,
                inflight: 0,
                done: 0,
                fence: flags.contains(RmaFlags::FENCE),
                silent: flags.contains(RmaFlags::SILENT),
                context,
                completion: completion_msg.map(|m| m.to_vec()),
                blocking: blocking.clone(),
            });
            debug!(conn = conn.id, id, len, write, "RMA queued");
        }
        self.rma_advance(&conn);
        self.progress();

        match blocking {
            Some(slot) => self.wait_blocking(&slot),
            None => Ok(()),
        }
    }

    fn get_event(&self) -> Result<Option<Event>> {
        self.progress();
        if let Some(ev) = self.events.lock().unwrap().ready.pop_front() {
            return Ok(Some(ev));
        }
        if self.core.lock().unwrap().rx.available() == 0 {
            return Err(Status::NoBufferSpace);
        }
        Ok(None)
    }

    fn return_event(&self, event: Event) -> Result<()> {
        let same = event
            .endpoint()
            .upgrade()
            .is_some_and(|ops| ops.endpoint_id() == self.id);
        if !same {
            return Err(Status::Invalid);
        }
        if matches!(event.kind(), EventKind::ConnectRequest { .. }) {
            let handled = {
                let core = self.core.lock().unwrap();
                core.conn_requests
                    .get(&event.token())
                    .map(|r| r.handled)
                    // No record means the endpoint already dropped it.
                    .unwrap_or(true)
            };
            if !handled {
                // The application must accept or reject first; keep the
                // lease and redeliver.
                let mut q = self.events.lock().unwrap();
                let was_empty = q.ready.is_empty();
                q.ready.push_front(event);
                if was_empty {
                    self.wake.signal();
                }
                return Err(Status::Invalid);
            }
            self.core
                .lock()
                .unwrap()
                .conn_requests
                .remove(&event.token());
        }
        let (_, buffer, _) = event.into_parts();
        if let Some(buf) = buffer {
            self.core.lock().unwrap().rx.put(buf)?;
        }
        Ok(())
    }

    fn buffer_counts(&self) -> BufferCounts {
        let core = self.core.lock().unwrap();
        BufferCounts {
            tx_free: core.tx.available(),
            tx_total: core.tx.capacity(),
            rx_free: core.rx.available(),
            rx_total: core.rx.capacity(),
        }
    }
}

impl Drop for SockEndpoint {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.upgrade() {
            transport.endpoint_ids.lock().unwrap().release(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri() {
        let addr = parse_uri("sock://127.0.0.1:5555").unwrap();
        assert_eq!(addr.port(), 5555);
        assert!(parse_uri("tcp://127.0.0.1:5555").is_err());
        assert_eq!(parse_uri("sock://"), Err(Status::AddrNotAvailable));
    }

    #[test]
    fn test_conf_lookup() {
        let conf = vec!["ip=127.0.0.1".to_string(), "progress=thread".to_string()];
        assert_eq!(conf_lookup(&conf, "ip"), Some("127.0.0.1"));
        assert_eq!(conf_lookup(&conf, "progress"), Some("thread"));
        assert_eq!(conf_lookup(&conf, "port"), None);
    }

    #[test]
    fn test_wake_pipe_signal_drain() {
        let pipe = WakePipe::new().unwrap();
        pipe.signal();
        let mut pfd = libc::pollfd {
            fd: pipe.read_fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: valid pollfd for an open pipe.
        let n = unsafe { libc::poll(&mut pfd, 1, 100) };
        assert_eq!(n, 1);
        pipe.drain();
        let n = unsafe { libc::poll(&mut pfd, 1, 0) };
        assert_eq!(n, 0);
    }

    #[test]
    fn test_tx_acked_by() {
        let tx = Tx {
            kind: TxKind::Msg,
            ep: Weak::new(),
            conn_id: 1,
            seq: 10,
            reliable: true,
            deadline: Instant::now(),
            last_send: None,
            resends: 0,
            silent: false,
            context: 0,
            blocking: None,
            peer: "127.0.0.1:1".parse().unwrap(),
            buf: Vec::new(),
        };
        assert!(tx.acked_by(10, 0, false));
        assert!(tx.acked_by(11, 0, false));
        assert!(!tx.acked_by(9, 0, false));
        // Selective: seq 10 against cumulative 8 is bitmap bit 0.
        assert!(tx.acked_by(8, 0b1, true));
        assert!(!tx.acked_by(8, 0b1, false));
        assert!(!tx.acked_by(8, 0b10, true));
    }

    #[test]
    fn test_eligible_rma_op_fences() {
        let mk = |fence: bool, len: u64, done: u64| RmaOp {
            id: 0,
            write: true,
            local_token: 1,
            local_offset: 0,
            remote_token: 2,
            remote_offset: 0,
            len,
            frag: 1024,
            next_off: done,
            inflight: 0,
            done,
            fence,
            silent: true,
            context: 0,
            completion: None,
            blocking: None,
        };
        // Plain ops issue in order.
        let mut ops = VecDeque::new();
        ops.push_back(mk(false, 4096, 0));
        ops.push_back(mk(false, 4096, 0));
        assert_eq!(eligible_rma_op(&ops), Some(0));

        // A fenced op waits for prior completion; the finished op is
        // picked first for retirement, then the fenced one may issue.
        let mut ops = VecDeque::new();
        ops.push_back(mk(false, 4096, 0));
        ops.push_back(mk(true, 4096, 0));
        assert_eq!(eligible_rma_op(&ops), Some(0));
        ops[0].done = 4096;
        ops[0].next_off = 4096;
        assert_eq!(eligible_rma_op(&ops), Some(0));
        ops.pop_front();
        assert_eq!(eligible_rma_op(&ops), Some(0));

        // Ops after an incomplete fenced op wait.
        let mut ops = VecDeque::new();
        ops.push_back(mk(true, 4096, 0));
        ops.push_back(mk(false, 4096, 0));
        assert_eq!(eligible_rma_op(&ops), Some(0));
        ops[0].next_off = 4096; // fully issued, not yet acked
        assert_eq!(eligible_rma_op(&ops), None);
    }
}
