//! An in-process fabric with reliable-connection semantics.
//!
//! Every [`SoftDevice`] opened from one [`SoftFabric`] can reach the others,
//! so two roles running on separate threads behave like two hosts on one
//! subnet. Work requests execute when posted; their completions show up on
//! the next poll. Errors surface the way an RC transport reports them: as
//! error completions that move the queue pair to ERROR.

use super::{
    Completion, CompletionStatus, Gid, MemoryKeys, Opcode, PortAttributes, PortState, Provider,
    QueuePairAttributes, QueuePairCaps, ReceiveRequest, ScatterEntry, SendOperation, SendRequest,
};
use crate::config::Mtu;
use crate::memory::AccessFlags;
use crate::state::ConnectionState;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::{io, ptr};
use tracing::trace;

const PORT_NUM: u8 = 1;
const GID_TABLE_LEN: usize = 2;
/// `rnr_retry` value meaning "retry forever".
const RNR_RETRY_INFINITE: u8 = 7;

#[derive(Debug, Clone)]
pub struct SoftDeviceConfig {
    pub name: String,
    pub port_state: PortState,
    pub max_mtu: Mtu,
    pub max_qp_rd_atom: u8,
    /// Whether queue pairs may enable incoming remote operations at INIT.
    pub remote_access: bool,
    pub max_pinned_bytes: usize,
}

impl SoftDeviceConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port_state: PortState::Active,
            max_mtu: Mtu::Mtu4096,
            max_qp_rd_atom: 16,
            remote_access: true,
            max_pinned_bytes: 64 << 20,
        }
    }
}

/// Shared medium for soft devices.
#[derive(Clone, Default)]
pub struct SoftFabric {
    shared: Arc<Mutex<Fabric>>,
}

impl SoftFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_device(&self, name: &str) -> SoftDevice {
        self.open_device_with(SoftDeviceConfig::named(name))
    }

    pub fn open_device_with(&self, config: SoftDeviceConfig) -> SoftDevice {
        let mut fabric = self.shared.lock();
        let index = fabric.devices.len();
        fabric.devices.push(DeviceEntry {
            gids: device_gids(index),
            pinned: 0,
        });
        SoftDevice {
            fabric: Arc::clone(&self.shared),
            index,
            config,
        }
    }
}

/// GID 0 is link-local, GID 1 an IPv4-mapped address as on a RoCE v2 port.
fn device_gids(index: usize) -> [Gid; GID_TABLE_LEN] {
    let host = (index % 254) as u8 + 1;
    let mut link_local = [0u8; 16];
    link_local[..2].copy_from_slice(&[0xfe, 0x80]);
    link_local[15] = host;
    let mut mapped = [0u8; 16];
    mapped[10..].copy_from_slice(&[0xff, 0xff, 10, 0, 0, host]);
    [Gid::new(link_local), Gid::new(mapped)]
}

pub struct SoftDevice {
    fabric: Arc<Mutex<Fabric>>,
    index: usize,
    config: SoftDeviceConfig,
}

pub struct SoftCompletionQueue {
    fabric: Arc<Mutex<Fabric>>,
    id: u64,
}

impl Drop for SoftCompletionQueue {
    fn drop(&mut self) {
        self.fabric.lock().cqs.remove(&self.id);
    }
}

pub struct SoftQueuePair {
    fabric: Arc<Mutex<Fabric>>,
    qp_num: u32,
}

impl Drop for SoftQueuePair {
    fn drop(&mut self) {
        let mut fabric = self.fabric.lock();
        fabric.fail_qp(self.qp_num);
        fabric.qps.remove(&self.qp_num);
    }
}

pub struct SoftMemoryRegion {
    key: u32,
}

#[derive(Default)]
struct Fabric {
    devices: Vec<DeviceEntry>,
    next_qp_num: u32,
    next_key: u32,
    next_cq: u64,
    cqs: HashMap<u64, VecDeque<Completion>>,
    qps: HashMap<u32, SoftQp>,
    mrs: HashMap<u32, SoftMr>,
}

struct DeviceEntry {
    gids: [Gid; GID_TABLE_LEN],
    pinned: usize,
}

struct SoftQp {
    device: usize,
    cq: u64,
    caps: QueuePairCaps,
    state: ConnectionState,
    access: AccessFlags,
    peer: Option<Peer>,
    rnr_retry: u8,
    receives: VecDeque<ReceiveRequest>,
    /// Inbound operations waiting for RTR or for a posted receive.
    inbound: VecDeque<Inbound>,
}

#[derive(Clone, Copy)]
struct Peer {
    qp_num: u32,
    dgid: Option<Gid>,
}

struct SoftMr {
    device: usize,
    addr: u64,
    len: usize,
    access: AccessFlags,
}

struct Inbound {
    from: u32,
    wr_id: u64,
    signaled: bool,
    kind: InboundKind,
}

enum InboundKind {
    Send {
        payload: Vec<u8>,
    },
    Read {
        remote_addr: u64,
        rkey: u32,
        local: ScatterEntry,
    },
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}

impl Fabric {
    fn qp(&self, qp_num: u32) -> io::Result<&SoftQp> {
        self.qps.get(&qp_num).ok_or_else(|| invalid("unknown queue pair"))
    }

    fn qp_mut(&mut self, qp_num: u32) -> io::Result<&mut SoftQp> {
        self.qps
            .get_mut(&qp_num)
            .ok_or_else(|| invalid("unknown queue pair"))
    }

    fn complete(
        &mut self,
        qp_num: u32,
        wr_id: u64,
        status: CompletionStatus,
        opcode: Opcode,
        byte_len: usize,
    ) {
        let Some(qp) = self.qps.get(&qp_num) else {
            return;
        };
        let Some(cq) = self.cqs.get_mut(&qp.cq) else {
            return;
        };
        trace!(qp_num, wr_id, %status, "completion");
        cq.push_back(Completion {
            wr_id,
            status,
            opcode: status.is_success().then_some(opcode),
            byte_len: byte_len as u32,
            qp_num,
        });
    }

    /// Completes `wr_id` with `status` and moves the QP to ERROR.
    fn fail_request(&mut self, qp_num: u32, wr_id: u64, status: CompletionStatus, opcode: Opcode) {
        self.complete(qp_num, wr_id, status, opcode, 0);
        self.fail_qp(qp_num);
    }

    /// Moves a QP to ERROR, flushing its receives and its own operations
    /// still queued at the peer, and failing the senders of anything still
    /// queued towards it.
    fn fail_qp(&mut self, qp_num: u32) {
        let Some(qp) = self.qps.get_mut(&qp_num) else {
            return;
        };
        if qp.state == ConnectionState::Error {
            return;
        }
        qp.state = ConnectionState::Error;
        let receives: Vec<_> = qp.receives.drain(..).collect();
        let inbound: Vec<_> = qp.inbound.drain(..).collect();

        for recv in receives {
            self.complete(qp_num, recv.wr_id, CompletionStatus::Flushed, Opcode::Receive, 0);
        }
        for op in inbound {
            let opcode = op.kind.opcode();
            self.fail_request(op.from, op.wr_id, CompletionStatus::RetryExceeded, opcode);
        }

        // Queued operations carry raw addresses into this QP's buffers and
        // must never run once it has failed.
        let mut outbound = Vec::new();
        for other in self.qps.values_mut() {
            other.inbound.retain(|op| {
                let ours = op.from == qp_num;
                if ours {
                    outbound.push((op.wr_id, op.kind.opcode()));
                }
                !ours
            });
        }
        for (wr_id, opcode) in outbound {
            self.complete(qp_num, wr_id, CompletionStatus::Flushed, opcode, 0);
        }
    }

    fn local_entry_valid(&self, device: usize, sge: &ScatterEntry, need: AccessFlags) -> bool {
        self.mrs.get(&sge.lkey).is_some_and(|mr| {
            mr.device == device
                && mr.access.contains(need)
                && covers(mr, sge.addr, sge.length as usize)
        })
    }

    /// Target of a connected QP, as long as packets can still reach it.
    fn resolve(&self, from: u32) -> Option<u32> {
        let peer = self.qps.get(&from)?.peer?;
        let target = self.qps.get(&peer.qp_num)?;
        if let Some(dgid) = peer.dgid
            && !self.devices[target.device].gids.contains(&dgid)
        {
            return None;
        }
        match target.state {
            ConnectionState::Init
            | ConnectionState::ReadyToReceive
            | ConnectionState::ReadyToSend => Some(peer.qp_num),
            _ => None,
        }
    }

    fn execute_send(&mut self, from: u32, request: &SendRequest) -> io::Result<()> {
        let qp = self.qp(from)?;
        if qp.state != ConnectionState::ReadyToSend {
            return Err(invalid("queue pair is not ready to send"));
        }
        let device = qp.device;
        let (need, opcode) = match request.operation {
            SendOperation::Send => (AccessFlags::empty(), Opcode::Send),
            SendOperation::RemoteRead { .. } => (AccessFlags::LOCAL_WRITE, Opcode::RemoteRead),
        };

        if !self.local_entry_valid(device, &request.sge, need) {
            self.fail_request(from, request.wr_id, CompletionStatus::LocalProtection, opcode);
            return Ok(());
        }
        let Some(target) = self.resolve(from) else {
            self.fail_request(from, request.wr_id, CompletionStatus::RetryExceeded, opcode);
            return Ok(());
        };

        let kind = match request.operation {
            SendOperation::Send => {
                // SAFETY: the entry was validated against a live registration.
                let payload = unsafe {
                    std::slice::from_raw_parts(
                        request.sge.addr as *const u8,
                        request.sge.length as usize,
                    )
                }
                .to_vec();
                InboundKind::Send { payload }
            }
            SendOperation::RemoteRead { remote_addr, rkey } => InboundKind::Read {
                remote_addr,
                rkey,
                local: request.sge,
            },
        };
        self.qp_mut(target)?.inbound.push_back(Inbound {
            from,
            wr_id: request.wr_id,
            signaled: request.signaled,
            kind,
        });
        self.drain_inbound(target);
        Ok(())
    }

    /// Executes inbound operations in arrival order until one has to wait.
    fn drain_inbound(&mut self, target: u32) {
        loop {
            let Some(qp) = self.qps.get_mut(&target) else {
                return;
            };
            if !matches!(
                qp.state,
                ConnectionState::ReadyToReceive | ConnectionState::ReadyToSend
            ) {
                return;
            }
            let Some(op) = qp.inbound.pop_front() else {
                return;
            };
            if let Some(op) = self.execute_inbound(target, op) {
                if let Some(qp) = self.qps.get_mut(&target) {
                    qp.inbound.push_front(op);
                }
                return;
            }
        }
    }

    /// Returns the operation back if it has to wait for a receive.
    fn execute_inbound(&mut self, target: u32, op: Inbound) -> Option<Inbound> {
        let opcode = op.kind.opcode();
        let bound = self
            .qps
            .get(&target)
            .and_then(|qp| qp.peer)
            .is_some_and(|peer| peer.qp_num == op.from);
        if !bound {
            self.fail_request(op.from, op.wr_id, CompletionStatus::RetryExceeded, opcode);
            return None;
        }

        if matches!(op.kind, InboundKind::Send { .. })
            && self.qps.get(&target).is_some_and(|qp| qp.receives.is_empty())
        {
            let wait = self
                .qps
                .get(&op.from)
                .is_some_and(|sender| sender.rnr_retry == RNR_RETRY_INFINITE);
            if wait {
                return Some(op);
            }
            self.fail_request(op.from, op.wr_id, CompletionStatus::RnrRetryExceeded, opcode);
            return None;
        }

        match op.kind {
            InboundKind::Send { payload } => {
                let target_qp = self.qps.get_mut(&target)?;
                let device = target_qp.device;
                let recv = target_qp.receives.pop_front()?;

                let len = payload.len();
                if len > recv.sge.length as usize {
                    let status = CompletionStatus::LocalLength;
                    self.fail_request(target, recv.wr_id, status, Opcode::Receive);
                    let status = CompletionStatus::RemoteInvalidRequest;
                    self.fail_request(op.from, op.wr_id, status, opcode);
                    return None;
                }
                if !self.local_entry_valid(device, &recv.sge, AccessFlags::LOCAL_WRITE) {
                    let status = CompletionStatus::LocalProtection;
                    self.fail_request(target, recv.wr_id, status, Opcode::Receive);
                    let status = CompletionStatus::RemoteOperation;
                    self.fail_request(op.from, op.wr_id, status, opcode);
                    return None;
                }
                // SAFETY: the receive entry was validated against a live,
                // locally writable registration of at least `len` bytes.
                unsafe { ptr::copy(payload.as_ptr(), recv.sge.addr as *mut u8, len) };
                self.complete(target, recv.wr_id, CompletionStatus::Success, Opcode::Receive, len);
                if op.signaled {
                    self.complete(op.from, op.wr_id, CompletionStatus::Success, opcode, len);
                }
                None
            }
            InboundKind::Read {
                remote_addr,
                rkey,
                local,
            } => {
                let len = local.length as usize;
                let writable = self.qps.get(&op.from).is_some_and(|sender| {
                    self.local_entry_valid(sender.device, &local, AccessFlags::LOCAL_WRITE)
                });
                if !writable {
                    self.fail_request(op.from, op.wr_id, CompletionStatus::LocalProtection, opcode);
                    return None;
                }
                let target_qp = self.qps.get(&target)?;
                let permitted = target_qp.access.contains(AccessFlags::REMOTE_READ)
                    && self.mrs.get(&rkey).is_some_and(|mr| {
                        mr.device == target_qp.device
                            && mr.access.contains(AccessFlags::REMOTE_READ)
                            && covers(mr, remote_addr, len)
                    });
                if !permitted {
                    self.fail_request(op.from, op.wr_id, CompletionStatus::RemoteAccess, opcode);
                    return None;
                }
                // SAFETY: both ranges were validated against live
                // registrations with the required access rights.
                unsafe { ptr::copy(remote_addr as *const u8, local.addr as *mut u8, len) };
                if op.signaled {
                    self.complete(op.from, op.wr_id, CompletionStatus::Success, opcode, len);
                }
                None
            }
        }
    }

    fn modify(
        &mut self,
        qp_num: u32,
        attributes: &QueuePairAttributes,
        config: &SoftDeviceConfig,
    ) -> io::Result<()> {
        let qp = self.qp_mut(qp_num)?;
        let require = |state: ConnectionState| {
            if qp.state == state {
                Ok(())
            } else {
                Err(invalid("invalid state transition"))
            }
        };

        match *attributes {
            QueuePairAttributes::Init {
                port_num,
                pkey_index,
                access,
            } => {
                require(ConnectionState::Reset)?;
                if port_num != PORT_NUM || pkey_index != 0 {
                    return Err(invalid("no such port or partition key"));
                }
                if access.allows_remote() && !config.remote_access {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "remote access is disabled on this port",
                    ));
                }
                qp.access = access;
                qp.state = ConnectionState::Init;
            }
            QueuePairAttributes::ReadyToReceive {
                path_mtu,
                dest_qp_num,
                max_dest_rd_atomic,
                min_rnr_timer,
                av,
                ..
            } => {
                require(ConnectionState::Init)?;
                if path_mtu > config.max_mtu
                    || max_dest_rd_atomic > config.max_qp_rd_atom
                    || min_rnr_timer > 31
                    || av.port_num != PORT_NUM
                {
                    return Err(invalid("unsupported RTR attributes"));
                }
                if let Some(grh) = av.global
                    && (usize::from(grh.sgid_index) >= GID_TABLE_LEN || grh.dgid.is_zero())
                {
                    return Err(invalid("invalid global route"));
                }
                qp.peer = Some(Peer {
                    qp_num: dest_qp_num,
                    dgid: av.global.map(|grh| grh.dgid),
                });
                qp.state = ConnectionState::ReadyToReceive;
                self.drain_inbound(qp_num);
            }
            QueuePairAttributes::ReadyToSend {
                timeout,
                retry_cnt,
                rnr_retry,
                max_rd_atomic,
                ..
            } => {
                require(ConnectionState::ReadyToReceive)?;
                if timeout > 31
                    || retry_cnt > 7
                    || rnr_retry > 7
                    || max_rd_atomic > config.max_qp_rd_atom
                {
                    return Err(invalid("unsupported RTS attributes"));
                }
                qp.rnr_retry = rnr_retry;
                qp.state = ConnectionState::ReadyToSend;
            }
            QueuePairAttributes::Error => self.fail_qp(qp_num),
        }
        Ok(())
    }
}

impl InboundKind {
    fn opcode(&self) -> Opcode {
        match self {
            Self::Send { .. } => Opcode::Send,
            Self::Read { .. } => Opcode::RemoteRead,
        }
    }
}

fn covers(mr: &SoftMr, addr: u64, len: usize) -> bool {
    addr >= mr.addr
        && (addr - mr.addr)
            .checked_add(len as u64)
            .is_some_and(|end| end <= mr.len as u64)
}

impl Provider for SoftDevice {
    type CompletionQueue = SoftCompletionQueue;
    type QueuePair = SoftQueuePair;
    type MemoryRegion = SoftMemoryRegion;

    fn device_name(&self) -> &str {
        &self.config.name
    }

    fn port_attributes(&self, port_num: u8) -> io::Result<PortAttributes> {
        if port_num != PORT_NUM {
            return Err(invalid("no such port"));
        }
        Ok(PortAttributes {
            state: self.config.port_state,
            max_mtu: self.config.max_mtu,
            active_mtu: self.config.max_mtu,
            lid: self.index as u16 + 1,
        })
    }

    fn query_gid(&self, port_num: u8, index: u8) -> io::Result<Gid> {
        if port_num != PORT_NUM {
            return Err(invalid("no such port"));
        }
        let fabric = self.fabric.lock();
        fabric.devices[self.index]
            .gids
            .get(usize::from(index))
            .copied()
            .ok_or_else(|| invalid("GID index out of range"))
    }

    fn max_qp_rd_atom(&self) -> u8 {
        self.config.max_qp_rd_atom
    }

    fn create_cq(&self, depth: u32) -> io::Result<SoftCompletionQueue> {
        if depth == 0 {
            return Err(invalid("completion queue depth must be positive"));
        }
        let mut fabric = self.fabric.lock();
        fabric.next_cq += 1;
        let id = fabric.next_cq;
        fabric.cqs.insert(id, VecDeque::with_capacity(depth as usize));
        Ok(SoftCompletionQueue {
            fabric: Arc::clone(&self.fabric),
            id,
        })
    }

    fn create_qp(
        &self,
        cq: &SoftCompletionQueue,
        caps: QueuePairCaps,
    ) -> io::Result<SoftQueuePair> {
        if caps.max_send_wr == 0 || caps.max_recv_wr == 0 {
            return Err(invalid("queue pair needs send and receive capacity"));
        }
        let mut fabric = self.fabric.lock();
        if !fabric.cqs.contains_key(&cq.id) {
            return Err(invalid("unknown completion queue"));
        }
        // Queue pair numbers 0 and 1 are reserved for the special QPs.
        let qp_num = fabric.next_qp_num.max(1) + 1;
        fabric.next_qp_num = qp_num;
        fabric.qps.insert(
            qp_num,
            SoftQp {
                device: self.index,
                cq: cq.id,
                caps,
                state: ConnectionState::Reset,
                access: AccessFlags::empty(),
                peer: None,
                rnr_retry: 0,
                receives: VecDeque::new(),
                inbound: VecDeque::new(),
            },
        );
        Ok(SoftQueuePair {
            fabric: Arc::clone(&self.fabric),
            qp_num,
        })
    }

    fn qp_num(&self, qp: &SoftQueuePair) -> u32 {
        qp.qp_num
    }

    fn modify_qp(&self, qp: &SoftQueuePair, attributes: &QueuePairAttributes) -> io::Result<()> {
        self.fabric.lock().modify(qp.qp_num, attributes, &self.config)
    }

    unsafe fn register_memory(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<SoftMemoryRegion> {
        if len == 0 || addr.is_null() {
            return Err(invalid("empty memory region"));
        }
        if access.contains(AccessFlags::REMOTE_WRITE)
            && !access.contains(AccessFlags::LOCAL_WRITE)
        {
            return Err(invalid("remote write requires local write"));
        }
        let mut fabric = self.fabric.lock();
        let device = &mut fabric.devices[self.index];
        if device.pinned + len > self.config.max_pinned_bytes {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "pinned memory limit reached",
            ));
        }
        device.pinned += len;
        fabric.next_key += 1;
        let key = fabric.next_key;
        fabric.mrs.insert(
            key,
            SoftMr {
                device: self.index,
                addr: addr as u64,
                len,
                access,
            },
        );
        Ok(SoftMemoryRegion { key })
    }

    fn memory_keys(&self, mr: &SoftMemoryRegion) -> MemoryKeys {
        MemoryKeys {
            lkey: mr.key,
            rkey: mr.key,
        }
    }

    fn deregister_memory(&self, mr: SoftMemoryRegion) -> io::Result<()> {
        let mut fabric = self.fabric.lock();
        let region = fabric
            .mrs
            .remove(&mr.key)
            .ok_or_else(|| invalid("unknown memory region"))?;
        fabric.devices[region.device].pinned -= region.len;
        Ok(())
    }

    unsafe fn post_send(&self, qp: &SoftQueuePair, request: &SendRequest) -> io::Result<()> {
        self.fabric.lock().execute_send(qp.qp_num, request)
    }

    unsafe fn post_receive(&self, qp: &SoftQueuePair, request: &ReceiveRequest) -> io::Result<()> {
        let mut fabric = self.fabric.lock();
        let state = fabric.qp(qp.qp_num)?.state;
        match state {
            ConnectionState::Reset => return Err(invalid("queue pair is in RESET")),
            ConnectionState::Error => {
                let status = CompletionStatus::Flushed;
                fabric.complete(qp.qp_num, request.wr_id, status, Opcode::Receive, 0);
                return Ok(());
            }
            _ => {}
        }
        let soft_qp = fabric.qp_mut(qp.qp_num)?;
        if soft_qp.receives.len() >= soft_qp.caps.max_recv_wr as usize {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "receive queue is full"));
        }
        soft_qp.receives.push_back(*request);
        fabric.drain_inbound(qp.qp_num);
        Ok(())
    }

    fn poll_cq(
        &self,
        cq: &SoftCompletionQueue,
        max: usize,
        out: &mut Vec<Completion>,
    ) -> io::Result<usize> {
        let mut fabric = self.fabric.lock();
        let queue = fabric
            .cqs
            .get_mut(&cq.id)
            .ok_or_else(|| invalid("unknown completion queue"))?;
        let n = max.min(queue.len());
        out.extend(queue.drain(..n));
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AddressVector, GlobalRoute};

    struct Endpoint {
        device: SoftDevice,
        cq: SoftCompletionQueue,
        qp: SoftQueuePair,
    }

    fn endpoint(fabric: &SoftFabric, name: &str) -> Endpoint {
        let device = fabric.open_device(name);
        let cq = device.create_cq(16).unwrap();
        let caps = QueuePairCaps {
            max_send_wr: 16,
            max_recv_wr: 16,
            max_send_sge: 1,
            max_recv_sge: 1,
        };
        let qp = device.create_qp(&cq, caps).unwrap();
        Endpoint { device, cq, qp }
    }

    fn connect(a: &Endpoint, b: &Endpoint, access: AccessFlags) {
        init(a, access);
        init(b, access);
        ready(a, b);
        ready(b, a);
    }

    fn init(endpoint: &Endpoint, access: AccessFlags) {
        let init = QueuePairAttributes::Init {
            port_num: 1,
            pkey_index: 0,
            access,
        };
        endpoint.device.modify_qp(&endpoint.qp, &init).unwrap();
    }

    /// Moves an initialized `local` through RTR to RTS towards `remote`.
    fn ready(local: &Endpoint, remote: &Endpoint) {
        let dgid = remote.device.query_gid(1, 1).unwrap();
        let steps = [
            QueuePairAttributes::ReadyToReceive {
                path_mtu: Mtu::Mtu1024,
                dest_qp_num: remote.device.qp_num(&remote.qp),
                rq_psn: 0,
                max_dest_rd_atomic: 1,
                min_rnr_timer: 12,
                av: AddressVector {
                    port_num: 1,
                    dlid: 0,
                    service_level: 0,
                    global: Some(GlobalRoute {
                        dgid,
                        sgid_index: 1,
                        hop_limit: 64,
                        traffic_class: 0,
                    }),
                },
            },
            QueuePairAttributes::ReadyToSend {
                timeout: 14,
                retry_cnt: 7,
                rnr_retry: 0,
                sq_psn: 0,
                max_rd_atomic: 1,
            },
        ];
        for step in &steps {
            local.device.modify_qp(&local.qp, step).unwrap();
        }
    }

    fn register(
        device: &SoftDevice,
        buf: &mut [u8],
        access: AccessFlags,
    ) -> (SoftMemoryRegion, ScatterEntry) {
        let mr = unsafe { device.register_memory(buf.as_mut_ptr(), buf.len(), access) }.unwrap();
        let sge = ScatterEntry {
            addr: buf.as_ptr() as u64,
            length: buf.len() as u32,
            lkey: device.memory_keys(&mr).lkey,
        };
        (mr, sge)
    }

    fn poll(endpoint: &Endpoint) -> Vec<Completion> {
        let mut out = Vec::new();
        endpoint.device.poll_cq(&endpoint.cq, 16, &mut out).unwrap();
        out
    }

    #[test]
    fn devices_get_distinct_gids() {
        let fabric = SoftFabric::new();
        let a = fabric.open_device("a");
        let b = fabric.open_device("b");
        assert_ne!(a.query_gid(1, 1).unwrap(), b.query_gid(1, 1).unwrap());
        assert_eq!(a.query_gid(1, 0).unwrap().subnet_prefix(), 0xfe80_0000_0000_0000);
        assert!(a.query_gid(1, 2).is_err());
        assert!(a.port_attributes(2).is_err());
    }

    #[test]
    fn send_without_receive_fails_when_rnr_retry_is_finite() {
        let fabric = SoftFabric::new();
        let (a, b) = (endpoint(&fabric, "a"), endpoint(&fabric, "b"));
        connect(&a, &b, AccessFlags::LOCAL_WRITE);

        let mut buf = *b"ping";
        let (_mr, sge) = register(&a.device, &mut buf, AccessFlags::empty());
        let request = SendRequest {
            wr_id: 7,
            sge,
            operation: SendOperation::Send,
            signaled: true,
        };
        unsafe { a.device.post_send(&a.qp, &request) }.unwrap();

        let completions = poll(&a);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, CompletionStatus::RnrRetryExceeded);
        assert_eq!(completions[0].wr_id, 7);
        assert!(poll(&b).is_empty());
    }

    #[test]
    fn remote_read_needs_remote_access_on_the_target() {
        let fabric = SoftFabric::new();
        let (a, b) = (endpoint(&fabric, "a"), endpoint(&fabric, "b"));
        connect(&a, &b, AccessFlags::LOCAL_WRITE);

        let mut exposed = [7u8; 8];
        let (mr, _) = register(&b.device, &mut exposed, AccessFlags::LOCAL_WRITE);
        let mut target = [0u8; 8];
        let (_local, sge) = register(&a.device, &mut target, AccessFlags::LOCAL_WRITE);

        let request = SendRequest {
            wr_id: 1,
            sge,
            operation: SendOperation::RemoteRead {
                remote_addr: exposed.as_ptr() as u64,
                rkey: b.device.memory_keys(&mr).rkey,
            },
            signaled: true,
        };
        unsafe { a.device.post_send(&a.qp, &request) }.unwrap();

        assert_eq!(poll(&a)[0].status, CompletionStatus::RemoteAccess);
        assert_eq!(target, [0u8; 8]);
        // The failed QP refuses further sends.
        assert!(unsafe { a.device.post_send(&a.qp, &request) }.is_err());
    }

    #[test]
    fn receives_are_flushed_when_the_qp_fails() {
        let fabric = SoftFabric::new();
        let a = endpoint(&fabric, "a");
        init(&a, AccessFlags::LOCAL_WRITE);

        let mut buf = [0u8; 4];
        let (_mr, sge) = register(&a.device, &mut buf, AccessFlags::LOCAL_WRITE);
        unsafe { a.device.post_receive(&a.qp, &ReceiveRequest { wr_id: 3, sge }) }.unwrap();
        a.device.modify_qp(&a.qp, &QueuePairAttributes::Error).unwrap();

        let completions = poll(&a);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, CompletionStatus::Flushed);
        assert_eq!(completions[0].opcode, None);
    }

    fn read_request(sge: ScatterEntry, exposed: &[u8], rkey: u32) -> SendRequest {
        SendRequest {
            wr_id: 9,
            sge,
            operation: SendOperation::RemoteRead {
                remote_addr: exposed.as_ptr() as u64,
                rkey,
            },
            signaled: true,
        }
    }

    #[test]
    fn queued_read_is_flushed_when_the_reader_fails() {
        let fabric = SoftFabric::new();
        let (a, b) = (endpoint(&fabric, "a"), endpoint(&fabric, "b"));
        let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ;
        init(&a, AccessFlags::LOCAL_WRITE);
        init(&b, access);
        ready(&a, &b);

        let mut exposed = [7u8; 8];
        let (mr, _) = register(&b.device, &mut exposed, access);
        let mut target = [0u8; 8];
        let (_local, sge) = register(&a.device, &mut target, AccessFlags::LOCAL_WRITE);
        let request = read_request(sge, &exposed, b.device.memory_keys(&mr).rkey);
        unsafe { a.device.post_send(&a.qp, &request) }.unwrap();
        assert!(poll(&a).is_empty());

        a.device.modify_qp(&a.qp, &QueuePairAttributes::Error).unwrap();
        let completions = poll(&a);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].wr_id, 9);
        assert_eq!(completions[0].status, CompletionStatus::Flushed);

        // The peer reaching RTR later finds nothing left to execute.
        ready(&b, &a);
        assert_eq!(target, [0u8; 8]);
        assert!(poll(&a).is_empty());
    }

    #[test]
    fn queued_read_into_a_released_buffer_is_refused() {
        let fabric = SoftFabric::new();
        let (a, b) = (endpoint(&fabric, "a"), endpoint(&fabric, "b"));
        let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ;
        init(&a, AccessFlags::LOCAL_WRITE);
        init(&b, access);
        ready(&a, &b);

        let mut exposed = [7u8; 8];
        let (mr, _) = register(&b.device, &mut exposed, access);
        let mut target = [0u8; 8];
        let (local, sge) = register(&a.device, &mut target, AccessFlags::LOCAL_WRITE);
        let request = read_request(sge, &exposed, b.device.memory_keys(&mr).rkey);
        unsafe { a.device.post_send(&a.qp, &request) }.unwrap();
        a.device.deregister_memory(local).unwrap();

        ready(&b, &a);
        assert_eq!(target, [0u8; 8]);
        assert_eq!(poll(&a)[0].status, CompletionStatus::LocalProtection);
    }

    #[test]
    fn pinned_memory_is_limited_per_device() {
        let fabric = SoftFabric::new();
        let mut config = SoftDeviceConfig::named("small");
        config.max_pinned_bytes = 8;
        let device = fabric.open_device_with(config);

        let mut buf = [0u8; 8];
        let mr = unsafe { device.register_memory(buf.as_mut_ptr(), 8, AccessFlags::empty()) }
            .unwrap();
        let err = unsafe { device.register_memory(buf.as_mut_ptr(), 1, AccessFlags::empty()) }
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);

        device.deregister_memory(mr).unwrap();
        let again = unsafe { device.register_memory(buf.as_mut_ptr(), 8, AccessFlags::empty()) };
        assert!(again.is_ok());
    }
}
