//! Hardware provider on top of the `libibverbs` bindings.

use super::{
    Completion, CompletionStatus, Gid, MemoryKeys, Opcode, PortAttributes, PortState, Provider,
    QueuePairAttributes, QueuePairCaps, ReceiveRequest, SendOperation, SendRequest,
};
use crate::config::Mtu;
use crate::memory::AccessFlags;
use std::ffi::CStr;
use std::{io, mem, ptr, slice};
use tracing::{debug, warn};

/// Work completions fetched per `ibv_poll_cq` call.
const WC_BATCH: usize = 16;

/// One opened device with its protection domain.
pub struct VerbsDevice {
    ctx: *mut ffi::ibv_context,
    pd: *mut ffi::ibv_pd,
    name: String,
    max_qp_rd_atom: u8,
}

// The verbs context and PD are thread-safe per libibverbs.
unsafe impl Send for VerbsDevice {}
unsafe impl Sync for VerbsDevice {}

impl VerbsDevice {
    /// Opens the `index`-th RDMA device and allocates a protection domain.
    pub fn open(index: usize) -> io::Result<Self> {
        let mut n = 0i32;
        let list = unsafe { ffi::ibv_get_device_list(&mut n as *mut _) };
        if list.is_null() {
            return Err(io::Error::last_os_error());
        }
        let devices = unsafe { slice::from_raw_parts(list, n as usize) };
        let opened = devices
            .get(index)
            .copied()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no RDMA device at index {index} ({n} found)"),
                )
            })
            .and_then(|dev| unsafe { Self::open_device(dev) });
        unsafe { ffi::ibv_free_device_list(list) };
        opened
    }

    unsafe fn open_device(dev: *mut ffi::ibv_device) -> io::Result<Self> {
        let name = unsafe { CStr::from_ptr(ffi::ibv_get_device_name(dev)) }
            .to_string_lossy()
            .into_owned();
        let ctx = unsafe { ffi::ibv_open_device(dev) };
        if ctx.is_null() {
            return Err(io::Error::other(format!("failed to open device {name}")));
        }

        let mut device_attr = ffi::ibv_device_attr::default();
        let errno = unsafe { ffi::ibv_query_device(ctx, &mut device_attr) };
        if errno != 0 {
            unsafe { ffi::ibv_close_device(ctx) };
            return Err(io::Error::from_raw_os_error(errno));
        }

        let pd = unsafe { ffi::ibv_alloc_pd(ctx) };
        if pd.is_null() {
            let err = io::Error::last_os_error();
            unsafe { ffi::ibv_close_device(ctx) };
            return Err(err);
        }

        debug!(%name, max_qp_rd_atom = device_attr.max_qp_rd_atom, "opened device");
        Ok(Self {
            ctx,
            pd,
            name,
            max_qp_rd_atom: device_attr.max_qp_rd_atom.clamp(0, u8::MAX as i32) as u8,
        })
    }
}

impl Drop for VerbsDevice {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_dealloc_pd(self.pd) };
        if errno != 0 {
            warn!("ibv_dealloc_pd: {}", io::Error::from_raw_os_error(errno));
        }
        let errno = unsafe { ffi::ibv_close_device(self.ctx) };
        if errno != 0 {
            warn!("ibv_close_device: {}", io::Error::from_raw_os_error(errno));
        }
    }
}

pub struct VerbsCompletionQueue(*mut ffi::ibv_cq);

unsafe impl Send for VerbsCompletionQueue {}

impl Drop for VerbsCompletionQueue {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_destroy_cq(self.0) };
        if errno != 0 {
            warn!("ibv_destroy_cq: {}", io::Error::from_raw_os_error(errno));
        }
    }
}

pub struct VerbsQueuePair(*mut ffi::ibv_qp);

unsafe impl Send for VerbsQueuePair {}

impl Drop for VerbsQueuePair {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_destroy_qp(self.0) };
        if errno != 0 {
            warn!("ibv_destroy_qp: {}", io::Error::from_raw_os_error(errno));
        }
    }
}

pub struct VerbsMemoryRegion(*mut ffi::ibv_mr);

unsafe impl Send for VerbsMemoryRegion {}

fn check(errno: i32) -> io::Result<()> {
    if errno == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(errno))
    }
}

fn missing_op(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("provider does not implement {name}"),
    )
}

fn to_verbs_mtu(mtu: Mtu) -> ffi::ibv_mtu {
    match mtu {
        Mtu::Mtu256 => ffi::ibv_mtu::IBV_MTU_256,
        Mtu::Mtu512 => ffi::ibv_mtu::IBV_MTU_512,
        Mtu::Mtu1024 => ffi::ibv_mtu::IBV_MTU_1024,
        Mtu::Mtu2048 => ffi::ibv_mtu::IBV_MTU_2048,
        Mtu::Mtu4096 => ffi::ibv_mtu::IBV_MTU_4096,
    }
}

fn from_verbs_mtu(mtu: ffi::ibv_mtu) -> Mtu {
    match mtu {
        ffi::ibv_mtu::IBV_MTU_256 => Mtu::Mtu256,
        ffi::ibv_mtu::IBV_MTU_512 => Mtu::Mtu512,
        ffi::ibv_mtu::IBV_MTU_2048 => Mtu::Mtu2048,
        ffi::ibv_mtu::IBV_MTU_4096 => Mtu::Mtu4096,
        _ => Mtu::Mtu1024,
    }
}

fn to_verbs_gid(gid: Gid) -> ffi::ibv_gid {
    let mut raw: ffi::ibv_gid = unsafe { mem::zeroed() };
    raw.raw = *gid.raw();
    raw
}

impl Provider for VerbsDevice {
    type CompletionQueue = VerbsCompletionQueue;
    type QueuePair = VerbsQueuePair;
    type MemoryRegion = VerbsMemoryRegion;

    fn device_name(&self) -> &str {
        &self.name
    }

    fn port_attributes(&self, port_num: u8) -> io::Result<PortAttributes> {
        let mut port_attr = ffi::ibv_port_attr::default();
        check(unsafe {
            ffi::ibv_query_port(
                self.ctx,
                port_num,
                &mut port_attr as *mut ffi::ibv_port_attr as *mut _,
            )
        })?;
        let state = match port_attr.state {
            ffi::ibv_port_state::IBV_PORT_DOWN => PortState::Down,
            ffi::ibv_port_state::IBV_PORT_INIT => PortState::Init,
            ffi::ibv_port_state::IBV_PORT_ARMED => PortState::Armed,
            ffi::ibv_port_state::IBV_PORT_ACTIVE => PortState::Active,
            _ => PortState::Other,
        };
        Ok(PortAttributes {
            state,
            max_mtu: from_verbs_mtu(port_attr.max_mtu),
            active_mtu: from_verbs_mtu(port_attr.active_mtu),
            lid: port_attr.lid,
        })
    }

    fn query_gid(&self, port_num: u8, index: u8) -> io::Result<Gid> {
        let mut gid: ffi::ibv_gid = unsafe { mem::zeroed() };
        check(unsafe { ffi::ibv_query_gid(self.ctx, port_num, i32::from(index), &mut gid) })?;
        Ok(Gid::new(unsafe { gid.raw }))
    }

    fn max_qp_rd_atom(&self) -> u8 {
        self.max_qp_rd_atom
    }

    fn create_cq(&self, depth: u32) -> io::Result<VerbsCompletionQueue> {
        let cq = unsafe {
            ffi::ibv_create_cq(
                self.ctx,
                depth as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        if cq.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(VerbsCompletionQueue(cq))
    }

    fn create_qp(
        &self,
        cq: &VerbsCompletionQueue,
        caps: QueuePairCaps,
    ) -> io::Result<VerbsQueuePair> {
        let mut attr = ffi::ibv_qp_init_attr {
            qp_context: ptr::null_mut(),
            send_cq: cq.0,
            recv_cq: cq.0,
            srq: ptr::null_mut(),
            cap: ffi::ibv_qp_cap {
                max_send_wr: caps.max_send_wr,
                max_recv_wr: caps.max_recv_wr,
                max_send_sge: caps.max_send_sge,
                max_recv_sge: caps.max_recv_sge,
                max_inline_data: 0,
            },
            qp_type: ffi::ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: 0,
        };
        let qp = unsafe { ffi::ibv_create_qp(self.pd, &mut attr) };
        if qp.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(VerbsQueuePair(qp))
    }

    fn qp_num(&self, qp: &VerbsQueuePair) -> u32 {
        unsafe { (*qp.0).qp_num }
    }

    fn modify_qp(&self, qp: &VerbsQueuePair, attributes: &QueuePairAttributes) -> io::Result<()> {
        let mut attr = ffi::ibv_qp_attr::default();
        let mask = match *attributes {
            QueuePairAttributes::Init {
                port_num,
                pkey_index,
                access,
            } => {
                attr.qp_state = ffi::ibv_qp_state::IBV_QPS_INIT;
                attr.pkey_index = pkey_index;
                attr.port_num = port_num;
                attr.qp_access_flags = access.bits();
                ffi::ibv_qp_attr_mask::IBV_QP_STATE
                    | ffi::ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ffi::ibv_qp_attr_mask::IBV_QP_PORT
                    | ffi::ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS
            }
            QueuePairAttributes::ReadyToReceive {
                path_mtu,
                dest_qp_num,
                rq_psn,
                max_dest_rd_atomic,
                min_rnr_timer,
                av,
            } => {
                attr.qp_state = ffi::ibv_qp_state::IBV_QPS_RTR;
                attr.path_mtu = to_verbs_mtu(path_mtu);
                attr.dest_qp_num = dest_qp_num;
                attr.rq_psn = rq_psn;
                attr.max_dest_rd_atomic = max_dest_rd_atomic;
                attr.min_rnr_timer = min_rnr_timer;
                attr.ah_attr.dlid = av.dlid;
                attr.ah_attr.sl = av.service_level;
                attr.ah_attr.src_path_bits = 0;
                attr.ah_attr.port_num = av.port_num;
                if let Some(grh) = av.global {
                    attr.ah_attr.is_global = 1;
                    attr.ah_attr.grh.dgid = to_verbs_gid(grh.dgid);
                    attr.ah_attr.grh.sgid_index = grh.sgid_index;
                    attr.ah_attr.grh.hop_limit = grh.hop_limit;
                    attr.ah_attr.grh.traffic_class = grh.traffic_class;
                }
                ffi::ibv_qp_attr_mask::IBV_QP_STATE
                    | ffi::ibv_qp_attr_mask::IBV_QP_AV
                    | ffi::ibv_qp_attr_mask::IBV_QP_PATH_MTU
                    | ffi::ibv_qp_attr_mask::IBV_QP_DEST_QPN
                    | ffi::ibv_qp_attr_mask::IBV_QP_RQ_PSN
                    | ffi::ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ffi::ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER
            }
            QueuePairAttributes::ReadyToSend {
                timeout,
                retry_cnt,
                rnr_retry,
                sq_psn,
                max_rd_atomic,
            } => {
                attr.qp_state = ffi::ibv_qp_state::IBV_QPS_RTS;
                attr.timeout = timeout;
                attr.retry_cnt = retry_cnt;
                attr.rnr_retry = rnr_retry;
                attr.sq_psn = sq_psn;
                attr.max_rd_atomic = max_rd_atomic;
                ffi::ibv_qp_attr_mask::IBV_QP_STATE
                    | ffi::ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ffi::ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ffi::ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ffi::ibv_qp_attr_mask::IBV_QP_SQ_PSN
                    | ffi::ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
            }
            QueuePairAttributes::Error => {
                attr.qp_state = ffi::ibv_qp_state::IBV_QPS_ERR;
                ffi::ibv_qp_attr_mask::IBV_QP_STATE
            }
        };
        check(unsafe { ffi::ibv_modify_qp(qp.0, &mut attr, mask.0 as i32) })
    }

    unsafe fn register_memory(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<VerbsMemoryRegion> {
        let mr = unsafe { ffi::ibv_reg_mr(self.pd, addr as *mut _, len, access.bits() as i32) };
        if mr.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(VerbsMemoryRegion(mr))
    }

    fn memory_keys(&self, mr: &VerbsMemoryRegion) -> MemoryKeys {
        let mr = unsafe { &*mr.0 };
        MemoryKeys {
            lkey: mr.lkey,
            rkey: mr.rkey,
        }
    }

    fn deregister_memory(&self, mr: VerbsMemoryRegion) -> io::Result<()> {
        check(unsafe { ffi::ibv_dereg_mr(mr.0) })
    }

    unsafe fn post_send(&self, qp: &VerbsQueuePair, request: &SendRequest) -> io::Result<()> {
        let mut sge = ffi::ibv_sge {
            addr: request.sge.addr,
            length: request.sge.length,
            lkey: request.sge.lkey,
        };
        let opcode = match request.operation {
            SendOperation::Send => ffi::ibv_wr_opcode::IBV_WR_SEND,
            SendOperation::RemoteRead { .. } => ffi::ibv_wr_opcode::IBV_WR_RDMA_READ,
        };
        let mut wr = ffi::ibv_send_wr {
            wr_id: request.wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
            opcode,
            send_flags: if request.signaled {
                ffi::ibv_send_flags::IBV_SEND_SIGNALED.0
            } else {
                0
            },
            wr: Default::default(),
            qp_type: Default::default(),
            __bindgen_anon_1: Default::default(),
            __bindgen_anon_2: Default::default(),
        };
        if let SendOperation::RemoteRead { remote_addr, rkey } = request.operation {
            wr.wr.rdma.remote_addr = remote_addr;
            wr.wr.rdma.rkey = rkey;
        }
        let mut bad_wr: *mut ffi::ibv_send_wr = ptr::null_mut();

        let ctx = unsafe { (*qp.0).context };
        let ops = unsafe { &mut (*ctx).ops };
        let post = ops.post_send.ok_or_else(|| missing_op("post_send"))?;
        check(unsafe { post(qp.0, &mut wr, &mut bad_wr) })
    }

    unsafe fn post_receive(&self, qp: &VerbsQueuePair, request: &ReceiveRequest) -> io::Result<()> {
        let mut sge = ffi::ibv_sge {
            addr: request.sge.addr,
            length: request.sge.length,
            lkey: request.sge.lkey,
        };
        let mut wr = ffi::ibv_recv_wr {
            wr_id: request.wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
        };
        let mut bad_wr: *mut ffi::ibv_recv_wr = ptr::null_mut();

        let ctx = unsafe { (*qp.0).context };
        let ops = unsafe { &mut (*ctx).ops };
        let post = ops.post_recv.ok_or_else(|| missing_op("post_recv"))?;
        check(unsafe { post(qp.0, &mut wr, &mut bad_wr) })
    }

    fn poll_cq(
        &self,
        cq: &VerbsCompletionQueue,
        max: usize,
        out: &mut Vec<Completion>,
    ) -> io::Result<usize> {
        let mut wcs = [ffi::ibv_wc::default(); WC_BATCH];
        let max = max.min(WC_BATCH);
        let ctx = unsafe { (*cq.0).context };
        let ops = unsafe { &mut (*ctx).ops };
        let poll = ops.poll_cq.ok_or_else(|| missing_op("poll_cq"))?;
        let n = unsafe { poll(cq.0, max as i32, wcs.as_mut_ptr()) };
        if n < 0 {
            return Err(io::Error::other("ibv_poll_cq failed"));
        }

        out.extend(wcs[..n as usize].iter().map(completion));
        Ok(n as usize)
    }
}

fn completion(wc: &ffi::ibv_wc) -> Completion {
    let opcode = match wc.opcode {
        ffi::ibv_wc_opcode::IBV_WC_SEND => Some(Opcode::Send),
        ffi::ibv_wc_opcode::IBV_WC_RECV => Some(Opcode::Receive),
        ffi::ibv_wc_opcode::IBV_WC_RDMA_READ => Some(Opcode::RemoteRead),
        _ => None,
    };
    let status = CompletionStatus::from_code(wc.status as u32);
    Completion {
        wr_id: wc.wr_id,
        status,
        opcode: opcode.filter(|_| status.is_success()),
        byte_len: wc.byte_len,
        qp_num: wc.qp_num,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_poll_fits_the_completion_buffer() {
        assert!(crate::engine::POLL_BATCH <= WC_BATCH);
    }

    #[test]
    fn work_completions_are_translated() {
        let mut wc = ffi::ibv_wc::default();
        wc.wr_id = 42;
        wc.opcode = ffi::ibv_wc_opcode::IBV_WC_RDMA_READ;
        wc.status = ffi::ibv_wc_status::IBV_WC_SUCCESS;
        wc.byte_len = 32;
        wc.qp_num = 7;
        let read = completion(&wc);
        assert_eq!(read.wr_id, 42);
        assert_eq!(read.opcode, Some(Opcode::RemoteRead));
        assert_eq!((read.byte_len, read.qp_num), (32, 7));

        wc.status = ffi::ibv_wc_status::IBV_WC_WR_FLUSH_ERR;
        let flushed = completion(&wc);
        assert_eq!(flushed.status, CompletionStatus::Flushed);
        assert_eq!(flushed.opcode, None);
    }
}
