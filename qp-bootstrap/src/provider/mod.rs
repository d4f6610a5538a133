//! The boundary to an RDMA provider.
//!
//! [`Provider`] is the small subset of the verbs interface the bootstrap
//! needs: one device context with one protection domain, completion queues,
//! reliable-connection queue pairs and memory registrations. Providers
//! report failures as errno-carrying [`io::Error`]s, the way the verbs calls
//! themselves do.

pub mod soft;
#[cfg(feature = "verbs")]
pub mod verbs;

use crate::config::{ConnectionTuning, Mtu, RoutingMode};
use crate::error::{RdmaError, Result, SetupPhase};
use crate::memory::AccessFlags;
use crate::state::ConnectionState;
use std::{fmt, io, sync::Arc};
use tracing::debug;

/// 128-bit network identity of a port.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gid([u8; 16]);

impl Gid {
    pub const ZERO: Gid = Gid([0; 16]);

    pub const fn new(raw: [u8; 16]) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 16]
    }

    pub fn subnet_prefix(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().unwrap_or_default())
    }

    pub fn interface_id(&self) -> u64 {
        u64::from_be_bytes(self.0[8..].try_into().unwrap_or_default())
    }
}

impl From<[u8; 16]> for Gid {
    fn from(raw: [u8; 16]) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Down,
    Init,
    Armed,
    Active,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttributes {
    pub state: PortState,
    pub max_mtu: Mtu,
    pub active_mtu: Mtu,
    pub lid: u16,
}

impl PortAttributes {
    pub fn is_usable(&self) -> bool {
        matches!(self.state, PortState::Active | PortState::Armed)
    }
}

/// Send and receive queue sizes requested at queue pair creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePairCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

impl From<&ConnectionTuning> for QueuePairCaps {
    fn from(tuning: &ConnectionTuning) -> Self {
        Self {
            max_send_wr: tuning.max_send_wr,
            max_recv_wr: tuning.max_recv_wr,
            max_send_sge: tuning.max_sge,
            max_recv_sge: tuning.max_sge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalRoute {
    pub dgid: Gid,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

/// Where the queue pair sends its packets once it reaches RTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressVector {
    pub port_num: u8,
    pub dlid: u16,
    pub service_level: u8,
    pub global: Option<GlobalRoute>,
}

/// One state transition's attribute set; the variant selects the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePairAttributes {
    Init {
        port_num: u8,
        pkey_index: u16,
        access: AccessFlags,
    },
    ReadyToReceive {
        path_mtu: Mtu,
        dest_qp_num: u32,
        rq_psn: u32,
        max_dest_rd_atomic: u8,
        min_rnr_timer: u8,
        av: AddressVector,
    },
    ReadyToSend {
        timeout: u8,
        retry_cnt: u8,
        rnr_retry: u8,
        sq_psn: u32,
        max_rd_atomic: u8,
    },
    Error,
}

impl QueuePairAttributes {
    pub fn target(&self) -> ConnectionState {
        match self {
            Self::Init { .. } => ConnectionState::Init,
            Self::ReadyToReceive { .. } => ConnectionState::ReadyToReceive,
            Self::ReadyToSend { .. } => ConnectionState::ReadyToSend,
            Self::Error => ConnectionState::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterEntry {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOperation {
    Send,
    RemoteRead { remote_addr: u64, rkey: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRequest {
    pub wr_id: u64,
    pub sge: ScatterEntry,
    pub operation: SendOperation,
    pub signaled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub wr_id: u64,
    pub sge: ScatterEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Send,
    Receive,
    RemoteRead,
}

impl Opcode {
    /// Whether work of this kind is queued on the send queue.
    pub fn is_send_side(self) -> bool {
        !matches!(self, Self::Receive)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Send => "SEND",
            Self::Receive => "RECV",
            Self::RemoteRead => "RDMA READ",
        })
    }
}

/// Work completion status, numbered like `enum ibv_wc_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    Success,
    LocalLength,
    LocalProtection,
    Flushed,
    RemoteInvalidRequest,
    RemoteAccess,
    RemoteOperation,
    RetryExceeded,
    RnrRetryExceeded,
    Other(u32),
}

impl CompletionStatus {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::LocalLength,
            4 => Self::LocalProtection,
            5 => Self::Flushed,
            9 => Self::RemoteInvalidRequest,
            10 => Self::RemoteAccess,
            11 => Self::RemoteOperation,
            12 => Self::RetryExceeded,
            13 => Self::RnrRetryExceeded,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::LocalLength => 1,
            Self::LocalProtection => 4,
            Self::Flushed => 5,
            Self::RemoteInvalidRequest => 9,
            Self::RemoteAccess => 10,
            Self::RemoteOperation => 11,
            Self::RetryExceeded => 12,
            Self::RnrRetryExceeded => 13,
            Self::Other(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::LocalLength => f.write_str("local length error"),
            Self::LocalProtection => f.write_str("local protection error"),
            Self::Flushed => f.write_str("work request flushed"),
            Self::RemoteInvalidRequest => f.write_str("remote invalid request error"),
            Self::RemoteAccess => f.write_str("remote access error"),
            Self::RemoteOperation => f.write_str("remote operation error"),
            Self::RetryExceeded => f.write_str("transport retry counter exceeded"),
            Self::RnrRetryExceeded => f.write_str("RNR retry counter exceeded"),
            Self::Other(code) => write!(f, "status {code}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub wr_id: u64,
    pub status: CompletionStatus,
    /// Only reliable on successful completions.
    pub opcode: Option<Opcode>,
    pub byte_len: u32,
    pub qp_num: u32,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryKeys {
    pub lkey: u32,
    pub rkey: u32,
}

/// An opened device: context, one port table and one protection domain.
///
/// Handles are owned by the caller and release their resource on drop,
/// except memory regions which go back through [`Provider::deregister_memory`].
pub trait Provider: Send + Sync + 'static {
    type CompletionQueue: Send;
    type QueuePair: Send;
    type MemoryRegion: Send;

    fn device_name(&self) -> &str;

    fn port_attributes(&self, port_num: u8) -> io::Result<PortAttributes>;

    fn query_gid(&self, port_num: u8, index: u8) -> io::Result<Gid>;

    /// Largest `max_dest_rd_atomic` the device accepts.
    fn max_qp_rd_atom(&self) -> u8;

    fn create_cq(&self, depth: u32) -> io::Result<Self::CompletionQueue>;

    /// Creates a reliable-connection queue pair in RESET, with both of its
    /// queues feeding `cq`.
    fn create_qp(
        &self,
        cq: &Self::CompletionQueue,
        caps: QueuePairCaps,
    ) -> io::Result<Self::QueuePair>;

    fn qp_num(&self, qp: &Self::QueuePair) -> u32;

    fn modify_qp(&self, qp: &Self::QueuePair, attributes: &QueuePairAttributes) -> io::Result<()>;

    /// # Safety
    ///
    /// `addr..addr + len` must stay valid and pinned in place until the
    /// returned region is passed to [`Provider::deregister_memory`].
    unsafe fn register_memory(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<Self::MemoryRegion>;

    fn memory_keys(&self, mr: &Self::MemoryRegion) -> MemoryKeys;

    fn deregister_memory(&self, mr: Self::MemoryRegion) -> io::Result<()>;

    /// # Safety
    ///
    /// The memory behind `request.sge` must stay registered and must not be
    /// accessed until the request completes.
    unsafe fn post_send(&self, qp: &Self::QueuePair, request: &SendRequest) -> io::Result<()>;

    /// # Safety
    ///
    /// Same contract as [`Provider::post_send`].
    unsafe fn post_receive(&self, qp: &Self::QueuePair, request: &ReceiveRequest)
    -> io::Result<()>;

    /// Appends at most `max` completions to `out`, returning how many.
    fn poll_cq(
        &self,
        cq: &Self::CompletionQueue,
        max: usize,
        out: &mut Vec<Completion>,
    ) -> io::Result<usize>;
}

/// Shared handle to an opened provider.
///
/// Every resource of one connection is created through the same context;
/// cloning is cheap and keeps the device open.
pub struct ProviderContext<P: Provider> {
    provider: Arc<P>,
}

impl<P: Provider> Clone for ProviderContext<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
        }
    }
}

impl<P: Provider> ProviderContext<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Network identity to publish for `routing`.
    ///
    /// Global routing needs a usable port and its GID at `gid_index`; local
    /// routing is addressed by LID and publishes an all-zero GID.
    pub fn local_identity(&self, routing: RoutingMode, tuning: &ConnectionTuning) -> Result<Gid> {
        let port = self
            .provider
            .port_attributes(tuning.port_num)
            .map_err(|source| RdmaError::Setup {
                phase: SetupPhase::PortQuery,
                source,
            })?;
        if !port.is_usable() {
            return Err(RdmaError::Setup {
                phase: SetupPhase::PortQuery,
                source: io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("port {} is {:?}", tuning.port_num, port.state),
                ),
            });
        }
        debug!(device = self.provider.device_name(), ?port, "port attributes");

        match routing {
            RoutingMode::LocalOnly => Ok(Gid::ZERO),
            RoutingMode::GlobalRouted => self
                .provider
                .query_gid(tuning.port_num, tuning.gid_index)
                .map_err(|source| RdmaError::Setup {
                    phase: SetupPhase::GidQuery,
                    source,
                }),
        }
    }
}
