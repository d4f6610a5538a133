use crate::config::{ConnectionTuning, RoutingMode};
use crate::descriptor::EndpointDescriptor;
use crate::error::{RdmaError, Result, SetupPhase};
use crate::memory::AccessFlags;
use crate::provider::{
    AddressVector, GlobalRoute, Provider, ProviderContext, QueuePairAttributes, QueuePairCaps,
};
use std::fmt;
use tracing::{error, info, instrument, warn};

/// Lifecycle of a reliable-connection queue pair.
///
/// States are ordered along the climb, with `Error` last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

impl ConnectionState {
    pub fn can_post_receive(self) -> bool {
        matches!(self, Self::Init | Self::ReadyToReceive | Self::ReadyToSend)
    }

    pub fn can_post_send(self) -> bool {
        self == Self::ReadyToSend
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reset => "RESET",
            Self::Init => "INIT",
            Self::ReadyToReceive => "RTR",
            Self::ReadyToSend => "RTS",
            Self::Error => "ERROR",
        })
    }
}

/// Owns one queue pair and walks it through `RESET -> INIT -> RTR -> RTS`.
///
/// Each transition succeeds at most once. A transition the provider rejects
/// leaves the queue pair in `ERROR`, which is terminal.
pub struct ConnectionStateMachine<P: Provider> {
    ctx: ProviderContext<P>,
    qp: P::QueuePair,
    qp_num: u32,
    state: ConnectionState,
    remote_qp_num: Option<u32>,
}

impl<P: Provider> ConnectionStateMachine<P> {
    /// Creates a queue pair in `RESET` whose queues complete into `cq`.
    pub fn create(
        ctx: &ProviderContext<P>,
        cq: &P::CompletionQueue,
        tuning: &ConnectionTuning,
    ) -> Result<Self> {
        let provider = ctx.provider();
        let qp = provider
            .create_qp(cq, QueuePairCaps::from(tuning))
            .map_err(|source| RdmaError::Setup {
                phase: SetupPhase::QueuePair,
                source,
            })?;
        let qp_num = provider.qp_num(&qp);
        info!(qp_num, device = provider.device_name(), "created QP");

        Ok(Self {
            ctx: ctx.clone(),
            qp,
            qp_num,
            state: ConnectionState::Reset,
            remote_qp_num: None,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    /// The queue pair this one is bound to, once it reached RTR.
    pub fn remote_qp_num(&self) -> Option<u32> {
        self.remote_qp_num
    }

    pub(crate) fn queue_pair(&self) -> &P::QueuePair {
        &self.qp
    }

    /// `access` governs which operations the peer may issue against this QP.
    #[instrument(skip_all, fields(qp_num = self.qp_num), err)]
    pub fn to_init(&mut self, tuning: &ConnectionTuning, access: AccessFlags) -> Result<()> {
        self.transition(
            ConnectionState::Reset,
            QueuePairAttributes::Init {
                port_num: tuning.port_num,
                pkey_index: tuning.pkey_index,
                access,
            },
        )
    }

    #[instrument(
        skip_all,
        fields(qp_num = self.qp_num, remote_qp_num = remote.queue_identity, %routing),
        err
    )]
    pub fn to_ready_to_receive(
        &mut self,
        remote: &EndpointDescriptor,
        routing: RoutingMode,
        tuning: &ConnectionTuning,
    ) -> Result<()> {
        let global = match routing {
            RoutingMode::GlobalRouted => Some(GlobalRoute {
                dgid: remote.network_identity,
                sgid_index: tuning.gid_index,
                hop_limit: tuning.hop_limit,
                traffic_class: tuning.traffic_class,
            }),
            RoutingMode::LocalOnly => None,
        };
        let max_dest_rd_atomic = tuning
            .max_dest_rd_atomic
            .min(self.ctx.provider().max_qp_rd_atom());

        self.transition(
            ConnectionState::Init,
            QueuePairAttributes::ReadyToReceive {
                path_mtu: tuning.path_mtu,
                dest_qp_num: remote.queue_identity,
                rq_psn: tuning.start_psn,
                max_dest_rd_atomic,
                min_rnr_timer: tuning.min_rnr_timer,
                av: AddressVector {
                    port_num: tuning.port_num,
                    dlid: tuning.dlid,
                    service_level: tuning.service_level,
                    global,
                },
            },
        )?;
        self.remote_qp_num = Some(remote.queue_identity);
        Ok(())
    }

    #[instrument(skip_all, fields(qp_num = self.qp_num), err)]
    pub fn to_ready_to_send(&mut self, tuning: &ConnectionTuning) -> Result<()> {
        self.transition(
            ConnectionState::ReadyToReceive,
            QueuePairAttributes::ReadyToSend {
                timeout: tuning.timeout,
                retry_cnt: tuning.retry_cnt,
                rnr_retry: tuning.rnr_retry,
                sq_psn: tuning.start_psn,
                max_rd_atomic: tuning.max_rd_atomic,
            },
        )
    }

    /// Both halves of the climb once the peer's descriptor is known.
    pub fn connect(
        &mut self,
        remote: &EndpointDescriptor,
        routing: RoutingMode,
        tuning: &ConnectionTuning,
    ) -> Result<()> {
        self.to_ready_to_receive(remote, routing, tuning)?;
        self.to_ready_to_send(tuning)
    }

    fn transition(&mut self, from: ConnectionState, attributes: QueuePairAttributes) -> Result<()> {
        let to = attributes.target();
        if self.state != from {
            return Err(RdmaError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        match self.ctx.provider().modify_qp(&self.qp, &attributes) {
            Ok(()) => {
                self.state = to;
                info!("QP -> {to}");
                Ok(())
            }
            Err(source) => {
                error!("failed to modify QP to {to}: {source}");
                self.enter_error();
                Err(RdmaError::StateTransition { from, to, source })
            }
        }
    }

    /// Moves the queue pair to `ERROR`; flushes anything still posted.
    pub fn enter_error(&mut self) {
        if self.state == ConnectionState::Error {
            return;
        }
        if let Err(e) = self
            .ctx
            .provider()
            .modify_qp(&self.qp, &QueuePairAttributes::Error)
        {
            warn!(qp_num = self.qp_num, "failed to move QP to ERROR: {e}");
        }
        self.state = ConnectionState::Error;
    }

    /// Records that the provider already failed the queue pair.
    pub(crate) fn observe_error(&mut self) {
        if self.state != ConnectionState::Error {
            warn!(qp_num = self.qp_num, "QP entered ERROR after a failed completion");
            self.state = ConnectionState::Error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Gid;
    use crate::provider::soft::{SoftDevice, SoftDeviceConfig, SoftFabric};

    type Cq = <SoftDevice as Provider>::CompletionQueue;

    fn machine(device: SoftDevice) -> (ConnectionStateMachine<SoftDevice>, Cq) {
        let ctx = ProviderContext::new(device);
        let cq = ctx.provider().create_cq(16).unwrap();
        let tuning = ConnectionTuning::default();
        let machine = ConnectionStateMachine::create(&ctx, &cq, &tuning).unwrap();
        (machine, cq)
    }

    fn peer(qp_num: u32, gid: Gid) -> EndpointDescriptor {
        EndpointDescriptor {
            queue_identity: qp_num,
            remote_access_key: 0,
            buffer_address: 0,
            network_identity: gid,
        }
    }

    #[test]
    fn climbs_forward_once() {
        let fabric = SoftFabric::new();
        let remote_gid = fabric.open_device("remote").query_gid(1, 1).unwrap();
        let (mut qp, _cq) = machine(fabric.open_device("local"));
        let tuning = ConnectionTuning::default();
        let remote = peer(0x42, remote_gid);

        assert_eq!(qp.state(), ConnectionState::Reset);
        qp.to_init(&tuning, AccessFlags::LOCAL_WRITE).unwrap();
        assert!(matches!(
            qp.to_init(&tuning, AccessFlags::LOCAL_WRITE),
            Err(RdmaError::InvalidTransition {
                from: ConnectionState::Init,
                to: ConnectionState::Init,
            })
        ));
        assert_eq!(qp.state(), ConnectionState::Init);

        qp.connect(&remote, RoutingMode::GlobalRouted, &tuning).unwrap();
        assert_eq!(qp.state(), ConnectionState::ReadyToSend);
        assert_eq!(qp.remote_qp_num(), Some(0x42));
        assert!(qp.to_ready_to_send(&tuning).is_err());
        assert_eq!(qp.state(), ConnectionState::ReadyToSend);
    }

    #[test]
    fn cannot_skip_states() {
        let fabric = SoftFabric::new();
        let (mut qp, _cq) = machine(fabric.open_device("local"));
        let tuning = ConnectionTuning::default();

        assert!(matches!(
            qp.to_ready_to_send(&tuning),
            Err(RdmaError::InvalidTransition { from: ConnectionState::Reset, .. })
        ));
        let remote = peer(2, Gid::ZERO);
        assert!(qp.to_ready_to_receive(&remote, RoutingMode::LocalOnly, &tuning).is_err());
        assert_eq!(qp.state(), ConnectionState::Reset);
    }

    #[test]
    fn rejected_attributes_land_in_error() {
        let fabric = SoftFabric::new();
        let mut config = SoftDeviceConfig::named("local");
        config.remote_access = false;
        let (mut qp, _cq) = machine(fabric.open_device_with(config));
        let tuning = ConnectionTuning::default();

        let err = qp
            .to_init(&tuning, AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ)
            .unwrap_err();
        assert!(matches!(
            err,
            RdmaError::StateTransition {
                from: ConnectionState::Reset,
                to: ConnectionState::Init,
                ..
            }
        ));
        assert_eq!(qp.state(), ConnectionState::Error);
        assert!(qp.to_init(&tuning, AccessFlags::LOCAL_WRITE).is_err());
        assert_eq!(qp.state(), ConnectionState::Error);
    }

    #[test]
    fn path_mtu_above_the_port_limit_fails_rtr() {
        let fabric = SoftFabric::new();
        let mut config = SoftDeviceConfig::named("local");
        config.max_mtu = crate::config::Mtu::Mtu1024;
        let (mut qp, _cq) = machine(fabric.open_device_with(config));
        let tuning = ConnectionTuning {
            path_mtu: crate::config::Mtu::Mtu4096,
            ..ConnectionTuning::default()
        };

        qp.to_init(&tuning, AccessFlags::LOCAL_WRITE).unwrap();
        let gid = fabric.open_device("remote").query_gid(1, 1).unwrap();
        assert!(qp.connect(&peer(9, gid), RoutingMode::GlobalRouted, &tuning).is_err());
        assert_eq!(qp.state(), ConnectionState::Error);
        assert_eq!(qp.remote_qp_num(), None);
    }

    #[test]
    fn local_routing_skips_the_global_route() {
        let fabric = SoftFabric::new();
        let (mut qp, _cq) = machine(fabric.open_device("local"));
        let tuning = ConnectionTuning::default();

        qp.to_init(&tuning, AccessFlags::LOCAL_WRITE).unwrap();
        // An all-zero GID would be rejected inside a global route.
        qp.connect(&peer(3, Gid::ZERO), RoutingMode::LocalOnly, &tuning).unwrap();
        assert_eq!(qp.state(), ConnectionState::ReadyToSend);
    }
}
