//! Bootstraps a single reliable-connection queue pair between two hosts and
//! moves one payload across it.
//!
//! The two peers swap a fixed-size [`EndpointDescriptor`] over TCP, climb the
//! queue pair through `INIT -> RTR -> RTS` and then either run a two-sided
//! send/receive or a one-sided remote read. Every RDMA resource is reached
//! through a [`Provider`]: [`provider::soft`] is an in-process fabric used by
//! tests and `--loopback`, `provider::verbs` (feature `verbs`) drives real
//! hardware through `ibverbs-sys`.

pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod memory;
pub mod provider;
pub mod role;
pub mod state;

pub use config::{ConnectionTuning, Mtu, ReadNotify, RoutingMode, SessionConfig, TransferMode};
pub use descriptor::{DESCRIPTOR_LEN, EndpointDescriptor, Role, exchange_descriptors};
pub use engine::{TransferEngine, WorkToken};
pub use error::{RdmaError, Result};
pub use memory::{AccessFlags, MemoryRegistrar, Registration, RemoteRegion};
pub use provider::{Provider, ProviderContext};
pub use role::{Initiator, Responder, TransferReport};
pub use state::{ConnectionState, ConnectionStateMachine};

/// Out-of-band TCP port both roles agree on.
pub const DEFAULT_PORT: u16 = 18515;
