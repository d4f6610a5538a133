use crate::engine::WorkToken;
use crate::provider::{CompletionStatus, Opcode};
use crate::state::ConnectionState;
use std::time::Duration;
use std::{fmt, io};

pub type Result<T, E = RdmaError> = std::result::Result<T, E>;

/// Resource set-up step that failed before any connection state exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupPhase {
    Device,
    PortQuery,
    GidQuery,
    CompletionQueue,
    QueuePair,
}

impl fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Device => "open device",
            Self::PortQuery => "query port",
            Self::GidQuery => "query GID",
            Self::CompletionQueue => "create completion queue",
            Self::QueuePair => "create queue pair",
        })
    }
}

/// Out-of-band step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Listen,
    Accept,
    Connect,
    Configure,
    WriteDescriptor,
    ReadDescriptor,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Listen => "listen",
            Self::Accept => "accept",
            Self::Connect => "connect",
            Self::Configure => "configure channel",
            Self::WriteDescriptor => "write descriptor",
            Self::ReadDescriptor => "read descriptor",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RdmaError {
    #[error("failed to {phase}")]
    Setup {
        phase: SetupPhase,
        #[source]
        source: io::Error,
    },

    #[error("failed to register {len} bytes")]
    Registration {
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to deregister memory")]
    Deregistration {
        #[source]
        source: io::Error,
    },

    #[error("handshake failed to {step}")]
    Handshake {
        step: HandshakeStep,
        #[source]
        source: io::Error,
    },

    #[error("failed to modify QP state from {from} to {to}")]
    StateTransition {
        from: ConnectionState,
        to: ConnectionState,
        #[source]
        source: io::Error,
    },

    #[error("cannot move QP to {to} while in {from}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("cannot post {operation} while QP is in {state}")]
    InvalidState {
        operation: Opcode,
        state: ConnectionState,
    },

    #[error("failed to post {operation}")]
    Post {
        operation: Opcode,
        #[source]
        source: io::Error,
    },

    #[error("failed to poll completion queue")]
    Poll {
        #[source]
        source: io::Error,
    },

    #[error("work completion error for {token}: {status} (opcode {opcode:?})")]
    Completion {
        token: WorkToken,
        status: CompletionStatus,
        opcode: Option<Opcode>,
    },

    #[error("no completion for {token} after {waited:?}")]
    Timeout { token: WorkToken, waited: Duration },

    #[error("{0} is not outstanding")]
    UnknownToken(WorkToken),

    #[error("{0} is unsignaled and never completes on its own")]
    Unsignaled(WorkToken),

    #[error("{len} bytes at offset {offset} do not fit a region of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("peer did not publish a remote-readable region")]
    MissingRemoteRegion,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RdmaError {
    /// Status of a failed completion, if this error carries one.
    pub fn completion_status(&self) -> Option<CompletionStatus> {
        match self {
            Self::Completion { status, .. } => Some(*status),
            _ => None,
        }
    }
}
