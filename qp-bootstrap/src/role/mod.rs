//! The two sides of a session.
//!
//! Both roles create their resources, climb to INIT, swap descriptors over
//! the out-of-band channel, finish the climb and run one transfer. Buffers
//! are registered before the queue pair is created so the queue pair is
//! always torn down first.

mod initiator;
mod responder;

pub use initiator::Initiator;
pub use responder::Responder;

use crate::config::{RoutingMode, SessionConfig, TransferMode};
use crate::descriptor::{EndpointDescriptor, Role, exchange_descriptors};
use crate::engine::TransferEngine;
use crate::error::{HandshakeStep, RdmaError, Result};
use crate::provider::Provider;
use std::borrow::Cow;
use std::io::{Read, Write};
use std::net::TcpStream;
use tracing::info;

/// Sent by the initiator once its remote read completed.
pub const READ_DONE: &[u8] = b"READ_DONE\0";

/// Outcome of one session, as seen by one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub role: Role,
    pub transfer: TransferMode,
    pub routing: RoutingMode,
    pub local_qp_num: u32,
    pub remote_qp_num: u32,
    /// Bytes received, sent or read, depending on role and mode.
    pub byte_len: usize,
    /// Received or read bytes; the exposed contents on a read responder.
    pub payload: Vec<u8>,
}

impl TransferReport {
    /// The payload as text, without its trailing NUL terminators.
    pub fn payload_text(&self) -> Cow<'_, str> {
        let end = self
            .payload
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        String::from_utf8_lossy(&self.payload[..end])
    }
}

fn configure_stream(stream: &TcpStream, config: &SessionConfig) -> Result<()> {
    stream
        .set_nodelay(true)
        .and_then(|()| stream.set_read_timeout(config.handshake_timeout))
        .and_then(|()| stream.set_write_timeout(config.handshake_timeout))
        .map_err(|source| RdmaError::Handshake {
            step: HandshakeStep::Configure,
            source,
        })
}

/// Exchanges descriptors and moves the queue pair on to RTS.
fn handshake<P: Provider, S: Read + Write>(
    engine: &mut TransferEngine<P>,
    channel: &mut S,
    local: &EndpointDescriptor,
    role: Role,
    config: &SessionConfig,
) -> Result<EndpointDescriptor> {
    let remote = exchange_descriptors(channel, local, role)?;
    info!(
        remote_qp_num = remote.queue_identity,
        remote_gid = %remote.network_identity,
        "Remote QP"
    );
    engine
        .connection_mut()
        .connect(&remote, config.routing, &config.tuning)?;
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_text_drops_the_terminator() {
        let report = TransferReport {
            role: Role::Responder,
            transfer: TransferMode::SendRecv,
            routing: RoutingMode::GlobalRouted,
            local_qp_num: 2,
            remote_qp_num: 3,
            byte_len: 18,
            payload: b"Hello from Client\0".to_vec(),
        };
        assert_eq!(report.payload_text(), "Hello from Client");
    }
}
