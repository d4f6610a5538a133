use crate::error::{HandshakeStep, RdmaError, Result};
use crate::memory::{Registration, RemoteRegion};
use crate::provider::{Gid, Provider};
use crate::state::{ConnectionState, ConnectionStateMachine};
use bytemuck::{Pod, Zeroable};
use std::fmt;
use std::io::{Read, Write};
use tracing::{debug, instrument};

/// Size of one descriptor on the out-of-band channel.
pub const DESCRIPTOR_LEN: usize = size_of::<WireDescriptor>();

/// Fixed little-endian layout: qp_num, rkey, addr, gid.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct WireDescriptor {
    qp_num: u32,
    rkey: u32,
    addr: u64,
    gid: [u8; 16],
}

const _: () = assert!(DESCRIPTOR_LEN == 32);

/// What one side needs to know to connect to the other.
///
/// `remote_access_key` and `buffer_address` are zero unless the sender
/// exposes a region for remote reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointDescriptor {
    pub queue_identity: u32,
    pub remote_access_key: u32,
    pub buffer_address: u64,
    pub network_identity: Gid,
}

impl EndpointDescriptor {
    /// Describes a queue pair that has reached at least INIT.
    pub fn local<P: Provider>(
        queue: &ConnectionStateMachine<P>,
        network_identity: Gid,
        exposed: Option<&Registration<P>>,
    ) -> Self {
        debug_assert!(
            queue.state() >= ConnectionState::Init && queue.state() != ConnectionState::Error,
            "descriptor built for a QP in {}",
            queue.state()
        );
        let (remote_access_key, buffer_address) = exposed
            .and_then(|mr| {
                let rkey = mr.remote_key()?;
                mr.publish();
                Some((rkey, mr.address()))
            })
            .unwrap_or_default();
        Self {
            queue_identity: queue.qp_num(),
            remote_access_key,
            buffer_address,
            network_identity,
        }
    }

    /// The published region, trusted to be at least `len` bytes long.
    pub fn remote_region(&self, len: usize) -> Option<RemoteRegion> {
        (self.buffer_address != 0).then_some(RemoteRegion {
            address: self.buffer_address,
            rkey: self.remote_access_key,
            len,
        })
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_LEN] {
        bytemuck::cast(WireDescriptor {
            qp_num: self.queue_identity.to_le(),
            rkey: self.remote_access_key.to_le(),
            addr: self.buffer_address.to_le(),
            gid: *self.network_identity.raw(),
        })
    }

    pub fn from_bytes(bytes: [u8; DESCRIPTOR_LEN]) -> Self {
        let wire: WireDescriptor = bytemuck::cast(bytes);
        Self {
            queue_identity: u32::from_le(wire.qp_num),
            remote_access_key: u32::from_le(wire.rkey),
            buffer_address: u64::from_le(wire.addr),
            network_identity: Gid::new(wire.gid),
        }
    }
}

/// Which end of the out-of-band channel this side holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Listener; writes its descriptor first.
    Responder,
    /// Connector; reads first.
    Initiator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Responder => "responder",
            Self::Initiator => "initiator",
        })
    }
}

/// Swaps descriptors with the peer.
///
/// The order is fixed by `role` so that two blocking peers never wait on
/// each other. A short read or a closed channel fails the handshake; it is
/// not resumed.
#[instrument(skip(channel, local), fields(%role, qp_num = local.queue_identity), err)]
pub fn exchange_descriptors<S: Read + Write>(
    channel: &mut S,
    local: &EndpointDescriptor,
    role: Role,
) -> Result<EndpointDescriptor> {
    let remote = match role {
        Role::Responder => {
            write_descriptor(channel, local)?;
            read_descriptor(channel)?
        }
        Role::Initiator => {
            let remote = read_descriptor(channel)?;
            write_descriptor(channel, local)?;
            remote
        }
    };
    debug!(?remote, "exchanged descriptors");
    Ok(remote)
}

fn write_descriptor<S: Write>(channel: &mut S, local: &EndpointDescriptor) -> Result<()> {
    channel
        .write_all(&local.to_bytes())
        .and_then(|()| channel.flush())
        .map_err(|source| RdmaError::Handshake {
            step: HandshakeStep::WriteDescriptor,
            source,
        })
}

fn read_descriptor<S: Read>(channel: &mut S) -> Result<EndpointDescriptor> {
    let mut bytes = [0u8; DESCRIPTOR_LEN];
    channel
        .read_exact(&mut bytes)
        .map_err(|source| RdmaError::Handshake {
            step: HandshakeStep::ReadDescriptor,
            source,
        })?;
    Ok(EndpointDescriptor::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    fn descriptor(qp_num: u32) -> EndpointDescriptor {
        EndpointDescriptor {
            queue_identity: qp_num,
            remote_access_key: 0x1234,
            buffer_address: 0xdead_beef_0000,
            network_identity: Gid::new([0xfe; 16]),
        }
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let bytes = descriptor(0x0102_0304).to_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &0x1234u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &0xdead_beef_0000u64.to_le_bytes());
        assert_eq!(&bytes[16..], &[0xfe; 16]);
    }

    #[test]
    fn missing_region_is_detected() {
        let mut local_only = descriptor(1);
        local_only.buffer_address = 0;
        assert_eq!(local_only.remote_region(32), None);
        assert_eq!(descriptor(1).remote_region(32).unwrap().rkey, 0x1234);
    }

    #[test]
    fn opposite_roles_exchange_without_deadlock() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let responder =
            thread::spawn(move || exchange_descriptors(&mut a, &descriptor(1), Role::Responder));
        let seen_by_initiator =
            exchange_descriptors(&mut b, &descriptor(2), Role::Initiator).unwrap();
        let seen_by_responder = responder.join().unwrap().unwrap();

        assert_eq!(seen_by_initiator, descriptor(1));
        assert_eq!(seen_by_responder, descriptor(2));
    }

    #[test]
    fn two_initiators_block_until_timeout() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        for stream in [&a, &b] {
            stream.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        }
        let other =
            thread::spawn(move || exchange_descriptors(&mut a, &descriptor(1), Role::Initiator));
        let err = exchange_descriptors(&mut b, &descriptor(2), Role::Initiator).unwrap_err();

        assert!(matches!(err, RdmaError::Handshake { step: HandshakeStep::ReadDescriptor, .. }));
        assert!(other.join().unwrap().is_err());
    }

    #[test]
    fn short_read_fails_the_handshake() {
        struct Truncated(Cursor<Vec<u8>>);

        impl Read for Truncated {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.0.read(buf)
            }
        }

        impl Write for Truncated {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut channel = Truncated(Cursor::new(descriptor(5).to_bytes()[..20].to_vec()));
        let err = exchange_descriptors(&mut channel, &descriptor(6), Role::Responder).unwrap_err();
        match err {
            RdmaError::Handshake { step, source } => {
                assert_eq!(step, HandshakeStep::ReadDescriptor);
                assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
