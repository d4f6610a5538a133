use super::{READ_DONE, TransferReport, configure_stream, handshake};
use crate::config::{ReadNotify, SessionConfig, TransferMode};
use crate::descriptor::{EndpointDescriptor, Role};
use crate::engine::TransferEngine;
use crate::error::{HandshakeStep, RdmaError, Result};
use crate::memory::{AccessFlags, MemoryRegistrar};
use crate::provider::{Provider, ProviderContext};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use tracing::{info, instrument};

/// The connecting side: sends a message or reads the responder's region.
pub struct Initiator<P: Provider> {
    ctx: ProviderContext<P>,
    config: SessionConfig,
}

impl<P: Provider> Initiator<P> {
    pub fn new(ctx: &ProviderContext<P>, config: SessionConfig) -> Result<Self> {
        config.validate_for(Role::Initiator)?;
        Ok(Self {
            ctx: ctx.clone(),
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connect(&self, addr: impl ToSocketAddrs) -> Result<TransferReport> {
        let stream = TcpStream::connect(addr).map_err(|source| RdmaError::Handshake {
            step: HandshakeStep::Connect,
            source,
        })?;
        info!(peer = ?stream.peer_addr().ok(), "TCP connected");
        configure_stream(&stream, &self.config)?;
        self.run(stream)
    }

    /// Runs the initiator side over an already connected channel.
    #[instrument(skip_all, fields(mode = %self.config.transfer), err)]
    pub fn run<S: Read + Write>(&self, mut channel: S) -> Result<TransferReport> {
        match self.config.transfer {
            TransferMode::SendRecv => self.send_message(&mut channel),
            TransferMode::RemoteRead => self.read_region(&mut channel),
        }
    }

    fn send_message<S: Read + Write>(&self, channel: &mut S) -> Result<TransferReport> {
        let config = &self.config;
        let registrar = MemoryRegistrar::new(&self.ctx);
        let mut buffer = vec![0; config.buffer_len];
        buffer[..config.payload.len()].copy_from_slice(&config.payload);
        let outbox = registrar.register(buffer, AccessFlags::empty())?;

        let mut engine = self.connect_engine(AccessFlags::LOCAL_WRITE)?;
        let gid = self.ctx.local_identity(config.routing, &config.tuning)?;
        info!(%gid, "local GID");
        let local = EndpointDescriptor::local(engine.connection(), gid, None);
        let remote = handshake(&mut engine, channel, &local, Role::Initiator, config)?;

        let len = config.payload.len();
        let send = engine.post_send(&outbox, 0, len, true)?;
        let completion = engine.wait_for(send, config.completion_timeout)?;
        info!(byte_len = completion.byte_len, "Send done");

        let report = TransferReport {
            role: Role::Initiator,
            transfer: config.transfer,
            routing: config.routing,
            local_qp_num: engine.connection().qp_num(),
            remote_qp_num: remote.queue_identity,
            byte_len: len,
            payload: config.payload.clone(),
        };
        drop(engine);
        registrar.deregister(outbox)?;
        Ok(report)
    }

    fn read_region<S: Read + Write>(&self, channel: &mut S) -> Result<TransferReport> {
        let config = &self.config;
        let registrar = MemoryRegistrar::new(&self.ctx);
        let target = registrar.allocate(config.buffer_len, AccessFlags::LOCAL_WRITE)?;
        let notify = match config.read_notify {
            ReadNotify::Message => {
                Some(registrar.register(READ_DONE.to_vec(), AccessFlags::empty())?)
            }
            ReadNotify::Delay(_) => None,
        };

        let mut engine = self.connect_engine(AccessFlags::LOCAL_WRITE)?;
        let gid = self.ctx.local_identity(config.routing, &config.tuning)?;
        info!(%gid, "local GID");
        let local = EndpointDescriptor::local(engine.connection(), gid, None);
        let remote = handshake(&mut engine, channel, &local, Role::Initiator, config)?;

        let region = remote
            .remote_region(config.read_len)
            .ok_or(RdmaError::MissingRemoteRegion)?;
        info!(rkey = region.rkey, addr = region.address, "Remote memory");

        let read = engine.post_remote_read(&target, 0, config.read_len, region)?;
        let completion = engine.wait_for(read, config.completion_timeout)?;
        let byte_len = completion.byte_len as usize;
        let payload = target.as_slice()[..byte_len].to_vec();
        info!(byte_len, "RDMA READ result: {}", String::from_utf8_lossy(&payload));

        if let Some(notify) = &notify {
            let done = engine.post_send(notify, 0, notify.len(), true)?;
            engine.wait_for(done, config.completion_timeout)?;
        }

        let report = TransferReport {
            role: Role::Initiator,
            transfer: config.transfer,
            routing: config.routing,
            local_qp_num: engine.connection().qp_num(),
            remote_qp_num: remote.queue_identity,
            byte_len,
            payload,
        };
        drop(engine);
        if let Some(notify) = notify {
            registrar.deregister(notify)?;
        }
        registrar.deregister(target)?;
        Ok(report)
    }

    fn connect_engine(&self, access: AccessFlags) -> Result<TransferEngine<P>> {
        let mut engine = TransferEngine::new(&self.ctx, &self.config.tuning)?;
        engine.connection_mut().to_init(&self.config.tuning, access)?;
        Ok(engine)
    }
}
