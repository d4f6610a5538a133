use super::{READ_DONE, TransferReport, configure_stream, handshake};
use crate::config::{ReadNotify, SessionConfig, TransferMode};
use crate::descriptor::{EndpointDescriptor, Role};
use crate::engine::TransferEngine;
use crate::error::{HandshakeStep, RdmaError, Result};
use crate::memory::{AccessFlags, MemoryRegistrar};
use crate::provider::{Provider, ProviderContext};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use tracing::{info, instrument, warn};

/// The listening side: receives a message or exposes a region to read.
pub struct Responder<P: Provider> {
    ctx: ProviderContext<P>,
    config: SessionConfig,
}

impl<P: Provider> Responder<P> {
    pub fn new(ctx: &ProviderContext<P>, config: SessionConfig) -> Result<Self> {
        config.validate_for(Role::Responder)?;
        Ok(Self {
            ctx: ctx.clone(),
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Accepts one connection on `listener` and serves it.
    pub fn accept(&self, listener: &TcpListener) -> Result<TransferReport> {
        let (stream, peer) = listener.accept().map_err(|source| RdmaError::Handshake {
            step: HandshakeStep::Accept,
            source,
        })?;
        info!(%peer, "TCP connected");
        configure_stream(&stream, &self.config)?;
        self.serve(stream)
    }

    /// Runs the responder side over an already connected channel.
    #[instrument(skip_all, fields(mode = %self.config.transfer), err)]
    pub fn serve<S: Read + Write>(&self, mut channel: S) -> Result<TransferReport> {
        match self.config.transfer {
            TransferMode::SendRecv => self.receive_message(&mut channel),
            TransferMode::RemoteRead => self.expose_region(&mut channel),
        }
    }

    fn receive_message<S: Read + Write>(&self, channel: &mut S) -> Result<TransferReport> {
        let config = &self.config;
        let registrar = MemoryRegistrar::new(&self.ctx);
        let inbox = registrar.allocate(config.buffer_len, AccessFlags::LOCAL_WRITE)?;

        let mut engine = TransferEngine::new(&self.ctx, &config.tuning)?;
        engine
            .connection_mut()
            .to_init(&config.tuning, AccessFlags::LOCAL_WRITE)?;
        let gid = self.ctx.local_identity(config.routing, &config.tuning)?;
        info!(%gid, "local GID");

        // Posted before the peer can learn our queue number, so its send
        // always finds a receive.
        let recv = engine.post_receive(&inbox, 0, inbox.len())?;
        info!("Posted RECV, waiting for data...");

        let local = EndpointDescriptor::local(engine.connection(), gid, None);
        let remote = handshake(&mut engine, channel, &local, Role::Responder, config)?;

        let completion = engine.wait_for(recv, config.completion_timeout)?;
        let byte_len = completion.byte_len as usize;
        let payload = inbox.as_slice()[..byte_len].to_vec();
        info!(byte_len, "Received: {}", String::from_utf8_lossy(&payload));

        let report = TransferReport {
            role: Role::Responder,
            transfer: config.transfer,
            routing: config.routing,
            local_qp_num: engine.connection().qp_num(),
            remote_qp_num: remote.queue_identity,
            byte_len,
            payload,
        };
        drop(engine);
        registrar.deregister(inbox)?;
        Ok(report)
    }

    fn expose_region<S: Read + Write>(&self, channel: &mut S) -> Result<TransferReport> {
        let config = &self.config;
        let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ;
        let registrar = MemoryRegistrar::new(&self.ctx);
        let mut exposed = registrar.allocate(config.buffer_len, access)?;
        exposed.as_mut_slice()[..config.payload.len()].copy_from_slice(&config.payload);
        let notify = match config.read_notify {
            ReadNotify::Message => {
                Some(registrar.allocate(READ_DONE.len(), AccessFlags::LOCAL_WRITE)?)
            }
            ReadNotify::Delay(_) => None,
        };

        let mut engine = TransferEngine::new(&self.ctx, &config.tuning)?;
        engine.connection_mut().to_init(&config.tuning, access)?;
        let gid = self.ctx.local_identity(config.routing, &config.tuning)?;
        info!(%gid, "local GID");

        let notify_recv = notify
            .as_ref()
            .map(|mr| engine.post_receive(mr, 0, mr.len()))
            .transpose()?;

        let local = EndpointDescriptor::local(engine.connection(), gid, Some(&exposed));
        info!(
            rkey = local.remote_access_key,
            addr = local.buffer_address,
            "Exposing {} bytes for RDMA READ",
            config.payload.len()
        );
        let remote = handshake(&mut engine, channel, &local, Role::Responder, config)?;

        if let Some(token) = notify_recv {
            let completion = engine.wait_for(token, config.completion_timeout)?;
            let message = notify
                .as_ref()
                .map(|mr| &mr.as_slice()[..completion.byte_len as usize])
                .unwrap_or_default();
            if message != READ_DONE {
                warn!(?message, "unexpected read notification");
            }
            info!("Peer finished reading");
        } else if let ReadNotify::Delay(delay) = config.read_notify {
            info!(?delay, "Server ready for RDMA READ");
            thread::sleep(delay);
        }

        let report = TransferReport {
            role: Role::Responder,
            transfer: config.transfer,
            routing: config.routing,
            local_qp_num: engine.connection().qp_num(),
            remote_qp_num: remote.queue_identity,
            byte_len: config.payload.len(),
            payload: exposed.as_slice()[..config.payload.len()].to_vec(),
        };
        drop(engine);
        if let Some(notify) = notify {
            registrar.deregister(notify)?;
        }
        registrar.deregister(exposed)?;
        Ok(report)
    }
}
