use crate::error::{RdmaError, Result};
use crate::provider::{Provider, ProviderContext, ScatterEntry};
use bitflags::bitflags;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, instrument, warn};

bitflags! {
    /// Access rights of a registration or of incoming operations on a QP.
    ///
    /// Bit values match `enum ibv_access_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
    }
}

impl AccessFlags {
    pub fn allows_remote(self) -> bool {
        self.intersects(Self::REMOTE_READ | Self::REMOTE_WRITE)
    }
}

/// Address, key and extent of a region a peer may access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRegion {
    pub address: u64,
    pub rkey: u32,
    pub len: usize,
}

impl RemoteRegion {
    pub fn slice(&self, offset: usize, len: usize) -> Result<Self> {
        check_bounds(offset, len, self.len)?;
        Ok(Self {
            address: self.address + offset as u64,
            rkey: self.rkey,
            len,
        })
    }
}

/// Registers buffers with the protection domain of one provider context.
pub struct MemoryRegistrar<P: Provider> {
    ctx: ProviderContext<P>,
}

impl<P: Provider> MemoryRegistrar<P> {
    pub fn new(ctx: &ProviderContext<P>) -> Self {
        Self { ctx: ctx.clone() }
    }

    /// Pins `buffer` and returns its registration.
    ///
    /// Without `REMOTE_READ` or `REMOTE_WRITE` the registration carries no
    /// remote key.
    #[instrument(skip_all, fields(len = buffer.len(), ?access), err)]
    pub fn register(&self, mut buffer: Vec<u8>, access: AccessFlags) -> Result<Registration<P>> {
        let len = buffer.len();
        if len == 0 {
            return Err(RdmaError::Registration {
                len,
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty buffer"),
            });
        }

        // SAFETY: the heap allocation of `buffer` moves into the registration
        // and is only released after the region is deregistered.
        let mr = unsafe {
            self.ctx
                .provider()
                .register_memory(buffer.as_mut_ptr(), len, access)
        }
        .map_err(|source| RdmaError::Registration { len, source })?;

        let keys = self.ctx.provider().memory_keys(&mr);
        let remote_key = access.allows_remote().then_some(keys.rkey);
        debug!(lkey = keys.lkey, ?remote_key, addr = ?buffer.as_ptr(), "registered memory");

        Ok(Registration {
            ctx: self.ctx.clone(),
            mr: Some(mr),
            buffer,
            access,
            local_key: keys.lkey,
            remote_key,
            in_flight: Arc::default(),
            published: AtomicBool::new(false),
        })
    }

    /// Registers a zeroed buffer of `len` bytes.
    pub fn allocate(&self, len: usize, access: AccessFlags) -> Result<Registration<P>> {
        self.register(vec![0; len], access)
    }

    pub fn deregister(&self, registration: Registration<P>) -> Result<()> {
        registration.deregister()
    }
}

/// A pinned buffer the provider may access.
///
/// Work requests posted against the registration hold an in-flight guard;
/// releasing the registration while any are outstanding panics. Once its
/// remote address has been handed out, a peer may read it at any time and
/// the buffer stays read-only locally.
pub struct Registration<P: Provider> {
    ctx: ProviderContext<P>,
    mr: Option<P::MemoryRegion>,
    buffer: Vec<u8>,
    access: AccessFlags,
    local_key: u32,
    remote_key: Option<u32>,
    in_flight: Arc<AtomicUsize>,
    published: AtomicBool,
}

impl<P: Provider> Registration<P> {
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn address(&self) -> u64 {
        self.buffer.as_ptr() as u64
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    pub fn local_key(&self) -> u32 {
        self.local_key
    }

    pub fn remote_key(&self) -> Option<u32> {
        self.remote_key
    }

    /// Number of posted work requests still referencing this buffer.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Whether the remote address of this region has been handed out.
    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// # Panics
    ///
    /// Panics while work requests against this buffer are outstanding.
    pub fn as_slice(&self) -> &[u8] {
        assert_eq!(self.in_flight(), 0, "buffer is in use by the provider");
        &self.buffer
    }

    /// # Panics
    ///
    /// Panics while work requests against this buffer are outstanding, or
    /// once the region has been published to a peer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert_eq!(self.in_flight(), 0, "buffer is in use by the provider");
        assert!(!self.is_published(), "buffer is published for remote access");
        &mut self.buffer
    }

    /// The part of this region a peer may access, if it has a remote key.
    ///
    /// Publishes the registration.
    pub fn remote_region(&self, offset: usize, len: usize) -> Option<RemoteRegion> {
        let rkey = self.remote_key?;
        check_bounds(offset, len, self.len()).ok()?;
        self.publish();
        Some(RemoteRegion {
            address: self.address() + offset as u64,
            rkey,
            len,
        })
    }

    pub(crate) fn scatter_entry(&self, offset: usize, len: usize) -> Result<ScatterEntry> {
        check_bounds(offset, len, self.len())?;
        let length = u32::try_from(len).map_err(|_| RdmaError::OutOfBounds {
            offset,
            len,
            capacity: u32::MAX as usize,
        })?;
        Ok(ScatterEntry {
            addr: self.address() + offset as u64,
            length,
            lkey: self.local_key,
        })
    }

    pub(crate) fn publish(&self) {
        self.published.store(true, Ordering::Release);
    }

    pub(crate) fn begin_work(&self) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight(Arc::clone(&self.in_flight))
    }

    /// Releases the registration and hands the buffer back.
    ///
    /// # Panics
    ///
    /// Panics if work requests against this buffer are still outstanding.
    pub fn into_inner(mut self) -> Result<Vec<u8>> {
        self.release()?;
        Ok(std::mem::take(&mut self.buffer))
    }

    pub fn deregister(self) -> Result<()> {
        self.into_inner().map(drop)
    }

    fn release(&mut self) -> Result<()> {
        if self.mr.is_none() {
            return Ok(());
        }
        let outstanding = self.in_flight();
        assert_eq!(
            outstanding, 0,
            "deregistering memory with {outstanding} outstanding work request(s)"
        );
        let Some(mr) = self.mr.take() else {
            return Ok(());
        };
        self.ctx
            .provider()
            .deregister_memory(mr)
            .map_err(|source| RdmaError::Deregistration { source })
    }
}

impl<P: Provider> Drop for Registration<P> {
    fn drop(&mut self) {
        if std::thread::panicking() && self.in_flight() > 0 {
            // The provider may still write here; leak instead of freeing.
            std::mem::forget(std::mem::take(&mut self.buffer));
            return;
        }
        if let Err(e) = self.release() {
            warn!("failed to deregister memory: {e}");
        }
    }
}

/// Marks one outstanding work request against a registration.
#[derive(Debug)]
pub(crate) struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn check_bounds(offset: usize, len: usize, capacity: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(RdmaError::OutOfBounds {
            offset,
            len,
            capacity,
        }),
    }
}
