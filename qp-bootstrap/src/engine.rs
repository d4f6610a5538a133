use crate::config::ConnectionTuning;
use crate::error::{RdmaError, Result, SetupPhase};
use crate::memory::{InFlight, Registration, RemoteRegion};
use crate::provider::{
    Completion, Opcode, Provider, ProviderContext, ReceiveRequest, ScatterEntry, SendOperation,
    SendRequest,
};
use crate::state::ConnectionStateMachine;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use std::{fmt, hint};
use tracing::{debug, instrument, trace, warn};

pub(crate) const POLL_BATCH: usize = 16;

/// Identifies one posted work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkToken(u64);

impl WorkToken {
    pub fn wr_id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wr#{}", self.0)
    }
}

struct Outstanding {
    opcode: Opcode,
    signaled: bool,
    _in_flight: InFlight,
}

/// Posts work on one connection and matches completions back to tokens.
///
/// The engine owns the queue pair and its completion queue; the queue pair
/// is destroyed first. Registrations used for posting must outlive the
/// engine or see their work complete.
pub struct TransferEngine<P: Provider> {
    connection: ConnectionStateMachine<P>,
    cq: P::CompletionQueue,
    ctx: ProviderContext<P>,
    next_wr_id: u64,
    outstanding: HashMap<u64, Outstanding>,
    /// Send-side requests in posting order; a completion retires every
    /// earlier unsignaled entry.
    send_queue: VecDeque<u64>,
    ready: VecDeque<Completion>,
    scratch: Vec<Completion>,
}

impl<P: Provider> TransferEngine<P> {
    /// Creates the completion queue and a queue pair in RESET.
    pub fn new(ctx: &ProviderContext<P>, tuning: &ConnectionTuning) -> Result<Self> {
        let cq = ctx
            .provider()
            .create_cq(tuning.cq_depth)
            .map_err(|source| RdmaError::Setup {
                phase: SetupPhase::CompletionQueue,
                source,
            })?;
        let connection = ConnectionStateMachine::create(ctx, &cq, tuning)?;

        Ok(Self {
            connection,
            cq,
            ctx: ctx.clone(),
            next_wr_id: 1,
            outstanding: HashMap::new(),
            send_queue: VecDeque::new(),
            ready: VecDeque::new(),
            scratch: Vec::with_capacity(POLL_BATCH),
        })
    }

    pub fn connection(&self) -> &ConnectionStateMachine<P> {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionStateMachine<P> {
        &mut self.connection
    }

    /// Work requests posted but not yet retired.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    #[instrument(skip(self, registration), err)]
    pub fn post_receive(
        &mut self,
        registration: &Registration<P>,
        offset: usize,
        len: usize,
    ) -> Result<WorkToken> {
        self.ensure(Opcode::Receive)?;
        let request = ReceiveRequest {
            wr_id: self.next_wr_id,
            sge: registration.scatter_entry(offset, len)?,
        };
        // SAFETY: the registration stays pinned while the in-flight guard
        // taken in `track` is held.
        unsafe {
            self.ctx
                .provider()
                .post_receive(self.connection.queue_pair(), &request)
        }
        .map_err(|source| RdmaError::Post {
            operation: Opcode::Receive,
            source,
        })?;
        Ok(self.track(Opcode::Receive, true, registration))
    }

    /// Unsignaled sends never produce a successful completion of their own;
    /// they retire with the next signaled send-side completion.
    #[instrument(skip(self, registration), err)]
    pub fn post_send(
        &mut self,
        registration: &Registration<P>,
        offset: usize,
        len: usize,
        signaled: bool,
    ) -> Result<WorkToken> {
        let sge = registration.scatter_entry(offset, len)?;
        self.post_send_request(registration, sge, SendOperation::Send, signaled)
    }

    /// Reads `len` bytes at the start of `remote` into the registration.
    #[instrument(skip(self, registration), err)]
    pub fn post_remote_read(
        &mut self,
        registration: &Registration<P>,
        offset: usize,
        len: usize,
        remote: RemoteRegion,
    ) -> Result<WorkToken> {
        if len > remote.len {
            return Err(RdmaError::OutOfBounds {
                offset: 0,
                len,
                capacity: remote.len,
            });
        }
        let sge = registration.scatter_entry(offset, len)?;
        let operation = SendOperation::RemoteRead {
            remote_addr: remote.address,
            rkey: remote.rkey,
        };
        self.post_send_request(registration, sge, operation, true)
    }

    fn post_send_request(
        &mut self,
        registration: &Registration<P>,
        sge: ScatterEntry,
        operation: SendOperation,
        signaled: bool,
    ) -> Result<WorkToken> {
        let opcode = match operation {
            SendOperation::Send => Opcode::Send,
            SendOperation::RemoteRead { .. } => Opcode::RemoteRead,
        };
        self.ensure(opcode)?;
        let request = SendRequest {
            wr_id: self.next_wr_id,
            sge,
            operation,
            signaled,
        };
        // SAFETY: see `post_receive`.
        unsafe {
            self.ctx
                .provider()
                .post_send(self.connection.queue_pair(), &request)
        }
        .map_err(|source| RdmaError::Post {
            operation: opcode,
            source,
        })?;
        Ok(self.track(opcode, signaled, registration))
    }

    fn ensure(&self, operation: Opcode) -> Result<()> {
        let state = self.connection.state();
        let allowed = match operation {
            Opcode::Receive => state.can_post_receive(),
            Opcode::Send | Opcode::RemoteRead => state.can_post_send(),
        };
        if allowed {
            Ok(())
        } else {
            Err(RdmaError::InvalidState { operation, state })
        }
    }

    fn track(
        &mut self,
        opcode: Opcode,
        signaled: bool,
        registration: &Registration<P>,
    ) -> WorkToken {
        let wr_id = self.next_wr_id;
        self.next_wr_id += 1;
        self.outstanding.insert(
            wr_id,
            Outstanding {
                opcode,
                signaled,
                _in_flight: registration.begin_work(),
            },
        );
        if opcode.is_send_side() {
            self.send_queue.push_back(wr_id);
        }
        trace!(wr_id, %opcode, "posted");
        WorkToken(wr_id)
    }

    /// Returns up to `max` completions without blocking.
    ///
    /// Completions buffered by [`TransferEngine::wait_for`] come first.
    pub fn poll_completions(&mut self, max: usize) -> Result<Vec<Completion>> {
        let buffered = max.min(self.ready.len());
        let mut completions: Vec<_> = self.ready.drain(..buffered).collect();
        if completions.len() < max {
            self.poll_provider(max - completions.len())?;
            completions.extend(self.ready.drain(..));
        }
        Ok(completions)
    }

    /// Spins until `token` completes or `timeout` elapses.
    ///
    /// Completions of other work seen meanwhile stay buffered. A failed
    /// completion is returned as [`RdmaError::Completion`]; nothing is retried.
    #[instrument(skip(self), err)]
    pub fn wait_for(&mut self, token: WorkToken, timeout: Option<Duration>) -> Result<Completion> {
        let start = Instant::now();
        loop {
            if let Some(pos) = self.ready.iter().position(|c| c.wr_id == token.0)
                && let Some(completion) = self.ready.remove(pos)
            {
                return Self::check(token, completion);
            }
            match self.outstanding.get(&token.0) {
                None => return Err(RdmaError::UnknownToken(token)),
                Some(work) if !work.signaled => return Err(RdmaError::Unsignaled(token)),
                Some(_) => {}
            }

            let polled = self.poll_provider(POLL_BATCH)?;
            if polled > 0 && self.ready.iter().any(|c| c.wr_id == token.0) {
                continue;
            }
            // Other work completing must not hold off the deadline.
            if let Some(limit) = timeout {
                let waited = start.elapsed();
                if waited >= limit {
                    return Err(RdmaError::Timeout { token, waited });
                }
            }
            if polled == 0 {
                hint::spin_loop();
            }
        }
    }

    fn check(token: WorkToken, completion: Completion) -> Result<Completion> {
        if completion.is_success() {
            debug!(%token, byte_len = completion.byte_len, "work completed");
            Ok(completion)
        } else {
            Err(RdmaError::Completion {
                token,
                status: completion.status,
                opcode: completion.opcode,
            })
        }
    }

    /// Moves up to `max` provider completions into the ready buffer.
    fn poll_provider(&mut self, max: usize) -> Result<usize> {
        self.scratch.clear();
        let n = self
            .ctx
            .provider()
            .poll_cq(&self.cq, max, &mut self.scratch)
            .map_err(|source| RdmaError::Poll { source })?;

        let mut polled = std::mem::take(&mut self.scratch);
        for completion in polled.drain(..) {
            self.retire(&completion);
            self.ready.push_back(completion);
        }
        self.scratch = polled;
        Ok(n)
    }

    fn retire(&mut self, completion: &Completion) {
        match self.outstanding.get(&completion.wr_id).map(|work| work.opcode) {
            Some(Opcode::Receive) => {
                self.outstanding.remove(&completion.wr_id);
            }
            Some(_) => {
                while let Some(wr_id) = self.send_queue.pop_front() {
                    self.outstanding.remove(&wr_id);
                    if wr_id == completion.wr_id {
                        break;
                    }
                }
            }
            None => warn!(wr_id = completion.wr_id, "completion for unknown work request"),
        }
        if !completion.is_success() {
            warn!(
                wr_id = completion.wr_id,
                status = %completion.status,
                "work completion error"
            );
            self.connection.observe_error();
        }
    }
}
