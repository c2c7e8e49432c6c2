//! Priority-scheduled pool of crypto workers.
//!
//! The pool owns a fixed table of worker slots and [`NUM_PRIORITY`] FIFO
//! queues. A submitted request goes straight to the first idle slot,
//! starting its worker if needed; when every slot is busy it waits in the
//! queue for its priority. A slot that becomes free takes the oldest item
//! of the highest non-empty queue.
//!
//! Results are matched to callers by a per-pool, monotonically increasing
//! RPC id. A worker that faults loses its slot's worker handle and fails
//! only the item it was holding.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use ecash_core::exchange::RecoupRequest;
use ecash_core::types::{EddsaKeyPair, Hash256};

use crate::error::CryptoError;
use crate::implementation::{CryptoImplementation, Ed25519Implementation};
use crate::ops::{
    CreatePlanchetRequest, CreateRecoupRequest, CryptoRequest, CryptoResponse,
    DepositPermissionRequest, DeriveRefreshSessionRequest, DerivedRefreshSession, NUM_PRIORITY,
    PlanchetCreationResult, SignCoinLinkRequest, UnblindRequest,
    VerifyDenominationSignatureRequest,
};
use crate::worker::{
    CryptoWorker, CryptoWorkerFactory, ThreadWorkerFactory, WorkerRequest, WorkerResponse,
};

type Reply = oneshot::Sender<Result<CryptoResponse, CryptoError>>;

struct WorkItem {
    rpc_id: u64,
    request: CryptoRequest,
    reply: Reply,
}

struct InFlight {
    rpc_id: u64,
    operation: &'static str,
    reply: Reply,
    started: Instant,
}

#[derive(Default)]
struct WorkerSlot {
    worker: Option<Box<dyn CryptoWorker>>,
    current: Option<InFlight>,
    /// Distinguishes successive workers started in this slot.
    generation: u64,
}

struct PoolState {
    slots: Vec<WorkerSlot>,
    queues: [VecDeque<WorkItem>; NUM_PRIORITY],
    next_rpc_id: u64,
    next_generation: u64,
    stopped: bool,
}

struct PoolShared {
    factory: Arc<dyn CryptoWorkerFactory>,
    state: Mutex<PoolState>,
}

/// Snapshot of pool occupancy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub slots: usize,
    pub running_workers: usize,
    pub busy: usize,
    pub queued: usize,
}

/// Channel from a worker back into the pool.
///
/// Holds only a weak reference: a worker never keeps a dropped pool alive.
#[derive(Clone)]
pub struct WorkerSink {
    pool: Weak<PoolShared>,
    slot: usize,
    generation: u64,
}

impl WorkerSink {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Deliver the result of the slot's current item.
    pub fn deliver(&self, response: WorkerResponse) {
        let Some(shared) = self.pool.upgrade() else { return };
        let mut state = shared.state.lock();
        let Some(slot) = state.slots.get_mut(self.slot) else { return };
        if slot.generation != self.generation || slot.worker.is_none() {
            debug!(slot = self.slot, rpc_id = response.rpc_id, "dropping result of retired worker");
            return;
        }
        match slot.current.take() {
            None => {
                error!(slot = self.slot, rpc_id = response.rpc_id, "unsolicited response from crypto worker");
            }
            Some(current) if current.rpc_id != response.rpc_id => {
                error!(
                    expected = current.rpc_id,
                    got = response.rpc_id,
                    "crypto response has no registry entry, dropping"
                );
                let _ = current.reply.send(Err(CryptoError::WorkerFault(format!(
                    "worker answered rpc {} while holding rpc {}",
                    response.rpc_id, current.rpc_id
                ))));
            }
            Some(current) => {
                debug!(
                    operation = current.operation,
                    rpc_id = current.rpc_id,
                    elapsed_ms = current.started.elapsed().as_millis() as u64,
                    "crypto operation finished"
                );
                let _ = current.reply.send(response.result);
            }
        }
        PoolShared::find_work(&shared, &mut state, self.slot);
    }

    /// Report that the worker crashed. Its current item fails; the slot is
    /// cleared and immediately offered new work.
    pub fn fault(&self, message: String) {
        let Some(shared) = self.pool.upgrade() else { return };
        let mut state = shared.state.lock();
        let Some(slot) = state.slots.get_mut(self.slot) else { return };
        if slot.generation != self.generation {
            return;
        }
        warn!(slot = self.slot, %message, "crypto worker fault");
        if let Some(mut worker) = slot.worker.take() {
            worker.terminate();
        }
        if let Some(current) = slot.current.take() {
            let _ = current.reply.send(Err(CryptoError::WorkerFault(message)));
        }
        PoolShared::find_work(&shared, &mut state, self.slot);
    }

    /// Called by a worker whose idle timer fired. Returns true if the
    /// worker should exit; the pool then forgets it.
    pub fn idle_expired(&self) -> bool {
        let Some(shared) = self.pool.upgrade() else { return true };
        let mut state = shared.state.lock();
        let Some(slot) = state.slots.get_mut(self.slot) else { return true };
        if slot.generation != self.generation || slot.worker.is_none() {
            return true;
        }
        if slot.current.is_some() {
            return false;
        }
        slot.worker = None;
        true
    }
}

impl PoolShared {
    /// Hand `item` to slot `idx`, starting its worker if needed.
    fn assign(shared: &Arc<PoolShared>, state: &mut PoolState, idx: usize, item: WorkItem) {
        if state.slots[idx].worker.is_none() {
            let generation = state.next_generation;
            state.next_generation += 1;
            let sink = WorkerSink { pool: Arc::downgrade(shared), slot: idx, generation };
            match shared.factory.start_worker(sink) {
                Ok(worker) => {
                    debug!(slot = idx, generation, "started crypto worker");
                    let slot = &mut state.slots[idx];
                    slot.worker = Some(worker);
                    slot.generation = generation;
                }
                Err(e) => {
                    warn!(slot = idx, error = %e, "could not start crypto worker");
                    let _ = item.reply.send(Err(e));
                    Self::find_work(shared, state, idx);
                    return;
                }
            }
        }

        let WorkItem { rpc_id, request, reply } = item;
        let operation = request.operation();
        let slot = &mut state.slots[idx];
        let posted = match slot.worker.as_mut() {
            Some(worker) => worker.post(WorkerRequest { rpc_id, request }),
            None => Err(CryptoError::WorkerFault("worker missing after start".into())),
        };
        match posted {
            Ok(()) => {
                trace!(slot = idx, rpc_id, operation, "assigned crypto work");
                slot.current = Some(InFlight { rpc_id, operation, reply, started: Instant::now() });
            }
            Err(e) => {
                warn!(slot = idx, rpc_id, error = %e, "posting to crypto worker failed");
                if let Some(mut worker) = slot.worker.take() {
                    worker.terminate();
                }
                let _ = reply.send(Err(e));
                Self::find_work(shared, state, idx);
            }
        }
    }

    /// Give the now idle slot `idx` the best queued item, if any.
    fn find_work(shared: &Arc<PoolShared>, state: &mut PoolState, idx: usize) {
        if state.stopped {
            return;
        }
        let next = state.queues.iter_mut().rev().find_map(|q| q.pop_front());
        if let Some(item) = next {
            Self::assign(shared, state, idx, item);
        }
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for slot in &mut state.slots {
            if let Some(mut worker) = slot.worker.take() {
                worker.terminate();
            }
        }
    }
}

/// Cloneable handle to a crypto worker pool.
#[derive(Clone)]
pub struct CryptoWorkerPool {
    shared: Arc<PoolShared>,
}

impl CryptoWorkerPool {
    pub fn new(factory: Arc<dyn CryptoWorkerFactory>) -> Self {
        let slots = factory.concurrency().max(1);
        let state = PoolState {
            slots: (0..slots).map(|_| WorkerSlot::default()).collect(),
            queues: Default::default(),
            next_rpc_id: 1,
            next_generation: 1,
            stopped: false,
        };
        info!(slots, "crypto worker pool created");
        Self { shared: Arc::new(PoolShared { factory, state: Mutex::new(state) }) }
    }

    /// Thread workers running the default Ed25519 primitives.
    pub fn with_thread_workers(idle_timeout: Duration, concurrency: Option<usize>) -> Self {
        let implementation: Arc<dyn CryptoImplementation> = Arc::new(Ed25519Implementation);
        let mut factory = ThreadWorkerFactory::new(implementation, idle_timeout);
        if let Some(n) = concurrency {
            factory = factory.with_concurrency(n);
        }
        Self::new(Arc::new(factory))
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            slots: state.slots.len(),
            running_workers: state.slots.iter().filter(|s| s.worker.is_some()).count(),
            busy: state.slots.iter().filter(|s| s.current.is_some()).count(),
            queued: state.queues.iter().map(VecDeque::len).sum(),
        }
    }

    fn enqueue(&self, request: CryptoRequest) -> Result<oneshot::Receiver<Result<CryptoResponse, CryptoError>>, CryptoError> {
        let (reply, rx) = oneshot::channel();
        let mut state = self.shared.state.lock();
        if state.stopped {
            trace!(operation = request.operation(), "submit after stop ignored");
            return Err(CryptoError::PoolStopped);
        }
        let rpc_id = state.next_rpc_id;
        state.next_rpc_id += 1;
        let priority = request.priority().min(NUM_PRIORITY - 1);
        let item = WorkItem { rpc_id, request, reply };
        match state.slots.iter().position(|s| s.current.is_none()) {
            Some(idx) => PoolShared::assign(&self.shared, &mut state, idx, item),
            None => {
                trace!(rpc_id, priority, "all crypto workers busy, queueing");
                state.queues[priority].push_back(item);
            }
        }
        Ok(rx)
    }

    /// Run `request` on a worker and wait for its result.
    pub async fn submit(&self, request: CryptoRequest) -> Result<CryptoResponse, CryptoError> {
        let rx = self.enqueue(request)?;
        rx.await.map_err(|_| CryptoError::Terminated)?
    }

    /// Terminate all workers and fail every in-flight and queued item.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        let mut failed = 0usize;
        for slot in &mut state.slots {
            if let Some(mut worker) = slot.worker.take() {
                worker.terminate();
            }
            if let Some(current) = slot.current.take() {
                let _ = current.reply.send(Err(CryptoError::Terminated));
                failed += 1;
            }
        }
        for queue in &mut state.queues {
            for item in queue.drain(..) {
                let _ = item.reply.send(Err(CryptoError::Terminated));
                failed += 1;
            }
        }
        info!(failed, "crypto worker pool stopped");
    }

    pub async fn create_planchet(&self, req: CreatePlanchetRequest) -> Result<PlanchetCreationResult, CryptoError> {
        match self.submit(CryptoRequest::CreatePlanchet(req)).await? {
            CryptoResponse::Planchet(r) => Ok(r),
            other => Err(CryptoError::UnexpectedResponse(other.variant_name())),
        }
    }

    pub async fn hash_string(&self, s: impl Into<String>) -> Result<Hash256, CryptoError> {
        match self.submit(CryptoRequest::HashString(s.into())).await? {
            CryptoResponse::Hash(h) => Ok(h),
            other => Err(CryptoError::UnexpectedResponse(other.variant_name())),
        }
    }

    pub async fn create_eddsa_keypair(&self) -> Result<EddsaKeyPair, CryptoError> {
        match self.submit(CryptoRequest::CreateEddsaKeypair).await? {
            CryptoResponse::KeyPair(kp) => Ok(kp),
            other => Err(CryptoError::UnexpectedResponse(other.variant_name())),
        }
    }

    pub async fn create_recoup_request(&self, req: CreateRecoupRequest) -> Result<RecoupRequest, CryptoError> {
        match self.submit(CryptoRequest::CreateRecoupRequest(req)).await? {
            CryptoResponse::RecoupRequest(r) => Ok(r),
            other => Err(CryptoError::UnexpectedResponse(other.variant_name())),
        }
    }

    pub async fn sign_deposit_permission(&self, req: DepositPermissionRequest) -> Result<Vec<u8>, CryptoError> {
        match self.submit(CryptoRequest::SignDepositPermission(req)).await? {
            CryptoResponse::Signature(sig) => Ok(sig),
            other => Err(CryptoError::UnexpectedResponse(other.variant_name())),
        }
    }

    pub async fn unblind_signature(&self, req: UnblindRequest) -> Result<Vec<u8>, CryptoError> {
        match self.submit(CryptoRequest::UnblindSignature(req)).await? {
            CryptoResponse::Signature(sig) => Ok(sig),
            other => Err(CryptoError::UnexpectedResponse(other.variant_name())),
        }
    }

    pub async fn verify_denomination_signature(&self, req: VerifyDenominationSignatureRequest) -> Result<bool, CryptoError> {
        match self.submit(CryptoRequest::VerifyDenominationSignature(req)).await? {
            CryptoResponse::Verified(ok) => Ok(ok),
            other => Err(CryptoError::UnexpectedResponse(other.variant_name())),
        }
    }

    pub async fn derive_refresh_session(&self, req: DeriveRefreshSessionRequest) -> Result<DerivedRefreshSession, CryptoError> {
        match self.submit(CryptoRequest::DeriveRefreshSession(req)).await? {
            CryptoResponse::RefreshSession(s) => Ok(s),
            other => Err(CryptoError::UnexpectedResponse(other.variant_name())),
        }
    }

    pub async fn sign_coin_link(&self, req: SignCoinLinkRequest) -> Result<Vec<u8>, CryptoError> {
        match self.submit(CryptoRequest::SignCoinLink(req)).await? {
            CryptoResponse::Signature(sig) => Ok(sig),
            other => Err(CryptoError::UnexpectedResponse(other.variant_name())),
        }
    }
}
