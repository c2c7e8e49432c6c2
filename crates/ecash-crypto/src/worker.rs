//! Worker seam of the pool and the default thread-backed workers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, trace};

use crate::error::CryptoError;
use crate::implementation::CryptoImplementation;
use crate::ops::{CryptoRequest, CryptoResponse};
use crate::pool::WorkerSink;

/// Request message posted to a worker.
#[derive(Debug)]
pub struct WorkerRequest {
    pub rpc_id: u64,
    pub request: CryptoRequest,
}

/// Result message sent back by a worker. `rpc_id` echoes the request.
#[derive(Debug)]
pub struct WorkerResponse {
    pub rpc_id: u64,
    pub result: Result<CryptoResponse, CryptoError>,
}

/// Handle to one running worker.
pub trait CryptoWorker: Send {
    fn post(&mut self, message: WorkerRequest) -> Result<(), CryptoError>;

    /// Stop the worker. Must not block.
    fn terminate(&mut self);
}

/// Starts workers for a pool.
pub trait CryptoWorkerFactory: Send + Sync + 'static {
    /// Number of worker slots the pool should have.
    fn concurrency(&self) -> usize;

    /// Start a worker that reports back through `sink`.
    fn start_worker(&self, sink: WorkerSink) -> Result<Box<dyn CryptoWorker>, CryptoError>;
}

enum Command {
    Run(WorkerRequest),
    Terminate,
}

struct ThreadWorker {
    tx: Sender<Command>,
}

impl CryptoWorker for ThreadWorker {
    fn post(&mut self, message: WorkerRequest) -> Result<(), CryptoError> {
        self.tx
            .send(Command::Run(message))
            .map_err(|_| CryptoError::WorkerFault("worker thread has exited".into()))
    }

    fn terminate(&mut self) {
        let _ = self.tx.send(Command::Terminate);
    }
}

/// Runs each worker on a dedicated OS thread.
pub struct ThreadWorkerFactory {
    implementation: Arc<dyn CryptoImplementation>,
    concurrency: usize,
    idle_timeout: Duration,
}

impl ThreadWorkerFactory {
    /// One worker per available CPU, at least one.
    pub fn new(implementation: Arc<dyn CryptoImplementation>, idle_timeout: Duration) -> Self {
        let concurrency = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self { implementation, concurrency, idle_timeout }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

fn run_worker(
    implementation: Arc<dyn CryptoImplementation>,
    rx: Receiver<Command>,
    sink: WorkerSink,
    idle_timeout: Duration,
) {
    loop {
        match rx.recv_timeout(idle_timeout) {
            Ok(Command::Run(WorkerRequest { rpc_id, request })) => {
                let operation = request.operation();
                trace!(rpc_id, operation, "worker executing");
                match catch_unwind(AssertUnwindSafe(|| implementation.execute(request))) {
                    Ok(result) => sink.deliver(WorkerResponse { rpc_id, result }),
                    Err(payload) => {
                        let message = panic_message(payload);
                        error!(rpc_id, operation, %message, "crypto worker panicked");
                        sink.fault(message);
                        return;
                    }
                }
            }
            Ok(Command::Terminate) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                if sink.idle_expired() {
                    debug!(slot = sink.slot(), "crypto worker idle, shutting down");
                    return;
                }
            }
        }
    }
}

impl CryptoWorkerFactory for ThreadWorkerFactory {
    fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    fn start_worker(&self, sink: WorkerSink) -> Result<Box<dyn CryptoWorker>, CryptoError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let implementation = Arc::clone(&self.implementation);
        let idle_timeout = self.idle_timeout;
        std::thread::Builder::new()
            .name(format!("crypto-worker-{}", sink.slot()))
            .spawn(move || run_worker(implementation, rx, sink, idle_timeout))
            .map_err(|e| CryptoError::WorkerStart(e.to_string()))?;
        Ok(Box::new(ThreadWorker { tx }))
    }
}
