/// Per-endpoint supervision: threads, queues and lifecycle
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Sender};
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::batch::Batch;
use crate::batcher::{run_batcher, BatcherConfig, QueuedRequest, DEFAULT_BATCHER_TIMEOUT};
use crate::error::Error;
use crate::memory_pool::{MemoryKind, MemoryPool};
use crate::observation;
use crate::parameters::ParameterMap;
use crate::request::InferenceRequest;
use crate::tensor::ModelMetadata;
use crate::worker::{make_worker, respond, Worker, WorkerContext};

/// Capacity of the batch queue between the batchers and the workers. A
/// stalled worker backs the batchers up through this bound.
const BATCH_QUEUE_DEPTH: usize = 8;

/// Owns everything behind one endpoint: the ingress queue, the batcher
/// threads, the worker threads, and the link to the next stage of an
/// ensemble. Dropped when the refcount of `load` calls reaches zero.
pub struct WorkerInfo {
    endpoint: String,
    worker_name: String,
    parameters: ParameterMap,
    batch_size: usize,
    allocators: Vec<MemoryKind>,
    metadata: ModelMetadata,
    batcher_count: usize,
    worker_count: usize,
    ingress_tx: Sender<Option<QueuedRequest>>,
    batch_tx: Sender<Option<Batch>>,
    batcher_threads: Mutex<Vec<JoinHandle<()>>>,
    worker_threads: Mutex<Vec<JoinHandle<()>>>,
    refcount: AtomicUsize,
    ready: AtomicBool,
    next: Option<Arc<WorkerInfo>>,
}

fn thread_count(parameters: &ParameterMap, key: &str) -> Result<usize, Error> {
    match parameters.get_i32(key) {
        Some(count) if count >= 1 => Ok(count as usize),
        Some(count) => Err(Error::InvalidArgument(format!(
            "{key} must be positive, got {count}"
        ))),
        None => Ok(1),
    }
}

impl WorkerInfo {
    /// Create the worker instances, run their `init`/`acquire`, and spawn
    /// the batcher and worker threads. Any failure releases what was
    /// already acquired and aborts the load.
    pub(crate) fn load(
        endpoint: String,
        worker_name: String,
        parameters: &ParameterMap,
        pool: Arc<MemoryPool>,
        next: Option<Arc<WorkerInfo>>,
    ) -> Result<Arc<WorkerInfo>, Error> {
        let batcher_count = thread_count(parameters, "batchers")?;
        let worker_count = thread_count(parameters, "workers")?;
        let timeout = match parameters.get_i32("timeout") {
            Some(ms) if ms >= 1 => Duration::from_millis(ms as u64),
            Some(ms) => {
                return Err(Error::InvalidArgument(format!(
                    "timeout must be positive, got {ms}"
                )))
            }
            None => DEFAULT_BATCHER_TIMEOUT,
        };

        let mut instances: Vec<Box<dyn Worker>> = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let built = make_worker(&worker_name).and_then(|mut worker| {
                worker.init(parameters)?;
                worker.acquire(parameters)?;
                Ok(worker)
            });
            match built {
                Ok(worker) => instances.push(worker),
                Err(err) => {
                    for mut worker in instances {
                        worker.release();
                        worker.destroy();
                    }
                    return Err(err);
                }
            }
        }

        let first = &instances[0];
        let batch_size = first.batch_size();
        let allocators = first.allocators();
        let batcher_kind = first.batcher_kind();
        let metadata = first.metadata().clone();

        let (ingress_tx, ingress_rx) = unbounded();
        let (batch_tx, batch_rx) = bounded(BATCH_QUEUE_DEPTH);

        let mut batcher_threads = Vec::with_capacity(batcher_count);
        for i in 0..batcher_count {
            let config = BatcherConfig {
                kind: batcher_kind,
                batch_size,
                timeout,
            };
            let endpoint = endpoint.clone();
            let allocators = allocators.clone();
            let output_tensors = metadata.outputs.clone();
            let pool = pool.clone();
            let ingress_rx = ingress_rx.clone();
            let batch_tx = batch_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("batcher-{endpoint}-{i}"))
                .spawn(move || {
                    run_batcher(config, endpoint, allocators, output_tensors, pool, ingress_rx, batch_tx)
                })
                .map_err(|err| Error::Runtime(format!("failed to spawn batcher thread: {err}")))?;
            batcher_threads.push(handle);
        }

        let mut worker_threads = Vec::with_capacity(worker_count);
        for (i, worker) in instances.into_iter().enumerate() {
            let endpoint = endpoint.clone();
            let batch_rx = batch_rx.clone();
            let next = next.clone();
            let pool = pool.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{endpoint}-{i}"))
                .spawn(move || worker_loop(endpoint, worker, batch_rx, next, pool))
                .map_err(|err| Error::Runtime(format!("failed to spawn worker thread: {err}")))?;
            worker_threads.push(handle);
        }

        info!(endpoint = %endpoint, worker = %worker_name, batchers = batcher_count, workers = worker_count, batch_size, "endpoint loaded");

        Ok(Arc::new(WorkerInfo {
            endpoint,
            worker_name,
            parameters: parameters.clone(),
            batch_size,
            allocators,
            metadata,
            batcher_count,
            worker_count,
            ingress_tx,
            batch_tx,
            batcher_threads: Mutex::new(batcher_threads),
            worker_threads: Mutex::new(worker_threads),
            refcount: AtomicUsize::new(1),
            ready: AtomicBool::new(true),
            next,
        }))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn allocators(&self) -> &[MemoryKind] {
        &self.allocators
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn next(&self) -> Option<&Arc<WorkerInfo>> {
        self.next.as_ref()
    }

    /// Whether a load of `worker_name` with `parameters` may share this
    /// endpoint.
    pub(crate) fn shares_with(&self, worker_name: &str, parameters: &ParameterMap) -> bool {
        self.worker_name == worker_name
            && self.parameters.sharing_key() == parameters.sharing_key()
    }

    pub(crate) fn increment(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the refcount, reporting whether this was the last
    /// reference.
    pub(crate) fn decrement(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Put a request on the ingress queue.
    pub(crate) fn enqueue_request(&self, request: InferenceRequest) -> Result<(), Error> {
        counter!(observation::INGRESS_REQUESTS).increment(1);
        self.ingress_tx
            .send(Some(QueuedRequest {
                request,
                received: Instant::now(),
            }))
            .map_err(|_| Error::Runtime(format!("endpoint '{}' is shutting down", self.endpoint)))
    }

    /// Put a batch produced by an upstream worker on this stage's queue.
    pub(crate) fn enqueue_batch(&self, batch: Batch) -> Result<(), Batch> {
        self.batch_tx
            .send(Some(batch))
            .map_err(|err| match err.into_inner() {
                Some(batch) => batch,
                None => Batch::new(),
            })
    }

    /// Push shutdown sentinels through both queues and join every thread.
    /// Worker instances run `release`/`destroy` as their threads drain.
    pub(crate) fn shutdown(&self) {
        self.ready.store(false, Ordering::Release);
        for _ in 0..self.batcher_count {
            let _ = self.ingress_tx.send(None);
        }
        for handle in self.batcher_threads.lock().drain(..) {
            let _ = handle.join();
        }
        // each batcher forwarded one sentinel; top up so every worker
        // thread sees one
        for _ in 0..self.worker_count.saturating_sub(self.batcher_count) {
            let _ = self.batch_tx.send(None);
        }
        for handle in self.worker_threads.lock().drain(..) {
            let _ = handle.join();
        }
        info!(endpoint = %self.endpoint, "endpoint unloaded");
    }

    /// Hand a consumed batch's buffers back to the pool.
    pub(crate) fn return_input_buffers(pool: &MemoryPool, batch: &mut Batch) {
        for buffer in batch.take_buffers() {
            pool.put(buffer);
        }
    }
}


/// Fail every request still carrying a callback in this batch.
fn fail_batch(batch: &mut Batch, err: &Error) {
    let message = err.to_string();
    for request in batch.requests_mut() {
        counter!(observation::REQUEST_ERRORS).increment(1);
        request.run_callback_error(message.clone());
    }
}

/// The framework loop around a worker instance: dequeue, run, forward or
/// respond, return buffers. Exits on the sentinel.
fn worker_loop(
    endpoint: String,
    mut worker: Box<dyn Worker>,
    batches: crossbeam_channel::Receiver<Option<Batch>>,
    next: Option<Arc<WorkerInfo>>,
    pool: Arc<MemoryPool>,
) {
    while let Ok(item) = batches.recv() {
        let Some(mut batch) = item else { break };

        let ctx = WorkerContext {
            pool: &pool,
            next_allocators: next
                .as_ref()
                .map(|next| next.allocators().to_vec())
                .unwrap_or_else(|| worker.allocators()),
            has_next: next.is_some(),
        };

        match worker.run(&mut batch, &ctx) {
            Ok(Some(mut new_batch)) => match &next {
                Some(next) => {
                    if let Err(mut returned) = next.enqueue_batch(new_batch) {
                        error!(endpoint = %endpoint, next = %next.endpoint(), "next stage rejected the batch");
                        fail_batch(&mut returned, &Error::Runtime("downstream worker is gone".into()));
                        WorkerInfo::return_input_buffers(&pool, &mut returned);
                    }
                }
                None => {
                    // end of the chain: translate into responses
                    respond(&mut new_batch);
                    WorkerInfo::return_input_buffers(&pool, &mut new_batch);
                }
            },
            Ok(None) => {}
            Err(err) => {
                error!(endpoint = %endpoint, %err, "worker failed a batch");
                fail_batch(&mut batch, &err);
            }
        }

        WorkerInfo::return_input_buffers(&pool, &mut batch);
    }

    worker.release();
    worker.destroy();
    debug!(endpoint = %endpoint, "worker thread exiting");
}
