/// Batch assembly
///
/// Batcher threads sit between an endpoint's ingress queue and its worker
/// queue. They group compatible requests, move the request payloads into
/// pool buffers shared by the whole batch, and hand the batch downstream.
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use metrics::{counter, histogram};
use tracing::{debug, error};

use crate::batch::Batch;
use crate::error::Error;
use crate::memory_pool::{Buffer, MemoryKind, MemoryPool};
use crate::observation;
use crate::request::{InferenceRequest, TensorData};
use crate::tensor::Tensor;

/// How a batcher decides that a batch is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatcherKind {
    /// Emit on reaching the batch size or the assembly deadline, whichever
    /// comes first.
    Soft,
    /// Block until the batch size is reached. Meant for fixed-shape
    /// backends and deterministic throughput runs; can wait indefinitely.
    Hard,
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub kind: BatcherKind,
    pub batch_size: usize,
    pub timeout: Duration,
}

pub const DEFAULT_BATCHER_TIMEOUT: Duration = Duration::from_millis(100);

/// A request plus its arrival timestamp, as carried by the ingress queue.
/// `None` on the queue is the shutdown sentinel.
pub(crate) struct QueuedRequest {
    pub request: InferenceRequest,
    pub received: Instant,
}

/// The tensor layout a batch is assembled against: one slot per input of
/// the first accepted request.
fn slot_layout(request: &InferenceRequest) -> Vec<Tensor> {
    request
        .inputs()
        .iter()
        .map(|input| input.tensor().clone())
        .collect()
}

/// Whether `request` fits a layout: same slot count, and per slot the same
/// datatype and byte size. Names may differ.
fn fits_layout(layout: &[Tensor], request: &InferenceRequest) -> bool {
    request.inputs().len() == layout.len()
        && request.inputs().iter().zip(layout).all(|(input, slot)| {
            input.tensor().datatype() == slot.datatype()
                && input.tensor().byte_size() == slot.byte_size()
        })
}

/// Long-running batcher loop. Exits when the sentinel arrives (flushing any
/// partial batch first, then forwarding the sentinel) or when either queue
/// disconnects.
pub(crate) fn run_batcher(
    config: BatcherConfig,
    endpoint: String,
    allocators: Vec<MemoryKind>,
    output_tensors: Vec<Tensor>,
    pool: Arc<MemoryPool>,
    ingress: Receiver<Option<QueuedRequest>>,
    batches: Sender<Option<Batch>>,
) {
    // a request that arrived but did not fit the previous batch's layout
    let mut pending: Option<QueuedRequest> = None;

    loop {
        let first = match pending.take() {
            Some(item) => item,
            None => match ingress.recv() {
                Ok(Some(item)) => item,
                Ok(None) => {
                    let _ = batches.send(None);
                    break;
                }
                Err(_) => break,
            },
        };

        let deadline = Instant::now() + config.timeout;
        let layout = slot_layout(&first.request);
        let mut accepted = vec![first];
        let mut shutdown = false;

        while accepted.len() < config.batch_size {
            let item = match config.kind {
                BatcherKind::Soft => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    match ingress.recv_timeout(deadline - now) {
                        Ok(item) => item,
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => {
                            shutdown = true;
                            break;
                        }
                    }
                }
                BatcherKind::Hard => match ingress.recv() {
                    Ok(item) => item,
                    Err(_) => {
                        shutdown = true;
                        break;
                    }
                },
            };
            match item {
                Some(item) => {
                    if fits_layout(&layout, &item.request) {
                        accepted.push(item);
                    } else {
                        // close this batch; the newcomer opens the next one
                        pending = Some(item);
                        break;
                    }
                }
                None => {
                    shutdown = true;
                    break;
                }
            }
        }

        if let Some(batch) = assemble(&config, &endpoint, &allocators, &output_tensors, &pool, layout, accepted)
        {
            counter!(observation::BATCHES_EMITTED).increment(1);
            histogram!(observation::BATCH_SIZE).record(batch.size() as f64);
            debug!(endpoint = %endpoint, size = batch.size(), "emitting batch");
            if batches.send(Some(batch)).is_err() {
                break;
            }
        }

        if shutdown {
            let _ = batches.send(None);
            break;
        }
    }
}

/// Allocate the per-slot batch buffers, copy every accepted request's
/// payload in, and point the requests at their offsets. Requests with bad
/// payloads fail individually; an allocation failure fails them all.
fn assemble(
    config: &BatcherConfig,
    endpoint: &str,
    allocators: &[MemoryKind],
    output_tensors: &[Tensor],
    pool: &MemoryPool,
    layout: Vec<Tensor>,
    accepted: Vec<QueuedRequest>,
) -> Option<Batch> {
    let buffers = allocate_buffers(pool, allocators, &layout, output_tensors, config.batch_size);
    let (mut input_buffers, output_buffers) = match buffers {
        Ok(buffers) => buffers,
        Err(err) => {
            error!(endpoint = %endpoint, %err, "failed to allocate batch buffers");
            for mut item in accepted {
                item.request
                    .run_callback_error(format!("failed to allocate batch buffers: {err}"));
                counter!(observation::REQUEST_ERRORS).increment(1);
            }
            return None;
        }
    };

    let mut batch = Batch::new();
    for (j, item) in accepted.into_iter().enumerate() {
        let QueuedRequest { mut request, received } = item;

        if let Err(message) = stage_request(&mut request, &layout, &mut input_buffers, j) {
            request.run_callback_error(message);
            counter!(observation::REQUEST_ERRORS).increment(1);
            continue;
        }

        let trace = request.take_trace();
        batch.add_request(request);
        batch.add_model(endpoint);
        batch.add_time(received);
        batch.add_trace(trace);
    }

    if batch.is_empty() {
        for buffer in input_buffers.into_iter().chain(output_buffers) {
            pool.put(buffer);
        }
        return None;
    }

    batch.set_buffers(input_buffers, output_buffers);
    Some(batch)
}

fn allocate_buffers(
    pool: &MemoryPool,
    allocators: &[MemoryKind],
    layout: &[Tensor],
    output_tensors: &[Tensor],
    batch_size: usize,
) -> Result<(Vec<Buffer>, Vec<Buffer>), Error> {
    let mut inputs = Vec::with_capacity(layout.len());
    let mut outputs = Vec::new();

    let result = (|| {
        for tensor in layout {
            inputs.push(pool.get(allocators, tensor, batch_size)?);
        }
        // statically-shaped outputs only; dynamic outputs are allocated by
        // the worker once their shapes are known
        for tensor in output_tensors.iter().filter(|tensor| tensor.byte_size() > 0) {
            outputs.push(pool.get(allocators, tensor, batch_size)?);
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok((inputs, outputs)),
        Err(err) => {
            for buffer in inputs.into_iter().chain(outputs) {
                pool.put(buffer);
            }
            Err(err)
        }
    }
}

/// Copy one request's input payloads into the batch buffers at row `j` and
/// re-point its tensors at the shared storage.
fn stage_request(
    request: &mut InferenceRequest,
    layout: &[Tensor],
    input_buffers: &mut [Buffer],
    j: usize,
) -> Result<(), String> {
    for (slot, tensor) in layout.iter().enumerate() {
        let len = tensor.byte_size();
        let offset = j * len;
        {
            let input = &request.inputs()[slot];
            match input.data() {
                TensorData::Owned(data) => {
                    if data.len() < len {
                        return Err(format!(
                            "input '{}' carries {} bytes but its shape needs {}",
                            input.tensor().name(),
                            data.len(),
                            len
                        ));
                    }
                    input_buffers[slot].write_at(offset, &data[..len]);
                }
                TensorData::Shared { .. } => {
                    return Err(format!(
                        "input '{}' arrived with shared data attached",
                        input.tensor().name()
                    ));
                }
                TensorData::Empty => {
                    return Err(format!(
                        "input '{}' has no data attached",
                        input.tensor().name()
                    ));
                }
            }
        }
        request.set_input_data(slot, TensorData::Shared { buffer: slot, offset });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::data_types::DataType;
    use crate::request::{InferenceRequestInput, InferenceResponse};

    fn uint32_request(value: u32) -> (QueuedRequest, mpsc::Receiver<InferenceResponse>) {
        let (tx, rx) = mpsc::channel();
        let mut request = InferenceRequest::new();
        request.add_input_tensor(InferenceRequestInput::from_owned(
            Tensor::new("input", vec![1], DataType::Uint32),
            value.to_le_bytes().to_vec(),
        ));
        request.set_callback(Box::new(move |response| {
            let _ = tx.send(response);
        }));
        (
            QueuedRequest {
                request,
                received: Instant::now(),
            },
            rx,
        )
    }

    fn spawn_batcher(
        kind: BatcherKind,
        batch_size: usize,
        timeout: Duration,
        allocators: Vec<MemoryKind>,
    ) -> (
        Sender<Option<QueuedRequest>>,
        Receiver<Option<Batch>>,
        thread::JoinHandle<()>,
    ) {
        let (ingress_tx, ingress_rx) = crossbeam_channel::unbounded();
        let (batch_tx, batch_rx) = crossbeam_channel::unbounded();
        let config = BatcherConfig {
            kind,
            batch_size,
            timeout,
        };
        let handle = thread::spawn(move || {
            run_batcher(
                config,
                "echo".to_string(),
                allocators,
                vec![],
                Arc::new(MemoryPool::new()),
                ingress_rx,
                batch_tx,
            )
        });
        (ingress_tx, batch_rx, handle)
    }

    #[test]
    fn soft_batcher_flushes_undersized_batch_on_timeout() {
        let (ingress, batches, handle) = spawn_batcher(
            BatcherKind::Soft,
            4,
            Duration::from_millis(50),
            vec![MemoryKind::Cpu],
        );

        let started = Instant::now();
        let (item, _rx) = uint32_request(1);
        ingress.send(Some(item)).unwrap();
        let (item, _rx2) = uint32_request(2);
        ingress.send(Some(item)).unwrap();

        let batch = batches
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(batch.size(), 2);
        // deadline-bound emission, with a generous margin for slow CI
        assert!(started.elapsed() < Duration::from_millis(50) + Duration::from_secs(1));

        ingress.send(None).unwrap();
        assert!(batches.recv_timeout(Duration::from_secs(2)).unwrap().is_none());
        handle.join().unwrap();
    }

    #[test]
    fn soft_batcher_emits_as_soon_as_the_batch_fills() {
        let (ingress, batches, handle) = spawn_batcher(
            BatcherKind::Soft,
            2,
            Duration::from_secs(30),
            vec![MemoryKind::Cpu],
        );

        let (item, _rx) = uint32_request(1);
        ingress.send(Some(item)).unwrap();
        let (item, _rx2) = uint32_request(2);
        ingress.send(Some(item)).unwrap();

        // far below the 30 s deadline: size is what completed the batch
        let batch = batches
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(batch.size(), 2);

        ingress.send(None).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn hard_batcher_blocks_until_full() {
        let (ingress, batches, handle) = spawn_batcher(
            BatcherKind::Hard,
            2,
            Duration::from_millis(10),
            vec![MemoryKind::Cpu],
        );

        let (item, _rx) = uint32_request(1);
        ingress.send(Some(item)).unwrap();
        // no deadline: nothing comes out with the batch half full
        assert!(batches.recv_timeout(Duration::from_millis(200)).is_err());

        let (item, _rx2) = uint32_request(2);
        ingress.send(Some(item)).unwrap();
        let batch = batches
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(batch.size(), 2);

        ingress.send(None).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn sentinel_flushes_partial_batch_then_exits() {
        let (ingress, batches, handle) = spawn_batcher(
            BatcherKind::Hard,
            4,
            Duration::from_millis(10),
            vec![MemoryKind::Cpu],
        );

        let (item, _rx) = uint32_request(1);
        ingress.send(Some(item)).unwrap();
        ingress.send(None).unwrap();

        let batch = batches
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(batch.size(), 1);
        assert!(batches.recv_timeout(Duration::from_secs(2)).unwrap().is_none());
        handle.join().unwrap();
    }

    #[test]
    fn incompatible_layout_closes_the_batch() {
        let (ingress, batches, handle) = spawn_batcher(
            BatcherKind::Soft,
            4,
            Duration::from_millis(50),
            vec![MemoryKind::Cpu],
        );

        let (item, _rx) = uint32_request(1);
        ingress.send(Some(item)).unwrap();

        // different slot layout: one Uint8 x3 input
        let (tx, _keep) = mpsc::channel::<InferenceResponse>();
        let mut request = InferenceRequest::new();
        request.add_input_tensor(InferenceRequestInput::from_owned(
            Tensor::new("bytes", vec![3], DataType::Uint8),
            vec![1, 2, 3],
        ));
        request.set_callback(Box::new(move |response| {
            let _ = tx.send(response);
        }));
        ingress
            .send(Some(QueuedRequest {
                request,
                received: Instant::now(),
            }))
            .unwrap();

        let first = batches
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(first.size(), 1);
        assert_eq!(first.request(0).inputs()[0].tensor().datatype(), DataType::Uint32);

        let second = batches
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(second.size(), 1);
        assert_eq!(second.request(0).inputs()[0].tensor().datatype(), DataType::Uint8);

        ingress.send(None).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn allocation_failure_fails_every_request_in_the_batch() {
        // Gpu has no registered allocator, so buffer acquisition fails
        let (ingress, batches, handle) = spawn_batcher(
            BatcherKind::Soft,
            2,
            Duration::from_millis(20),
            vec![MemoryKind::Gpu],
        );

        let (item, rx1) = uint32_request(1);
        ingress.send(Some(item)).unwrap();
        let (item, rx2) = uint32_request(2);
        ingress.send(Some(item)).unwrap();

        for rx in [rx1, rx2] {
            let response = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert!(response.is_error());
        }
        // the failed batch is dropped, not forwarded
        assert!(batches.recv_timeout(Duration::from_millis(200)).is_err());

        ingress.send(None).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn staged_requests_point_into_the_batch_buffers() {
        let (ingress, batches, handle) = spawn_batcher(
            BatcherKind::Hard,
            2,
            Duration::from_millis(10),
            vec![MemoryKind::Cpu],
        );

        for value in [3u32, 9u32] {
            let (item, _rx) = uint32_request(value);
            ingress.send(Some(item)).unwrap();
        }

        let batch = batches
            .recv_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(batch.size(), 2);
        assert_eq!(batch.input_buffers().len(), 1);
        for (j, expected) in [3u32, 9u32].into_iter().enumerate() {
            let input = &batch.request(j).inputs()[0];
            assert!(input.data().is_shared());
            let bytes = batch.input_bytes(input).unwrap();
            assert_eq!(u32::from_le_bytes(bytes.try_into().unwrap()), expected);
        }

        ingress.send(None).unwrap();
        handle.join().unwrap();
    }
}
