/// The worker contract and the built-in worker registry
use metrics::{counter, histogram};

use crate::batch::Batch;
use crate::batcher::BatcherKind;
use crate::error::Error;
use crate::memory_pool::{MemoryKind, MemoryPool};
use crate::observation;
use crate::parameters::ParameterMap;
use crate::request::{InferenceResponse, InferenceResponseOutput};
use crate::tensor::ModelMetadata;
use crate::workers;

/// What a worker sees while processing one batch.
pub struct WorkerContext<'a> {
    pub pool: &'a MemoryPool,
    /// Allocator preferences of the downstream stage; the worker's own when
    /// the chain ends here. Buffers produced for the next stage come from
    /// these kinds.
    pub next_allocators: Vec<MemoryKind>,
    pub has_next: bool,
}

/// A pipeline stage that consumes batches. One boxed instance runs per
/// worker thread; the lifecycle methods are each invoked exactly once, in
/// order: `init`, `acquire`, any number of `run` calls, `release`,
/// `destroy`.
pub trait Worker: Send {
    /// Parse load-time parameters. No heavyweight work here.
    fn init(&mut self, parameters: &ParameterMap) -> Result<(), Error>;

    /// Open model assets and populate the metadata. A failure here aborts
    /// the load and tears the endpoint down.
    fn acquire(&mut self, parameters: &ParameterMap) -> Result<(), Error>;

    /// Transform one batch. Returning a new batch forwards work downstream
    /// (or, at the end of a chain, to response translation); returning
    /// `None` means the worker completed the requests itself. Errors fail
    /// the whole batch; per-request problems must instead consume the
    /// affected request's callback and leave the rest alone.
    fn run(&mut self, batch: &mut Batch, ctx: &WorkerContext<'_>) -> Result<Option<Batch>, Error>;

    fn release(&mut self) {}

    fn destroy(&mut self) {}

    fn metadata(&self) -> &ModelMetadata;

    /// Memory kinds this worker can consume without a copy, most preferred
    /// first. The upstream batcher allocates input buffers from this list.
    fn allocators(&self) -> Vec<MemoryKind> {
        vec![MemoryKind::Cpu]
    }

    fn batcher_kind(&self) -> BatcherKind {
        BatcherKind::Soft
    }

    fn batch_size(&self) -> usize;
}

/// Construct a worker implementation by name.
///
/// The registry is the static stand-in for dynamically loaded worker
/// modules; an unknown name fails like a missing module would.
pub fn make_worker(name: &str) -> Result<Box<dyn Worker>, Error> {
    match name {
        "cpu" => Ok(Box::new(workers::cpu::Cpu::new())),
        "echo" => Ok(Box::new(workers::echo::Echo::new())),
        "echo_multi" => Ok(Box::new(workers::echo_multi::EchoMulti::new())),
        "responder" => Ok(Box::new(workers::responder::Responder::new())),
        "base64_decode" => Ok(Box::new(workers::base64_decode::Base64Decode::new())),
        "base64_encode" => Ok(Box::new(workers::base64_encode::Base64Encode::new())),
        "invert_image" => Ok(Box::new(workers::invert_image::InvertImage::new())),
        _ => Err(Error::FileNotFound(format!(
            "no worker implementation named '{name}'"
        ))),
    }
}

/// Translate a batch into per-request responses: every input tensor the
/// batch carries becomes an output tensor of its request's response. This
/// is the terminal step of every chain whose workers do not run callbacks
/// themselves.
pub(crate) fn respond(batch: &mut Batch) {
    let requests = batch.take_requests();
    for (j, mut request) in requests.into_iter().enumerate() {
        let mut response = InferenceResponse::new();
        response.set_id(request.id());
        response.set_model(batch.model(j));

        let mut failure = None;
        for (i, input) in request.inputs().iter().enumerate() {
            let bytes = match batch.input_bytes(input) {
                Ok(bytes) => bytes,
                Err(err) => {
                    failure = Some(err.to_string());
                    break;
                }
            };
            let mut tensor = input.tensor().clone();
            let requested = request
                .outputs()
                .get(i)
                .map(|output| output.name.as_str())
                .filter(|name| !name.is_empty());
            if let Some(name) = requested {
                tensor.set_name(name);
            }
            response.add_output(InferenceResponseOutput::new(tensor, bytes.to_vec()));
        }

        match failure {
            Some(message) => {
                counter!(observation::REQUEST_ERRORS).increment(1);
                request.run_callback_error(message);
            }
            None => {
                response.set_context(batch.trace(j).clone());
                counter!(observation::EGRESS_REQUESTS).increment(1);
                histogram!(observation::REQUEST_LATENCY).record(batch.time(j).elapsed().as_secs_f64());
                request.run_callback_once(response);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use super::*;
    use crate::data_types::DataType;
    use crate::request::{InferenceRequest, InferenceRequestInput, InferenceRequestOutput, TraceContext};
    use crate::tensor::Tensor;

    #[test]
    fn unknown_worker_name_fails_like_a_missing_module() {
        assert!(matches!(make_worker("warp_drive"), Err(Error::FileNotFound(_))));
        assert!(make_worker("echo").is_ok());
    }

    #[test]
    fn respond_echoes_batch_inputs_as_outputs() {
        let (tx, rx) = mpsc::channel();
        let mut request = InferenceRequest::new();
        request.set_id("42");
        request.add_input_tensor(InferenceRequestInput::from_owned(
            Tensor::new("pixels", vec![4], DataType::Uint8),
            vec![9, 8, 7, 6],
        ));
        request.add_output_tensor(InferenceRequestOutput::new("image_out"));
        request.set_callback(Box::new(move |response| {
            let _ = tx.send(response);
        }));

        let mut batch = Batch::new();
        batch.add_request(request);
        batch.add_model("invert_image");
        batch.add_time(Instant::now());
        batch.add_trace(TraceContext::new());

        respond(&mut batch);

        let response = rx.recv().unwrap();
        assert!(!response.is_error());
        assert_eq!(response.id(), "42");
        assert_eq!(response.model(), "invert_image");
        assert_eq!(response.outputs().len(), 1);
        // the requested output name wins over the input name
        assert_eq!(response.outputs()[0].tensor.name(), "image_out");
        assert_eq!(response.outputs()[0].data, vec![9, 8, 7, 6]);
    }
}
