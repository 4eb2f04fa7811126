/// The EchoMulti worker: a multi-input/multi-output test model
use metrics::{counter, histogram};
use tracing::debug;

use crate::batch::Batch;
use crate::batcher::BatcherKind;
use crate::data_types::DataType;
use crate::error::Error;
use crate::observation;
use crate::parameters::ParameterMap;
use crate::request::{InferenceResponse, InferenceResponseOutput};
use crate::tensor::{ModelMetadata, Tensor};
use crate::worker::{Worker, WorkerContext};

const INPUT_LENGTHS: [usize; 2] = [1, 2];
const OUTPUT_LENGTHS: [usize; 3] = [1, 4, 3];
const DEFAULT_BATCH_SIZE: usize = 1;

/// Accepts two Uint32 input tensors and produces three output tensors by
/// cycling the flattened input values across the declared fan-out.
pub struct EchoMulti {
    batch_size: usize,
    metadata: ModelMetadata,
}

impl EchoMulti {
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            metadata: ModelMetadata::new("echo_multi", "cpu"),
        }
    }
}

impl Default for EchoMulti {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for EchoMulti {
    fn init(&mut self, parameters: &ParameterMap) -> Result<(), Error> {
        if let Some(batch_size) = parameters.get_i32("batch_size") {
            if batch_size < 1 {
                return Err(Error::InvalidArgument(format!(
                    "batch_size must be positive, got {batch_size}"
                )));
            }
            self.batch_size = batch_size as usize;
        }
        Ok(())
    }

    fn acquire(&mut self, _parameters: &ParameterMap) -> Result<(), Error> {
        for (i, len) in INPUT_LENGTHS.iter().enumerate() {
            self.metadata
                .add_input_tensor(format!("input{i}"), DataType::Uint32, vec![*len as u64]);
        }
        for (i, len) in OUTPUT_LENGTHS.iter().enumerate() {
            self.metadata
                .add_output_tensor(format!("output{i}"), DataType::Uint32, vec![*len as u64]);
        }
        Ok(())
    }

    fn run(&mut self, batch: &mut Batch, _ctx: &WorkerContext<'_>) -> Result<Option<Batch>, Error> {
        debug!(size = batch.size(), "got batch in echo_multi");
        let requests = batch.take_requests();
        for (j, mut request) in requests.into_iter().enumerate() {
            let args = match gather_args(batch, &request) {
                Ok(args) => args,
                Err(message) => {
                    counter!(observation::REQUEST_ERRORS).increment(1);
                    request.run_callback_error(message);
                    continue;
                }
            };

            let mut response = InferenceResponse::new();
            response.set_id(request.id());
            response.set_model(batch.model(j));

            let mut arg_index = 0;
            for (i, len) in OUTPUT_LENGTHS.iter().enumerate() {
                let mut data = Vec::with_capacity(len * 4);
                for _ in 0..*len {
                    data.extend_from_slice(&args[arg_index].to_le_bytes());
                    arg_index = (arg_index + 1) % args.len();
                }

                let name = request
                    .outputs()
                    .get(i)
                    .map(|output| output.name.as_str())
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| request.inputs()[0].tensor().name());
                response.add_output(InferenceResponseOutput::new(
                    Tensor::new(name, vec![*len as u64], DataType::Uint32),
                    data,
                ));
            }

            response.set_context(batch.trace(j).clone());
            counter!(observation::EGRESS_REQUESTS).increment(1);
            histogram!(observation::REQUEST_LATENCY).record(batch.time(j).elapsed().as_secs_f64());
            request.run_callback_once(response);
        }
        Ok(None)
    }

    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn batcher_kind(&self) -> BatcherKind {
        BatcherKind::Hard
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Flatten the request's input values, validating the declared shapes.
fn gather_args(batch: &Batch, request: &crate::request::InferenceRequest) -> Result<Vec<u32>, String> {
    if request.inputs().len() != INPUT_LENGTHS.len() {
        return Err(format!(
            "expected {} input tensors, got {}",
            INPUT_LENGTHS.len(),
            request.inputs().len()
        ));
    }

    let mut args = Vec::with_capacity(INPUT_LENGTHS.iter().sum());
    for (input, expected_len) in request.inputs().iter().zip(INPUT_LENGTHS) {
        if input.tensor().datatype() != DataType::Uint32 {
            return Err(format!(
                "input '{}' must be UINT32, got {}",
                input.tensor().name(),
                input.tensor().datatype()
            ));
        }
        if input.tensor().size() != expected_len {
            return Err(format!(
                "input '{}' must have {} elements, got {}",
                input.tensor().name(),
                expected_len,
                input.tensor().size()
            ));
        }
        let bytes = batch.input_bytes(input).map_err(|err| err.to_string())?;
        for chunk in bytes.chunks_exact(4).take(expected_len) {
            args.push(u32::from_le_bytes(chunk.try_into().unwrap()));
        }
    }
    Ok(args)
}
