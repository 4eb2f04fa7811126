/// The Echo worker: adds one to each Uint32 input and responds
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

const DEFAULT_BATCH_SIZE: usize = 1;

/// Accepts Uint32 input tensors, adds one to each value and returns the
/// corresponding number of output tensors. Terminal: it runs the request
/// callbacks itself.
pub struct Echo {
    batch_size: usize,
    metadata: ModelMetadata,
}

impl Echo {
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            metadata: ModelMetadata::new("echo", "cpu"),
        }
    }
}

impl Default for Echo {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for Echo {
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
        self.metadata
            .add_input_tensor("input", DataType::Uint32, vec![1]);
        self.metadata
            .add_output_tensor("output", DataType::Uint32, vec![1]);
        Ok(())
    }

    fn run(&mut self, batch: &mut Batch, _ctx: &WorkerContext<'_>) -> Result<Option<Batch>, Error> {
        debug!(size = batch.size(), "got batch in echo");
        let requests = batch.take_requests();
        for (j, mut request) in requests.into_iter().enumerate() {
            let mut response = InferenceResponse::new();
            response.set_id(request.id());
            response.set_model(batch.model(j));

            let mut failure = None;
            for (i, input) in request.inputs().iter().enumerate() {
                if input.tensor().datatype() != DataType::Uint32 {
                    failure = Some(format!(
                        "input '{}' must be UINT32, got {}",
                        input.tensor().name(),
                        input.tensor().datatype()
                    ));
                    break;
                }
                let bytes = match batch.input_bytes(input) {
                    Ok(bytes) if bytes.len() >= 4 => bytes,
                    Ok(_) => {
                        failure = Some(format!("input '{}' too small", input.tensor().name()));
                        break;
                    }
                    Err(err) => {
                        failure = Some(err.to_string());
                        break;
                    }
                };
                let value = u32::from_le_bytes(bytes[..4].try_into().unwrap()).wrapping_add(1);

                let name = request
                    .outputs()
                    .get(i)
                    .map(|output| output.name.as_str())
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| input.tensor().name());
                response.add_output(InferenceResponseOutput::new(
                    Tensor::new(name, vec![1], DataType::Uint32),
                    value.to_le_bytes().to_vec(),
                ));
            }

            match failure {
                Some(message) => {
                    counter!(observation::REQUEST_ERRORS).increment(1);
                    request.run_callback_error(message);
                }
                None => {
                    response.set_context(batch.trace(j).clone());
                    counter!(observation::EGRESS_REQUESTS).increment(1);
                    histogram!(observation::REQUEST_LATENCY)
                        .record(batch.time(j).elapsed().as_secs_f64());
                    request.run_callback_once(response);
                }
            }
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
