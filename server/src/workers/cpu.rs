/// The Cpu worker: runs a compiled-in model over each batch
use metrics::counter;
use tracing::debug;

use crate::batch::Batch;
use crate::batcher::BatcherKind;
use crate::error::Error;
use crate::models::{make_model, Model};
use crate::observation;
use crate::parameters::ParameterMap;
use crate::request::{InferenceRequestInput, TensorData};
use crate::tensor::ModelMetadata;
use crate::worker::{Worker, WorkerContext};

const DEFAULT_BATCH_SIZE: usize = 1;

/// Generic CPU backend: the `model` load parameter names the kernel to
/// run. The worker allocates the downstream rows, wires one forwarded
/// request per batch index, and lets the model fill the rows; the chain
/// (or the framework, when nothing follows) turns them into responses.
pub struct Cpu {
    batch_size: usize,
    model_name: String,
    model: Option<Box<dyn Model>>,
    metadata: ModelMetadata,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            model_name: String::new(),
            model: None,
            metadata: ModelMetadata::new("cpu", "cpu"),
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for Cpu {
    fn init(&mut self, parameters: &ParameterMap) -> Result<(), Error> {
        if let Some(batch_size) = parameters.get_i32("batch_size") {
            if batch_size < 1 {
                return Err(Error::InvalidArgument(format!(
                    "batch_size must be positive, got {batch_size}"
                )));
            }
            self.batch_size = batch_size as usize;
        }
        match parameters.get_string("model") {
            Some(model) => self.model_name = model.to_string(),
            None => return Err(Error::InvalidArgument("no model specified".to_string())),
        }
        Ok(())
    }

    fn acquire(&mut self, _parameters: &ParameterMap) -> Result<(), Error> {
        let model = make_model(&self.model_name)?;
        self.metadata.inputs = model.inputs();
        self.metadata.outputs = model.outputs();
        self.model = Some(model);
        Ok(())
    }

    fn run(&mut self, batch: &mut Batch, ctx: &WorkerContext<'_>) -> Result<Option<Batch>, Error> {
        debug!(model = %self.model_name, size = batch.size(), "got batch in cpu");
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| Error::Runtime("cpu worker ran before acquire".to_string()))?;

        // one buffer per output tensor, rows for the whole batch
        let outputs = model.outputs();
        let mut buffers = Vec::with_capacity(outputs.len());
        for tensor in &outputs {
            buffers.push(ctx.pool.get(&ctx.next_allocators, tensor, self.batch_size)?);
        }

        let mut new_batch = batch.propagate();
        for j in 0..batch.size() {
            let mut forwarded = batch.request_mut(j).propagate();
            for (slot, tensor) in outputs.iter().enumerate() {
                let mut input = InferenceRequestInput::new(tensor.clone());
                input.set_data(TensorData::Shared {
                    buffer: slot,
                    offset: j * tensor.byte_size(),
                });
                forwarded.add_input_tensor(input);
            }
            new_batch.add_request(forwarded);
        }
        new_batch.set_buffers(buffers, vec![]);

        if let Err(err) = model.run(batch, &mut new_batch) {
            counter!(observation::REQUEST_ERRORS).increment(batch.size() as u64);
            for request in new_batch.requests_mut() {
                request.run_callback_error(err.to_string());
            }
        }

        Ok(Some(new_batch))
    }

    fn release(&mut self) {
        self.model = None;
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
