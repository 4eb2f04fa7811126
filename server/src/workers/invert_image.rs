/// The InvertImage worker: per-channel color inversion
use metrics::counter;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::data_types::DataType;
use crate::error::Error;
use crate::observation;
use crate::parameters::ParameterMap;
use crate::request::{InferenceRequestInput, TensorData};
use crate::tensor::{ModelMetadata, Tensor};
use crate::worker::{Worker, WorkerContext};

const DEFAULT_BATCH_SIZE: usize = 1;

/// Replaces every channel value x of a `Uint8 [h, w, 3]` tensor with
/// `255 - x` and forwards the result downstream.
pub struct InvertImage {
    batch_size: usize,
    metadata: ModelMetadata,
}

impl InvertImage {
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            metadata: ModelMetadata::new("invert_image", "cpu"),
        }
    }
}

impl Default for InvertImage {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for InvertImage {
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
            .add_input_tensor("input", DataType::Uint8, vec![]);
        self.metadata
            .add_output_tensor("output", DataType::Uint8, vec![]);
        Ok(())
    }

    fn run(&mut self, batch: &mut Batch, ctx: &WorkerContext<'_>) -> Result<Option<Batch>, Error> {
        debug!(size = batch.size(), "got batch in invert_image");
        let batch_size = batch.size();

        let mut inverted: Vec<Result<(Vec<u8>, Vec<u64>), String>> = Vec::with_capacity(batch_size);
        for j in 0..batch_size {
            inverted.push(invert_one(batch, j));
        }

        let max_size = inverted
            .iter()
            .filter_map(|result| result.as_ref().ok())
            .map(|(raw, _)| raw.len())
            .max()
            .unwrap_or(0);

        let slot = Tensor::new("output", vec![max_size as u64], DataType::Uint8);
        let mut buffer = ctx.pool.get(&ctx.next_allocators, &slot, batch_size)?;

        let mut new_batch = batch.propagate();
        for (j, result) in inverted.into_iter().enumerate() {
            let request = batch.request_mut(j);
            match result {
                Ok((raw, shape)) => {
                    let offset = j * max_size;
                    buffer.write_at(offset, &raw);

                    let mut forwarded = request.propagate();
                    let mut input =
                        InferenceRequestInput::new(Tensor::new("output", shape, DataType::Uint8));
                    input.set_data(TensorData::Shared { buffer: 0, offset });
                    forwarded.add_input_tensor(input);
                    new_batch.add_request(forwarded);
                }
                Err(message) => {
                    warn!(index = j, %message, "failed to invert request");
                    counter!(observation::REQUEST_ERRORS).increment(1);
                    request.run_callback_error(message);
                    new_batch.add_request(request.propagate());
                }
            }
        }

        new_batch.set_buffers(vec![buffer], vec![]);
        Ok(Some(new_batch))
    }

    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

fn invert_one(batch: &Batch, j: usize) -> Result<(Vec<u8>, Vec<u64>), String> {
    let request = batch.request(j);
    if request.inputs().len() != 1 {
        return Err("only one input tensor should be present".to_string());
    }
    let input = &request.inputs()[0];
    if input.tensor().datatype() != DataType::Uint8 {
        return Err(format!(
            "input '{}' must be UINT8, got {}",
            input.tensor().name(),
            input.tensor().datatype()
        ));
    }
    if input.tensor().size() == 0 {
        return Err("input image is empty".to_string());
    }
    let bytes = batch.input_bytes(input).map_err(|err| err.to_string())?;
    let inverted = bytes.iter().map(|value| 255 - value).collect();
    Ok((inverted, input.tensor().shape().to_vec()))
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::request::{InferenceRequest, TraceContext};

    #[test]
    fn inversion_is_its_own_inverse() {
        let pixels: Vec<u8> = vec![0, 127, 255, 10, 20, 30];

        let mut request = InferenceRequest::new();
        request.add_input_tensor(InferenceRequestInput::from_owned(
            Tensor::new("input", vec![1, 2, 3], DataType::Uint8),
            pixels.clone(),
        ));
        let mut batch = Batch::new();
        batch.add_request(request);
        batch.add_model("invert_image");
        batch.add_time(Instant::now());
        batch.add_trace(TraceContext::new());

        let (raw, shape) = invert_one(&batch, 0).unwrap();
        assert_eq!(shape, vec![1, 2, 3]);
        assert_eq!(raw, vec![255, 128, 0, 245, 235, 225]);
        let twice: Vec<u8> = raw.iter().map(|value| 255 - value).collect();
        assert_eq!(twice, pixels);
    }
}
