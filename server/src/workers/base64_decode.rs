/// The Base64Decode worker: base64 text to raw image tensors
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
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

/// Decodes one Bytes input holding a base64-encoded image and forwards a
/// `Uint8 [h, w, 3]` tensor downstream. Always a pipeline stage: the
/// framework translates its output into responses when nothing follows it.
pub struct Base64Decode {
    batch_size: usize,
    metadata: ModelMetadata,
}

impl Base64Decode {
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            metadata: ModelMetadata::new("base64_decode", "cpu"),
        }
    }
}

impl Default for Base64Decode {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for Base64Decode {
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
        // empty shapes: the output size is only known per request
        self.metadata
            .add_input_tensor("input", DataType::Bytes, vec![]);
        self.metadata
            .add_output_tensor("output", DataType::Uint8, vec![]);
        Ok(())
    }

    fn run(&mut self, batch: &mut Batch, ctx: &WorkerContext<'_>) -> Result<Option<Batch>, Error> {
        debug!(size = batch.size(), "got batch in base64_decode");
        let batch_size = batch.size();

        let mut decoded: Vec<Result<(Vec<u8>, u64, u64), String>> = Vec::with_capacity(batch_size);
        for j in 0..batch_size {
            decoded.push(decode_one(batch, j));
        }

        let max_size = decoded
            .iter()
            .filter_map(|result| result.as_ref().ok())
            .map(|(raw, _, _)| raw.len())
            .max()
            .unwrap_or(0);

        let slot = Tensor::new("output", vec![max_size as u64], DataType::Uint8);
        let mut buffer = ctx.pool.get(&ctx.next_allocators, &slot, batch_size)?;

        let mut new_batch = batch.propagate();
        for (j, result) in decoded.into_iter().enumerate() {
            let request = batch.request_mut(j);
            match result {
                Ok((raw, height, width)) => {
                    let offset = j * max_size;
                    buffer.write_at(offset, &raw);

                    let mut forwarded = request.propagate();
                    let mut input = InferenceRequestInput::new(Tensor::new(
                        "output",
                        vec![height, width, 3],
                        DataType::Uint8,
                    ));
                    input.set_data(TensorData::Shared { buffer: 0, offset });
                    forwarded.add_input_tensor(input);
                    new_batch.add_request(forwarded);
                }
                Err(message) => {
                    warn!(index = j, %message, "failed to decode request");
                    counter!(observation::REQUEST_ERRORS).increment(1);
                    request.run_callback_error(message);
                    // keep the indices aligned; the callback is already
                    // spent, so downstream stages cannot complete it twice
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

fn decode_one(batch: &Batch, j: usize) -> Result<(Vec<u8>, u64, u64), String> {
    let request = batch.request(j);
    if request.inputs().len() != 1 {
        return Err("only one input tensor should be present".to_string());
    }
    let input = &request.inputs()[0];
    let bytes = batch.input_bytes(input).map_err(|err| err.to_string())?;
    let text = std::str::from_utf8(bytes).map_err(|_| "input is not valid base64 text".to_string())?;
    let encoded_image = STANDARD
        .decode(text.trim_end_matches('\0'))
        .map_err(|err| format!("failed to decode base64 image data: {err}"))?;
    let image = image::load_from_memory(&encoded_image)
        .map_err(|err| format!("failed to decode image: {err}"))?;
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err("decoded image is empty".to_string());
    }
    Ok((rgb.into_raw(), u64::from(height), u64::from(width)))
}
