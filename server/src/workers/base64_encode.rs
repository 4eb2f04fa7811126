/// The Base64Encode worker: raw image tensors to base64 text
use std::io::Cursor;

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

/// Encodes a `Uint8 [h, w, 3]` tensor as a PNG wrapped in base64 and
/// forwards the text as a Bytes tensor. Usually the last real stage of an
/// image chain.
pub struct Base64Encode {
    batch_size: usize,
    metadata: ModelMetadata,
}

impl Base64Encode {
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            metadata: ModelMetadata::new("base64_encode", "cpu"),
        }
    }
}

impl Default for Base64Encode {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for Base64Encode {
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
            .add_output_tensor("output", DataType::Bytes, vec![]);
        Ok(())
    }

    fn run(&mut self, batch: &mut Batch, ctx: &WorkerContext<'_>) -> Result<Option<Batch>, Error> {
        debug!(size = batch.size(), "got batch in base64_encode");
        let batch_size = batch.size();

        let mut encoded: Vec<Result<Vec<u8>, String>> = Vec::with_capacity(batch_size);
        for j in 0..batch_size {
            encoded.push(encode_one(batch, j));
        }

        let max_size = encoded
            .iter()
            .filter_map(|result| result.as_ref().ok())
            .map(|text| text.len())
            .max()
            .unwrap_or(0);

        let slot = Tensor::new("output", vec![max_size as u64], DataType::Bytes);
        let mut buffer = ctx.pool.get(&ctx.next_allocators, &slot, batch_size)?;

        let mut new_batch = batch.propagate();
        for (j, result) in encoded.into_iter().enumerate() {
            let request = batch.request_mut(j);
            match result {
                Ok(text) => {
                    let offset = j * max_size;
                    buffer.write_at(offset, &text);

                    let mut forwarded = request.propagate();
                    let mut input = InferenceRequestInput::new(Tensor::new(
                        "output",
                        vec![text.len() as u64],
                        DataType::Bytes,
                    ));
                    input.set_data(TensorData::Shared { buffer: 0, offset });
                    forwarded.add_input_tensor(input);
                    new_batch.add_request(forwarded);
                }
                Err(message) => {
                    warn!(index = j, %message, "failed to encode request");
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

fn encode_one(batch: &Batch, j: usize) -> Result<Vec<u8>, String> {
    let request = batch.request(j);
    if request.inputs().len() != 1 {
        return Err("only one input tensor should be present".to_string());
    }
    let input = &request.inputs()[0];
    let shape = input.tensor().shape();
    if input.tensor().datatype() != DataType::Uint8 || shape.len() != 3 || shape[2] != 3 {
        return Err(format!(
            "input '{}' must be a UINT8 [h, w, 3] tensor",
            input.tensor().name()
        ));
    }
    let (height, width) = (shape[0] as u32, shape[1] as u32);
    let bytes = batch.input_bytes(input).map_err(|err| err.to_string())?;

    let image = image::RgbImage::from_raw(width, height, bytes.to_vec())
        .ok_or_else(|| "input does not hold h x w x 3 bytes".to_string())?;
    let mut png = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut png, image::ImageFormat::Png)
        .map_err(|err| format!("failed to encode image: {err}"))?;

    Ok(STANDARD.encode(png.into_inner()).into_bytes())
}
