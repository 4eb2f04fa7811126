/// In-process models run by the `cpu` worker
///
/// A model is a compute kernel with statically described tensors. The
/// worker wires one forwarded request per batch row, pointing at rows of
/// freshly allocated output buffers; the model reads the consumed batch
/// and fills those rows.
use crate::batch::Batch;
use crate::data_types::DataType;
use crate::error::Error;
use crate::tensor::Tensor;

pub trait Model: Send {
    fn inputs(&self) -> Vec<Tensor>;
    fn outputs(&self) -> Vec<Tensor>;

    /// Transform every request of `batch` into the pre-wired rows of
    /// `new_batch`. Per-request problems must fail only that row's
    /// forwarded request.
    fn run(&self, batch: &Batch, new_batch: &mut Batch) -> Result<(), Error>;
}

/// Resolve a model implementation by name. The registry stands in for
/// compiled model objects loaded from disk; unknown names fail like a
/// missing artifact.
pub fn make_model(name: &str) -> Result<Box<dyn Model>, Error> {
    match name {
        "echo" => Ok(Box::new(EchoModel)),
        "echo_multi" => Ok(Box::new(EchoMultiModel)),
        _ => Err(Error::FileNotFound(format!("no model named '{name}'"))),
    }
}

/// Adds one to a single Uint32 value per request.
struct EchoModel;

impl Model for EchoModel {
    fn inputs(&self) -> Vec<Tensor> {
        vec![Tensor::new("input", vec![1], DataType::Uint32)]
    }

    fn outputs(&self) -> Vec<Tensor> {
        vec![Tensor::new("output", vec![1], DataType::Uint32)]
    }

    fn run(&self, batch: &Batch, new_batch: &mut Batch) -> Result<(), Error> {
        for j in 0..batch.size() {
            let value = {
                let request = batch.request(j);
                match request.inputs().first() {
                    Some(input) if input.tensor().datatype() == DataType::Uint32 => {
                        let bytes = batch.input_bytes(input)?;
                        Some(u32::from_le_bytes(bytes[..4].try_into().unwrap()))
                    }
                    _ => None,
                }
            };
            match value {
                Some(value) => {
                    let row = j * DataType::Uint32.size();
                    new_batch.input_buffers_mut()[0]
                        .write_at(row, &value.wrapping_add(1).to_le_bytes());
                }
                None => new_batch
                    .request_mut(j)
                    .run_callback_error("input must be a UINT32 value"),
            }
        }
        Ok(())
    }
}

const MULTI_INPUT_LENGTHS: [usize; 2] = [1, 2];
const MULTI_OUTPUT_LENGTHS: [usize; 3] = [1, 4, 3];

/// Cycles two flattened Uint32 inputs across a three-tensor fan-out.
struct EchoMultiModel;

impl Model for EchoMultiModel {
    fn inputs(&self) -> Vec<Tensor> {
        MULTI_INPUT_LENGTHS
            .iter()
            .enumerate()
            .map(|(i, len)| Tensor::new(format!("input{i}"), vec![*len as u64], DataType::Uint32))
            .collect()
    }

    fn outputs(&self) -> Vec<Tensor> {
        MULTI_OUTPUT_LENGTHS
            .iter()
            .enumerate()
            .map(|(i, len)| Tensor::new(format!("output{i}"), vec![*len as u64], DataType::Uint32))
            .collect()
    }

    fn run(&self, batch: &Batch, new_batch: &mut Batch) -> Result<(), Error> {
        for j in 0..batch.size() {
            let args = {
                let request = batch.request(j);
                let mut args = Vec::new();
                let mut bad = request.inputs().len() != MULTI_INPUT_LENGTHS.len();
                for (input, expected_len) in request.inputs().iter().zip(MULTI_INPUT_LENGTHS) {
                    if input.tensor().datatype() != DataType::Uint32
                        || input.tensor().size() != expected_len
                    {
                        bad = true;
                        break;
                    }
                    let bytes = batch.input_bytes(input)?;
                    for chunk in bytes.chunks_exact(4).take(expected_len) {
                        args.push(u32::from_le_bytes(chunk.try_into().unwrap()));
                    }
                }
                if bad {
                    None
                } else {
                    Some(args)
                }
            };

            match args {
                Some(args) => {
                    let mut arg_index = 0;
                    for (slot, len) in MULTI_OUTPUT_LENGTHS.iter().enumerate() {
                        let mut row = Vec::with_capacity(len * 4);
                        for _ in 0..*len {
                            row.extend_from_slice(&args[arg_index].to_le_bytes());
                            arg_index = (arg_index + 1) % args.len();
                        }
                        let offset = j * len * DataType::Uint32.size();
                        new_batch.input_buffers_mut()[slot].write_at(offset, &row);
                    }
                }
                None => new_batch
                    .request_mut(j)
                    .run_callback_error("expected UINT32 inputs shaped [1] and [2]"),
            }
        }
        Ok(())
    }
}
