/// Batches of requests and their shared buffers
use std::time::Instant;

use crate::error::Error;
use crate::memory_pool::Buffer;
use crate::request::{InferenceRequest, InferenceRequestInput, TensorData, TraceContext};

/// What the batcher produces and pushes to the workers: an ordered group of
/// requests, the buffers backing their tensors, and per-request metadata
/// (target model, arrival time, trace context), all index-aligned.
#[derive(Debug, Default)]
pub struct Batch {
    requests: Vec<InferenceRequest>,
    models: Vec<String>,
    start_times: Vec<Instant>,
    traces: Vec<TraceContext>,
    input_buffers: Vec<Buffer>,
    output_buffers: Vec<Buffer>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_request(&mut self, request: InferenceRequest) {
        self.requests.push(request);
    }

    pub fn request(&self, index: usize) -> &InferenceRequest {
        &self.requests[index]
    }

    pub fn request_mut(&mut self, index: usize) -> &mut InferenceRequest {
        &mut self.requests[index]
    }

    pub fn requests(&self) -> &[InferenceRequest] {
        &self.requests
    }

    pub fn requests_mut(&mut self) -> &mut [InferenceRequest] {
        &mut self.requests
    }

    /// Move the requests out, leaving metadata and buffers in place.
    /// Terminal workers consume requests this way so they can keep reading
    /// the batch buffers while running callbacks.
    pub fn take_requests(&mut self) -> Vec<InferenceRequest> {
        std::mem::take(&mut self.requests)
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn size(&self) -> usize {
        self.requests.len()
    }

    pub fn add_model(&mut self, model: impl Into<String>) {
        self.models.push(model.into());
    }

    pub fn model(&self, index: usize) -> &str {
        &self.models[index]
    }

    /// Set the model at `index` unless one is already recorded.
    pub fn set_model(&mut self, index: usize, model: impl Into<String>) {
        let slot = &mut self.models[index];
        if slot.is_empty() {
            *slot = model.into();
        }
    }

    pub fn add_time(&mut self, timestamp: Instant) {
        self.start_times.push(timestamp);
    }

    pub fn time(&self, index: usize) -> Instant {
        self.start_times[index]
    }

    pub fn add_trace(&mut self, trace: TraceContext) {
        self.traces.push(trace);
    }

    pub fn trace(&self, index: usize) -> &TraceContext {
        &self.traces[index]
    }

    pub fn set_buffers(&mut self, inputs: Vec<Buffer>, outputs: Vec<Buffer>) {
        self.input_buffers = inputs;
        self.output_buffers = outputs;
    }

    pub fn input_buffers(&self) -> &[Buffer] {
        &self.input_buffers
    }

    pub fn input_buffers_mut(&mut self) -> &mut [Buffer] {
        &mut self.input_buffers
    }

    pub fn output_buffers(&self) -> &[Buffer] {
        &self.output_buffers
    }

    /// Detach all buffers so the worker loop can hand them back to the pool.
    pub fn take_buffers(&mut self) -> Vec<Buffer> {
        let mut buffers = std::mem::take(&mut self.input_buffers);
        buffers.append(&mut self.output_buffers);
        buffers
    }

    /// Resolve an input tensor's bytes, whether the request owns them or
    /// they live in one of this batch's input buffers.
    pub fn input_bytes<'a>(&'a self, input: &'a InferenceRequestInput) -> Result<&'a [u8], Error> {
        let len = input.tensor().byte_size();
        match input.data() {
            TensorData::Owned(data) => {
                if data.len() < len {
                    return Err(Error::InvalidArgument(format!(
                        "input '{}' carries {} bytes but its shape needs {}",
                        input.tensor().name(),
                        data.len(),
                        len
                    )));
                }
                Ok(&data[..len])
            }
            TensorData::Shared { buffer, offset } => {
                let buffer = self.input_buffers.get(*buffer).ok_or_else(|| {
                    Error::Runtime(format!("input buffer index {buffer} out of range"))
                })?;
                Ok(&buffer.data(*offset)[..len])
            }
            TensorData::Empty => Err(Error::InvalidArgument(format!(
                "input '{}' has no data attached",
                input.tensor().name()
            ))),
        }
    }

    /// A new batch preserving per-index models, arrival times and traces,
    /// but carrying no requests and no buffers. The producing worker
    /// appends one forwarded request per index.
    pub fn propagate(&self) -> Batch {
        Batch {
            requests: Vec::new(),
            models: self.models.clone(),
            start_times: self.start_times.clone(),
            traces: self.traces.clone(),
            input_buffers: Vec::new(),
            output_buffers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::DataType;
    use crate::memory_pool::{Buffer, MemoryKind};
    use crate::tensor::Tensor;

    fn sample_batch() -> Batch {
        let mut batch = Batch::new();
        for i in 0..3 {
            let mut request = InferenceRequest::new();
            request.set_id(format!("req-{i}"));
            batch.add_request(request);
            batch.add_model("echo");
            batch.add_time(Instant::now());
            batch.add_trace(TraceContext::new());
        }
        batch
    }

    #[test]
    fn propagate_preserves_metadata_but_not_requests() {
        let batch = sample_batch();
        let forwarded = batch.propagate();

        assert_eq!(forwarded.size(), 0);
        assert!(forwarded.input_buffers().is_empty());
        assert!(forwarded.output_buffers().is_empty());
        for i in 0..batch.size() {
            assert_eq!(forwarded.model(i), batch.model(i));
            assert_eq!(forwarded.time(i), batch.time(i));
        }
    }

    #[test]
    fn set_model_only_fills_empty_slots() {
        let mut batch = Batch::new();
        batch.add_model("");
        batch.set_model(0, "echo");
        batch.set_model(0, "other");
        assert_eq!(batch.model(0), "echo");
    }

    #[test]
    fn input_bytes_resolves_owned_and_shared_data() {
        let tensor = Tensor::new("input", vec![1], DataType::Uint32);

        let mut batch = Batch::new();
        let mut buffer = Buffer::new(MemoryKind::Cpu, 8);
        buffer.write_at(4, &7u32.to_le_bytes());
        batch.set_buffers(vec![buffer], vec![]);

        let owned = InferenceRequestInput::from_owned(tensor.clone(), 3u32.to_le_bytes().to_vec());
        assert_eq!(batch.input_bytes(&owned).unwrap(), &3u32.to_le_bytes());

        let mut shared = InferenceRequestInput::new(tensor.clone());
        shared.set_data(TensorData::Shared { buffer: 0, offset: 4 });
        assert_eq!(batch.input_bytes(&shared).unwrap(), &7u32.to_le_bytes());

        let empty = InferenceRequestInput::new(tensor);
        assert!(batch.input_bytes(&empty).is_err());
    }

    #[test]
    fn take_buffers_drains_both_arrays() {
        let mut batch = Batch::new();
        batch.set_buffers(
            vec![Buffer::new(MemoryKind::Cpu, 4)],
            vec![Buffer::new(MemoryKind::Cpu, 8)],
        );
        let buffers = batch.take_buffers();
        assert_eq!(buffers.len(), 2);
        assert!(batch.input_buffers().is_empty());
        assert!(batch.output_buffers().is_empty());
    }
}
