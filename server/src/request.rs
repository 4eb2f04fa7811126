/// Inference requests and responses
use std::collections::BTreeMap;
use std::fmt;

use crate::error::Error;
use crate::parameters::ParameterMap;
use crate::tensor::Tensor;

/// Opaque tracing context moved across stage boundaries. The core never
/// inspects the contents.
pub type TraceContext = BTreeMap<String, String>;

/// Completion callback attached to a request. Consumed at most once.
pub type Callback = Box<dyn FnOnce(InferenceResponse) + Send>;

/// Where an input tensor's bytes live. Exactly one representation is
/// active: bytes owned by the request itself, or a view into one of the
/// owning batch's input buffers.
#[derive(Debug, Clone, Default)]
pub enum TensorData {
    #[default]
    Empty,
    Owned(Vec<u8>),
    Shared { buffer: usize, offset: usize },
}

impl TensorData {
    pub fn is_shared(&self) -> bool {
        matches!(self, TensorData::Shared { .. })
    }
}

/// An input tensor of a request: description, data and its own parameters.
#[derive(Debug, Clone, Default)]
pub struct InferenceRequestInput {
    tensor: Tensor,
    data: TensorData,
    parameters: ParameterMap,
}

impl InferenceRequestInput {
    pub fn new(tensor: Tensor) -> Self {
        Self {
            tensor,
            data: TensorData::Empty,
            parameters: ParameterMap::new(),
        }
    }

    pub fn from_owned(tensor: Tensor, data: Vec<u8>) -> Self {
        Self {
            tensor,
            data: TensorData::Owned(data),
            parameters: ParameterMap::new(),
        }
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn tensor_mut(&mut self) -> &mut Tensor {
        &mut self.tensor
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn set_data(&mut self, data: TensorData) {
        self.data = data;
    }

    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    pub fn set_parameters(&mut self, parameters: ParameterMap) {
        self.parameters = parameters;
    }
}

/// An output requested by the client: which tensor it wants, by name.
#[derive(Debug, Clone, Default)]
pub struct InferenceRequestOutput {
    pub name: String,
    pub parameters: ParameterMap,
}

impl InferenceRequestOutput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: ParameterMap::new(),
        }
    }
}

/// A single inference request: ordered inputs, requested outputs, an id and
/// a single-shot completion callback.
#[derive(Default)]
pub struct InferenceRequest {
    id: String,
    inputs: Vec<InferenceRequestInput>,
    outputs: Vec<InferenceRequestOutput>,
    parameters: ParameterMap,
    trace: Option<TraceContext>,
    callback: Option<Callback>,
}

impl fmt::Debug for InferenceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceRequest")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("parameters", &self.parameters)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl InferenceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn inputs(&self) -> &[InferenceRequestInput] {
        &self.inputs
    }

    pub fn input_mut(&mut self, index: usize) -> Option<&mut InferenceRequestInput> {
        self.inputs.get_mut(index)
    }

    pub fn add_input_tensor(&mut self, input: InferenceRequestInput) {
        self.inputs.push(input);
    }

    pub fn set_input_data(&mut self, index: usize, data: TensorData) {
        if let Some(input) = self.inputs.get_mut(index) {
            input.set_data(data);
        }
    }

    pub fn outputs(&self) -> &[InferenceRequestOutput] {
        &self.outputs
    }

    pub fn add_output_tensor(&mut self, output: InferenceRequestOutput) {
        self.outputs.push(output);
    }

    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    pub fn set_parameters(&mut self, parameters: ParameterMap) {
        self.parameters = parameters;
    }

    pub fn trace(&self) -> Option<&TraceContext> {
        self.trace.as_ref()
    }

    pub fn set_trace(&mut self, trace: TraceContext) {
        self.trace = Some(trace);
    }

    pub fn take_trace(&mut self) -> TraceContext {
        self.trace.take().unwrap_or_default()
    }

    pub fn set_callback(&mut self, callback: Callback) {
        self.callback = Some(callback);
    }

    pub fn take_callback(&mut self) -> Option<Callback> {
        self.callback.take()
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Run the completion callback, consuming it. Later calls are no-ops.
    pub fn run_callback_once(&mut self, response: InferenceResponse) {
        if let Some(callback) = self.callback.take() {
            callback(response);
        }
    }

    /// Complete the request with an error response.
    pub fn run_callback_error(&mut self, message: impl Into<String>) {
        self.run_callback_once(InferenceResponse::from_error(message));
    }

    /// A fresh request carrying the same id, output descriptors and the
    /// callback, but no input data. Used to chain a request through an
    /// ensemble without copying its inputs.
    pub fn propagate(&mut self) -> InferenceRequest {
        let mut request = InferenceRequest::new();
        request.set_id(self.id.clone());
        request.outputs = self.outputs.clone();
        request.callback = self.callback.take();
        request
    }
}

/// A produced output tensor: description plus owned bytes.
#[derive(Debug, Clone, Default)]
pub struct InferenceResponseOutput {
    pub tensor: Tensor,
    pub data: Vec<u8>,
    pub parameters: ParameterMap,
}

impl InferenceResponseOutput {
    pub fn new(tensor: Tensor, data: Vec<u8>) -> Self {
        Self {
            tensor,
            data,
            parameters: ParameterMap::new(),
        }
    }
}

/// The response to one request. A non-empty error message means all other
/// fields may be empty.
#[derive(Debug, Clone, Default)]
pub struct InferenceResponse {
    id: String,
    model: String,
    outputs: Vec<InferenceResponseOutput>,
    parameters: ParameterMap,
    error: Option<String>,
    context: Option<TraceContext>,
}

impl InferenceResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn outputs(&self) -> &[InferenceResponseOutput] {
        &self.outputs
    }

    pub fn add_output(&mut self, output: InferenceResponseOutput) {
        self.outputs.push(output);
    }

    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    pub fn set_parameters(&mut self, parameters: ParameterMap) {
        self.parameters = parameters;
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn is_error(&self) -> bool {
        self.error.as_ref().is_some_and(|message| !message.is_empty())
    }

    pub fn context(&self) -> Option<&TraceContext> {
        self.context.as_ref()
    }

    pub fn set_context(&mut self, context: TraceContext) {
        self.context = Some(context);
    }

    /// Convert an error response into an `Error`, or pass the response
    /// through untouched.
    pub fn into_result(self) -> Result<InferenceResponse, Error> {
        match &self.error {
            Some(message) if !message.is_empty() => Err(Error::BadStatus(message.clone())),
            _ => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::data_types::DataType;

    fn counting_callback() -> (Callback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let callback: Callback = Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[test]
    fn callback_runs_at_most_once() {
        let (callback, count) = counting_callback();
        let mut request = InferenceRequest::new();
        request.set_callback(callback);

        request.run_callback_once(InferenceResponse::new());
        request.run_callback_once(InferenceResponse::new());
        request.run_callback_error("late error");

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn propagate_carries_id_outputs_and_callback() {
        let (callback, count) = counting_callback();
        let mut request = InferenceRequest::new();
        request.set_id("abc");
        request.set_callback(callback);
        request.add_output_tensor(InferenceRequestOutput::new("scores"));
        request.add_input_tensor(InferenceRequestInput::from_owned(
            Tensor::new("input", vec![1], DataType::Uint32),
            vec![1, 0, 0, 0],
        ));

        let mut forwarded = request.propagate();
        assert_eq!(forwarded.id(), "abc");
        assert_eq!(forwarded.outputs().len(), 1);
        assert_eq!(forwarded.outputs()[0].name, "scores");
        assert!(forwarded.inputs().is_empty());

        // the callback moved to the forwarded request
        request.run_callback_once(InferenceResponse::new());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        forwarded.run_callback_once(InferenceResponse::new());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_response() {
        let response = InferenceResponse::from_error("input too large");
        assert!(response.is_error());
        assert_eq!(response.error(), Some("input too large"));
        assert!(response.into_result().is_err());

        let response = InferenceResponse::new();
        assert!(!response.is_error());
        assert!(response.into_result().is_ok());
    }
}
