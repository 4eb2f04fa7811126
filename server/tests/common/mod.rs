#![allow(dead_code)]

use tensor_serving_server::{
    DataType, InferenceRequest, InferenceRequestInput, InferenceResponse, NativeClient, Server,
    Tensor,
};

/// A server plus a native client attached to it.
pub fn native_pair() -> (Server, NativeClient) {
    let server = Server::new();
    let client = NativeClient::new(&server);
    (server, client)
}

/// A request with one Uint32 `[1]` input per value.
pub fn uint32_request(values: &[u32]) -> InferenceRequest {
    let mut request = InferenceRequest::new();
    for (i, value) in values.iter().enumerate() {
        request.add_input_tensor(InferenceRequestInput::from_owned(
            Tensor::new(format!("input{i}"), vec![1], DataType::Uint32),
            value.to_le_bytes().to_vec(),
        ));
    }
    request
}

/// Decode an output tensor as little-endian u32 values.
pub fn output_values(response: &InferenceResponse, index: usize) -> Vec<u32> {
    response.outputs()[index]
        .data
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}
