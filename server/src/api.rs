/// JSON wire mapping for the HTTP transport
///
/// Tensor payloads travel as flat arrays keyed by the datatype tag; Bytes
/// tensors travel base64-encoded. The native little-endian layout is
/// reconstructed on the way in.
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use half::f16;
use serde::{Deserialize, Serialize};

use crate::data_types::DataType;
use crate::error::Error;
use crate::parameters::ParameterMap;
use crate::request::{
    InferenceRequest, InferenceRequestInput, InferenceRequestOutput, InferenceResponse,
    InferenceResponseOutput, TensorData, TraceContext,
};
use crate::tensor::Tensor;

/// Flat tensor payload. Deserialization is untagged: booleans, unsigned
/// integers, signed integers, floats and base64 strings, tried in that
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TensorContents {
    Bool(Vec<bool>),
    Uint(Vec<u64>),
    Int(Vec<i64>),
    Fp(Vec<f64>),
    Bytes(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorWire {
    #[serde(default)]
    pub name: String,
    pub shape: Vec<u64>,
    pub datatype: DataType,
    #[serde(default, skip_serializing_if = "ParameterMap::is_empty")]
    pub parameters: ParameterMap,
    pub data: TensorContents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestedOutputWire {
    pub name: String,
    #[serde(default, skip_serializing_if = "ParameterMap::is_empty")]
    pub parameters: ParameterMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequestWire {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "ParameterMap::is_empty")]
    pub parameters: ParameterMap,
    pub inputs: Vec<TensorWire>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<RequestedOutputWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TraceContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponseWire {
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "ParameterMap::is_empty")]
    pub parameters: ParameterMap,
    #[serde(default)]
    pub outputs: Vec<TensorWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TraceContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResponseWire {
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelListWire {
    pub models: Vec<String>,
}

/// Error body returned by non-infer routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Encode raw little-endian bytes as a wire payload.
pub fn bytes_to_contents(bytes: &[u8], datatype: DataType) -> Result<TensorContents, Error> {
    let size = datatype.size();
    if size == 0 || bytes.len() % size != 0 {
        return Err(Error::Runtime(format!(
            "{} bytes do not divide into {datatype} elements",
            bytes.len()
        )));
    }
    let contents = match datatype {
        DataType::Bool => TensorContents::Bool(bytes.iter().map(|b| *b != 0).collect()),
        DataType::Uint8 => TensorContents::Uint(bytes.iter().map(|b| u64::from(*b)).collect()),
        DataType::Uint16 => TensorContents::Uint(
            bytes
                .chunks_exact(2)
                .map(|c| u64::from(u16::from_le_bytes(c.try_into().unwrap())))
                .collect(),
        ),
        DataType::Uint32 => TensorContents::Uint(
            bytes
                .chunks_exact(4)
                .map(|c| u64::from(u32::from_le_bytes(c.try_into().unwrap())))
                .collect(),
        ),
        DataType::Uint64 => TensorContents::Uint(
            bytes
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                .collect(),
        ),
        DataType::Int8 => {
            TensorContents::Int(bytes.iter().map(|b| i64::from(*b as i8)).collect())
        }
        DataType::Int16 => TensorContents::Int(
            bytes
                .chunks_exact(2)
                .map(|c| i64::from(i16::from_le_bytes(c.try_into().unwrap())))
                .collect(),
        ),
        DataType::Int32 => TensorContents::Int(
            bytes
                .chunks_exact(4)
                .map(|c| i64::from(i32::from_le_bytes(c.try_into().unwrap())))
                .collect(),
        ),
        DataType::Int64 => TensorContents::Int(
            bytes
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
                .collect(),
        ),
        DataType::Fp16 => TensorContents::Fp(
            bytes
                .chunks_exact(2)
                .map(|c| f64::from(f16::from_le_bytes(c.try_into().unwrap()).to_f32()))
                .collect(),
        ),
        DataType::Fp32 => TensorContents::Fp(
            bytes
                .chunks_exact(4)
                .map(|c| f64::from(f32::from_le_bytes(c.try_into().unwrap())))
                .collect(),
        ),
        DataType::Fp64 => TensorContents::Fp(
            bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
                .collect(),
        ),
        DataType::Bytes => TensorContents::Bytes(vec![STANDARD.encode(bytes)]),
    };
    Ok(contents)
}

fn unsigned_values(contents: &TensorContents, datatype: DataType) -> Result<Vec<u64>, Error> {
    match contents {
        TensorContents::Uint(values) => Ok(values.clone()),
        TensorContents::Int(values) => values
            .iter()
            .map(|v| {
                u64::try_from(*v).map_err(|_| {
                    Error::InvalidArgument(format!("value {v} out of range for {datatype}"))
                })
            })
            .collect(),
        TensorContents::Bool(values) if values.is_empty() => Ok(vec![]),
        TensorContents::Fp(values) if values.is_empty() => Ok(vec![]),
        _ => Err(Error::InvalidArgument(format!(
            "payload does not hold {datatype} values"
        ))),
    }
}

fn signed_values(contents: &TensorContents, datatype: DataType) -> Result<Vec<i64>, Error> {
    match contents {
        TensorContents::Int(values) => Ok(values.clone()),
        TensorContents::Uint(values) => values
            .iter()
            .map(|v| {
                i64::try_from(*v).map_err(|_| {
                    Error::InvalidArgument(format!("value {v} out of range for {datatype}"))
                })
            })
            .collect(),
        TensorContents::Bool(values) if values.is_empty() => Ok(vec![]),
        TensorContents::Fp(values) if values.is_empty() => Ok(vec![]),
        _ => Err(Error::InvalidArgument(format!(
            "payload does not hold {datatype} values"
        ))),
    }
}

fn float_values(contents: &TensorContents) -> Result<Vec<f64>, Error> {
    match contents {
        TensorContents::Fp(values) => Ok(values.clone()),
        TensorContents::Int(values) => Ok(values.iter().map(|v| *v as f64).collect()),
        TensorContents::Uint(values) => Ok(values.iter().map(|v| *v as f64).collect()),
        TensorContents::Bool(values) if values.is_empty() => Ok(vec![]),
        _ => Err(Error::InvalidArgument(
            "payload does not hold floating point values".to_string(),
        )),
    }
}

fn narrow_unsigned<T: TryFrom<u64>>(value: u64, datatype: DataType) -> Result<T, Error> {
    T::try_from(value)
        .map_err(|_| Error::InvalidArgument(format!("value {value} out of range for {datatype}")))
}

fn narrow_signed<T: TryFrom<i64>>(value: i64, datatype: DataType) -> Result<T, Error> {
    T::try_from(value)
        .map_err(|_| Error::InvalidArgument(format!("value {value} out of range for {datatype}")))
}

/// Decode a wire payload into raw little-endian bytes.
pub fn contents_to_bytes(contents: &TensorContents, datatype: DataType) -> Result<Vec<u8>, Error> {
    let bytes = match datatype {
        DataType::Bool => match contents {
            TensorContents::Bool(values) => values.iter().map(|v| u8::from(*v)).collect(),
            _ => {
                return Err(Error::InvalidArgument(
                    "payload does not hold BOOL values".to_string(),
                ))
            }
        },
        DataType::Uint8 => unsigned_values(contents, datatype)?
            .into_iter()
            .map(|v| narrow_unsigned::<u8>(v, datatype))
            .collect::<Result<Vec<u8>, Error>>()?,
        DataType::Uint16 => {
            let mut bytes = Vec::new();
            for value in unsigned_values(contents, datatype)? {
                bytes.extend_from_slice(&narrow_unsigned::<u16>(value, datatype)?.to_le_bytes());
            }
            bytes
        }
        DataType::Uint32 => {
            let mut bytes = Vec::new();
            for value in unsigned_values(contents, datatype)? {
                bytes.extend_from_slice(&narrow_unsigned::<u32>(value, datatype)?.to_le_bytes());
            }
            bytes
        }
        DataType::Uint64 => {
            let mut bytes = Vec::new();
            for value in unsigned_values(contents, datatype)? {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            bytes
        }
        DataType::Int8 => signed_values(contents, datatype)?
            .into_iter()
            .map(|v| narrow_signed::<i8>(v, datatype).map(|v| v as u8))
            .collect::<Result<Vec<u8>, Error>>()?,
        DataType::Int16 => {
            let mut bytes = Vec::new();
            for value in signed_values(contents, datatype)? {
                bytes.extend_from_slice(&narrow_signed::<i16>(value, datatype)?.to_le_bytes());
            }
            bytes
        }
        DataType::Int32 => {
            let mut bytes = Vec::new();
            for value in signed_values(contents, datatype)? {
                bytes.extend_from_slice(&narrow_signed::<i32>(value, datatype)?.to_le_bytes());
            }
            bytes
        }
        DataType::Int64 => {
            let mut bytes = Vec::new();
            for value in signed_values(contents, datatype)? {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            bytes
        }
        DataType::Fp16 => {
            let mut bytes = Vec::new();
            for value in float_values(contents)? {
                bytes.extend_from_slice(&f16::from_f32(value as f32).to_le_bytes());
            }
            bytes
        }
        DataType::Fp32 => {
            let mut bytes = Vec::new();
            for value in float_values(contents)? {
                bytes.extend_from_slice(&(value as f32).to_le_bytes());
            }
            bytes
        }
        DataType::Fp64 => {
            let mut bytes = Vec::new();
            for value in float_values(contents)? {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            bytes
        }
        DataType::Bytes => match contents {
            TensorContents::Bytes(strings) => {
                let mut bytes = Vec::new();
                for string in strings {
                    let decoded = STANDARD.decode(string).map_err(|err| {
                        Error::InvalidArgument(format!("BYTES payload is not valid base64: {err}"))
                    })?;
                    bytes.extend_from_slice(&decoded);
                }
                bytes
            }
            TensorContents::Bool(values) if values.is_empty() => vec![],
            _ => {
                return Err(Error::InvalidArgument(
                    "BYTES payload must be base64 strings".to_string(),
                ))
            }
        },
    };
    Ok(bytes)
}

/// Build a native request from its wire form, validating payload sizes
/// against the declared shapes.
pub fn request_from_wire(wire: InferenceRequestWire) -> Result<InferenceRequest, Error> {
    let mut request = InferenceRequest::new();
    request.set_id(wire.id);
    request.set_parameters(wire.parameters);
    if let Some(context) = wire.context {
        request.set_trace(context);
    }

    for tensor_wire in wire.inputs {
        let tensor = Tensor::new(tensor_wire.name, tensor_wire.shape, tensor_wire.datatype);
        let bytes = contents_to_bytes(&tensor_wire.data, tensor.datatype())?;
        if bytes.len() != tensor.byte_size() {
            return Err(Error::InvalidArgument(format!(
                "input '{}' carries {} bytes but its shape needs {}",
                tensor.name(),
                bytes.len(),
                tensor.byte_size()
            )));
        }
        let mut input = InferenceRequestInput::from_owned(tensor, bytes);
        input.set_parameters(tensor_wire.parameters);
        request.add_input_tensor(input);
    }

    for output_wire in wire.outputs {
        let mut output = InferenceRequestOutput::new(output_wire.name);
        output.parameters = output_wire.parameters;
        request.add_output_tensor(output);
    }

    Ok(request)
}

/// Serialize a request for submission over HTTP. Only owned payloads can
/// leave the process.
pub fn request_to_wire(request: &InferenceRequest) -> Result<InferenceRequestWire, Error> {
    let mut inputs = Vec::with_capacity(request.inputs().len());
    for input in request.inputs() {
        let bytes = match input.data() {
            TensorData::Owned(bytes) => bytes,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "input '{}' has no owned data to serialize",
                    input.tensor().name()
                )))
            }
        };
        inputs.push(TensorWire {
            name: input.tensor().name().to_string(),
            shape: input.tensor().shape().to_vec(),
            datatype: input.tensor().datatype(),
            parameters: input.parameters().clone(),
            data: bytes_to_contents(bytes, input.tensor().datatype())?,
        });
    }

    Ok(InferenceRequestWire {
        id: request.id().to_string(),
        parameters: request.parameters().clone(),
        inputs,
        outputs: request
            .outputs()
            .iter()
            .map(|output| RequestedOutputWire {
                name: output.name.clone(),
                parameters: output.parameters.clone(),
            })
            .collect(),
        context: request.trace().cloned(),
    })
}

pub fn response_to_wire(response: &InferenceResponse) -> Result<InferenceResponseWire, Error> {
    let mut outputs = Vec::with_capacity(response.outputs().len());
    for output in response.outputs() {
        outputs.push(TensorWire {
            name: output.tensor.name().to_string(),
            shape: output.tensor.shape().to_vec(),
            datatype: output.tensor.datatype(),
            parameters: output.parameters.clone(),
            data: bytes_to_contents(&output.data, output.tensor.datatype())?,
        });
    }
    Ok(InferenceResponseWire {
        model_name: response.model().to_string(),
        id: response.id().to_string(),
        parameters: response.parameters().clone(),
        outputs,
        error: response.error().map(str::to_string),
        context: response.context().cloned(),
    })
}

pub fn response_from_wire(wire: InferenceResponseWire) -> Result<InferenceResponse, Error> {
    let mut response = InferenceResponse::new();
    response.set_id(wire.id);
    response.set_model(wire.model_name);
    response.set_parameters(wire.parameters);
    if let Some(error) = wire.error {
        response.set_error(error);
    }
    if let Some(context) = wire.context {
        response.set_context(context);
    }
    for tensor_wire in wire.outputs {
        let tensor = Tensor::new(tensor_wire.name, tensor_wire.shape, tensor_wire.datatype);
        let bytes = contents_to_bytes(&tensor_wire.data, tensor.datatype())?;
        let mut output = InferenceResponseOutput::new(tensor, bytes);
        output.parameters = tensor_wire.parameters;
        response.add_output(output);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint32_payload_round_trip() {
        let bytes: Vec<u8> = [3u32, 5, 7]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let contents = bytes_to_contents(&bytes, DataType::Uint32).unwrap();
        assert_eq!(contents, TensorContents::Uint(vec![3, 5, 7]));
        assert_eq!(contents_to_bytes(&contents, DataType::Uint32).unwrap(), bytes);
    }

    #[test]
    fn fp16_payload_round_trip() {
        let bytes: Vec<u8> = [1.5f32, -0.25]
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_le_bytes())
            .collect();
        let contents = bytes_to_contents(&bytes, DataType::Fp16).unwrap();
        assert_eq!(contents, TensorContents::Fp(vec![1.5, -0.25]));
        assert_eq!(contents_to_bytes(&contents, DataType::Fp16).unwrap(), bytes);
    }

    #[test]
    fn bytes_payload_travels_as_base64() {
        let raw = b"hello tensors".to_vec();
        let contents = bytes_to_contents(&raw, DataType::Bytes).unwrap();
        match &contents {
            TensorContents::Bytes(strings) => assert_eq!(strings.len(), 1),
            other => panic!("unexpected contents: {other:?}"),
        }
        assert_eq!(contents_to_bytes(&contents, DataType::Bytes).unwrap(), raw);
    }

    #[test]
    fn untagged_parsing_picks_the_right_variant() {
        let contents: TensorContents = serde_json::from_str("[1, 2, 3]").unwrap();
        assert_eq!(contents, TensorContents::Uint(vec![1, 2, 3]));
        let contents: TensorContents = serde_json::from_str("[1, -2]").unwrap();
        assert_eq!(contents, TensorContents::Int(vec![1, -2]));
        let contents: TensorContents = serde_json::from_str("[0.5, 2]").unwrap();
        assert_eq!(contents, TensorContents::Fp(vec![0.5, 2.0]));
        let contents: TensorContents = serde_json::from_str("[true]").unwrap();
        assert_eq!(contents, TensorContents::Bool(vec![true]));
        let contents: TensorContents = serde_json::from_str("[\"aGk=\"]").unwrap();
        assert_eq!(contents, TensorContents::Bytes(vec!["aGk=".to_string()]));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let contents = TensorContents::Uint(vec![300]);
        assert!(contents_to_bytes(&contents, DataType::Uint8).is_err());
        let contents = TensorContents::Int(vec![-1]);
        assert!(contents_to_bytes(&contents, DataType::Uint32).is_err());
    }

    #[test]
    fn request_wire_round_trip() {
        let json = r#"{
            "id": "req-1",
            "inputs": [
                {"name": "input0", "shape": [2], "datatype": "UINT32", "data": [3, 4]}
            ],
            "outputs": [{"name": "result"}]
        }"#;
        let wire: InferenceRequestWire = serde_json::from_str(json).unwrap();
        let request = request_from_wire(wire).unwrap();
        assert_eq!(request.id(), "req-1");
        assert_eq!(request.inputs().len(), 1);
        assert_eq!(request.outputs()[0].name, "result");

        let wire = request_to_wire(&request).unwrap();
        assert_eq!(wire.inputs[0].data, TensorContents::Uint(vec![3, 4]));
    }

    #[test]
    fn response_wire_round_trip() {
        let mut response = InferenceResponse::new();
        response.set_id("resp-1");
        response.set_model("echo");
        response.add_output(InferenceResponseOutput::new(
            Tensor::new("output", vec![2], DataType::Uint32),
            [5u32, 6].iter().flat_map(|v| v.to_le_bytes()).collect(),
        ));
        let mut context = TraceContext::new();
        context.insert("traceparent".to_string(), "00-abc-def-01".to_string());
        response.set_context(context.clone());

        let wire = response_to_wire(&response).unwrap();
        let json = serde_json::to_string(&wire).unwrap();
        let parsed: InferenceResponseWire = serde_json::from_str(&json).unwrap();
        let back = response_from_wire(parsed).unwrap();
        assert_eq!(back.id(), "resp-1");
        assert_eq!(back.model(), "echo");
        assert!(!back.is_error());
        assert_eq!(back.outputs()[0].data, response.outputs()[0].data);
        assert_eq!(back.context(), Some(&context));

        let error = InferenceResponse::from_error("backend failed");
        let wire = response_to_wire(&error).unwrap();
        assert_eq!(wire.error.as_deref(), Some("backend failed"));
        let back = response_from_wire(wire).unwrap();
        assert!(back.is_error());
    }

    #[test]
    fn payload_size_must_match_the_shape() {
        let json = r#"{
            "inputs": [
                {"name": "input0", "shape": [3], "datatype": "UINT32", "data": [1]}
            ]
        }"#;
        let wire: InferenceRequestWire = serde_json::from_str(json).unwrap();
        assert!(matches!(request_from_wire(wire), Err(Error::InvalidArgument(_))));
    }
}
