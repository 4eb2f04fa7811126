/// Tensor and model metadata
use serde::{Deserialize, Serialize};

use crate::data_types::DataType;

/// A named, shaped, typed tensor description. Carries no data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tensor {
    name: String,
    shape: Vec<u64>,
    datatype: DataType,
}

impl Default for Tensor {
    fn default() -> Self {
        Tensor::new("", vec![], DataType::Bytes)
    }
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: Vec<u64>, datatype: DataType) -> Self {
        Self {
            name: name.into(),
            shape,
            datatype,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn set_shape(&mut self, shape: Vec<u64>) {
        self.shape = shape;
    }

    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    /// Number of elements. An empty shape means the size is unknown until
    /// the producing worker fills it in, so it counts as zero.
    pub fn size(&self) -> usize {
        if self.shape.is_empty() {
            return 0;
        }
        self.shape.iter().product::<u64>() as usize
    }

    pub fn byte_size(&self) -> usize {
        self.size() * self.datatype.size()
    }
}

/// Per-endpoint description of the loaded model: which tensors it consumes
/// and produces. Populated by the worker during acquire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub name: String,
    pub platform: String,
    pub inputs: Vec<Tensor>,
    pub outputs: Vec<Tensor>,
}

impl ModelMetadata {
    pub fn new(name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn add_input_tensor(&mut self, name: impl Into<String>, datatype: DataType, shape: Vec<u64>) {
        self.inputs.push(Tensor::new(name, shape, datatype));
    }

    pub fn add_output_tensor(&mut self, name: impl Into<String>, datatype: DataType, shape: Vec<u64>) {
        self.outputs.push(Tensor::new(name, shape, datatype));
    }
}

/// Server identification returned by the metadata endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMetadata {
    pub name: String,
    pub version: String,
    pub extensions: Vec<String>,
}
