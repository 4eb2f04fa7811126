/// Scalar element types for tensors
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The scalar type of a tensor element. The wire representation uses the
/// KServe string tags (e.g. "UINT32", "FP16", "BYTES").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "BOOL")]
    Bool,
    #[serde(rename = "UINT8")]
    Uint8,
    #[serde(rename = "UINT16")]
    Uint16,
    #[serde(rename = "UINT32")]
    Uint32,
    #[serde(rename = "UINT64")]
    Uint64,
    #[serde(rename = "INT8")]
    Int8,
    #[serde(rename = "INT16")]
    Int16,
    #[serde(rename = "INT32")]
    Int32,
    #[serde(rename = "INT64")]
    Int64,
    #[serde(rename = "FP16")]
    Fp16,
    #[serde(rename = "FP32")]
    Fp32,
    #[serde(rename = "FP64")]
    Fp64,
    #[serde(rename = "BYTES")]
    Bytes,
}

impl DataType {
    /// Size of one element in bytes. Bytes tensors count single bytes.
    pub const fn size(&self) -> usize {
        match self {
            DataType::Bool => 1,
            DataType::Uint8 => 1,
            DataType::Uint16 => 2,
            DataType::Uint32 => 4,
            DataType::Uint64 => 8,
            DataType::Int8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 => 4,
            DataType::Int64 => 8,
            DataType::Fp16 => 2,
            DataType::Fp32 => 4,
            DataType::Fp64 => 8,
            DataType::Bytes => 1,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "BOOL",
            DataType::Uint8 => "UINT8",
            DataType::Uint16 => "UINT16",
            DataType::Uint32 => "UINT32",
            DataType::Uint64 => "UINT64",
            DataType::Int8 => "INT8",
            DataType::Int16 => "INT16",
            DataType::Int32 => "INT32",
            DataType::Int64 => "INT64",
            DataType::Fp16 => "FP16",
            DataType::Fp32 => "FP32",
            DataType::Fp64 => "FP64",
            DataType::Bytes => "BYTES",
        }
    }

    pub fn parse(tag: &str) -> Result<Self, Error> {
        match tag {
            "BOOL" => Ok(DataType::Bool),
            "UINT8" => Ok(DataType::Uint8),
            "UINT16" => Ok(DataType::Uint16),
            "UINT32" => Ok(DataType::Uint32),
            "UINT64" => Ok(DataType::Uint64),
            "INT8" => Ok(DataType::Int8),
            "INT16" => Ok(DataType::Int16),
            "INT32" => Ok(DataType::Int32),
            "INT64" => Ok(DataType::Int64),
            "FP16" => Ok(DataType::Fp16),
            "FP32" => Ok(DataType::Fp32),
            "FP64" => Ok(DataType::Fp64),
            "BYTES" => Ok(DataType::Bytes),
            _ => Err(Error::InvalidArgument(format!("unknown datatype: {tag}"))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
