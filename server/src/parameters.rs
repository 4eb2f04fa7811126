/// Load- and request-time parameters
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single parameter value. Deserialization is untagged, so JSON booleans,
/// integers, floats and strings map onto the expected variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parameter {
    Bool(bool),
    Int(i32),
    Double(f64),
    String(String),
}

impl From<bool> for Parameter {
    fn from(value: bool) -> Self {
        Parameter::Bool(value)
    }
}

impl From<i32> for Parameter {
    fn from(value: i32) -> Self {
        Parameter::Int(value)
    }
}

impl From<f64> for Parameter {
    fn from(value: f64) -> Self {
        Parameter::Double(value)
    }
}

impl From<&str> for Parameter {
    fn from(value: &str) -> Self {
        Parameter::String(value.to_string())
    }
}

impl From<String> for Parameter {
    fn from(value: String) -> Self {
        Parameter::String(value)
    }
}

/// An ordered string-keyed map of primitive values. Used for worker load
/// configuration and carried on requests, inputs and responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterMap {
    params: BTreeMap<String, Parameter>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &str, value: impl Into<Parameter>) {
        self.params.insert(key.to_string(), value.into());
    }

    pub fn erase(&mut self, key: &str) {
        self.params.remove(key);
    }

    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.params.get(key) {
            Some(Parameter::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        match self.params.get(key) {
            Some(Parameter::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.params.get(key) {
            Some(Parameter::Double(value)) => Some(*value),
            Some(Parameter::Int(value)) => Some(f64::from(*value)),
            _ => None,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.params.get(key) {
            Some(Parameter::String(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Parameter)> {
        self.params.iter()
    }

    /// The parameters that determine whether two loads of the same worker
    /// may share an endpoint. The `share` flag itself does not participate.
    pub fn sharing_key(&self) -> ParameterMap {
        let mut key = self.clone();
        key.erase("share");
        key
    }
}
