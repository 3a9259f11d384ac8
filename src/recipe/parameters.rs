//! Layered parameter lookup.
//!
//! A [`ParameterChain`] resolves a key against an ordered list of mappings
//! (for example a sub-command, then the message body, then the step
//! parameters) and substitutes environment references on the way out.

use serde_json::{Map, Value};

use super::substitution::substitute_value;

#[derive(Debug, Clone, Default)]
pub struct ParameterChain {
    layers: Vec<Map<String, Value>>,
    environment: Map<String, Value>,
}

impl ParameterChain {
    pub fn new(environment: Map<String, Value>) -> Self {
        Self {
            layers: Vec::new(),
            environment,
        }
    }

    /// Append a layer with lower precedence than every existing one
    pub fn with_layer(mut self, layer: Map<String, Value>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Append a layer if `value` is a mapping
    pub fn with_value_layer(self, value: &Value) -> Self {
        match value {
            Value::Object(map) => self.with_layer(map.clone()),
            _ => self,
        }
    }

    /// Insert a layer with higher precedence than every existing one
    pub fn with_front_layer(mut self, layer: Map<String, Value>) -> Self {
        self.layers.insert(0, layer);
        self
    }

    /// Value with environment references substituted
    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_raw(key)
            .map(|value| substitute_value(value, &self.environment))
    }

    /// Value exactly as written, for parameters such as file paths that may
    /// contain a literal `$`
    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.layers
            .iter()
            .find_map(|layer| layer.get(key).filter(|value| !value.is_null()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get_raw(key).is_some()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }

    /// Numeric parameter; numeric strings are accepted
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        as_f64(&self.get(key)?)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        as_i64(&self.get(key)?)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(b),
            Value::Number(n) => n.as_f64().map(|n| n != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" | "" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn environment(&self) -> &Map<String, Value> {
        &self.environment
    }
}

pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
