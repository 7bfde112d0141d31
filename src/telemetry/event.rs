//! Telemetry event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
  Bool(bool),
  Integer(i64),
  Float(f64),
  Text(String),
}

impl From<bool> for AttributeValue {
  fn from(v: bool) -> Self {
    AttributeValue::Bool(v)
  }
}

impl From<i64> for AttributeValue {
  fn from(v: i64) -> Self {
    AttributeValue::Integer(v)
  }
}

impl From<i32> for AttributeValue {
  fn from(v: i32) -> Self {
    AttributeValue::Integer(v.into())
  }
}

impl From<f64> for AttributeValue {
  fn from(v: f64) -> Self {
    AttributeValue::Float(v)
  }
}

impl From<&str> for AttributeValue {
  fn from(v: &str) -> Self {
    AttributeValue::Text(v.to_string())
  }
}

impl From<String> for AttributeValue {
  fn from(v: String) -> Self {
    AttributeValue::Text(v)
  }
}

/// One analytics event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
  #[serde(rename = "type")]
  pub event_type: String,
  #[serde(default)]
  pub attributes: BTreeMap<String, AttributeValue>,
  /// Milliseconds since the Unix epoch
  pub timestamp: i64,
}

impl TelemetryEvent {
  pub fn new(event_type: impl Into<String>, at: DateTime<Utc>) -> Self {
    Self {
      event_type: event_type.into(),
      attributes: BTreeMap::new(),
      timestamp: at.timestamp_millis(),
    }
  }

  pub fn with_attribute(
    mut self,
    key: impl Into<String>,
    value: impl Into<AttributeValue>,
  ) -> Self {
    self.attributes.insert(key.into(), value.into());
    self
  }
}
