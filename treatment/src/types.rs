use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub type ProjectId = u32;
pub type ExperimentId = i64;

/// A typed segment value, either stored on an experiment or produced for a
/// request by a segmenter transform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SegmenterValue {
    Bool(bool),
    Integer(i64),
    Real(f64),
    String(String),
}

impl SegmenterValue {
    /// Infers the value kind from a raw JSON value. Arrays, objects and
    /// nulls have no segment representation.
    pub fn from_json(raw: &serde_json::Value) -> Option<Self> {
        match raw {
            serde_json::Value::Bool(b) => Some(SegmenterValue::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(SegmenterValue::Integer(i)),
                None => n.as_f64().map(SegmenterValue::Real),
            },
            serde_json::Value::String(s) => Some(SegmenterValue::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for SegmenterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmenterValue::Bool(b) => write!(f, "{b}"),
            SegmenterValue::Integer(i) => write!(f, "{i}"),
            SegmenterValue::Real(r) => write!(f, "{r}"),
            SegmenterValue::String(s) => f.write_str(s),
        }
    }
}

/// Declared value type of a project segmenter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SegmenterType {
    String,
    Integer,
    Real,
    Bool,
}

impl SegmenterType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SegmenterType::String => "string",
            SegmenterType::Integer => "integer",
            SegmenterType::Real => "real",
            SegmenterType::Bool => "bool",
        }
    }

    /// Converts a raw JSON value into a value of this type. Integers accept
    /// whole or fractional numbers (truncated) and numeric strings, since
    /// browsers send every JSON number as a float.
    pub fn coerce(&self, raw: &serde_json::Value) -> Option<SegmenterValue> {
        use serde_json::Value;

        match (self, raw) {
            (SegmenterType::String, Value::String(s)) => Some(SegmenterValue::String(s.clone())),
            (SegmenterType::Integer, Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(SegmenterValue::Integer),
            (SegmenterType::Integer, Value::String(s)) => {
                s.trim().parse().ok().map(SegmenterValue::Integer)
            }
            (SegmenterType::Real, Value::Number(n)) => n.as_f64().map(SegmenterValue::Real),
            (SegmenterType::Real, Value::String(s)) => {
                s.trim().parse().ok().map(SegmenterValue::Real)
            }
            (SegmenterType::Bool, Value::Bool(b)) => Some(SegmenterValue::Bool(*b)),
            (SegmenterType::Bool, Value::String(s)) => {
                s.trim().parse().ok().map(SegmenterValue::Bool)
            }
            _ => None,
        }
    }
}

impl fmt::Display for SegmenterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("unknown segmenter type: {0}")]
pub struct UnknownSegmenterType(pub String);

impl FromStr for SegmenterType {
    type Err = UnknownSegmenterType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "string" => Ok(SegmenterType::String),
            "integer" => Ok(SegmenterType::Integer),
            "real" | "float" => Ok(SegmenterType::Real),
            "bool" => Ok(SegmenterType::Bool),
            _ => Err(UnknownSegmenterType(s.to_string())),
        }
    }
}

impl TryFrom<String> for SegmenterType {
    type Error = UnknownSegmenterType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SegmenterType> for String {
    fn from(value: SegmenterType) -> Self {
        value.as_str().to_string()
    }
}

/// A project segmenter as published by the management plane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmenterConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: SegmenterType,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSegmenters {
    /// Segmenter names in priority order.
    pub names: Vec<String>,
    /// Request variables consumed by each segmenter.
    #[serde(default)]
    pub variables: HashMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSettings {
    pub project_id: ProjectId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub passkey: String,
    /// Name of the request field whose value seeds treatment randomization.
    #[serde(default)]
    pub randomization_key: String,
    #[serde(default)]
    pub enable_s2id_clustering: bool,
    #[serde(default)]
    pub segmenters: ProjectSegmenters,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Active,
    Inactive,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentTier {
    #[default]
    Default,
    Override,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentType {
    #[serde(rename = "A/B")]
    AB,
    Switchback,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Treatment {
    pub name: String,
    #[serde(default)]
    pub configuration: serde_json::Value,
    #[serde(default)]
    pub traffic: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub project_id: ProjectId,
    pub name: String,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub tier: ExperimentTier,
    #[serde(rename = "type")]
    pub r#type: ExperimentType,
    /// Switchback window length in minutes.
    #[serde(default)]
    pub interval: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Admissible values per segmenter. A missing key or an empty list leaves
    /// the segmenter unconstrained.
    #[serde(default)]
    pub segments: HashMap<String, Vec<SegmenterValue>>,
    #[serde(default)]
    pub treatments: Vec<Treatment>,
}
