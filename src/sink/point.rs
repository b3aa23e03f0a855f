use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use thiserror::Error;

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::Boolean(v) => write!(f, "{v}"),
        }
    }
}

/// Point construction rejected by the sink's schema rules.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("measurement name is empty")]
    EmptyMeasurement,

    #[error("point for {measurement} has no fields")]
    NoFields { measurement: String },

    #[error("point for {measurement} has an empty tag key")]
    EmptyTagKey { measurement: String },

    #[error("point for {measurement} has an empty field key")]
    EmptyFieldKey { measurement: String },

    #[error("field {key} of {measurement} is not a finite float")]
    NonFiniteFloat { measurement: String, key: String },
}

/// One time-stamped, tagged, multi-field observation.
///
/// Tags and fields are sorted by key, which gives the line protocol a
/// stable series key. Tags and fields are separate key spaces.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: SystemTime,
}

impl MetricPoint {
    /// Validate and build a point. Trailing backslashes are trimmed from
    /// tag values, and tags left with an empty value are dropped, since
    /// the line protocol cannot carry either.
    pub fn new(
        measurement: impl Into<String>,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        timestamp: SystemTime,
    ) -> Result<Self, NormalizeError> {
        let measurement = measurement.into();
        if measurement.is_empty() {
            return Err(NormalizeError::EmptyMeasurement);
        }

        if fields.is_empty() {
            return Err(NormalizeError::NoFields { measurement });
        }

        if tags.keys().any(String::is_empty) {
            return Err(NormalizeError::EmptyTagKey { measurement });
        }

        for (key, value) in &fields {
            if key.is_empty() {
                return Err(NormalizeError::EmptyFieldKey { measurement });
            }
            if let FieldValue::Float(v) = value {
                if !v.is_finite() {
                    return Err(NormalizeError::NonFiniteFloat {
                        measurement,
                        key: key.clone(),
                    });
                }
            }
        }

        let tags = tags
            .into_iter()
            .filter_map(|(k, v)| {
                let trimmed = v.trim_end_matches('\\');
                if trimmed.is_empty() {
                    None
                } else if trimmed.len() == v.len() {
                    Some((k, v))
                } else {
                    Some((k, trimmed.to_string()))
                }
            })
            .collect();

        Ok(Self {
            measurement,
            tags,
            fields,
            timestamp,
        })
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}
