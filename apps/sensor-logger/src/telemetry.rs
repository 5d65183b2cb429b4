use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;

pub const MEASUREMENT: &str = "sensor_data";
const UNKNOWN: &str = "unknown";
const INT16_FULL_SCALE: f64 = 32768.0;

/// One converted observation, ready for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub device: String,
    pub channel: String,
    pub io_type: String,
    pub data_type: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Digital,
    Integer16,
    #[default]
    Float,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SampleMetadata {
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default, rename = "type")]
    pub device_type: Option<String>,
    #[serde(default)]
    pub io_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sample {
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub metadata: SampleMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Int(i64),
    Float(f64),
    Str(String),
}

/// Only the top-level keys. Field shapes are checked after the message is
/// known to carry data, so control traffic never counts as malformed.
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    samples: Option<Value>,
    #[serde(default, deserialize_with = "key_present")]
    command: bool,
}

fn key_present<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    serde::de::IgnoredAny::deserialize(deserializer)?;
    Ok(true)
}

/// A data message: every sample entry still raw, so each one can fail on its own.
#[derive(Debug)]
pub struct RawMessage {
    pub timestamp: DateTime<Utc>,
    pub samples: BTreeMap<String, Value>,
}

#[derive(Debug)]
pub enum Decoded {
    Data(RawMessage),
    /// Control traffic (`command`) or messages without `samples`.
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid message JSON: {0}")]
    Json(#[from] simd_json::Error),
    #[error("message samples must be an object, got {found}")]
    Samples { found: &'static str },
    #[error("message of {samples} samples has unparseable timestamp {raw:?}")]
    Timestamp { raw: String, samples: usize },
}

impl MessageError {
    /// Sample entries that were readable before the message was rejected.
    pub fn sample_count(&self) -> usize {
        match self {
            MessageError::Timestamp { samples, .. } => *samples,
            _ => 0,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConversionError {
    #[error("sample for channel {channel} is not an object")]
    Shape { channel: String },
    #[error("sample for channel {channel} has no value")]
    MissingValue { channel: String },
    #[error("sample for channel {channel} has non-numeric value {value}")]
    NonNumeric { channel: String, value: String },
    #[error("sample for channel {channel} converts to non-finite {value}")]
    NonFinite { channel: String, value: f64 },
}

pub fn decode_message(
    payload: &mut [u8],
    received_at: DateTime<Utc>,
) -> Result<Decoded, MessageError> {
    let wire: WireEnvelope = simd_json::serde::from_slice(payload)?;
    if wire.command {
        return Ok(Decoded::Ignored);
    }
    let samples = match wire.samples {
        None => return Ok(Decoded::Ignored),
        Some(Value::Object(map)) => map.into_iter().collect::<BTreeMap<_, _>>(),
        Some(other) => {
            return Err(MessageError::Samples {
                found: json_kind(&other),
            })
        }
    };

    let timestamp = match wire.timestamp {
        None | Some(Value::Null) => received_at,
        Some(raw) => WireTimestamp::deserialize(&raw)
            .ok()
            .and_then(|ts| parse_timestamp(&ts))
            .ok_or_else(|| MessageError::Timestamp {
                raw: raw.to_string(),
                samples: samples.len(),
            })?,
    };

    Ok(Decoded::Data(RawMessage { timestamp, samples }))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Result of converting one message: the good points plus the per-sample failures.
#[derive(Debug, Default)]
pub struct Conversion {
    pub points: Vec<Point>,
    pub failures: Vec<ConversionError>,
}

pub fn convert_message(message: RawMessage) -> Conversion {
    let mut conversion = Conversion {
        points: Vec::with_capacity(message.samples.len()),
        failures: Vec::new(),
    };
    for (channel, raw) in message.samples {
        match convert_sample(channel, raw, message.timestamp) {
            Ok(point) => conversion.points.push(point),
            Err(err) => conversion.failures.push(err),
        }
    }
    conversion
}

fn convert_sample(
    channel: String,
    raw: Value,
    timestamp: DateTime<Utc>,
) -> Result<Point, ConversionError> {
    if !raw.is_object() {
        return Err(ConversionError::Shape { channel });
    }
    let sample: Sample = match serde_json::from_value(raw) {
        Ok(sample) => sample,
        Err(_) => return Err(ConversionError::Shape { channel }),
    };

    let raw_value = match sample.value {
        None | Some(Value::Null) => return Err(ConversionError::MissingValue { channel }),
        Some(Value::Bool(b)) => {
            if b {
                1.0
            } else {
                0.0
            }
        }
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) => v,
            None => {
                return Err(ConversionError::NonNumeric {
                    channel,
                    value: n.to_string(),
                })
            }
        },
        Some(other) => {
            return Err(ConversionError::NonNumeric {
                channel,
                value: other.to_string(),
            })
        }
    };

    let value = match sample.metadata.value_type {
        ValueType::Digital => {
            if raw_value != 0.0 {
                1.0
            } else {
                0.0
            }
        }
        ValueType::Integer16 => raw_value / INT16_FULL_SCALE,
        ValueType::Float | ValueType::Other => raw_value,
    };
    if !value.is_finite() {
        return Err(ConversionError::NonFinite { channel, value });
    }

    let device_type = sample
        .metadata
        .device_type
        .unwrap_or_else(|| UNKNOWN.to_string());
    let io_type = sample
        .metadata
        .io_type
        .unwrap_or_else(|| UNKNOWN.to_string());

    Ok(Point {
        device: device_type.clone(),
        channel,
        io_type,
        data_type: device_type,
        value,
        timestamp,
    })
}

fn parse_timestamp(raw: &WireTimestamp) -> Option<DateTime<Utc>> {
    match raw {
        WireTimestamp::Int(v) => epoch_to_dt(*v as f64),
        WireTimestamp::Float(v) => epoch_to_dt(*v),
        WireTimestamp::Str(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            s.parse::<f64>().ok().and_then(epoch_to_dt)
        }
    }
}

/// Epoch values are scaled by magnitude: seconds, millis, micros, then nanos.
fn epoch_to_dt(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let nanos = if value < 1e11 {
        value * 1e9
    } else if value < 1e14 {
        value * 1e6
    } else if value < 1e17 {
        value * 1e3
    } else {
        value
    };
    if nanos >= i64::MAX as f64 {
        return None;
    }
    Some(Utc.timestamp_nanos(nanos as i64))
}
