//! Turns the `readings` object of a decoded payload into numeric fields.
//!
//! Each metric comes from one `readings.<category>.<key>` leaf. Missing
//! categories and missing leaves are skipped, and a leaf that cannot be
//! coerced only drops that one field.

use log::{debug, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::models::{json_kind, DecodedPayload, Lookup, Section};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    Temperature,
    Humidity,
    Light,
    Moisture,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::Light => "light",
            Metric::Moisture => "moisture",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
enum Encoding {
    /// Native number or numeric string.
    Numeric,
    /// `1.0` when the value equals `on` ignoring case, otherwise `0.0`.
    Binary { on: &'static str },
}

struct FieldSource {
    category: &'static str,
    key: &'static str,
    metric: Metric,
    encoding: Encoding,
}

const FIELD_SOURCES: &[FieldSource] = &[
    FieldSource {
        category: "climate",
        key: "temperature",
        metric: Metric::Temperature,
        encoding: Encoding::Numeric,
    },
    FieldSource {
        category: "climate",
        key: "humidity",
        metric: Metric::Humidity,
        encoding: Encoding::Numeric,
    },
    FieldSource {
        category: "light",
        key: "light_status",
        metric: Metric::Light,
        encoding: Encoding::Binary { on: "Light" },
    },
    FieldSource {
        category: "soil",
        key: "moisture_percentage",
        metric: Metric::Moisture,
        encoding: Encoding::Numeric,
    },
];

/// Numeric fields extracted from one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingSet(BTreeMap<Metric, f64>);

impl ReadingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, metric: Metric, value: f64) {
        self.0.insert(metric, value);
    }

    #[cfg(test)]
    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.0.get(&metric).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        self.0.iter().map(|(metric, value)| (*metric, *value))
    }
}

impl fmt::Display for ReadingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (metric, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", metric, value)?;
        }
        f.write_str("}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoercionError {
    NotNumeric(String),
    NotFinite(f64),
    UnsupportedType(&'static str),
}

impl fmt::Display for CoercionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoercionError::NotNumeric(s) => write!(f, "'{}' is not a number", s),
            CoercionError::NotFinite(v) => write!(f, "{} is not a finite number", v),
            CoercionError::UnsupportedType(kind) => write!(f, "cannot coerce a {} to a number", kind),
        }
    }
}

pub fn extract_readings(payload: &DecodedPayload) -> ReadingSet {
    let mut readings = ReadingSet::new();

    let root = match payload.section("readings") {
        Lookup::Found(root) => root,
        Lookup::Absent => {
            warn!("Message does not contain a 'readings' object, nothing to extract");
            return readings;
        }
        Lookup::WrongType(kind) => {
            warn!("'readings' is a {} instead of an object, nothing to extract", kind);
            return readings;
        }
    };

    for source in FIELD_SOURCES {
        let Some(category) = category_section(root, source.category) else {
            continue;
        };
        let Some(raw) = category.get(source.key) else {
            continue;
        };

        match encode(raw, source.encoding) {
            Ok(value) => readings.insert(source.metric, value),
            Err(e) => debug!(
                "Skipping field readings.{}.{} ({}): {}",
                source.category, source.key, raw, e
            ),
        }
    }

    readings
}

fn category_section<'a>(root: Section<'a>, category: &str) -> Option<Section<'a>> {
    match root.section(category) {
        Lookup::Found(section) => Some(section),
        Lookup::Absent => None,
        Lookup::WrongType(kind) => {
            debug!("Ignoring readings.{}: {} instead of an object", category, kind);
            None
        }
    }
}

fn encode(raw: &Value, encoding: Encoding) -> Result<f64, CoercionError> {
    match encoding {
        Encoding::Numeric => coerce_numeric(raw),
        Encoding::Binary { on } => Ok(binary_flag(raw, on)),
    }
}

pub fn coerce_numeric(value: &Value) -> Result<f64, CoercionError> {
    let number = match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| CoercionError::NotNumeric(n.to_string()))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| CoercionError::NotNumeric(s.clone()))?,
        other => return Err(CoercionError::UnsupportedType(json_kind(other))),
    };

    if number.is_finite() {
        Ok(number)
    } else {
        Err(CoercionError::NotFinite(number))
    }
}

fn binary_flag(value: &Value, on: &str) -> f64 {
    match value {
        Value::String(s) if s.eq_ignore_ascii_case(on) => 1.0,
        _ => 0.0,
    }
}
