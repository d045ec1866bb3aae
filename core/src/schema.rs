//! Source schemas: which raw columns a source must declare, how to read
//! them, and the plausible range each numeric field must land in.

use crate::{
    error::{PipelineError, PipelineResult},
    record::CleanRecord,
    types::{SourceKind, CANONICAL_TIMESTAMP_FORMAT},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericField {
    pub name: String,
    /// Plausible lower bound (inclusive).
    pub min: f64,
    /// Plausible upper bound (inclusive).
    pub max: f64,
    /// Negative readings are sign errors: take the absolute value.
    #[serde(default)]
    pub absolute: bool,
}

impl NumericField {
    pub fn new(name: &str, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            absolute: false,
        }
    }

    pub fn absolute(mut self) -> Self {
        self.absolute = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelField {
    pub name: String,
    /// Accepted spellings (matched case-insensitively). Empty = any value.
    #[serde(default)]
    pub allowed: Vec<String>,
    /// Constant used for missing labels. None = the dataset mode.
    #[serde(default)]
    pub fallback: Option<String>,
}

impl LabelField {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            allowed: Vec::new(),
            fallback: None,
        }
    }

    pub fn allowed(mut self, values: &[&str]) -> Self {
        self.allowed = values.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn fallback(mut self, value: &str) -> Self {
        self.fallback = Some(value.into());
        self
    }

    /// Canonical spelling for an accepted value, None when rejected.
    pub fn canonicalize(&self, value: &str) -> Option<String> {
        if self.allowed.is_empty() {
            return Some(value.to_string());
        }
        self.allowed
            .iter()
            .find(|a| a.eq_ignore_ascii_case(value))
            .cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSchema {
    pub source: SourceKind,
    pub timestamp_field: String,
    pub city_field: String,
    /// Accepted timestamp formats, tried in order. The first one is also
    /// the rendering format for clean records.
    pub timestamp_formats: Vec<String>,
    pub numeric: Vec<NumericField>,
    pub labels: Vec<LabelField>,
}

fn default_timestamp_formats() -> Vec<String> {
    [
        CANONICAL_TIMESTAMP_FORMAT,
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%d/%m/%Y %H:%M",
        "%Y-%m-%d",
    ]
    .iter()
    .map(|f| f.to_string())
    .collect()
}

impl SourceSchema {
    /// Weather feed schema. Plausible bounds follow the physical
    /// limits the raw feed is expected to respect.
    pub fn weather() -> Self {
        Self {
            source: SourceKind::Weather,
            timestamp_field: "date_time".into(),
            city_field: "city".into(),
            timestamp_formats: default_timestamp_formats(),
            numeric: vec![
                NumericField::new("temperature_c", -20.0, 50.0),
                NumericField::new("humidity", 0.0, 100.0),
                NumericField::new("rain_mm", 0.0, 50.0),
                NumericField::new("wind_speed_kmh", 0.0, 150.0),
                NumericField::new("visibility_m", 0.0, 10_000.0),
                NumericField::new("air_pressure_hpa", 900.0, 1_100.0),
            ],
            labels: vec![
                LabelField::new("season").allowed(&["Winter", "Spring", "Summer", "Autumn"]),
                LabelField::new("weather_condition"),
            ],
        }
    }

    pub fn traffic() -> Self {
        Self {
            source: SourceKind::Traffic,
            timestamp_field: "date_time".into(),
            city_field: "city".into(),
            timestamp_formats: default_timestamp_formats(),
            numeric: vec![
                NumericField::new("vehicle_count", 0.0, 5_000.0),
                NumericField::new("avg_speed_kmh", 0.0, 200.0).absolute(),
                NumericField::new("accident_count", 0.0, 10.0),
                NumericField::new("visibility_m", 0.0, 10_000.0),
            ],
            labels: vec![
                LabelField::new("area").fallback("Unknown"),
                LabelField::new("congestion_level").allowed(&["Low", "Medium", "High"]),
                LabelField::new("road_condition"),
            ],
        }
    }

    pub fn numeric_field(&self, name: &str) -> Option<&NumericField> {
        self.numeric.iter().find(|f| f.name == name)
    }

    pub fn label_field(&self, name: &str) -> Option<&LabelField> {
        self.labels.iter().find(|f| f.name == name)
    }

    /// Every column this schema reads, key fields first.
    pub fn field_names(&self) -> Vec<String> {
        let mut names = vec![self.timestamp_field.clone(), self.city_field.clone()];
        names.extend(self.numeric.iter().map(|f| f.name.clone()));
        names.extend(self.labels.iter().map(|f| f.name.clone()));
        names
    }

    /// Check the schema is well formed and describes exactly the
    /// fields record type `R` is built from.
    pub fn validate_for<R: CleanRecord>(&self) -> PipelineResult<()> {
        let err = |reason: String| PipelineError::schema(self.source, reason);

        if self.source != R::SOURCE {
            return Err(err(format!(
                "schema describes {} records but {} records were requested",
                self.source,
                R::SOURCE
            )));
        }
        if self.timestamp_formats.is_empty() {
            return Err(err("no accepted timestamp formats".into()));
        }

        let names = self.field_names();
        let mut seen = BTreeSet::new();
        for name in &names {
            if name.trim().is_empty() {
                return Err(err("empty field name".into()));
            }
            if !seen.insert(name.as_str()) {
                return Err(err(format!("field '{name}' declared twice")));
            }
        }

        for f in &self.numeric {
            if !(f.min.is_finite() && f.max.is_finite()) || f.min > f.max {
                return Err(err(format!(
                    "field '{}' has invalid plausible range [{}, {}]",
                    f.name, f.min, f.max
                )));
            }
        }
        for f in &self.labels {
            if let Some(fb) = &f.fallback {
                if f.canonicalize(fb).is_none() {
                    return Err(err(format!(
                        "label '{}' fallback '{fb}' is not an allowed value",
                        f.name
                    )));
                }
            }
        }

        let numeric: BTreeSet<&str> = self.numeric.iter().map(|f| f.name.as_str()).collect();
        let expected: BTreeSet<&str> = R::NUMERIC_FIELDS.iter().copied().collect();
        if numeric != expected {
            return Err(err(format!(
                "numeric fields {numeric:?} do not match record fields {expected:?}"
            )));
        }
        let labels: BTreeSet<&str> = self.labels.iter().map(|f| f.name.as_str()).collect();
        let expected: BTreeSet<&str> = R::LABEL_FIELDS.iter().copied().collect();
        if labels != expected {
            return Err(err(format!(
                "label fields {labels:?} do not match record fields {expected:?}"
            )));
        }
        Ok(())
    }

    /// Every field the schema names must be declared by the raw input.
    pub fn check_declared_columns(&self, columns: &[String]) -> PipelineResult<()> {
        let declared: BTreeSet<&str> = columns.iter().map(|c| c.trim()).collect();
        let missing: Vec<String> = self
            .field_names()
            .into_iter()
            .filter(|n| !declared.contains(n.as_str()))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::schema(
                self.source,
                format!("raw input does not declare required fields: {}", missing.join(", ")),
            ))
        }
    }
}
