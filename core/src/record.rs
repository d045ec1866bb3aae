//! Record types flowing between stages.
//!
//! RawRecord (bronze) → WeatherRecord / TrafficRecord (silver)
//! → MergedRecord (gold). Every type past the cleaner is
//! immutable once built: stages take slices and return new values.

use crate::{
    normalize::is_null_token,
    schema::SourceSchema,
    types::{SourceKind, Timestamp, CANONICAL_TIMESTAMP_FORMAT},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Raw layer ────────────────────────────────────────────────────────────────

/// One ingested row, every field still a string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    fields: BTreeMap<String, String>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    /// The trimmed field value, or None when absent, blank, or a null token.
    pub fn get(&self, name: &str) -> Option<&str> {
        let v = self.fields.get(name)?.trim();
        if v.is_empty() || is_null_token(v) {
            None
        } else {
            Some(v)
        }
    }
}

/// A raw table as delivered by the input provider: declared columns plus rows.
#[derive(Debug, Clone)]
pub struct RawDataset {
    pub source: SourceKind,
    pub columns: Vec<String>,
    pub rows: Vec<RawRecord>,
}

impl RawDataset {
    pub fn new(source: SourceKind, columns: Vec<String>, rows: Vec<RawRecord>) -> Self {
        Self {
            source,
            columns,
            rows,
        }
    }

    /// Build a dataset whose declared columns are taken from the schema.
    /// Used when re-cleaning already-clean records.
    pub fn from_clean<R: CleanRecord>(schema: &SourceSchema, records: &[R]) -> Self {
        Self {
            source: R::SOURCE,
            columns: schema.field_names(),
            rows: records.iter().map(|r| r.to_raw(schema)).collect(),
        }
    }
}

// ── Clean layer ──────────────────────────────────────────────────────────────

/// A schema-conformant record for one source.
///
/// The cleaner is generic over this trait; the field lists fix the
/// order in which numeric and label values are handed to `from_parts`.
pub trait CleanRecord: Clone + std::fmt::Debug {
    const SOURCE: SourceKind;
    const NUMERIC_FIELDS: &'static [&'static str];
    const LABEL_FIELDS: &'static [&'static str];

    /// Build from validated parts. `numeric` and `labels` follow
    /// `NUMERIC_FIELDS` and `LABEL_FIELDS` order exactly.
    fn from_parts(timestamp: Timestamp, city: String, numeric: &[f64], labels: &[String]) -> Self;

    fn timestamp(&self) -> Timestamp;
    fn city(&self) -> &str;
    fn numeric_values(&self) -> Vec<f64>;
    fn label_values(&self) -> Vec<&str>;

    /// Render back to a raw row using the schema's column names and
    /// its first accepted timestamp format.
    fn to_raw(&self, schema: &SourceSchema) -> RawRecord {
        let fmt = schema
            .timestamp_formats
            .first()
            .map(String::as_str)
            .unwrap_or(CANONICAL_TIMESTAMP_FORMAT);
        let mut raw = RawRecord::new();
        raw.set(&schema.timestamp_field, self.timestamp().format(fmt).to_string());
        raw.set(&schema.city_field, self.city());
        for (name, value) in Self::NUMERIC_FIELDS.iter().zip(self.numeric_values()) {
            raw.set(*name, value.to_string());
        }
        for (name, value) in Self::LABEL_FIELDS.iter().zip(self.label_values()) {
            raw.set(*name, value);
        }
        raw
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub timestamp: Timestamp,
    pub city: String,
    pub temperature_c: f64,
    pub humidity: f64,
    pub rain_mm: f64,
    pub wind_speed_kmh: f64,
    pub visibility_m: f64,
    pub air_pressure_hpa: f64,
    pub season: String,
    pub weather_condition: String,
}

impl CleanRecord for WeatherRecord {
    const SOURCE: SourceKind = SourceKind::Weather;
    const NUMERIC_FIELDS: &'static [&'static str] = &[
        "temperature_c",
        "humidity",
        "rain_mm",
        "wind_speed_kmh",
        "visibility_m",
        "air_pressure_hpa",
    ];
    const LABEL_FIELDS: &'static [&'static str] = &["season", "weather_condition"];

    fn from_parts(timestamp: Timestamp, city: String, numeric: &[f64], labels: &[String]) -> Self {
        Self {
            timestamp,
            city,
            temperature_c: numeric[0],
            humidity: numeric[1],
            rain_mm: numeric[2],
            wind_speed_kmh: numeric[3],
            visibility_m: numeric[4],
            air_pressure_hpa: numeric[5],
            season: labels[0].clone(),
            weather_condition: labels[1].clone(),
        }
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn city(&self) -> &str {
        &self.city
    }

    fn numeric_values(&self) -> Vec<f64> {
        vec![
            self.temperature_c,
            self.humidity,
            self.rain_mm,
            self.wind_speed_kmh,
            self.visibility_m,
            self.air_pressure_hpa,
        ]
    }

    fn label_values(&self) -> Vec<&str> {
        vec![self.season.as_str(), self.weather_condition.as_str()]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub timestamp: Timestamp,
    pub city: String,
    pub vehicle_count: f64,
    pub avg_speed_kmh: f64,
    pub accident_count: f64,
    pub visibility_m: f64,
    pub area: String,
    /// "Low" | "Medium" | "High"
    pub congestion_level: String,
    pub road_condition: String,
}

impl CleanRecord for TrafficRecord {
    const SOURCE: SourceKind = SourceKind::Traffic;
    const NUMERIC_FIELDS: &'static [&'static str] =
        &["vehicle_count", "avg_speed_kmh", "accident_count", "visibility_m"];
    const LABEL_FIELDS: &'static [&'static str] = &["area", "congestion_level", "road_condition"];

    fn from_parts(timestamp: Timestamp, city: String, numeric: &[f64], labels: &[String]) -> Self {
        Self {
            timestamp,
            city,
            vehicle_count: numeric[0],
            avg_speed_kmh: numeric[1],
            accident_count: numeric[2],
            visibility_m: numeric[3],
            area: labels[0].clone(),
            congestion_level: labels[1].clone(),
            road_condition: labels[2].clone(),
        }
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn city(&self) -> &str {
        &self.city
    }

    fn numeric_values(&self) -> Vec<f64> {
        vec![
            self.vehicle_count,
            self.avg_speed_kmh,
            self.accident_count,
            self.visibility_m,
        ]
    }

    fn label_values(&self) -> Vec<&str> {
        vec![
            self.area.as_str(),
            self.congestion_level.as_str(),
            self.road_condition.as_str(),
        ]
    }
}

// ── Gold layer ───────────────────────────────────────────────────────────────

/// Variables exposed to the analytical stages, weather first.
pub const ANALYSIS_VARIABLES: &[&str] = &[
    "temperature_c",
    "humidity",
    "rain_mm",
    "wind_speed_kmh",
    "visibility_m",
    "vehicle_count",
    "avg_speed_kmh",
    "accident_count",
];

/// How many leading entries of ANALYSIS_VARIABLES come from the weather side.
pub const WEATHER_VARIABLE_COUNT: usize = 5;

/// One weather observation paired with one traffic observation
/// for the same city, within the join tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub weather: WeatherRecord,
    pub traffic: TrafficRecord,
}

impl MergedRecord {
    pub fn city(&self) -> &str {
        &self.traffic.city
    }

    /// The join timestamp is the traffic side's.
    pub fn timestamp(&self) -> Timestamp {
        self.traffic.timestamp
    }

    /// Absolute distance between the two sides' timestamps, in seconds.
    pub fn offset_seconds(&self) -> i64 {
        (self.weather.timestamp - self.traffic.timestamp)
            .num_seconds()
            .abs()
    }

    /// Look up an analysis variable by name. Visibility resolves to
    /// the weather station's reading.
    pub fn variable(&self, name: &str) -> Option<f64> {
        let w = &self.weather;
        let t = &self.traffic;
        let v = match name {
            "temperature_c" => w.temperature_c,
            "humidity" => w.humidity,
            "rain_mm" => w.rain_mm,
            "wind_speed_kmh" => w.wind_speed_kmh,
            "visibility_m" => w.visibility_m,
            "air_pressure_hpa" => w.air_pressure_hpa,
            "vehicle_count" => t.vehicle_count,
            "avg_speed_kmh" => t.avg_speed_kmh,
            "accident_count" => t.accident_count,
            "traffic_visibility_m" => t.visibility_m,
            _ => return None,
        };
        Some(v)
    }

    /// The analysis variables in ANALYSIS_VARIABLES order.
    pub fn analysis_vector(&self) -> Vec<f64> {
        let w = &self.weather;
        let t = &self.traffic;
        vec![
            w.temperature_c,
            w.humidity,
            w.rain_mm,
            w.wind_speed_kmh,
            w.visibility_m,
            t.vehicle_count,
            t.avg_speed_kmh,
            t.accident_count,
        ]
    }
}
