//! Schema validator & cleaner: raw (bronze) rows to clean (silver) records.
//!
//! EXECUTION ORDER (fixed):
//!   1. Exact deduplication over every schema field, first occurrence wins.
//!   2. Key handling: rows without timestamp or city are dropped.
//!   3. Format normalization: timestamps against the accepted formats,
//!      numbers with separators/units coerced. Unparseable timestamps
//!      drop the row; uncoercible numbers become missing. Rows that now
//!      collide on (timestamp, city) keep the first occurrence.
//!   4. Imputation: missing numbers take the field median, missing labels
//!      the field mode (or the schema's fallback constant).
//!   5. Outlier correction: the plausible range, then Tukey fences computed
//!      on the range-clamped column.
//!
//! RULE: Bad rows are counted, never raised. The stage errors only on an
//! invalid schema, a schema field the input does not declare, or empty input.

use crate::{
    config::{CleaningConfig, OutlierPolicy},
    error::{PipelineError, PipelineResult},
    event::{DataQualityIssue, PipelineEvent},
    normalize::{coerce_numeric, parse_timestamp},
    record::{CleanRecord, RawDataset, RawRecord},
    schema::{LabelField, NumericField, SourceSchema},
    stats,
    types::{SourceKind, Timestamp},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const STAGE: &str = "cleaner";

// ── Public types ─────────────────────────────────────────────────────────────

/// Per-source counters for everything the cleaner changed or discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningReport {
    pub source: SourceKind,
    pub input_rows: usize,
    pub duplicates_removed: usize,
    pub missing_key_dropped: usize,
    pub invalid_timestamp_dropped: usize,
    pub key_conflicts: usize,
    /// Rows missing a value that had nothing to impute from.
    pub unimputable_dropped: usize,
    pub outlier_dropped: usize,
    pub values_imputed: usize,
    pub labels_imputed: usize,
    pub values_coerced: usize,
    pub sign_corrected: usize,
    pub values_clipped: usize,
    pub output_rows: usize,
}

impl CleaningReport {
    fn new(source: SourceKind, input_rows: usize) -> Self {
        Self {
            source,
            input_rows,
            duplicates_removed: 0,
            missing_key_dropped: 0,
            invalid_timestamp_dropped: 0,
            key_conflicts: 0,
            unimputable_dropped: 0,
            outlier_dropped: 0,
            values_imputed: 0,
            labels_imputed: 0,
            values_coerced: 0,
            sign_corrected: 0,
            values_clipped: 0,
            output_rows: 0,
        }
    }

    /// Rows that went in but did not come out.
    pub fn discarded(&self) -> usize {
        self.input_rows - self.output_rows
    }

    /// True when the cleaner had nothing to drop, fill or correct.
    pub fn is_untouched(&self) -> bool {
        self.discarded() == 0
            && self.values_imputed == 0
            && self.labels_imputed == 0
            && self.values_coerced == 0
            && self.sign_corrected == 0
            && self.values_clipped == 0
    }

    /// One DataQualityWarning per non-zero counter.
    pub fn warnings(&self) -> Vec<PipelineEvent> {
        let counters = [
            (DataQualityIssue::DuplicateRemoved, self.duplicates_removed),
            (DataQualityIssue::MissingKeyDropped, self.missing_key_dropped),
            (DataQualityIssue::InvalidTimestampDropped, self.invalid_timestamp_dropped),
            (DataQualityIssue::KeyConflictDropped, self.key_conflicts),
            (DataQualityIssue::UnimputableDropped, self.unimputable_dropped),
            (DataQualityIssue::OutlierDropped, self.outlier_dropped),
            (DataQualityIssue::ValueImputed, self.values_imputed),
            (DataQualityIssue::LabelImputed, self.labels_imputed),
            (DataQualityIssue::ValueCoerced, self.values_coerced),
            (DataQualityIssue::SignCorrected, self.sign_corrected),
            (DataQualityIssue::ValueClipped, self.values_clipped),
        ];
        counters
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(issue, count)| PipelineEvent::DataQualityWarning {
                source: self.source,
                issue,
                count,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct CleanOutcome<R> {
    pub records: Vec<R>,
    pub report: CleaningReport,
}

// ── Stage ────────────────────────────────────────────────────────────────────

pub struct Cleaner {
    schema: SourceSchema,
    config: CleaningConfig,
}

/// A row that survived key handling, values not yet imputed.
struct ParsedRow {
    timestamp: Timestamp,
    city: String,
    numeric: Vec<Option<f64>>,
    labels: Vec<Option<String>>,
}

impl Cleaner {
    pub fn new(schema: SourceSchema, config: CleaningConfig) -> Self {
        Self { schema, config }
    }

    pub fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    pub fn clean<R: CleanRecord>(&self, input: &RawDataset) -> PipelineResult<CleanOutcome<R>> {
        self.schema.validate_for::<R>()?;
        if input.source != R::SOURCE {
            return Err(PipelineError::schema(
                R::SOURCE,
                format!("input dataset is tagged as {}", input.source),
            ));
        }
        if !(self.config.iqr_k.is_finite() && self.config.iqr_k > 0.0) {
            return Err(PipelineError::schema(
                R::SOURCE,
                format!("IQR multiplier must be positive, got {}", self.config.iqr_k),
            ));
        }
        self.schema.check_declared_columns(&input.columns)?;
        if input.rows.is_empty() {
            return Err(PipelineError::precondition(
                STAGE,
                format!("{} input is empty", R::SOURCE),
            ));
        }

        let numeric_fields = self.fields_in_record_order::<R>()?;
        let label_fields = self.labels_in_record_order::<R>()?;
        let mut report = CleaningReport::new(R::SOURCE, input.rows.len());

        let unique = self.dedup_exact(&input.rows, &mut report);
        let parsed = self.parse_rows(&unique, &numeric_fields, &label_fields, &mut report);
        let filled = self.impute(parsed, &numeric_fields, &label_fields, &mut report);
        let records: Vec<R> = self
            .correct_outliers(filled, &numeric_fields, &mut report)
            .into_iter()
            .map(|(timestamp, city, numeric, labels)| R::from_parts(timestamp, city, &numeric, &labels))
            .collect();

        report.output_rows = records.len();
        log::info!(
            "cleaner[{}]: {} in, {} out ({} duplicates, {} imputed, {} clipped)",
            R::SOURCE,
            report.input_rows,
            report.output_rows,
            report.duplicates_removed,
            report.values_imputed + report.labels_imputed,
            report.values_clipped
        );
        if report.discarded() > 0 {
            log::warn!("cleaner[{}]: discarded {} rows", R::SOURCE, report.discarded());
        }

        Ok(CleanOutcome { records, report })
    }

    fn fields_in_record_order<R: CleanRecord>(&self) -> PipelineResult<Vec<&NumericField>> {
        R::NUMERIC_FIELDS
            .iter()
            .map(|name| {
                self.schema.numeric_field(name).ok_or_else(|| {
                    PipelineError::schema(R::SOURCE, format!("numeric field '{name}' not in schema"))
                })
            })
            .collect()
    }

    fn labels_in_record_order<R: CleanRecord>(&self) -> PipelineResult<Vec<&LabelField>> {
        R::LABEL_FIELDS
            .iter()
            .map(|name| {
                self.schema.label_field(name).ok_or_else(|| {
                    PipelineError::schema(R::SOURCE, format!("label field '{name}' not in schema"))
                })
            })
            .collect()
    }

    // ── Step 1 ─────────────────────────────────────────────────────

    fn dedup_exact<'a>(&self, rows: &'a [RawRecord], report: &mut CleaningReport) -> Vec<&'a RawRecord> {
        let names = self.schema.field_names();
        let mut seen: HashSet<Vec<Option<&str>>> = HashSet::with_capacity(rows.len());
        let mut unique = Vec::with_capacity(rows.len());
        for row in rows {
            let key: Vec<Option<&str>> = names.iter().map(|n| row.get(n)).collect();
            if seen.insert(key) {
                unique.push(row);
            } else {
                report.duplicates_removed += 1;
            }
        }
        unique
    }

    // ── Steps 2–3 ──────────────────────────────────────────────────

    fn parse_rows(
        &self,
        rows: &[&RawRecord],
        numeric_fields: &[&NumericField],
        label_fields: &[&LabelField],
        report: &mut CleaningReport,
    ) -> Vec<ParsedRow> {
        let mut seen_keys: HashSet<(Timestamp, String)> = HashSet::with_capacity(rows.len());
        let mut parsed = Vec::with_capacity(rows.len());

        for row in rows {
            let (Some(ts_text), Some(city)) =
                (row.get(&self.schema.timestamp_field), row.get(&self.schema.city_field))
            else {
                report.missing_key_dropped += 1;
                continue;
            };
            let Some(timestamp) = parse_timestamp(ts_text, &self.schema.timestamp_formats) else {
                log::debug!("cleaner: unparseable timestamp '{ts_text}'");
                report.invalid_timestamp_dropped += 1;
                continue;
            };
            if !seen_keys.insert((timestamp, city.to_string())) {
                report.key_conflicts += 1;
                continue;
            }

            let numeric = numeric_fields
                .iter()
                .map(|f| {
                    let value = read_numeric(row, &f.name, report)?;
                    if f.absolute && value < 0.0 {
                        report.sign_corrected += 1;
                        Some(-value)
                    } else {
                        Some(value)
                    }
                })
                .collect();
            let labels = label_fields
                .iter()
                .map(|f| row.get(&f.name).and_then(|v| f.canonicalize(v)))
                .collect();

            parsed.push(ParsedRow {
                timestamp,
                city: city.to_string(),
                numeric,
                labels,
            });
        }
        parsed
    }

    // ── Step 4 ─────────────────────────────────────────────────────

    fn impute(
        &self,
        rows: Vec<ParsedRow>,
        numeric_fields: &[&NumericField],
        label_fields: &[&LabelField],
        report: &mut CleaningReport,
    ) -> Vec<(Timestamp, String, Vec<f64>, Vec<String>)> {
        let medians: Vec<Option<f64>> = (0..numeric_fields.len())
            .map(|i| {
                let valid: Vec<f64> = rows.iter().filter_map(|r| r.numeric[i]).collect();
                stats::median(&valid)
            })
            .collect();
        let label_fills: Vec<Option<String>> = label_fields
            .iter()
            .enumerate()
            .map(|(i, f)| {
                f.fallback.clone().or_else(|| {
                    stats::mode(rows.iter().filter_map(|r| r.labels[i].as_deref()))
                })
            })
            .collect();

        let mut filled = Vec::with_capacity(rows.len());
        'rows: for row in rows {
            let mut numeric = Vec::with_capacity(row.numeric.len());
            let mut imputed = 0;
            for (i, value) in row.numeric.iter().enumerate() {
                match (value, medians[i]) {
                    (Some(v), _) => numeric.push(*v),
                    (None, Some(m)) => {
                        numeric.push(m);
                        imputed += 1;
                    }
                    (None, None) => {
                        report.unimputable_dropped += 1;
                        continue 'rows;
                    }
                }
            }
            let mut labels = Vec::with_capacity(row.labels.len());
            let mut labels_imputed = 0;
            for (i, label) in row.labels.into_iter().enumerate() {
                match (label, &label_fills[i]) {
                    (Some(l), _) => labels.push(l),
                    (None, Some(fill)) => {
                        labels.push(fill.clone());
                        labels_imputed += 1;
                    }
                    (None, None) => {
                        report.unimputable_dropped += 1;
                        continue 'rows;
                    }
                }
            }
            report.values_imputed += imputed;
            report.labels_imputed += labels_imputed;
            filled.push((row.timestamp, row.city, numeric, labels));
        }
        filled
    }

    // ── Step 5 ─────────────────────────────────────────────────────

    fn correct_outliers(
        &self,
        rows: Vec<(Timestamp, String, Vec<f64>, Vec<String>)>,
        numeric_fields: &[&NumericField],
        report: &mut CleaningReport,
    ) -> Vec<(Timestamp, String, Vec<f64>, Vec<String>)> {
        let in_range = |i: usize, v: f64| v.clamp(numeric_fields[i].min, numeric_fields[i].max);

        // Fences are computed on the range-clamped column.
        let fences: Vec<(f64, f64)> = numeric_fields
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let column: Vec<f64> = rows.iter().map(|r| in_range(i, r.2[i])).collect();
                let bounds = stats::iqr_bounds(&column, self.config.iqr_k)
                    .unwrap_or((f64::NEG_INFINITY, f64::INFINITY));
                log::debug!(
                    "cleaner: {} plausible [{}, {}], fences [{:.3}, {:.3}]",
                    f.name,
                    f.min,
                    f.max,
                    bounds.0,
                    bounds.1
                );
                bounds
            })
            .collect();

        let mut kept = Vec::with_capacity(rows.len());
        for (timestamp, city, mut numeric, labels) in rows {
            match self.config.outlier_policy {
                OutlierPolicy::Clip => {
                    for (i, value) in numeric.iter_mut().enumerate() {
                        let (lo, hi) = fences[i];
                        let corrected = in_range(i, *value).clamp(lo, hi);
                        if corrected != *value {
                            report.values_clipped += 1;
                            *value = corrected;
                        }
                    }
                }
                OutlierPolicy::Drop => {
                    let outside = numeric.iter().enumerate().any(|(i, v)| {
                        let (lo, hi) = fences[i];
                        in_range(i, *v) != *v || *v < lo || *v > hi
                    });
                    if outside {
                        report.outlier_dropped += 1;
                        continue;
                    }
                }
            }
            kept.push((timestamp, city, numeric, labels));
        }
        kept
    }
}

/// Parse one numeric field. Plain numbers pass straight through;
/// anything else goes through coercion and is counted.
fn read_numeric(row: &RawRecord, name: &str, report: &mut CleaningReport) -> Option<f64> {
    let text = row.get(name)?;
    if let Ok(v) = text.parse::<f64>() {
        return v.is_finite().then_some(v);
    }
    let coerced = coerce_numeric(text);
    if coerced.is_some() {
        report.values_coerced += 1;
    }
    coerced
}
