//! Monte Carlo risk simulator: congestion risk under adverse weather.
//!
//! Each trial draws one weather scenario from the merged table, maps its
//! severity to a congestion risk score on [0, max_score], and rolls
//! whether the scenario ends in a jam or an accident.
//!
//! Sampling pool: rows crossing any severe-weather threshold, or every
//! row when none qualify (or when severe filtering is switched off).
//!
//! Scenario draws:
//!   - RowResample: one pool row per trial supplies all four weather
//!     inputs and the observed congestion base risk.
//!   - IndependentMarginals: each weather input comes from its own pool
//!     row; base risk comes from a least-squares fit of observed base
//!     risk on the weather inputs.
//!
//! RULE: All randomness comes from the stage RNG. Same seed, same
//! input, same trial count → identical results.

use crate::{
    config::{RiskModelConfig, SamplingStrategy, SimulationConfig},
    error::{PipelineError, PipelineResult},
    record::MergedRecord,
    rng::{StageRng, StageSlot},
    stage::AnalyticalStage,
    stats,
};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

const STAGE: &str = "monte_carlo";

// ── Public types ─────────────────────────────────────────────────────────────

/// The four weather inputs a trial is driven by.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherScenario {
    pub rain_mm: f64,
    pub wind_speed_kmh: f64,
    pub visibility_m: f64,
    pub temperature_c: f64,
}

impl WeatherScenario {
    fn from_record(r: &MergedRecord) -> Self {
        Self {
            rain_mm: r.weather.rain_mm,
            wind_speed_kmh: r.weather.wind_speed_kmh,
            visibility_m: r.weather.visibility_m,
            temperature_c: r.weather.temperature_c,
        }
    }

    fn as_row(&self) -> [f64; 5] {
        [
            1.0,
            self.rain_mm,
            self.wind_speed_kmh,
            self.visibility_m,
            self.temperature_c,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub trial: usize,
    /// Index into the merged table when the whole scenario came from one row.
    pub source_row: Option<usize>,
    pub scenario: WeatherScenario,
    pub base_risk: f64,
    pub risk_score: f64,
    pub is_traffic_jam: bool,
    pub accident_probability: f64,
    pub is_accident: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileBands {
    pub p5: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub trials: usize,
    pub sampling: SamplingStrategy,
    pub pool_size: usize,
    /// True when no row met the severe-weather thresholds.
    pub pool_fallback: bool,
    pub mean_risk_score: f64,
    pub std_risk_score: f64,
    /// Share of trials ending in a jam: the mean congestion probability.
    pub jam_probability: f64,
    pub accident_probability: f64,
    pub risk_percentiles: PercentileBands,
    pub histogram: Vec<HistogramBin>,
}

#[derive(Debug, Clone)]
pub struct SimulationOutput {
    pub results: Vec<SimulationResult>,
    pub summary: SimulationSummary,
}

// ── Severity model ───────────────────────────────────────────────────────────

/// Observed base risk regressed on the weather inputs (with intercept).
/// Used only for independent sampling, where a drawn scenario has no
/// observed congestion level of its own.
#[derive(Debug, Clone)]
pub struct SeverityModel {
    /// None = mean-only model (too few rows, or a singular design).
    coefficients: Option<DVector<f64>>,
    mean: f64,
    min: f64,
    max: f64,
}

impl SeverityModel {
    pub fn fit(scenarios: &[WeatherScenario], base_risks: &[f64]) -> Self {
        let n = base_risks.len();
        let mean = stats::mean(base_risks).unwrap_or(0.0);
        let min = base_risks.iter().copied().fold(f64::INFINITY, f64::min);
        let max = base_risks.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let coefficients = if n > 5 {
            let x = DMatrix::from_row_iterator(n, 5, scenarios.iter().flat_map(|s| s.as_row()));
            let y = DVector::from_column_slice(base_risks);
            let xt = x.transpose();
            (&xt * &x).cholesky().map(|ch| ch.solve(&(&xt * y)))
        } else {
            None
        };
        if coefficients.is_none() {
            log::debug!("monte_carlo: severity model falls back to mean base risk {mean:.3}");
        }

        Self {
            coefficients,
            mean,
            min,
            max,
        }
    }

    pub fn predict(&self, scenario: &WeatherScenario) -> f64 {
        match &self.coefficients {
            Some(beta) => {
                let row = scenario.as_row();
                let raw: f64 = row.iter().zip(beta.iter()).map(|(x, b)| x * b).sum();
                raw.clamp(self.min, self.max)
            }
            None => self.mean,
        }
    }
}

// ── Stage ────────────────────────────────────────────────────────────────────

pub struct MonteCarloSimulator {
    config: SimulationConfig,
}

impl MonteCarloSimulator {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    fn check_preconditions(&self, merged: &[MergedRecord]) -> PipelineResult<()> {
        let fail = |reason: String| Err(PipelineError::precondition(STAGE, reason));
        let risk = &self.config.risk_model;
        if self.config.trials < 1 {
            return fail(format!("trial count must be >= 1, got {}", self.config.trials));
        }
        if merged.is_empty() {
            return fail("merged dataset is empty; nothing to sample from".into());
        }
        if self.config.histogram_bins < 1 {
            return fail("histogram needs at least one bin".into());
        }
        if !(risk.noise_std.is_finite() && risk.noise_std >= 0.0) {
            return fail(format!("noise_std must be >= 0, got {}", risk.noise_std));
        }
        if !(risk.max_score.is_finite() && risk.max_score > 0.0) {
            return fail(format!("max_score must be > 0, got {}", risk.max_score));
        }
        if !(risk.accident_divisor.is_finite() && risk.accident_divisor > 0.0) {
            return fail(format!("accident_divisor must be > 0, got {}", risk.accident_divisor));
        }
        Ok(())
    }

    /// Indices of the rows trials sample from, and whether the
    /// severe-weather filter had to fall back to every row.
    pub fn sampling_pool(&self, merged: &[MergedRecord]) -> (Vec<usize>, bool) {
        let all: Vec<usize> = (0..merged.len()).collect();
        if !self.config.severe_weather_only {
            return (all, false);
        }
        let th = &self.config.severe_weather;
        let severe: Vec<usize> = merged
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                let w = &r.weather;
                w.rain_mm > th.rain_mm_above
                    || w.wind_speed_kmh > th.wind_speed_kmh_above
                    || w.visibility_m < th.visibility_m_below
                    || w.temperature_c < th.temperature_c_below
            })
            .map(|(i, _)| i)
            .collect();
        if severe.is_empty() {
            log::warn!("monte_carlo: no severe-weather rows, sampling from all {} rows", merged.len());
            (all, true)
        } else {
            (severe, false)
        }
    }

    fn draw_scenario(
        &self,
        merged: &[MergedRecord],
        pool: &[usize],
        model: Option<&SeverityModel>,
        rng: &mut StageRng,
    ) -> (Option<usize>, WeatherScenario, f64) {
        let risk = &self.config.risk_model;
        match (self.config.sampling, model) {
            (SamplingStrategy::IndependentMarginals, Some(model)) => {
                let mut pick = || &merged[pool[rng.index_below(pool.len())]].weather;
                let scenario = WeatherScenario {
                    rain_mm: pick().rain_mm,
                    wind_speed_kmh: pick().wind_speed_kmh,
                    visibility_m: pick().visibility_m,
                    temperature_c: pick().temperature_c,
                };
                let base = model.predict(&scenario);
                (None, scenario, base)
            }
            _ => {
                let idx = pool[rng.index_below(pool.len())];
                let row = &merged[idx];
                let base = base_risk(risk, &row.traffic.congestion_level);
                (Some(idx), WeatherScenario::from_record(row), base)
            }
        }
    }

    fn summarize(&self, results: &[SimulationResult], pool_size: usize, pool_fallback: bool) -> SimulationSummary {
        let n = results.len() as f64;
        let scores: Vec<f64> = results.iter().map(|r| r.risk_score).collect();
        let sorted = stats::sorted_copy(&scores);
        let pct = |q: f64| stats::quantile_sorted(&sorted, q).unwrap_or(0.0);

        let max_score = self.config.risk_model.max_score;
        let bins = self.config.histogram_bins;
        let width = max_score / bins as f64;
        let mut histogram: Vec<HistogramBin> = (0..bins)
            .map(|b| HistogramBin {
                lower: b as f64 * width,
                upper: (b + 1) as f64 * width,
                count: 0,
            })
            .collect();
        for s in &scores {
            let b = ((s / width).floor() as usize).min(bins - 1);
            histogram[b].count += 1;
        }

        SimulationSummary {
            trials: results.len(),
            sampling: self.config.sampling,
            pool_size,
            pool_fallback,
            mean_risk_score: stats::mean(&scores).unwrap_or(0.0),
            std_risk_score: stats::std_dev(&scores),
            jam_probability: results.iter().filter(|r| r.is_traffic_jam).count() as f64 / n,
            accident_probability: results.iter().filter(|r| r.is_accident).count() as f64 / n,
            risk_percentiles: PercentileBands {
                p5: pct(0.05),
                p25: pct(0.25),
                p50: pct(0.50),
                p75: pct(0.75),
                p95: pct(0.95),
            },
            histogram,
        }
    }
}

/// Base risk for an observed congestion level.
pub fn base_risk(risk: &RiskModelConfig, congestion_level: &str) -> f64 {
    risk.congestion_base_risk
        .get(congestion_level)
        .copied()
        .unwrap_or(risk.default_base_risk)
}

/// Deterministic severity → risk mapping, before noise and clamping.
pub fn weather_penalty(risk: &RiskModelConfig, scenario: &WeatherScenario) -> f64 {
    let mut penalty = scenario.rain_mm * risk.rain_weight + scenario.wind_speed_kmh * risk.wind_weight;
    if scenario.visibility_m < risk.low_visibility_m {
        penalty += risk.low_visibility_penalty;
    }
    penalty
}

impl AnalyticalStage for MonteCarloSimulator {
    type Output = SimulationOutput;

    fn name(&self) -> &'static str {
        STAGE
    }

    fn slot(&self) -> StageSlot {
        StageSlot::MonteCarlo
    }

    fn run(&self, merged: &[MergedRecord], rng: &mut StageRng) -> PipelineResult<SimulationOutput> {
        self.check_preconditions(merged)?;
        let risk = &self.config.risk_model;
        let (pool, pool_fallback) = self.sampling_pool(merged);

        let model = match self.config.sampling {
            SamplingStrategy::IndependentMarginals => {
                let scenarios: Vec<WeatherScenario> =
                    pool.iter().map(|&i| WeatherScenario::from_record(&merged[i])).collect();
                let bases: Vec<f64> = pool
                    .iter()
                    .map(|&i| base_risk(risk, &merged[i].traffic.congestion_level))
                    .collect();
                Some(SeverityModel::fit(&scenarios, &bases))
            }
            SamplingStrategy::RowResample => None,
        };

        log::info!(
            "monte_carlo: {} trials, {:?}, pool {} of {} rows",
            self.config.trials,
            self.config.sampling,
            pool.len(),
            merged.len()
        );

        let mut results = Vec::with_capacity(self.config.trials);
        for trial in 0..self.config.trials {
            let (source_row, scenario, base) = self.draw_scenario(merged, &pool, model.as_ref(), rng);
            let noise = rng.normal(0.0, risk.noise_std);
            let risk_score = (base + weather_penalty(risk, &scenario) + noise).clamp(0.0, risk.max_score);
            let accident_probability = (risk_score / risk.accident_divisor).clamp(0.0, 1.0);
            let is_accident = rng.chance(accident_probability);

            results.push(SimulationResult {
                trial,
                source_row,
                scenario,
                base_risk: base,
                risk_score,
                is_traffic_jam: risk_score > risk.jam_threshold,
                accident_probability,
                is_accident,
            });
        }

        let summary = self.summarize(&results, pool.len(), pool_fallback);
        log::info!(
            "monte_carlo: mean risk {:.2}, P(jam) {:.2}%, P(accident) {:.2}%",
            summary.mean_risk_score,
            summary.jam_probability * 100.0,
            summary.accident_probability * 100.0
        );
        Ok(SimulationOutput { results, summary })
    }

    fn output_rows(output: &SimulationOutput) -> usize {
        output.results.len()
    }
}
