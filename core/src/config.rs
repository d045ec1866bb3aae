use crate::schema::SourceSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Cleaning ───────────────────────────────────────────────────────

/// What to do with a value outside its IQR fences or plausible range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierPolicy {
    /// Pull the value to the nearest bound; the row survives.
    Clip,
    /// Discard the whole row.
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    /// Tukey fence multiplier k in [Q1 - k*IQR, Q3 + k*IQR].
    pub iqr_k: f64,
    pub outlier_policy: OutlierPolicy,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            iqr_k: 1.5,
            outlier_policy: OutlierPolicy::Clip,
        }
    }
}

// ── Merge ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Maximum |weather.timestamp - traffic.timestamp|. 0 = exact match.
    pub tolerance_seconds: i64,
}

// ── Monte Carlo ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Draw whole observed rows; keeps cross-variable correlation.
    RowResample,
    /// Draw each weather variable from its own empirical marginal.
    IndependentMarginals,
}

/// A row joins the severe-weather pool when any threshold is crossed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SevereWeatherThresholds {
    pub rain_mm_above: f64,
    pub wind_speed_kmh_above: f64,
    pub visibility_m_below: f64,
    pub temperature_c_below: f64,
}

impl Default for SevereWeatherThresholds {
    fn default() -> Self {
        Self {
            rain_mm_above: 5.0,
            wind_speed_kmh_above: 40.0,
            visibility_m_below: 2_000.0,
            temperature_c_below: 2.0,
        }
    }
}

/// Severity → congestion risk mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskModelConfig {
    /// Base risk per observed congestion level.
    pub congestion_base_risk: BTreeMap<String, f64>,
    /// Base risk for a level missing from the map.
    pub default_base_risk: f64,
    pub rain_weight: f64,
    pub wind_weight: f64,
    pub low_visibility_m: f64,
    pub low_visibility_penalty: f64,
    /// Standard deviation of the per-trial Gaussian noise. 0 disables it.
    pub noise_std: f64,
    pub max_score: f64,
    pub jam_threshold: f64,
    /// accident probability = score / accident_divisor
    pub accident_divisor: f64,
}

impl Default for RiskModelConfig {
    fn default() -> Self {
        let congestion_base_risk = [("Low", 1.0), ("Medium", 3.0), ("High", 5.0)]
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        Self {
            congestion_base_risk,
            default_base_risk: 1.0,
            rain_weight: 0.1,
            wind_weight: 0.05,
            low_visibility_m: 1_000.0,
            low_visibility_penalty: 2.0,
            noise_std: 0.5,
            max_score: 10.0,
            jam_threshold: 6.0,
            accident_divisor: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub trials: usize,
    pub sampling: SamplingStrategy,
    /// Restrict sampling to severe-weather rows (falls back to all rows
    /// when none qualify).
    pub severe_weather_only: bool,
    pub severe_weather: SevereWeatherThresholds,
    pub risk_model: RiskModelConfig,
    pub histogram_bins: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            trials: 10_000,
            sampling: SamplingStrategy::RowResample,
            severe_weather_only: true,
            severe_weather: SevereWeatherThresholds::default(),
            risk_model: RiskModelConfig::default(),
            histogram_bins: 30,
        }
    }
}

// ── Factor analysis ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FactorCount {
    Fixed { k: usize },
    /// Keep every factor whose correlation-matrix eigenvalue exceeds 1.
    Kaiser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    PrincipalAxis,
    PrincipalComponent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    None,
    Varimax,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorConfig {
    pub factor_count: FactorCount,
    pub method: ExtractionMethod,
    pub rotation: Rotation,
    /// |loading| at or above this is reported as salient.
    pub salient_loading: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for FactorConfig {
    fn default() -> Self {
        Self {
            factor_count: FactorCount::Fixed { k: 3 },
            method: ExtractionMethod::PrincipalAxis,
            rotation: Rotation::Varimax,
            salient_loading: 0.5,
            max_iterations: 100,
            tolerance: 1e-6,
        }
    }
}

// ── Top level ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub seed: u64,
    pub weather: SourceSchema,
    pub traffic: SourceSchema,
    pub cleaning: CleaningConfig,
    pub merge: MergeConfig,
    pub simulation: SimulationConfig,
    pub factor: FactorConfig,
}

/// Internal file shape for pipeline.json. Every section is optional.
#[derive(Debug, Clone, Deserialize)]
struct PipelineFile {
    #[serde(default = "default_seed")]
    seed: u64,
    #[serde(default)]
    cleaning: CleaningConfig,
    #[serde(default)]
    merge: MergeConfig,
    #[serde(default)]
    simulation: SimulationConfig,
    #[serde(default)]
    factor: FactorConfig,
}

fn default_seed() -> u64 {
    42
}

impl PipelineConfig {
    /// Load from the data/ directory.
    /// In tests, use PipelineConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/pipeline.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let file: PipelineFile = serde_json::from_str(&content)?;

        let weather_path = format!("{data_dir}/schemas/weather.json");
        let weather_content = std::fs::read_to_string(&weather_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {weather_path}: {e}"))?;
        let weather: SourceSchema = serde_json::from_str(&weather_content)?;

        let traffic_path = format!("{data_dir}/schemas/traffic.json");
        let traffic_content = std::fs::read_to_string(&traffic_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {traffic_path}: {e}"))?;
        let traffic: SourceSchema = serde_json::from_str(&traffic_content)?;

        log::debug!(
            "Loaded pipeline config from {data_dir}: seed={} trials={}",
            file.seed,
            file.simulation.trials
        );

        Ok(Self {
            seed: file.seed,
            weather,
            traffic,
            cleaning: file.cleaning,
            merge: file.merge,
            simulation: file.simulation,
            factor: file.factor,
        })
    }

    /// Config with hardcoded defaults for use in tests.
    pub fn default_test() -> Self {
        Self {
            seed: default_seed(),
            weather: SourceSchema::weather(),
            traffic: SourceSchema::traffic(),
            cleaning: CleaningConfig::default(),
            merge: MergeConfig::default(),
            simulation: SimulationConfig::default(),
            factor: FactorConfig::default(),
        }
    }
}
