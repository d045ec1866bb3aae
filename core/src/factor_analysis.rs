//! Factor analyzer: latent structure behind weather and traffic variables.
//!
//! Pipeline over the merged table:
//!   1. Build the n × p matrix of analysis variables, standardize columns.
//!   2. Correlation matrix R, eigen-decomposed (descending eigenvalues).
//!   3. Choose k: fixed, or Kaiser (eigenvalues > 1).
//!   4. Extract k factors:
//!        - principal axis: communalities start at the squared multiple
//!          correlations and are iterated on the reduced matrix
//!        - principal component: loadings straight from R
//!   5. Optional Kaiser-normalized varimax rotation.
//!   6. Communalities, per-factor variance shares, interpretation report.
//!
//! Sign convention: every factor's largest-magnitude loading is positive.
//!
//! RULE: The analyzer draws no randomness. Its RNG slot exists only so
//! the engine treats every analytical stage the same way.

use crate::{
    config::{ExtractionMethod, FactorConfig, FactorCount, Rotation},
    error::{PipelineError, PipelineResult},
    record::{MergedRecord, ANALYSIS_VARIABLES, WEATHER_VARIABLE_COUNT},
    rng::{StageRng, StageSlot},
    stage::AnalyticalStage,
};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

const STAGE: &str = "factor_analysis";

/// Below this the correlation matrix is treated as singular.
pub const SINGULAR_EIGENVALUE: f64 = 1e-10;

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    /// 1-based, in extraction order.
    pub index: usize,
    /// One loading per variable, in `FactorModel::variables` order.
    pub loadings: Vec<f64>,
    pub ss_loadings: f64,
    pub variance_share: f64,
    pub cumulative_variance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorModel {
    pub variables: Vec<String>,
    pub observations: usize,
    pub method: ExtractionMethod,
    pub rotation: Rotation,
    pub correlation: Vec<Vec<f64>>,
    /// All p eigenvalues of the correlation matrix, descending.
    pub eigenvalues: Vec<f64>,
    /// p × k, before rotation (columns mutually orthogonal).
    pub unrotated_loadings: Vec<Vec<f64>>,
    pub factors: Vec<Factor>,
    pub communalities: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
}

impl FactorModel {
    pub fn factor_count(&self) -> usize {
        self.factors.len()
    }

    /// Final (rotated when rotation is on) loading of `variable` on factor `index` (1-based).
    pub fn loading(&self, variable: &str, index: usize) -> Option<f64> {
        let v = self.variables.iter().position(|name| name == variable)?;
        let factor = self.factors.get(index.checked_sub(1)?)?;
        factor.loadings.get(v).copied()
    }

    pub fn total_variance_explained(&self) -> f64 {
        self.factors.last().map(|f| f.cumulative_variance).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorTheme {
    WeatherSeverity,
    TrafficFlow,
    AccidentRisk,
    Mixed,
    Diffuse,
}

impl FactorTheme {
    pub fn label(&self) -> &'static str {
        match self {
            FactorTheme::WeatherSeverity => "weather severity",
            FactorTheme::TrafficFlow => "traffic flow",
            FactorTheme::AccidentRisk => "accident risk",
            FactorTheme::Mixed => "mixed weather/traffic stress",
            FactorTheme::Diffuse => "weak/diffuse",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorInterpretation {
    pub index: usize,
    pub theme: FactorTheme,
    /// (variable, loading), strongest first.
    pub salient: Vec<(String, f64)>,
    pub variance_share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpretationReport {
    pub salient_loading: f64,
    pub factors: Vec<FactorInterpretation>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct FactorAnalysisOutput {
    pub model: FactorModel,
    pub report: InterpretationReport,
}

// ── Stage ────────────────────────────────────────────────────────────────────

pub struct FactorAnalyzer {
    config: FactorConfig,
}

impl FactorAnalyzer {
    pub fn new(config: FactorConfig) -> Self {
        Self { config }
    }

    /// Fit a model over an arbitrary numeric matrix (rows = observations).
    pub fn fit(&self, variables: &[&str], data: &DMatrix<f64>) -> PipelineResult<FactorModel> {
        let (n, p) = data.shape();
        let fail = |reason: String| Err(PipelineError::precondition(STAGE, reason));
        if p < 2 {
            return fail(format!("need at least 2 variables, got {p}"));
        }
        if n < p {
            return fail(format!("need at least {p} rows for {p} variables, got {n}"));
        }

        let correlation = correlation_matrix(variables, data)?;
        let eigen = sorted_eigen(&correlation);
        let min_eigen = eigen.values.iter().copied().fold(f64::INFINITY, f64::min);
        if min_eigen < SINGULAR_EIGENVALUE {
            return fail(format!(
                "correlation matrix is singular (smallest eigenvalue {min_eigen:.3e})"
            ));
        }

        let k = match self.config.factor_count {
            FactorCount::Fixed { k } => {
                if k < 1 || k > p {
                    return fail(format!("factor count must be in 1..={p}, got {k}"));
                }
                k
            }
            FactorCount::Kaiser => eigen.values.iter().filter(|&&v| v > 1.0).count().max(1),
        };

        let (mut unrotated, iterations, converged) = match self.config.method {
            ExtractionMethod::PrincipalComponent => (loadings_from(&eigen, k), 0, true),
            ExtractionMethod::PrincipalAxis => self.principal_axis(&correlation, k)?,
        };
        apply_sign_convention(&mut unrotated);

        let mut rotated = match self.config.rotation {
            Rotation::Varimax => varimax(&unrotated, self.config.max_iterations, self.config.tolerance),
            Rotation::None => unrotated.clone(),
        };
        apply_sign_convention(&mut rotated);
        rotated.apply(|x| *x = x.clamp(-1.0, 1.0));
        unrotated.apply(|x| *x = x.clamp(-1.0, 1.0));

        let communalities: Vec<f64> = (0..p)
            .map(|i| rotated.row(i).iter().map(|l| l * l).sum())
            .collect();

        let mut cumulative = 0.0;
        let factors = (0..k)
            .map(|j| {
                let col = rotated.column(j);
                let ss: f64 = col.iter().map(|l| l * l).sum();
                let share = ss / p as f64;
                cumulative += share;
                Factor {
                    index: j + 1,
                    loadings: col.iter().copied().collect(),
                    ss_loadings: ss,
                    variance_share: share,
                    cumulative_variance: cumulative,
                }
            })
            .collect();

        Ok(FactorModel {
            variables: variables.iter().map(|v| v.to_string()).collect(),
            observations: n,
            method: self.config.method,
            rotation: self.config.rotation,
            correlation: to_rows(&correlation),
            eigenvalues: eigen.values.iter().copied().collect(),
            unrotated_loadings: to_rows(&unrotated),
            factors,
            communalities,
            iterations,
            converged,
        })
    }

    /// Iterated principal axis factoring, starting from squared multiple correlations.
    fn principal_axis(&self, r: &DMatrix<f64>, k: usize) -> PipelineResult<(DMatrix<f64>, usize, bool)> {
        let p = r.nrows();
        let inverse = r.clone().try_inverse().ok_or_else(|| {
            PipelineError::precondition(STAGE, "correlation matrix cannot be inverted")
        })?;
        let mut h2: Vec<f64> = (0..p)
            .map(|i| (1.0 - 1.0 / inverse[(i, i)]).clamp(0.0, 1.0))
            .collect();

        let mut loadings = DMatrix::zeros(p, k);
        for iteration in 1..=self.config.max_iterations.max(1) {
            let mut reduced = r.clone();
            for (i, h) in h2.iter().enumerate() {
                reduced[(i, i)] = *h;
            }
            loadings = loadings_from(&sorted_eigen(&reduced), k);
            let next: Vec<f64> = (0..p)
                .map(|i| loadings.row(i).iter().map(|l| l * l).sum::<f64>().min(1.0))
                .collect();
            let delta = h2
                .iter()
                .zip(&next)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            h2 = next;
            if delta < self.config.tolerance {
                log::debug!("factor_analysis: principal axis converged after {iteration} iterations");
                return Ok((loadings, iteration, true));
            }
        }
        log::warn!(
            "factor_analysis: principal axis did not converge in {} iterations",
            self.config.max_iterations
        );
        Ok((loadings, self.config.max_iterations, false))
    }

    /// Name each factor by which variable families load on it.
    pub fn interpret(&self, model: &FactorModel) -> InterpretationReport {
        let threshold = self.config.salient_loading;
        let factors: Vec<FactorInterpretation> = model
            .factors
            .iter()
            .map(|f| {
                let mut salient: Vec<(usize, f64)> = f
                    .loadings
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| l.abs() >= threshold)
                    .map(|(i, l)| (i, *l))
                    .collect();
                salient.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()).then(a.0.cmp(&b.0)));
                FactorInterpretation {
                    index: f.index,
                    theme: theme_for(&model.variables, &salient),
                    salient: salient
                        .iter()
                        .map(|(i, l)| (model.variables[*i].clone(), *l))
                        .collect(),
                    variance_share: f.variance_share,
                }
            })
            .collect();

        let text = render_report(model, &factors, threshold);
        InterpretationReport {
            salient_loading: threshold,
            factors,
            text,
        }
    }
}

impl AnalyticalStage for FactorAnalyzer {
    type Output = FactorAnalysisOutput;

    fn name(&self) -> &'static str {
        STAGE
    }

    fn slot(&self) -> StageSlot {
        StageSlot::FactorAnalysis
    }

    fn run(&self, merged: &[MergedRecord], _rng: &mut StageRng) -> PipelineResult<FactorAnalysisOutput> {
        let p = ANALYSIS_VARIABLES.len();
        let data = DMatrix::from_row_iterator(
            merged.len(),
            p,
            merged.iter().flat_map(|r| r.analysis_vector()),
        );
        let model = self.fit(ANALYSIS_VARIABLES, &data)?;
        let report = self.interpret(&model);
        log::info!(
            "factor_analysis: {} factors over {} rows explain {:.1}% of variance",
            model.factor_count(),
            model.observations,
            model.total_variance_explained() * 100.0
        );
        Ok(FactorAnalysisOutput { model, report })
    }

    fn output_rows(output: &FactorAnalysisOutput) -> usize {
        output.model.factor_count()
    }
}

// ── Linear algebra helpers ───────────────────────────────────────────────────

struct SortedEigen {
    values: DVector<f64>,
    vectors: DMatrix<f64>,
}

/// Symmetric eigen-decomposition with eigenpairs ordered by descending eigenvalue.
fn sorted_eigen(m: &DMatrix<f64>) -> SortedEigen {
    let eigen = SymmetricEigen::new(m.clone());
    let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    let values = DVector::from_iterator(order.len(), order.iter().map(|&i| eigen.eigenvalues[i]));
    let vectors = DMatrix::from_fn(m.nrows(), order.len(), |r, c| eigen.eigenvectors[(r, order[c])]);
    SortedEigen { values, vectors }
}

/// Loadings for the top k eigenpairs: eigenvector × √eigenvalue.
fn loadings_from(eigen: &SortedEigen, k: usize) -> DMatrix<f64> {
    let p = eigen.vectors.nrows();
    DMatrix::from_fn(p, k, |i, j| eigen.vectors[(i, j)] * eigen.values[j].max(0.0).sqrt())
}

fn correlation_matrix(variables: &[&str], data: &DMatrix<f64>) -> PipelineResult<DMatrix<f64>> {
    let (n, p) = data.shape();
    let mut z = data.clone();
    for j in 0..p {
        let col = data.column(j);
        let mean = col.sum() / n as f64;
        let var = col.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        let sd = var.sqrt();
        if !(sd.is_finite() && sd > 0.0) {
            let name = variables.get(j).copied().unwrap_or("?");
            return Err(PipelineError::precondition(
                STAGE,
                format!("correlation matrix is singular: `{name}` has zero variance"),
            ));
        }
        for i in 0..n {
            z[(i, j)] = (data[(i, j)] - mean) / sd;
        }
    }
    let mut r = z.transpose() * &z / (n - 1) as f64;
    for i in 0..p {
        r[(i, i)] = 1.0;
        for j in (i + 1)..p {
            let v = 0.5 * (r[(i, j)] + r[(j, i)]);
            r[(i, j)] = v;
            r[(j, i)] = v;
        }
    }
    Ok(r)
}

/// Flip each column so its largest-magnitude entry is positive.
fn apply_sign_convention(loadings: &mut DMatrix<f64>) {
    for j in 0..loadings.ncols() {
        let mut col = loadings.column_mut(j);
        let pivot = col.iter().copied().fold(0.0_f64, |best, x| if x.abs() > best.abs() { x } else { best });
        if pivot < 0.0 {
            col.neg_mut();
        }
    }
}

/// Kaiser-normalized varimax rotation.
pub fn varimax(loadings: &DMatrix<f64>, max_iterations: usize, tolerance: f64) -> DMatrix<f64> {
    let (p, k) = loadings.shape();
    if k < 2 {
        return loadings.clone();
    }

    let norms: Vec<f64> = (0..p).map(|i| loadings.row(i).norm()).collect();
    let mut normalized = loadings.clone();
    for (i, h) in norms.iter().enumerate() {
        if *h > 0.0 {
            for j in 0..k {
                normalized[(i, j)] /= h;
            }
        }
    }

    let mut rotation = DMatrix::<f64>::identity(k, k);
    let mut criterion = 0.0;
    for _ in 0..max_iterations.max(1) {
        let current = &normalized * &rotation;
        let column_ss: Vec<f64> = (0..k)
            .map(|j| current.column(j).iter().map(|x| x * x).sum())
            .collect();
        let target = DMatrix::from_fn(p, k, |i, j| {
            let l = current[(i, j)];
            l.powi(3) - l * column_ss[j] / p as f64
        });
        let svd = (normalized.transpose() * target).svd(true, true);
        let next = svd.singular_values.sum();
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            break;
        };
        rotation = u * v_t;
        if criterion > 0.0 && next < criterion * (1.0 + tolerance) {
            break;
        }
        criterion = next;
    }

    let mut rotated = &normalized * &rotation;
    for (i, h) in norms.iter().enumerate() {
        for j in 0..k {
            rotated[(i, j)] *= h;
        }
    }
    rotated
}

fn to_rows(m: &DMatrix<f64>) -> Vec<Vec<f64>> {
    (0..m.nrows()).map(|i| m.row(i).iter().copied().collect()).collect()
}

// ── Interpretation ───────────────────────────────────────────────────────────

fn theme_for(variables: &[String], salient: &[(usize, f64)]) -> FactorTheme {
    let Some(&(top, _)) = salient.first() else {
        return FactorTheme::Diffuse;
    };
    if variables[top] == "accident_count" {
        return FactorTheme::AccidentRisk;
    }
    let weather = salient.iter().filter(|(i, _)| *i < WEATHER_VARIABLE_COUNT).count();
    let traffic = salient.len() - weather;
    match (weather, traffic) {
        (_, 0) => FactorTheme::WeatherSeverity,
        (0, _) => FactorTheme::TrafficFlow,
        _ => FactorTheme::Mixed,
    }
}

fn render_report(model: &FactorModel, factors: &[FactorInterpretation], threshold: f64) -> String {
    let mut out = String::new();
    let method = match model.method {
        ExtractionMethod::PrincipalAxis => "principal axis",
        ExtractionMethod::PrincipalComponent => "principal component",
    };
    let rotation = match model.rotation {
        Rotation::Varimax => "varimax",
        Rotation::None => "none",
    };
    let _ = writeln!(out, "Factor Analysis Report");
    let _ = writeln!(out, "======================");
    let _ = writeln!(out, "Observations: {}", model.observations);
    let _ = writeln!(out, "Variables:    {}", model.variables.join(", "));
    let _ = writeln!(out, "Extraction:   {method}");
    let _ = writeln!(out, "Rotation:     {rotation}");
    let _ = writeln!(
        out,
        "Factors:      {} (cumulative variance {:.1}%)",
        model.factor_count(),
        model.total_variance_explained() * 100.0
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "Eigenvalues:");
    for (i, v) in model.eigenvalues.iter().enumerate() {
        let _ = writeln!(out, "  {:>2}: {v:.4}", i + 1);
    }

    for f in factors {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Factor {}: {} ({:.1}% of variance)",
            f.index,
            f.theme.label(),
            f.variance_share * 100.0
        );
        if f.salient.is_empty() {
            let _ = writeln!(out, "  no loading reaches {threshold:.2}");
        }
        for (name, loading) in &f.salient {
            let _ = writeln!(out, "  {name:<24} {loading:+.3}");
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Communalities:");
    for (name, h2) in model.variables.iter().zip(&model.communalities) {
        let _ = writeln!(out, "  {name:<24} {h2:.3}");
    }
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "A variable is salient for a factor when |loading| >= {threshold:.2}."
    );
    out
}
