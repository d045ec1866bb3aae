//! Factor analyzer: extraction, rotation, factor count, degenerate inputs.

use chrono::{Duration, NaiveDate};
use roadrisk_core::{
    config::{ExtractionMethod, FactorConfig, FactorCount, Rotation},
    error::PipelineError,
    factor_analysis::{FactorAnalyzer, FactorTheme},
    record::{MergedRecord, TrafficRecord, WeatherRecord, ANALYSIS_VARIABLES},
    rng::{RngBank, StageRng, StageSlot},
    stage::AnalyticalStage,
};

/// Three latent drivers: weather severity (rain, wind, visibility,
/// temperature), traffic flow (vehicles, speed) and a humidity/accident
/// pair, each observed with independent noise.
fn latent_table(rows: usize, seed: u64) -> Vec<MergedRecord> {
    let mut g = StageRng::new(seed, 99);
    let start = NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    (0..rows)
        .map(|i| {
            let severity = g.normal(0.0, 1.0);
            let flow = g.normal(0.0, 1.0);
            let exposure = g.normal(0.0, 1.0);
            let mut noise = || g.normal(0.0, 0.45);
            let ts = start + Duration::hours(i as i64);
            MergedRecord {
                weather: WeatherRecord {
                    timestamp: ts,
                    city: "Leeds".into(),
                    temperature_c: 8.0 - 3.0 * (severity + noise()),
                    humidity: 70.0 + 8.0 * (exposure + noise()),
                    rain_mm: 4.0 + 2.5 * (severity + noise()),
                    wind_speed_kmh: 25.0 + 9.0 * (severity + noise()),
                    visibility_m: 6000.0 - 1500.0 * (severity + noise()),
                    air_pressure_hpa: 1010.0,
                    season: "Winter".into(),
                    weather_condition: "Rain".into(),
                },
                traffic: TrafficRecord {
                    timestamp: ts,
                    city: "Leeds".into(),
                    vehicle_count: 1500.0 + 300.0 * (flow + noise()),
                    avg_speed_kmh: 45.0 - 8.0 * (flow + noise()),
                    accident_count: 1.0 + 0.6 * (exposure + noise()),
                    visibility_m: 6000.0,
                    area: "Centre".into(),
                    congestion_level: "Medium".into(),
                    road_condition: "Wet".into(),
                },
            }
        })
        .collect()
}

fn rng() -> StageRng {
    RngBank::new(42).for_stage(StageSlot::FactorAnalysis)
}

fn analyzer(config: FactorConfig) -> FactorAnalyzer {
    FactorAnalyzer::new(config)
}

#[test]
fn unrotated_loadings_are_orthogonal() {
    let out = analyzer(FactorConfig::default())
        .run(&latent_table(400, 1), &mut rng())
        .expect("factor analysis");
    let l = &out.model.unrotated_loadings;
    let k = out.model.factor_count();
    assert_eq!(k, 3);

    for a in 0..k {
        for b in (a + 1)..k {
            let dot: f64 = l.iter().map(|row| row[a] * row[b]).sum();
            assert!(dot.abs() < 1e-6, "factors {a} and {b} not orthogonal: {dot}");
        }
    }
}

#[test]
fn loadings_and_communalities_are_bounded() {
    let out = analyzer(FactorConfig::default())
        .run(&latent_table(400, 2), &mut rng())
        .expect("factor analysis");
    let model = &out.model;

    assert_eq!(model.variables.len(), ANALYSIS_VARIABLES.len());
    for f in &model.factors {
        assert!(f.loadings.iter().all(|l| (-1.0..=1.0).contains(l)));
    }
    for h2 in &model.communalities {
        assert!(*h2 >= 0.0 && *h2 <= 1.0 + 1e-9, "communality {h2}");
    }
    let mut previous = 0.0;
    for f in &model.factors {
        assert!(f.cumulative_variance >= previous);
        previous = f.cumulative_variance;
    }
    assert!(model.total_variance_explained() <= 1.0 + 1e-9);
}

#[test]
fn each_factor_points_its_dominant_loading_positive() {
    let out = analyzer(FactorConfig::default())
        .run(&latent_table(300, 3), &mut rng())
        .expect("factor analysis");
    for f in &out.model.factors {
        let dominant = f
            .loadings
            .iter()
            .copied()
            .fold(0.0_f64, |best, x| if x.abs() > best.abs() { x } else { best });
        assert!(dominant > 0.0, "factor {} dominant loading {dominant}", f.index);
    }
}

#[test]
fn varimax_separates_weather_from_traffic() {
    let out = analyzer(FactorConfig::default())
        .run(&latent_table(500, 4), &mut rng())
        .expect("factor analysis");
    let model = &out.model;

    let strongest = |variable: &str| {
        (1..=model.factor_count())
            .max_by(|&a, &b| {
                let la = model.loading(variable, a).unwrap_or(0.0).abs();
                let lb = model.loading(variable, b).unwrap_or(0.0).abs();
                la.total_cmp(&lb)
            })
            .expect("at least one factor")
    };
    assert_eq!(strongest("rain_mm"), strongest("wind_speed_kmh"));
    assert_ne!(strongest("rain_mm"), strongest("vehicle_count"));
    assert_eq!(strongest("vehicle_count"), strongest("avg_speed_kmh"));

    let themes: Vec<FactorTheme> = out.report.factors.iter().map(|f| f.theme).collect();
    assert!(themes.contains(&FactorTheme::WeatherSeverity), "themes {themes:?}");
    assert!(themes.contains(&FactorTheme::TrafficFlow), "themes {themes:?}");
    assert!(out.report.text.contains("Factor 1"));
}

#[test]
fn principal_components_carry_their_eigenvalues() {
    let config = FactorConfig {
        method: ExtractionMethod::PrincipalComponent,
        rotation: Rotation::None,
        ..FactorConfig::default()
    };
    let out = analyzer(config)
        .run(&latent_table(300, 5), &mut rng())
        .expect("factor analysis");
    let model = &out.model;
    for (j, f) in model.factors.iter().enumerate() {
        assert!(
            (f.ss_loadings - model.eigenvalues[j]).abs() < 1e-8,
            "factor {} ss {} vs eigenvalue {}",
            f.index,
            f.ss_loadings,
            model.eigenvalues[j]
        );
    }
    assert!(model.eigenvalues.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn kaiser_rule_keeps_eigenvalues_above_one() {
    let config = FactorConfig {
        factor_count: FactorCount::Kaiser,
        ..FactorConfig::default()
    };
    let out = analyzer(config)
        .run(&latent_table(400, 6), &mut rng())
        .expect("factor analysis");
    let above_one = out.model.eigenvalues.iter().filter(|&&v| v > 1.0).count().max(1);
    assert_eq!(out.model.factor_count(), above_one);
}

#[test]
fn constant_variable_is_singular() {
    let mut table = latent_table(100, 7);
    for m in &mut table {
        m.traffic.accident_count = 2.0;
    }
    let err = analyzer(FactorConfig::default())
        .run(&table, &mut rng())
        .err()
        .expect("zero variance must fail");
    match err {
        PipelineError::Precondition { stage, reason } => {
            assert_eq!(stage, "factor_analysis");
            assert!(reason.contains("accident_count"), "reason: {reason}");
        }
        other => panic!("expected precondition error, got {other:?}"),
    }
}

#[test]
fn collinear_variables_are_singular() {
    let mut table = latent_table(100, 8);
    for m in &mut table {
        m.traffic.vehicle_count = 100.0 * m.weather.rain_mm + 7.0;
    }
    let err = analyzer(FactorConfig::default())
        .run(&table, &mut rng())
        .err()
        .expect("collinear columns must fail");
    assert!(matches!(err, PipelineError::Precondition { stage: "factor_analysis", .. }));
}

#[test]
fn fewer_rows_than_variables_is_rejected() {
    let table = latent_table(ANALYSIS_VARIABLES.len() - 1, 9);
    let err = analyzer(FactorConfig::default())
        .run(&table, &mut rng())
        .err()
        .expect("too few rows must fail");
    assert!(matches!(err, PipelineError::Precondition { stage: "factor_analysis", .. }));
}

#[test]
fn factor_count_above_variable_count_is_rejected() {
    let config = FactorConfig {
        factor_count: FactorCount::Fixed { k: 9 },
        ..FactorConfig::default()
    };
    let err = analyzer(config)
        .run(&latent_table(100, 10), &mut rng())
        .err()
        .expect("k > p must fail");
    assert!(matches!(err, PipelineError::Precondition { .. }));
}
