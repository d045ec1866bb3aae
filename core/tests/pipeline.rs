//! End-to-end engine runs: stage order, failure propagation, persistence.

use roadrisk_core::{
    config::PipelineConfig,
    engine::PipelineEngine,
    error::PipelineError,
    event::PipelineEvent,
    record::{RawDataset, RawRecord},
    rng::StageRng,
    store::PipelineStore,
    types::SourceKind,
};

const HOURS: u32 = 72;
const CITIES: [&str; 2] = ["London", "Leeds"];

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Hourly readings for two cities. Weather severity drives rain, wind and
/// visibility; a separate flow driver sets vehicles, speed and congestion.
fn raw_sources(seed: u64, constant_accidents: bool) -> (RawDataset, RawDataset) {
    let mut g = StageRng::new(seed, 7);
    let mut weather = Vec::new();
    let mut traffic = Vec::new();
    for city in CITIES {
        for h in 0..HOURS {
            let ts = format!("2024-02-{:02} {:02}:00", 1 + h / 24, h % 24);
            let severity = g.normal(0.0, 1.0);
            let flow = g.normal(0.0, 1.0);
            let exposure = g.normal(0.0, 1.0);
            let visibility = (6000.0 - 2200.0 * severity + g.normal(0.0, 400.0)).clamp(100.0, 10_000.0);

            weather.push(RawRecord::from_pairs([
                ("date_time", ts.clone()),
                ("city", city.to_string()),
                ("temperature_c", format!("{:.1}", 6.0 - 3.0 * severity + g.normal(0.0, 1.0))),
                ("humidity", format!("{:.1}", (75.0 + 8.0 * exposure).clamp(0.0, 100.0))),
                ("rain_mm", format!("{:.2}", (3.0 + 2.5 * severity + g.normal(0.0, 0.8)).max(0.0))),
                ("wind_speed_kmh", format!("{:.1}", (25.0 + 9.0 * severity + g.normal(0.0, 3.0)).max(0.0))),
                ("visibility_m", format!("{visibility:.0}")),
                ("air_pressure_hpa", format!("{:.1}", 1010.0 + g.normal(0.0, 5.0))),
                ("season", "Winter".to_string()),
                ("weather_condition", if severity > 0.5 { "Rain" } else { "Cloudy" }.to_string()),
            ]));

            let congestion = if flow > 0.5 {
                "High"
            } else if flow > -0.5 {
                "Medium"
            } else {
                "Low"
            };
            let accidents = if constant_accidents {
                0.0
            } else {
                (1.0 + exposure + 0.5 * severity).round().max(0.0)
            };
            traffic.push(RawRecord::from_pairs([
                ("date_time", ts),
                ("city", city.to_string()),
                ("vehicle_count", format!("{:.0}", (1500.0 + 350.0 * flow).max(0.0))),
                ("avg_speed_kmh", format!("{:.1}", (45.0 - 9.0 * flow + g.normal(0.0, 3.0)).max(1.0))),
                ("accident_count", format!("{accidents}")),
                ("visibility_m", format!("{visibility:.0}")),
                ("area", "Centre".to_string()),
                ("congestion_level", congestion.to_string()),
                ("road_condition", "Wet".to_string()),
            ]));
        }
    }
    (raw(SourceKind::Weather, weather), raw(SourceKind::Traffic, traffic))
}

fn raw(source: SourceKind, rows: Vec<RawRecord>) -> RawDataset {
    let schema = match source {
        SourceKind::Weather => roadrisk_core::schema::SourceSchema::weather(),
        SourceKind::Traffic => roadrisk_core::schema::SourceSchema::traffic(),
    };
    RawDataset::new(source, schema.field_names(), rows)
}

fn build_engine(run_id: &str, config: PipelineConfig) -> PipelineEngine {
    init_logging();
    let store = PipelineStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    store.insert_run(run_id, config.seed, "0.1.0-test").expect("insert run");
    PipelineEngine::new(run_id.to_string(), config, store)
}

fn test_config(trials: usize) -> PipelineConfig {
    let mut config = PipelineConfig::default_test();
    config.simulation.trials = trials;
    config
}

fn stage_events<'a>(events: &'a [PipelineEvent], wanted: &str) -> Vec<&'a PipelineEvent> {
    events
        .iter()
        .filter(|e| match e {
            PipelineEvent::StageStarted { stage }
            | PipelineEvent::StageCompleted { stage, .. }
            | PipelineEvent::StageFailed { stage, .. }
            | PipelineEvent::StageSkipped { stage, .. } => stage == wanted,
            _ => false,
        })
        .collect()
}

#[test]
fn full_run_produces_and_persists_every_output() {
    let run_id = "pipe-full";
    let (weather, traffic) = raw_sources(1, false);
    let mut engine = build_engine(run_id, test_config(2_000));

    let outcome = engine.run(&weather, &traffic).expect("run");

    let rows = CITIES.len() * HOURS as usize;
    assert_eq!(outcome.weather.records.len(), rows);
    assert_eq!(outcome.traffic.records.len(), rows);
    assert_eq!(outcome.merge.records.len(), rows);
    assert!(outcome.all_succeeded());

    let store = engine.store();
    assert_eq!(store.clean_weather_count(run_id).unwrap(), rows);
    assert_eq!(store.clean_traffic_count(run_id).unwrap(), rows);
    assert_eq!(store.merged_count(run_id).unwrap(), rows);
    assert_eq!(store.simulation_result_count(run_id).unwrap(), 2_000);
    assert_eq!(store.factor_loadings(run_id).unwrap().len(), 3 * 8);
    assert!(store.stage_report(run_id, "cleaner_weather").unwrap().is_some());
    assert!(store.stage_report(run_id, "merger").unwrap().is_some());

    let events = engine.events();
    assert!(matches!(events.first(), Some(PipelineEvent::RunInitialized { seed: 42, .. })));
    let order: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::StageCompleted { stage, .. } => Some(stage.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        order,
        vec!["cleaner_weather", "cleaner_traffic", "merger", "monte_carlo", "factor_analysis"]
    );
    assert_eq!(store.events_for_run(run_id).unwrap().len(), events.len());
}

#[test]
fn cleaner_failure_stops_the_run_before_the_merge() {
    let run_id = "pipe-schema";
    let (weather, mut traffic) = raw_sources(2, false);
    traffic.columns.retain(|c| c != "congestion_level");
    let mut engine = build_engine(run_id, test_config(100));

    let err = engine.run(&weather, &traffic).err().expect("schema failure");
    assert!(matches!(
        err,
        PipelineError::Schema {
            source_kind: SourceKind::Traffic,
            ..
        }
    ));

    let events = engine.events();
    assert!(stage_events(events, "cleaner_traffic")
        .iter()
        .any(|e| matches!(e, PipelineEvent::StageFailed { .. })));
    let merger = stage_events(events, "merger");
    assert_eq!(merger.len(), 1);
    assert!(matches!(merger[0], PipelineEvent::StageSkipped { .. }));
    assert!(stage_events(events, "monte_carlo").is_empty());
    assert_eq!(engine.store().merged_count(run_id).unwrap(), 0);
}

#[test]
fn factor_failure_does_not_block_the_simulation() {
    let run_id = "pipe-fa-fails";
    let (weather, traffic) = raw_sources(3, true);
    let mut engine = build_engine(run_id, test_config(500));

    let outcome = engine.run(&weather, &traffic).expect("run");

    assert!(outcome.simulation.is_ok());
    assert!(matches!(
        outcome.factor_analysis,
        Err(PipelineError::Precondition { stage: "factor_analysis", .. })
    ));
    assert!(!outcome.all_succeeded());
    assert_eq!(engine.store().simulation_result_count(run_id).unwrap(), 500);
    assert!(engine.store().load_factor_analysis(run_id).unwrap().is_none());
    assert!(stage_events(engine.events(), "factor_analysis")
        .iter()
        .any(|e| matches!(e, PipelineEvent::StageFailed { .. })));
}

#[test]
fn simulation_failure_does_not_block_factor_analysis() {
    let run_id = "pipe-mc-fails";
    let (weather, traffic) = raw_sources(4, false);
    let mut engine = build_engine(run_id, test_config(0));

    let outcome = engine.run(&weather, &traffic).expect("run");

    assert!(outcome.simulation.is_err());
    assert!(outcome.factor_analysis.is_ok());
    assert!(engine.store().load_factor_analysis(run_id).unwrap().is_some());
}

#[test]
fn disjoint_cities_leave_both_analytics_without_input() {
    let run_id = "pipe-disjoint";
    let (weather, traffic) = raw_sources(5, false);
    let mut traffic = traffic;
    for row in &mut traffic.rows {
        row.set("city", "Paris");
    }
    let mut engine = build_engine(run_id, test_config(100));

    let outcome = engine.run(&weather, &traffic).expect("run");

    assert!(outcome.merge.records.is_empty());
    assert_eq!(outcome.merge.report.traffic_unmatched, traffic.rows.len());
    assert!(outcome.simulation.is_err());
    assert!(outcome.factor_analysis.is_err());
    assert!(engine
        .events()
        .iter()
        .any(|e| matches!(e, PipelineEvent::JoinMismatchWarning { .. })));
}
