//! pipeline-runner: headless runner for the weather/traffic risk pipeline.
//!
//! Usage:
//!   pipeline-runner --weather raw/weather.csv --traffic raw/traffic.csv
//!   pipeline-runner --weather w.csv --traffic t.csv --db run.db --out-dir out --seed 7 --trials 5000

use anyhow::{Context, Result};
use roadrisk_core::{
    config::PipelineConfig,
    engine::{PipelineEngine, PipelineOutcome},
    factor_analysis::FactorAnalysisOutput,
    monte_carlo::SimulationOutput,
    record::{MergedRecord, RawDataset, RawRecord},
    store::PipelineStore,
    types::{SourceKind, CANONICAL_TIMESTAMP_FORMAT},
};
use std::env;
use std::fs;
use std::path::Path;

#[derive(serde::Serialize)]
struct RunSummary<'a> {
    run_id: &'a str,
    seed: u64,
    weather_rows: usize,
    traffic_rows: usize,
    merged_rows: usize,
    unmatched_rows: usize,
    simulation: Option<&'a roadrisk_core::monte_carlo::SimulationSummary>,
    simulation_error: Option<String>,
    factors: Option<usize>,
    factor_analysis_error: Option<String>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let weather_path = string_arg(&args, "--weather", "./data/raw/weather.csv");
    let traffic_path = string_arg(&args, "--traffic", "./data/raw/traffic.csv");
    let db = string_arg(&args, "--db", ":memory:");
    let data_dir = string_arg(&args, "--data-dir", "./data");
    let out_dir = string_arg(&args, "--out-dir", "./output");

    let mut config = PipelineConfig::load(data_dir)?;
    config.seed = parse_arg(&args, "--seed", config.seed);
    config.simulation.trials = parse_arg(&args, "--trials", config.simulation.trials);

    println!("Weather/traffic risk pipeline: pipeline-runner");
    println!("  weather:   {weather_path}");
    println!("  traffic:   {traffic_path}");
    println!("  seed:      {}", config.seed);
    println!("  trials:    {}", config.simulation.trials);
    println!("  db:        {db}");
    println!("  data_dir:  {data_dir}");
    println!("  out_dir:   {out_dir}");
    println!();

    let store = PipelineStore::open(db)?;
    store.migrate()?;

    let run_id = uuid::Uuid::new_v4().to_string();
    store.insert_run(&run_id, config.seed, env!("CARGO_PKG_VERSION"))?;

    let weather_raw = read_raw_csv(Path::new(weather_path), SourceKind::Weather)?;
    let traffic_raw = read_raw_csv(Path::new(traffic_path), SourceKind::Traffic)?;

    let seed = config.seed;
    let mut engine = PipelineEngine::new(run_id.clone(), config, store);
    let outcome = engine.run(&weather_raw, &traffic_raw)?;

    let out = Path::new(out_dir);
    fs::create_dir_all(out).with_context(|| format!("Cannot create {}", out.display()))?;
    write_merged_csv(&out.join("merged_analytical_data.csv"), &outcome.merge.records)?;
    if let Ok(sim) = &outcome.simulation {
        write_simulation_csv(&out.join("simulation_results.csv"), sim)?;
    }
    if let Ok(fa) = &outcome.factor_analysis {
        write_loadings_csv(&out.join("factor_analysis_loadings.csv"), fa)?;
        fs::write(out.join("factor_analysis_report.txt"), &fa.report.text)?;
    }

    let summary = RunSummary {
        run_id: &run_id,
        seed,
        weather_rows: outcome.weather.records.len(),
        traffic_rows: outcome.traffic.records.len(),
        merged_rows: outcome.merge.records.len(),
        unmatched_rows: outcome.merge.report.unmatched_total(),
        simulation: outcome.simulation.as_ref().ok().map(|s| &s.summary),
        simulation_error: outcome.simulation.as_ref().err().map(|e| e.to_string()),
        factors: outcome.factor_analysis.as_ref().ok().map(|f| f.model.factor_count()),
        factor_analysis_error: outcome.factor_analysis.as_ref().err().map(|e| e.to_string()),
    };
    fs::write(out.join("run_summary.json"), serde_json::to_string_pretty(&summary)?)?;

    print_summary(&outcome, &run_id);

    if !outcome.all_succeeded() {
        anyhow::bail!("one or more analytical stages failed; see the log for details");
    }
    Ok(())
}

fn read_raw_csv(path: &Path, source: SourceKind) -> Result<RawDataset> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Cannot open {source} CSV '{}'", path.display()))?;

    let headers = reader
        .headers()
        .with_context(|| format!("Cannot read headers of '{}'", path.display()))?
        .clone();
    let columns: Vec<String> = headers.iter().map(str::to_string).collect();

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Bad CSV row {} in '{}'", i + 2, path.display()))?;
        rows.push(RawRecord::from_pairs(headers.iter().zip(record.iter())));
    }
    log::info!("read {} {source} rows from {}", rows.len(), path.display());
    Ok(RawDataset::new(source, columns, rows))
}

fn write_merged_csv(path: &Path, records: &[MergedRecord]) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    w.write_record([
        "date_time",
        "city",
        "weather_date_time",
        "temperature_c",
        "humidity",
        "rain_mm",
        "wind_speed_kmh",
        "visibility_m",
        "air_pressure_hpa",
        "season",
        "weather_condition",
        "vehicle_count",
        "avg_speed_kmh",
        "accident_count",
        "traffic_visibility_m",
        "area",
        "congestion_level",
        "road_condition",
    ])?;
    for m in records {
        let (wx, tr) = (&m.weather, &m.traffic);
        w.write_record([
            tr.timestamp.format(CANONICAL_TIMESTAMP_FORMAT).to_string(),
            m.city().to_string(),
            wx.timestamp.format(CANONICAL_TIMESTAMP_FORMAT).to_string(),
            wx.temperature_c.to_string(),
            wx.humidity.to_string(),
            wx.rain_mm.to_string(),
            wx.wind_speed_kmh.to_string(),
            wx.visibility_m.to_string(),
            wx.air_pressure_hpa.to_string(),
            wx.season.clone(),
            wx.weather_condition.clone(),
            tr.vehicle_count.to_string(),
            tr.avg_speed_kmh.to_string(),
            tr.accident_count.to_string(),
            tr.visibility_m.to_string(),
            tr.area.clone(),
            tr.congestion_level.clone(),
            tr.road_condition.clone(),
        ])?;
    }
    w.flush()?;
    Ok(())
}

fn write_simulation_csv(path: &Path, sim: &SimulationOutput) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    w.write_record([
        "trial",
        "source_row",
        "rain_mm",
        "wind_speed_kmh",
        "visibility_m",
        "temperature_c",
        "base_risk",
        "risk_score",
        "is_traffic_jam",
        "accident_probability",
        "is_accident",
    ])?;
    for r in &sim.results {
        w.write_record([
            r.trial.to_string(),
            r.source_row.map(|i| i.to_string()).unwrap_or_default(),
            r.scenario.rain_mm.to_string(),
            r.scenario.wind_speed_kmh.to_string(),
            r.scenario.visibility_m.to_string(),
            r.scenario.temperature_c.to_string(),
            r.base_risk.to_string(),
            format!("{:.4}", r.risk_score),
            r.is_traffic_jam.to_string(),
            format!("{:.4}", r.accident_probability),
            r.is_accident.to_string(),
        ])?;
    }
    w.flush()?;
    Ok(())
}

fn write_loadings_csv(path: &Path, fa: &FactorAnalysisOutput) -> Result<()> {
    let model = &fa.model;
    let mut w = csv::Writer::from_path(path)?;
    let mut header = vec!["variable".to_string()];
    header.extend(model.factors.iter().map(|f| format!("factor_{}", f.index)));
    header.push("communality".into());
    w.write_record(&header)?;
    for (i, variable) in model.variables.iter().enumerate() {
        let mut row = vec![variable.clone()];
        row.extend(model.factors.iter().map(|f| format!("{:.4}", f.loadings[i])));
        row.push(format!("{:.4}", model.communalities[i]));
        w.write_record(&row)?;
    }
    w.flush()?;
    Ok(())
}

fn print_summary(outcome: &PipelineOutcome, run_id: &str) {
    println!("=== RUN SUMMARY ===");
    println!("  run_id:          {run_id}");
    for report in [&outcome.weather.report, &outcome.traffic.report] {
        println!(
            "  {:<8} rows:   {} in, {} out ({} duplicates, {} clipped)",
            report.source.name(),
            report.input_rows,
            report.output_rows,
            report.duplicates_removed,
            report.values_clipped
        );
    }
    let merge = &outcome.merge.report;
    println!(
        "  merged rows:     {} (unmatched weather {}, traffic {})",
        merge.merged_rows, merge.weather_unmatched, merge.traffic_unmatched
    );

    println!();
    println!("=== MONTE CARLO ===");
    match &outcome.simulation {
        Ok(sim) => {
            let s = &sim.summary;
            println!("  trials:          {} (pool {} rows)", s.trials, s.pool_size);
            println!("  mean risk:       {:.2} ± {:.2}", s.mean_risk_score, s.std_risk_score);
            println!("  P(traffic jam):  {:.2}%", s.jam_probability * 100.0);
            println!("  P(accident):     {:.2}%", s.accident_probability * 100.0);
            println!(
                "  risk p5/p50/p95: {:.2} / {:.2} / {:.2}",
                s.risk_percentiles.p5, s.risk_percentiles.p50, s.risk_percentiles.p95
            );
        }
        Err(e) => println!("  FAILED: {e}"),
    }

    println!();
    println!("=== FACTOR ANALYSIS ===");
    match &outcome.factor_analysis {
        Ok(fa) => {
            for f in &fa.report.factors {
                println!(
                    "  factor {}: {} ({:.1}% of variance)",
                    f.index,
                    f.theme.label(),
                    f.variance_share * 100.0
                );
            }
        }
        Err(e) => println!("  FAILED: {e}"),
    }
}

fn string_arg<'a>(args: &'a [String], flag: &str, default: &'a str) -> &'a str {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
        .unwrap_or(default)
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
