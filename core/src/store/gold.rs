//! Merged table and analytical output queries.

use super::{format_timestamp, read_timestamp, PipelineStore};
use crate::{
    error::PipelineResult,
    factor_analysis::{FactorAnalysisOutput, FactorModel, InterpretationReport},
    monte_carlo::{SimulationOutput, SimulationResult, SimulationSummary, WeatherScenario},
    record::{MergedRecord, TrafficRecord, WeatherRecord},
};
use rusqlite::{params, OptionalExtension};

impl PipelineStore {
    // ── Merged ─────────────────────────────────────────────────

    pub fn save_merged(&self, run_id: &str, records: &[MergedRecord]) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO merged_record (
                    run_id, row_idx, city, weather_timestamp, traffic_timestamp,
                    temperature_c, humidity, rain_mm, wind_speed_kmh, weather_visibility_m,
                    air_pressure_hpa, season, weather_condition,
                    vehicle_count, avg_speed_kmh, accident_count, traffic_visibility_m,
                    area, congestion_level, road_condition
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                          ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            )?;
            for (i, m) in records.iter().enumerate() {
                let (w, t) = (&m.weather, &m.traffic);
                stmt.execute(params![
                    run_id,
                    i as i64,
                    m.city(),
                    format_timestamp(&w.timestamp),
                    format_timestamp(&t.timestamp),
                    w.temperature_c,
                    w.humidity,
                    w.rain_mm,
                    w.wind_speed_kmh,
                    w.visibility_m,
                    w.air_pressure_hpa,
                    &w.season,
                    &w.weather_condition,
                    t.vehicle_count,
                    t.avg_speed_kmh,
                    t.accident_count,
                    t.visibility_m,
                    &t.area,
                    &t.congestion_level,
                    &t.road_condition,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Both halves of a merged row share the stored city.
    pub fn load_merged(&self, run_id: &str) -> PipelineResult<Vec<MergedRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT city, weather_timestamp, traffic_timestamp,
                    temperature_c, humidity, rain_mm, wind_speed_kmh, weather_visibility_m,
                    air_pressure_hpa, season, weather_condition,
                    vehicle_count, avg_speed_kmh, accident_count, traffic_visibility_m,
                    area, congestion_level, road_condition
             FROM merged_record WHERE run_id = ?1
             ORDER BY row_idx",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let city: String = row.get(0)?;
            Ok(MergedRecord {
                weather: WeatherRecord {
                    timestamp: read_timestamp(row, 1)?,
                    city: city.clone(),
                    temperature_c: row.get(3)?,
                    humidity: row.get(4)?,
                    rain_mm: row.get(5)?,
                    wind_speed_kmh: row.get(6)?,
                    visibility_m: row.get(7)?,
                    air_pressure_hpa: row.get(8)?,
                    season: row.get(9)?,
                    weather_condition: row.get(10)?,
                },
                traffic: TrafficRecord {
                    timestamp: read_timestamp(row, 2)?,
                    city,
                    vehicle_count: row.get(11)?,
                    avg_speed_kmh: row.get(12)?,
                    accident_count: row.get(13)?,
                    visibility_m: row.get(14)?,
                    area: row.get(15)?,
                    congestion_level: row.get(16)?,
                    road_condition: row.get(17)?,
                },
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn merged_count(&self, run_id: &str) -> PipelineResult<usize> {
        self.count_rows("merged_record", run_id)
    }

    // ── Monte Carlo ────────────────────────────────────────────

    pub fn save_simulation(&self, run_id: &str, output: &SimulationOutput) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO simulation_result (
                    run_id, trial, source_row, rain_mm, wind_speed_kmh, visibility_m,
                    temperature_c, base_risk, risk_score, is_traffic_jam,
                    accident_probability, is_accident
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for r in &output.results {
                stmt.execute(params![
                    run_id,
                    r.trial as i64,
                    r.source_row.map(|i| i as i64),
                    r.scenario.rain_mm,
                    r.scenario.wind_speed_kmh,
                    r.scenario.visibility_m,
                    r.scenario.temperature_c,
                    r.base_risk,
                    r.risk_score,
                    if r.is_traffic_jam { 1 } else { 0 },
                    r.accident_probability,
                    if r.is_accident { 1 } else { 0 },
                ])?;
            }
            tx.execute(
                "INSERT OR REPLACE INTO simulation_summary (run_id, summary_json) VALUES (?1, ?2)",
                params![run_id, serde_json::to_string(&output.summary)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_simulation_results(&self, run_id: &str) -> PipelineResult<Vec<SimulationResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT trial, source_row, rain_mm, wind_speed_kmh, visibility_m, temperature_c,
                    base_risk, risk_score, is_traffic_jam, accident_probability, is_accident
             FROM simulation_result WHERE run_id = ?1
             ORDER BY trial",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(SimulationResult {
                trial: row.get::<_, i64>(0)? as usize,
                source_row: row.get::<_, Option<i64>>(1)?.map(|i| i as usize),
                scenario: WeatherScenario {
                    rain_mm: row.get(2)?,
                    wind_speed_kmh: row.get(3)?,
                    visibility_m: row.get(4)?,
                    temperature_c: row.get(5)?,
                },
                base_risk: row.get(6)?,
                risk_score: row.get(7)?,
                is_traffic_jam: row.get::<_, i32>(8)? != 0,
                accident_probability: row.get(9)?,
                is_accident: row.get::<_, i32>(10)? != 0,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn load_simulation_summary(&self, run_id: &str) -> PipelineResult<Option<SimulationSummary>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT summary_json FROM simulation_summary WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    // ── Factor analysis ────────────────────────────────────────

    pub fn save_factor_analysis(&self, run_id: &str, output: &FactorAnalysisOutput) -> PipelineResult<()> {
        let model = &output.model;
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO factor_loading (run_id, factor, variable, loading, unrotated)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (j, factor) in model.factors.iter().enumerate() {
                for (i, variable) in model.variables.iter().enumerate() {
                    stmt.execute(params![
                        run_id,
                        factor.index as i64,
                        variable,
                        factor.loadings[i],
                        model.unrotated_loadings[i][j],
                    ])?;
                }
            }
            tx.execute(
                "INSERT OR REPLACE INTO factor_model (run_id, model_json, report_json)
                 VALUES (?1, ?2, ?3)",
                params![
                    run_id,
                    serde_json::to_string(model)?,
                    serde_json::to_string(&output.report)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_factor_analysis(&self, run_id: &str) -> PipelineResult<Option<(FactorModel, InterpretationReport)>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT model_json, report_json FROM factor_model WHERE run_id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((model, report)) => Ok(Some((serde_json::from_str(&model)?, serde_json::from_str(&report)?))),
            None => Ok(None),
        }
    }

    /// (factor, variable, loading) rows in factor then variable order.
    pub fn factor_loadings(&self, run_id: &str) -> PipelineResult<Vec<(usize, String, f64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT factor, variable, loading FROM factor_loading
             WHERE run_id = ?1 ORDER BY factor, variable",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((row.get::<_, i64>(0)? as usize, row.get(1)?, row.get(2)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn simulation_result_count(&self, run_id: &str) -> PipelineResult<usize> {
        self.count_rows("simulation_result", run_id)
    }
}
