//! Cleaned record queries.

use super::{format_timestamp, read_timestamp, PipelineStore};
use crate::{
    error::PipelineResult,
    record::{TrafficRecord, WeatherRecord},
};
use rusqlite::params;

impl PipelineStore {
    pub fn save_clean_weather(&self, run_id: &str, records: &[WeatherRecord]) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO clean_weather (
                    run_id, row_idx, timestamp, city, temperature_c, humidity, rain_mm,
                    wind_speed_kmh, visibility_m, air_pressure_hpa, season, weather_condition
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for (i, w) in records.iter().enumerate() {
                stmt.execute(params![
                    run_id,
                    i as i64,
                    format_timestamp(&w.timestamp),
                    &w.city,
                    w.temperature_c,
                    w.humidity,
                    w.rain_mm,
                    w.wind_speed_kmh,
                    w.visibility_m,
                    w.air_pressure_hpa,
                    &w.season,
                    &w.weather_condition,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_clean_weather(&self, run_id: &str) -> PipelineResult<Vec<WeatherRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, city, temperature_c, humidity, rain_mm, wind_speed_kmh,
                    visibility_m, air_pressure_hpa, season, weather_condition
             FROM clean_weather WHERE run_id = ?1
             ORDER BY row_idx",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(WeatherRecord {
                timestamp: read_timestamp(row, 0)?,
                city: row.get(1)?,
                temperature_c: row.get(2)?,
                humidity: row.get(3)?,
                rain_mm: row.get(4)?,
                wind_speed_kmh: row.get(5)?,
                visibility_m: row.get(6)?,
                air_pressure_hpa: row.get(7)?,
                season: row.get(8)?,
                weather_condition: row.get(9)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn save_clean_traffic(&self, run_id: &str, records: &[TrafficRecord]) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO clean_traffic (
                    run_id, row_idx, timestamp, city, vehicle_count, avg_speed_kmh,
                    accident_count, visibility_m, area, congestion_level, road_condition
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for (i, t) in records.iter().enumerate() {
                stmt.execute(params![
                    run_id,
                    i as i64,
                    format_timestamp(&t.timestamp),
                    &t.city,
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

    pub fn load_clean_traffic(&self, run_id: &str) -> PipelineResult<Vec<TrafficRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, city, vehicle_count, avg_speed_kmh, accident_count,
                    visibility_m, area, congestion_level, road_condition
             FROM clean_traffic WHERE run_id = ?1
             ORDER BY row_idx",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(TrafficRecord {
                timestamp: read_timestamp(row, 0)?,
                city: row.get(1)?,
                vehicle_count: row.get(2)?,
                avg_speed_kmh: row.get(3)?,
                accident_count: row.get(4)?,
                visibility_m: row.get(5)?,
                area: row.get(6)?,
                congestion_level: row.get(7)?,
                road_condition: row.get(8)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn clean_weather_count(&self, run_id: &str) -> PipelineResult<usize> {
        self.count_rows("clean_weather", run_id)
    }

    pub fn clean_traffic_count(&self, run_id: &str) -> PipelineResult<usize> {
        self.count_rows("clean_traffic", run_id)
    }
}
