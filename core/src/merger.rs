//! Dataset merger: clean weather × clean traffic → analytical base table.
//!
//! Inner join on city, then a sorted merge-join on timestamp: each traffic
//! record pairs with the nearest weather record within the tolerance.
//! Equally near candidates resolve to the earlier weather timestamp.
//! Records without a counterpart are excluded and counted, never padded.

use crate::{
    config::MergeConfig,
    error::{PipelineError, PipelineResult},
    event::PipelineEvent,
    record::{MergedRecord, TrafficRecord, WeatherRecord},
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const STAGE: &str = "merger";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub weather_rows: usize,
    pub traffic_rows: usize,
    pub merged_rows: usize,
    /// Distinct weather rows used by at least one pair.
    pub weather_matched: usize,
    pub weather_unmatched: usize,
    pub traffic_unmatched: usize,
}

impl MergeReport {
    pub fn unmatched_total(&self) -> usize {
        self.weather_unmatched + self.traffic_unmatched
    }

    pub fn warnings(&self) -> Vec<PipelineEvent> {
        if self.unmatched_total() == 0 {
            return Vec::new();
        }
        vec![PipelineEvent::JoinMismatchWarning {
            weather_unmatched: self.weather_unmatched,
            traffic_unmatched: self.traffic_unmatched,
        }]
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub records: Vec<MergedRecord>,
    pub report: MergeReport,
}

pub struct Merger {
    tolerance: Duration,
}

impl Merger {
    pub fn new(config: &MergeConfig) -> PipelineResult<Self> {
        if config.tolerance_seconds < 0 {
            return Err(PipelineError::precondition(
                STAGE,
                format!("tolerance must be >= 0 seconds, got {}", config.tolerance_seconds),
            ));
        }
        let tolerance = Duration::try_seconds(config.tolerance_seconds).ok_or_else(|| {
            PipelineError::precondition(
                STAGE,
                format!("tolerance of {}s is out of range", config.tolerance_seconds),
            )
        })?;
        Ok(Self { tolerance })
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    pub fn merge(&self, weather: &[WeatherRecord], traffic: &[TrafficRecord]) -> MergeOutcome {
        let weather_by_city = group_sorted(weather, |w| (&w.city, w.timestamp));
        let traffic_by_city = group_sorted(traffic, |t| (&t.city, t.timestamp));

        let mut records = Vec::new();
        let mut weather_matched = 0;
        let mut traffic_unmatched = 0;

        for (city, city_traffic) in &traffic_by_city {
            let Some(city_weather) = weather_by_city.get(city) else {
                traffic_unmatched += city_traffic.len();
                continue;
            };
            let mut used = vec![false; city_weather.len()];
            // Window start: first weather row not too early for the current traffic row.
            let mut lo = 0;

            for t in city_traffic {
                // A bound past the representable range leaves that side of the window open.
                let earliest = t.timestamp.checked_sub_signed(self.tolerance);
                let latest = t.timestamp.checked_add_signed(self.tolerance);
                while lo < city_weather.len()
                    && earliest.map_or(false, |e| city_weather[lo].timestamp < e)
                {
                    lo += 1;
                }
                let mut best: Option<(usize, Duration)> = None;
                let mut j = lo;
                while j < city_weather.len()
                    && latest.map_or(true, |l| city_weather[j].timestamp <= l)
                {
                    let gap = (city_weather[j].timestamp - t.timestamp).abs();
                    // Strict < keeps the earliest of equally near candidates.
                    if best.map_or(true, |(_, g)| gap < g) {
                        best = Some((j, gap));
                    }
                    j += 1;
                }
                match best {
                    Some((idx, _)) => {
                        if !used[idx] {
                            used[idx] = true;
                            weather_matched += 1;
                        }
                        records.push(MergedRecord {
                            weather: city_weather[idx].clone(),
                            traffic: (*t).clone(),
                        });
                    }
                    None => traffic_unmatched += 1,
                }
            }
        }

        let report = MergeReport {
            weather_rows: weather.len(),
            traffic_rows: traffic.len(),
            merged_rows: records.len(),
            weather_matched,
            weather_unmatched: weather.len() - weather_matched,
            traffic_unmatched,
        };
        log::info!(
            "merger: {} weather x {} traffic -> {} merged (tolerance {}s)",
            report.weather_rows,
            report.traffic_rows,
            report.merged_rows,
            self.tolerance.num_seconds()
        );
        if report.unmatched_total() > 0 {
            log::warn!(
                "merger: unmatched rows weather={} traffic={}",
                report.weather_unmatched,
                report.traffic_unmatched
            );
        }

        MergeOutcome { records, report }
    }
}

/// Group by city (ordered) and sort each group by timestamp.
/// The sort is stable, so input order breaks timestamp ties.
fn group_sorted<'a, T, F>(rows: &'a [T], key: F) -> BTreeMap<&'a str, Vec<&'a T>>
where
    F: Fn(&'a T) -> (&'a String, chrono::NaiveDateTime),
{
    let mut groups: BTreeMap<&'a str, Vec<&'a T>> = BTreeMap::new();
    for row in rows {
        let (city, _) = key(row);
        groups.entry(city.as_str()).or_default().push(row);
    }
    for group in groups.values_mut() {
        group.sort_by_key(|r| key(*r).1);
    }
    groups
}
