//! The pipeline engine: raw sources in, risk and factor outputs out.
//!
//! EXECUTION ORDER (fixed, documented, never reordered):
//!   1. Cleaner (weather)
//!   2. Cleaner (traffic)
//!   3. Merger
//!   4. Monte Carlo simulator   (independent of 5)
//!   5. Factor analyzer         (independent of 4)
//!
//! RULES:
//!   - A cleaner failure stops the run before the merge.
//!   - The analytical stages only read the merged table. Each one's
//!     result is kept separately; one failing never hides the other.
//!   - All randomness flows through the RngBank.
//!   - Every event is appended to the run's event log in emission order.

use crate::{
    cleaner::{CleanOutcome, Cleaner},
    config::PipelineConfig,
    error::{PipelineError, PipelineResult},
    event::{event_type_name, EventLogEntry, PipelineEvent},
    factor_analysis::{FactorAnalysisOutput, FactorAnalyzer},
    merger::{MergeOutcome, Merger},
    monte_carlo::{MonteCarloSimulator, SimulationOutput},
    record::{CleanRecord, MergedRecord, RawDataset, TrafficRecord, WeatherRecord},
    rng::RngBank,
    schema::SourceSchema,
    stage::AnalyticalStage,
    store::PipelineStore,
    types::RunId,
};

const ENGINE: &str = "engine";
const MERGER: &str = "merger";

/// Everything a completed run produced.
pub struct PipelineOutcome {
    pub weather: CleanOutcome<WeatherRecord>,
    pub traffic: CleanOutcome<TrafficRecord>,
    pub merge: MergeOutcome,
    pub simulation: PipelineResult<SimulationOutput>,
    pub factor_analysis: PipelineResult<FactorAnalysisOutput>,
}

impl PipelineOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.simulation.is_ok() && self.factor_analysis.is_ok()
    }
}

pub struct PipelineEngine {
    pub run_id:   RunId,
    pub rng_bank: RngBank,
    config:       PipelineConfig,
    store:        PipelineStore,
    events:       Vec<PipelineEvent>,
    seq:          u64,
}

impl PipelineEngine {
    /// The run row must already exist in `store`.
    pub fn new(run_id: RunId, config: PipelineConfig, store: PipelineStore) -> Self {
        Self {
            rng_bank: RngBank::new(config.seed),
            config,
            store,
            events: Vec::new(),
            seq: 0,
            run_id,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    /// Events emitted so far, in order.
    pub fn events(&self) -> &[PipelineEvent] {
        &self.events
    }

    /// Run every stage once over the two raw sources.
    pub fn run(&mut self, weather_raw: &RawDataset, traffic_raw: &RawDataset) -> PipelineResult<PipelineOutcome> {
        self.emit(
            ENGINE,
            PipelineEvent::RunInitialized {
                run_id: self.run_id.clone(),
                seed: self.rng_bank.master_seed(),
            },
        )?;

        let weather_schema = self.config.weather.clone();
        let traffic_schema = self.config.traffic.clone();
        let weather = self.clean_source::<WeatherRecord>(weather_schema, weather_raw)?;
        let traffic = self.clean_source::<TrafficRecord>(traffic_schema, traffic_raw)?;

        let (weather, traffic) = match (weather, traffic) {
            (Ok(w), Ok(t)) => (w, t),
            (Err(e), Err(_)) => return self.skip_merge("weather and traffic", e),
            (Err(e), Ok(_)) => return self.skip_merge("weather", e),
            (Ok(_), Err(e)) => return self.skip_merge("traffic", e),
        };

        let merge = self.merge(&weather.records, &traffic.records)?;
        let (simulation, factor_analysis) = self.analyze(&merge.records)?;

        log::info!(
            "run {} complete: {} merged rows, simulation {}, factor analysis {}",
            self.run_id,
            merge.records.len(),
            if simulation.is_ok() { "ok" } else { "failed" },
            if factor_analysis.is_ok() { "ok" } else { "failed" }
        );

        Ok(PipelineOutcome {
            weather,
            traffic,
            merge,
            simulation,
            factor_analysis,
        })
    }

    /// Run the two analytical stages over a merged table and persist
    /// whatever succeeded. The outer Result carries store failures only.
    pub fn analyze(
        &mut self,
        merged: &[MergedRecord],
    ) -> PipelineResult<(PipelineResult<SimulationOutput>, PipelineResult<FactorAnalysisOutput>)> {
        let simulator = MonteCarloSimulator::new(self.config.simulation.clone());
        let simulation = self.run_stage(&simulator, merged)?;
        if let Ok(output) = &simulation {
            self.store.save_simulation(&self.run_id, output)?;
            self.store.save_stage_report(
                &self.run_id,
                simulator.name(),
                &serde_json::to_string(&output.summary)?,
            )?;
        }

        let analyzer = FactorAnalyzer::new(self.config.factor.clone());
        let factor_analysis = self.run_stage(&analyzer, merged)?;
        if let Ok(output) = &factor_analysis {
            self.store.save_factor_analysis(&self.run_id, output)?;
        }

        Ok((simulation, factor_analysis))
    }

    /// Run one analytical stage on its own RNG stream.
    /// The outer Result carries store failures; the inner one is the stage's own.
    pub fn run_stage<S: AnalyticalStage>(
        &mut self,
        stage: &S,
        merged: &[MergedRecord],
    ) -> PipelineResult<PipelineResult<S::Output>> {
        let name = stage.name();
        self.emit(name, PipelineEvent::StageStarted { stage: name.into() })?;
        let mut rng = self.rng_bank.for_stage(stage.slot());
        let result = stage.run(merged, &mut rng);
        match &result {
            Ok(output) => self.emit(
                name,
                PipelineEvent::StageCompleted {
                    stage: name.into(),
                    output_rows: S::output_rows(output),
                },
            )?,
            Err(e) => {
                log::error!("{name} failed: {e}");
                self.emit(
                    name,
                    PipelineEvent::StageFailed {
                        stage: name.into(),
                        error: e.to_string(),
                    },
                )?
            }
        }
        Ok(result)
    }

    fn clean_source<R: CleanRecord>(
        &mut self,
        schema: SourceSchema,
        raw: &RawDataset,
    ) -> PipelineResult<PipelineResult<CleanOutcome<R>>> {
        let stage = format!("cleaner_{}", R::SOURCE.name());
        self.emit(&stage, PipelineEvent::StageStarted { stage: stage.clone() })?;

        let cleaner = Cleaner::new(schema, self.config.cleaning.clone());
        let result = cleaner.clean::<R>(raw);
        match &result {
            Ok(outcome) => {
                for warning in outcome.report.warnings() {
                    self.emit(&stage, warning)?;
                }
                self.store
                    .save_stage_report(&self.run_id, &stage, &serde_json::to_string(&outcome.report)?)?;
                self.emit(
                    &stage,
                    PipelineEvent::StageCompleted {
                        stage: stage.clone(),
                        output_rows: outcome.records.len(),
                    },
                )?;
            }
            Err(e) => {
                log::error!("{stage} failed: {e}");
                self.emit(
                    &stage,
                    PipelineEvent::StageFailed {
                        stage: stage.clone(),
                        error: e.to_string(),
                    },
                )?;
            }
        }
        Ok(result)
    }

    fn merge(&mut self, weather: &[WeatherRecord], traffic: &[TrafficRecord]) -> PipelineResult<MergeOutcome> {
        self.emit(MERGER, PipelineEvent::StageStarted { stage: MERGER.into() })?;
        self.store.save_clean_weather(&self.run_id, weather)?;
        self.store.save_clean_traffic(&self.run_id, traffic)?;

        let merger = match Merger::new(&self.config.merge) {
            Ok(m) => m,
            Err(e) => {
                self.emit(
                    MERGER,
                    PipelineEvent::StageFailed {
                        stage: MERGER.into(),
                        error: e.to_string(),
                    },
                )?;
                return Err(e);
            }
        };
        let outcome = merger.merge(weather, traffic);
        for warning in outcome.report.warnings() {
            self.emit(MERGER, warning)?;
        }
        self.store.save_merged(&self.run_id, &outcome.records)?;
        self.store
            .save_stage_report(&self.run_id, MERGER, &serde_json::to_string(&outcome.report)?)?;
        self.emit(
            MERGER,
            PipelineEvent::StageCompleted {
                stage: MERGER.into(),
                output_rows: outcome.records.len(),
            },
        )?;
        Ok(outcome)
    }

    fn skip_merge<T>(&mut self, failed: &str, error: PipelineError) -> PipelineResult<T> {
        self.emit(
            MERGER,
            PipelineEvent::StageSkipped {
                stage: MERGER.into(),
                reason: format!("cleaning failed for {failed}"),
            },
        )?;
        Err(error)
    }

    /// Record an event in memory and in the run's event log.
    fn emit(&mut self, stage: &str, event: PipelineEvent) -> PipelineResult<()> {
        let entry = EventLogEntry {
            id:         None,
            run_id:     self.run_id.clone(),
            seq:        self.seq,
            stage:      stage.to_string(),
            event_type: event_type_name(&event).to_string(),
            payload:    serde_json::to_string(&event)?,
        };
        self.store.append_event(&entry)?;
        self.seq += 1;
        self.events.push(event);
        Ok(())
    }
}
