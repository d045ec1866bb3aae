//! Analytical stage trait.
//!
//! RULE: Every analytical engine implements AnalyticalStage.
//! Stages read the merged table through a shared slice and never
//! write to it, so no stage depends on another's output. A failing
//! stage fails alone; the engine still runs the rest.

use crate::{
    error::PipelineResult,
    record::MergedRecord,
    rng::{StageRng, StageSlot},
};

/// The contract every analytical engine must fulfill.
pub trait AnalyticalStage {
    type Output;

    /// Unique stable name for this stage.
    fn name(&self) -> &'static str;

    /// The RNG slot this stage draws from. Fixed once assigned.
    fn slot(&self) -> StageSlot;

    /// Run once over the full merged table.
    ///
    /// - `merged`: the immutable analytical base table
    /// - `rng`:    this stage's deterministic RNG for the run
    fn run(&self, merged: &[MergedRecord], rng: &mut StageRng) -> PipelineResult<Self::Output>;

    /// Row count reported in the StageCompleted event.
    fn output_rows(output: &Self::Output) -> usize;
}
