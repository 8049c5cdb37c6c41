//! What happened to each candidate run of a field.

use shared::exposure::ExposureId;

use crate::accumulate::CoaddResult;
use crate::background::ResidualStats;
use crate::error::PipelineError;

#[derive(Debug)]
pub enum RunOutcome {
    /// Background-matched and added to the coadd
    Contributed {
        /// Chebyshev coefficients of the applied correction
        coefficients: Vec<f64>,
        residuals: Option<ResidualStats>,
    },
    /// Attempted and rejected; nothing from the run reached the coadd
    Excluded(PipelineError),
    /// Not attempted because the run limit was reached
    Skipped,
}

#[derive(Debug)]
pub struct RunReport {
    pub run: u32,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn contributed(&self) -> bool {
        matches!(self.outcome, RunOutcome::Contributed { .. })
    }
}

/// Result of processing one reference field.
#[derive(Debug)]
pub struct FieldOutcome {
    pub field: u32,
    pub reference_id: ExposureId,
    /// One report per candidate run, ascending by run
    pub runs: Vec<RunReport>,
    pub coadd: CoaddResult,
}

impl FieldOutcome {
    /// Runs that reached the coadd
    pub fn contributing_runs(&self) -> Vec<u32> {
        self.runs
            .iter()
            .filter(|r| r.contributed())
            .map(|r| r.run)
            .collect()
    }

    pub fn excluded_runs(&self) -> Vec<(u32, &PipelineError)> {
        self.runs
            .iter()
            .filter_map(|r| match &r.outcome {
                RunOutcome::Excluded(err) => Some((r.run, err)),
                _ => None,
            })
            .collect()
    }

    pub fn skipped_runs(&self) -> Vec<u32> {
        self.runs
            .iter()
            .filter(|r| matches!(r.outcome, RunOutcome::Skipped))
            .map(|r| r.run)
            .collect()
    }
}
