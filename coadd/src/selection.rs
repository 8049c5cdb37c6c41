//! Candidate selection: which catalog entries are worth coadding.
//!
//! Catalog entries overlapping the reference are filtered on observing
//! conditions, restricted to the reference run's strip, and grouped by run.
//! Every group becomes one stitched mosaic downstream.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::collaborators::CatalogEntry;
use crate::error::PipelineError;

/// Filters applied to catalog entries before grouping.
///
/// Metric limits are exclusive and a limit left at `None` is not applied.
/// Entries without quality metrics pass every metric filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Seeing FWHM (arcsec) must be below this
    pub max_fwhm: Option<f64>,
    pub max_sky: Option<f64>,
    pub max_airmass: Option<f64>,
    /// Lowest acceptable survey quality flag, 1 (bad) to 3 (good)
    pub min_quality: u8,
    /// Drop fields flagged as blacklisted
    pub cull_blacklisted: bool,
    /// Keep at most this many entries, in catalog order
    pub max_exposures: Option<usize>,
    /// Only these camera columns, if set
    pub camcols: Option<Vec<u8>>,
    /// Force this strip instead of resolving it from the reference run
    pub strip: Option<String>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            max_fwhm: None,
            max_sky: None,
            max_airmass: None,
            min_quality: 3,
            cull_blacklisted: true,
            max_exposures: None,
            camcols: None,
            strip: None,
        }
    }
}

impl SelectionConfig {
    pub fn accepts(&self, entry: &CatalogEntry) -> bool {
        if let Some(camcols) = &self.camcols {
            if !camcols.contains(&entry.id.camcol) {
                return false;
            }
        }
        let Some(quality) = entry.quality else {
            return true;
        };
        let below = |limit: Option<f64>, value: f64| limit.map_or(true, |max| value < max);

        below(self.max_fwhm, quality.fwhm)
            && below(self.max_sky, quality.sky)
            && below(self.max_airmass, quality.airmass)
            && quality.quality >= self.min_quality
            && !(self.cull_blacklisted && quality.blacklisted)
    }
}

/// The fields of one candidate run, ordered by field ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct RunGroup {
    pub run: u32,
    pub members: Vec<CatalogEntry>,
}

/// The single strip the reference run belongs to.
///
/// # Errors
/// `PipelineError::AmbiguousStrip` unless the entries for `refrun` name
/// exactly one strip.
pub fn resolve_strip(entries: &[CatalogEntry], refrun: u32) -> Result<String, PipelineError> {
    let mut strips: Vec<String> = entries
        .iter()
        .filter(|e| e.id.run == refrun)
        .map(|e| e.strip.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect();

    if strips.len() == 1 {
        return Ok(strips.remove(0));
    }
    Err(PipelineError::AmbiguousStrip { refrun, strips })
}

/// Group entries by run, ascending, with each run's fields ascending and
/// duplicates removed.
pub fn group_runs(entries: Vec<CatalogEntry>) -> Vec<RunGroup> {
    let mut by_run: BTreeMap<u32, Vec<CatalogEntry>> = BTreeMap::new();
    for entry in entries {
        by_run.entry(entry.id.run).or_default().push(entry);
    }
    by_run
        .into_iter()
        .map(|(run, mut members)| {
            members.sort_by(|a, b| a.id.cmp(&b.id));
            members.dedup_by(|a, b| a.id == b.id);
            RunGroup { run, members }
        })
        .collect()
}

/// Candidate runs for a reference run: same strip, other runs, passing the filters.
pub fn select_candidates(
    entries: Vec<CatalogEntry>,
    refrun: u32,
    config: &SelectionConfig,
) -> Result<Vec<RunGroup>, PipelineError> {
    let strip = match &config.strip {
        Some(strip) => strip.clone(),
        None => resolve_strip(&entries, refrun)?,
    };

    let total = entries.len();
    let kept: Vec<CatalogEntry> = entries
        .into_iter()
        .filter(|e| e.id.run != refrun && e.strip == strip && config.accepts(e))
        .take(config.max_exposures.unwrap_or(usize::MAX))
        .collect();
    debug!(
        "kept {} of {total} catalog entries on strip {strip}",
        kept.len()
    );
    Ok(group_runs(kept))
}
