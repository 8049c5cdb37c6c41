//! Field-level orchestration: Stitch → Warp → Background-Match → Coadd.
//!
//! For one reference field the pipeline
//!
//! 1. loads and PSF-matches the reference,
//! 2. asks the catalog for overlapping fields and selects candidate runs,
//! 3. per candidate run loads every sub-image, PSF-matches and stitches them,
//!    warps the mosaic onto the reference grid and fits its background,
//! 4. accumulates every successfully matched run into the coadd.
//!
//! A failure anywhere inside step 3 excludes that run only. Failures of the
//! reference itself or of the catalog abort the field.

mod report;

pub use report::{FieldOutcome, RunOutcome, RunReport};

use crossbeam_channel::bounded;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::ops::Range;
use std::sync::Arc;
use std::thread;

use shared::exposure::{ExposureId, ExposureRecord, MaskedImage};
use shared::psf::PsfModel;

use crate::accumulate::CoaddState;
use crate::background::{BackgroundMatcher, MatchedExposure};
use crate::collaborators::{
    load_exposure, CatalogQuery, ExposureLoader, OutputSink, PsfMatcher, SkyPolygon, Warper,
};
use crate::config::{MatchBackgroundsConfig, MatchMode};
use crate::error::PipelineError;
use crate::naming::{OutputKey, ProductKind};
use crate::selection::{select_candidates, RunGroup};
use crate::stitch::stitch;

/// The external services a pipeline runs against.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub catalog: &'a dyn CatalogQuery,
    pub loader: &'a dyn ExposureLoader,
    pub psf_matcher: &'a dyn PsfMatcher,
    pub warper: &'a dyn Warper,
    pub sink: &'a dyn OutputSink,
}

/// The reference run whose fields are coadded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTarget {
    pub refrun: u32,
    pub rerun: u32,
    pub filter: String,
    pub camcol: u8,
}

impl FieldTarget {
    pub fn new(refrun: u32, rerun: u32, filter: impl Into<String>, camcol: u8) -> Self {
        Self {
            refrun,
            rerun,
            filter: filter.into(),
            camcol,
        }
    }

    pub fn reference_id(&self, field: u32) -> ExposureId {
        ExposureId::new(self.refrun, self.rerun, self.filter.clone(), self.camcol, field)
    }

    pub fn key(&self, kind: ProductKind, field: u32) -> OutputKey {
        OutputKey::field(kind, self.refrun, &self.filter, self.camcol, field)
    }
}

/// Everything known about a field before its candidate runs are processed.
struct FieldSetup {
    reference: ExposureRecord,
    groups: Vec<RunGroup>,
}

/// Coadd and per-run bookkeeping while a field's runs are processed in waves.
struct FieldState {
    coadd: CoaddState,
    outcomes: Vec<Option<RunOutcome>>,
    /// Warped exposures waiting for the batch fit
    warped: Vec<Option<ExposureRecord>>,
}

impl FieldState {
    fn new(setup: &FieldSetup, bad_mask: u32) -> Result<Self, PipelineError> {
        Ok(Self {
            coadd: CoaddState::from_reference(&setup.reference.masked, bad_mask)?,
            outcomes: setup.groups.iter().map(|_| None).collect(),
            warped: setup.groups.iter().map(|_| None).collect(),
        })
    }
}

pub struct CoaddPipeline<'a> {
    config: MatchBackgroundsConfig,
    target: FieldTarget,
    collaborators: Collaborators<'a>,
    reference_psf: Arc<PsfModel>,
    matcher: BackgroundMatcher,
    bad_mask: u32,
}

impl<'a> CoaddPipeline<'a> {
    /// # Errors
    /// `PipelineError::Config` if the configuration does not validate.
    pub fn new(
        config: MatchBackgroundsConfig,
        target: FieldTarget,
        collaborators: Collaborators<'a>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let bad_mask = config
            .bad_mask()
            .map_err(|e| PipelineError::Config(e.into()))?;
        let reference_psf = config.reference_psf();
        let (width, height) = reference_psf.dimensions();
        info!(
            "target PSF {width}x{height}, FWHM {:.2} px",
            reference_psf.fwhm()
        );
        Ok(Self {
            reference_psf: Arc::new(reference_psf),
            matcher: config.matcher(),
            bad_mask,
            config,
            target,
            collaborators,
        })
    }

    pub fn config(&self) -> &MatchBackgroundsConfig {
        &self.config
    }

    pub fn target(&self) -> &FieldTarget {
        &self.target
    }

    pub fn reference_psf(&self) -> &PsfModel {
        &self.reference_psf
    }

    /// Process a field with the strategy selected by `config.parallel`.
    pub fn run_field(&self, field: u32) -> Result<FieldOutcome, PipelineError> {
        if self.config.parallel {
            self.process_field_parallel(field)
        } else {
            self.process_field(field)
        }
    }

    /// Process several fields in order. Field failures are logged and
    /// reported; they do not stop later fields.
    pub fn process_fields(
        &self,
        fields: &[u32],
    ) -> Vec<(u32, Result<FieldOutcome, PipelineError>)> {
        fields
            .iter()
            .map(|&field| {
                let result = self.run_field(field);
                if let Err(err) = &result {
                    error!("field {field} failed: {err}");
                }
                (field, result)
            })
            .collect()
    }

    /// Process one field, one candidate run after the other.
    pub fn process_field(&self, field: u32) -> Result<FieldOutcome, PipelineError> {
        self.process(field, false)
    }

    /// Process one field with candidate runs handled concurrently.
    ///
    /// The per-run chain runs on the rayon pool; matched exposures flow
    /// through a bounded channel to a single accumulator on the calling
    /// thread, so at most `queue_depth` of them wait in memory at once.
    pub fn process_field_parallel(&self, field: u32) -> Result<FieldOutcome, PipelineError> {
        self.process(field, true)
    }

    /// Runs are taken in catalog order in waves no larger than the remaining
    /// run limit. Only runs that load, stitch and warp count against it, so
    /// a failed run makes room for the next candidate.
    fn process(&self, field: u32, parallel: bool) -> Result<FieldOutcome, PipelineError> {
        let setup = self.prepare_field(field)?;
        let key = self.target.key(ProductKind::Exposure, field);
        let mut state = FieldState::new(&setup, self.bad_mask)?;

        let total = setup.groups.len();
        let mut next = 0;
        let mut warped = 0;
        while next < total {
            let take = match self.config.max_runs {
                Some(limit) if warped >= limit => break,
                Some(limit) => limit - warped,
                None => total,
            };
            let wave = next..(next + take).min(total);
            next = wave.end;
            warped += match self.config.match_mode {
                MatchMode::PerRun => self.match_wave(&setup, wave, &key, &mut state, parallel),
                MatchMode::Batch => self.warp_wave(&setup, wave, &key, &mut state, parallel),
            };
        }
        if self.config.match_mode == MatchMode::Batch {
            self.match_and_accumulate_batch(&setup, &key, &mut state);
        }

        Ok(self.finish_field(field, setup, state))
    }

    fn prepare_field(&self, field: u32) -> Result<FieldSetup, PipelineError> {
        let id = self.target.reference_id(field);
        info!("processing reference field {id}");

        let reference = load_exposure(self.collaborators.loader, &id, self.config.gain)?;
        let mut reference = self
            .collaborators
            .psf_matcher
            .match_psf(reference, &self.reference_psf)
            .map_err(PipelineError::PsfMatch)?;
        reference.psf = self.reference_psf.clone();
        if self.config.write_outputs {
            self.persist(&self.target.key(ProductKind::Exposure, field), &reference.masked);
        }

        let region = SkyPolygon::from_exposure(&reference);
        let entries = self
            .collaborators
            .catalog
            .query(&region, &self.target.filter)
            .map_err(PipelineError::CatalogQuery)?;
        let groups = select_candidates(entries, self.target.refrun, &self.config.selection)?;
        info!("field {field}: {} candidate runs", groups.len());

        Ok(FieldSetup { reference, groups })
    }

    /// Warp and match every run in `wave`, accumulating as results arrive.
    /// Returns how many of them warped.
    fn match_wave(
        &self,
        setup: &FieldSetup,
        wave: Range<usize>,
        key: &OutputKey,
        state: &mut FieldState,
        parallel: bool,
    ) -> usize {
        let mut warped = 0;
        if !parallel {
            for index in wave {
                let group = &setup.groups[index];
                let (counted, result) = self.warp_and_match(&setup.reference, group, key);
                warped += usize::from(counted);
                state.outcomes[index] = Some(self.accumulate(&mut state.coadd, group.run, result));
            }
            return warped;
        }

        let (sender, receiver) = bounded(self.config.queue_depth);
        let reference = &setup.reference;
        let groups = &setup.groups[wave.clone()];
        thread::scope(|scope| {
            scope.spawn(move || {
                groups
                    .par_iter()
                    .enumerate()
                    .for_each_with(sender, |sender, (offset, group)| {
                        let (counted, result) = self.warp_and_match(reference, group, key);
                        if sender.send((wave.start + offset, counted, result)).is_err() {
                            warn!("accumulator gone, dropping run {}", group.run);
                        }
                    });
            });

            for (index, counted, result) in receiver.iter() {
                warped += usize::from(counted);
                let run = setup.groups[index].run;
                state.outcomes[index] = Some(self.accumulate(&mut state.coadd, run, result));
            }
        });
        warped
    }

    /// Warp every run in `wave` and hold the results for the batch fit.
    /// Returns how many of them warped.
    fn warp_wave(
        &self,
        setup: &FieldSetup,
        wave: Range<usize>,
        key: &OutputKey,
        state: &mut FieldState,
        parallel: bool,
    ) -> usize {
        let groups = &setup.groups[wave.clone()];
        let warp = |group: &RunGroup| self.warp_run(&setup.reference, group, key);
        let results: Vec<_> = if parallel {
            groups.par_iter().map(warp).collect()
        } else {
            groups.iter().map(warp).collect()
        };

        let mut warped = 0;
        for (index, result) in wave.zip(results) {
            match result {
                Ok(exposure) => {
                    warped += 1;
                    state.warped[index] = Some(exposure);
                }
                Err(err) => {
                    let run = setup.groups[index].run;
                    state.outcomes[index] = Some(self.accumulate(&mut state.coadd, run, Err(err)));
                }
            }
        }
        warped
    }

    /// Load, PSF-match, stitch and warp one candidate run onto the reference grid.
    fn warp_run(
        &self,
        reference: &ExposureRecord,
        group: &RunGroup,
        key: &OutputKey,
    ) -> Result<ExposureRecord, PipelineError> {
        let required = group.members.len();
        let mut sub_images = Vec::with_capacity(required);
        let mut failed = false;
        for entry in &group.members {
            match load_exposure(self.collaborators.loader, &entry.id, self.config.gain) {
                Ok(exposure) => sub_images.push(exposure),
                Err(err) => {
                    warn!("run {}: {err}", group.run);
                    failed = true;
                }
            }
        }
        if failed {
            return Err(PipelineError::IncompleteRun {
                run: group.run,
                loaded: sub_images.len(),
                required,
            });
        }

        let matched = sub_images
            .into_iter()
            .map(|exposure| {
                self.collaborators
                    .psf_matcher
                    .match_psf(exposure, &self.reference_psf)
                    .map_err(PipelineError::PsfMatch)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mosaic = stitch(matched, self.config.overlap_px)?;
        debug!(
            "run {}: stitched {required} fields into {}x{}",
            group.run,
            mosaic.width(),
            mosaic.height()
        );
        if self.config.write_outputs {
            let key = key.clone().for_run(ProductKind::PsfMatched, group.run);
            self.persist(&key, &mosaic.masked);
        }

        let kernel = &self.config.warping_kernel_name;
        debug!("run {}: warping with {kernel} kernel", group.run);
        let mut warped = self
            .collaborators
            .warper
            .warp(mosaic, reference.bbox(), &reference.wcs, kernel)
            .map_err(PipelineError::Warp)?;
        warped.psf = self.reference_psf.clone();
        if self.config.write_outputs {
            let key = key.clone().for_run(ProductKind::Warped, group.run);
            self.persist(&key, &warped.masked);
        }
        Ok(warped)
    }

    /// The flag is true once the run has warped, whatever the fit does.
    fn warp_and_match(
        &self,
        reference: &ExposureRecord,
        group: &RunGroup,
        key: &OutputKey,
    ) -> (bool, Result<MatchedExposure, PipelineError>) {
        match self.warp_run(reference, group, key) {
            Ok(warped) => (true, self.match_warped(reference, group.run, warped, key)),
            Err(err) => (false, Err(err)),
        }
    }

    fn match_warped(
        &self,
        reference: &ExposureRecord,
        run: u32,
        warped: ExposureRecord,
        key: &OutputKey,
    ) -> Result<MatchedExposure, PipelineError> {
        let matched = self.matcher.solve(reference, warped)?;
        self.persist_matched(reference, run, &matched, key);
        Ok(matched)
    }

    fn match_and_accumulate_batch(
        &self,
        setup: &FieldSetup,
        key: &OutputKey,
        state: &mut FieldState,
    ) {
        let (slots, ready): (Vec<usize>, Vec<ExposureRecord>) = state
            .warped
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, warped)| warped.take().map(|exposure| (slot, exposure)))
            .unzip();

        let matched = self.matcher.solve_batch(&setup.reference, ready);
        for (slot, result) in slots.into_iter().zip(matched) {
            let run = setup.groups[slot].run;
            let result = result.map_err(PipelineError::from).inspect(|m| {
                self.persist_matched(&setup.reference, run, m, key);
            });
            state.outcomes[slot] = Some(self.accumulate(&mut state.coadd, run, result));
        }
    }

    fn persist_matched(
        &self,
        reference: &ExposureRecord,
        run: u32,
        matched: &MatchedExposure,
        key: &OutputKey,
    ) {
        if !self.config.write_outputs {
            return;
        }
        let matched_key = key.clone().for_run(ProductKind::Matched, run);
        self.persist(&matched_key, &matched.exposure.masked);
        match matched.exposure.masked.difference(&reference.masked) {
            Ok(diff) => self.persist(&key.clone().for_run(ProductKind::Difference, run), &diff),
            Err(err) => warn!("run {run}: cannot form difference image: {err}"),
        }
    }

    /// Add a matched run to the coadd, or record why it was excluded.
    fn accumulate(
        &self,
        coadd: &mut CoaddState,
        run: u32,
        result: Result<MatchedExposure, PipelineError>,
    ) -> RunOutcome {
        let added = result.and_then(|matched| {
            coadd.add(&matched.exposure.masked, self.config.coadd.weight, self.bad_mask)?;
            Ok(matched)
        });
        match added {
            Ok(matched) => {
                match &matched.residuals {
                    Some(stats) => info!(
                        "run {run}: residual mean {:.4} median {:.4} std {:.4} over {} pixels",
                        stats.mean, stats.median, stats.std_dev, stats.count
                    ),
                    None => info!("run {run}: no clean pixels left for residual statistics"),
                }
                RunOutcome::Contributed {
                    coefficients: matched.model.coefficients().to_vec(),
                    residuals: matched.residuals,
                }
            }
            Err(err) => {
                warn!("run {run} excluded: {err}");
                RunOutcome::Excluded(err)
            }
        }
    }

    fn finish_field(&self, field: u32, setup: FieldSetup, state: FieldState) -> FieldOutcome {
        let mut skipped = Vec::new();
        let runs: Vec<RunReport> = setup
            .groups
            .iter()
            .zip(state.outcomes)
            .map(|(group, outcome)| {
                let outcome = outcome.unwrap_or_else(|| {
                    skipped.push(group.run);
                    RunOutcome::Skipped
                });
                RunReport {
                    run: group.run,
                    outcome,
                }
            })
            .collect();
        if !skipped.is_empty() {
            info!("field {field}: run limit reached, skipping runs {skipped:?}");
        }

        let coadd = state.coadd.finalize();
        if self.config.write_outputs {
            self.persist(&self.target.key(ProductKind::Coadd, field), &coadd.exposure);
        }
        info!(
            "field {field}: coadded {} of {} candidate runs",
            coadd.contributions.saturating_sub(1),
            runs.len()
        );

        FieldOutcome {
            field,
            reference_id: setup
                .reference
                .id
                .unwrap_or_else(|| self.target.reference_id(field)),
            runs,
            coadd,
        }
    }

    fn persist(&self, key: &OutputKey, image: &MaskedImage) {
        if let Err(err) = self.collaborators.sink.persist(key, image) {
            warn!("failed to persist {key}: {err}");
        }
    }
}
