//! In-memory collaborators for tests and demonstrations.
//!
//! [`SyntheticSurvey`] fabricates a drift-scan survey over a single
//! [`SkyScene`]: every run images the same stars through its own integer
//! pixel shift and its own linear sky background, field by field, with
//! consecutive fields overlapping by a fixed number of rows. It serves as
//! both the catalog and the exposure loader. [`NearestNeighborWarper`],
//! [`AdoptTargetPsf`] and [`RecordingSink`] complete the set.

use log::debug;
use ndarray::{Array2, Zip};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};

use shared::exposure::{ExposureId, ExposureRecord, MaskedImage};
use shared::image_size::{ImageSize, PixelBox};
use shared::mask::MaskPlane;
use shared::psf::PsfModel;
use shared::synthetic::{add_gaussian_noise, SkyScene};
use shared::wcs::{SkyMapping, TanWcs};

use crate::collaborators::{
    CatalogEntry, CatalogQuery, ExposureLoader, FieldQuality, OutputSink, PsfMatcher, SkyPolygon,
    Warper,
};
use crate::error::{CollaboratorError, Component};
use crate::naming::OutputKey;
use crate::sink::ManifestEntry;

/// SDSS-like plate scale, degrees per pixel
const PIXEL_SCALE_DEG: f64 = 0.396 / 3600.0;

/// Sky background `offset + slope_x·x + slope_y·y` in survey-frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinearBackground {
    pub offset: f64,
    pub slope_x: f64,
    pub slope_y: f64,
}

impl LinearBackground {
    pub fn constant(offset: f64) -> Self {
        Self {
            offset,
            ..Self::default()
        }
    }

    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        self.offset + self.slope_x * x + self.slope_y * y
    }
}

/// One imaging run of the synthetic survey.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticRun {
    pub run: u32,
    pub strip: String,
    pub fields: RangeInclusive<u32>,
    /// Survey-frame position of pixel (0, 0) of the run's first-field row
    pub shift: (i64, i64),
    pub background: LinearBackground,
    pub psf_sigma: f64,
    pub quality: Option<FieldQuality>,
}

impl SyntheticRun {
    pub fn new(run: u32, strip: &str, fields: RangeInclusive<u32>) -> Self {
        Self {
            run,
            strip: strip.to_string(),
            fields,
            shift: (0, 0),
            background: LinearBackground::default(),
            psf_sigma: 1.5,
            quality: None,
        }
    }

    pub fn with_shift(mut self, dx: i64, dy: i64) -> Self {
        self.shift = (dx, dy);
        self
    }

    pub fn with_background(mut self, background: LinearBackground) -> Self {
        self.background = background;
        self
    }

    pub fn with_quality(mut self, quality: FieldQuality) -> Self {
        self.quality = Some(quality);
        self
    }
}

/// A synthetic survey acting as catalog and exposure loader.
#[derive(Debug, Clone)]
pub struct SyntheticSurvey {
    pub rerun: u32,
    pub filter: String,
    pub camcol: u8,
    pub field_size: ImageSize,
    pub overlap_px: usize,
    pub scene: SkyScene,
    pub runs: Vec<SyntheticRun>,
    /// Per-pixel Gaussian noise; zero disables noise
    pub noise_sigma: f64,
    pub seed: u64,
    base_wcs: TanWcs,
    missing: HashSet<(ExposureId, Component)>,
}

impl SyntheticSurvey {
    pub fn new(
        field_size: ImageSize,
        overlap_px: usize,
        scene: SkyScene,
        runs: Vec<SyntheticRun>,
    ) -> Self {
        Self {
            rerun: 40,
            filter: "r".to_string(),
            camcol: 3,
            field_size,
            overlap_px,
            scene,
            runs,
            noise_sigma: 0.0,
            seed: 0,
            base_wcs: TanWcs::with_scale((0.0, 0.0), (30.0, 0.0), PIXEL_SCALE_DEG),
            missing: HashSet::new(),
        }
    }

    /// Survey-frame box covering fields `fields` of a run with no shift,
    /// convenient as the extent of a [`SkyScene`].
    pub fn frame_extent(
        field_size: ImageSize,
        overlap_px: usize,
        fields: RangeInclusive<u32>,
    ) -> PixelBox {
        let step = field_size.height.saturating_sub(overlap_px) as i64;
        let first = *fields.start() as i64;
        let count = (*fields.end() as i64 - first + 1).max(0) as usize;
        let height = if count == 0 {
            0
        } else {
            count * field_size.height - overlap_px * (count - 1)
        };
        PixelBox::new(0, first * step, field_size.width, height)
    }

    pub fn with_noise(mut self, sigma: f64, seed: u64) -> Self {
        self.noise_sigma = sigma;
        self.seed = seed;
        self
    }

    /// Make the loader fail to provide `component` of `id`.
    pub fn with_missing(mut self, id: ExposureId, component: Component) -> Self {
        self.missing.insert((id, component));
        self
    }

    pub fn id(&self, run: u32, field: u32) -> ExposureId {
        ExposureId::new(run, self.rerun, self.filter.clone(), self.camcol, field)
    }

    fn find_run(&self, id: &ExposureId) -> Option<&SyntheticRun> {
        if id.rerun != self.rerun || id.filter != self.filter || id.camcol != self.camcol {
            return None;
        }
        self.runs
            .iter()
            .find(|r| r.run == id.run && r.fields.contains(&id.field))
    }

    fn is_missing(&self, id: &ExposureId, component: Component) -> bool {
        self.missing.contains(&(id.clone(), component))
    }

    /// Survey-frame box imaged by `field` of `run`
    fn field_box(&self, run: &SyntheticRun, field: u32) -> PixelBox {
        let step = self.field_size.height.saturating_sub(self.overlap_px) as i64;
        PixelBox::new(
            run.shift.0,
            field as i64 * step + run.shift.1,
            self.field_size.width,
            self.field_size.height,
        )
    }

    fn field_wcs(&self, run: &SyntheticRun, field: u32) -> TanWcs {
        let frame = self.field_box(run, field);
        self.base_wcs.shifted(frame.x0 as f64, frame.y0 as f64)
    }

    fn render_field(
        &self,
        run: &SyntheticRun,
        field: u32,
    ) -> Result<(Array2<f32>, Array2<u32>), CollaboratorError> {
        let frame = self.field_box(run, field);
        let (mut image, mask) = self.scene.render(frame);
        image.indexed_iter_mut().for_each(|((iy, ix), value)| {
            let x = (frame.x0 + ix as i64) as f64;
            let y = (frame.y0 + iy as i64) as f64;
            *value += run.background.evaluate(x, y);
        });
        if self.noise_sigma > 0.0 {
            let seed = self.seed ^ ((run.run as u64) << 24) ^ field as u64;
            add_gaussian_noise(&mut image, self.noise_sigma, seed)
                .map_err(|e| CollaboratorError::Failed(format!("noise generation failed: {e}")))?;
        }
        Ok((image.mapv(|v| v as f32), mask))
    }

    fn load_planes(&self, id: &ExposureId) -> Option<(Array2<f32>, Array2<u32>)> {
        let run = self.find_run(id)?;
        match self.render_field(run, id.field) {
            Ok(planes) => Some(planes),
            Err(e) => {
                debug!("cannot render {id}: {e}");
                None
            }
        }
    }
}

impl CatalogQuery for SyntheticSurvey {
    fn query(
        &self,
        region: &SkyPolygon,
        filter: &str,
    ) -> Result<Vec<CatalogEntry>, CollaboratorError> {
        if region.vertices.is_empty() {
            return Err(CollaboratorError::Failed("empty query region".to_string()));
        }
        if filter != self.filter {
            return Ok(Vec::new());
        }

        // Bounding box of the region in survey-frame pixels
        let (mut x_min, mut x_max) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut y_min, mut y_max) = (f64::INFINITY, f64::NEG_INFINITY);
        for vertex in &region.vertices {
            let (x, y) = self.base_wcs.sky_to_pixel(*vertex);
            x_min = x_min.min(x);
            x_max = x_max.max(x);
            y_min = y_min.min(y);
            y_max = y_max.max(y);
        }
        let tol = 1e-6;

        let mut entries = Vec::new();
        for run in &self.runs {
            for field in run.fields.clone() {
                let frame = self.field_box(run, field);
                let overlaps = (frame.x0 as f64) <= x_max + tol
                    && (frame.x_max() as f64) >= x_min - tol
                    && (frame.y0 as f64) <= y_max + tol
                    && (frame.y_max() as f64) >= y_min - tol;
                if overlaps {
                    entries.push(CatalogEntry {
                        id: self.id(run.run, field),
                        strip: run.strip.clone(),
                        quality: run.quality,
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }
}

impl ExposureLoader for SyntheticSurvey {
    fn load_pixels(&self, id: &ExposureId) -> Option<Array2<f32>> {
        if self.is_missing(id, Component::Pixels) {
            return None;
        }
        self.load_planes(id).map(|(image, _)| image)
    }

    fn load_mask(&self, id: &ExposureId) -> Option<Array2<u32>> {
        if self.is_missing(id, Component::Mask) {
            return None;
        }
        self.load_planes(id).map(|(_, mask)| mask)
    }

    fn load_wcs(&self, id: &ExposureId) -> Option<Arc<dyn SkyMapping>> {
        if self.is_missing(id, Component::Wcs) {
            return None;
        }
        let run = self.find_run(id)?;
        Some(Arc::new(self.field_wcs(run, id.field)))
    }

    fn load_psf(&self, id: &ExposureId) -> Option<Arc<PsfModel>> {
        if self.is_missing(id, Component::Psf) {
            return None;
        }
        let run = self.find_run(id)?;
        Some(Arc::new(PsfModel::single_gaussian(15, run.psf_sigma)))
    }
}

/// PSF matcher that relabels the exposure with the target PSF.
///
/// Only correct when inputs already share the target PSF, as synthetic
/// exposures rendered from one scene do.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdoptTargetPsf;

impl PsfMatcher for AdoptTargetPsf {
    fn match_psf(
        &self,
        mut exposure: ExposureRecord,
        target: &PsfModel,
    ) -> Result<ExposureRecord, CollaboratorError> {
        exposure.psf = Arc::new(target.clone());
        Ok(exposure)
    }
}

/// Nearest-neighbour resampling through the sky.
///
/// Destination pixels whose source position falls outside the source grid
/// are NaN with the NO_DATA bit set. Only the [`NearestNeighborWarper::KERNEL`]
/// kernel is offered.
#[derive(Debug, Default, Clone, Copy)]
pub struct NearestNeighborWarper;

impl NearestNeighborWarper {
    pub const KERNEL: &'static str = "nearest";
}

impl Warper for NearestNeighborWarper {
    fn warp(
        &self,
        source: ExposureRecord,
        dest_bbox: PixelBox,
        dest_wcs: &Arc<dyn SkyMapping>,
        kernel: &str,
    ) -> Result<ExposureRecord, CollaboratorError> {
        if kernel != Self::KERNEL {
            return Err(CollaboratorError::UnsupportedKernel(kernel.to_string()));
        }
        let mut dest = MaskedImage::zeros(dest_bbox);
        let src = &source.masked;
        let (src_h, src_w) = src.image.dim();
        let no_data = MaskPlane::NoData.bit();

        Zip::indexed(&mut dest.image)
            .and(&mut dest.mask)
            .and(&mut dest.variance)
            .par_for_each(|(iy, ix), pixel, mask, variance| {
                let x = (dest_bbox.x0 + ix as i64) as f64;
                let y = (dest_bbox.y0 + iy as i64) as f64;
                let (sx, sy) = source.wcs.sky_to_pixel(dest_wcs.pixel_to_sky(x, y));
                let col = sx.round() as i64 - src.origin.0;
                let row = sy.round() as i64 - src.origin.1;
                if sx.is_finite()
                    && sy.is_finite()
                    && (0..src_w as i64).contains(&col)
                    && (0..src_h as i64).contains(&row)
                {
                    let index = [row as usize, col as usize];
                    *pixel = src.image[index];
                    *mask = src.mask[index];
                    *variance = src.variance[index];
                } else {
                    *pixel = f32::NAN;
                    *variance = f32::NAN;
                    *mask = no_data;
                }
            });

        let mut warped = ExposureRecord::new(dest, dest_wcs.clone(), source.psf.clone());
        warped.id = source.id.clone();
        Ok(warped)
    }
}

/// Sink that remembers what it was given.
#[derive(Debug, Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<(OutputKey, ManifestEntry)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<OutputKey> {
        self.entries
            .lock()
            .map(|entries| entries.iter().map(|(key, _)| key.clone()).collect())
            .unwrap_or_default()
    }

    pub fn entry(&self, key: &OutputKey) -> Option<ManifestEntry> {
        let entries = self.entries.lock().ok()?;
        entries.iter().find(|(k, _)| k == key).map(|(_, e)| e.clone())
    }
}

impl OutputSink for RecordingSink {
    fn persist(&self, key: &OutputKey, image: &MaskedImage) -> Result<(), CollaboratorError> {
        let entry = ManifestEntry::describe(key, image);
        self.entries
            .lock()
            .map_err(|_| CollaboratorError::Failed("recording sink lock poisoned".to_string()))?
            .push((key.clone(), entry));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::load_exposure;
    use approx::assert_relative_eq;

    fn survey() -> SyntheticSurvey {
        let size = ImageSize::from_width_height(64, 48);
        let extent = SyntheticSurvey::frame_extent(size, 8, 0..=6);
        let scene = SkyScene::random(extent, 12, 100.0, 9);
        SyntheticSurvey::new(
            size,
            8,
            scene,
            vec![
                SyntheticRun::new(94, "N", 0..=6),
                SyntheticRun::new(1755, "N", 0..=6)
                    .with_shift(3, -5)
                    .with_background(LinearBackground::constant(-12.0)),
            ],
        )
    }

    #[test]
    fn test_catalog_returns_neighbouring_fields() {
        let survey = survey();
        let reference = load_exposure(&survey, &survey.id(94, 3), 1.0).unwrap();
        let entries = survey.query(&SkyPolygon::from_exposure(&reference), "r").unwrap();

        let reference_fields: Vec<u32> = entries
            .iter()
            .filter(|e| e.id.run == 94)
            .map(|e| e.id.field)
            .collect();
        assert_eq!(reference_fields, vec![2, 3, 4]);
        assert!(entries.iter().any(|e| e.id.run == 1755));
        assert!(survey.query(&SkyPolygon::from_exposure(&reference), "g").unwrap().is_empty());
    }

    #[test]
    fn test_warp_aligns_shifted_run() {
        let survey = survey();
        let reference = load_exposure(&survey, &survey.id(94, 3), 1.0).unwrap();
        let candidate = load_exposure(&survey, &survey.id(1755, 3), 1.0).unwrap();

        let warped = NearestNeighborWarper
            .warp(candidate, reference.bbox(), &reference.wcs, NearestNeighborWarper::KERNEL)
            .unwrap();
        assert_eq!(warped.bbox(), reference.bbox());

        // Candidate covers survey rows shifted by -5 and columns by +3
        let no_data = MaskPlane::NoData.bit();
        assert_eq!(warped.mask()[[10, 1]], no_data);
        assert!(warped.image()[[10, 1]].is_nan());
        assert_eq!(warped.mask()[[47, 20]], no_data);
        assert_relative_eq!(
            warped.image()[[20, 20]],
            reference.image()[[20, 20]] - 12.0,
            epsilon = 1e-3
        );
    }

    #[test]
    fn test_warp_rejects_unsupported_kernel() {
        let survey = survey();
        let reference = load_exposure(&survey, &survey.id(94, 3), 1.0).unwrap();
        let candidate = load_exposure(&survey, &survey.id(1755, 3), 1.0).unwrap();

        let err = NearestNeighborWarper
            .warp(candidate, reference.bbox(), &reference.wcs, "lanczos3")
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::UnsupportedKernel(ref k) if k == "lanczos3"));
    }

    #[test]
    fn test_missing_component() {
        let survey = survey().with_missing(ExposureId::new(1755, 40, "r", 3, 2), Component::Mask);
        let id = survey.id(1755, 2);
        assert!(survey.load_pixels(&id).is_some());
        assert!(survey.load_mask(&id).is_none());
        assert!(survey.load_pixels(&survey.id(1755, 99)).is_none());
    }

    #[test]
    fn test_recording_sink_and_psf_matcher() {
        let survey = survey();
        let exposure = load_exposure(&survey, &survey.id(94, 1), 1.0).unwrap();
        let target = PsfModel::single_gaussian(31, 4.0);
        let matched = AdoptTargetPsf.match_psf(exposure, &target).unwrap();
        assert_eq!(*matched.psf, target);

        let sink = RecordingSink::new();
        let key = OutputKey::field(crate::naming::ProductKind::Exposure, 94, "r", 3, 1);
        sink.persist(&key, &matched.masked).unwrap();
        assert_eq!(sink.keys(), vec![key.clone()]);
        assert_eq!(sink.entry(&key).map(|e| e.width), Some(64));
    }
}
