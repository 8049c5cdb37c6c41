//! Background matching against a reference exposure
//!
//! A candidate that has been warped onto the reference grid generally sits on
//! a different sky level, and that level may vary smoothly across the field.
//! [`BackgroundMatcher`] measures `reference - candidate` over clean sky in
//! square bins, fits a low-order Chebyshev surface to the bin means with
//! inverse-variance weights, and adds the surface to the candidate.
//!
//! Only the image plane of the candidate is modified. Mask and variance pass
//! through untouched.

mod binning;
mod solver;

pub use binning::{bin_count, bin_observations, clean_sky_mask, BinObservation};
pub use solver::{fit_surface, BackgroundModel, FitError};

use log::debug;
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use coadd_math::{Domain2D, SampleStats};
use shared::exposure::{ExposureRecord, MaskedImage};
use shared::image_size::PixelBox;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackgroundError {
    #[error(transparent)]
    Fit(#[from] FitError),

    #[error("candidate covers {actual}, reference covers {expected}")]
    GeometryMismatch { expected: PixelBox, actual: PixelBox },
}

/// Statistics of `corrected - reference` over clean sky
pub type ResidualStats = SampleStats;

/// A candidate with its background brought onto the reference's.
#[derive(Debug, Clone)]
pub struct MatchedExposure {
    pub exposure: ExposureRecord,
    pub model: BackgroundModel,
    /// `None` when no clean pixel survived
    pub residuals: Option<ResidualStats>,
}

/// Fits and applies background-correction surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackgroundMatcher {
    /// Chebyshev order of the correction surface
    pub order: usize,
    /// Bin edge length in pixels
    pub bin_size: usize,
    /// Lower bound on a bin's uncertainty when forming weights
    pub uncertainty_floor: f64,
    /// Smallest acceptable reciprocal condition number of the normal matrix
    pub min_rcond: f64,
}

impl Default for BackgroundMatcher {
    fn default() -> Self {
        Self {
            order: 1,
            bin_size: 256,
            uncertainty_floor: 1e-3,
            min_rcond: 1e-12,
        }
    }
}

impl BackgroundMatcher {
    pub fn new(order: usize, bin_size: usize) -> Self {
        Self {
            order,
            bin_size,
            ..Self::default()
        }
    }

    /// Fit the correction surface for `candidate` given a clean-sky mask.
    pub fn fit(
        &self,
        reference: &MaskedImage,
        candidate: &MaskedImage,
        clean: &Array2<bool>,
    ) -> Result<BackgroundModel, FitError> {
        let observations = bin_observations(reference, candidate, clean, self.bin_size);
        let bbox = reference.bbox();
        let domain = Domain2D::from_pixel_box(bbox.x0, bbox.y0, bbox.width, bbox.height);
        debug!(
            "fitting order {} background to {} bins over {}",
            self.order,
            observations.len(),
            bbox
        );
        fit_surface(
            &observations,
            self.order,
            domain,
            self.uncertainty_floor,
            self.min_rcond,
        )
    }

    /// Match one candidate against the reference.
    ///
    /// Consumes the candidate and returns it corrected.
    ///
    /// # Errors
    /// * `BackgroundError::GeometryMismatch` - candidate not on the reference grid
    /// * `BackgroundError::Fit` - too few usable bins, or a singular fit
    pub fn solve(
        &self,
        reference: &ExposureRecord,
        candidate: ExposureRecord,
    ) -> Result<MatchedExposure, BackgroundError> {
        check_geometry(reference, &candidate)?;
        let clean = clean_sky_mask(&reference.masked, [&candidate.masked]);
        let model = self.fit(&reference.masked, &candidate.masked, &clean)?;
        Ok(apply(reference, candidate, model, &clean))
    }

    /// Match several candidates against the reference at once.
    ///
    /// Clean sky is the set of pixels unmasked in the reference and in every
    /// candidate on the reference grid, so all fits see the same pixels.
    /// Each candidate still gets its own surface; results keep input order.
    pub fn solve_batch(
        &self,
        reference: &ExposureRecord,
        candidates: Vec<ExposureRecord>,
    ) -> Vec<Result<MatchedExposure, BackgroundError>> {
        let clean = clean_sky_mask(
            &reference.masked,
            candidates
                .iter()
                .filter(|c| c.bbox() == reference.bbox())
                .map(|c| &c.masked),
        );

        candidates
            .into_iter()
            .map(|candidate| {
                check_geometry(reference, &candidate)?;
                let model = self.fit(&reference.masked, &candidate.masked, &clean)?;
                Ok(apply(reference, candidate, model, &clean))
            })
            .collect()
    }
}

fn check_geometry(
    reference: &ExposureRecord,
    candidate: &ExposureRecord,
) -> Result<(), BackgroundError> {
    let (expected, actual) = (reference.bbox(), candidate.bbox());
    if expected != actual {
        return Err(BackgroundError::GeometryMismatch { expected, actual });
    }
    Ok(())
}

fn apply(
    reference: &ExposureRecord,
    mut candidate: ExposureRecord,
    model: BackgroundModel,
    clean: &Array2<bool>,
) -> MatchedExposure {
    let correction = model.render(candidate.bbox());
    Zip::from(&mut candidate.masked.image)
        .and(&correction)
        .par_for_each(|pixel, &c| *pixel = (*pixel as f64 + c) as f32);

    let mut residuals = Vec::new();
    Zip::from(&candidate.masked.image)
        .and(&reference.masked.image)
        .and(clean)
        .for_each(|&corrected, &r, &ok| {
            if ok {
                residuals.push(corrected as f64 - r as f64);
            }
        });

    MatchedExposure {
        exposure: candidate,
        model,
        residuals: SampleStats::from_samples(&residuals),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use shared::psf::PsfModel;
    use shared::synthetic::{add_gaussian_noise, SkyScene};
    use shared::wcs::{SkyMapping, TanWcs};
    use std::sync::Arc;

    fn exposure_from(image: Array2<f64>, mask: Array2<u32>, bbox: PixelBox) -> ExposureRecord {
        let image = image.mapv(|v| v as f32);
        let variance = image.mapv(|v| v.max(1.0));
        let masked = MaskedImage::from_planes(image, mask, variance, (bbox.x0, bbox.y0)).unwrap();
        let wcs: Arc<dyn SkyMapping> = Arc::new(TanWcs::with_scale((0.0, 0.0), (30.0, 5.0), 1e-4));
        ExposureRecord::new(masked, wcs, Arc::new(PsfModel::single_gaussian(7, 1.5)))
    }

    #[test]
    fn test_order_zero_constant_offset_is_removed() {
        let bbox = PixelBox::new(0, 0, 128, 96);
        let scene = SkyScene::random(bbox, 15, 100.0, 11);
        let (sky, mask) = scene.render(bbox);
        let reference = exposure_from(sky.clone(), mask.clone(), bbox);
        let candidate = exposure_from(sky.mapv(|v| v - 7.0), mask, bbox);

        let matcher = BackgroundMatcher::new(0, 32);
        let matched = matcher.solve(&reference, candidate).unwrap();

        assert_eq!(matched.model.coefficients().len(), 1);
        assert_relative_eq!(matched.model.coefficients()[0], 7.0, epsilon = 1e-4);
        for (a, b) in matched.exposure.image().iter().zip(reference.image().iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-3);
        }
        let residuals = matched.residuals.unwrap();
        assert_relative_eq!(residuals.mean, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn test_order_one_gradient_recovered_under_noise() {
        let bbox = PixelBox::new(0, 0, 256, 256);
        let scene = SkyScene::random(bbox, 30, 200.0, 5);
        let (sky, mask) = scene.render(bbox);
        let gradient = |x: f64, y: f64| 4.0 + 0.01 * x - 0.02 * y;

        let mut reference_image = sky.clone();
        add_gaussian_noise(&mut reference_image, 1.0, 1).unwrap();
        let mut candidate_image =
            Array2::from_shape_fn(sky.dim(), |(y, x)| sky[[y, x]] - gradient(x as f64, y as f64));
        add_gaussian_noise(&mut candidate_image, 1.0, 2).unwrap();

        let reference = exposure_from(reference_image, mask.clone(), bbox);
        let candidate = exposure_from(candidate_image, mask, bbox);
        let matched = BackgroundMatcher::new(1, 32).solve(&reference, candidate).unwrap();

        for (x, y) in [(16.0, 16.0), (128.0, 128.0), (240.0, 30.0)] {
            assert_relative_eq!(matched.model.evaluate(x, y), gradient(x, y), epsilon = 0.1);
        }
        let residuals = matched.residuals.unwrap();
        assert_relative_eq!(residuals.mean, 0.0, epsilon = 0.05);
        assert_relative_eq!(residuals.std_dev, 2f64.sqrt(), epsilon = 0.1);
    }

    #[test]
    fn test_masked_pixels_do_not_bias_fit() {
        let bbox = PixelBox::new(0, 0, 64, 64);
        let reference =
            exposure_from(Array2::from_elem((64, 64), 50.0), Array2::zeros((64, 64)), bbox);
        let mut candidate_image = Array2::from_elem((64, 64), 45.0);
        let mut candidate_mask = Array2::zeros((64, 64));
        // A saturated blob in the candidate that would drag the mean far off
        for y in 10..20 {
            for x in 10..20 {
                candidate_image[[y, x]] = 60_000.0;
                candidate_mask[[y, x]] = shared::mask::MaskPlane::Sat.bit();
            }
        }
        let candidate = exposure_from(candidate_image, candidate_mask, bbox);
        let matched = BackgroundMatcher::new(0, 16).solve(&reference, candidate).unwrap();
        assert_relative_eq!(matched.model.coefficients()[0], 5.0, epsilon = 1e-6);
        // The mask plane passes through untouched
        assert_eq!(matched.exposure.mask()[[15, 15]], shared::mask::MaskPlane::Sat.bit());
    }

    #[test]
    fn test_singular_fit_is_reported() {
        let bbox = PixelBox::new(0, 0, 50, 10);
        let reference =
            exposure_from(Array2::from_elem((10, 50), 10.0), Array2::zeros((10, 50)), bbox);
        let candidate =
            exposure_from(Array2::from_elem((10, 50), 9.0), Array2::zeros((10, 50)), bbox);

        let err = BackgroundMatcher::new(3, 10).solve(&reference, candidate).unwrap_err();
        assert_eq!(
            err,
            BackgroundError::Fit(FitError::InsufficientBins { bins: 5, terms: 16 })
        );
    }

    #[test]
    fn test_geometry_mismatch() {
        let blank = || (Array2::zeros((10, 10)), Array2::zeros((10, 10)));
        let (image, mask) = blank();
        let reference = exposure_from(image, mask, PixelBox::new(0, 0, 10, 10));
        let (image, mask) = blank();
        let candidate = exposure_from(image, mask, PixelBox::new(1, 0, 10, 10));
        let err = BackgroundMatcher::new(0, 5).solve(&reference, candidate).unwrap_err();
        assert!(matches!(err, BackgroundError::GeometryMismatch { .. }));
    }

    #[test]
    fn test_batch_uses_union_of_candidate_masks() {
        let bbox = PixelBox::new(0, 0, 32, 32);
        let reference =
            exposure_from(Array2::from_elem((32, 32), 20.0), Array2::zeros((32, 32)), bbox);

        // Candidate A has a bright unmasked patch exactly where B is masked
        let mut a_image = Array2::from_elem((32, 32), 18.0);
        for y in 0..16 {
            for x in 0..16 {
                a_image[[y, x]] = 1000.0;
            }
        }
        let a = exposure_from(a_image, Array2::zeros((32, 32)), bbox);
        let mut b_mask = Array2::zeros((32, 32));
        for y in 0..16 {
            for x in 0..16 {
                b_mask[[y, x]] = 1;
            }
        }
        let b = exposure_from(Array2::from_elem((32, 32), 21.0), b_mask, bbox);

        let results = BackgroundMatcher::new(0, 8).solve_batch(&reference, vec![a, b]);
        assert_eq!(results.len(), 2);
        let a = results[0].as_ref().unwrap();
        let b = results[1].as_ref().unwrap();
        assert_relative_eq!(a.model.coefficients()[0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(b.model.coefficients()[0], -1.0, epsilon = 1e-6);
    }
}
