//! Weighted coaddition of background-matched exposures.
//!
//! Every contributing exposure adds `weight · pixel` to a running sum and
//! `weight` to a running per-pixel weight, skipping pixels flagged with any
//! bad mask bit. Finalizing divides the two. Because `add` only ever sums,
//! the result does not depend on the order contributions arrive in, and
//! partial states built on different threads can be merged.

use log::debug;
use ndarray::{Array2, Zip};
use thiserror::Error;

use shared::exposure::MaskedImage;
use shared::image_size::PixelBox;
use shared::mask::MaskPlane;

/// Relative tolerance when deciding whether a pixel received the full weight
const FULL_WEIGHT_TOLERANCE: f64 = 1e-9;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AccumulateError {
    #[error("exposure covers {actual}, coadd covers {expected}")]
    ShapeMismatch { expected: PixelBox, actual: PixelBox },

    #[error("contribution weight must be positive and finite, got {0}")]
    InvalidWeight(f64),
}

/// Running sums of a coadd in progress.
#[derive(Debug, Clone, PartialEq)]
pub struct CoaddState {
    bbox: PixelBox,
    pixel_sum: Array2<f64>,
    weight_sum: Array2<f64>,
    /// Σ weight · variance
    variance_sum: Array2<f64>,
    mask_or: Array2<u32>,
    total_weight: f64,
    contributions: usize,
}

/// A finalized coadd and its per-pixel weight map.
#[derive(Debug, Clone)]
pub struct CoaddResult {
    pub exposure: MaskedImage,
    pub weight: Array2<f64>,
    pub contributions: usize,
}

impl CoaddState {
    /// Empty coadd over `bbox`.
    pub fn new(bbox: PixelBox) -> Self {
        let shape = bbox.size().shape();
        Self {
            bbox,
            pixel_sum: Array2::zeros(shape),
            weight_sum: Array2::zeros(shape),
            variance_sum: Array2::zeros(shape),
            mask_or: Array2::zeros(shape),
            total_weight: 0.0,
            contributions: 0,
        }
    }

    /// Coadd seeded with the reference at weight 1.
    pub fn from_reference(reference: &MaskedImage, bad_mask: u32) -> Result<Self, AccumulateError> {
        let mut state = Self::new(reference.bbox());
        state.add(reference, 1.0, bad_mask)?;
        Ok(state)
    }

    pub fn bbox(&self) -> PixelBox {
        self.bbox
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn contributions(&self) -> usize {
        self.contributions
    }

    /// Per-pixel accumulated weight so far
    pub fn weight(&self) -> &Array2<f64> {
        &self.weight_sum
    }

    /// Add one exposure with the given weight.
    ///
    /// Pixels with any bit of `bad_mask` set, or with a non-finite value or
    /// variance, contribute nothing. Contributing pixels OR their remaining
    /// mask bits into the coadd mask.
    ///
    /// Runs entirely on the calling thread and never enters the rayon pool.
    ///
    /// # Errors
    /// * `AccumulateError::ShapeMismatch` - exposure not on the coadd grid
    /// * `AccumulateError::InvalidWeight` - weight not positive and finite
    pub fn add(
        &mut self,
        exposure: &MaskedImage,
        weight: f64,
        bad_mask: u32,
    ) -> Result<(), AccumulateError> {
        if exposure.bbox() != self.bbox {
            return Err(AccumulateError::ShapeMismatch {
                expected: self.bbox,
                actual: exposure.bbox(),
            });
        }
        if !(weight.is_finite() && weight > 0.0) {
            return Err(AccumulateError::InvalidWeight(weight));
        }

        let usable = |pixel: f32, variance: f32, mask: u32| {
            mask & bad_mask == 0 && pixel.is_finite() && variance.is_finite()
        };

        Zip::from(&mut self.pixel_sum)
            .and(&mut self.weight_sum)
            .and(&mut self.variance_sum)
            .and(&exposure.image)
            .and(&exposure.variance)
            .and(&exposure.mask)
            .for_each(|sum, wsum, vsum, &pixel, &variance, &mask| {
                if usable(pixel, variance, mask) {
                    *sum += weight * pixel as f64;
                    *wsum += weight;
                    *vsum += weight * variance as f64;
                }
            });
        Zip::from(&mut self.mask_or)
            .and(&exposure.image)
            .and(&exposure.variance)
            .and(&exposure.mask)
            .for_each(|mask_or, &pixel, &variance, &mask| {
                if usable(pixel, variance, mask) {
                    *mask_or |= mask & !bad_mask;
                }
            });

        self.total_weight += weight;
        self.contributions += 1;
        debug!(
            "coadd contribution {} added with weight {weight}",
            self.contributions
        );
        Ok(())
    }

    /// Fold another partial coadd over the same grid into this one.
    pub fn merge(&mut self, other: CoaddState) -> Result<(), AccumulateError> {
        if other.bbox != self.bbox {
            return Err(AccumulateError::ShapeMismatch {
                expected: self.bbox,
                actual: other.bbox,
            });
        }
        self.pixel_sum += &other.pixel_sum;
        self.weight_sum += &other.weight_sum;
        self.variance_sum += &other.variance_sum;
        Zip::from(&mut self.mask_or)
            .and(&other.mask_or)
            .for_each(|a, &b| *a |= b);
        self.total_weight += other.total_weight;
        self.contributions += other.contributions;
        Ok(())
    }

    /// Divide out the weights.
    ///
    /// Pixels that received no weight are NaN and flagged NO_DATA. Pixels
    /// that received less than the total contributed weight are flagged EDGE.
    pub fn finalize(self) -> CoaddResult {
        let shape = self.bbox.size().shape();
        let mut image = Array2::<f32>::zeros(shape);
        let mut variance = Array2::<f32>::zeros(shape);
        let mut mask = self.mask_or;
        let full_weight = self.total_weight * (1.0 - FULL_WEIGHT_TOLERANCE);
        let edge = MaskPlane::Edge.bit();
        let no_data = MaskPlane::NoData.bit();

        Zip::from(&mut image)
            .and(&mut variance)
            .and(&mut mask)
            .and(&self.pixel_sum)
            .and(&self.weight_sum)
            .and(&self.variance_sum)
            .par_for_each(|pixel, var, bits, &sum, &wsum, &vsum| {
                if wsum > 0.0 {
                    *pixel = (sum / wsum) as f32;
                    *var = (vsum / (wsum * wsum)) as f32;
                } else {
                    *pixel = f32::NAN;
                    *var = f32::NAN;
                    *bits |= no_data;
                }
                if wsum < full_weight {
                    *bits |= edge;
                }
            });

        CoaddResult {
            exposure: MaskedImage {
                image,
                mask,
                variance,
                origin: (self.bbox.x0, self.bbox.y0),
            },
            weight: self.weight_sum,
            contributions: self.contributions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn constant(bbox: PixelBox, value: f32, variance: f32) -> MaskedImage {
        let mut masked = MaskedImage::zeros(bbox);
        masked.image.fill(value);
        masked.variance.fill(variance);
        masked
    }

    fn bad() -> u32 {
        MaskPlane::Bad.bit() | MaskPlane::Sat.bit() | MaskPlane::NoData.bit()
    }

    #[test]
    fn test_weighting_law() {
        let bbox = PixelBox::new(0, 0, 5, 4);
        let mut state = CoaddState::new(bbox);
        state.add(&constant(bbox, 10.0, 2.0), 1.0, bad()).unwrap();
        state.add(&constant(bbox, 20.0, 4.0), 1.0, bad()).unwrap();

        let result = state.finalize();
        assert_eq!(result.contributions, 2);
        for (&pixel, &weight) in result.exposure.image.iter().zip(result.weight.iter()) {
            assert_relative_eq!(pixel, 15.0);
            assert_relative_eq!(weight, 2.0);
        }
        // (2 + 4) / 2²
        assert!(result.exposure.variance.iter().all(|&v| (v - 1.5).abs() < 1e-6));
        assert!(result.exposure.mask.iter().all(|&m| m == 0));
    }

    #[test]
    fn test_unequal_weights() {
        let bbox = PixelBox::new(0, 0, 2, 2);
        let mut state = CoaddState::new(bbox);
        state.add(&constant(bbox, 0.0, 1.0), 3.0, bad()).unwrap();
        state.add(&constant(bbox, 4.0, 1.0), 1.0, bad()).unwrap();
        let result = state.finalize();
        assert_relative_eq!(result.exposure.image[[1, 1]], 1.0);
        assert_relative_eq!(result.weight[[1, 1]], 4.0);
    }

    #[test]
    fn test_masked_row_is_excluded() {
        let bbox = PixelBox::new(3, 7, 4, 3);
        let reference = constant(bbox, 10.0, 1.0);
        let mut candidate = constant(bbox, 30.0, 1.0);
        candidate.mask.row_mut(1).fill(MaskPlane::Sat.bit());

        let mut state = CoaddState::from_reference(&reference, bad()).unwrap();
        state.add(&candidate, 1.0, bad()).unwrap();
        let result = state.finalize();

        for x in 0..4 {
            assert_relative_eq!(result.exposure.image[[0, x]], 20.0);
            assert_relative_eq!(result.exposure.image[[1, x]], 10.0);
            assert_relative_eq!(result.weight[[1, x]], 1.0);
            // Bad bits never reach the coadd mask; the shortfall in weight does
            assert_eq!(result.exposure.mask[[1, x]], MaskPlane::Edge.bit());
            assert_eq!(result.exposure.mask[[0, x]], 0);
        }
    }

    #[test]
    fn test_uncovered_pixels_are_nan_and_flagged() {
        let bbox = PixelBox::new(0, 0, 3, 1);
        let mut image = constant(bbox, 5.0, 1.0);
        image.mask[[0, 2]] = MaskPlane::NoData.bit();
        image.image[[0, 1]] = f32::NAN;

        let mut state = CoaddState::new(bbox);
        state.add(&image, 1.0, bad()).unwrap();
        let result = state.finalize();

        assert_relative_eq!(result.exposure.image[[0, 0]], 5.0);
        assert!(result.exposure.image[[0, 1]].is_nan());
        assert!(result.exposure.image[[0, 2]].is_nan());
        let flagged = MaskPlane::Edge.bit() | MaskPlane::NoData.bit();
        assert_eq!(result.exposure.mask[[0, 1]], flagged);
        assert_eq!(result.exposure.mask[[0, 2]], flagged);
        assert_eq!(result.exposure.mask[[0, 0]], 0);
    }

    #[test]
    fn test_informational_bits_propagate() {
        let bbox = PixelBox::new(0, 0, 2, 1);
        let mut image = constant(bbox, 1.0, 1.0);
        image.mask[[0, 0]] = MaskPlane::Detected.bit();
        let mut state = CoaddState::new(bbox);
        state.add(&image, 1.0, bad()).unwrap();
        let result = state.finalize();
        assert_eq!(result.exposure.mask[[0, 0]], MaskPlane::Detected.bit());
    }

    #[test]
    fn test_merge_equals_sequential() {
        let bbox = PixelBox::new(0, 0, 6, 5);
        let images: Vec<_> = (0..4)
            .map(|i| {
                let mut m = constant(bbox, i as f32 * 3.0 + 1.0, 0.5 + i as f32);
                m.mask[[i, i]] = MaskPlane::Bad.bit();
                m
            })
            .collect();

        let mut sequential = CoaddState::new(bbox);
        for (i, image) in images.iter().enumerate() {
            sequential.add(image, 1.0 + i as f64, bad()).unwrap();
        }

        let mut left = CoaddState::new(bbox);
        let mut right = CoaddState::new(bbox);
        for (i, image) in images.iter().enumerate().rev() {
            let target = if i % 2 == 0 { &mut left } else { &mut right };
            target.add(image, 1.0 + i as f64, bad()).unwrap();
        }
        left.merge(right).unwrap();

        assert_relative_eq!(left.total_weight(), sequential.total_weight());
        let (a, b) = (left.finalize(), sequential.finalize());
        assert_eq!(a.exposure.mask, b.exposure.mask);
        for (x, y) in a.exposure.image.iter().zip(b.exposure.image.iter()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_rejects_wrong_grid_and_weight() {
        let mut state = CoaddState::new(PixelBox::new(0, 0, 4, 4));
        let err = state
            .add(&constant(PixelBox::new(0, 0, 4, 5), 1.0, 1.0), 1.0, 0)
            .unwrap_err();
        assert!(matches!(err, AccumulateError::ShapeMismatch { .. }));

        let err = state
            .add(&constant(PixelBox::new(0, 0, 4, 4), 1.0, 1.0), 0.0, 0)
            .unwrap_err();
        assert_eq!(err, AccumulateError::InvalidWeight(0.0));
        assert_eq!(state.contributions(), 0);
    }
}
