//! Clean-sky selection and binned difference statistics.

use ndarray::{s, Array2, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use coadd_math::mean_and_std;
use shared::exposure::MaskedImage;

/// Background difference measured over one bin of clean sky.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinObservation {
    /// Bin center, parent pixel coordinates
    pub x: f64,
    pub y: f64,
    /// Mean of `reference - candidate` over the bin's clean pixels
    pub value: f64,
    /// Population standard deviation of the same differences
    pub uncertainty: f64,
    pub n_pixels: usize,
}

/// Pixels that are unmasked in the reference and in every candidate.
///
/// All planes must share the reference's shape; the caller checks geometry.
pub fn clean_sky_mask<'a, I>(reference: &MaskedImage, candidates: I) -> Array2<bool>
where
    I: IntoIterator<Item = &'a MaskedImage>,
{
    let mut union = reference.mask.clone();
    for candidate in candidates {
        Zip::from(&mut union)
            .and(&candidate.mask)
            .for_each(|u, &m| *u |= m);
    }
    union.mapv(|bits| bits == 0)
}

/// Number of bins along an axis of `length` pixels; a trailing partial bin counts.
pub fn bin_count(length: usize, bin_size: usize) -> usize {
    length.div_ceil(bin_size)
}

/// Mean and spread of `reference - candidate` over the clean pixels of every bin.
///
/// Bins tile the grid from its origin in steps of `bin_size`; the last bin on
/// each axis is clipped to the grid. A bin spanning columns `[min, end)` is
/// centered at `origin + (min + end) / 2`. Bins without a single clean, finite
/// difference produce no observation. Observations are ordered row-major by bin.
pub fn bin_observations(
    reference: &MaskedImage,
    candidate: &MaskedImage,
    clean: &Array2<bool>,
    bin_size: usize,
) -> Vec<BinObservation> {
    let (height, width) = reference.image.dim();
    let bin_size = bin_size.max(1);
    let nx = bin_count(width, bin_size);
    let ny = bin_count(height, bin_size);
    let (x0, y0) = (reference.origin.0 as f64, reference.origin.1 as f64);

    (0..nx * ny)
        .into_par_iter()
        .filter_map(|index| {
            let (bx, by) = (index % nx, index / nx);
            let (x_min, y_min) = (bx * bin_size, by * bin_size);
            let x_end = (x_min + bin_size).min(width);
            let y_end = (y_min + bin_size).min(height);

            let window = s![y_min..y_end, x_min..x_end];
            let mut differences = Vec::with_capacity((x_end - x_min) * (y_end - y_min));
            Zip::from(reference.image.slice(window))
                .and(candidate.image.slice(window))
                .and(clean.slice(window))
                .for_each(|&r, &c, &ok| {
                    let diff = r as f64 - c as f64;
                    if ok && diff.is_finite() {
                        differences.push(diff);
                    }
                });

            let (value, uncertainty) = mean_and_std(&differences)?;
            Some(BinObservation {
                x: x0 + 0.5 * (x_min + x_end) as f64,
                y: y0 + 0.5 * (y_min + y_end) as f64,
                value,
                uncertainty,
                n_pixels: differences.len(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use shared::image_size::PixelBox;

    fn flat(bbox: PixelBox, level: f32) -> MaskedImage {
        let mut masked = MaskedImage::zeros(bbox);
        masked.image.fill(level);
        masked
    }

    #[test]
    fn test_clean_mask_is_union_of_all_masks() {
        let bbox = PixelBox::new(0, 0, 3, 2);
        let mut reference = flat(bbox, 0.0);
        let mut a = flat(bbox, 0.0);
        let mut b = flat(bbox, 0.0);
        reference.mask[[0, 0]] = 1;
        a.mask[[1, 1]] = 4;
        b.mask[[0, 2]] = 256;

        let clean = clean_sky_mask(&reference, [&a, &b]);
        let expected = ndarray::arr2(&[[false, true, false], [true, false, true]]);
        assert_eq!(clean, expected);
    }

    #[test]
    fn test_partial_bins_are_included_and_clipped() {
        let bbox = PixelBox::new(100, 200, 25, 10);
        let reference = flat(bbox, 5.0);
        let candidate = flat(bbox, 2.0);
        let clean = clean_sky_mask(&reference, [&candidate]);

        let observations = bin_observations(&reference, &candidate, &clean, 10);
        assert_eq!(observations.len(), 3);

        // Full bins cover columns 0..10 and 10..20, the partial one 20..25
        assert_relative_eq!(observations[0].x, 105.0);
        assert_relative_eq!(observations[1].x, 115.0);
        assert_relative_eq!(observations[2].x, 122.5);
        assert_eq!(observations[2].n_pixels, 50);
        for obs in &observations {
            assert_relative_eq!(obs.y, 205.0);
            assert_relative_eq!(obs.value, 3.0);
            assert_relative_eq!(obs.uncertainty, 0.0);
        }
    }

    #[test]
    fn test_fully_masked_bin_has_no_observation() {
        let bbox = PixelBox::new(0, 0, 20, 10);
        let mut reference = flat(bbox, 1.0);
        let candidate = flat(bbox, 0.0);
        reference.mask.slice_mut(s![.., 10..]).fill(1);
        let clean = clean_sky_mask(&reference, [&candidate]);

        let observations = bin_observations(&reference, &candidate, &clean, 10);
        assert_eq!(observations.len(), 1);
        assert_relative_eq!(observations[0].x, 5.0);
    }

    #[test]
    fn test_full_bins_are_centered_on_their_midpoint() {
        let bbox = PixelBox::new(0, 0, 512, 256);
        let reference = flat(bbox, 1.0);
        let candidate = flat(bbox, 0.0);
        let clean = clean_sky_mask(&reference, [&candidate]);

        let centers: Vec<(f64, f64)> = bin_observations(&reference, &candidate, &clean, 256)
            .iter()
            .map(|o| (o.x, o.y))
            .collect();
        assert_eq!(centers, vec![(128.0, 128.0), (384.0, 128.0)]);
    }

    #[test]
    fn test_bin_statistics_use_population_std() {
        let bbox = PixelBox::new(0, 0, 2, 1);
        let mut reference = flat(bbox, 0.0);
        reference.image[[0, 0]] = 1.0;
        reference.image[[0, 1]] = 3.0;
        let candidate = flat(bbox, 0.0);
        let clean = clean_sky_mask(&reference, [&candidate]);

        let observations = bin_observations(&reference, &candidate, &clean, 4);
        assert_eq!(observations.len(), 1);
        assert_relative_eq!(observations[0].value, 2.0);
        assert_relative_eq!(observations[0].uncertainty, 1.0);
        assert_relative_eq!(observations[0].x, 1.0);
        assert_relative_eq!(observations[0].y, 0.5);
    }
}
