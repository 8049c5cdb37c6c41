//! Mosaic stitching of along-strip sub-images from one imaging run.
//!
//! Consecutive fields of a drift-scan run overlap by a fixed number of rows.
//! Stitching stacks them vertically, keeping the overlap rows of the earlier
//! sub-image and skipping them in the later one:
//!
//! ```text
//! height = Σ hᵢ - overlap · (n - 1)
//! sub-image i -> mosaic rows [i·h - i·o, (i+1)·h - i·o)
//! ```
//!
//! The mosaic inherits world mapping, PSF, identity and origin from the first
//! sub-image.

use ndarray::{s, Array2};
use thiserror::Error;

use shared::exposure::{ExposureRecord, MaskedImage};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StitchError {
    #[error("no sub-images to stitch")]
    Empty,

    #[error("sub-image {index} is {actual} pixels wide, expected {expected}")]
    WidthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("sub-image {index} is {actual} pixels high, expected {expected}")]
    HeightMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("overlap of {overlap} rows does not fit sub-images {height} rows high")]
    OverlapTooLarge { overlap: usize, height: usize },
}

/// Height of a mosaic built from `count` sub-images of `height` rows each.
pub fn stitched_height(count: usize, height: usize, overlap: usize) -> usize {
    if count == 0 {
        return 0;
    }
    count * height - overlap * (count - 1)
}

fn check_geometry(
    sub_images: &[ExposureRecord],
    overlap_px: usize,
) -> Result<(usize, usize), StitchError> {
    let first = sub_images.first().ok_or(StitchError::Empty)?;
    let (width, height) = (first.width(), first.height());

    for (index, sub) in sub_images.iter().enumerate().skip(1) {
        if sub.width() != width {
            return Err(StitchError::WidthMismatch {
                index,
                expected: width,
                actual: sub.width(),
            });
        }
        if sub.height() != height {
            return Err(StitchError::HeightMismatch {
                index,
                expected: height,
                actual: sub.height(),
            });
        }
    }

    if sub_images.len() > 1 && overlap_px >= height {
        return Err(StitchError::OverlapTooLarge {
            overlap: overlap_px,
            height,
        });
    }
    Ok((width, height))
}

/// Stitch sub-images, ordered by field ascending, into one mosaic.
///
/// Takes ownership of the sub-images; each is dropped as soon as its rows
/// have been copied.
///
/// # Errors
/// * `StitchError::Empty` - no sub-images
/// * `StitchError::WidthMismatch` / `StitchError::HeightMismatch` - sub-images differ in shape
/// * `StitchError::OverlapTooLarge` - `overlap_px` is not smaller than the sub-image height
pub fn stitch(
    sub_images: Vec<ExposureRecord>,
    overlap_px: usize,
) -> Result<ExposureRecord, StitchError> {
    let (width, height) = check_geometry(&sub_images, overlap_px)?;
    let mosaic_height = stitched_height(sub_images.len(), height, overlap_px);

    let mut image = Array2::<f32>::zeros((mosaic_height, width));
    let mut mask = Array2::<u32>::zeros((mosaic_height, width));
    let mut variance = Array2::<f32>::zeros((mosaic_height, width));

    let mut subs = sub_images.into_iter();
    let first = subs.next().ok_or(StitchError::Empty)?;
    let (id, wcs, psf, origin) = (
        first.id.clone(),
        first.wcs.clone(),
        first.psf.clone(),
        first.masked.origin,
    );

    for (i, sub) in std::iter::once(first).chain(subs).enumerate() {
        let skip = if i == 0 { 0 } else { overlap_px };
        let dest_start = i * height - i * overlap_px + skip;
        let dest_end = (i + 1) * height - i * overlap_px;

        let planes = &sub.masked;
        image
            .slice_mut(s![dest_start..dest_end, ..])
            .assign(&planes.image.slice(s![skip.., ..]));
        mask.slice_mut(s![dest_start..dest_end, ..])
            .assign(&planes.mask.slice(s![skip.., ..]));
        variance
            .slice_mut(s![dest_start..dest_end, ..])
            .assign(&planes.variance.slice(s![skip.., ..]));
        drop(sub);
    }

    let masked = MaskedImage {
        image,
        mask,
        variance,
        origin,
    };
    let mut mosaic = ExposureRecord::new(masked, wcs, psf);
    mosaic.id = id;
    Ok(mosaic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::exposure::ExposureId;
    use shared::psf::PsfModel;
    use shared::wcs::{SkyMapping, TanWcs};
    use std::sync::Arc;

    fn sub_image(width: usize, height: usize, field: u32) -> ExposureRecord {
        let image = Array2::from_shape_fn((height, width), |(y, x)| {
            (field * 10_000 + y as u32 * 10 + x as u32) as f32
        });
        let mask = Array2::from_elem((height, width), field);
        let variance = Array2::from_elem((height, width), field as f32 + 0.5);
        let masked = MaskedImage::from_planes(image, mask, variance, (0, 0)).unwrap();
        let wcs: Arc<dyn SkyMapping> =
            Arc::new(TanWcs::with_scale((0.0, 0.0), (10.0 + field as f64, 0.0), 1e-4));
        ExposureRecord::new(masked, wcs, Arc::new(PsfModel::single_gaussian(5, 1.0)))
            .with_id(ExposureId::new(1755, 40, "r", 3, field))
    }

    #[test]
    fn test_dimension_law() {
        for n in 1..5 {
            let subs: Vec<_> = (0..n).map(|f| sub_image(7, 30, f as u32)).collect();
            let mosaic = stitch(subs, 8).unwrap();
            assert_eq!(mosaic.width(), 7);
            assert_eq!(mosaic.height(), n * 30 - 8 * (n - 1));
            assert_eq!(mosaic.height(), stitched_height(n, 30, 8));
        }
    }

    #[test]
    fn test_content_law_two_sub_images() {
        let a = sub_image(4, 100, 1);
        let b = sub_image(4, 100, 2);
        let a_image = a.image().clone();
        let b_image = b.image().clone();

        let mosaic = stitch(vec![a, b], 20).unwrap();
        assert_eq!(mosaic.height(), 180);

        // Rows 0..100 come from A, including A's overlap rows 80..100
        for y in 0..100 {
            for x in 0..4 {
                assert_eq!(mosaic.image()[[y, x]], a_image[[y, x]]);
                assert_eq!(mosaic.mask()[[y, x]], 1);
            }
        }
        // Rows 100..180 are B's rows 20..100
        for y in 100..180 {
            for x in 0..4 {
                assert_eq!(mosaic.image()[[y, x]], b_image[[y - 80, x]]);
                assert_eq!(mosaic.mask()[[y, x]], 2);
                assert_eq!(mosaic.variance()[[y, x]], 2.5);
            }
        }
    }

    #[test]
    fn test_metadata_from_first_sub_image() {
        let a = sub_image(4, 10, 11);
        let expected_wcs = a.wcs.pixel_to_sky(2.0, 3.0);
        let mosaic = stitch(vec![a, sub_image(4, 10, 12)], 2).unwrap();
        assert_eq!(mosaic.id.as_ref().map(|id| id.field), Some(11));
        assert_eq!(mosaic.wcs.pixel_to_sky(2.0, 3.0), expected_wcs);
        assert_eq!(mosaic.masked.origin, (0, 0));
    }

    #[test]
    fn test_single_sub_image_is_unchanged() {
        let a = sub_image(3, 5, 4);
        let image = a.image().clone();
        let mosaic = stitch(vec![a], 10).unwrap();
        assert_eq!(mosaic.image(), &image);
    }

    #[test]
    fn test_preconditions() {
        assert_eq!(stitch(Vec::new(), 0).unwrap_err(), StitchError::Empty);

        let err = stitch(vec![sub_image(4, 10, 1), sub_image(5, 10, 2)], 2).unwrap_err();
        assert_eq!(
            err,
            StitchError::WidthMismatch {
                index: 1,
                expected: 4,
                actual: 5
            }
        );

        let err = stitch(vec![sub_image(4, 10, 1), sub_image(4, 12, 2)], 2).unwrap_err();
        assert!(matches!(err, StitchError::HeightMismatch { index: 1, .. }));

        let err = stitch(vec![sub_image(4, 10, 1), sub_image(4, 10, 2)], 10).unwrap_err();
        assert_eq!(
            err,
            StitchError::OverlapTooLarge {
                overlap: 10,
                height: 10
            }
        );
    }
}
