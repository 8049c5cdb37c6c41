//! In-memory exposures: pixel, mask and variance planes plus metadata.
//!
//! An [`ExposureRecord`] is owned by exactly one pipeline stage at a time.
//! Stages take it by value and either hand it on or drop it, so the planes of
//! an intermediate are freed as soon as the next stage has consumed them.
//! The world mapping and PSF are reference-counted because several stitched
//! and warped products legitimately share them.

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::image_size::{ImageSize, PixelBox};
use crate::psf::PsfModel;
use crate::wcs::SkyMapping;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExposureError {
    #[error("{plane} plane has shape {actual:?}, expected {expected:?}")]
    PlaneShape {
        plane: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("gain must be positive and finite")]
    InvalidGain,
}

/// Stable identity of one survey field image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExposureId {
    pub run: u32,
    pub rerun: u32,
    pub filter: String,
    pub camcol: u8,
    pub field: u32,
}

impl ExposureId {
    pub fn new(run: u32, rerun: u32, filter: impl Into<String>, camcol: u8, field: u32) -> Self {
        Self {
            run,
            rerun,
            filter: filter.into(),
            camcol,
            field,
        }
    }
}

impl fmt::Display for ExposureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:06}-{}{}-{:04} (rerun {})",
            self.run, self.filter, self.camcol, self.field, self.rerun
        )
    }
}

/// Image, mask and variance planes sharing one pixel grid.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedImage {
    pub image: Array2<f32>,
    pub mask: Array2<u32>,
    pub variance: Array2<f32>,
    /// Parent-frame pixel position of array element `[0, 0]`
    pub origin: (i64, i64),
}

impl MaskedImage {
    /// Zero-filled planes covering `bbox`
    pub fn zeros(bbox: PixelBox) -> Self {
        let shape = bbox.size().shape();
        Self {
            image: Array2::zeros(shape),
            mask: Array2::zeros(shape),
            variance: Array2::zeros(shape),
            origin: (bbox.x0, bbox.y0),
        }
    }

    /// Assemble planes, checking they share a shape
    pub fn from_planes(
        image: Array2<f32>,
        mask: Array2<u32>,
        variance: Array2<f32>,
        origin: (i64, i64),
    ) -> Result<Self, ExposureError> {
        let expected = image.dim();
        if mask.dim() != expected {
            return Err(ExposureError::PlaneShape {
                plane: "mask",
                expected,
                actual: mask.dim(),
            });
        }
        if variance.dim() != expected {
            return Err(ExposureError::PlaneShape {
                plane: "variance",
                expected,
                actual: variance.dim(),
            });
        }
        Ok(Self {
            image,
            mask,
            variance,
            origin,
        })
    }

    pub fn width(&self) -> usize {
        self.image.ncols()
    }

    pub fn height(&self) -> usize {
        self.image.nrows()
    }

    pub fn size(&self) -> ImageSize {
        ImageSize::of_array(&self.image)
    }

    pub fn bbox(&self) -> PixelBox {
        PixelBox::new(self.origin.0, self.origin.1, self.width(), self.height())
    }

    /// `self - other` pixelwise: images subtract, variances add, masks OR.
    ///
    /// # Errors
    /// `ExposureError::PlaneShape` if the grids differ in shape.
    pub fn difference(&self, other: &MaskedImage) -> Result<MaskedImage, ExposureError> {
        if other.image.dim() != self.image.dim() {
            return Err(ExposureError::PlaneShape {
                plane: "image",
                expected: self.image.dim(),
                actual: other.image.dim(),
            });
        }
        let image = &self.image - &other.image;
        let variance = &self.variance + &other.variance;
        let mut mask = self.mask.clone();
        Zip::from(&mut mask)
            .and(&other.mask)
            .for_each(|m, &o| *m |= o);
        Ok(MaskedImage {
            image,
            mask,
            variance,
            origin: self.origin,
        })
    }
}

/// One exposure together with its world mapping and PSF.
#[derive(Debug, Clone)]
pub struct ExposureRecord {
    /// Identity of the survey field this came from; for stitched mosaics the
    /// identity of the first sub-image
    pub id: Option<ExposureId>,
    pub masked: MaskedImage,
    pub wcs: Arc<dyn SkyMapping>,
    pub psf: Arc<PsfModel>,
}

impl ExposureRecord {
    pub fn new(masked: MaskedImage, wcs: Arc<dyn SkyMapping>, psf: Arc<PsfModel>) -> Self {
        Self {
            id: None,
            masked,
            wcs,
            psf,
        }
    }

    pub fn with_id(mut self, id: ExposureId) -> Self {
        self.id = Some(id);
        self
    }

    /// Build an exposure from decoded survey planes.
    ///
    /// The variance plane is estimated from the pixel values as `image / gain`.
    ///
    /// # Errors
    /// * `ExposureError::InvalidGain` - gain not positive and finite
    /// * `ExposureError::PlaneShape` - mask shape differs from image shape
    pub fn from_survey_planes(
        image: Array2<f32>,
        mask: Array2<u32>,
        wcs: Arc<dyn SkyMapping>,
        psf: Arc<PsfModel>,
        gain: f64,
    ) -> Result<Self, ExposureError> {
        if !(gain.is_finite() && gain > 0.0) {
            return Err(ExposureError::InvalidGain);
        }
        let inv_gain = (1.0 / gain) as f32;
        let variance = image.mapv(|v| v * inv_gain);
        let masked = MaskedImage::from_planes(image, mask, variance, (0, 0))?;
        Ok(Self::new(masked, wcs, psf))
    }

    pub fn width(&self) -> usize {
        self.masked.width()
    }

    pub fn height(&self) -> usize {
        self.masked.height()
    }

    pub fn bbox(&self) -> PixelBox {
        self.masked.bbox()
    }

    pub fn image(&self) -> &Array2<f32> {
        &self.masked.image
    }

    pub fn mask(&self) -> &Array2<u32> {
        &self.masked.mask
    }

    pub fn variance(&self) -> &Array2<f32> {
        &self.masked.variance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wcs::TanWcs;

    fn test_wcs() -> Arc<dyn SkyMapping> {
        Arc::new(TanWcs::with_scale((0.0, 0.0), (10.0, 0.0), 1e-4))
    }

    fn test_psf() -> Arc<PsfModel> {
        Arc::new(PsfModel::single_gaussian(5, 1.0))
    }

    #[test]
    fn test_variance_from_gain() {
        let image = Array2::from_elem((3, 4), 200.0f32);
        let mask = Array2::zeros((3, 4));
        let exposure =
            ExposureRecord::from_survey_planes(image, mask, test_wcs(), test_psf(), 4.0).unwrap();
        assert_eq!(exposure.width(), 4);
        assert_eq!(exposure.height(), 3);
        assert!(exposure.variance().iter().all(|&v| v == 50.0));
    }

    #[test]
    fn test_invalid_gain_rejected() {
        let image = Array2::zeros((2, 2));
        let mask = Array2::zeros((2, 2));
        let err = ExposureRecord::from_survey_planes(image, mask, test_wcs(), test_psf(), 0.0)
            .unwrap_err();
        assert_eq!(err, ExposureError::InvalidGain);
    }

    #[test]
    fn test_mismatched_mask_rejected() {
        let image = Array2::zeros((2, 2));
        let mask = Array2::zeros((3, 2));
        let err = ExposureRecord::from_survey_planes(image, mask, test_wcs(), test_psf(), 1.0)
            .unwrap_err();
        assert!(matches!(err, ExposureError::PlaneShape { plane: "mask", .. }));
    }

    #[test]
    fn test_difference_combines_planes() {
        let bbox = PixelBox::new(5, 6, 2, 2);
        let mut a = MaskedImage::zeros(bbox);
        let mut b = MaskedImage::zeros(bbox);
        a.image.fill(10.0);
        a.variance.fill(1.0);
        a.mask[[0, 0]] = 1;
        b.image.fill(4.0);
        b.variance.fill(2.0);
        b.mask[[0, 0]] = 2;
        b.mask[[1, 1]] = 8;

        let diff = a.difference(&b).unwrap();
        assert!(diff.image.iter().all(|&v| v == 6.0));
        assert!(diff.variance.iter().all(|&v| v == 3.0));
        assert_eq!(diff.mask[[0, 0]], 3);
        assert_eq!(diff.mask[[1, 1]], 8);
        assert_eq!(diff.bbox(), bbox);
    }

    #[test]
    fn test_id_display() {
        let id = ExposureId::new(1755, 40, "r", 3, 11);
        assert_eq!(id.to_string(), "001755-r3-0011 (rerun 40)");
    }
}
