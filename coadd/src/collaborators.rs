//! Interfaces to the services the pipeline depends on but does not implement.
//!
//! Catalog lookup, exposure decoding, PSF homogenization, resampling and
//! product persistence are all injected into [`crate::pipeline::CoaddPipeline`]
//! as trait objects. Every trait is `Send + Sync` so that the per-run chain can
//! run on the rayon pool while sharing one set of collaborators.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use shared::exposure::{ExposureId, ExposureRecord, MaskedImage};
use shared::image_size::PixelBox;
use shared::psf::PsfModel;
use shared::wcs::{SkyCoord, SkyMapping};

use crate::error::{CollaboratorError, Component, PipelineError};
use crate::naming::OutputKey;

/// Closed polygon on the sky, vertices in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkyPolygon {
    pub vertices: Vec<SkyCoord>,
}

impl SkyPolygon {
    /// Footprint of an exposure: its four corner pixel centers mapped to the sky.
    pub fn from_exposure(exposure: &ExposureRecord) -> Self {
        let vertices = exposure
            .bbox()
            .corners()
            .iter()
            .map(|&(x, y)| exposure.wcs.pixel_to_sky(x, y))
            .collect();
        Self { vertices }
    }

    /// Whether `coord` falls inside the polygon.
    ///
    /// Even-odd rule on (RA, Dec) treated as planar coordinates, adequate for
    /// field-sized footprints away from the poles and the RA wrap.
    pub fn contains(&self, coord: SkyCoord) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (a, b) = (self.vertices[i], self.vertices[j]);
            if (a.dec_deg > coord.dec_deg) != (b.dec_deg > coord.dec_deg) {
                let t = (coord.dec_deg - a.dec_deg) / (b.dec_deg - a.dec_deg);
                let ra_cross = a.ra_deg + t * (b.ra_deg - a.ra_deg);
                if coord.ra_deg < ra_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

/// Per-field observing conditions reported by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldQuality {
    /// Seeing FWHM in arcseconds
    pub fwhm: f64,
    /// Sky brightness
    pub sky: f64,
    pub airmass: f64,
    /// Survey quality flag, higher is better
    pub quality: u8,
    pub blacklisted: bool,
}

/// One field image returned by a catalog query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: ExposureId,
    /// Survey strip the run belongs to
    pub strip: String,
    pub quality: Option<FieldQuality>,
}

pub trait CatalogQuery: Send + Sync {
    /// Field images in `filter` overlapping `region`, ordered by run then field.
    fn query(
        &self,
        region: &SkyPolygon,
        filter: &str,
    ) -> Result<Vec<CatalogEntry>, CollaboratorError>;
}

/// Decodes the components of a survey exposure.
///
/// Each method returns `None` when the component is unavailable.
pub trait ExposureLoader: Send + Sync {
    fn load_pixels(&self, id: &ExposureId) -> Option<Array2<f32>>;

    fn load_mask(&self, id: &ExposureId) -> Option<Array2<u32>>;

    fn load_wcs(&self, id: &ExposureId) -> Option<Arc<dyn SkyMapping>>;

    fn load_psf(&self, id: &ExposureId) -> Option<Arc<PsfModel>>;
}

pub trait PsfMatcher: Send + Sync {
    /// Convolve `exposure` so that its PSF becomes `target`.
    fn match_psf(
        &self,
        exposure: ExposureRecord,
        target: &PsfModel,
    ) -> Result<ExposureRecord, CollaboratorError>;
}

pub trait Warper: Send + Sync {
    /// Resample `source` onto the grid `dest_bbox` of `dest_wcs` with the
    /// named interpolation kernel.
    ///
    /// The PSF of the result is unspecified; callers assign it.
    ///
    /// # Errors
    /// `CollaboratorError::UnsupportedKernel` if the warper does not offer `kernel`.
    fn warp(
        &self,
        source: ExposureRecord,
        dest_bbox: PixelBox,
        dest_wcs: &Arc<dyn SkyMapping>,
        kernel: &str,
    ) -> Result<ExposureRecord, CollaboratorError>;
}

pub trait OutputSink: Send + Sync {
    fn persist(&self, key: &OutputKey, image: &MaskedImage) -> Result<(), CollaboratorError>;
}

/// Load every component of `id` and assemble an exposure.
///
/// The variance plane is estimated from the pixels as `pixels / gain`.
///
/// # Errors
/// * `PipelineError::MissingData` - the loader could not provide a component
/// * `PipelineError::Exposure` - planes disagree in shape, or invalid gain
pub fn load_exposure(
    loader: &dyn ExposureLoader,
    id: &ExposureId,
    gain: f64,
) -> Result<ExposureRecord, PipelineError> {
    let missing = |component| PipelineError::MissingData {
        id: id.clone(),
        component,
    };
    let pixels = loader.load_pixels(id).ok_or_else(|| missing(Component::Pixels))?;
    let mask = loader.load_mask(id).ok_or_else(|| missing(Component::Mask))?;
    let wcs = loader.load_wcs(id).ok_or_else(|| missing(Component::Wcs))?;
    let psf = loader.load_psf(id).ok_or_else(|| missing(Component::Psf))?;

    let exposure = ExposureRecord::from_survey_planes(pixels, mask, wcs, psf, gain)?;
    Ok(exposure.with_id(id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::wcs::TanWcs;

    struct PartialLoader {
        with_psf: bool,
    }

    impl ExposureLoader for PartialLoader {
        fn load_pixels(&self, _id: &ExposureId) -> Option<Array2<f32>> {
            Some(Array2::from_elem((4, 6), 8.0))
        }

        fn load_mask(&self, _id: &ExposureId) -> Option<Array2<u32>> {
            Some(Array2::zeros((4, 6)))
        }

        fn load_wcs(&self, _id: &ExposureId) -> Option<Arc<dyn SkyMapping>> {
            Some(Arc::new(TanWcs::with_scale((3.0, 2.0), (150.0, 2.0), 1e-4)))
        }

        fn load_psf(&self, _id: &ExposureId) -> Option<Arc<PsfModel>> {
            self.with_psf
                .then(|| Arc::new(PsfModel::single_gaussian(5, 1.0)))
        }
    }

    #[test]
    fn test_load_exposure_assembles_planes() {
        let id = ExposureId::new(94, 40, "r", 2, 300);
        let exposure = load_exposure(&PartialLoader { with_psf: true }, &id, 2.0).unwrap();
        assert_eq!(exposure.id.as_ref(), Some(&id));
        assert_eq!((exposure.width(), exposure.height()), (6, 4));
        assert!(exposure.variance().iter().all(|&v| v == 4.0));
    }

    #[test]
    fn test_missing_component_is_reported() {
        let id = ExposureId::new(94, 40, "r", 2, 300);
        let err = load_exposure(&PartialLoader { with_psf: false }, &id, 1.0).unwrap_err();
        match err {
            PipelineError::MissingData { id: missing, component } => {
                assert_eq!(missing, id);
                assert_eq!(component, Component::Psf);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_footprint_contains_center() {
        let masked = MaskedImage::zeros(PixelBox::new(0, 0, 100, 50));
        let wcs: Arc<dyn SkyMapping> =
            Arc::new(TanWcs::with_scale((50.0, 25.0), (150.0, 2.0), 1e-3));
        let psf = Arc::new(PsfModel::single_gaussian(5, 1.0));
        let exposure = ExposureRecord::new(masked, wcs.clone(), psf);

        let footprint = SkyPolygon::from_exposure(&exposure);
        assert_eq!(footprint.vertices.len(), 4);
        assert!(footprint.contains(wcs.pixel_to_sky(50.0, 25.0)));
        assert!(!footprint.contains(wcs.pixel_to_sky(150.0, 25.0)));
    }
}
