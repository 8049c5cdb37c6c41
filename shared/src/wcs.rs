//! Pixel ↔ sky coordinate mappings.
//!
//! The coadd pipeline treats the world-coordinate mapping of an exposure as
//! opaque: it only ever asks for the sky position of a pixel (to build the
//! catalog query region) or hands the mapping to the warper. [`SkyMapping`]
//! is that seam. [`TanWcs`] is a gnomonic (tangent plane) implementation
//! with a linear CD matrix, enough to describe drift-scan survey fields.

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A position on the sky in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyCoord {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

impl SkyCoord {
    pub fn new(ra_deg: f64, dec_deg: f64) -> Self {
        Self { ra_deg, dec_deg }
    }
}

impl fmt::Display for SkyCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.ra_deg, self.dec_deg)
    }
}

/// Transform between parent pixel coordinates and the sky.
pub trait SkyMapping: fmt::Debug + Send + Sync {
    fn pixel_to_sky(&self, x: f64, y: f64) -> SkyCoord;

    fn sky_to_pixel(&self, coord: SkyCoord) -> (f64, f64);
}

/// Gnomonic projection with a linear CD matrix.
///
/// 1. Pixel to intermediate: `(ξ, η) = CD × (x - CRPIX1, y - CRPIX2)`
/// 2. Intermediate to sky: de-project from the tangent plane at CRVAL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TanWcs {
    /// Reference pixel (CRPIX1, CRPIX2)
    pub crpix: (f64, f64),
    /// Reference sky position in degrees (CRVAL1 = RA, CRVAL2 = Dec)
    pub crval: (f64, f64),
    /// CD matrix in degrees per pixel, row-major `[[CD1_1, CD1_2], [CD2_1, CD2_2]]`
    pub cd: [[f64; 2]; 2],
}

impl TanWcs {
    pub fn new(crpix: (f64, f64), crval: (f64, f64), cd: [[f64; 2]; 2]) -> Self {
        Self { crpix, crval, cd }
    }

    /// North-up, east-right mapping with square pixels of `scale_deg` degrees.
    pub fn with_scale(crpix: (f64, f64), crval: (f64, f64), scale_deg: f64) -> Self {
        Self::new(crpix, crval, [[scale_deg, 0.0], [0.0, scale_deg]])
    }

    /// Same projection with the reference pixel moved by `(dx, dy)`.
    ///
    /// Useful for describing a sub-image whose array origin sits at parent
    /// pixel `(dx, dy)` of this mapping.
    pub fn shifted(&self, dx: f64, dy: f64) -> Self {
        Self {
            crpix: (self.crpix.0 - dx, self.crpix.1 - dy),
            ..self.clone()
        }
    }

    fn cd_matrix(&self) -> Matrix2<f64> {
        Matrix2::new(self.cd[0][0], self.cd[0][1], self.cd[1][0], self.cd[1][1])
    }
}

impl SkyMapping for TanWcs {
    fn pixel_to_sky(&self, x: f64, y: f64) -> SkyCoord {
        let offset = Vector2::new(x - self.crpix.0, y - self.crpix.1);
        let intermediate = self.cd_matrix() * offset;
        let xi = intermediate.x.to_radians();
        let eta = intermediate.y.to_radians();

        let ra0 = self.crval.0.to_radians();
        let dec0 = self.crval.1.to_radians();
        let (sin_dec0, cos_dec0) = dec0.sin_cos();
        let denom = cos_dec0 - eta * sin_dec0;

        let ra = ra0 + xi.atan2(denom);
        let dec = (sin_dec0 + eta * cos_dec0).atan2((xi * xi + denom * denom).sqrt());

        SkyCoord::new(ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
    }

    fn sky_to_pixel(&self, coord: SkyCoord) -> (f64, f64) {
        let ra = coord.ra_deg.to_radians();
        let dec = coord.dec_deg.to_radians();
        let ra0 = self.crval.0.to_radians();
        let dec0 = self.crval.1.to_radians();

        let (sin_dec, cos_dec) = dec.sin_cos();
        let (sin_dec0, cos_dec0) = dec0.sin_cos();
        let (sin_dra, cos_dra) = (ra - ra0).sin_cos();

        let d = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_dra;
        let xi = (cos_dec * sin_dra / d).to_degrees();
        let eta = ((sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_dra) / d).to_degrees();

        let offset = match self.cd_matrix().try_inverse() {
            Some(inverse) => inverse * Vector2::new(xi, eta),
            None => Vector2::new(f64::NAN, f64::NAN),
        };
        (offset.x + self.crpix.0, offset.y + self.crpix.1)
    }
}
