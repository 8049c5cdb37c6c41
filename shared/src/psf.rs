//! Point-spread-function models attached to exposures.
//!
//! The pipeline never inspects a PSF beyond handing it to the PSF matcher as
//! a target and reporting its size. The reference target is a double
//! Gaussian defined on a kernel grid.

/// FWHM of a Gaussian in units of its sigma: 2·sqrt(2·ln 2)
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_4;

/// Sum of two concentric Gaussians, `G(σ1) + b·G(σ2)`
#[derive(Debug, Clone, PartialEq)]
pub struct PsfModel {
    /// Kernel width in pixels
    pub width: usize,
    /// Kernel height in pixels
    pub height: usize,
    pub sigma1: f64,
    pub sigma2: f64,
    /// Amplitude of the second Gaussian relative to the first
    pub b: f64,
}

impl PsfModel {
    /// Double Gaussian with a single component, as used for the matching target
    pub fn single_gaussian(size: usize, sigma: f64) -> Self {
        Self {
            width: size,
            height: size,
            sigma1: sigma,
            sigma2: 1.0,
            b: 0.0,
        }
    }

    /// Kernel dimensions `(width, height)`
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Full width at half maximum in pixels, taken from the dominant Gaussian
    pub fn fwhm(&self) -> f64 {
        let sigma = if self.b > 1.0 { self.sigma2 } else { self.sigma1 };
        FWHM_PER_SIGMA * sigma
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fwhm_of_gaussian() {
        let psf = PsfModel::single_gaussian(31, 4.0);
        assert_eq!(psf.dimensions(), (31, 31));
        assert_relative_eq!(psf.fwhm(), 4.0 * FWHM_PER_SIGMA);
    }

    #[test]
    fn test_fwhm_follows_dominant_component() {
        let psf = PsfModel {
            width: 21,
            height: 15,
            sigma1: 1.0,
            sigma2: 2.5,
            b: 3.0,
        };
        assert_eq!(psf.dimensions(), (21, 15));
        assert_relative_eq!(psf.fwhm(), 2.5 * FWHM_PER_SIGMA);
    }
}
