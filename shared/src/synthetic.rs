//! Synthetic sky generation for tests and demonstrations.
//!
//! Provides deterministic building blocks for fabricating survey-like
//! exposures without any files on disk:
//!
//! - seeded Gaussian noise fields
//! - a [`SkyScene`] of Gaussian stars on a flat sky, rendered over any window
//!   of a global pixel frame, with source footprints flagged in the mask
//!
//! Everything is seeded so that test assertions see identical pixels on
//! every run.

use ndarray::{Array2, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, NormalError};

use crate::image_size::PixelBox;
use crate::mask::MaskPlane;

/// Generate a 2D array of normally distributed values.
///
/// # Arguments
/// * `size` - Tuple of (height, width) for the output array dimensions
/// * `mean` - Mean value of the normal distribution
/// * `std_dev` - Standard deviation of the normal distribution
/// * `seed` - Random seed for deterministic output
///
/// # Errors
/// Returns `NormalError` if `std_dev` is negative or not finite.
///
/// # Example
/// ```
/// use shared::synthetic::simple_normal_array;
///
/// let noise = simple_normal_array((10, 10), 100.0, 10.0, 42).unwrap();
/// assert_eq!(noise.dim(), (10, 10));
/// ```
pub fn simple_normal_array(
    size: (usize, usize),
    mean: f64,
    std_dev: f64,
    seed: u64,
) -> Result<Array2<f64>, NormalError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal_dist = Normal::new(mean, std_dev)?;
    Ok(Array2::from_shape_fn(size, |_| normal_dist.sample(&mut rng)))
}

/// A point source with a circular Gaussian profile
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Star {
    pub x: f64,
    pub y: f64,
    /// Peak amplitude above the sky
    pub amplitude: f64,
    pub sigma: f64,
}

/// Flat sky plus stars, defined on a global pixel frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SkyScene {
    pub sky_level: f64,
    pub stars: Vec<Star>,
    /// Star contribution above which a pixel is flagged DETECTED
    pub detection_threshold: f64,
}

impl SkyScene {
    /// Scatter `n_stars` stars uniformly over `extent`.
    pub fn random(extent: PixelBox, n_stars: usize, sky_level: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let stars = (0..n_stars)
            .map(|_| Star {
                x: extent.x0 as f64 + rng.random_range(0.0..extent.width as f64),
                y: extent.y0 as f64 + rng.random_range(0.0..extent.height as f64),
                amplitude: rng.random_range(50.0..2000.0),
                sigma: rng.random_range(1.0..2.5),
            })
            .collect();
        Self {
            sky_level,
            stars,
            detection_threshold: 5.0,
        }
    }

    /// Noise-free brightness at global pixel `(x, y)`, without the sky level
    fn source_flux(&self, x: f64, y: f64) -> f64 {
        self.stars
            .iter()
            .map(|star| {
                let r2 = (x - star.x).powi(2) + (y - star.y).powi(2);
                let cutoff = 6.0 * star.sigma;
                if r2 > cutoff * cutoff {
                    0.0
                } else {
                    star.amplitude * (-r2 / (2.0 * star.sigma * star.sigma)).exp()
                }
            })
            .sum()
    }

    /// Render the window `window` of the global frame.
    ///
    /// Returns `(image, mask)` with shape `(window.height, window.width)`.
    /// Pixels whose source flux exceeds the detection threshold carry the
    /// DETECTED bit.
    pub fn render(&self, window: PixelBox) -> (Array2<f64>, Array2<u32>) {
        let shape = window.size().shape();
        let mut image = Array2::<f64>::zeros(shape);
        let mut mask = Array2::<u32>::zeros(shape);
        let detected = MaskPlane::Detected.bit();

        Zip::indexed(&mut image)
            .and(&mut mask)
            .par_for_each(|(iy, ix), value, bits| {
                let x = (window.x0 + ix as i64) as f64;
                let y = (window.y0 + iy as i64) as f64;
                let flux = self.source_flux(x, y);
                *value = self.sky_level + flux;
                if flux > self.detection_threshold {
                    *bits |= detected;
                }
            });
        (image, mask)
    }
}

/// Add seeded Gaussian noise of standard deviation `sigma` in place.
pub fn add_gaussian_noise(
    image: &mut Array2<f64>,
    sigma: f64,
    seed: u64,
) -> Result<(), NormalError> {
    let noise = simple_normal_array(image.dim(), 0.0, sigma, seed)?;
    *image += &noise;
    Ok(())
}
