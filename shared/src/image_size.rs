//! Image dimensions and pixel bounding boxes

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Image dimensions structure
///
/// Represents the width and height of an exposure or mosaic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    /// Image width in pixels
    pub width: usize,
    /// Image height in pixels
    pub height: usize,
}

impl ImageSize {
    /// Create a new ImageSize
    pub fn from_width_height(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Size of an array with shape `(height, width)`
    pub fn of_array<T>(array: &Array2<T>) -> Self {
        let (height, width) = array.dim();
        Self { width, height }
    }

    /// Array shape `(height, width)`; rows come first.
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Get total number of pixels
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Integer pixel bounding box in parent coordinates
///
/// Covers pixels `[x0, x0 + width) × [y0, y0 + height)`. The origin is the
/// parent-frame position of array element `[0, 0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelBox {
    pub x0: i64,
    pub y0: i64,
    pub width: usize,
    pub height: usize,
}

impl PixelBox {
    pub fn new(x0: i64, y0: i64, width: usize, height: usize) -> Self {
        Self {
            x0,
            y0,
            width,
            height,
        }
    }

    /// Box at the origin with the given size
    pub fn from_size(size: ImageSize) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn size(&self) -> ImageSize {
        ImageSize::from_width_height(self.width, self.height)
    }

    /// Last pixel column, inclusive
    pub fn x_max(&self) -> i64 {
        self.x0 + self.width as i64 - 1
    }

    /// Last pixel row, inclusive
    pub fn y_max(&self) -> i64 {
        self.y0 + self.height as i64 - 1
    }

    /// The four corner pixel centers: lower-left, upper-left, upper-right, lower-right
    pub fn corners(&self) -> [(f64, f64); 4] {
        let (x_min, y_min) = (self.x0 as f64, self.y0 as f64);
        let (x_max, y_max) = (self.x_max() as f64, self.y_max() as f64);
        [(x_min, y_min), (x_min, y_max), (x_max, y_max), (x_max, y_min)]
    }

    /// Whether parent pixel `(x, y)` lies inside the box
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.x0 && x <= self.x_max() && y >= self.y0 && y <= self.y_max()
    }
}

impl fmt::Display for PixelBox {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x0, self.y0)
    }
}
