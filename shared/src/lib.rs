//! Shared types for the coadd workspace
//!
//! The exposure data model every pipeline stage passes around, together with
//! the pieces it is built from: pixel boxes, mask planes, world-coordinate
//! mappings and PSF models. Synthetic sky generation lives here too so that
//! every crate's tests can fabricate exposures the same way.

pub mod exposure;
pub mod image_size;
pub mod mask;
pub mod psf;
pub mod synthetic;
pub mod wcs;

pub use exposure::{ExposureError, ExposureId, ExposureRecord, MaskedImage};
pub use image_size::{ImageSize, PixelBox};
pub use mask::{plane_bit_mask, MaskError, MaskPlane};
pub use psf::PsfModel;
pub use wcs::{SkyCoord, SkyMapping, TanWcs};
