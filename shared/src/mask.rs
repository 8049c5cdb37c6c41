//! Named mask planes and bit-mask helpers.
//!
//! Every pixel of an exposure carries a `u32` mask word; each named plane
//! owns one bit. The plane layout follows the conventional survey pipeline
//! ordering so that masks decoded from survey files keep their meaning.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaskError {
    #[error("unknown mask plane: {0}")]
    UnknownPlane(String),
}

/// A named mask plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaskPlane {
    /// Bad detector pixel
    Bad,
    /// Saturated pixel
    Sat,
    /// Interpolated pixel
    Intrp,
    /// Cosmic ray hit
    Cr,
    /// Pixel near the edge of coverage
    Edge,
    /// Part of a detected source
    Detected,
    /// Part of a negative detection
    DetectedNegative,
    /// Questionable pixel
    Suspect,
    /// No data was available for this pixel
    NoData,
}

impl MaskPlane {
    pub const ALL: [MaskPlane; 9] = [
        MaskPlane::Bad,
        MaskPlane::Sat,
        MaskPlane::Intrp,
        MaskPlane::Cr,
        MaskPlane::Edge,
        MaskPlane::Detected,
        MaskPlane::DetectedNegative,
        MaskPlane::Suspect,
        MaskPlane::NoData,
    ];

    /// Bit index of this plane within the mask word
    pub fn index(self) -> u32 {
        match self {
            MaskPlane::Bad => 0,
            MaskPlane::Sat => 1,
            MaskPlane::Intrp => 2,
            MaskPlane::Cr => 3,
            MaskPlane::Edge => 4,
            MaskPlane::Detected => 5,
            MaskPlane::DetectedNegative => 6,
            MaskPlane::Suspect => 7,
            MaskPlane::NoData => 8,
        }
    }

    /// Single-bit mask value for this plane
    pub fn bit(self) -> u32 {
        1 << self.index()
    }

    pub fn name(self) -> &'static str {
        match self {
            MaskPlane::Bad => "BAD",
            MaskPlane::Sat => "SAT",
            MaskPlane::Intrp => "INTRP",
            MaskPlane::Cr => "CR",
            MaskPlane::Edge => "EDGE",
            MaskPlane::Detected => "DETECTED",
            MaskPlane::DetectedNegative => "DETECTED_NEGATIVE",
            MaskPlane::Suspect => "SUSPECT",
            MaskPlane::NoData => "NO_DATA",
        }
    }
}

impl fmt::Display for MaskPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MaskPlane {
    type Err = MaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        MaskPlane::ALL
            .into_iter()
            .find(|plane| plane.name() == wanted)
            .ok_or_else(|| MaskError::UnknownPlane(s.to_string()))
    }
}

/// OR together the bits of the named planes.
///
/// # Errors
/// `MaskError::UnknownPlane` if any name does not match a plane.
pub fn plane_bit_mask<S: AsRef<str>>(names: &[S]) -> Result<u32, MaskError> {
    names.iter().try_fold(0u32, |acc, name| {
        let plane: MaskPlane = name.as_ref().parse()?;
        Ok(acc | plane.bit())
    })
}

/// Names of the planes set in `mask`, in plane order
pub fn planes_in(mask: u32) -> Vec<MaskPlane> {
    MaskPlane::ALL
        .into_iter()
        .filter(|plane| mask & plane.bit() != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_are_distinct() {
        let combined = MaskPlane::ALL.iter().fold(0u32, |acc, p| {
            assert_eq!(acc & p.bit(), 0, "{p} overlaps another plane");
            acc | p.bit()
        });
        assert_eq!(combined, 0x1ff);
    }

    #[test]
    fn test_plane_bit_mask_from_names() {
        let mask = plane_bit_mask(&["BAD", "sat", " NO_DATA "]).unwrap();
        assert_eq!(
            mask,
            MaskPlane::Bad.bit() | MaskPlane::Sat.bit() | MaskPlane::NoData.bit()
        );
        assert_eq!(plane_bit_mask::<&str>(&[]).unwrap(), 0);
    }

    #[test]
    fn test_unknown_plane_is_rejected() {
        let err = plane_bit_mask(&["BAD", "GHOST"]).unwrap_err();
        assert_eq!(err, MaskError::UnknownPlane("GHOST".to_string()));
    }

    #[test]
    fn test_planes_in_round_trips_names() {
        let mask = MaskPlane::Edge.bit() | MaskPlane::Cr.bit();
        assert_eq!(planes_in(mask), vec![MaskPlane::Cr, MaskPlane::Edge]);
    }
}
