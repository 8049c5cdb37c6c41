//! Deterministic names for persisted products.
//!
//! ```text
//! exp-{refrun:06}-{filter}{camcol}-{field:04}.fits              PSF-matched reference
//! psfmatch-{refrun:06}-{filter}{camcol}-{field:04}-r{run:06}.fits
//! warp-…-r{run:06}.fits                                        warped candidate mosaic
//! match-…-r{run:06}.fits                                       background-matched mosaic
//! diff-…-r{run:06}.fits                                        matched minus reference
//! coadd-{refrun:06}-{filter}{camcol}-{field:04}.fits
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    Exposure,
    PsfMatched,
    Warped,
    Matched,
    Difference,
    Coadd,
}

impl ProductKind {
    pub fn prefix(self) -> &'static str {
        match self {
            ProductKind::Exposure => "exp",
            ProductKind::PsfMatched => "psfmatch",
            ProductKind::Warped => "warp",
            ProductKind::Matched => "match",
            ProductKind::Difference => "diff",
            ProductKind::Coadd => "coadd",
        }
    }

    /// Whether the product belongs to one candidate run
    pub fn is_per_run(self) -> bool {
        matches!(
            self,
            ProductKind::PsfMatched
                | ProductKind::Warped
                | ProductKind::Matched
                | ProductKind::Difference
        )
    }
}

/// Identity of one persisted product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputKey {
    pub kind: ProductKind,
    pub refrun: u32,
    pub filter: String,
    pub camcol: u8,
    pub field: u32,
    /// Candidate run for per-run products
    pub run: Option<u32>,
}

impl OutputKey {
    /// Key for a product of the reference field itself
    pub fn field(kind: ProductKind, refrun: u32, filter: &str, camcol: u8, field: u32) -> Self {
        Self {
            kind,
            refrun,
            filter: filter.to_string(),
            camcol,
            field,
            run: None,
        }
    }

    /// The same key, attributed to candidate run `run`
    pub fn for_run(mut self, kind: ProductKind, run: u32) -> Self {
        self.kind = kind;
        self.run = Some(run);
        self
    }

    pub fn file_name(&self) -> String {
        let mut name = format!(
            "{}-{:06}-{}{}-{:04}",
            self.kind.prefix(),
            self.refrun,
            self.filter,
            self.camcol,
            self.field
        );
        if let Some(run) = self.run {
            name.push_str(&format!("-r{run:06}"));
        }
        name.push_str(".fits");
        name
    }
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}
