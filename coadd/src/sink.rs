//! Output sinks for persisted products.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use shared::exposure::MaskedImage;
use shared::mask::planes_in;

use crate::collaborators::OutputSink;
use crate::error::CollaboratorError;
use crate::naming::{OutputKey, ProductKind};

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn persist(&self, _key: &OutputKey, _image: &MaskedImage) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// One line of a product manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub kind: ProductKind,
    pub width: usize,
    pub height: usize,
    /// Mean over finite pixels, `None` when there are none
    pub mean: Option<f64>,
    pub finite_pixels: usize,
    /// Mask planes set anywhere in the image
    #[serde(default)]
    pub mask_planes: Vec<String>,
}

impl ManifestEntry {
    pub fn describe(key: &OutputKey, image: &MaskedImage) -> Self {
        let (sum, count) = image
            .image
            .iter()
            .filter(|v| v.is_finite())
            .fold((0.0f64, 0usize), |(sum, count), &v| (sum + v as f64, count + 1));
        let mask = image.mask.iter().fold(0u32, |acc, &bits| acc | bits);
        Self {
            name: key.file_name(),
            kind: key.kind,
            width: image.width(),
            height: image.height(),
            mean: (count > 0).then(|| sum / count as f64),
            finite_pixels: count,
            mask_planes: planes_in(mask).into_iter().map(|p| p.name().to_string()).collect(),
        }
    }
}

/// Appends a JSON line describing each product to `manifest.jsonl`.
#[derive(Debug)]
pub struct ManifestSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl ManifestSink {
    pub const FILE_NAME: &'static str = "manifest.jsonl";

    /// Open (creating if needed) the manifest inside `dir`.
    pub fn create(dir: &Path) -> Result<Self, CollaboratorError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every entry of a manifest file.
    pub fn read_entries(path: &Path) -> Result<Vec<ManifestEntry>, CollaboratorError> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

impl OutputSink for ManifestSink {
    fn persist(&self, key: &OutputKey, image: &MaskedImage) -> Result<(), CollaboratorError> {
        let mut line = serde_json::to_string(&ManifestEntry::describe(key, image))?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| CollaboratorError::Failed("manifest lock poisoned".to_string()))?;
        file.write_all(line.as_bytes())?;
        debug!("recorded {key} in {}", self.path.display());
        Ok(())
    }
}
