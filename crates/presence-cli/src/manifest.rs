//! Frame manifests: JSON lines pairing a captured image with the faces a
//! detector found in it.
//!
//! ```text
//! {"image": "frames/0001.jpg", "rotation": 90, "faces": [{"x": 12, "y": 30, "width": 80, "height": 96}]}
//! ```

use anyhow::{Context, Result};
use presence_core::{BoundingBox, Frame, Rotation};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct FrameRecord {
    pub image: PathBuf,
    #[serde(default)]
    pub rotation: Rotation,
    #[serde(default)]
    pub faces: Vec<BoundingBox>,
}

impl FrameRecord {
    /// Decode the image into an RGB frame.
    pub fn load_frame(&self) -> Result<Frame> {
        let image = image::open(&self.image)
            .with_context(|| format!("decoding {}", self.image.display()))?
            .to_rgb8();
        Ok(Frame::new(image, self.rotation))
    }
}

/// Read a manifest. Blank lines and `#` comments are skipped; relative image
/// paths are resolved against the manifest's directory.
pub fn read_manifest(path: &Path) -> Result<Vec<FrameRecord>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_manifest(&text, base).with_context(|| format!("parsing manifest {}", path.display()))
}

pub fn parse_manifest(text: &str, base: &Path) -> Result<Vec<FrameRecord>> {
    let mut records = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut record: FrameRecord =
            serde_json::from_str(line).with_context(|| format!("line {}", lineno + 1))?;
        if record.image.is_relative() {
            record.image = base.join(&record.image);
        }
        records.push(record);
    }
    Ok(records)
}
