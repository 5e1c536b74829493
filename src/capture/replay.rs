//! Replay capture source backed by a directory of images

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{Frame, FrameSource, PixelFormat};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Plays back image files in file-name order, one per call
pub struct ReplaySource {
    files: Vec<PathBuf>,
    position: usize,
    sequence: u64,
    looping: bool,
}

impl ReplaySource {
    /// Collect the images in `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read replay directory: {:?}", dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .collect();
        files.sort();

        info!("Replay source opened {:?} ({} frames)", dir, files.len());

        Ok(Self {
            files,
            position: 0,
            sequence: 0,
            looping: false,
        })
    }

    /// Restart from the first image once exhausted
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Number of images available
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// True once every image was handed out and looping is off
    pub fn is_exhausted(&self) -> bool {
        !self.looping && self.position >= self.files.len()
    }

    /// File names in playback order
    pub fn file_names(&self) -> Vec<String> {
        self.files.iter().filter_map(|path| file_name(path)).collect()
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.position >= self.files.len() {
            if !self.looping || self.files.is_empty() {
                return Ok(None);
            }
            self.position = 0;
        }

        // A file's slot is consumed even when it fails to decode; sequence
        // numbers stay aligned with file indices
        let path = &self.files[self.position];
        let sequence = self.sequence;
        self.position += 1;
        self.sequence += 1;

        let decoded = image::open(path)
            .with_context(|| format!("Failed to decode replay frame: {:?}", path))?;
        debug!("Replaying {:?}", path);

        let frame = if decoded.color().has_alpha() {
            Frame::from_rgba_image(decoded.to_rgba8())
        } else {
            let rgb = decoded.to_rgb8();
            let (width, height) = rgb.dimensions();
            Frame::new(rgb.into_raw(), width, height, PixelFormat::Rgb8)
        };
        Ok(Some(frame.with_sequence(sequence)))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// File name component as an owned string
pub fn file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}
