//! Frame data structures for captured screen content

use image::{GrayImage, Luma, RgbaImage};
use std::time::Instant;

use crate::error::CacheError;
use crate::vision::BBox;

/// Pixel layout of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes per pixel, R G B A
    Rgba8,
    /// 4 bytes per pixel, B G R A (Windows/macOS capture APIs)
    Bgra8,
    /// 3 bytes per pixel, R G B
    Rgb8,
    /// 1 byte per pixel
    Gray8,
}

impl PixelFormat {
    /// Bytes used by one pixel
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// A captured frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw pixel data, `stride` bytes per row
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Bytes per row (may include padding)
    pub stride: usize,
    /// Pixel layout
    pub format: PixelFormat,
    /// Timestamp when frame was captured
    pub timestamp: Instant,
    /// Monotonic capture sequence number
    pub sequence: u64,
}

impl Frame {
    /// Create a tightly packed frame
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            stride: width as usize * format.bytes_per_pixel(),
            format,
            timestamp: Instant::now(),
            sequence: 0,
        }
    }

    /// Wrap an RGBA image
    pub fn from_rgba_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, PixelFormat::Rgba8)
    }

    /// Builder-style sequence number
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Get frame dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Check that the buffer can hold every row the header describes
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.width == 0 || self.height == 0 {
            return Err(CacheError::EmptyFrame {
                width: self.width,
                height: self.height,
            });
        }
        let row = self.width as usize * self.format.bytes_per_pixel();
        let expected = self.stride.max(row) * (self.height as usize - 1) + row;
        if self.data.len() < expected || self.stride < row {
            return Err(CacheError::TruncatedFrame {
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Pixel at (x, y) as RGBA. Caller guarantees the frame is valid.
    fn rgba_at(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = y as usize * self.stride + x as usize * self.format.bytes_per_pixel();
        let px = &self.data[idx..idx + self.format.bytes_per_pixel()];
        match self.format {
            PixelFormat::Rgba8 => [px[0], px[1], px[2], px[3]],
            PixelFormat::Bgra8 => [px[2], px[1], px[0], px[3]],
            PixelFormat::Rgb8 => [px[0], px[1], px[2], 255],
            PixelFormat::Gray8 => [px[0], px[0], px[0], 255],
        }
    }

    /// Convert to a grayscale image
    pub fn to_luma(&self) -> Result<GrayImage, CacheError> {
        self.validate()?;
        let mut gray = GrayImage::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let [r, g, b, _] = self.rgba_at(x, y);
                // ITU-R 601 luma
                let value = (r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000;
                gray.put_pixel(x, y, Luma([value as u8]));
            }
        }
        Ok(gray)
    }

    /// Convert to a packed RGBA image
    pub fn to_rgba(&self) -> Result<RgbaImage, CacheError> {
        self.validate()?;
        let mut rgba = RgbaImage::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                rgba.put_pixel(x, y, image::Rgba(self.rgba_at(x, y)));
            }
        }
        Ok(rgba)
    }

    /// Copy out `bbox` grown by `margin`, clipped to the frame
    pub fn crop(&self, bbox: &BBox, margin: u32) -> Result<RgbaImage, CacheError> {
        self.validate()?;
        let (width, height) = self.dimensions();
        let region = bbox.expand_clamped(margin, width, height);
        if !region.is_valid() {
            return Err(CacheError::RegionOutside { bbox: *bbox });
        }

        let (x0, y0) = (region.x1 as u32, region.y1 as u32);
        let mut out = RgbaImage::new(region.width() as u32, region.height() as u32);
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            *pixel = image::Rgba(self.rgba_at(x0 + x, y0 + y));
        }
        Ok(out)
    }
}
