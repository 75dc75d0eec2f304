//! Decoded RGB frames and pixel regions.
//!
//! A [`Frame`] is the unit handed to the detector and the color classifier.
//! Pixels are stored as packed RGB8, row-major, so a frame can be cloned
//! cheaply and moved into blocking tasks.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use thiserror::Error;

/// Errors that can occur when building or encoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Pixel buffer has {actual} bytes, expected {expected} for {width}x{height} RGB")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Failed to encode frame: {0}")]
    Encode(String),
}

/// A decoded RGB8 frame.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Bytes,
}

impl Frame {
    /// Create a frame from a packed RGB8 buffer.
    pub fn from_rgb(width: u32, height: u32, pixels: impl Into<Bytes>) -> Result<Self, FrameError> {
        let pixels = pixels.into();
        let expected = width as usize * height as usize * 3;

        if pixels.len() != expected {
            return Err(FrameError::BufferSize {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }

        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Create a frame filled with a single color.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels: Vec<u8> = std::iter::repeat(rgb)
            .take(width as usize * height as usize)
            .flatten()
            .collect();

        Self {
            width,
            height,
            pixels: Bytes::from(pixels),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Get the RGB value at (x, y), if inside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        Some([
            self.pixels[offset],
            self.pixels[offset + 1],
            self.pixels[offset + 2],
        ])
    }

    /// Mean RGB over a region. Returns `None` for an empty region.
    pub fn region_mean(&self, region: &PixelRegion) -> Option<[u8; 3]> {
        let region = region.clamp_to(self.width, self.height);
        if region.is_empty() {
            return None;
        }

        let mut sums = [0u64; 3];
        let row_stride = self.width as usize * 3;

        for y in region.y0..region.y1 {
            let start = y as usize * row_stride + region.x0 as usize * 3;
            let end = y as usize * row_stride + region.x1 as usize * 3;
            for px in self.pixels[start..end].chunks_exact(3) {
                sums[0] += px[0] as u64;
                sums[1] += px[1] as u64;
                sums[2] += px[2] as u64;
            }
        }

        let count = region.area();
        Some([
            (sums[0] / count) as u8,
            (sums[1] / count) as u8,
            (sums[2] / count) as u8,
        ])
    }

    /// Encode the frame as JPEG.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .write_image(&self.pixels, self.width, self.height, ExtendedColorType::Rgb8)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(out)
    }
}

/// Half-open pixel rectangle `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRegion {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelRegion {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Clamp the region to frame bounds.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let x1 = self.x1.min(width);
        let y1 = self.y1.min(height);
        Self {
            x0: self.x0.min(x1),
            y0: self.y0.min(y1),
            x1,
            y1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }

    pub fn area(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            (self.x1 - self.x0) as u64 * (self.y1 - self.y0) as u64
        }
    }
}
