//! Typed pixel buffers.
//!
//! Every buffer that moves between the coordinator and a worker is an [`Image`]: a
//! [`Shape`] paired with a row-major RGB8 byte vector whose length always equals
//! `shape.byte_len()`. A [`Strip`] is an image that remembers where it came from
//! (its index in the partition and its x-offset in the source).

use crate::error::{StripError, StripResult};

/// Channels per pixel (RGB, 8 bits each).
pub const CHANNELS: u32 = 3;

/// Dimensions of a pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per pixel.
    pub channels: u32,
}

impl Shape {
    /// RGB shape of the given size.
    pub const fn rgb(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            channels: CHANNELS,
        }
    }

    /// Bytes in one row.
    pub fn row_stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    /// Bytes in the whole buffer.
    pub fn byte_len(&self) -> usize {
        self.row_stride() * self.height as usize
    }

    /// True when the buffer holds no pixels.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

/// Row-major RGB8 image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    shape: Shape,
    pixels: Vec<u8>,
}

impl Image {
    /// Wrap `pixels` as an RGB image, checking the buffer length.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> StripResult<Self> {
        Self::with_shape(Shape::rgb(width, height), pixels)
    }

    /// Wrap `pixels` with an explicit shape, checking the buffer length.
    pub fn with_shape(shape: Shape, pixels: Vec<u8>) -> StripResult<Self> {
        if shape.channels != CHANNELS {
            return Err(StripError::ShapeMismatch(format!(
                "expected {} channels, got {}",
                CHANNELS, shape.channels
            )));
        }
        if pixels.len() != shape.byte_len() {
            return Err(StripError::ShapeMismatch(format!(
                "buffer of {} bytes does not match shape {} ({} bytes)",
                pixels.len(),
                shape,
                shape.byte_len()
            )));
        }
        Ok(Self { shape, pixels })
    }

    /// All-black image.
    pub fn blank(width: u32, height: u32) -> Self {
        let shape = Shape::rgb(width, height);
        Self {
            shape,
            pixels: vec![0u8; shape.byte_len()],
        }
    }

    /// Build an image by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> [u8; 3]) -> Self {
        let mut image = Self::blank(width, height);
        for y in 0..height {
            for x in 0..width {
                let offset = image.pixel_offset(x, y);
                image.pixels[offset..offset + 3].copy_from_slice(&f(x, y));
            }
        }
        image
    }

    /// Shape of the buffer.
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.shape.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.shape.height
    }

    /// Raw row-major bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    /// Consume the image, returning its bytes.
    pub fn into_raw(self) -> Vec<u8> {
        self.pixels
    }

    /// One row of pixel bytes.
    pub fn row(&self, y: u32) -> &[u8] {
        let stride = self.shape.row_stride();
        let start = y as usize * stride;
        &self.pixels[start..start + stride]
    }

    fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let stride = self.shape.row_stride();
        let start = y as usize * stride;
        &mut self.pixels[start..start + stride]
    }

    /// Pixel at `(x, y)`, or `None` when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.shape.width || y >= self.shape.height {
            return None;
        }
        let offset = self.pixel_offset(x, y);
        Some([
            self.pixels[offset],
            self.pixels[offset + 1],
            self.pixels[offset + 2],
        ])
    }

    fn pixel_offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.shape.row_stride() + x as usize * self.shape.channels as usize
    }

    /// Copy the columns `[x0, x1)` into a new full-height image.
    pub fn crop_columns(&self, x0: u32, x1: u32) -> StripResult<Image> {
        if x0 > x1 || x1 > self.shape.width {
            return Err(StripError::ShapeMismatch(format!(
                "column range {}..{} outside image width {}",
                x0, x1, self.shape.width
            )));
        }
        let shape = Shape::rgb(x1 - x0, self.shape.height);
        let channels = self.shape.channels as usize;
        let mut pixels = Vec::with_capacity(shape.byte_len());
        for y in 0..self.shape.height {
            let row = self.row(y);
            pixels.extend_from_slice(&row[x0 as usize * channels..x1 as usize * channels]);
        }
        Ok(Image { shape, pixels })
    }

    /// Paste `other` with its left edge at column `x`. Heights must match.
    pub fn paste_columns(&mut self, x: u32, other: &Image) -> StripResult<()> {
        if other.height() != self.height() || x + other.width() > self.width() {
            return Err(StripError::ShapeMismatch(format!(
                "cannot paste {} at column {} into {}",
                other.shape, x, self.shape
            )));
        }
        let channels = self.shape.channels as usize;
        let start = x as usize * channels;
        let len = other.shape.row_stride();
        for y in 0..self.height() {
            self.row_mut(y)[start..start + len].copy_from_slice(other.row(y));
        }
        Ok(())
    }
}

/// One vertical slice of a partitioned image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strip {
    /// Position in the partition (0-based).
    pub index: usize,
    /// Column of the source image where this strip starts.
    pub offset_x: u32,
    /// Pixel data, full source height.
    pub image: Image,
}

impl Strip {
    /// Create a strip.
    pub fn new(index: usize, offset_x: u32, image: Image) -> Self {
        Self {
            index,
            offset_x,
            image,
        }
    }

    /// Shape of the strip's pixel buffer.
    pub fn shape(&self) -> Shape {
        self.image.shape()
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Replace the pixel data, keeping index and offset.
    pub fn with_image(&self, image: Image) -> Strip {
        Strip {
            index: self.index,
            offset_x: self.offset_x,
            image,
        }
    }
}
