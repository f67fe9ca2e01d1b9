use image::{codecs::jpeg::JpegEncoder, RgbImage};
use thiserror::Error;

const JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("Unsupported channel layout: {channels} channels")]
    UnsupportedLayout { channels: u8 },
    #[error("Failed to decode image: {0}")]
    Decode(image::ImageError),
    #[error("Failed to encode frame: {0}")]
    Encode(image::ImageError),
}

/// Owned, interleaved 8-bit pixel buffer in BGR channel order.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(FrameError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            channels,
        })
    }

    pub fn from_rgb_image(image: &RgbImage) -> Self {
        let (width, height) = image.dimensions();
        let mut data = image.as_raw().clone();
        for pixel in data.chunks_exact_mut(3) {
            pixel.swap(0, 2);
        }
        Self {
            data,
            width,
            height,
            channels: 3,
        }
    }

    /// Decodes an encoded image file (any format the `image` crate reads).
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let image = image::load_from_memory(bytes).map_err(FrameError::Decode)?;
        Ok(Self::from_rgb_image(&image.to_rgb8()))
    }

    pub fn to_rgb_image(&self) -> Result<RgbImage, FrameError> {
        if self.channels != 3 {
            return Err(FrameError::UnsupportedLayout {
                channels: self.channels,
            });
        }
        let mut data = self.data.clone();
        for pixel in data.chunks_exact_mut(3) {
            pixel.swap(0, 2);
        }
        RgbImage::from_raw(self.width, self.height, data).ok_or(FrameError::BufferSize {
            expected: self.width as usize * self.height as usize * 3,
            actual: self.data.len(),
        })
    }

    pub fn encode_jpeg(&self) -> Result<Vec<u8>, FrameError> {
        let rgb = self.to_rgb_image()?;
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
            .encode_image(&rgb)
            .map_err(FrameError::Encode)?;
        Ok(buf)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }
}
