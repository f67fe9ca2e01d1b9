use image::RgbImage;
use thiserror::Error;

/// Score and overlap cut-offs applied to raw model output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub confidence: f32,
    pub iou: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            confidence: 0.25,
            iou: 0.45,
        }
    }
}

/// One predicted box in original image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub class_id: u32,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.) * (self.y2 - self.y1).max(0.)
    }

    pub fn is_degenerate(&self) -> bool {
        self.x1 >= self.x2 || self.y1 >= self.y2
    }
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Image transformation error: {0}")]
    Transform(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Invalid model output: {0}")]
    InvalidOutput(String),
}

/// Runs the detection model on a decoded RGB image.
///
/// Implementations must be safe to call from several threads at once and
/// must not retain the image past the call.
pub trait ModelService: Send + Sync + 'static {
    fn predict(
        &self,
        image: &RgbImage,
        thresholds: &Thresholds,
    ) -> Result<Vec<BoundingBox>, ModelError>;
}
