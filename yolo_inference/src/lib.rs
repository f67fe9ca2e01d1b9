mod labels;
mod model_service;
mod ort_service;

pub mod config;

pub use labels::{load_yolov8_labels, ClassLabels, ColorLabel, LabelsError};
pub use model_service::{BoundingBox, ModelError, ModelService, Thresholds};
pub use ort_service::OrtModelService;
