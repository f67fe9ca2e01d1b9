use crate::{
    cv_utils::{CvUtilsError, ImageConverter},
    frame::{Frame, FrameError},
};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;
use yolo_inference::{BoundingBox, ClassLabels, ModelError, ModelService, Thresholds};

/// One predicted object with its resolved class name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Detections for a frame together with a freshly drawn copy of it.
#[derive(Debug, Clone)]
pub struct Inference {
    pub detections: Vec<Detection>,
    pub annotated: Frame,
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Cv utils error: {0}")]
    OpenCv(#[from] CvUtilsError),
}

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("Render error: {0}")]
    Render(#[from] RenderError),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
}

impl From<FrameError> for DetectError {
    fn from(err: FrameError) -> Self {
        DetectError::Render(RenderError::Frame(err))
    }
}

impl From<CvUtilsError> for DetectError {
    fn from(err: CvUtilsError) -> Self {
        DetectError::Render(RenderError::OpenCv(err))
    }
}

/// The detection step as seen by the pipeline and the batch path.
///
/// Implementations never mutate `frame` and pass `thresholds` through to the
/// model as given.
pub trait Detector: Send + Sync + 'static {
    fn infer(&self, frame: &Frame, thresholds: &Thresholds) -> Result<Inference, DetectError>;
}

pub struct YoloDetector<M: ModelService> {
    model_service: M,
    class_labels: ClassLabels,
}

impl<M: ModelService> YoloDetector<M> {
    pub fn new(model_service: M, class_labels: ClassLabels) -> Self {
        Self {
            model_service,
            class_labels,
        }
    }

    fn label(&self, bbox: BoundingBox) -> Detection {
        Detection {
            class_id: bbox.class_id,
            class_name: self.class_labels.name(bbox.class_id),
            confidence: bbox.confidence,
            x1: bbox.x1,
            y1: bbox.y1,
            x2: bbox.x2,
            y2: bbox.y2,
        }
    }
}

impl<M: ModelService> Detector for YoloDetector<M> {
    #[instrument(skip_all, fields(width = frame.width(), height = frame.height()))]
    fn infer(&self, frame: &Frame, thresholds: &Thresholds) -> Result<Inference, DetectError> {
        let image = frame.to_rgb_image()?;
        let boxes = self.model_service.predict(&image, thresholds)?;

        let detections: Vec<Detection> = boxes.into_iter().map(|bbox| self.label(bbox)).collect();
        for (i, detection) in detections.iter().enumerate() {
            tracing::debug!(
                "Detection {}: class={}, confidence={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                detection.class_name,
                detection.confidence,
                detection.x1,
                detection.y1,
                detection.x2,
                detection.y2
            );
        }

        let mut mat = ImageConverter::frame_to_mat(frame)?;
        ImageConverter::annotate_frame(&mut mat, &detections, &self.class_labels)?;
        let annotated = ImageConverter::mat_to_frame(&mat)?;

        Ok(Inference {
            detections,
            annotated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::sync::Mutex;
    use yolo_inference::ColorLabel;

    struct MockModelService {
        seen: Mutex<Vec<Thresholds>>,
    }

    impl ModelService for MockModelService {
        fn predict(
            &self,
            _image: &RgbImage,
            thresholds: &Thresholds,
        ) -> Result<Vec<BoundingBox>, ModelError> {
            self.seen.lock().unwrap().push(*thresholds);
            Ok(vec![
                BoundingBox {
                    class_id: 0,
                    confidence: 0.95,
                    x1: 10.0,
                    y1: 20.0,
                    x2: 40.0,
                    y2: 50.0,
                },
                BoundingBox {
                    class_id: 42,
                    confidence: 0.88,
                    x1: 5.0,
                    y1: 5.0,
                    x2: 30.0,
                    y2: 30.0,
                },
            ])
        }
    }

    fn detector() -> YoloDetector<MockModelService> {
        let labels = ClassLabels::new(vec![ColorLabel {
            label: "person".to_string(),
            red: 255,
            green: 0,
            blue: 0,
        }]);
        YoloDetector::new(
            MockModelService {
                seen: Mutex::new(Vec::new()),
            },
            labels,
        )
    }

    #[test]
    fn test_infer_labels_detections_in_model_order() {
        let detector = detector();
        let frame = Frame::new(vec![0; 64 * 64 * 3], 64, 64, 3).unwrap();
        let thresholds = Thresholds {
            confidence: 0.5,
            iou: 0.7,
        };

        let inference = detector.infer(&frame, &thresholds).unwrap();

        assert_eq!(inference.detections.len(), 2);
        assert_eq!(inference.detections[0].class_name, "person");
        assert_eq!(inference.detections[1].class_name, "42");
        assert_eq!(
            detector.model_service.seen.lock().unwrap().as_slice(),
            &[thresholds]
        );
    }

    #[test]
    fn test_infer_leaves_input_untouched() {
        let detector = detector();
        let frame = Frame::new(vec![0; 64 * 64 * 3], 64, 64, 3).unwrap();
        let original = frame.clone();

        let inference = detector.infer(&frame, &Thresholds::default()).unwrap();

        assert_eq!(frame, original);
        assert_ne!(inference.annotated, original);
        assert_eq!(inference.annotated.width(), 64);
    }

    #[test]
    fn test_infer_rejects_unsupported_layout() {
        let detector = detector();
        let frame = Frame::new(vec![0; 16], 4, 4, 1).unwrap();

        let result = detector.infer(&frame, &Thresholds::default());
        assert!(matches!(result, Err(DetectError::Render(_))));
    }
}
