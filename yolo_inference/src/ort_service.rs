use crate::{
    config::{ModelConfig, Validatable},
    model_service::{BoundingBox, ModelError, ModelService, Thresholds},
};
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, ArrayView2, Axis, Ix3, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

fn intersection(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    let width = (box1.x2.min(box2.x2) - box1.x1.max(box2.x1)).max(0.);
    let height = (box1.y2.min(box2.y2) - box1.y1.max(box2.y1)).max(0.);
    width * height
}

fn union(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    box1.area() + box2.area() - intersection(box1, box2)
}

fn iou(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

fn transform_image(image: &RgbImage, input_size: u32) -> Array<f32, Ix4> {
    let size = input_size as usize;
    let img = image::imageops::resize(image, input_size, input_size, FilterType::CatmullRom);

    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in img.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// Turns a `[4 + num_classes, num_anchors]` output slice into boxes in image
/// coordinates, keeping only those at or above the confidence threshold.
fn decode_output(
    output: ArrayView2<f32>,
    img_width: u32,
    img_height: u32,
    input_size: u32,
    min_confidence: f32,
) -> Vec<BoundingBox> {
    let scale_x = img_width as f32 / input_size as f32;
    let scale_y = img_height as f32 / input_size as f32;
    let max_x = img_width as f32;
    let max_y = img_height as f32;

    let mut boxes = Vec::new();
    for column in output.axis_iter(Axis(1)) {
        let best = column
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum });

        let Some((class_id, prob)) = best else {
            continue;
        };
        if prob.is_nan() || prob < min_confidence {
            continue;
        }

        let xc = column[0] * scale_x;
        let yc = column[1] * scale_y;
        let w = column[2] * scale_x;
        let h = column[3] * scale_y;

        let bbox = BoundingBox {
            class_id: class_id as u32,
            confidence: prob,
            x1: (xc - w / 2.).clamp(0., max_x),
            y1: (yc - h / 2.).clamp(0., max_y),
            x2: (xc + w / 2.).clamp(0., max_x),
            y2: (yc + h / 2.).clamp(0., max_y),
        };
        if bbox.is_degenerate() {
            continue;
        }
        boxes.push(bbox);
    }

    boxes
}

/// Per-class non-maximum suppression. Output is sorted by descending confidence.
fn non_max_suppression(
    mut boxes: Vec<BoundingBox>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<BoundingBox> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));

    let mut result: Vec<BoundingBox> = Vec::new();
    for candidate in boxes {
        if result.len() >= max_detections {
            break;
        }
        let suppressed = result
            .iter()
            .any(|kept| kept.class_id == candidate.class_id && iou(kept, &candidate) > iou_threshold);
        if !suppressed {
            result.push(candidate);
        }
    }

    result
}

#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    input_size: u32,
    max_detections: usize,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> Result<Self, Box<dyn std::error::Error>> {
        model_config.validate()?;

        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!("Created {} ONNX sessions", num_instances);

        Ok(Self {
            counter: Arc::new(AtomicUsize::new(0)),
            sessions: Arc::new(sessions),
            input_size: model_config.input_size,
            max_detections: model_config.max_detections,
        })
    }

    pub fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ndarray::ArrayD<f32>, ModelError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index].lock();

        tracing::debug!("Handling request with session {}", index);

        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| ModelError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InvalidOutput(format!("failed to extract tensor: {}", e)))?;

        let ix = shape.to_ixdyn();
        let array = ndarray::ArrayD::from_shape_vec(ix, data.to_vec())
            .map_err(|e| ModelError::InvalidOutput(format!("invalid tensor shape: {}", e)))?;

        Ok(array)
    }
}

impl ModelService for OrtModelService {
    fn predict(
        &self,
        image: &RgbImage,
        thresholds: &Thresholds,
    ) -> Result<Vec<BoundingBox>, ModelError> {
        let (img_width, img_height) = image.dimensions();
        if img_width == 0 || img_height == 0 {
            return Err(ModelError::Transform("empty image".to_string()));
        }

        let input = transform_image(image, self.input_size);
        let outputs = self
            .run_inference(&input)?
            .into_dimensionality::<Ix3>()
            .map_err(|e| ModelError::InvalidOutput(format!("expected a 3d output: {}", e)))?;

        if outputs.shape()[1] <= 4 {
            return Err(ModelError::InvalidOutput(format!(
                "unexpected output shape {:?}",
                outputs.shape()
            )));
        }

        let boxes = decode_output(
            outputs.index_axis(Axis(0), 0),
            img_width,
            img_height,
            self.input_size,
            thresholds.confidence,
        );
        let detections = non_max_suppression(boxes, thresholds.iou, self.max_detections);

        tracing::debug!("Returning {} detections", detections.len());
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::Array2;

    fn bbox(class_id: u32, confidence: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        BoundingBox {
            class_id,
            confidence,
            x1,
            y1,
            x2,
            y2,
        }
    }

    #[test]
    fn test_transform_image() {
        let img = RgbImage::from_pixel(100, 50, Rgb([255, 0, 0]));
        let input = transform_image(&img, 64);

        assert_eq!(input.shape(), &[1, 3, 64, 64]);
        assert!((input[[0, 0, 10, 10]] - 1.0).abs() < 1e-3);
        assert!(input[[0, 1, 10, 10]].abs() < 1e-3);
    }

    #[test]
    fn test_decode_output_scales_and_filters() {
        // 2 classes, 3 anchors; columns are (xc, yc, w, h, score0, score1)
        let output = Array2::from_shape_vec(
            (6, 3),
            vec![
                32., 16., 32., //
                32., 16., 32., //
                16., 8., 16., //
                16., 8., 16., //
                0.9, 0.1, 0.0, //
                0.05, 0.2, 0.6,
            ],
        )
        .unwrap();

        let boxes = decode_output(output.view(), 128, 128, 64, 0.25);

        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].class_id, 0);
        assert!((boxes[0].x1 - 48.).abs() < 1e-4);
        assert!((boxes[0].x2 - 80.).abs() < 1e-4);
        assert_eq!(boxes[1].class_id, 1);
        assert!((boxes[1].confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_decode_output_clamps_to_image() {
        let output = Array2::from_shape_vec((5, 1), vec![0., 0., 20., 20., 0.8]).unwrap();
        let boxes = decode_output(output.view(), 64, 64, 64, 0.25);

        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].x1, 0.);
        assert_eq!(boxes[0].y1, 0.);
        assert!((boxes[0].x2 - 10.).abs() < 1e-4);
    }

    #[test]
    fn test_decode_output_drops_degenerate_boxes() {
        let output = Array2::from_shape_vec((5, 1), vec![10., 10., 0., 5., 0.9]).unwrap();
        assert!(decode_output(output.view(), 64, 64, 64, 0.25).is_empty());
    }

    #[test]
    fn test_nms_suppresses_same_class_overlap() {
        let boxes = vec![
            bbox(0, 0.8, 0., 0., 10., 10.),
            bbox(0, 0.9, 1., 1., 11., 11.),
            bbox(1, 0.7, 1., 1., 11., 11.),
            bbox(0, 0.6, 50., 50., 60., 60.),
        ];

        let result = non_max_suppression(boxes, 0.45, 300);

        assert_eq!(result.len(), 3);
        assert_eq!(result[0].confidence, 0.9);
        assert_eq!(result[1].class_id, 1);
        assert_eq!(result[2].confidence, 0.6);
    }

    #[test]
    fn test_nms_respects_max_detections() {
        let boxes = (0..10)
            .map(|i| bbox(0, 0.5, i as f32 * 20., 0., i as f32 * 20. + 10., 10.))
            .collect();

        assert_eq!(non_max_suppression(boxes, 0.45, 4).len(), 4);
    }

    #[test]
    fn test_detections_satisfy_box_and_confidence_invariants() {
        let mut values = vec![0f32; 6 * 50];
        for anchor in 0..50 {
            let f = anchor as f32;
            values[anchor] = (f * 7.) % 64.;
            values[50 + anchor] = (f * 13.) % 64.;
            values[2 * 50 + anchor] = (f * 3.) % 40.;
            values[3 * 50 + anchor] = (f * 5.) % 40.;
            values[4 * 50 + anchor] = (f * 0.037) % 1.;
            values[5 * 50 + anchor] = (f * 0.061) % 1.;
        }
        let output = Array2::from_shape_vec((6, 50), values).unwrap();
        let thresholds = Thresholds {
            confidence: 0.3,
            iou: 0.45,
        };

        let boxes = decode_output(output.view(), 320, 240, 64, thresholds.confidence);
        let result = non_max_suppression(boxes, thresholds.iou, 300);

        assert!(!result.is_empty());
        for detection in result {
            assert!(detection.x1 < detection.x2);
            assert!(detection.y1 < detection.y2);
            assert!(detection.confidence >= thresholds.confidence);
        }
    }
}
