use crate::{
    detector::Detection,
    frame::{Frame, FrameError},
};
use opencv::{
    core::{self, Mat, Point, Rect, Scalar},
    imgproc,
    prelude::*,
};
use thiserror::Error;
use yolo_inference::ClassLabels;

const DEFAULT_COLOR: (u8, u8, u8) = (0, 255, 0);

#[derive(Error, Debug)]
pub enum CvUtilsError {
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
    #[error("Unsupported matrix depth {0}, expected 8-bit")]
    UnsupportedDepth(i32),
    #[error("Unsupported channel count {0}")]
    UnsupportedChannels(i32),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

pub struct ImageConverter;

impl ImageConverter {
    /// Copies an 8-bit Mat into an owned BGR frame, converting gray and BGRA input.
    pub fn mat_to_frame(mat: &Mat) -> Result<Frame, CvUtilsError> {
        if mat.depth() != core::CV_8U {
            return Err(CvUtilsError::UnsupportedDepth(mat.depth()));
        }

        let bgr = match mat.channels() {
            3 => mat.try_clone()?,
            1 => Self::convert(mat, imgproc::COLOR_GRAY2BGR)?,
            4 => Self::convert(mat, imgproc::COLOR_BGRA2BGR)?,
            other => return Err(CvUtilsError::UnsupportedChannels(other)),
        };

        let size = bgr.size()?;
        let data = bgr.data_bytes()?.to_vec();
        let frame = Frame::new(data, size.width as u32, size.height as u32, 3)?;
        Ok(frame)
    }

    pub fn frame_to_mat(frame: &Frame) -> Result<Mat, CvUtilsError> {
        let mat = Mat::from_slice(frame.data())?
            .reshape(frame.channels() as i32, frame.height() as i32)?
            .try_clone()?;
        Ok(mat)
    }

    fn convert(mat: &Mat, code: i32) -> Result<Mat, CvUtilsError> {
        let mut converted = Mat::default();
        imgproc::cvt_color_def(mat, &mut converted, code)?;
        Ok(converted)
    }

    /// Draws labeled boxes onto `mat` using the label table colors.
    pub fn annotate_frame(
        mat: &mut Mat,
        detections: &[Detection],
        labels: &ClassLabels,
    ) -> Result<(), CvUtilsError> {
        for detection in detections {
            let x1 = detection.x1 as i32;
            let y1 = detection.y1 as i32;
            let x2 = detection.x2 as i32;
            let y2 = detection.y2 as i32;
            let label = format!("{}: {:.2}", detection.class_name, detection.confidence);

            let (red, green, blue) = labels
                .get(detection.class_id)
                .map(|color_label| (color_label.red, color_label.green, color_label.blue))
                .unwrap_or(DEFAULT_COLOR);
            let color = Scalar::new(blue as f64, green as f64, red as f64, 0.0);

            imgproc::rectangle(
                mat,
                Rect::new(x1, y1, x2 - x1, y2 - y1),
                color,
                2,
                imgproc::LINE_8,
                0,
            )?;

            imgproc::put_text(
                mat,
                &label,
                Point::new(x1, (y1 - 5).max(12)),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                color,
                1,
                imgproc::LINE_AA,
                false,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_mat_round_trip() {
        let data: Vec<u8> = (0..4 * 3 * 3).map(|v| v as u8).collect();
        let frame = Frame::new(data, 4, 3, 3).unwrap();

        let mat = ImageConverter::frame_to_mat(&frame).unwrap();
        assert_eq!(mat.rows(), 3);
        assert_eq!(mat.cols(), 4);
        assert_eq!(mat.channels(), 3);

        let back = ImageConverter::mat_to_frame(&mat).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_gray_mat_is_expanded_to_bgr() {
        let gray = Frame::new(vec![7; 6], 3, 2, 1).unwrap();
        let mat = ImageConverter::frame_to_mat(&gray).unwrap();

        let frame = ImageConverter::mat_to_frame(&mat).unwrap();
        assert_eq!(frame.channels(), 3);
        assert_eq!(frame.data(), &[7; 18]);
    }

    #[test]
    fn test_annotate_draws_on_mat() {
        let frame = Frame::new(vec![0; 64 * 64 * 3], 64, 64, 3).unwrap();
        let mut mat = ImageConverter::frame_to_mat(&frame).unwrap();
        let detections = vec![Detection {
            class_id: 3,
            class_name: "3".to_string(),
            confidence: 0.9,
            x1: 10.,
            y1: 20.,
            x2: 40.,
            y2: 50.,
        }];

        ImageConverter::annotate_frame(&mut mat, &detections, &ClassLabels::default()).unwrap();

        let annotated = ImageConverter::mat_to_frame(&mat).unwrap();
        assert_ne!(annotated, frame);
    }
}
