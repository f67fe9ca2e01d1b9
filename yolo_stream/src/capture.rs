use crate::{
    config::CaptureConfig,
    cv_utils::{CvUtilsError, ImageConverter},
    frame::Frame,
};
use opencv::{
    core::{Mat, Vector},
    prelude::*,
    videoio,
};
use std::{fmt, path::PathBuf};
use thiserror::Error;

/// Where frames come from: a live device index or a stored video file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceIdentity {
    Device(i32),
    File(PathBuf),
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceIdentity::Device(index) => write!(f, "device {}", index),
            SourceIdentity::File(path) => write!(f, "file {}", path.display()),
        }
    }
}

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Video not found: {0}")]
    NotFound(PathBuf),
    #[error("Invalid device index {0}")]
    InvalidDevice(i32),
    #[error("Could not open camera device {0}")]
    DeviceUnavailable(i32),
    #[error("Could not open video: {0}")]
    Unreadable(PathBuf),
    #[error("Failed to open capture: {0}")]
    OpenCameraFailed(#[from] opencv::Error),
}

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(#[from] opencv::Error),
    #[error("Device {0} stopped delivering frames")]
    DeviceLost(i32),
    #[error("Failed to convert frame: {0}")]
    Convert(#[from] CvUtilsError),
}

/// A sequence of raw frames owned by exactly one pipeline.
///
/// `read_next` returns `Ok(None)` once a finite source is exhausted.
/// `release` must be idempotent and must not fail; implementations log
/// cleanup errors instead of returning them.
pub trait CaptureSource: Send {
    fn read_next(&mut self) -> Result<Option<Frame>, ReadError>;

    fn release(&mut self);
}

fn timeout_param(ms: u64) -> i32 {
    i32::try_from(ms).unwrap_or(i32::MAX)
}

pub struct OpenCvSource {
    identity: SourceIdentity,
    capture: Option<videoio::VideoCapture>,
}

impl fmt::Debug for OpenCvSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenCvSource")
            .field("identity", &self.identity)
            .field("open", &self.capture.is_some())
            .finish()
    }
}

impl OpenCvSource {
    pub fn open(identity: &SourceIdentity, config: &CaptureConfig) -> Result<Self, OpenError> {
        let params = Vector::<i32>::from_slice(&[
            videoio::CAP_PROP_OPEN_TIMEOUT_MSEC,
            timeout_param(config.open_timeout_ms),
            videoio::CAP_PROP_READ_TIMEOUT_MSEC,
            timeout_param(config.read_timeout_ms),
        ]);

        let capture = match identity {
            SourceIdentity::Device(index) => {
                if *index < 0 {
                    return Err(OpenError::InvalidDevice(*index));
                }
                let capture =
                    videoio::VideoCapture::new_with_params(*index, videoio::CAP_ANY, &params)?;
                if !capture.is_opened()? {
                    return Err(OpenError::DeviceUnavailable(*index));
                }
                capture
            }
            SourceIdentity::File(path) => {
                if !path.is_file() {
                    return Err(OpenError::NotFound(path.clone()));
                }
                let filename = path
                    .to_str()
                    .ok_or_else(|| OpenError::Unreadable(path.clone()))?;
                let capture =
                    videoio::VideoCapture::from_file_with_params(filename, videoio::CAP_ANY, &params)?;
                if !capture.is_opened()? {
                    return Err(OpenError::Unreadable(path.clone()));
                }
                capture
            }
        };

        tracing::info!("Opened capture source {}", identity);

        Ok(Self {
            identity: identity.clone(),
            capture: Some(capture),
        })
    }
}

impl CaptureSource for OpenCvSource {
    fn read_next(&mut self) -> Result<Option<Frame>, ReadError> {
        let Some(capture) = self.capture.as_mut() else {
            return Ok(None);
        };

        let mut frame = Mat::default();
        let grabbed = capture.read(&mut frame)?;
        if !grabbed || frame.empty() {
            return match self.identity {
                SourceIdentity::Device(index) => Err(ReadError::DeviceLost(index)),
                SourceIdentity::File(_) => Ok(None),
            };
        }

        Ok(Some(ImageConverter::mat_to_frame(&frame)?))
    }

    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            match capture.release() {
                Ok(()) => tracing::info!("Released capture source {}", self.identity),
                Err(e) => tracing::error!("Failed to release {}: {:?}", self.identity, e),
            }
        }
    }
}

impl Drop for OpenCvSource {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use opencv::{
        core::{self, Mat, Scalar, Size},
        prelude::*,
        videoio,
    };
    use std::path::Path;

    /// Writes `frames` 64x48 frames as an MJPG AVI with OpenCV's own encoder.
    pub fn write_mjpeg_clip(path: &Path, frames: usize) {
        let fourcc = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G').unwrap();
        let mut writer = videoio::VideoWriter::new_with_backend(
            path.to_str().unwrap(),
            videoio::CAP_OPENCV_MJPEG,
            fourcc,
            10.0,
            Size::new(64, 48),
            true,
        )
        .unwrap();
        assert!(writer.is_opened().unwrap());

        for index in 0..frames {
            let shade = (index * 20 % 256) as f64;
            let frame =
                Mat::new_rows_cols_with_default(48, 64, core::CV_8UC3, Scalar::all(shade))
                    .unwrap();
            writer.write(&frame).unwrap();
        }
        writer.release().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::testing::write_mjpeg_clip;
    use super::*;

    fn capture_config() -> CaptureConfig {
        CaptureConfig {
            open_timeout_ms: 100,
            read_timeout_ms: 100,
        }
    }

    #[test]
    fn test_open_missing_file_is_not_found() {
        let identity = SourceIdentity::File(PathBuf::from("./no/such/video.mp4"));

        match OpenCvSource::open(&identity, &capture_config()) {
            Err(OpenError::NotFound(path)) => assert_eq!(path, PathBuf::from("./no/such/video.mp4")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_open_negative_device_is_rejected() {
        let result = OpenCvSource::open(&SourceIdentity::Device(-1), &capture_config());
        assert!(matches!(result, Err(OpenError::InvalidDevice(-1))));
    }

    #[test]
    fn test_open_corrupt_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mp4");
        std::fs::write(&path, b"not a video container").unwrap();

        let result = OpenCvSource::open(&SourceIdentity::File(path), &capture_config());
        assert!(result.is_err());
    }

    #[test]
    fn test_timeout_param_saturates() {
        assert_eq!(timeout_param(5000), 5000);
        assert_eq!(timeout_param(i32::MAX as u64), i32::MAX);
        assert_eq!(timeout_param(u64::MAX), i32::MAX);
        assert_eq!(timeout_param(1 << 32), i32::MAX);
    }

    #[test]
    fn test_file_source_reads_until_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        write_mjpeg_clip(&path, 10);

        let mut source =
            OpenCvSource::open(&SourceIdentity::File(path), &capture_config()).unwrap();

        let mut frames = Vec::new();
        while let Some(frame) = source.read_next().unwrap() {
            frames.push(frame);
        }

        assert_eq!(frames.len(), 10);
        for frame in &frames {
            assert_eq!((frame.width(), frame.height(), frame.channels()), (64, 48, 3));
        }
        // Past the end a file keeps reporting end of stream.
        assert!(source.read_next().unwrap().is_none());
    }

    #[test]
    fn test_released_source_reads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        write_mjpeg_clip(&path, 3);

        let mut source =
            OpenCvSource::open(&SourceIdentity::File(path), &capture_config()).unwrap();
        assert!(source.read_next().unwrap().is_some());

        source.release();
        source.release();
        assert!(source.read_next().unwrap().is_none());
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(SourceIdentity::Device(2).to_string(), "device 2");
        assert_eq!(
            SourceIdentity::File(PathBuf::from("uploads/a.mp4")).to_string(),
            "file uploads/a.mp4"
        );
    }
}
