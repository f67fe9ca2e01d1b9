use crate::{
    config::StorageConfig,
    detector::{DetectError, Detection, Detector},
    frame::{Frame, FrameError},
};
use bytes::Bytes;
use serde::Serialize;
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use yolo_inference::Thresholds;

const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Anything outside the video allow-list is treated as an image.
    pub fn from_filename(filename: &str) -> Self {
        let is_video = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false);

        if is_video {
            MediaKind::Video
        } else {
            MediaKind::Image
        }
    }
}

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Invalid upload name: {0:?}")]
    InvalidName(String),
    #[error("Failed to store {path}: {source}")]
    Storage { path: PathBuf, source: io::Error },
    #[error("Could not read image {upload}: {source}")]
    Decode { upload: String, source: FrameError },
    #[error("Detection failed for {upload}: {source}")]
    Detect { upload: String, source: DetectError },
    #[error("Could not encode result for {upload}: {source}")]
    Encode { upload: String, source: FrameError },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResultRecord {
    pub upload_name: String,
    pub artifact_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    pub conf: f32,
    pub iou: f32,
    pub detections: Vec<Detection>,
    pub is_video: bool,
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub data: Bytes,
}

/// Reduces an uploaded name to a safe basename: ASCII letters, digits,
/// `.`, `_` and `-`, with whitespace turned into `_`. Returns `None` when
/// nothing usable is left.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    let basename = filename.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = basename
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let cleaned = cleaned.trim_start_matches(['.', '_']).to_string();

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

pub fn unique_name(prefix: &str, filename: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%6f");
    let ext = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext))
        .unwrap_or_else(|| ".jpg".to_string());
    format!("{}_{}{}", prefix, timestamp, ext)
}

fn reference_path(path: &Path) -> String {
    let path = path.to_string_lossy().replace('\\', '/');
    let path = path.trim_start_matches("./");
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

#[derive(Debug, Clone)]
pub struct Storage {
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl Storage {
    pub fn new(upload_dir: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            upload_dir,
            output_dir,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.upload_dir.clone(), config.output_dir.clone())
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.upload_dir)?;
        std::fs::create_dir_all(&self.output_dir)
    }

    pub fn resolve_upload(&self, video_file: &str) -> Option<PathBuf> {
        sanitize_filename(video_file).map(|name| self.upload_dir.join(name))
    }

    fn write(path: &Path, data: &[u8]) -> Result<(), BatchError> {
        std::fs::write(path, data).map_err(|source| BatchError::Storage {
            path: path.to_path_buf(),
            source,
        })
    }
}

pub fn process_upload(
    upload: &UploadedFile,
    detector: &dyn Detector,
    thresholds: &Thresholds,
    storage: &Storage,
) -> Result<BatchResultRecord, BatchError> {
    // Sanitizing may drop the dot before the extension.
    let kind = MediaKind::from_filename(&upload.filename);
    let filename = sanitize_filename(&upload.filename)
        .ok_or_else(|| BatchError::InvalidName(upload.filename.clone()))?;

    let in_name = unique_name("in", &upload.filename);
    let in_path = storage.upload_dir.join(&in_name);
    Storage::write(&in_path, &upload.data)?;

    match kind {
        MediaKind::Video => {
            tracing::info!("Stored video {} as {}", filename, in_name);
            Ok(BatchResultRecord {
                upload_name: filename,
                artifact_path: reference_path(&in_path),
                stream_url: Some(format!(
                    "/stream_video?video_file={}&conf={}&iou={}",
                    in_name, thresholds.confidence, thresholds.iou
                )),
                conf: thresholds.confidence,
                iou: thresholds.iou,
                detections: Vec::new(),
                is_video: true,
            })
        }
        MediaKind::Image => {
            let frame = Frame::decode(&upload.data).map_err(|source| BatchError::Decode {
                upload: filename.clone(),
                source,
            })?;
            let inference =
                detector
                    .infer(&frame, thresholds)
                    .map_err(|source| BatchError::Detect {
                        upload: filename.clone(),
                        source,
                    })?;
            let jpeg = inference
                .annotated
                .encode_jpeg()
                .map_err(|source| BatchError::Encode {
                    upload: filename.clone(),
                    source,
                })?;

            let out_name = unique_name("out", &format!("{}.jpg", filename));
            let out_path = storage.output_dir.join(out_name);
            Storage::write(&out_path, &jpeg)?;

            tracing::info!(
                "Annotated {} with {} detections",
                filename,
                inference.detections.len()
            );
            Ok(BatchResultRecord {
                upload_name: filename,
                artifact_path: reference_path(&out_path),
                stream_url: None,
                conf: thresholds.confidence,
                iou: thresholds.iou,
                detections: inference.detections,
                is_video: false,
            })
        }
    }
}
