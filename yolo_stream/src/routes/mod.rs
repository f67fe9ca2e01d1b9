mod health;
mod metrics;
mod predict;
mod video_feed;

use crate::{batch::BatchError, capture::OpenError, server::SharedState};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use thiserror::Error;
use yolo_inference::Thresholds;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/video_feed", get(video_feed::video_feed))
        .route("/stream_video", get(video_feed::stream_video))
        .route("/predict", post(predict::predict))
}

/// Errors raised before any response bytes are sent.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    ClientInput(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    SourceUnavailable(String),
    #[error("Something went wrong: {0}")]
    Internal(String),
}

impl From<OpenError> for ApiError {
    fn from(err: OpenError) -> Self {
        match err {
            OpenError::NotFound(_) => ApiError::NotFound(err.to_string()),
            OpenError::InvalidDevice(_) => ApiError::ClientInput(err.to_string()),
            OpenError::DeviceUnavailable(_) => ApiError::SourceUnavailable(err.to_string()),
            OpenError::Unreadable(_) => ApiError::Unprocessable(err.to_string()),
            OpenError::OpenCameraFailed(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<BatchError> for ApiError {
    fn from(err: BatchError) -> Self {
        match err {
            BatchError::InvalidName(_) => ApiError::ClientInput(err.to_string()),
            BatchError::Decode { .. } | BatchError::Detect { .. } | BatchError::Encode { .. } => {
                ApiError::Unprocessable(err.to_string())
            }
            BatchError::Storage { .. } => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::ClientInput(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::SourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        (status, self.to_string()).into_response()
    }
}

fn parse_threshold(name: &str, value: Option<&str>, default: f32) -> Result<f32, ApiError> {
    let Some(value) = value else {
        return Ok(default);
    };
    let parsed: f32 = value
        .trim()
        .parse()
        .map_err(|_| ApiError::ClientInput(format!("Invalid {} value: {:?}", name, value)))?;
    if !parsed.is_finite() || !(0.0..=1.0).contains(&parsed) {
        return Err(ApiError::ClientInput(format!(
            "{} must be between 0 and 1, got {}",
            name, parsed
        )));
    }
    Ok(parsed)
}

/// Absent values take the defaults; anything unparsable or outside [0, 1]
/// is rejected.
pub(crate) fn parse_thresholds(conf: Option<&str>, iou: Option<&str>) -> Result<Thresholds, ApiError> {
    let defaults = Thresholds::default();
    Ok(Thresholds {
        confidence: parse_threshold("conf", conf, defaults.confidence)?,
        iou: parse_threshold("iou", iou, defaults.iou)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_thresholds_defaults() {
        assert_eq!(parse_thresholds(None, None).unwrap(), Thresholds::default());
    }

    #[test]
    fn test_parse_thresholds_values() {
        let thresholds = parse_thresholds(Some("0.5"), Some(" 0.7 ")).unwrap();
        assert_eq!(thresholds.confidence, 0.5);
        assert_eq!(thresholds.iou, 0.7);
    }

    #[test]
    fn test_parse_thresholds_rejects_malformed() {
        assert!(matches!(
            parse_thresholds(Some("abc"), None),
            Err(ApiError::ClientInput(_))
        ));
        assert!(matches!(
            parse_thresholds(None, Some("")),
            Err(ApiError::ClientInput(_))
        ));
        assert!(matches!(
            parse_thresholds(Some("1.5"), None),
            Err(ApiError::ClientInput(_))
        ));
        assert!(matches!(
            parse_thresholds(Some("NaN"), None),
            Err(ApiError::ClientInput(_))
        ));
    }

    #[test]
    fn test_open_errors_map_to_status() {
        let not_found: ApiError = OpenError::NotFound("x.mp4".into()).into();
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let busy: ApiError = OpenError::DeviceUnavailable(0).into();
        assert_eq!(busy.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
