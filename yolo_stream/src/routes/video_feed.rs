use crate::{
    capture::{OpenCvSource, OpenError, SourceIdentity},
    pipeline::FramePipeline,
    routes::{parse_thresholds, ApiError},
    server::SharedState,
    stream::{VideoStream, CONTENT_TYPE},
};
use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::Response,
};
use serde::Deserialize;
use tracing::instrument;
use yolo_inference::Thresholds;

#[derive(Debug, Deserialize)]
pub struct VideoFeedParams {
    cam: Option<String>,
    conf: Option<String>,
    iou: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamVideoParams {
    video_file: Option<String>,
    conf: Option<String>,
    iou: Option<String>,
}

#[instrument(skip(state))]
pub async fn video_feed(
    State(state): State<SharedState>,
    Query(params): Query<VideoFeedParams>,
) -> Result<Response, ApiError> {
    state.metrics.record_request("/video_feed");
    let thresholds = parse_thresholds(params.conf.as_deref(), params.iou.as_deref())?;
    let cam = match params.cam.as_deref() {
        None => 0,
        Some(value) => value
            .trim()
            .parse::<i32>()
            .ok()
            .filter(|index| *index >= 0)
            .ok_or_else(|| ApiError::ClientInput(format!("Invalid camera index: {:?}", value)))?,
    };

    start_stream(state, SourceIdentity::Device(cam), thresholds, "/video_feed").await
}

#[instrument(skip(state))]
pub async fn stream_video(
    State(state): State<SharedState>,
    Query(params): Query<StreamVideoParams>,
) -> Result<Response, ApiError> {
    state.metrics.record_request("/stream_video");
    let video_file = params
        .video_file
        .as_deref()
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| ApiError::ClientInput("Missing video file path".to_string()))?;
    let thresholds = parse_thresholds(params.conf.as_deref(), params.iou.as_deref())?;

    let video_path = state
        .storage
        .resolve_upload(video_file)
        .ok_or_else(|| ApiError::ClientInput(format!("Invalid video file name: {:?}", video_file)))?;
    if !video_path.is_file() {
        return Err(ApiError::NotFound(format!(
            "Video not found: {}",
            video_path.display()
        )));
    }

    start_stream(state, SourceIdentity::File(video_path), thresholds, "/stream_video").await
}

/// Opens the source before responding so open failures become HTTP errors,
/// then hands the running pipeline to a blocking stream writer.
async fn start_stream(
    state: SharedState,
    identity: SourceIdentity,
    thresholds: Thresholds,
    route: &'static str,
) -> Result<Response, ApiError> {
    let detector = state.detector.clone();
    let capture_config = state.capture_config.clone();

    let pipeline = tokio::task::spawn_blocking(move || {
        let mut pipeline = FramePipeline::new(identity, detector, thresholds);
        pipeline.start(|identity| OpenCvSource::open(identity, &capture_config))?;
        Ok::<_, OpenError>(pipeline)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Capture open task failed: {}", e)))??;

    let (stream, handle) = VideoStream::new(pipeline, state.shutdown.clone()).spawn();

    let metrics = state.metrics.clone();
    metrics.stream_started(route);
    tokio::spawn(async move {
        match handle.await {
            Ok(report) => metrics.record_frames_emitted(report.frames_sent, route),
            Err(e) => tracing::error!("Stream worker for {} panicked: {:?}", route, e),
        }
        metrics.stream_finished(route);
    });

    Response::builder()
        .header(header::CONTENT_TYPE, CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(format!("Http builder error: {}", e)))
}
