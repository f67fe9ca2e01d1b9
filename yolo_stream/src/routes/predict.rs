use crate::{
    batch::{process_upload, BatchResultRecord, UploadedFile},
    routes::{parse_thresholds, ApiError},
    server::SharedState,
};
use axum::{
    extract::{Multipart, State},
    response::Json,
};
use std::time::Instant;
use tracing::instrument;

const ROUTE: &str = "/predict";

struct PredictForm {
    files: Vec<UploadedFile>,
    conf: Option<String>,
    iou: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> Result<PredictForm, ApiError> {
    let mut form = PredictForm {
        files: Vec::new(),
        conf: None,
        iou: None,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::ClientInput(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::ClientInput(format!("Failed to read upload: {}", e)))?;
                form.files.push(UploadedFile { filename, data });
            }
            "conf" | "iou" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::ClientInput(format!("Failed to read {}: {}", name, e)))?;
                if name == "conf" {
                    form.conf = Some(value);
                } else {
                    form.iou = Some(value);
                }
            }
            other => tracing::debug!("Ignoring form field {:?}", other),
        }
    }

    Ok(form)
}

#[instrument(skip(state, multipart))]
pub async fn predict(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> Result<Json<Vec<BatchResultRecord>>, ApiError> {
    state.metrics.record_request(ROUTE);
    let started = Instant::now();

    let form = read_form(multipart).await?;
    if form.files.is_empty() {
        return Err(ApiError::ClientInput("No file uploaded".to_string()));
    }
    if form.files.iter().all(|file| file.filename.is_empty()) {
        return Err(ApiError::ClientInput("No selected files".to_string()));
    }
    let thresholds = parse_thresholds(form.conf.as_deref(), form.iou.as_deref())?;

    let detector = state.detector.clone();
    let storage = state.storage.clone();
    let records = tokio::task::spawn_blocking(move || {
        form.files
            .iter()
            .filter(|file| !file.filename.is_empty())
            .map(|file| process_upload(file, detector.as_ref(), &thresholds, &storage))
            .collect::<Result<Vec<_>, _>>()
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Prediction task failed: {}", e)))??;

    state
        .metrics
        .record_prediction_duration(started.elapsed().as_millis() as u64, ROUTE);
    tracing::info!("Processed {} uploads", records.len());

    Ok(Json(records))
}
