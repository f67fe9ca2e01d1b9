use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider, UpDownCounter},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("Failed to build metrics exporter: {0}")]
pub struct TelemetryError(String);

pub struct Metrics {
    request_counter: Counter<u64>,
    prediction_duration: Histogram<u64>,
    frames_emitted: Counter<u64>,
    active_streams: UpDownCounter<i64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| TelemetryError(e.to_string()))?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("yolo_stream");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let boundaries = generate_boundaries((15, 30, 60, 500, 1000));

        let prediction_duration = meter
            .u64_histogram("prediction_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of one-shot prediction requests in milliseconds")
            .build();

        let frames_emitted = meter
            .u64_counter("frames_emitted_total")
            .with_description("Annotated frames written to multipart streams")
            .build();

        let active_streams = meter
            .i64_up_down_counter("active_streams")
            .with_description("Streams currently being served")
            .build();

        Ok(Metrics {
            request_counter,
            prediction_duration,
            frames_emitted,
            active_streams,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_prediction_duration(&self, duration_ms: u64, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.prediction_duration.record(duration_ms, &attributes);
    }

    pub fn record_frames_emitted(&self, frames: u64, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.frames_emitted.add(frames, &attributes);
    }

    pub fn stream_started(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.active_streams.add(1, &attributes);
    }

    pub fn stream_finished(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.active_streams.add(-1, &attributes);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_boundaries() {
        let parts = (2, 22, 26, 46, 146);
        let get = generate_boundaries(parts);
        let expected = vec![2.0, 12.0, 22.0, 24.0, 26.0, 46.0, 146.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_recorded_streams_show_up_in_registry() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("/video_feed");
        metrics.stream_started("/video_feed");
        metrics.record_frames_emitted(10, "/video_feed");
        metrics.stream_finished("/video_feed");

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        assert!(names.iter().any(|name| name.starts_with("frames_emitted")));
        assert!(names.iter().any(|name| name.starts_with("requests")));
    }
}
