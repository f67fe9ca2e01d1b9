use crate::{
    batch::Storage,
    config::{CaptureConfig, Config},
    detector::Detector,
    routes::api_routes,
    telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{
    net::TcpListener,
    sync::{broadcast::Receiver, watch},
    task::JoinHandle,
};

#[derive(Clone)]
pub struct SharedState {
    pub detector: Arc<dyn Detector>,
    pub capture_config: CaptureConfig,
    pub storage: Arc<Storage>,
    pub metrics: Arc<Metrics>,
    pub shutdown: watch::Receiver<bool>,
}

pub fn build_router(app_state: SharedState, max_upload_bytes: usize) -> Router {
    Router::new()
        .merge(api_routes())
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(
        detector: Arc<dyn Detector>,
        config: &Config,
        stream_shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let metrics = Arc::new(Metrics::new()?);
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let app_state = SharedState {
            detector,
            capture_config: config.capture.clone(),
            storage: Arc::new(Storage::from_config(&config.storage)),
            metrics,
            shutdown: stream_shutdown,
        };

        let router = build_router(app_state, config.storage.max_upload_bytes).layer(metrics_layer);

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}
