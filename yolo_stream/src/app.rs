use crate::batch::Storage;
use crate::config::Config;
use crate::detector::{Detector, YoloDetector};
use crate::server::HttpServer;

use std::{error::Error, sync::Arc};
use tokio::{
    signal,
    sync::{broadcast, watch},
};
use yolo_inference::{config::Validatable, ClassLabels, OrtModelService};

/// Loads the model and label table, then serves until Ctrl+C or SIGTERM.
pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let class_labels = match ClassLabels::from_file(&config.labels.get_path()) {
        Ok(labels) => labels,
        Err(e) => {
            tracing::error!("Failed to load class labels: {:?}", e);
            return Err(Box::new(e));
        }
    };
    tracing::info!("Loaded {} class labels", class_labels.len());

    let model_service = match OrtModelService::new(&config.model) {
        Ok(service) => service,
        Err(e) => {
            tracing::error!("Failed to initialize model service: {:?}", e);
            return Err(e);
        }
    };

    Storage::from_config(&config.storage).ensure_dirs()?;

    let detector: Arc<dyn Detector> = Arc::new(YoloDetector::new(model_service, class_labels));
    let (stream_shutdown_tx, stream_shutdown_rx) = watch::channel(false);
    let server = HttpServer::new(detector, &config, stream_shutdown_rx).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();

    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    // Open streams never finish on their own; stop them so the server can drain.
    stream_shutdown_tx.send_replace(true);
    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
