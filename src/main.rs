use mediarelay::adapters::ffmpeg::ProcessTranscoder;
use mediarelay::adapters::http::{router, HttpUploader};
use mediarelay::{PipelineService, RelayConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RelayConfig::from_env();
    let settings = config.pipeline_settings();
    info!(
        ffmpeg = ?config.ffmpeg_path,
        upload_url = %config.upload_url,
        mode = %settings.mode,
        scratch = ?settings.scratch_root,
        "starting relay"
    );

    let pipeline = Arc::new(PipelineService::new(
        ProcessTranscoder::ffmpeg(&config.ffmpeg_path),
        HttpUploader::new(&config.upload_url),
        settings,
    ));
    let app = router(pipeline, config.is_test);

    let listener = tokio::net::TcpListener::bind(config.bind_address())
        .await
        .expect("Failed to bind TCP listener");
    info!("Listening at {}", config.bind_address());
    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}
