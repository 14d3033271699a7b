//! appforge - CLI entry point.
//!
//! Boots the sandbox runtime, adopts the workspace's current file tree, and
//! applies an AI response payload: from a file argument in batch mode, or
//! streamed from stdin when no argument is given.

use appforge::fs::FileSystemService;
use appforge::parser::extract_plan_steps;
use appforge::pipeline::ResponsePipeline;
use appforge::progress::ProgressTracker;
use appforge::runtime::sandbox::LocalProvider;
use appforge::runtime::RuntimeManager;
use appforge::Config;
use tokio_util::io::ReaderStream;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "appforge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        workspace = %config.workspace_path.display(),
        "loaded configuration"
    );

    // Construct and boot the service graph
    let runtime = RuntimeManager::new(Box::new(LocalProvider::new(
        config.workspace_path.clone(),
    )));
    runtime.boot().await?;

    let fs = FileSystemService::new(runtime.clone());
    fs.initialize_empty().await?;
    fs.start_reconciler(config.reconcile_interval).await;

    let pipeline = ResponsePipeline::new(fs.clone(), runtime.clone());
    let progress = tokio::spawn(ProgressTracker::new().observe(pipeline.subscribe()));

    // Apply the payload: file argument (batch) or stdin (streaming)
    let summary = match std::env::args().nth(1) {
        Some(path) => {
            let text = tokio::fs::read_to_string(&path).await?;
            if let Some(steps) = extract_plan_steps(&text) {
                for (index, step) in steps.iter().enumerate() {
                    info!(step = index + 1, "{}", step);
                }
            }
            pipeline.apply_code(&text).await?
        }
        None => {
            info!("reading response stream from stdin");
            pipeline
                .stream_and_apply(ReaderStream::new(tokio::io::stdin()))
                .await?
        }
    };

    info!(
        files = summary.files_created,
        commands = summary.commands_succeeded,
        "response applied"
    );
    if let Some(url) = runtime.preview_url().await {
        info!(url = %url, "preview available");
    }
    let health = runtime.get_health().await;
    info!(
        status = ?health.status,
        processes = health.process_count,
        "runtime health"
    );
    let _ = progress.await;

    // Keep serving while a dev server is running; ctrl-c tears down.
    if !runtime.processes().await.is_empty() {
        info!("dev server running; press ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
    }

    fs.stop_reconciler().await;
    runtime.teardown().await?;
    Ok(())
}
