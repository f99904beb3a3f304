use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet_comfyui::ComfyUIEndpoint;
use fleet_core::endpoint::Endpoint;
use fleet_dispatch::{DispatchConfig, Dispatcher, QueueKind};
use fleet_events::{BatchEvent, EventJournal};
use fleet_worker::{load_workflow, wait_for_run_end, BatchInput, WORKFLOW_PATH_VAR};

/// How long startup waits for every ComfyUI WebSocket to connect.
const CONNECT_WAIT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "fleet_worker=debug,fleet_dispatch=debug,fleet_comfyui=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = DispatchConfig::from_env().context("invalid dispatcher configuration")?;
    let input = BatchInput::from_args(std::env::args().skip(1), std::env::var(WORKFLOW_PATH_VAR).ok())?;
    let workflow = load_workflow(&input.workflow_path).await?;
    tracing::info!(
        gpu_count = config.gpu_count,
        host = %config.host,
        base_port = config.base_port,
        images = input.images.len(),
        "Loaded worker configuration",
    );

    // --- Endpoints ---
    let http = reqwest::Client::new();
    let comfyui: Vec<Arc<ComfyUIEndpoint>> = config
        .endpoint_ports()
        .into_iter()
        .enumerate()
        .map(|(id, port)| Arc::new(ComfyUIEndpoint::for_host(id, &config.host, port, http.clone())))
        .collect();
    for endpoint in &comfyui {
        if let Err(e) = endpoint.health_check().await {
            tracing::warn!(endpoint = endpoint.id(), error = %e, "ComfyUI health check failed");
        }
        endpoint.start();
    }
    wait_connected(&comfyui).await;

    // --- Dispatcher ---
    let endpoints = comfyui
        .iter()
        .map(|e| Arc::clone(e) as Arc<dyn Endpoint>)
        .collect();
    let dispatcher = Dispatcher::start(&config, endpoints)?;
    let journal = tokio::spawn(EventJournal::run(dispatcher.subscribe()));
    let mut events = dispatcher.subscribe();

    for job in input.jobs(&workflow) {
        dispatcher.enqueue_upload(job)?;
    }
    let run_id = dispatcher.start_run(QueueKind::Upload, None)?;

    let outcome = tokio::select! {
        outcome = wait_for_run_end(&mut events, run_id) => outcome,
        () = shutdown_signal() => {
            dispatcher.stop(run_id)?;
            tracing::info!(run_id, "Waiting for in-flight jobs to settle");
            wait_for_run_end(&mut events, run_id).await
        }
    };

    match &outcome {
        Some((event, counts)) => tracing::info!(
            run_id,
            outcome = event.event_type(),
            completed = counts.completed,
            failed = counts.failed,
            timed_out = counts.timed_out,
            cancelled = counts.cancelled,
            dropped_previews = counts.dropped_previews,
            "Batch finished",
        ),
        None => tracing::warn!(run_id, "Event stream closed before the run finished"),
    }

    // --- Shutdown ---
    dispatcher.shutdown();
    for endpoint in &comfyui {
        endpoint.shutdown().await;
    }
    drop(dispatcher);
    journal.abort();
    tracing::info!("Worker shut down");

    match outcome {
        Some((BatchEvent::BatchComplete(counts), _)) if counts.failed + counts.timed_out == 0 => Ok(()),
        Some(_) => anyhow::bail!("run {run_id} did not complete cleanly"),
        None => anyhow::bail!("run {run_id} ended without a final event"),
    }
}

/// Give every endpoint a chance to open its WebSocket before the run
/// starts; submitting to a disconnected endpoint disables it.
async fn wait_connected(endpoints: &[Arc<ComfyUIEndpoint>]) {
    let deadline = tokio::time::Instant::now() + CONNECT_WAIT;
    while !endpoints.iter().all(|e| e.is_connected()) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    for endpoint in endpoints.iter().filter(|e| !e.is_connected()) {
        tracing::warn!(endpoint = endpoint.id(), "ComfyUI not connected, it will be skipped this run");
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), stopping run");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, stopping run");
        }
    }
}
