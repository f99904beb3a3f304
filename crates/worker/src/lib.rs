//! Batch input handling and run supervision for the `fleet-worker` binary.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tokio::sync::broadcast;

use fleet_core::job::Job;
use fleet_core::types::RunId;
use fleet_events::{BatchCounts, BatchEvent};

/// Environment fallback for the workflow path when none is given on the
/// command line.
pub const WORKFLOW_PATH_VAR: &str = "WORKFLOW_PATH";

/// What one worker invocation processes: a workflow applied to a list of
/// source images.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchInput {
    pub workflow_path: PathBuf,
    pub images: Vec<PathBuf>,
}

impl BatchInput {
    /// Parse `[<workflow.json>] <image>...` (program name already skipped).
    ///
    /// A first argument ending in `.json` is the workflow; otherwise the
    /// workflow comes from `workflow_env`.
    pub fn from_args(
        args: impl IntoIterator<Item = String>,
        workflow_env: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut args: Vec<String> = args.into_iter().collect();
        let workflow_path = match args.first() {
            Some(first) if first.ends_with(".json") => PathBuf::from(args.remove(0)),
            _ => match workflow_env {
                Some(path) => PathBuf::from(path),
                None => bail!("usage: fleet-worker <workflow.json> <image>... (or set {WORKFLOW_PATH_VAR})"),
            },
        };
        if args.is_empty() {
            bail!("no input images given");
        }
        Ok(Self {
            workflow_path,
            images: args.into_iter().map(PathBuf::from).collect(),
        })
    }

    /// Build one queued job per image, all sharing `workflow`.
    pub fn jobs(&self, workflow: &serde_json::Value) -> Vec<Job> {
        self.images
            .iter()
            .map(|image| Job::new(image.display().to_string(), display_name(image), workflow.clone()))
            .collect()
    }
}

/// Read and parse an API-format ComfyUI workflow.
pub async fn load_workflow(path: &Path) -> anyhow::Result<serde_json::Value> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read workflow {}", path.display()))?;
    let workflow: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("workflow {} is not valid JSON", path.display()))?;
    if !workflow.is_object() {
        bail!("workflow {} must be a JSON object of nodes", path.display());
    }
    Ok(workflow)
}

/// Wait for the event that ends `run_id` and return its counters.
///
/// Returns `None` if the event stream closes first.
pub async fn wait_for_run_end(
    events: &mut broadcast::Receiver<BatchEvent>,
    run_id: RunId,
) -> Option<(BatchEvent, BatchCounts)> {
    loop {
        match events.recv().await {
            Ok(event) if event.run_id() == run_id => match &event {
                BatchEvent::BatchComplete(counts) | BatchEvent::BatchStopped(counts) => {
                    let counts = counts.clone();
                    return Some((event, counts));
                }
                _ => {}
            },
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, run_id, "Run supervisor lagged behind event stream");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
