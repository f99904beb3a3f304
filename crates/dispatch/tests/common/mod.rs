//! Shared fixtures for dispatcher integration tests: an in-memory endpoint
//! driven by the test, and helpers for waiting on normalized events.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use fleet_core::endpoint::{Endpoint, EndpointError, EndpointEvent, EndpointEvents, PreviewRef};
use fleet_core::job::{Job, Stage};
use fleet_core::types::{EndpointId, EngineHandle, JobId};
use fleet_dispatch::{DispatchConfig, Dispatcher};
use fleet_events::BatchEvent;

/// How a scripted submit should fail.
#[derive(Debug, Clone, Copy)]
pub enum SubmitFailure {
    Connection,
    Rejected,
}

/// Endpoint whose engine behavior is scripted by the test.
pub struct ScriptedEndpoint {
    id: EndpointId,
    tx: mpsc::UnboundedSender<EndpointEvent>,
    rx: Mutex<Option<EndpointEvents>>,
    next_handle: AtomicU64,
    submitted: Mutex<Vec<(JobId, EngineHandle)>>,
    cancelled: Mutex<Vec<EngineHandle>>,
    fail_next: Mutex<Option<SubmitFailure>>,
    /// Run every submitted job to completion without test involvement.
    auto_complete: bool,
}

impl ScriptedEndpoint {
    pub fn new(id: EndpointId) -> Arc<Self> {
        Self::build(id, false)
    }

    pub fn auto_completing(id: EndpointId) -> Arc<Self> {
        Self::build(id, true)
    }

    fn build(id: EndpointId, auto_complete: bool) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            tx,
            rx: Mutex::new(Some(rx)),
            next_handle: AtomicU64::new(1),
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
            auto_complete,
        })
    }

    pub fn emit(&self, event: EndpointEvent) {
        self.tx.send(event).expect("dispatcher relay is running");
    }

    pub fn fail_next_submit(&self, failure: SubmitFailure) {
        *self.fail_next.lock().unwrap() = Some(failure);
    }

    pub fn submitted(&self) -> Vec<(JobId, EngineHandle)> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<EngineHandle> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn handle_for(&self, job_id: JobId) -> EngineHandle {
        self.submitted()
            .into_iter()
            .find(|(id, _)| *id == job_id)
            .map(|(_, handle)| handle)
            .expect("job was submitted to this endpoint")
    }

    /// Wait until `n` jobs have been submitted here.
    pub async fn wait_submitted(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.submitted.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("submission did not arrive in time");
    }

    /// Wait until `n` engine cancellations have been requested here.
    pub async fn wait_cancelled(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.cancelled.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("cancellation did not arrive in time");
    }

    /// Drive a job through processing, downloading, and result.
    pub fn complete(&self, handle: &str) {
        for event in completion_events(handle) {
            self.emit(event);
        }
    }

    pub fn fail(&self, handle: &str, message: &str) {
        self.emit(EndpointEvent::Error {
            handle: handle.to_string(),
            message: message.to_string(),
        });
    }

    pub fn preview(&self) {
        self.emit(EndpointEvent::PreviewReady {
            handle: None,
            preview: PreviewRef::Inline {
                mime: "image/jpeg",
                data: Arc::from(vec![0xff_u8, 0xd8, 0xff]),
            },
        });
    }
}

fn completion_events(handle: &str) -> Vec<EndpointEvent> {
    let handle = Some(handle.to_string());
    vec![
        EndpointEvent::StageChanged {
            handle: handle.clone(),
            stage: Stage::Processing,
        },
        EndpointEvent::NodeProgress {
            handle: handle.clone(),
            node: Some("3".to_string()),
            value: 10,
            max: 20,
        },
        EndpointEvent::StageChanged {
            handle: handle.clone(),
            stage: Stage::Downloading,
        },
        EndpointEvent::ResultReady {
            handle: handle.unwrap_or_default(),
            outputs: serde_json::json!({"9": {"images": [{"filename": "out.png"}]}}),
        },
    ]
}

#[async_trait]
impl Endpoint for ScriptedEndpoint {
    fn id(&self) -> EndpointId {
        self.id
    }

    async fn submit(&self, job: &Job) -> Result<EngineHandle, EndpointError> {
        if let Some(failure) = self.fail_next.lock().unwrap().take() {
            return Err(match failure {
                SubmitFailure::Connection => EndpointError::Connection("connection refused".into()),
                SubmitFailure::Rejected => EndpointError::Rejected("invalid workflow".into()),
            });
        }

        self.emit(EndpointEvent::StageChanged {
            handle: None,
            stage: Stage::Uploading,
        });
        let handle = format!(
            "ep{}-{}",
            self.id,
            self.next_handle.fetch_add(1, Ordering::SeqCst)
        );
        self.submitted.lock().unwrap().push((job.id, handle.clone()));

        if self.auto_complete {
            // Events may reach the dispatcher before this call returns.
            for event in completion_events(&handle) {
                self.emit(event);
            }
        }
        Ok(handle)
    }

    async fn cancel(&self, handle: &str) -> Result<(), EndpointError> {
        self.cancelled.lock().unwrap().push(handle.to_string());
        Ok(())
    }

    fn take_events(&self) -> Option<EndpointEvents> {
        self.rx.lock().unwrap().take()
    }
}

pub fn config() -> DispatchConfig {
    DispatchConfig {
        gpu_count: 2,
        ..DispatchConfig::default()
    }
}

pub fn job(name: &str) -> Job {
    Job::new(
        format!("/uploads/{name}"),
        name,
        serde_json::json!({"1": {"class_type": "LoadImage", "inputs": {}}}),
    )
}

/// Dispatcher over `endpoints`, plus a subscription opened before any work.
pub fn dispatcher(
    config: &DispatchConfig,
    endpoints: &[Arc<ScriptedEndpoint>],
) -> (Dispatcher, broadcast::Receiver<BatchEvent>) {
    let endpoints = endpoints
        .iter()
        .map(|e| Arc::clone(e) as Arc<dyn Endpoint>)
        .collect();
    let dispatcher = Dispatcher::start(config, endpoints).expect("valid dispatcher setup");
    let events = dispatcher.subscribe();
    (dispatcher, events)
}

/// Receive events until one matches `pred`; returns it with everything
/// received before it.
pub async fn wait_for(
    events: &mut broadcast::Receiver<BatchEvent>,
    pred: impl Fn(&BatchEvent) -> bool,
) -> (BatchEvent, Vec<BatchEvent>) {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if pred(&event) {
                return (event, seen);
            }
            seen.push(event);
        }
    })
    .await
    .expect("expected event did not arrive")
}

pub fn is_stage(job_id: JobId, stage: Stage) -> impl Fn(&BatchEvent) -> bool {
    move |event| {
        matches!(event, BatchEvent::JobStatusChanged(update)
            if update.job_id == job_id && update.stage == stage)
    }
}

pub fn is_run_end(event: &BatchEvent) -> bool {
    event.is_run_terminal()
}
