//! Channel-based worker host
//!
//! A spawned task owns the [`WorkerContext`] and answers requests one at a
//! time. Callers talk to it through a cloneable [`WorkerHandle`].

use crate::context::WorkerContext;
use crate::error::{Result, WorkerError};
use crate::protocol::{WorkerRequest, WorkerResponse};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use vesper_governor::{AllocationId, GovernorConfig, GovernorStatus};

type Envelope = (WorkerRequest, oneshot::Sender<WorkerResponse>);

/// Default request queue depth
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Sender side of a running worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    request_tx: mpsc::Sender<Envelope>,
}

impl WorkerHandle {
    /// Send a request and wait for its response
    pub async fn send(&self, request: WorkerRequest) -> Result<WorkerResponse> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| WorkerError::ChannelClosed("request channel closed".into()))?;

        response_rx
            .await
            .map_err(|_| WorkerError::ChannelClosed("response channel closed".into()))
    }

    /// Convenience: init
    pub async fn init(&self, config: GovernorConfig) -> Result<WorkerResponse> {
        self.send(WorkerRequest::Init { config }).await
    }

    /// Convenience: track without a label
    pub async fn track(&self, size_bytes: u64, priority: i32) -> Result<AllocationId> {
        let response = self
            .send(WorkerRequest::Track {
                size_bytes,
                aux_bytes: 0,
                priority,
                label: None,
            })
            .await?;
        match response {
            WorkerResponse::Tracked { id } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// Convenience: status
    pub async fn status(&self) -> Result<GovernorStatus> {
        match self.send(WorkerRequest::Status).await? {
            WorkerResponse::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Convenience: shutdown
    pub async fn shutdown(&self) -> Result<()> {
        self.send(WorkerRequest::Shutdown).await.map(|_| ())
    }

    /// Whether the worker task has stopped
    pub fn is_closed(&self) -> bool {
        self.request_tx.is_closed()
    }
}

fn unexpected(response: WorkerResponse) -> WorkerError {
    match response {
        WorkerResponse::Error { kind, message } => {
            WorkerError::UnexpectedResponse(format!("{kind}: {message}"))
        }
        other => WorkerError::UnexpectedResponse(format!("{other:?}")),
    }
}

/// Start a worker task owning `context`
pub fn spawn_worker(context: WorkerContext, queue_depth: usize) -> (WorkerHandle, JoinHandle<()>) {
    let (request_tx, request_rx) = mpsc::channel(queue_depth.max(1));
    let task = tokio::spawn(run_worker(context, request_rx));
    (WorkerHandle { request_tx }, task)
}

async fn run_worker(mut context: WorkerContext, mut request_rx: mpsc::Receiver<Envelope>) {
    info!("Worker started");
    while let Some((request, response_tx)) = request_rx.recv().await {
        let shutdown = matches!(request, WorkerRequest::Shutdown);
        let response = context.handle(request).await;
        if response_tx.send(response).is_err() {
            debug!("Caller dropped before the response was sent");
        }
        if shutdown {
            break;
        }
    }
    info!("Worker stopped");
}
