//! One-at-a-time execution of agent requests
//!
//! Requests go into an unbounded FIFO drained by a single worker task, so at most one
//! external process runs at any moment. Every run is bracketed by a ledger entry.

use crate::runner::AgentInvoker;
use crate::types::{AgentOutcome, AgentRequest, RunnerError};
use contextd_core::KnowledgeStore;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Audit trail for agent runs
pub trait RunLedger: Send + Sync {
    /// Open a pending run, returning its id
    fn start_run(&self, agent_name: &str, session_id: Option<&str>) -> Result<i64, RunnerError>;

    /// Close a run exactly once
    fn finish_run(&self, run_id: i64, success: bool, error: Option<&str>) -> Result<(), RunnerError>;
}

impl RunLedger for KnowledgeStore {
    fn start_run(&self, agent_name: &str, session_id: Option<&str>) -> Result<i64, RunnerError> {
        KnowledgeStore::start_run(self, agent_name, session_id)
            .map_err(|e| RunnerError::Ledger(e.to_string()))
    }

    fn finish_run(&self, run_id: i64, success: bool, error: Option<&str>) -> Result<(), RunnerError> {
        match KnowledgeStore::finish_run(self, run_id, success, error) {
            Ok(true) => Ok(()),
            Ok(false) => Err(RunnerError::Ledger(format!("run {} already closed", run_id))),
            Err(e) => Err(RunnerError::Ledger(e.to_string())),
        }
    }
}

/// A submitted request and the channel its outcome goes back on
struct Job {
    request: AgentRequest,
    reply: oneshot::Sender<Completed>,
}

/// What the worker hands back for one job
#[derive(Debug, Clone)]
pub struct Completed {
    pub outcome: AgentOutcome,
    /// Ledger row, if the ledger accepted the run
    pub run_id: Option<i64>,
}

struct State {
    queued: AtomicUsize,
    busy: AtomicBool,
}

pub struct SerialRunner {
    tx: mpsc::UnboundedSender<Job>,
    state: Arc<State>,
    worker: JoinHandle<()>,
}

impl SerialRunner {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn new(invoker: Arc<dyn AgentInvoker>, ledger: Option<Arc<dyn RunLedger>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(State {
            queued: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
        });
        let worker = tokio::spawn(worker_loop(rx, invoker, ledger, state.clone()));
        Self { tx, state, worker }
    }

    /// Enqueue a request and wait for its turn and result
    pub async fn submit(&self, request: AgentRequest) -> AgentOutcome {
        self.submit_tracked(request).await.outcome
    }

    /// Like [`submit`](Self::submit), also returning the ledger run id
    pub async fn submit_tracked(&self, request: AgentRequest) -> Completed {
        let (reply, rx) = oneshot::channel();
        self.state.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Job { request, reply }).is_err() {
            self.state.queued.fetch_sub(1, Ordering::SeqCst);
            return Completed {
                outcome: RunnerError::Stopped.into(),
                run_id: None,
            };
        }
        rx.await.unwrap_or_else(|_| Completed {
            outcome: RunnerError::Stopped.into(),
            run_id: None,
        })
    }

    /// Requests waiting behind the one in flight
    pub fn queue_depth(&self) -> usize {
        self.state.queued.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.state.busy.load(Ordering::SeqCst)
    }

    /// Stop accepting work and wait for queued jobs to drain
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}

async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<Job>,
    invoker: Arc<dyn AgentInvoker>,
    ledger: Option<Arc<dyn RunLedger>>,
    state: Arc<State>,
) {
    while let Some(job) = rx.recv().await {
        state.queued.fetch_sub(1, Ordering::SeqCst);
        state.busy.store(true, Ordering::SeqCst);
        let completed = run_job(&job.request, &invoker, ledger.as_deref()).await;
        state.busy.store(false, Ordering::SeqCst);
        if job.reply.send(completed).is_err() {
            debug!(agent = %job.request.agent_name, "Submitter went away before the result");
        }
    }
    debug!("Serial runner worker stopped");
}

async fn run_job(
    request: &AgentRequest,
    invoker: &Arc<dyn AgentInvoker>,
    ledger: Option<&dyn RunLedger>,
) -> Completed {
    let run_id = ledger.and_then(|l| {
        l.start_run(&request.agent_name, request.session_id.as_deref())
            .map_err(|e| warn!(agent = %request.agent_name, error = %e, "Failed to open run"))
            .ok()
    });

    // own task, so a panicking invoker fails this job instead of the worker
    let task = {
        let invoker = invoker.clone();
        let request = request.clone();
        tokio::spawn(async move { invoker.invoke(&request).await })
    };
    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(agent = %request.agent_name, error = %e, "Agent invocation aborted");
            RunnerError::Aborted(e.to_string()).into()
        }
    };

    if let (Some(ledger), Some(id)) = (ledger, run_id) {
        if let Err(e) = ledger.finish_run(id, outcome.success, outcome.error.as_deref()) {
            warn!(run_id = id, error = %e, "Failed to close run");
        }
    }
    debug!(
        agent = %request.agent_name,
        success = outcome.success,
        "Agent run finished"
    );
    Completed { outcome, run_id }
}
