// kiln-core/src/pipeline/engine.rs
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use kiln_common::config::{self, Config};
use kiln_common::dependency::{BuildPlan, PlanEntry};
use kiln_common::error::{KilnError, Result};
use kiln_common::pipeline::{PipelineEvent, RunSummary};
use threadpool::ThreadPool;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use super::scheduler::JobBoard;

/// The work done for one plan entry. Called from pool threads, at most once per entry.
pub trait FormulaJob: Send + Sync + 'static {
    fn run(&self, entry: &PlanEntry) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Formulas built at the same time.
    pub jobs: usize,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self { jobs: config.jobs }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            jobs: config::default_jobs(),
        }
    }
}

/// Runs every entry of `plan` on a worker pool, an entry only once all of its predecessors are
/// done. A failure skips the entries that depend on it; independent entries carry on.
#[instrument(skip_all, fields(formulae = plan.len(), jobs = options.jobs))]
pub fn run_plan<J: FormulaJob>(
    plan: &BuildPlan,
    job: Arc<J>,
    options: RunOptions,
    event_tx: &broadcast::Sender<PipelineEvent>,
) -> RunSummary {
    let start = Instant::now();
    let num_workers = options.jobs.max(1).min(plan.len().max(1));
    let pool = ThreadPool::new(num_workers);
    debug!("Worker pool created with {} workers.", num_workers);

    let entries: HashMap<&str, &PlanEntry> = plan.iter().map(|e| (e.name(), e)).collect();
    let mut board = JobBoard::new(plan);
    let (result_tx, result_rx) = crossbeam_channel::unbounded::<(String, Result<()>)>();

    let _ = event_tx.send(PipelineEvent::PipelineStarted {
        total_jobs: plan.len(),
    });

    loop {
        for name in board.ready() {
            let Some(entry) = entries.get(name.as_str()) else {
                continue;
            };
            if let Err(e) = board.mark_dispatched(&name) {
                warn!("[{}] not dispatched: {}", name, e);
                continue;
            }
            debug!("[{}] Submitting job to worker pool.", name);
            let _ = event_tx.send(PipelineEvent::JobDispatched {
                target_id: name.clone(),
            });

            let entry = (*entry).clone();
            let job = Arc::clone(&job);
            let result_tx = result_tx.clone();
            pool.execute(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| job.run(&entry)))
                    .unwrap_or_else(|payload| {
                        Err(KilnError::Generic(format!(
                            "worker panicked: {}",
                            panic_message(payload)
                        )))
                    });
                if result_tx.send((name, result)).is_err() {
                    error!("Result channel closed before the worker finished.");
                }
            });
        }

        if board.is_finished() {
            break;
        }
        if board.in_flight() == 0 {
            for name in board.fail_stranded() {
                error!("[{}] can never start, its predecessors cannot complete", name);
            }
            break;
        }

        let Ok((name, result)) = result_rx.recv() else {
            error!("All workers went away with jobs still running.");
            break;
        };
        match result {
            Ok(()) => {
                if let Err(e) = board.mark_done(&name) {
                    warn!("[{}] {}", name, e);
                }
                info!("[{}] done", name);
                let _ = event_tx.send(PipelineEvent::JobSuccess { target_id: name });
            }
            Err(err) => {
                error!("[{}] failed: {}", name, err);
                let _ = event_tx.send(PipelineEvent::job_failed(name.clone(), &err));
                match board.mark_failed(&name, err.to_string()) {
                    Ok(skipped) => {
                        for dependent in skipped {
                            warn!("[{}] skipped, dependency '{}' failed", dependent, name);
                            let _ = event_tx.send(PipelineEvent::JobSkipped {
                                target_id: dependent,
                                failed_dependency: name.clone(),
                            });
                        }
                    }
                    Err(e) => warn!("[{}] {}", name, e),
                }
            }
        }
    }
    pool.join();

    let summary = RunSummary {
        statuses: board.statuses(),
        duration_secs: start.elapsed().as_secs_f64(),
    };
    debug!(
        "Run finished: {} succeeded, {} failed, {} skipped",
        summary.succeeded(),
        summary.failed(),
        summary.skipped()
    );
    let _ = event_tx.send(PipelineEvent::PipelineFinished {
        duration_secs: summary.duration_secs,
        success_count: summary.succeeded(),
        fail_count: summary.failed(),
        skip_count: summary.skipped(),
    });
    summary
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast_ref::<&'static str>() {
        Some(s) => (*s).to_string(),
        None => match payload.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => "Unknown panic payload".to_string(),
        },
    }
}
