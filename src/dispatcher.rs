use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::db;
use crate::fetcher::Fetcher;
use crate::jobs::{DocType, JobStatus, Outcome};

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub batch_size: usize,
    pub max_retries: u32,
    pub workers: usize,
    pub max_error_chars: usize,
}

/// Everything one worker needs, owned by that worker for the whole batch.
pub struct WorkerContext {
    pub worker: usize,
    pub conn: Connection,
    pub fetcher: Arc<dyn Fetcher>,
    pub doc_type: DocType,
    pub max_retries: u32,
    pub max_error_chars: usize,
}

/// What happened to one assigned id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// Outcome written; carries the job's new status.
    Recorded(JobStatus),
    /// Job vanished or became terminal after the claim.
    Skipped,
    /// Outcome could not be written, even after one retry.
    Lost,
}

#[derive(Debug)]
pub(crate) struct AttemptReport {
    worker: usize,
    doc_id: String,
    attempt: Attempt,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
    pub lost: usize,
}

/// Deal ids to `workers` queues in turn. Every id lands in exactly one queue.
pub fn assign_round_robin(ids: Vec<String>, workers: usize) -> Vec<Vec<String>> {
    let workers = workers.max(1);
    let mut queues: Vec<Vec<String>> = vec![Vec::new(); workers];
    for (i, id) in ids.into_iter().enumerate() {
        queues[i % workers].push(id);
    }
    queues
}

/// Claim one batch and fetch it with `workers` concurrent workers.
/// Returns once every worker has attempted every id it was given.
pub async fn process_pending(
    db_path: &Path,
    fetcher: Arc<dyn Fetcher>,
    doc_type: DocType,
    opts: &DispatchOptions,
) -> Result<BatchReport> {
    let ids = {
        let conn = db::connect(db_path)?;
        db::claim_batch(&conn, doc_type, opts.max_retries, opts.batch_size)?
    };
    let mut report = BatchReport {
        claimed: ids.len(),
        ..Default::default()
    };
    if ids.is_empty() {
        return Ok(report);
    }

    let workers = opts.workers.clamp(1, ids.len());
    info!(doc_type = %doc_type, claimed = ids.len(), workers, "Dispatching batch");

    let pb = ProgressBar::new(ids.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let ready = prepare_workers(
        assign_round_robin(ids, workers),
        || db::connect(db_path),
        &fetcher,
        doc_type,
        opts,
    )
    .await?;

    // Workers report each attempt here; closes when the last worker exits.
    let (report_tx, mut report_rx) = mpsc::channel::<AttemptReport>(workers * 2);

    let mut handles = Vec::with_capacity(workers);
    for (ctx, id_rx) in ready {
        handles.push(tokio::spawn(run_worker(ctx, id_rx, report_tx.clone())));
    }
    drop(report_tx);

    while let Some(r) = report_rx.recv().await {
        debug!(worker = r.worker, doc_id = %r.doc_id, attempt = ?r.attempt, "Attempt finished");
        match r.attempt {
            Attempt::Recorded(JobStatus::Success) => report.succeeded += 1,
            Attempt::Recorded(JobStatus::Failed) => report.failed += 1,
            Attempt::Recorded(_) => report.retrying += 1,
            Attempt::Skipped => report.skipped += 1,
            Attempt::Lost => report.lost += 1,
        }
        pb.inc(1);
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Worker task panicked: {}", e);
        }
    }

    pb.finish_and_clear();
    info!(
        doc_type = %doc_type,
        succeeded = report.succeeded,
        retrying = report.retrying,
        failed = report.failed,
        skipped = report.skipped,
        "Batch complete"
    );
    Ok(report)
}

/// Open a connection and fill a closed id queue for every worker. Nothing is
/// spawned here: on error no worker has started and the claimed jobs stay
/// untouched in the store.
async fn prepare_workers(
    queues: Vec<Vec<String>>,
    mut connect: impl FnMut() -> Result<Connection>,
    fetcher: &Arc<dyn Fetcher>,
    doc_type: DocType,
    opts: &DispatchOptions,
) -> Result<Vec<(WorkerContext, mpsc::Receiver<String>)>> {
    let mut ready = Vec::with_capacity(queues.len());
    for (worker, queue) in queues.into_iter().enumerate() {
        let ctx = WorkerContext {
            worker,
            conn: connect().with_context(|| format!("Opening store for worker {}", worker))?,
            fetcher: Arc::clone(fetcher),
            doc_type,
            max_retries: opts.max_retries,
            max_error_chars: opts.max_error_chars,
        };
        let (id_tx, id_rx) = mpsc::channel::<String>(queue.len().max(1));
        for id in queue {
            id_tx.send(id).await?;
        }
        ready.push((ctx, id_rx));
    }
    Ok(ready)
}

/// Work through the queue in order until the dispatcher closes it.
pub(crate) async fn run_worker(
    ctx: WorkerContext,
    mut ids: mpsc::Receiver<String>,
    reports: mpsc::Sender<AttemptReport>,
) {
    // Take the context apart so no borrow of the connection spans an await.
    let WorkerContext {
        worker,
        conn,
        fetcher,
        doc_type,
        max_retries,
        max_error_chars,
    } = ctx;

    while let Some(doc_id) = ids.recv().await {
        let current = db::get_job(&conn, &doc_id, doc_type);
        let job = match current {
            Ok(Some(job)) if !job.is_terminal(max_retries) => job,
            Ok(_) => {
                debug!(worker, doc_id = %doc_id, "Job gone or terminal, skipping");
                let _ = reports
                    .send(AttemptReport { worker, doc_id, attempt: Attempt::Skipped })
                    .await;
                continue;
            }
            Err(e) => {
                warn!(worker, doc_id = %doc_id, "Could not re-read job, skipping: {:#}", e);
                let _ = reports
                    .send(AttemptReport { worker, doc_id, attempt: Attempt::Skipped })
                    .await;
                continue;
            }
        };

        let outcome = match fetcher.fetch(&doc_id, doc_type).await {
            Ok(raw) => match db::save_document(&conn, &doc_id, doc_type, &raw) {
                Ok(()) => Outcome::Success,
                Err(e) => {
                    warn!(worker, doc_id = %doc_id, "Saving document failed: {:#}", e);
                    Outcome::Failure(format!("persist: {:#}", e))
                }
            },
            Err(e) => {
                debug!(
                    worker,
                    doc_id = %job.doc_id,
                    doc_type = %job.doc_type,
                    queued = %job.created_at,
                    previous = ?job.last_attempt,
                    attempt = job.retry_count + 1,
                    "Fetch failed: {}",
                    e
                );
                Outcome::Failure(e.to_string())
            }
        };

        let attempt = write_outcome(
            &conn,
            worker,
            &doc_id,
            doc_type,
            &outcome,
            max_retries,
            max_error_chars,
        );
        let _ = reports.send(AttemptReport { worker, doc_id, attempt }).await;
    }
}

/// Record one outcome, retrying the write once before giving up on it.
fn write_outcome(
    conn: &Connection,
    worker: usize,
    doc_id: &str,
    doc_type: DocType,
    outcome: &Outcome,
    max_retries: u32,
    max_error_chars: usize,
) -> Attempt {
    for try_no in 1..=2 {
        match db::record_outcome(conn, doc_id, doc_type, outcome, max_retries, max_error_chars) {
            Ok(t) => return Attempt::Recorded(t.status),
            Err(e) if try_no == 1 => {
                warn!(worker, doc_id, "Recording outcome failed, retrying: {:#}", e);
            }
            Err(e) => {
                error!(worker, doc_id, "Recording outcome failed, giving up: {:#}", e);
            }
        }
    }
    Attempt::Lost
}
