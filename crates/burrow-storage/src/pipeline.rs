//! Fan-out/fan-in pipeline behind `short_url_delete_batch`.
//!
//! The input IDs are dealt round-robin onto a fixed number of lanes. Each lane
//! drains its own queue, hands the accumulated IDs to the backend in a single
//! [`SoftDelete::soft_delete`] call and reports one [`DeleteOutcome`] per ID.
//! The coordinator collects exactly one outcome per distinct input ID.

use crate::shutdown::Shutdown;
use async_trait::async_trait;
use burrow_core::{Result, StorageError, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Per-lane queue depth.
const LANE_CAPACITY: usize = 64;

/// Backend-level soft delete, invoked once per lane.
#[async_trait]
pub trait SoftDelete: Send + Sync + 'static {
    /// Marks the subset of `ids` owned by `owner_id` as deleted and returns
    /// the IDs that were actually flipped. Unknown, foreign and already
    /// deleted IDs are skipped, never reported as errors.
    ///
    /// The returned future is dropped if shutdown arrives while it runs. A
    /// backend whose write lands outside the process (a database statement)
    /// may already have applied it, so a cancelled ID is in an unknown
    /// state. Soft deletes are idempotent and can simply be issued again.
    async fn soft_delete(&self, owner_id: UserId, ids: &[String]) -> Result<Vec<String>>;
}

/// What happened to one input ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub id: String,
    /// `Ok(true)` when this call flipped the record.
    pub result: Result<bool>,
}

pub struct DeletePipeline<S> {
    target: Arc<S>,
    lanes: usize,
    shutdown: Shutdown,
}

impl<S> Clone for DeletePipeline<S> {
    fn clone(&self) -> Self {
        Self {
            target: Arc::clone(&self.target),
            lanes: self.lanes,
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S> std::fmt::Debug for DeletePipeline<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletePipeline")
            .field("lanes", &self.lanes)
            .field("shutdown", &self.shutdown.is_shutdown())
            .finish()
    }
}

impl<S: SoftDelete> DeletePipeline<S> {
    /// Creates a pipeline with `lanes` workers (at least one).
    pub fn new(target: Arc<S>, lanes: usize, shutdown: Shutdown) -> Self {
        Self {
            target,
            lanes: lanes.max(1),
            shutdown,
        }
    }

    /// Creates a pipeline with one lane per available CPU.
    pub fn with_default_lanes(target: Arc<S>, shutdown: Shutdown) -> Self {
        Self::new(target, num_cpus::get(), shutdown)
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    /// Runs the pipeline and returns one outcome per distinct input ID, in
    /// input order.
    ///
    /// The work runs on its own task: dropping the returned future does not
    /// abort a batch that has already been accepted. Only the pipeline's
    /// [`Shutdown`] signal cancels it.
    pub async fn dispatch(&self, owner_id: UserId, ids: Vec<String>) -> Result<Vec<DeleteOutcome>> {
        if self.shutdown.is_shutdown() {
            return Err(StorageError::Cancelled(
                "delete pipeline is shut down".to_string(),
            ));
        }

        let ids = dedup(ids);
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let task = tokio::spawn(fan_out_fan_in(
            Arc::clone(&self.target),
            owner_id,
            ids,
            self.lanes,
            self.shutdown.clone(),
        ));

        task.await
            .map_err(|e| StorageError::Cancelled(format!("delete pipeline task failed: {e}")))
    }

    /// Runs the pipeline and merges the outcomes into an affected count.
    pub async fn run(&self, owner_id: UserId, ids: Vec<String>) -> Result<u64> {
        let outcomes = self.dispatch(owner_id, ids).await?;
        merge(outcomes)
    }
}

/// Drops repeated IDs, keeping the first occurrence.
fn dedup(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Sums affected IDs, or folds every failure into one error.
fn merge(outcomes: Vec<DeleteOutcome>) -> Result<u64> {
    let mut affected = 0;
    let mut failed = 0;
    let mut first = None;

    for outcome in outcomes {
        match outcome.result {
            Ok(true) => affected += 1,
            Ok(false) => {}
            Err(err) => {
                failed += 1;
                first.get_or_insert(err);
            }
        }
    }

    match first {
        Some(first) => Err(StorageError::BatchDelete {
            failed,
            first: Box::new(first),
        }),
        None => Ok(affected),
    }
}

async fn fan_out_fan_in<S: SoftDelete>(
    target: Arc<S>,
    owner_id: UserId,
    ids: Vec<String>,
    lanes: usize,
    shutdown: Shutdown,
) -> Vec<DeleteOutcome> {
    let lanes = lanes.min(ids.len());
    let order: HashMap<String, usize> = ids
        .iter()
        .enumerate()
        .map(|(position, id)| (id.clone(), position))
        .collect();

    debug!(owner_id, ids = ids.len(), lanes, "starting batch delete");

    // Sized to the whole batch so lanes never wait on the collector.
    let (results_tx, mut results_rx) = mpsc::channel(ids.len());
    let mut senders = Vec::with_capacity(lanes);
    for lane in 0..lanes {
        let (tx, rx) = mpsc::channel(LANE_CAPACITY);
        senders.push(tx);
        tokio::spawn(run_lane(
            lane,
            Arc::clone(&target),
            owner_id,
            rx,
            results_tx.clone(),
            shutdown.clone(),
        ));
    }
    drop(results_tx);

    let mut outcomes = Vec::with_capacity(ids.len());
    for (position, id) in ids.into_iter().enumerate() {
        if let Err(mpsc::error::SendError(id)) = senders[position % lanes].send(id).await {
            // The lane is gone; report the ID instead of losing it.
            outcomes.push(DeleteOutcome {
                id,
                result: Err(StorageError::Cancelled("delete lane exited early".to_string())),
            });
        }
    }
    drop(senders);

    while let Some(outcome) = results_rx.recv().await {
        outcomes.push(outcome);
    }

    outcomes.sort_by_key(|outcome| order.get(&outcome.id).copied().unwrap_or(usize::MAX));
    outcomes
}

async fn run_lane<S: SoftDelete>(
    lane: usize,
    target: Arc<S>,
    owner_id: UserId,
    mut rx: mpsc::Receiver<String>,
    results: mpsc::Sender<DeleteOutcome>,
    shutdown: Shutdown,
) {
    let mut ids = Vec::new();
    while let Some(id) = rx.recv().await {
        ids.push(id);
    }

    trace!(lane, owner_id, ids = ids.len(), "delete lane drained");

    if shutdown.is_shutdown() {
        report(
            ids,
            Err(StorageError::Cancelled(
                "shutdown before batch delete started".to_string(),
            )),
            &results,
        )
        .await;
        return;
    }

    let result = tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(StorageError::Cancelled(
            "shutdown during batch delete, the delete may have been applied".to_string(),
        )),
        result = target.soft_delete(owner_id, &ids) => result,
    };

    report(ids, result, &results).await;
}

/// Sends one outcome per lane ID for the lane's single backend call.
async fn report(
    ids: Vec<String>,
    result: Result<Vec<String>>,
    results: &mpsc::Sender<DeleteOutcome>,
) {
    let outcomes: Vec<DeleteOutcome> = match result {
        Ok(flipped) => {
            let flipped: HashSet<String> = flipped.into_iter().collect();
            ids.into_iter()
                .map(|id| {
                    let hit = flipped.contains(&id);
                    DeleteOutcome { id, result: Ok(hit) }
                })
                .collect()
        }
        Err(err) => ids
            .into_iter()
            .map(|id| DeleteOutcome {
                id,
                result: Err(err.clone()),
            })
            .collect(),
    };

    for outcome in outcomes {
        if results.send(outcome).await.is_err() {
            break;
        }
    }
}
