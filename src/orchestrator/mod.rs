// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stage orchestration: claim pending groups and drive them through the
//! declared stage graph.
//!
//! The claim (`pending -> in_progress`) is a conditional update in the store
//! and is the only concurrency-safety mechanism; any number of orchestrator
//! workers may call [Orchestrator::process_next] in parallel. Losing a claim
//! race is a normal outcome, not an error.

mod context;
mod error;
mod graph;
#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Instant;

use indexmap::indexmap;
use log::{debug, info, warn};
use thiserror::Error;

pub use context::{ArtifactSet, StageContext};
pub use error::OrchestratorError;
pub use graph::{GraphError, StageGraph, StageNode};

use crate::retry::BackoffPolicy;
use crate::store::{GroupRecord, Store};

/// How a stage failed. The orchestrator never looks past this
/// classification; why a collaborator failed is its own business.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Transient: worth retrying within the group's budget.
    #[error("{0}")]
    Retryable(String),

    /// Structural: retrying cannot help; the group needs an operator.
    #[error("{0}")]
    Terminal(String),
}

/// One named unit of processing. Implementations invoke at most one external
/// collaborator and return the artifacts they produced; they never mutate
/// the context they were given.
pub trait Stage: Send + Sync {
    fn run(&self, group: &GroupRecord, ctx: &StageContext) -> Result<ArtifactSet, StageError>;
}

/// The terminal outcome of executing one claimed group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    Completed {
        group_key: String,
    },
    Failed {
        group_key: String,
        stage: String,
        terminal: bool,
        error: String,
    },
}

pub struct Orchestrator {
    store: Arc<Store>,
    graph: StageGraph,
    backoff: BackoffPolicy,
}

impl Orchestrator {
    pub fn new(store: Arc<Store>, graph: StageGraph, backoff: BackoffPolicy) -> Orchestrator {
        Orchestrator {
            store,
            graph,
            backoff,
        }
    }

    /// Claim the oldest eligible pending group and run it to a terminal
    /// state. `Ok(None)` means there was nothing to claim (or every
    /// candidate was claimed by another worker first).
    pub fn process_next(&self) -> Result<Option<GroupOutcome>, OrchestratorError> {
        let group = match self.store.claim_next_pending()? {
            None => return Ok(None),
            Some(g) => g,
        };
        self.execute(group).map(Some)
    }

    /// Run a claimed group through every stage in dependency order. Each
    /// stage sees an immutable snapshot of prior artifacts and contributes a
    /// new one. The first failure decides the group's fate; a timing sample
    /// is recorded at every terminal transition, success or not.
    fn execute(&self, group: GroupRecord) -> Result<GroupOutcome, OrchestratorError> {
        let key = group.group_key.clone();
        info!(
            "Processing group {key} (attempt {})",
            group.retry_count + 1
        );

        let mut ctx = StageContext::new(indexmap! {
            "group_key".to_string() => key.clone(),
        });
        let mut stage_seconds: Vec<(String, f64)> = Vec::with_capacity(self.graph.len());
        let started = Instant::now();

        for node in self.graph.execution_order() {
            debug!("Group {key}: running stage '{}'", node.name);
            let stage_started = Instant::now();
            let result = node.stage.run(&group, &ctx);
            stage_seconds.push((node.name.clone(), stage_started.elapsed().as_secs_f64()));

            match result {
                Ok(artifacts) => {
                    debug!(
                        "Group {key}: stage '{}' produced {} artifact(s)",
                        node.name,
                        artifacts.len()
                    );
                    ctx = ctx.with(artifacts);
                }
                Err(StageError::Retryable(message)) => {
                    warn!(
                        "Group {key}: stage '{}' failed (retryable): {message}",
                        node.name
                    );
                    self.store.mark_failed_retryable(
                        &key,
                        &message,
                        self.backoff.initial_delay_s,
                        self.backoff.max_delay_s,
                    )?;
                    self.record_sample(&key, &stage_seconds, started);
                    return Ok(GroupOutcome::Failed {
                        group_key: key,
                        stage: node.name.clone(),
                        terminal: false,
                        error: message,
                    });
                }
                Err(StageError::Terminal(message)) => {
                    warn!(
                        "Group {key}: stage '{}' failed (terminal): {message}",
                        node.name
                    );
                    self.store.mark_failed_terminal(&key, &message)?;
                    self.record_sample(&key, &stage_seconds, started);
                    return Ok(GroupOutcome::Failed {
                        group_key: key,
                        stage: node.name.clone(),
                        terminal: true,
                        error: message,
                    });
                }
            }
        }

        self.store.mark_completed(&key)?;
        self.record_sample(&key, &stage_seconds, started);
        info!(
            "Group {key} completed in {:.1} s",
            started.elapsed().as_secs_f64()
        );
        Ok(GroupOutcome::Completed { group_key: key })
    }

    /// Performance samples are best-effort observability; a failure to
    /// record one is logged but never changes a group's fate.
    fn record_sample(&self, key: &str, stage_seconds: &[(String, f64)], started: Instant) {
        if let Err(e) =
            self.store
                .record_perf_sample(key, stage_seconds, started.elapsed().as_secs_f64())
        {
            warn!("Couldn't record performance sample for {key}: {e}");
        }
    }

    /// Re-queue failed groups whose backoff has elapsed, and sweep abandoned
    /// in-progress groups back through the retry path. Run periodically by
    /// the sweeper; non-blocking and safe to re-enter.
    pub fn sweep(&self, stale_after_s: f64) -> Result<SweepReport, OrchestratorError> {
        let stale = self.store.requeue_stale_in_progress(
            stale_after_s,
            self.backoff.initial_delay_s,
            self.backoff.max_delay_s,
        )?;
        for key in &stale {
            warn!("Group {key} was in progress with no update for {stale_after_s} s; \
                   treating as a retryable failure");
        }
        let requeued = self.store.requeue_eligible_failed(self.backoff.max_retries)?;
        for key in &requeued {
            info!("Re-queued group {key} for retry");
        }
        Ok(SweepReport {
            stale_failed: stale.len(),
            requeued: requeued.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// In-progress groups swept to failed as presumed-abandoned.
    pub stale_failed: usize,
    /// Failed groups returned to pending.
    pub requeued: usize,
}
