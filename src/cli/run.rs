// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The `run` subcommand: the streaming pipeline daemon.
//!
//! Three kinds of worker share nothing but the store: a scanner observing
//! the input directory, N orchestrator workers claiming and executing
//! pending groups, and a sweeper re-queueing failed and abandoned groups.

use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use clap::Args;
use crossbeam_channel::{tick, unbounded};
use crossbeam_utils::atomic::AtomicCell;
use log::{debug, error, info};
use scopeguard::defer_on_unwind;

use super::ContimgError;
use crate::assembler::Assembler;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use crate::registry::Registry;
use crate::retry::BackoffPolicy;
use crate::stages::production_graph;
use crate::store::{GroupState, Store};

/// How often the drain check and sweeper run, relative to nothing in
/// particular; frequent enough to keep test turnaround short.
const SWEEP_INTERVAL: StdDuration = StdDuration::from_millis(500);

#[derive(Debug, Args)]
pub(super) struct RunArgs {
    /// Process everything currently on disk, drain the queue, then exit
    /// instead of watching forever.
    #[clap(long)]
    once: bool,

    /// Override the configured number of orchestrator workers.
    #[clap(long)]
    workers: Option<usize>,
}

impl RunArgs {
    pub(super) fn run(&self, settings: &Settings) -> Result<(), ContimgError> {
        let store = Arc::new(Store::open(&settings.paths.state_db)?);
        let registry = Registry::new(Arc::clone(&store));
        // Stage-graph validation (cycles, unknown names) is fatal here, at
        // startup, never mid-run.
        let graph = production_graph(Arc::clone(&store), registry, settings)?;
        let assembler = Assembler::new(Arc::clone(&store), settings)?;
        let backoff = BackoffPolicy::new(&settings.retry);
        let orchestrator = Orchestrator::new(Arc::clone(&store), graph, backoff);

        let n_workers = self.workers.unwrap_or(settings.orchestrator.workers).max(1);
        let input_dir = settings.paths.input_dir.clone();
        let poll_interval = StdDuration::from_secs_f64(settings.ingest.poll_interval_s);
        let idle_wait = StdDuration::from_secs_f64(settings.orchestrator.idle_wait_s);
        let stale_after_s = settings.orchestrator.stale_after_s;
        let max_retries = settings.retry.max_retries;
        let once = self.once;

        info!(
            "Watching {} with {n_workers} worker(s){}",
            input_dir.display(),
            if once { " (single pass)" } else { "" }
        );

        let stop = AtomicCell::new(false);
        let scan_done = AtomicCell::new(false);
        let error_flag = AtomicCell::new(false);
        let (err_tx, err_rx) = unbounded::<ContimgError>();

        thread::scope(|scope| {
            // Input scanner.
            thread::Builder::new()
                .name("scanner".to_string())
                .spawn_scoped(scope, {
                    let assembler = &assembler;
                    let stop = &stop;
                    let scan_done = &scan_done;
                    let error_flag = &error_flag;
                    let err_tx = err_tx.clone();
                    let input_dir = input_dir.clone();
                    move || {
                        defer_on_unwind! { error_flag.store(true); }
                        let ticker = tick(poll_interval);
                        loop {
                            match assembler.scan_directory(&input_dir) {
                                Ok(stats) => {
                                    if stats.recorded > 0 {
                                        info!(
                                            "Scan: {} new file(s), {} group(s) completed",
                                            stats.recorded, stats.completed_groups
                                        );
                                    } else {
                                        debug!("Scan: nothing new");
                                    }
                                }
                                Err(e) => {
                                    error!("Input scan failed: {e}");
                                    let _ = err_tx.send(e.into());
                                    stop.store(true);
                                    return;
                                }
                            }
                            scan_done.store(true);
                            if once || stop.load() {
                                return;
                            }
                            // Wait out the poll interval, but react to stop
                            // reasonably quickly.
                            if ticker.recv().is_err() {
                                return;
                            }
                        }
                    }
                })
                .expect("OS can spawn threads");

            // Orchestrator workers.
            for i in 0..n_workers {
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn_scoped(scope, {
                        let orchestrator = &orchestrator;
                        let stop = &stop;
                        let error_flag = &error_flag;
                        let err_tx = err_tx.clone();
                        move || {
                            defer_on_unwind! { error_flag.store(true); }
                            loop {
                                if stop.load() {
                                    return;
                                }
                                match orchestrator.process_next() {
                                    // Keep claiming while there's work.
                                    Ok(Some(_)) => (),
                                    Ok(None) => thread::sleep(idle_wait),
                                    Err(e) => {
                                        error!("Worker {i} stopping: {e}");
                                        let _ = err_tx.send(e.into());
                                        stop.store(true);
                                        return;
                                    }
                                }
                            }
                        }
                    })
                    .expect("OS can spawn threads");
            }

            // Sweeper and drain control.
            thread::Builder::new()
                .name("sweeper".to_string())
                .spawn_scoped(scope, {
                    let orchestrator = &orchestrator;
                    let store = &store;
                    let stop = &stop;
                    let scan_done = &scan_done;
                    let error_flag = &error_flag;
                    let err_tx = err_tx.clone();
                    move || {
                        defer_on_unwind! { error_flag.store(true); }
                        let ticker = tick(SWEEP_INTERVAL);
                        while !stop.load() {
                            if ticker.recv().is_err() {
                                return;
                            }
                            match orchestrator.sweep(stale_after_s) {
                                Ok(report) => {
                                    if report.stale_failed + report.requeued > 0 {
                                        debug!(
                                            "Sweep: {} stale, {} re-queued",
                                            report.stale_failed, report.requeued
                                        );
                                    }
                                }
                                Err(e) => {
                                    error!("Sweep failed: {e}");
                                    let _ = err_tx.send(e.into());
                                    stop.store(true);
                                    return;
                                }
                            }
                            if once && scan_done.load() {
                                match queue_drained(store, max_retries) {
                                    Ok(true) => {
                                        info!("Queue drained");
                                        stop.store(true);
                                        return;
                                    }
                                    Ok(false) => (),
                                    Err(e) => {
                                        let _ = err_tx.send(e.into());
                                        stop.store(true);
                                        return;
                                    }
                                }
                            }
                        }
                    }
                })
                .expect("OS can spawn threads");
        });
        drop(err_tx);

        if let Ok(e) = err_rx.try_recv() {
            return Err(e);
        }
        if error_flag.load() {
            return Err(ContimgError::Generic(
                "a pipeline worker panicked; see the log".to_string(),
            ));
        }
        Ok(())
    }
}

/// Nothing left that this run could ever progress: no pending or in-progress
/// groups, and no failed group that the sweeper might still re-queue.
fn queue_drained(store: &Store, max_retries: u32) -> Result<bool, crate::store::StoreError> {
    let counts = store.counts_by_state()?;
    let live: usize = counts
        .iter()
        .filter(|(state, _)| matches!(state, GroupState::Pending | GroupState::InProgress))
        .map(|(_, n)| n)
        .sum();
    Ok(live == 0 && store.count_retry_candidates(max_retries)? == 0)
}
