// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicUsize, Ordering};

use indexmap::indexmap;

use super::*;
use crate::store::GroupState;

const W1: &str = "2025-10-02T00:10:00";

/// A stage producing one fixed artifact.
struct Produce(&'static str, &'static str);

impl Stage for Produce {
    fn run(&self, _: &GroupRecord, _: &StageContext) -> Result<ArtifactSet, StageError> {
        Ok(indexmap! { self.0.to_string() => self.1.to_string() })
    }
}

/// A stage that asserts an upstream artifact is visible, then passes.
struct Expects(&'static str);

impl Stage for Expects {
    fn run(&self, _: &GroupRecord, ctx: &StageContext) -> Result<ArtifactSet, StageError> {
        if ctx.contains(self.0) {
            Ok(ArtifactSet::new())
        } else {
            Err(StageError::Terminal(format!(
                "missing upstream artifact '{}'",
                self.0
            )))
        }
    }
}

/// A stage that fails, counting its invocations.
struct Fails {
    error: StageError,
    calls: Arc<AtomicUsize>,
}

impl Stage for Fails {
    fn run(&self, _: &GroupRecord, _: &StageContext) -> Result<ArtifactSet, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// A stage that fails retryably N times, then succeeds.
struct FlakyUntil {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl Stage for FlakyUntil {
    fn run(&self, _: &GroupRecord, _: &StageContext) -> Result<ArtifactSet, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(StageError::Retryable("collaborator timed out".to_string()))
        } else {
            Ok(ArtifactSet::new())
        }
    }
}

fn node(name: &str, deps: &[&str], stage: impl Stage + 'static) -> StageNode {
    StageNode {
        name: name.to_string(),
        deps: deps.iter().map(|d| d.to_string()).collect(),
        stage: Box::new(stage),
    }
}

fn store_with_pending(key: &str) -> Arc<Store> {
    let store = Arc::new(Store::open_in_memory().unwrap());
    store.ensure_group(key, 1, false, &[]).unwrap();
    store
        .insert_member(key, 0, &format!("/data/{key}_sb00.hdf5"), 1)
        .unwrap();
    assert!(store.mark_pending_if_complete(key).unwrap());
    store
}

fn zero_backoff(max_retries: u32) -> BackoffPolicy {
    BackoffPolicy {
        max_retries,
        initial_delay_s: 0.0,
        max_delay_s: 0.0,
    }
}

// ----------------------------------------------------------------------
// Graph validation
// ----------------------------------------------------------------------

#[test]
fn graph_orders_dependencies_first() {
    // A diamond: a -> (b, c) -> d, declared out of order.
    let graph = StageGraph::new(vec![
        node("d", &["b", "c"], Produce("x", "1")),
        node("b", &["a"], Produce("x", "1")),
        node("c", &["a"], Produce("x", "1")),
        node("a", &[], Produce("x", "1")),
    ])
    .unwrap();
    assert_eq!(graph.stage_names(), ["a", "b", "c", "d"]);
}

#[test]
fn graph_rejects_cycles() {
    let result = StageGraph::new(vec![
        node("a", &["b"], Produce("x", "1")),
        node("b", &["a"], Produce("x", "1")),
    ]);
    assert!(matches!(result, Err(GraphError::Cycle(_))));
}

#[test]
fn graph_rejects_bad_declarations() {
    assert!(matches!(StageGraph::new(vec![]), Err(GraphError::Empty)));
    assert!(matches!(
        StageGraph::new(vec![
            node("a", &[], Produce("x", "1")),
            node("a", &[], Produce("x", "1")),
        ]),
        Err(GraphError::DuplicateStage(_))
    ));
    assert!(matches!(
        StageGraph::new(vec![node("a", &["ghost"], Produce("x", "1"))]),
        Err(GraphError::UnknownDependency { .. })
    ));
    assert!(matches!(
        StageGraph::new(vec![node("a", &["a"], Produce("x", "1"))]),
        Err(GraphError::SelfDependency(_))
    ));
}

// ----------------------------------------------------------------------
// Execution
// ----------------------------------------------------------------------

#[test]
fn successful_run_completes_and_records_timing() {
    let store = store_with_pending(W1);
    let graph = StageGraph::new(vec![
        node("convert", &[], Produce("vis_set", "/out/a.ms")),
        node("image", &["convert"], Expects("vis_set")),
    ])
    .unwrap();
    let orchestrator = Orchestrator::new(Arc::clone(&store), graph, zero_backoff(3));

    let outcome = orchestrator.process_next().unwrap().unwrap();
    assert_eq!(
        outcome,
        GroupOutcome::Completed {
            group_key: W1.to_string()
        }
    );
    let group = store.group(W1).unwrap().unwrap();
    assert_eq!(group.state, GroupState::Completed);
    assert_eq!(group.retry_count, 0);

    let sample = store.perf_sample(W1).unwrap().unwrap();
    let names: Vec<&str> = sample.stage_seconds.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["convert", "image"]);
    assert!(sample.total_seconds >= 0.0);

    // Nothing further to claim.
    assert!(orchestrator.process_next().unwrap().is_none());
}

#[test]
fn downstream_stages_see_upstream_artifacts_only() {
    // "Expects" runs before "Produce" declares its artifact: terminal.
    let store = store_with_pending(W1);
    let graph = StageGraph::new(vec![
        node("first", &[], Expects("vis_set")),
        node("second", &["first"], Produce("vis_set", "/out/a.ms")),
    ])
    .unwrap();
    let orchestrator = Orchestrator::new(Arc::clone(&store), graph, zero_backoff(3));
    let outcome = orchestrator.process_next().unwrap().unwrap();
    assert!(matches!(
        outcome,
        GroupOutcome::Failed { terminal: true, .. }
    ));
}

#[test]
fn retryable_failure_marks_failed_and_skips_downstream() {
    let store = store_with_pending(W1);
    let downstream_calls = Arc::new(AtomicUsize::new(0));
    let graph = StageGraph::new(vec![
        node(
            "convert",
            &[],
            Fails {
                error: StageError::Retryable("disk busy".to_string()),
                calls: Arc::new(AtomicUsize::new(0)),
            },
        ),
        node(
            "image",
            &["convert"],
            Fails {
                error: StageError::Terminal("never reached".to_string()),
                calls: Arc::clone(&downstream_calls),
            },
        ),
    ])
    .unwrap();
    let orchestrator = Orchestrator::new(Arc::clone(&store), graph, zero_backoff(3));

    let outcome = orchestrator.process_next().unwrap().unwrap();
    match outcome {
        GroupOutcome::Failed {
            stage,
            terminal,
            error,
            ..
        } => {
            assert_eq!(stage, "convert");
            assert!(!terminal);
            assert_eq!(error, "disk busy");
        }
        other => panic!("Unexpected outcome: {other:?}"),
    }
    // The failing stage aborted the group; downstream never ran.
    assert_eq!(downstream_calls.load(Ordering::SeqCst), 0);

    let group = store.group(W1).unwrap().unwrap();
    assert_eq!(group.state, GroupState::Failed);
    assert_eq!(group.retry_count, 1);
    assert!(!group.terminal);
    assert_eq!(group.error.as_deref(), Some("disk busy"));
    // The failed attempt still left a timing sample.
    assert!(store.perf_sample(W1).unwrap().is_some());
}

#[test]
fn terminal_failure_sets_the_marker() {
    let store = store_with_pending(W1);
    let graph = StageGraph::new(vec![node(
        "convert",
        &[],
        Fails {
            error: StageError::Terminal("corrupt header".to_string()),
            calls: Arc::new(AtomicUsize::new(0)),
        },
    )])
    .unwrap();
    let orchestrator = Orchestrator::new(Arc::clone(&store), graph, zero_backoff(3));
    orchestrator.process_next().unwrap().unwrap();

    let group = store.group(W1).unwrap().unwrap();
    assert_eq!(group.state, GroupState::Failed);
    assert!(group.terminal);
    // Terminal groups are never resurrected by the sweep.
    let report = orchestrator.sweep(3600.0).unwrap();
    assert_eq!(report.requeued, 0);
    assert_eq!(store.group(W1).unwrap().unwrap().state, GroupState::Failed);
}

#[test]
fn flaky_group_retries_to_success() {
    // spec scenario: retry budget 3, two retryable failures, third attempt
    // succeeds; final state completed with retry count 2.
    let store = store_with_pending(W1);
    let calls = Arc::new(AtomicUsize::new(0));
    let graph = StageGraph::new(vec![node(
        "convert",
        &[],
        FlakyUntil {
            failures: 2,
            calls: Arc::clone(&calls),
        },
    )])
    .unwrap();
    let orchestrator = Orchestrator::new(Arc::clone(&store), graph, zero_backoff(3));

    for attempt in 1..=3 {
        let outcome = orchestrator.process_next().unwrap().unwrap();
        if attempt < 3 {
            assert!(matches!(outcome, GroupOutcome::Failed { terminal: false, .. }));
            // Zero backoff: the sweep makes it immediately eligible again.
            let report = orchestrator.sweep(3600.0).unwrap();
            assert_eq!(report.requeued, 1);
        } else {
            assert!(matches!(outcome, GroupOutcome::Completed { .. }));
        }
    }

    let group = store.group(W1).unwrap().unwrap();
    assert_eq!(group.state, GroupState::Completed);
    assert_eq!(group.retry_count, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn budget_exhaustion_is_permanent() {
    let store = store_with_pending(W1);
    let calls = Arc::new(AtomicUsize::new(0));
    let graph = StageGraph::new(vec![node(
        "convert",
        &[],
        Fails {
            error: StageError::Retryable("always transient".to_string()),
            calls: Arc::clone(&calls),
        },
    )])
    .unwrap();
    let orchestrator = Orchestrator::new(Arc::clone(&store), graph, zero_backoff(2));

    // Attempt 1 and its retry both fail; the budget of 2 is then spent.
    for _ in 0..2 {
        orchestrator.process_next().unwrap().unwrap();
        orchestrator.sweep(3600.0).unwrap();
    }
    assert!(orchestrator.process_next().unwrap().is_none());
    let group = store.group(W1).unwrap().unwrap();
    assert_eq!(group.state, GroupState::Failed);
    assert_eq!(group.retry_count, 2);
    // Two executions: the original attempt and the single re-queue.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn sweep_reclaims_abandoned_groups() {
    let store = store_with_pending(W1);
    // Claim without executing, simulating a worker that died mid-stage.
    store.claim_next_pending().unwrap().unwrap();

    let graph = StageGraph::new(vec![node("convert", &[], Produce("vis_set", "/out/a.ms"))])
        .unwrap();
    let orchestrator = Orchestrator::new(Arc::clone(&store), graph, zero_backoff(3));

    std::thread::sleep(std::time::Duration::from_millis(30));
    let report = orchestrator.sweep(0.01).unwrap();
    assert_eq!(report.stale_failed, 1);
    // With zero backoff the same sweep already re-queued it.
    assert_eq!(report.requeued, 1);

    // The reclaimed group processes normally afterwards.
    let outcome = orchestrator.process_next().unwrap().unwrap();
    assert!(matches!(outcome, GroupOutcome::Completed { .. }));
    assert_eq!(store.group(W1).unwrap().unwrap().retry_count, 1);
}
