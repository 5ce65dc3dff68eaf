// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::JobConfig,
    counters::{Counters, StatKey},
    error::ExecutionError,
    evaluator::{eval, run_trampoline},
    execution::Execution,
    pipe::{FlowSpec, Pipe, Sink, WriteDescriptor},
    tests::utils::{cluster_mode, eval_ctx, local_mode, records_key, MockPlanner},
    writer::{FlowWriter, Writer},
};
use claims::{assert_err, assert_ok, assert_ok_eq};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::runtime::Handle;

fn conf() -> JobConfig {
    JobConfig::empty()
}

#[tokio::test]
async fn zipped_writes_coalesce_into_one_submission() {
    let planner = MockPlanner::new();
    let events = Pipe::new("events");
    let sessions = Pipe::new("sessions");

    let execution =
        Execution::force_to_disk(events.clone()).zip(Execution::force_to_disk(sessions.clone()));
    let (forced_events, forced_sessions) = execution
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();

    assert_eq!(forced_events.label(), "forced-events");
    assert_eq!(forced_sessions.label(), "forced-sessions");

    let flows = planner.flows();
    assert_eq!(flows.len(), 1, "expected a single coalesced submission");
    assert_eq!(flows[0], vec![
        WriteDescriptor::Force { pipe: events },
        WriteDescriptor::Force { pipe: sessions },
    ]);
}

#[tokio::test]
async fn mapping_over_a_write_keeps_the_bundle_intact() {
    let planner = MockPlanner::new();
    let events = Pipe::new("events");

    let execution = Execution::force_to_disk(events)
        .map(|forced| forced.label().to_string())
        .zip(Execution::write(Pipe::new("sessions"), Sink::new("warehouse")));

    let (label, ()) = execution
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();
    assert_eq!(label, "forced-events");
    assert_eq!(planner.flows().len(), 1);
    assert_eq!(planner.flows()[0].len(), 2);
}

#[tokio::test]
async fn repeated_descriptors_submit_once() {
    let planner = MockPlanner::new();
    let events = Pipe::new("events");

    // Ten separate force executions over the same pipe token.
    let execution = Execution::sequence(
        (0..10)
            .map(|_| Execution::force_to_disk(events.clone()))
            .collect(),
    );
    let forced = execution
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();

    assert_eq!(forced.len(), 10);
    let flows = planner.flows();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0], vec![WriteDescriptor::Force { pipe: events }]);
}

#[tokio::test]
async fn to_iterable_reads_records_back() {
    let planner = MockPlanner::new();
    let execution = Execution::to_iterable(Pipe::new("events"));

    let records = execution
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();
    let labels: Vec<&String> = records
        .iter()
        .map(|record| record.downcast_ref::<String>().unwrap())
        .collect();
    assert_eq!(labels, ["events-0", "events-1"]);
}

#[tokio::test]
async fn counters_from_zipped_writes_add_up() {
    let planner = MockPlanner::new();

    // Both iterables land in one submission whose record count covers the
    // whole bundle.
    let (_, counters) = Execution::to_iterable(Pipe::new("clicks"))
        .zip(Execution::to_iterable(Pipe::new("views")))
        .run_and_report(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();
    assert_eq!(counters.value(&records_key()), 2);
}

#[tokio::test]
async fn reset_on_one_peer_does_not_hide_the_shared_submission() {
    let planner = MockPlanner::new();
    let events = Pipe::new("events");
    let left = Execution::to_iterable(events.clone()).reset_counters();
    let right = Execution::to_iterable(events);

    // Both sides observe the same submission; discarding the left branch's
    // accumulation leaves the right branch's view intact.
    let (_, counters) = left
        .zip(right)
        .run_and_report(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();
    assert_eq!(planner.flows().len(), 1);
    assert_eq!(counters.value(&records_key()), 1);
}

#[tokio::test]
async fn counters_sum_across_independent_submissions() {
    let planner = MockPlanner::new();
    let first = Execution::to_iterable(Pipe::new("events"))
        .flat_map(|_| Execution::to_iterable(Pipe::new("sessions")));

    // Dependent stages cannot coalesce, so this is two submissions whose
    // counters merge pointwise.
    let (_, counters) = first
        .run_and_report(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();
    assert_eq!(planner.flows().len(), 2);
    assert_eq!(counters.value(&records_key()), 2);
    assert_eq!(counters.value(&StatKey::new("write", "events")), 1);
    assert_eq!(counters.value(&StatKey::new("write", "sessions")), 1);
}

#[tokio::test]
async fn get_counters_surfaces_accumulation_without_consuming_it() {
    let planner = MockPlanner::new();
    let execution = Execution::to_iterable(Pipe::new("events"))
        .get_counters()
        .map(|(_, counters)| counters.value(&records_key()));

    let (surfaced, reported) = execution
        .run_and_report(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();
    assert_eq!(surfaced, 1);
    // The counters remain attached for the outer accumulation too.
    assert_eq!(reported.value(&records_key()), 1);
}

#[tokio::test]
async fn get_counters_first_component_is_the_plain_value() {
    let planner = MockPlanner::new();
    let labels = |records: crate::writer::RecordBatch| -> Vec<String> {
        records
            .iter()
            .map(|record| record.downcast_ref::<String>().unwrap().clone())
            .collect()
    };

    let plain = Execution::to_iterable(Pipe::new("events"))
        .map(labels)
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();
    let surfaced = Execution::to_iterable(Pipe::new("events"))
        .get_counters()
        .map(move |(records, _)| labels(records))
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();
    assert_eq!(plain, surfaced);
}

#[tokio::test]
async fn reset_counters_discards_accumulation() {
    let planner = MockPlanner::new();
    let execution = Execution::to_iterable(Pipe::new("events"))
        .reset_counters()
        .get_counters()
        .map(|(_, counters)| counters);

    let (observed, reported) = execution
        .run_and_report(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();
    assert!(observed.is_empty());
    assert!(reported.is_empty());
}

#[tokio::test]
async fn flow_specs_need_a_cluster_writer() {
    let planner = MockPlanner::new();
    let execution = Execution::from_flow_spec(|_, _| Ok(FlowSpec::new("nightly-rollup")));

    assert_ok!(
        execution
            .run(&Handle::current(), conf(), cluster_mode(&planner))
            .await
    );
    assert_eq!(planner.spec_runs(), ["nightly-rollup"]);

    let error = execution
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap_err();
    assert!(matches!(error, ExecutionError::FlowSpecUnsupported));
}

#[tokio::test]
async fn flow_spec_counters_are_reported() {
    let planner = MockPlanner::new();
    let execution = Execution::from_flow_spec(|_, _| Ok(FlowSpec::new("nightly-rollup")));

    let ((), counters) = execution
        .run_and_report(&Handle::current(), conf(), cluster_mode(&planner))
        .await
        .unwrap();
    assert_eq!(counters.value(&StatKey::new("spec", "nightly-rollup")), 1);
}

#[tokio::test]
async fn structurally_equal_subgraphs_evaluate_once() {
    let planner = MockPlanner::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs2 = runs.clone();

    // The map node is shared (cloned), so both zip sides hit one cache
    // entry and the producer underneath runs once.
    let shared = Execution::from_fn(move || {
        runs2.fetch_add(1, Ordering::SeqCst);
        Ok(21)
    })
    .map(|v| v * 2);

    let value = shared
        .clone()
        .zip(shared)
        .map(|(a, b)| a + b)
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();
    assert_eq!(value, 84);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn with_new_cache_isolates_memoization() {
    let planner = MockPlanner::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs2 = runs.clone();

    let shared = Execution::from_fn(move || {
        runs2.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    })
    .map(|v| v + 1);

    // The isolated side re-evaluates the shared sub-graph in its own
    // scope; the outer side still hits the run-wide cache.
    let value = shared
        .clone()
        .with_new_cache()
        .zip(shared.clone().zip(shared))
        .map(|(a, (b, c))| a + b + c)
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();
    assert_eq!(value, 6);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn with_new_cache_still_deduplicates_writes() {
    let planner = MockPlanner::new();
    let events = Pipe::new("events");

    let write = Execution::force_to_disk(events.clone());
    let execution = write.clone().with_new_cache().zip(write);

    assert_ok!(
        execution
            .run(&Handle::current(), conf(), local_mode(&planner))
            .await
    );
    // The write table is shared across cache scopes: one submission.
    assert_eq!(planner.flows().len(), 1);
}

#[tokio::test]
async fn isolated_scopes_keep_the_outer_cache_small() {
    let planner = MockPlanner::new();
    let (ctx, cache) = eval_ctx(&planner);

    let mut big = Execution::from_value(0u64);
    for _ in 0..32 {
        big = big.map(|v| v + 1);
    }
    let isolated = big.with_new_cache();

    let future = run_trampoline(eval(&ctx, &conf(), isolated.node()));
    assert!(future.await.is_ok());
    // Only the with_new_cache node itself lands in the outer scope; the 32
    // chained maps were memoized in the throwaway inner scope.
    assert_eq!(cache.exec_entries(), 1);
}

#[tokio::test]
async fn transformed_config_keys_the_cache_by_the_rewritten_config() {
    let planner = MockPlanner::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs2 = runs.clone();

    let counted = Execution::from_fn(move || {
        runs2.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    })
    .flat_map(|_| Execution::reader().map(|(conf, _)| conf.get("tier").unwrap_or("none").to_string()));

    let tiered = counted
        .clone()
        .with_config(|conf| conf.set("tier", "hot"))
        .zip(counted);

    let (hot, fallback) = tiered
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();
    assert_eq!(hot, "hot");
    assert_eq!(fallback, "none");
    // Same sub-tree under two configs: two cache keys, two evaluations.
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn empty_bundles_yield_fresh_ids_and_no_planner_call() {
    let planner = MockPlanner::new();
    let writer = FlowWriter::new(planner.clone(), Handle::current(), false);

    let (first_id, first_counters) = writer.execute(&conf(), Vec::new()).await.unwrap();
    let (second_id, second_counters) = writer.execute(&conf(), Vec::new()).await.unwrap();

    assert_ne!(first_id, second_id);
    assert!(first_counters.is_empty());
    assert!(second_counters.is_empty());
    assert!(planner.flows().is_empty());
}

#[tokio::test]
async fn writer_lifecycle_reaches_the_planner_once() {
    let planner = MockPlanner::new();

    // Success path.
    assert_ok_eq!(
        Execution::from_value(1)
            .run(&Handle::current(), conf(), local_mode(&planner))
            .await,
        1
    );
    assert_eq!(planner.shutdowns(), 1);

    // Failure path still releases the (fresh) writer exactly once.
    assert_err!(
        Execution::<i64>::failed(ExecutionError::message("boom"))
            .run(&Handle::current(), conf(), local_mode(&planner))
            .await
    );
    assert_eq!(planner.shutdowns(), 2);
}

#[tokio::test]
async fn failed_bundles_fail_every_peer() {
    let planner = MockPlanner::new();
    let broken = Pipe::new("broken");
    planner.fail_pipe(&broken);

    let write = Execution::force_to_disk(broken);
    let execution = write.clone().zip(write);

    let error = execution
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap_err();
    assert_eq!(error.get_label(), "user");
    assert_eq!(planner.flows().len(), 1);
}

/// run_and_report flattens the by-submission counters the evaluator
/// threads through; a plain Counters equality keeps this honest.
#[tokio::test]
async fn run_and_report_flattens_counters() {
    let planner = MockPlanner::new();
    let execution = Execution::to_iterable(Pipe::new("events")).map(|records| records.len());

    let (count, counters) = execution
        .run_and_report(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(
        counters,
        Counters::from_iter([
            (records_key(), 1),
            (StatKey::new("write", "events"), 1),
        ])
    );
}
