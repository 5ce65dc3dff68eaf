// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::JobConfig,
    error::ExecutionError,
    execution::Execution,
    pipe::Pipe,
    tests::utils::{local_mode, MockPlanner},
};
use claims::assert_ok_eq;
use tokio::runtime::Handle;

fn conf() -> JobConfig {
    JobConfig::empty()
}

#[tokio::test]
async fn a_failing_zip_side_stops_its_peer_before_run_resolves() {
    let planner = MockPlanner::new();
    let stalled = Pipe::new("stalled");
    planner.stall_pipe(&stalled);

    let never_ending = Execution::force_to_disk(stalled).map(|_| 0i64);
    let failing = Execution::<i64>::failed(ExecutionError::message("boom"));

    let error = failing
        .zip(never_ending)
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap_err();

    // The original failure surfaces, and by the time the run future
    // resolved, the stalled submission had received its stop signal.
    assert_eq!(error.get_label(), "user");
    assert_eq!(planner.stops().len(), 1);
    assert_eq!(planner.shutdowns(), 1);
}

#[tokio::test]
async fn recover_with_never_intercepts_a_flow_stop() {
    let planner = MockPlanner::new();
    let execution = Execution::<i64>::failed(ExecutionError::flow_stopped("cluster teardown"))
        .recover_with(|_| Some(Execution::from_value(42)));

    let error = execution
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap_err();
    assert!(error.is_flow_stop());
}

#[tokio::test]
async fn recover_with_sees_every_other_failure_kind() {
    let planner = MockPlanner::new();
    let recover_all = |error: &ExecutionError| {
        let label = error.get_label();
        Some(Execution::from_value(label))
    };

    assert_ok_eq!(
        Execution::<&'static str>::failed(ExecutionError::message("boom"))
            .recover_with(recover_all)
            .run(&Handle::current(), conf(), local_mode(&planner))
            .await,
        "user"
    );
    assert_ok_eq!(
        Execution::<&'static str>::failed(ExecutionError::FilterFailed {
            value: "3".to_string()
        })
        .recover_with(recover_all)
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await,
        "filter_failed"
    );
}

#[tokio::test]
async fn flow_stops_inside_a_zip_propagate_unrecovered() {
    let planner = MockPlanner::new();
    let execution = Execution::from_value(1)
        .zip(Execution::<i64>::failed(ExecutionError::flow_stopped(
            "preempted",
        )))
        .recover_with(|_| Some(Execution::from_value((0, 0))));

    let error = execution
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap_err();
    assert!(error.is_flow_stop());
}

#[tokio::test]
async fn failed_runs_still_release_the_writer_after_stopping() {
    let planner = MockPlanner::new();
    let stalled = Pipe::new("stalled");
    planner.stall_pipe(&stalled);

    let execution = Execution::force_to_disk(stalled)
        .map(|_| ())
        .zip(Execution::<()>::failed(ExecutionError::message("boom")));

    let _ = execution
        .run(&Handle::current(), conf(), local_mode(&planner))
        .await
        .unwrap_err();

    // Stop signal first, then exactly one writer release.
    assert_eq!(planner.stops().len(), 1);
    assert_eq!(planner.shutdowns(), 1);
}
