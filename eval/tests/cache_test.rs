/*
 * Copyright 2026 The quern project developers
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use quern_tasks::{Segments, TaskFail, TaskResult, TaskSpec, Tasks, Val, ValueFormat};

mod common;
use common::*;

/// In-memory handle a worker body would hold open.
struct CompilerHandle {
    generation: usize,
}

fn worker_graph(side: i32, runs: &Arc<AtomicUsize>) -> (Tasks, quern_tasks::TaskId) {
    let runs = Arc::clone(runs);
    let mut tasks = Tasks::new();
    let worker = tasks.add(
        TaskSpec::worker(Segments::from_dotted("compilerWorker"), vec![], move |_ctx| {
            let generation = runs.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Val::new(CompilerHandle { generation }))
        })
        .side_hash(side),
    );
    (tasks, worker)
}

#[test]
fn worker_keeps_identity_while_inputs_are_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let ev = sequential_evaluator(dir.path());
    let runs = Arc::new(AtomicUsize::new(0));

    let (tasks, worker) = worker_graph(1, &runs);
    let first = run(&ev, &tasks, &[worker]);
    let second = run(&ev, &tasks, &[worker]);
    assert_eq!(runs.load(Ordering::SeqCst), 1, "second run must hit the worker cache");

    let v1 = first.raw_values[0].success_value().unwrap().clone();
    let v2 = second.raw_values[0].success_value().unwrap().clone();
    assert!(v1.same_instance(&v2), "worker value must keep identity");
    assert_eq!(v2.downcast_ref::<CompilerHandle>().unwrap().generation, 1);

    // Workers are memory-only: no meta record is written.
    assert!(!meta_path(&ev.out, "compilerWorker").exists());

    // A changed fingerprint rebuilds the worker.
    let (tasks, worker) = worker_graph(2, &runs);
    let third = run(&ev, &tasks, &[worker]);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    let v3 = third.raw_values[0].success_value().unwrap().clone();
    assert!(!v1.same_instance(&v3));
    assert_eq!(v3.downcast_ref::<CompilerHandle>().unwrap().generation, 2);
}

#[test]
fn worker_value_hash_is_its_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let ev = sequential_evaluator(dir.path()).with_logic_hash(3);
    let runs = Arc::new(AtomicUsize::new(0));

    let (tasks, worker) = worker_graph(9, &runs);
    let results = run(&ev, &tasks, &[worker]);
    let expected = quern_eval::ordered_hash(Vec::new())
        .wrapping_add(quern_eval::ordered_hash(vec![9]))
        .wrapping_add(3);
    assert_eq!(results.raw_values[0].success_hash(), Some(expected));
}

#[test]
fn partial_failure_is_persisted_but_never_a_hit() {
    let dir = tempfile::tempdir().unwrap();
    let ev = sequential_evaluator(dir.path()).with_fail_fast(false);

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_body = Arc::clone(&attempts);
    let mut tasks = Tasks::new();
    let flaky = tasks.add(
        TaskSpec::target(Segments::from_dotted("G"), vec![], move |_ctx| {
            attempts_in_body.fetch_add(1, Ordering::SeqCst);
            Err(TaskFail::partial("bad", Val::new(99i64)))
        })
        .format(ValueFormat::of::<i64>()),
    );

    let first = run(&ev, &tasks, &[flaky]);
    match &first.raw_values[0] {
        TaskResult::Failure { msg, partial } => {
            assert_eq!(msg, "bad");
            let (value, _) = partial.as_ref().unwrap();
            assert_eq!(value.downcast_ref::<i64>(), Some(&99));
        }
        other => panic!("expected a failure, got {:?}", other),
    }

    // The best-effort value is on disk and inspectable.
    let meta = read_meta(&ev.out, "G");
    assert_eq!(meta["value"], 99);

    // It is still not a cache hit: the body runs again.
    run(&ev, &tasks, &[flaky]);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn corrupt_meta_is_a_miss_not_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let ev = sequential_evaluator(dir.path());

    let mut tasks = Tasks::new();
    let a = int_target(&mut tasks, "A", vec![], 1, |_| 5);
    run(&ev, &tasks, &[a]);

    std::fs::write(meta_path(&ev.out, "A"), "{ definitely not json").unwrap();
    let again = run(&ev, &tasks, &[a]);
    assert_eq!(goal_int(&again, 0), 5);
    assert_eq!(again.evaluated, vec![a], "corrupt record must force a re-run");

    // The record is healthy again afterwards.
    assert_eq!(read_meta(&ev.out, "A")["value"], 5);
}

#[test]
fn mismatched_fingerprint_in_meta_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let ev = sequential_evaluator(dir.path());

    let mut tasks = Tasks::new();
    let a = int_target(&mut tasks, "A", vec![], 1, |_| 5);
    run(&ev, &tasks, &[a]);

    let mut meta = read_meta(&ev.out, "A");
    meta["inputsHash"] = serde_json::json!(12345);
    std::fs::write(meta_path(&ev.out, "A"), meta.to_string()).unwrap();

    let again = run(&ev, &tasks, &[a]);
    assert_eq!(again.evaluated, vec![a]);
}

#[test]
fn formatless_target_always_misses() {
    let dir = tempfile::tempdir().unwrap();
    let ev = sequential_evaluator(dir.path());

    struct Opaque;
    let mut tasks = Tasks::new();
    let opaque = tasks.add(TaskSpec::target(
        Segments::from_dotted("opaque"),
        vec![],
        |_ctx| Ok(Val::new(Opaque)),
    ));

    let first = run(&ev, &tasks, &[opaque]);
    assert!(first.raw_values[0].is_success());
    assert!(!meta_path(&ev.out, "opaque").exists());

    let second = run(&ev, &tasks, &[opaque]);
    assert_eq!(second.evaluated, vec![opaque]);
}

#[test]
fn flush_dest_clears_the_scratch_directory() {
    let dir = tempfile::tempdir().unwrap();
    let ev = sequential_evaluator(dir.path());

    let build = |side: i32| {
        let mut tasks = Tasks::new();
        let id = tasks.add(
            TaskSpec::target(Segments::from_dotted("flushed"), vec![], |ctx| {
                let dest = ctx.dest()?;
                let marker = dest.join("marker");
                let existed = marker.exists();
                std::fs::write(&marker, "x")?;
                Ok(Val::new(existed))
            })
            .side_hash(side)
            .flush_dest(),
        );
        (tasks, id)
    };

    let (tasks, id) = build(1);
    let first = run(&ev, &tasks, &[id]);
    assert_eq!(
        first.raw_values[0].success_value().unwrap().downcast_ref::<bool>(),
        Some(&false)
    );

    // New fingerprint, fresh dest: the marker from the first run is gone.
    let (tasks, id) = build(2);
    let second = run(&ev, &tasks, &[id]);
    assert_eq!(
        second.raw_values[0].success_value().unwrap().downcast_ref::<bool>(),
        Some(&false)
    );
}

#[test]
fn external_targets_route_to_the_external_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let ev = sequential_evaluator(dir.path())
        .with_external_out(dir.path().join("external-out"));

    let mut tasks = Tasks::new();
    let ext = tasks.add(
        TaskSpec::target(Segments::from_dotted("upstream.fetch"), vec![], |_ctx| {
            Ok(Val::new(1i64))
        })
        .format(ValueFormat::of::<i64>())
        .external(),
    );

    run(&ev, &tasks, &[ext]);
    assert!(!meta_path(&ev.out, "upstream.fetch").exists());
    assert!(meta_path(&ev.external_out, "upstream.fetch").exists());
}

#[test]
fn foreign_prefix_relocates_the_cache_path() {
    let dir = tempfile::tempdir().unwrap();
    let ev = sequential_evaluator(dir.path());

    let mut tasks = Tasks::new();
    let foreign = tasks.add(
        TaskSpec::target(Segments::from_dotted("core.compile"), vec![], |_ctx| {
            Ok(Val::new(1i64))
        })
        .format(ValueFormat::of::<i64>())
        .foreign(Segments::from_dotted("upstream-build")),
    );

    run(&ev, &tasks, &[foreign]);
    assert!(meta_path(&ev.out, "upstream-build.core.compile").exists());
    assert!(!meta_path(&ev.out, "core.compile").exists());
}
