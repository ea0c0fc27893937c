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

//! The parallel driver.
//!
//! One scheduler thread owns all bookkeeping (`pending`, `in_progress`,
//! `done`, the results map); a fixed pool of workers runs group jobs and
//! reports back over a completion channel. Workers only ever see immutable
//! snapshots taken at dispatch, so a job never observes another job's
//! half-merged results. Groups whose labelled terminals render to the same
//! segments are never in flight together.

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use quern_graph::MultiBiMap;
use quern_logger::{FileLogger, Logger};
use quern_tasks::{TaskId, TaskResult};

use crate::group::{panic_message, Evaluated, GroupEvalCtx};
use crate::pool::{PoolJob, WorkerPool};
use crate::trace::ChromeProfile;
use crate::{DriverState, EvalError, Evaluator, Terminal};

struct GroupJob<'a> {
    ev: &'a Evaluator,
    cx: &'a GroupEvalCtx<'a>,
    group_idx: usize,
    terminal: Terminal,
    group: Vec<TaskId>,
    /// Results of every completed group at dispatch time.
    upstream: Arc<HashMap<TaskId, TaskResult>>,
    counter_msg: String,
    fail_fast: bool,
    failed: &'a AtomicBool,
    logger: &'a dyn Logger,
    epoch: Instant,
}

struct GroupDone {
    group_idx: usize,
    /// `Err` means the job itself crashed, as opposed to a task failing.
    outcome: Result<Evaluated, String>,
    start_us: u64,
    dur_us: u64,
    millis: u64,
    thread: String,
}

impl<'a> PoolJob for GroupJob<'a> {
    type Done = GroupDone;

    fn run(&self) -> GroupDone {
        let start_us = self.epoch.elapsed().as_micros() as u64;
        let started = Instant::now();

        let outcome = if self.fail_fast && self.failed.load(Ordering::SeqCst) {
            // Dispatched before the failure was observed; don't start work.
            Ok(Evaluated {
                new_results: self
                    .group
                    .iter()
                    .map(|&task| (task, TaskResult::Aborted))
                    .collect(),
                new_evaluated: Vec::new(),
                cached: false,
            })
        } else {
            match panic::catch_unwind(AssertUnwindSafe(|| {
                self.ev.evaluate_group_cached(
                    self.cx,
                    &self.terminal,
                    &self.group,
                    &self.upstream,
                    &self.counter_msg,
                    self.logger,
                )
            })) {
                Ok(result) => result.map_err(|e| format!("{:#}", e)),
                Err(payload) => Err(panic_message(payload)),
            }
        };

        let elapsed = started.elapsed();
        GroupDone {
            group_idx: self.group_idx,
            outcome,
            start_us,
            dur_us: elapsed.as_micros() as u64,
            millis: elapsed.as_millis() as u64,
            thread: std::thread::current()
                .name()
                .unwrap_or("worker")
                .to_owned(),
        }
    }
}

struct Shared<'a, 'p> {
    ev: &'a Evaluator,
    cx: &'a GroupEvalCtx<'a>,
    groups: &'a [(&'a Terminal, &'a [TaskId])],
    inter_group_deps: &'a [Vec<usize>],
    task_segments: &'a [Option<String>],
    pool: &'p WorkerPool<GroupJob<'a>>,
    logger: &'a dyn Logger,
    debug_log: &'a FileLogger,
    failed: &'a AtomicBool,
    next_counter: &'a AtomicUsize,
    epoch: Instant,
    worker_count: usize,
    total: usize,
}

#[derive(Default)]
struct SchedState {
    pending: Vec<usize>,
    in_progress: HashSet<usize>,
    done: HashSet<usize>,
    in_flight: usize,
    state: DriverState,
}

/// Picks dependency-free groups off `pending`, respecting output-path
/// exclusion, and submits them.
///
/// Scanning stops once something was taken and either a segment collision
/// was seen (dispatch immediately so the collider can clear) or twice the
/// worker count is queued. Over-dispatch is tolerated; job bodies re-check
/// fail-fast before starting.
fn schedule_work(shared: &Shared<'_, '_>, st: &mut SchedState, cause: &str) {
    if st.pending.is_empty() || st.in_progress.len() > shared.worker_count {
        return;
    }

    let old_seen: HashSet<&str> = st
        .in_progress
        .iter()
        .filter_map(|&g| shared.task_segments[g].as_deref())
        .collect();
    let mut new_seen: HashSet<&str> = HashSet::new();
    let mut taken: Vec<usize> = Vec::new();
    let mut collisions_free = true;

    for &g in st.pending.iter() {
        if !taken.is_empty() && (!collisions_free || taken.len() >= 2 * shared.worker_count) {
            break;
        }
        if let Some(segments) = shared.task_segments[g].as_deref() {
            if old_seen.contains(segments) || new_seen.contains(segments) {
                collisions_free = false;
                continue;
            }
        }
        if shared.inter_group_deps[g].iter().all(|d| st.done.contains(d)) {
            if let Some(segments) = shared.task_segments[g].as_deref() {
                new_seen.insert(segments);
            }
            taken.push(g);
        }
    }

    if taken.is_empty() {
        return;
    }
    shared.debug_log.debug(&format!(
        "scheduling {} new groups after {}",
        taken.len(),
        cause
    ));

    let snapshot = Arc::new(st.state.results.clone());
    for g in taken {
        st.pending.retain(|&p| p != g);
        st.in_progress.insert(g);
        st.in_flight += 1;
        let k = shared.next_counter.fetch_add(1, Ordering::SeqCst);
        let (terminal, group) = shared.groups[g];
        shared.pool.submit(GroupJob {
            ev: shared.ev,
            cx: shared.cx,
            group_idx: g,
            terminal: terminal.clone(),
            group: group.to_vec(),
            upstream: Arc::clone(&snapshot),
            counter_msg: format!("{}/{}", k, shared.total),
            fail_fast: shared.ev.fail_fast,
            failed: shared.failed,
            logger: shared.logger,
            epoch: shared.epoch,
        });
    }
}

pub(crate) fn evaluate_parallel(
    ev: &Evaluator,
    cx: &GroupEvalCtx<'_>,
    sorted_groups: &MultiBiMap<Terminal, TaskId>,
    goals: &[TaskId],
    logger: &dyn Logger,
    worker_count: usize,
) -> Result<DriverState, EvalError> {
    let groups: Vec<(&Terminal, &[TaskId])> = sorted_groups.items().collect();
    let total = groups.len();

    // Prerequisite groups: the owner of every input that crosses a group
    // boundary, deduplicated.
    let mut inter_group_deps: Vec<Vec<usize>> = Vec::with_capacity(total);
    for (_, group) in &groups {
        let members: HashSet<TaskId> = group.iter().copied().collect();
        let mut deps: Vec<usize> = Vec::new();
        for &task in group.iter() {
            for input in cx.tasks.node(task).inputs() {
                if members.contains(input) {
                    continue;
                }
                if let Some(owner) = sorted_groups.value_owner_index(input) {
                    if !deps.contains(&owner) {
                        deps.push(owner);
                    }
                }
            }
        }
        inter_group_deps.push(deps);
    }

    let task_segments: Vec<Option<String>> =
        groups.iter().map(|(terminal, _)| terminal.label()).collect();

    let debug_log = FileLogger::new(false, ev.out.join("tasks-par.log"), true, false);
    debug_log.debug(&format!(
        "parallel evaluation: {} groups on {} workers",
        total, worker_count
    ));
    let mut trace = ChromeProfile::new(&ev.out.join("mill-par-profile.json"))?;

    let failed = AtomicBool::new(false);
    let next_counter = AtomicUsize::new(1);
    let epoch = Instant::now();
    let pool = WorkerPool::new(worker_count);

    let mut st = pool.run(|rx| {
        let shared = Shared {
            ev,
            cx,
            groups: &groups,
            inter_group_deps: &inter_group_deps,
            task_segments: &task_segments,
            pool: &pool,
            logger,
            debug_log: &debug_log,
            failed: &failed,
            next_counter: &next_counter,
            epoch,
            worker_count,
            total,
        };
        let mut st = SchedState {
            pending: (0..total).collect(),
            ..SchedState::default()
        };

        schedule_work(&shared, &mut st, "startup");

        loop {
            if st.in_flight == 0 {
                break;
            }
            if ev.fail_fast && failed.load(Ordering::SeqCst) {
                break;
            }
            let done = match rx.recv() {
                Ok(done) => done,
                Err(_) => break,
            };
            st.in_flight -= 1;
            st.in_progress.remove(&done.group_idx);
            st.done.insert(done.group_idx);

            let (terminal, _) = shared.groups[done.group_idx];
            let name = shared.task_segments[done.group_idx]
                .clone()
                .unwrap_or_else(|| terminal.task().to_string());

            match done.outcome {
                Ok(evaluated) => {
                    if evaluated.new_results.iter().any(|(_, r)| r.is_failing()) {
                        failed.store(true, Ordering::SeqCst);
                    }
                    st.state
                        .evaluated
                        .extend(evaluated.new_evaluated.iter().copied());
                    for (task, result) in evaluated.new_results {
                        st.state.results.insert(task, result);
                    }
                    st.state
                        .timings
                        .push((terminal.clone(), done.millis, evaluated.cached));
                    trace.log(&name, done.start_us, done.dur_us, &done.thread, evaluated.cached);
                    debug_log.debug(&format!(
                        "finished {} on {} in {} ms{}",
                        name,
                        done.thread,
                        done.millis,
                        if evaluated.cached { " (cached)" } else { "" }
                    ));
                }
                Err(message) => {
                    // The job crashed outside any task body. Keep draining;
                    // only the affected subgraph is lost.
                    logger.error(&format!("error evaluating {}: {}", name, message));
                    failed.store(true, Ordering::SeqCst);
                }
            }

            if ev.fail_fast && failed.load(Ordering::SeqCst) {
                break;
            }
            schedule_work(&shared, &mut st, &name);
        }

        // Let every dispatched job finish so the pool shuts down cleanly;
        // post-failure completions are discarded.
        while st.in_flight > 0 {
            match rx.recv() {
                Ok(_) => st.in_flight -= 1,
                Err(_) => break,
            }
        }
        st
    });

    if failed.load(Ordering::SeqCst) {
        for &goal in goals {
            st.state.results.entry(goal).or_insert(TaskResult::Aborted);
        }
    }

    trace.close();
    debug_log.close();
    Ok(st.state)
}
