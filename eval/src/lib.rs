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

//! Execution core of the incremental build tool.
//!
//! Requested goals are planned into evaluation groups around named tasks,
//! each group runs at most once per build, results are cached on disk keyed
//! by an input fingerprint, and independent groups can run on a worker
//! pool. See [`Evaluator::evaluate`] for the whole pipeline: plan →
//! (sequential | parallel) driver → cached group evaluation → result
//! assembly.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;
use thiserror::Error;

use quern_graph::{
    group_around_important, topo_sorted, transitive_inputs, Classify, CycleError, MultiBiMap,
};
use quern_logger::{FileLogger, Logger, MultiLogger};
use quern_tasks::{
    Discovery, NamedKind, NamedMeta, ProblemReporter, Segments, TaskId, TaskResult, Tasks,
    TestReporter, Val,
};

mod group;
mod hash;
mod paths;
mod pool;
mod scheduler;
mod sequential;
mod trace;

pub use hash::{hash_json, ordered_hash};
pub use paths::EvalPaths;

use group::GroupEvalCtx;

/// The head of a group: either a plain requested task or a named task with
/// its resolved label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Terminal {
    Task(TaskId),
    Labelled { task: TaskId, segments: Segments },
}

impl Terminal {
    pub fn task(&self) -> TaskId {
        match self {
            Terminal::Task(task) => *task,
            Terminal::Labelled { task, .. } => *task,
        }
    }

    pub fn segments(&self) -> Option<&Segments> {
        match self {
            Terminal::Task(_) => None,
            Terminal::Labelled { segments, .. } => Some(segments),
        }
    }

    pub fn label(&self) -> Option<String> {
        self.segments().map(|s| s.render())
    }
}

#[derive(Error, Debug)]
pub enum EvalError {
    #[error(transparent)]
    Cycle(#[from] CycleError<TaskId>),
    #[error("i/o error under the build output root")]
    Io(#[from] std::io::Error),
    #[error("internal evaluator failure: {0}")]
    Internal(String),
}

/// Everything a build run produced.
pub struct Results {
    /// One result per requested goal, in request order.
    pub raw_values: Vec<TaskResult>,
    /// Tasks whose bodies actually ran, in completion order.
    pub evaluated: Vec<TaskId>,
    /// The full transitive closure of the goals.
    pub transitive: Vec<TaskId>,
    /// Failing results per terminal, in group order.
    pub failing: Vec<(Terminal, Vec<TaskResult>)>,
    pub results: HashMap<TaskId, TaskResult>,
}

impl Results {
    /// Values of the goals that succeeded.
    pub fn values(&self) -> Vec<Val> {
        self.raw_values
            .iter()
            .filter_map(|r| r.success_value().cloned())
            .collect()
    }

    pub fn failing_for(&self, terminal: &Terminal) -> &[TaskResult] {
        self.failing
            .iter()
            .find(|(t, _)| t == terminal)
            .map(|(_, fails)| fails.as_slice())
            .unwrap_or(&[])
    }

    pub fn failed_terminals(&self) -> impl Iterator<Item = &Terminal> {
        self.failing
            .iter()
            .filter(|(_, fails)| !fails.is_empty())
            .map(|(t, _)| t)
    }
}

#[derive(Default)]
pub(crate) struct DriverState {
    pub results: HashMap<TaskId, TaskResult>,
    pub evaluated: Vec<TaskId>,
    pub timings: Vec<(Terminal, u64, bool)>,
}

/// Resolves the transitive closure of `goals` into dependency-ordered
/// groups around named and requested tasks.
pub fn plan(
    tasks: &Tasks,
    goals: &[TaskId],
    discovery: &dyn Discovery,
) -> Result<(MultiBiMap<Terminal, TaskId>, Vec<TaskId>), CycleError<TaskId>> {
    let transitive = transitive_inputs(tasks, goals);
    let topo = topo_sorted(tasks, &transitive)?;
    let goal_set: HashSet<TaskId> = goals.iter().copied().collect();
    let sorted_groups = group_around_important(tasks, &topo, |id| match tasks.node(id).named() {
        Some(meta) => Classify::Important(Terminal::Labelled {
            task: id,
            segments: terminal_segments(meta, discovery),
        }),
        None if goal_set.contains(&id) => Classify::Requested(Terminal::Task(id)),
        None => Classify::Anonymous,
    });
    Ok((sorted_groups, transitive))
}

/// A named task's terminal label. When the resolved final-override count
/// differs from the task's own, the label gains an `overriden` suffix plus
/// the declaration path, so parallel override chains stay distinguishable
/// on disk.
fn terminal_segments(meta: &NamedMeta, discovery: &dyn Discovery) -> Segments {
    let resolved = match meta.kind {
        NamedKind::Target => discovery
            .final_target_overrides(&meta.segments)
            .unwrap_or(0),
        NamedKind::Command => discovery
            .command_overrides(&meta.enclosing)
            .and_then(|counts| counts.into_iter().min())
            .unwrap_or(0),
        NamedKind::Worker => 0,
    };
    if resolved == meta.overrides {
        meta.segments.clone()
    } else {
        let suffix = Segments::labels(vec!["overriden"]).concat(&Segments::from_dotted(&meta.enclosing));
        meta.segments.concat(&suffix)
    }
}

/// Owns the run-wide configuration plus the process-lived worker cache.
pub struct Evaluator {
    pub home: PathBuf,
    pub out: PathBuf,
    pub external_out: PathBuf,
    /// Version hash of the build logic itself; folded into every group's
    /// fingerprint so cached results die with the logic that made them.
    pub logic_hash: i32,
    pub env: HashMap<String, String>,
    pub fail_fast: bool,
    /// `None` means one worker per logical processor.
    pub thread_count: Option<usize>,
    pub(crate) worker_cache: Mutex<HashMap<Segments, (i32, Val)>>,
}

impl Evaluator {
    pub fn new(home: PathBuf, out: PathBuf) -> Evaluator {
        let external_out = out.join("external");
        Evaluator {
            home,
            out,
            external_out,
            logic_hash: 0,
            env: HashMap::new(),
            fail_fast: true,
            thread_count: None,
            worker_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_logic_hash(mut self, logic_hash: i32) -> Evaluator {
        self.logic_hash = logic_hash;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Evaluator {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_thread_count(mut self, threads: usize) -> Evaluator {
        self.thread_count = Some(threads);
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Evaluator {
        self.env = env;
        self
    }

    pub fn with_external_out(mut self, external_out: PathBuf) -> Evaluator {
        self.external_out = external_out;
        self
    }

    pub fn effective_thread_count(&self) -> usize {
        self.thread_count.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Runs `goals` to completion and assembles the results.
    ///
    /// With one effective worker the sequential driver is used; the task
    /// contexts still carry the effective count as their `jobs` hint either
    /// way.
    pub fn evaluate(
        &self,
        tasks: &Tasks,
        goals: &[TaskId],
        discovery: &dyn Discovery,
        problem_reporter: &dyn ProblemReporter,
        test_reporter: &dyn TestReporter,
        base_logger: &dyn Logger,
    ) -> Result<Results, EvalError> {
        std::fs::create_dir_all(&self.out)?;
        let (sorted_groups, transitive) = plan(tasks, goals, discovery)?;
        let jobs = self.effective_thread_count();

        let ev_file = FileLogger::new(
            base_logger.colored(),
            self.out.join("evaluator.log"),
            true,
            false,
        );
        let logger = MultiLogger::new(base_logger.colored(), base_logger, &ev_file);
        logger.debug(&format!(
            "evaluating {} tasks in {} groups ({} jobs)",
            transitive.len(),
            sorted_groups.key_count(),
            jobs
        ));

        let cx = GroupEvalCtx {
            tasks,
            problem_reporter,
            test_reporter,
            jobs,
        };
        let state = if jobs > 1 {
            scheduler::evaluate_parallel(self, &cx, &sorted_groups, goals, &logger, jobs)?
        } else {
            sequential::evaluate_sequential(self, &cx, &sorted_groups, &logger)?
        };

        write_profile(&self.out, &state.timings)?;
        ev_file.close();

        let raw_values: Vec<TaskResult> = goals
            .iter()
            .map(|goal| {
                state
                    .results
                    .get(goal)
                    .cloned()
                    .expect("requested goal missing from results")
            })
            .collect();
        let failing: Vec<(Terminal, Vec<TaskResult>)> = sorted_groups
            .items()
            .map(|(terminal, group)| {
                let fails: Vec<TaskResult> = group
                    .iter()
                    .filter_map(|t| state.results.get(t))
                    .filter(|r| r.is_failing())
                    .cloned()
                    .collect();
                (terminal.clone(), fails)
            })
            .collect();

        Ok(Results {
            raw_values,
            evaluated: state.evaluated,
            transitive,
            failing,
            results: state.results,
        })
    }
}

#[derive(Serialize)]
struct ProfileEntry {
    label: Option<String>,
    millis: u64,
    cached: bool,
}

/// Per-terminal timings for the whole run, pretty-printed for humans and
/// tooling alike.
fn write_profile(
    out: &std::path::Path,
    timings: &[(Terminal, u64, bool)],
) -> Result<(), EvalError> {
    let entries: Vec<ProfileEntry> = timings
        .iter()
        .map(|(terminal, millis, cached)| ProfileEntry {
            label: terminal.label(),
            millis: *millis,
            cached: *cached,
        })
        .collect();
    let mut buf = Vec::new();
    hash::write_json_pretty(&mut buf, &entries).map_err(|e| EvalError::Internal(e.to_string()))?;
    std::fs::write(out.join("mill-profile.json"), buf)?;
    Ok(())
}

#[cfg(test)]
mod property_tests;
