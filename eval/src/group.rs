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

//! Cached evaluation of one group.
//!
//! A group runs at most once per build. Labelled terminals consult the
//! worker cache and the on-disk `meta.json` before running anything; on a
//! miss the whole group executes in-group-topological order on one thread,
//! and the terminal's value is persisted for the next run.

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};

use quern_logger::{FileLogger, Logger, MultiLogger, PrefixLogger};
use quern_tasks::{
    DestSlot, ProblemReporter, TaskContext, TaskFail, TaskId, TaskNode, TaskResult, Tasks,
    TestReporter, Val,
};

use crate::hash::{hash_json, ordered_hash, write_json_atomic};
use crate::paths::EvalPaths;
use crate::{Evaluator, Terminal};

/// Immutable per-run surroundings shared by every group evaluation.
pub(crate) struct GroupEvalCtx<'a> {
    pub tasks: &'a Tasks,
    pub problem_reporter: &'a dyn ProblemReporter,
    pub test_reporter: &'a dyn TestReporter,
    /// Worker-count hint threaded into task contexts.
    pub jobs: usize,
}

/// What one group evaluation produced.
pub(crate) struct Evaluated {
    /// Results in execution order; the terminal's entry is last when the
    /// group actually ran.
    pub new_results: Vec<(TaskId, TaskResult)>,
    pub new_evaluated: Vec<TaskId>,
    pub cached: bool,
}

/// The persisted cache record for a labelled terminal.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedRecord {
    value: serde_json::Value,
    value_hash: i32,
    inputs_hash: i32,
}

impl Evaluator {
    /// The input fingerprint of a group: the value-hashes of the set of
    /// upstream inputs in first-occurrence order, the group's own side
    /// hashes, and the build-logic hash.
    pub(crate) fn group_inputs_hash(
        &self,
        tasks: &Tasks,
        group: &[TaskId],
        upstream: &HashMap<TaskId, TaskResult>,
    ) -> i32 {
        let members: HashSet<TaskId> = group.iter().copied().collect();
        // The union of the group's external inputs: two members naming the
        // same upstream task must fingerprint like one member naming it.
        let mut seen: HashSet<TaskId> = HashSet::new();
        let external = group
            .iter()
            .flat_map(|&t| tasks.node(t).inputs().iter().copied())
            .filter(|t| !members.contains(t))
            .filter(|&t| seen.insert(t))
            .filter_map(|t| upstream.get(&t).and_then(|r| r.success_hash()));
        let external_hash = ordered_hash(external);
        let side_hash = ordered_hash(group.iter().map(|&t| tasks.node(t).side_hash()));
        external_hash
            .wrapping_add(side_hash)
            .wrapping_add(self.logic_hash)
    }

    pub(crate) fn evaluate_group_cached(
        &self,
        cx: &GroupEvalCtx<'_>,
        terminal: &Terminal,
        group: &[TaskId],
        upstream: &HashMap<TaskId, TaskResult>,
        counter_msg: &str,
        logger: &dyn Logger,
    ) -> anyhow::Result<Evaluated> {
        let inputs_hash = self.group_inputs_hash(cx.tasks, group, upstream);

        let (task, segments) = match terminal {
            Terminal::Task(_) => {
                let (new_results, new_evaluated) = self.evaluate_group(
                    cx,
                    group,
                    upstream,
                    inputs_hash,
                    None,
                    None,
                    counter_msg,
                    logger,
                )?;
                return Ok(Evaluated {
                    new_results,
                    new_evaluated,
                    cached: false,
                });
            }
            Terminal::Labelled { task, segments } => (*task, segments),
        };

        let node = cx.tasks.node(task);
        let meta = match node.named() {
            Some(meta) => meta,
            None => anyhow::bail!("labelled terminal {} has no name", task),
        };
        let root = if meta.external {
            &self.external_out
        } else {
            &self.out
        };
        let dest_segments = match &meta.foreign {
            Some(foreign) => foreign.concat(segments),
            None => segments.clone(),
        };
        let paths = EvalPaths::resolve(root, &dest_segments);
        std::fs::create_dir_all(&paths.out)?;

        let worker_hit = if node.is_worker() {
            self.worker_cache_get(&meta.segments, inputs_hash)
                .map(|value| (value, inputs_hash))
        } else {
            None
        };
        let hit = worker_hit.or_else(|| load_cached_json(node, inputs_hash, &paths));
        if let Some((value, value_hash)) = hit {
            logger.debug(&format!("[{}] {} (cached)", counter_msg, dest_segments));
            return Ok(Evaluated {
                new_results: vec![(task, TaskResult::Success { value, value_hash })],
                new_evaluated: vec![],
                cached: true,
            });
        }

        if node.flush_dest() {
            remove_all(&paths.dest)?;
        }
        let label = dest_segments.render();
        let (new_results, new_evaluated) = self.evaluate_group(
            cx,
            group,
            upstream,
            inputs_hash,
            Some(&paths),
            Some(&label),
            counter_msg,
            logger,
        )?;

        let terminal_result = new_results
            .iter()
            .rev()
            .find(|(id, _)| *id == task)
            .map(|(_, r)| r);
        match terminal_result {
            Some(TaskResult::Success { value, .. }) => {
                self.record_terminal(node, value, inputs_hash, &paths)?
            }
            Some(TaskResult::Failure {
                partial: Some((value, _)),
                ..
            }) => {
                // Partial values are persisted for inspection only. The
                // stored fingerprint is complemented so the record can never
                // satisfy a probe: a failed terminal re-runs next time.
                self.record_terminal(node, value, !inputs_hash, &paths)?
            }
            _ => remove_file(&paths.meta)?,
        }

        Ok(Evaluated {
            new_results,
            new_evaluated,
            cached: false,
        })
    }

    fn worker_cache_get(&self, segments: &quern_tasks::Segments, inputs_hash: i32) -> Option<Val> {
        let cache = match self.worker_cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache
            .get(segments)
            .filter(|(cached_hash, _)| *cached_hash == inputs_hash)
            .map(|(_, value)| value.clone())
    }

    /// Persists a terminal's value: workers go to the in-memory cache keyed
    /// by their declared segments, everything else with a format goes to
    /// `meta.json`.
    fn record_terminal(
        &self,
        node: &TaskNode,
        value: &Val,
        stored_inputs_hash: i32,
        paths: &EvalPaths,
    ) -> anyhow::Result<()> {
        if node.is_worker() {
            let segments = node
                .named()
                .map(|meta| meta.segments.clone())
                .unwrap_or_default();
            let mut cache = match self.worker_cache.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            cache.insert(segments, (stored_inputs_hash, value.clone()));
            return Ok(());
        }
        if let Some(json) = node.format().and_then(|f| (f.write)(value)) {
            let record = CachedRecord {
                value_hash: hash_json(&json),
                inputs_hash: stored_inputs_hash,
                value: json,
            };
            write_json_atomic(&paths.meta, &record)?;
        }
        Ok(())
    }

    /// Runs every not-yet-evaluated task of the group in order.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn evaluate_group(
        &self,
        cx: &GroupEvalCtx<'_>,
        group: &[TaskId],
        upstream: &HashMap<TaskId, TaskResult>,
        inputs_hash: i32,
        paths: Option<&EvalPaths>,
        label: Option<&str>,
        counter_msg: &str,
        base: &dyn Logger,
    ) -> anyhow::Result<(Vec<(TaskId, TaskResult)>, Vec<TaskId>)> {
        let colored = base.colored();
        let file_logger = paths.map(|p| FileLogger::new(colored, p.log.clone(), false, true));
        let multi_storage;
        let group_logger: &dyn Logger = match file_logger.as_ref() {
            Some(file) => {
                multi_storage = MultiLogger::new(colored, base, file);
                &multi_storage
            }
            None => base,
        };
        let prefix_storage;
        let scoped: &dyn Logger = match label {
            Some(label) => {
                group_logger.ticker(&format!("[{}] {}", counter_msg, label));
                prefix_storage =
                    PrefixLogger::new(group_logger, format!("[{}] {} ", counter_msg, label));
                &prefix_storage
            }
            None => group_logger,
        };

        let dest_slot = DestSlot::new(paths.map(|p| p.dest.clone()));
        let mut new_results: Vec<(TaskId, TaskResult)> = Vec::new();
        let mut new_evaluated: Vec<TaskId> = Vec::new();

        for &task in group {
            if upstream.contains_key(&task) {
                continue;
            }
            new_evaluated.push(task);
            let node = cx.tasks.node(task);

            let mut args = Vec::with_capacity(node.inputs().len());
            let mut inputs_successful = true;
            for input in node.inputs() {
                let result = new_results
                    .iter()
                    .rev()
                    .find(|(id, _)| id == input)
                    .map(|(_, r)| r)
                    .or_else(|| upstream.get(input));
                match result.and_then(|r| r.success_value()) {
                    Some(value) => args.push(value.clone()),
                    None => {
                        inputs_successful = false;
                        break;
                    }
                }
            }

            let result = if !inputs_successful {
                TaskResult::Skipped
            } else {
                let mut ctx = TaskContext::new(
                    args,
                    task,
                    &dest_slot,
                    scoped,
                    &self.home,
                    &self.env,
                    cx.problem_reporter,
                    cx.test_reporter,
                    cx.jobs,
                );
                match panic::catch_unwind(AssertUnwindSafe(|| node.run(&mut ctx))) {
                    Ok(Ok(value)) => {
                        let value_hash = self.value_hash(node, &value, inputs_hash);
                        TaskResult::Success { value, value_hash }
                    }
                    Ok(Err(TaskFail::Failure { msg, partial })) => TaskResult::Failure {
                        msg,
                        partial: partial.map(|value| {
                            let hash = self.value_hash(node, &value, inputs_hash);
                            (value, hash)
                        }),
                    },
                    Ok(Err(TaskFail::Error(error))) => TaskResult::Exception {
                        error: format!("{:#}", error),
                        stack: Backtrace::force_capture().to_string(),
                    },
                    Err(payload) => TaskResult::Exception {
                        error: panic_message(payload),
                        stack: Backtrace::force_capture().to_string(),
                    },
                }
            };
            new_results.push((task, result));
        }

        if !self.fail_fast {
            if let Some(label) = label {
                if new_results.iter().any(|(_, r)| r.is_failing()) {
                    group_logger.error(&format!("[{}] {} failed", counter_msg, label));
                }
            }
        }
        if let Some(file) = &file_logger {
            file.close();
        }
        Ok((new_results, new_evaluated))
    }

    /// Workers hash as their inputs fingerprint; everything else hashes its
    /// serialized value, falling back to the fingerprint when the task has
    /// no format.
    fn value_hash(&self, node: &TaskNode, value: &Val, inputs_hash: i32) -> i32 {
        if node.is_worker() {
            return inputs_hash;
        }
        node.format()
            .and_then(|f| (f.write)(value))
            .map(|json| hash_json(&json))
            .unwrap_or(inputs_hash)
    }
}

/// Lenient disk probe: any read, parse, or deserialization problem is a
/// miss, never an error. A corrupt meta file must not crash the build.
fn load_cached_json(node: &TaskNode, inputs_hash: i32, paths: &EvalPaths) -> Option<(Val, i32)> {
    let text = std::fs::read_to_string(&paths.meta).ok()?;
    let cached: CachedRecord = serde_json::from_str(&text).ok()?;
    if cached.inputs_hash != inputs_hash {
        return None;
    }
    let format = node.format()?;
    let value = (format.read)(&cached.value)?;
    Some((value, cached.value_hash))
}

fn remove_all(path: &std::path::Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn remove_file(path: &std::path::Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task body panicked".to_owned()
    }
}
