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

use std::time::Instant;

use quern_graph::MultiBiMap;
use quern_logger::Logger;
use quern_tasks::{TaskId, TaskResult};

use crate::group::GroupEvalCtx;
use crate::{DriverState, EvalError, Evaluator, Terminal};

/// One group at a time, in planner order. Once a task has failed under
/// fail-fast, every remaining group is marked aborted without running.
pub(crate) fn evaluate_sequential(
    ev: &Evaluator,
    cx: &GroupEvalCtx<'_>,
    sorted_groups: &MultiBiMap<Terminal, TaskId>,
    logger: &dyn Logger,
) -> Result<DriverState, EvalError> {
    let mut state = DriverState::default();
    let mut some_task_failed = false;
    let total = sorted_groups.key_count();

    for (i, (terminal, group)) in sorted_groups.items().enumerate() {
        if ev.fail_fast && some_task_failed {
            for &task in group {
                state.results.entry(task).or_insert(TaskResult::Aborted);
            }
            continue;
        }

        let counter_msg = format!("{}/{}", i + 1, total);
        let start = Instant::now();
        let evaluated = ev
            .evaluate_group_cached(cx, terminal, group, &state.results, &counter_msg, logger)
            .map_err(|e| EvalError::Internal(format!("{:#}", e)))?;
        let elapsed = start.elapsed().as_millis() as u64;

        if evaluated.new_results.iter().any(|(_, r)| r.is_failing()) {
            some_task_failed = true;
        }
        state.evaluated.extend(evaluated.new_evaluated.iter().copied());
        for (task, result) in evaluated.new_results {
            state.results.insert(task, result);
        }
        state.timings.push((terminal.clone(), elapsed, evaluated.cached));
    }

    Ok(state)
}
