#![allow(dead_code)]

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

use std::path::Path;

use quern_eval::{Evaluator, Results};
use quern_logger::DummyLogger;
use quern_tasks::{
    DummyProblemReporter, DummyTestReporter, NoDiscovery, Segments, TaskId, TaskSpec, Tasks, Val,
    ValueFormat,
};

/// Sequential evaluator rooted in a scratch directory.
pub fn sequential_evaluator(dir: &Path) -> Evaluator {
    Evaluator::new(dir.join("home"), dir.join("out")).with_thread_count(1)
}

pub fn parallel_evaluator(dir: &Path, threads: usize) -> Evaluator {
    Evaluator::new(dir.join("home"), dir.join("out")).with_thread_count(threads)
}

pub fn run(ev: &Evaluator, tasks: &Tasks, goals: &[TaskId]) -> Results {
    ev.evaluate(
        tasks,
        goals,
        &NoDiscovery,
        &DummyProblemReporter,
        &DummyTestReporter,
        &DummyLogger,
    )
    .expect("evaluation should not fail fatally")
}

/// A labelled i64-valued target computing from its i64 inputs.
pub fn int_target<F>(tasks: &mut Tasks, name: &str, inputs: Vec<TaskId>, side: i32, f: F) -> TaskId
where
    F: Fn(&[i64]) -> i64 + Send + Sync + 'static,
{
    tasks.add(
        TaskSpec::target(Segments::from_dotted(name), inputs, move |ctx| {
            let args: Vec<i64> = (0..ctx.arg_count()).map(|i| *ctx.arg::<i64>(i)).collect();
            Ok(Val::new(f(&args)))
        })
        .side_hash(side)
        .format(ValueFormat::of::<i64>()),
    )
}

/// An anonymous i64-valued task.
pub fn int_task<F>(tasks: &mut Tasks, inputs: Vec<TaskId>, side: i32, f: F) -> TaskId
where
    F: Fn(&[i64]) -> i64 + Send + Sync + 'static,
{
    tasks.add(
        TaskSpec::task(inputs, move |ctx| {
            let args: Vec<i64> = (0..ctx.arg_count()).map(|i| *ctx.arg::<i64>(i)).collect();
            Ok(Val::new(f(&args)))
        })
        .side_hash(side),
    )
}

pub fn goal_int(results: &Results, index: usize) -> i64 {
    *results.raw_values[index]
        .success_value()
        .expect("goal should have succeeded")
        .downcast_ref::<i64>()
        .expect("goal value should be an i64")
}

pub fn read_meta(out: &Path, label: &str) -> serde_json::Value {
    let mut path = out.to_path_buf();
    for part in label.split('.') {
        path.push(part);
    }
    let text = std::fs::read_to_string(path.join("meta.json")).expect("meta.json should exist");
    serde_json::from_str(&text).expect("meta.json should parse")
}

pub fn meta_path(out: &Path, label: &str) -> std::path::PathBuf {
    let mut path = out.to_path_buf();
    for part in label.split('.') {
        path.push(part);
    }
    path.join("meta.json")
}

pub fn read_profile(out: &Path) -> serde_json::Value {
    let text =
        std::fs::read_to_string(out.join("mill-profile.json")).expect("profile should exist");
    serde_json::from_str(&text).expect("profile should parse")
}
