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

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use quern_logger::Logger;

use crate::discovery::{ProblemReporter, TestReporter};
use crate::result::Val;
use crate::TaskId;

/// First acquisition of a group's `dest`, with the stack captured at the
/// call site. Surfaced as the source of [`DestError::AlreadyUsed`].
#[derive(Error, Debug, Clone)]
#[error("`dest` was first acquired by task {task} at:\n{stack}")]
pub struct FirstUse {
    pub task: TaskId,
    pub stack: String,
}

#[derive(Error, Debug)]
pub enum DestError {
    #[error("`dest` can only be used by one task per group invocation")]
    AlreadyUsed(#[source] FirstUse),
    #[error("no `dest` folder available here")]
    Unavailable,
    #[error("could not create `dest` folder")]
    Io(#[from] std::io::Error),
}

/// Per-group-invocation guard for the scratch working directory.
///
/// The directory is created on first acquisition and handed back on repeat
/// calls from the same task; a call from any other task is an error carrying
/// the first caller's stack.
#[derive(Debug)]
pub struct DestSlot {
    dest: Option<PathBuf>,
    used: Mutex<Option<FirstUse>>,
}

impl DestSlot {
    pub fn new(dest: Option<PathBuf>) -> DestSlot {
        DestSlot {
            dest,
            used: Mutex::new(None),
        }
    }

    pub fn acquire(&self, task: TaskId) -> Result<PathBuf, DestError> {
        let dest = self.dest.as_ref().ok_or(DestError::Unavailable)?;
        let mut used = match self.used.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &*used {
            Some(first) if first.task != task => Err(DestError::AlreadyUsed(first.clone())),
            Some(_) => Ok(dest.clone()),
            None => {
                std::fs::create_dir_all(dest)?;
                *used = Some(FirstUse {
                    task,
                    stack: Backtrace::force_capture().to_string(),
                });
                Ok(dest.clone())
            }
        }
    }
}

/// Everything a task body gets to see.
pub struct TaskContext<'a> {
    args: Vec<Val>,
    task: TaskId,
    dest: &'a DestSlot,
    pub log: &'a dyn Logger,
    pub home: &'a Path,
    pub env: &'a HashMap<String, String>,
    pub problem_reporter: &'a dyn ProblemReporter,
    pub test_reporter: &'a dyn TestReporter,
    /// Worker-count hint; bodies may spawn their own parallelism up to this.
    pub jobs: usize,
}

impl<'a> TaskContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        args: Vec<Val>,
        task: TaskId,
        dest: &'a DestSlot,
        log: &'a dyn Logger,
        home: &'a Path,
        env: &'a HashMap<String, String>,
        problem_reporter: &'a dyn ProblemReporter,
        test_reporter: &'a dyn TestReporter,
        jobs: usize,
    ) -> TaskContext<'a> {
        TaskContext {
            args,
            task,
            dest,
            log,
            home,
            env,
            problem_reporter,
            test_reporter,
            jobs,
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn raw_arg(&self, index: usize) -> &Val {
        &self.args[index]
    }

    /// Input value `index`, downcast. Panics on a type mismatch, which the
    /// evaluator converts into an `Exception` result for this task.
    pub fn arg<T: Any>(&self, index: usize) -> &T {
        match self.args[index].downcast_ref::<T>() {
            Some(v) => v,
            None => panic!(
                "input {} of task {} has an unexpected type",
                index, self.task
            ),
        }
    }

    /// The scratch directory for this task. At most one task per group
    /// invocation may acquire it.
    pub fn dest(&self) -> Result<PathBuf, DestError> {
        self.dest.acquire(self.task)
    }

    pub fn out_stream(&self) -> impl Write + 'a {
        quern_logger::out_stream(self.log)
    }

    pub fn err_stream(&self) -> impl Write + 'a {
        quern_logger::err_stream(self.log)
    }

    pub fn in_stream(&self) -> impl Read + 'a {
        quern_logger::in_stream(self.log)
    }
}
