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
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::DestError;

/// A task's produced value. Values are shared, immutable, and opaque to the
/// evaluator; bodies downcast the inputs they receive.
#[derive(Clone)]
pub struct Val(Arc<dyn Any + Send + Sync>);

impl Val {
    pub fn new<T: Any + Send + Sync>(value: T) -> Val {
        Val(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    /// Same underlying allocation. Worker results keep identity across runs
    /// when their inputs are unchanged.
    pub fn same_instance(&self, other: &Val) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Val(..)")
    }
}

/// JSON round-trip vtable for a task's value type.
///
/// Tasks without a format are never written to the on-disk cache and always
/// miss it on probe.
#[derive(Copy, Clone)]
pub struct ValueFormat {
    pub write: fn(&Val) -> Option<serde_json::Value>,
    pub read: fn(&serde_json::Value) -> Option<Val>,
}

impl ValueFormat {
    pub fn of<T>() -> ValueFormat
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        fn write_json<T: Serialize + Send + Sync + 'static>(
            value: &Val,
        ) -> Option<serde_json::Value> {
            value
                .downcast_ref::<T>()
                .and_then(|v| serde_json::to_value(v).ok())
        }

        fn read_json<T: DeserializeOwned + Send + Sync + 'static>(
            json: &serde_json::Value,
        ) -> Option<Val> {
            serde_json::from_value::<T>(json.clone()).ok().map(Val::new)
        }

        ValueFormat {
            write: write_json::<T>,
            read: read_json::<T>,
        }
    }
}

impl fmt::Debug for ValueFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueFormat(..)")
    }
}

/// Outcome of evaluating one task.
///
/// Everything except `Success` counts as failing. `Failure` may carry a
/// best-effort partial value; for labelled terminals that value is still
/// persisted so later runs can inspect it.
#[derive(Clone, Debug)]
pub enum TaskResult {
    Success {
        value: Val,
        value_hash: i32,
    },
    Failure {
        msg: String,
        partial: Option<(Val, i32)>,
    },
    /// An input was not successful.
    Skipped,
    /// Fail-fast cut this task off before it started.
    Aborted,
    /// The body panicked or returned an unexpected error.
    Exception {
        error: String,
        stack: String,
    },
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success { .. })
    }

    pub fn is_failing(&self) -> bool {
        !self.is_success()
    }

    pub fn success(&self) -> Option<(&Val, i32)> {
        match self {
            TaskResult::Success { value, value_hash } => Some((value, *value_hash)),
            _ => None,
        }
    }

    pub fn success_value(&self) -> Option<&Val> {
        self.success().map(|(v, _)| v)
    }

    pub fn success_hash(&self) -> Option<i32> {
        self.success().map(|(_, h)| h)
    }
}

/// How a task body reports failure.
///
/// `Failure` is a deliberate, message-carrying outcome; `Error` is anything
/// propagated with `?` and becomes a [`TaskResult::Exception`].
#[derive(Debug)]
pub enum TaskFail {
    Failure { msg: String, partial: Option<Val> },
    Error(anyhow::Error),
}

impl TaskFail {
    pub fn msg<S: Into<String>>(msg: S) -> TaskFail {
        TaskFail::Failure {
            msg: msg.into(),
            partial: None,
        }
    }

    pub fn partial<S: Into<String>>(msg: S, value: Val) -> TaskFail {
        TaskFail::Failure {
            msg: msg.into(),
            partial: Some(value),
        }
    }
}

impl From<anyhow::Error> for TaskFail {
    fn from(e: anyhow::Error) -> TaskFail {
        TaskFail::Error(e)
    }
}

impl From<DestError> for TaskFail {
    fn from(e: DestError) -> TaskFail {
        TaskFail::Error(e.into())
    }
}

impl From<std::io::Error> for TaskFail {
    fn from(e: std::io::Error) -> TaskFail {
        TaskFail::Error(e.into())
    }
}

/// What a task body returns.
pub type BodyResult = Result<Val, TaskFail>;
