//! The task model for the build core.
//!
//! Tasks live in an arena ([`Tasks`]) and refer to each other by stable
//! [`TaskId`] indices, which keeps the DAG free of ownership cycles and
//! makes graph algorithms cheap. A task is immutable once added: a list of
//! input ids, a side hash folded into its group's fingerprint, an optional
//! named identity ([`NamedMeta`]), an optional JSON [`ValueFormat`], and a
//! body closure run by the evaluator.

use std::fmt;

mod context;
mod discovery;
mod result;
mod segments;

pub use context::{DestError, DestSlot, FirstUse, TaskContext};
pub use discovery::{
    Discovery, DummyProblemReporter, DummyTestReporter, NoDiscovery, ProblemReporter, TestReporter,
};
pub use result::{BodyResult, TaskFail, TaskResult, Val, ValueFormat};
pub use segments::{Segment, Segments};

/// Stable index of a task in its arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u32);

impl TaskId {
    pub fn from_index(index: usize) -> TaskId {
        TaskId(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A task body. Receives the context, returns the produced value or how it
/// failed.
pub type TaskBody = Box<dyn for<'a> Fn(&mut TaskContext<'a>) -> BodyResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedKind {
    Target,
    Command,
    /// A long-lived in-memory singleton, cached by identity on its inputs
    /// fingerprint rather than by value.
    Worker,
}

/// The user-visible identity of a named task.
#[derive(Debug, Clone)]
pub struct NamedMeta {
    pub segments: Segments,
    pub kind: NamedKind,
    pub overrides: u32,
    /// Outputs route to the external workspace root.
    pub external: bool,
    /// Prefix for cross-module references.
    pub foreign: Option<Segments>,
    /// Declaration path, used to disambiguate override collisions.
    pub enclosing: String,
}

pub struct TaskNode {
    inputs: Vec<TaskId>,
    side_hash: i32,
    flush_dest: bool,
    named: Option<NamedMeta>,
    format: Option<ValueFormat>,
    body: TaskBody,
}

impl TaskNode {
    pub fn inputs(&self) -> &[TaskId] {
        &self.inputs
    }

    pub fn side_hash(&self) -> i32 {
        self.side_hash
    }

    pub fn flush_dest(&self) -> bool {
        self.flush_dest
    }

    pub fn named(&self) -> Option<&NamedMeta> {
        self.named.as_ref()
    }

    pub fn format(&self) -> Option<&ValueFormat> {
        self.format.as_ref()
    }

    pub fn is_worker(&self) -> bool {
        matches!(
            self.named,
            Some(NamedMeta {
                kind: NamedKind::Worker,
                ..
            })
        )
    }

    pub fn run(&self, ctx: &mut TaskContext<'_>) -> BodyResult {
        (self.body)(ctx)
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("inputs", &self.inputs)
            .field("side_hash", &self.side_hash)
            .field("named", &self.named)
            .finish()
    }
}

/// Arena of immutable tasks.
#[derive(Debug, Default)]
pub struct Tasks {
    nodes: Vec<TaskNode>,
}

impl Tasks {
    pub fn new() -> Tasks {
        Tasks::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add(&mut self, spec: TaskSpec) -> TaskId {
        let id = TaskId::from_index(self.nodes.len());
        self.nodes.push(TaskNode {
            inputs: spec.inputs,
            side_hash: spec.side_hash,
            flush_dest: spec.flush_dest,
            named: spec.named,
            format: spec.format,
            body: spec.body,
        });
        id
    }

    pub fn node(&self, id: TaskId) -> &TaskNode {
        &self.nodes[id.index()]
    }

    pub fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        (0..self.nodes.len()).map(TaskId::from_index)
    }
}

impl quern_graph::DependencyGraph for Tasks {
    type Node = TaskId;

    fn inputs(&self, node: TaskId) -> &[TaskId] {
        self.node(node).inputs()
    }
}

/// Builder for one task.
pub struct TaskSpec {
    inputs: Vec<TaskId>,
    side_hash: i32,
    flush_dest: bool,
    named: Option<NamedMeta>,
    format: Option<ValueFormat>,
    body: TaskBody,
}

impl TaskSpec {
    /// An anonymous intermediate task.
    pub fn task<F>(inputs: Vec<TaskId>, body: F) -> TaskSpec
    where
        F: for<'a> Fn(&mut TaskContext<'a>) -> BodyResult + Send + Sync + 'static,
    {
        TaskSpec {
            inputs,
            side_hash: 0,
            flush_dest: false,
            named: None,
            format: None,
            body: Box::new(body),
        }
    }

    fn named<F>(segments: Segments, kind: NamedKind, inputs: Vec<TaskId>, body: F) -> TaskSpec
    where
        F: for<'a> Fn(&mut TaskContext<'a>) -> BodyResult + Send + Sync + 'static,
    {
        let mut spec = TaskSpec::task(inputs, body);
        spec.named = Some(NamedMeta {
            segments,
            kind,
            overrides: 0,
            external: false,
            foreign: None,
            enclosing: String::new(),
        });
        spec
    }

    pub fn target<F>(segments: Segments, inputs: Vec<TaskId>, body: F) -> TaskSpec
    where
        F: for<'a> Fn(&mut TaskContext<'a>) -> BodyResult + Send + Sync + 'static,
    {
        TaskSpec::named(segments, NamedKind::Target, inputs, body)
    }

    pub fn command<F>(segments: Segments, inputs: Vec<TaskId>, body: F) -> TaskSpec
    where
        F: for<'a> Fn(&mut TaskContext<'a>) -> BodyResult + Send + Sync + 'static,
    {
        TaskSpec::named(segments, NamedKind::Command, inputs, body)
    }

    pub fn worker<F>(segments: Segments, inputs: Vec<TaskId>, body: F) -> TaskSpec
    where
        F: for<'a> Fn(&mut TaskContext<'a>) -> BodyResult + Send + Sync + 'static,
    {
        TaskSpec::named(segments, NamedKind::Worker, inputs, body)
    }

    pub fn side_hash(mut self, hash: i32) -> TaskSpec {
        self.side_hash = hash;
        self
    }

    pub fn flush_dest(mut self) -> TaskSpec {
        self.flush_dest = true;
        self
    }

    pub fn format(mut self, format: ValueFormat) -> TaskSpec {
        self.format = Some(format);
        self
    }

    pub fn overrides(mut self, count: u32) -> TaskSpec {
        if let Some(named) = self.named.as_mut() {
            named.overrides = count;
        }
        self
    }

    pub fn external(mut self) -> TaskSpec {
        if let Some(named) = self.named.as_mut() {
            named.external = true;
        }
        self
    }

    pub fn foreign(mut self, segments: Segments) -> TaskSpec {
        if let Some(named) = self.named.as_mut() {
            named.foreign = Some(segments);
        }
        self
    }

    pub fn enclosing(mut self, path: &str) -> TaskSpec {
        if let Some(named) = self.named.as_mut() {
            named.enclosing = path.to_owned();
        }
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn arena_assigns_sequential_ids() {
        let mut tasks = Tasks::new();
        let a = tasks.add(TaskSpec::task(vec![], |_ctx| Ok(Val::new(1i64))).side_hash(5));
        let b = tasks.add(TaskSpec::target(
            Segments::labels(vec!["app", "compile"]),
            vec![a],
            |_ctx| Ok(Val::new(2i64)),
        ));
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(tasks.node(b).inputs(), &[a][..]);
        assert_eq!(tasks.node(a).side_hash(), 5);
        assert_eq!(format!("{}", b), "#1");
    }

    #[test]
    fn named_builders_set_kind() {
        let mut tasks = Tasks::new();
        let worker = tasks.add(TaskSpec::worker(
            Segments::labels(vec!["compilerWorker"]),
            vec![],
            |_ctx| Ok(Val::new(())),
        ));
        let command = tasks.add(
            TaskSpec::command(Segments::labels(vec!["app", "run"]), vec![], |_ctx| {
                Ok(Val::new(()))
            })
            .overrides(2)
            .enclosing("build.app"),
        );
        assert!(tasks.node(worker).is_worker());
        let meta = tasks.node(command).named().unwrap();
        assert_eq!(meta.kind, NamedKind::Command);
        assert_eq!(meta.overrides, 2);
        assert_eq!(meta.enclosing, "build.app");
    }

    #[test]
    fn anonymous_modifiers_are_inert_on_named_fields() {
        let mut tasks = Tasks::new();
        let plain = tasks.add(
            TaskSpec::task(vec![], |_ctx| Ok(Val::new(0i64)))
                .overrides(3)
                .external(),
        );
        assert!(tasks.node(plain).named().is_none());
    }
}
