//! Test helpers for integration tests
//!
//! `FakeVm` stands in for the workflow interpreter: logical threads with frame
//! stacks, loop indexes and error/suspension flags. `Harness` wires a
//! collector to it with an in-memory exporter and a manual clock, and offers
//! the command sequences the interpreter would emit.

#![allow(dead_code)]

use flowtrace_core::clock::ManualClock;
use flowtrace_core::interpreter::{
    Command, ExecutionState, ExpressionEvaluator, FrameId, Location, ProcessInfo, Step,
    StepCommand, ThreadId,
};
use flowtrace_core::telemetry::{
    InMemorySpanExporter, PersistenceService, SpanRecord, TelemetryCollector,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use uuid::Uuid;

/// Initialize logging for tests (only once per test run)
static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

pub const MAIN: ThreadId = ThreadId(0);

#[derive(Debug, Clone)]
struct Frame {
    id: FrameId,
    flow_name: String,
    loop_index: Option<u32>,
}

#[derive(Debug, Default)]
struct ThreadState {
    /// outermost first
    frames: Vec<Frame>,
    error: bool,
}

/// Interpreter stand-in shared by all logical threads of one process.
#[derive(Debug, Default)]
pub struct FakeVm {
    threads: Mutex<HashMap<ThreadId, ThreadState>>,
    suspended: AtomicBool,
}

impl FakeVm {
    /// A process with one thread and one root frame running `flow_name`.
    pub fn new(flow_name: &str) -> Self {
        let vm = Self::default();
        vm.spawn_thread(MAIN, flow_name);
        vm
    }

    pub fn spawn_thread(&self, thread: ThreadId, flow_name: &str) -> FrameId {
        let frame = Frame {
            id: FrameId::random(),
            flow_name: flow_name.to_string(),
            loop_index: None,
        };
        let id = frame.id;
        self.threads.lock().unwrap().insert(
            thread,
            ThreadState {
                frames: vec![frame],
                error: false,
            },
        );
        id
    }

    pub fn push_frame(&self, thread: ThreadId, flow_name: &str) -> FrameId {
        let frame = Frame {
            id: FrameId::random(),
            flow_name: flow_name.to_string(),
            loop_index: None,
        };
        let id = frame.id;
        self.threads
            .lock()
            .unwrap()
            .get_mut(&thread)
            .expect("unknown thread")
            .frames
            .push(frame);
        id
    }

    pub fn pop_frame(&self, thread: ThreadId) {
        self.threads
            .lock()
            .unwrap()
            .get_mut(&thread)
            .expect("unknown thread")
            .frames
            .pop();
    }

    /// Set the loop index on the innermost frame.
    pub fn set_loop_index(&self, thread: ThreadId, index: Option<u32>) {
        let mut threads = self.threads.lock().unwrap();
        let state = threads.get_mut(&thread).expect("unknown thread");
        state.frames.last_mut().expect("no frames").loop_index = index;
    }

    pub fn set_error(&self, thread: ThreadId, error: bool) {
        self.threads
            .lock()
            .unwrap()
            .get_mut(&thread)
            .expect("unknown thread")
            .error = error;
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }
}

impl ExecutionState for FakeVm {
    fn frames(&self, thread: ThreadId) -> Vec<FrameId> {
        self.threads
            .lock()
            .unwrap()
            .get(&thread)
            .map(|state| state.frames.iter().rev().map(|f| f.id).collect())
            .unwrap_or_default()
    }

    fn loop_index(&self, thread: ThreadId) -> Option<u32> {
        self.threads
            .lock()
            .unwrap()
            .get(&thread)
            .and_then(|state| state.frames.iter().rev().find_map(|f| f.loop_index))
    }

    fn flow_name(&self, thread: ThreadId) -> Option<String> {
        self.threads
            .lock()
            .unwrap()
            .get(&thread)
            .and_then(|state| state.frames.last())
            .map(|f| f.flow_name.clone())
    }

    fn has_thread_error(&self, thread: ThreadId) -> bool {
        self.threads
            .lock()
            .unwrap()
            .get(&thread)
            .map(|state| state.error)
            .unwrap_or(false)
    }

    fn has_suspended_threads(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn root_thread(&self) -> ThreadId {
        MAIN
    }
}

/// Resolves `${name}` from a variable map. `${fail}` is an evaluation
/// error; anything without `${` evaluates to itself.
#[derive(Debug, Default)]
pub struct MapEvaluator {
    pub variables: HashMap<String, String>,
}

impl MapEvaluator {
    pub fn with(pairs: &[(&str, &str)]) -> Self {
        Self {
            variables: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl ExpressionEvaluator for MapEvaluator {
    fn eval_string(
        &self,
        _state: &dyn ExecutionState,
        _thread: ThreadId,
        template: &str,
    ) -> anyhow::Result<Option<String>> {
        let Some(name) = template
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
        else {
            return Ok(Some(template.to_string()));
        };
        if name == "fail" {
            anyhow::bail!("evaluation failed");
        }
        Ok(self.variables.get(name).cloned())
    }
}

pub fn task(name: &str) -> Command {
    Command::Step(
        StepCommand::new(Uuid::new_v4(), Step::TaskCall { name: name.into() })
            .with_location(Location::new("concord.yml", 10, 5)),
    )
}

pub fn flow_call(flow_name: &str) -> Command {
    Command::Step(
        StepCommand::new(
            Uuid::new_v4(),
            Step::FlowCall {
                flow_name: flow_name.into(),
            },
        )
        .with_location(Location::new("concord.yml", 20, 5)),
    )
}

pub fn correlation_id(command: &Command) -> Uuid {
    command.step_command().expect("step command").correlation_id
}

/// Collector wired to a fake interpreter.
pub struct Harness {
    pub vm: Arc<FakeVm>,
    pub collector: TelemetryCollector,
    pub spans: Arc<InMemorySpanExporter>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(persistence: Arc<dyn PersistenceService>, instance_id: Uuid) -> Self {
        Self::with_config(
            serde_json::json!({"enabled": true}),
            persistence,
            instance_id,
        )
    }

    pub fn with_config(
        config: serde_json::Value,
        persistence: Arc<dyn PersistenceService>,
        instance_id: Uuid,
    ) -> Self {
        init_test_logging();

        let spans = Arc::new(InMemorySpanExporter::new());
        let clock = Arc::new(ManualClock::new(0));
        let collector = TelemetryCollector::from_variables(
            &config,
            ProcessInfo {
                instance_id,
                entry_point: "main".into(),
            },
            Arc::new(MapEvaluator::with(&[("flowToRun", "deploy")])),
            persistence,
        )
        .with_span_exporter(spans.clone())
        .with_clock(clock.clone());

        Self {
            vm: Arc::new(FakeVm::new("main")),
            collector,
            spans,
            clock,
        }
    }

    /// Continue on an existing interpreter, as a resumed process does.
    pub fn with_vm(mut self, vm: Arc<FakeVm>) -> Self {
        self.vm = vm;
        self
    }

    pub fn resume(&self) {
        self.collector.before_process_resume(self.vm.as_ref());
    }

    pub fn at(&self, millis: i64) -> &Self {
        self.clock.set(millis);
        self
    }

    pub fn start(&self) {
        self.collector.before_process_start(self.vm.as_ref());
    }

    pub fn before(&self, thread: ThreadId, command: &Command) {
        self.collector.before_command(self.vm.as_ref(), thread, command);
    }

    pub fn after(&self, thread: ThreadId, command: &Command) {
        self.collector.after_command(self.vm.as_ref(), thread, command);
    }

    pub fn fail(&self, thread: ThreadId, command: &Command) {
        self.collector
            .on_command_error(self.vm.as_ref(), thread, command, &"command failed");
    }

    /// Run a non-flow-call step to completion.
    pub fn run(&self, thread: ThreadId, command: &Command) {
        self.before(thread, command);
        self.after(thread, command);
    }

    /// Execute a flow call: the step opens, the callee frame is pushed and
    /// stamped. Returns the callee frame.
    pub fn call(&self, thread: ThreadId, command: &Command, flow_name: &str) -> FrameId {
        self.before(thread, command);
        let frame = self.vm.push_frame(thread, flow_name);
        self.after(thread, command);
        frame
    }

    /// Tear down the innermost frame of `thread`.
    pub fn pop(&self, thread: ThreadId) {
        self.collector
            .before_command(self.vm.as_ref(), thread, &Command::PopFrame);
        self.vm.pop_frame(thread);
    }

    pub fn fork(&self, parent: ThreadId, child: ThreadId) -> FrameId {
        let flow_name = self.vm.flow_name(parent).unwrap_or_default();
        let frame = self.vm.spawn_thread(child, &flow_name);
        self.collector.on_thread_fork(self.vm.as_ref(), parent, child);
        frame
    }

    pub fn end(&self) {
        self.collector.after_process_ends(self.vm.as_ref());
    }

    pub fn exported(&self) -> Vec<SpanRecord> {
        self.spans.spans()
    }
}

/// Find the exported span with `name`; panics if absent or ambiguous.
pub fn span<'a>(spans: &'a [SpanRecord], name: &str) -> &'a SpanRecord {
    let matching: Vec<&SpanRecord> = spans.iter().filter(|s| s.name == name).collect();
    assert_eq!(matching.len(), 1, "expected exactly one span named {name}");
    matching[0]
}

pub fn root(spans: &[SpanRecord]) -> &SpanRecord {
    spans.iter().find(|s| s.is_root()).expect("root span")
}
