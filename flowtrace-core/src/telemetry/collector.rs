//! Lifecycle-driven telemetry collection for one process instance.
//!
//! ```text
//! New ──start/resume──▶ Running ──suspended threads──▶ Suspended ──resume──▶ Running
//!                          ├──after_process_ends──▶ Finished
//!                          └──on_process_error────▶ Failed
//! Disabled: telemetry off, invalid config, or unreadable snapshot
//! ```
//!
//! Every hook is a no-op unless the collector is `Running`, so the terminal
//! export happens at most once. Internal failures are logged and never reach
//! the interpreter.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::exporter::{SpanExporter, TelemetryExporter};
use super::flow_steps::{FlowSteps, StepStart};
use super::naming;
use super::otlp::OtlpHttpExporter;
use super::persistence::{PersistenceService, FRAMES_FILENAME, STATE_FILENAME};
use super::span::TraceId;
use super::step_id::StepId;
use super::tracker::{ParentTracker, TrackerSnapshot};
use crate::clock::{system_clock, SharedClock};
use crate::config::TelemetryConfig;
use crate::error::{Result, TelemetryError};
use crate::interpreter::{
    Command, ExecutionState, ExpressionEvaluator, FrameId, ProcessInfo, Step, StepCommand,
    ThreadId, Verdict,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    New,
    Running,
    Suspended,
    Finished,
    Failed,
    Disabled,
}

struct Lifecycle {
    state: CollectorState,
    flow_steps: Option<Arc<FlowSteps>>,
}

/// Observes interpreter hooks and turns them into one exported trace.
pub struct TelemetryCollector {
    config: TelemetryConfig,
    process: ProcessInfo,
    evaluator: Arc<dyn ExpressionEvaluator>,
    persistence: Arc<dyn PersistenceService>,
    span_exporter: Option<Arc<dyn SpanExporter>>,
    clock: SharedClock,
    tracker: ParentTracker,
    /// Caller frame of each flow call between its start and end hooks.
    call_sites: Mutex<HashMap<(ThreadId, StepId), FrameId>>,
    lifecycle: Mutex<Lifecycle>,
    last_trace_id: Mutex<Option<TraceId>>,
}

impl TelemetryCollector {
    /// Spans go to the OTLP endpoint from `config` unless
    /// [`with_span_exporter`](Self::with_span_exporter) is used.
    pub fn new(
        config: TelemetryConfig,
        process: ProcessInfo,
        evaluator: Arc<dyn ExpressionEvaluator>,
        persistence: Arc<dyn PersistenceService>,
    ) -> Self {
        let state = if !config.enabled {
            debug!(instance_id = %process.instance_id, "Telemetry disabled by configuration");
            CollectorState::Disabled
        } else if let Err(e) = config.validate() {
            warn!(instance_id = %process.instance_id, error = %e, "Invalid telemetry configuration, telemetry disabled");
            CollectorState::Disabled
        } else {
            CollectorState::New
        };

        Self {
            config,
            process,
            evaluator,
            persistence,
            span_exporter: None,
            clock: system_clock(),
            tracker: ParentTracker::new(),
            call_sites: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle {
                state,
                flow_steps: None,
            }),
            last_trace_id: Mutex::new(None),
        }
    }

    /// Build from the interpreter's `opentelemetry` variables. A value that
    /// does not parse leaves the collector disabled.
    pub fn from_variables(
        variables: &serde_json::Value,
        process: ProcessInfo,
        evaluator: Arc<dyn ExpressionEvaluator>,
        persistence: Arc<dyn PersistenceService>,
    ) -> Self {
        let config = TelemetryConfig::from_value(variables).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read telemetry configuration, telemetry disabled");
            TelemetryConfig::default()
        });
        Self::new(config, process, evaluator, persistence)
    }

    pub fn with_span_exporter(mut self, exporter: Arc<dyn SpanExporter>) -> Self {
        self.span_exporter = Some(exporter);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn state(&self) -> CollectorState {
        self.lifecycle().state
    }

    /// The live execution log, while one is loaded.
    pub fn flow_steps(&self) -> Option<Arc<FlowSteps>> {
        self.lifecycle().flow_steps.clone()
    }

    pub fn tracker(&self) -> &ParentTracker {
        &self.tracker
    }

    /// Trace id of the last successful export.
    pub fn last_trace_id(&self) -> Option<TraceId> {
        *self
            .last_trace_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured trace link for the last exported trace.
    pub fn trace_link(&self) -> Option<String> {
        self.last_trace_id()
            .and_then(|trace_id| self.config.render_link(&trace_id.to_hex()))
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call_sites(&self) -> MutexGuard<'_, HashMap<(ThreadId, StepId), FrameId>> {
        self.call_sites.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running_log(&self) -> Option<Arc<FlowSteps>> {
        let lifecycle = self.lifecycle();
        match lifecycle.state {
            CollectorState::Running => lifecycle.flow_steps.clone(),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Process lifecycle
    // ------------------------------------------------------------------

    pub fn before_process_start(&self, state: &dyn ExecutionState) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != CollectorState::New {
            debug!(state = ?lifecycle.state, "before_process_start ignored");
            return;
        }

        let flow_name = self.resolve_entry_point(state);
        info!(instance_id = %self.process.instance_id, flow_name = %flow_name, "Collecting process telemetry");

        lifecycle.flow_steps = Some(Arc::new(FlowSteps::with_clock(
            self.process.instance_id,
            flow_name,
            self.clock.clone(),
        )));
        lifecycle.state = CollectorState::Running;
    }

    pub fn before_process_resume(&self, _state: &dyn ExecutionState) {
        let mut lifecycle = self.lifecycle();
        if !matches!(lifecycle.state, CollectorState::New | CollectorState::Suspended) {
            debug!(state = ?lifecycle.state, "before_process_resume ignored");
            return;
        }

        match self.load_snapshot() {
            Ok(flow_steps) => {
                info!(
                    instance_id = %self.process.instance_id,
                    steps = flow_steps.len(),
                    "Resumed process telemetry"
                );
                lifecycle.flow_steps = Some(Arc::new(flow_steps));
                lifecycle.state = CollectorState::Running;
            }
            Err(e) => {
                warn!(instance_id = %self.process.instance_id, error = %e, "Failed to load telemetry state, telemetry disabled for this run");
                lifecycle.flow_steps = None;
                lifecycle.state = CollectorState::Disabled;
            }
        }
    }

    pub fn after_process_ends(&self, state: &dyn ExecutionState) {
        if state.has_suspended_threads() {
            self.suspend();
        } else {
            self.finish(true);
        }
    }

    pub fn on_process_error(&self, error: &dyn Display) {
        debug!(error = %error, "Process failed");
        self.finish(false);
    }

    /// Give a forked thread a snapshot of its parent's trace context.
    pub fn on_thread_fork(&self, state: &dyn ExecutionState, parent: ThreadId, child: ThreadId) {
        if self.running_log().is_none() {
            return;
        }
        let Some(fork_root) = state.frames(child).last().copied() else {
            warn!(parent = %parent, child = %child, "Forked thread has no frames");
            return;
        };
        self.tracker.fork(&state.frames(parent), fork_root);
    }

    // ------------------------------------------------------------------
    // Command hooks
    // ------------------------------------------------------------------

    pub fn before_command(&self, state: &dyn ExecutionState, thread: ThreadId, command: &Command) -> Verdict {
        let Some(flow_steps) = self.running_log() else {
            return Verdict::Continue;
        };

        match command {
            Command::PopFrame => self.on_frame_pop(&flow_steps, state, thread),
            // opened before the suspension
            Command::TaskResume(_) => {}
            Command::Step(cmd) => {
                if self.config.traces(cmd.step.kind()) {
                    self.start_step(&flow_steps, state, thread, cmd);
                }
            }
            Command::Other(_) => {}
        }

        Verdict::Continue
    }

    pub fn after_command(&self, state: &dyn ExecutionState, thread: ThreadId, command: &Command) -> Verdict {
        self.end_command(state, thread, command, true);
        Verdict::Continue
    }

    pub fn on_command_error(
        &self,
        state: &dyn ExecutionState,
        thread: ThreadId,
        command: &Command,
        error: &dyn Display,
    ) -> Verdict {
        debug!(thread = %thread, error = %error, "Command failed");
        self.end_command(state, thread, command, false);
        Verdict::Continue
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn start_step(&self, flow_steps: &FlowSteps, state: &dyn ExecutionState, thread: ThreadId, cmd: &StepCommand) {
        let step_id = StepId::new(cmd.correlation_id, state.loop_index(thread));
        let parent_id = self.tracker.parent_step_id(&state.frames(thread));
        let name = naming::step_name(self.evaluator.as_ref(), state, thread, cmd);

        debug!(thread = %thread, step_id = %step_id, name = %name, "Step started");

        if cmd.is_flow_call() {
            if let Some(caller) = state.current_frame(thread) {
                self.call_sites().insert((thread, step_id), caller);
            }
        }

        let (task_name, called_flow) = match &cmd.step {
            Step::TaskCall { name } => (Some(name.clone()), None),
            Step::FlowCall { flow_name } => (None, Some(flow_name.clone())),
            _ => (None, None),
        };
        flow_steps.start_step(
            step_id,
            StepStart {
                name,
                parent_id,
                filename: cmd.location.filename.clone(),
                line_num: cmd.location.line_num,
                column: cmd.location.column,
                flow_name: state.flow_name(thread),
                task_name,
                called_flow,
            },
        );
    }

    fn end_command(&self, state: &dyn ExecutionState, thread: ThreadId, command: &Command, success: bool) {
        let Some(flow_steps) = self.running_log() else {
            return;
        };
        let Some(cmd) = command.step_command() else {
            return;
        };
        if !self.config.traces(cmd.step.kind()) {
            return;
        }

        let step_id = StepId::new(cmd.correlation_id, state.loop_index(thread));

        // with a callee frame pushed, the flow call stays open until that frame pops
        if matches!(command, Command::Step(c) if c.is_flow_call()) {
            let caller = self.call_sites().remove(&(thread, step_id));
            match state.current_frame(thread) {
                Some(frame) if caller != Some(frame) => {
                    self.tracker.bootstrap_flow_call(frame, step_id);
                    return;
                }
                _ => debug!(thread = %thread, step_id = %step_id, success, "Flow call pushed no callee frame"),
            }
        }

        if !flow_steps.on_step_end(step_id, success) {
            warn!(thread = %thread, step_id = %step_id, "Step end without a recorded start");
        }
    }

    fn on_frame_pop(&self, flow_steps: &FlowSteps, state: &dyn ExecutionState, thread: ThreadId) {
        let Some(frame) = state.current_frame(thread) else {
            return;
        };

        if let Some(correlation_id) = self.tracker.flow_call_correlation(frame) {
            let step_id = StepId::new(correlation_id, state.loop_index(thread));
            let success = !state.has_thread_error(thread);
            if flow_steps.on_step_end(step_id, success) {
                debug!(thread = %thread, step_id = %step_id, success, "Flow call ended");
            } else {
                warn!(thread = %thread, step_id = %step_id, "Flow call frame popped without a recorded start");
            }
        }

        self.tracker.forget_frame(frame);
    }

    fn resolve_entry_point(&self, state: &dyn ExecutionState) -> String {
        let Some(variable) = &self.config.entry_point_variable_name else {
            return self.process.entry_point.clone();
        };

        let template = format!("${{{variable}}}");
        match self.evaluator.eval_string(state, state.root_thread(), &template) {
            Ok(Some(name)) => name,
            Ok(None) => {
                warn!(variable = %variable, entry_point = %self.process.entry_point, "Entry point variable is empty, using process entry point");
                self.process.entry_point.clone()
            }
            Err(e) => {
                warn!(variable = %variable, entry_point = %self.process.entry_point, error = %e, "Can't evaluate entry point variable, using process entry point");
                self.process.entry_point.clone()
            }
        }
    }

    fn suspend(&self) {
        let flow_steps = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != CollectorState::Running {
                return;
            }
            lifecycle.state = CollectorState::Suspended;
            lifecycle.flow_steps.take()
        };
        let Some(flow_steps) = flow_steps else {
            return;
        };

        match self.persist_snapshot(&flow_steps) {
            Ok(()) => info!(
                instance_id = %self.process.instance_id,
                steps = flow_steps.len(),
                open = flow_steps.open_steps().len(),
                "Process suspended, telemetry state persisted"
            ),
            Err(e) => error!(instance_id = %self.process.instance_id, error = %e, "Failed to persist telemetry state"),
        }
    }

    fn finish(&self, is_process_finished_ok: bool) {
        let flow_steps = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != CollectorState::Running {
                return;
            }
            lifecycle.state = if is_process_finished_ok {
                CollectorState::Finished
            } else {
                CollectorState::Failed
            };
            lifecycle.flow_steps.take()
        };
        let Some(flow_steps) = flow_steps else {
            return;
        };

        let start = Instant::now();
        info!("Sending telemetry for process");

        match self.export(&flow_steps, is_process_finished_ok) {
            Ok(trace_id) => {
                info!(
                    "Sending telemetry for process -> done in {} ms",
                    start.elapsed().as_millis()
                );
                *self
                    .last_trace_id
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(trace_id);
                if let Some(link) = self.config.render_link(&trace_id.to_hex()) {
                    info!("Opentelemetry traces link: {}", link);
                }
            }
            Err(e) => error!(instance_id = %self.process.instance_id, error = %e, "Failed to export telemetry"),
        }

        self.tracker.clear();
        self.call_sites().clear();
        for name in [STATE_FILENAME, FRAMES_FILENAME] {
            if let Err(e) = self.persistence.remove_persisted_file(name) {
                warn!(file = name, error = %e, "Failed to remove persisted telemetry state");
            }
        }
    }

    fn export(&self, flow_steps: &FlowSteps, is_process_finished_ok: bool) -> Result<TraceId> {
        let span_exporter: Arc<dyn SpanExporter> = match &self.span_exporter {
            Some(exporter) => exporter.clone(),
            None => Arc::new(OtlpHttpExporter::from_config(&self.config)?),
        };
        TelemetryExporter::new(span_exporter, &self.config, self.clock.clone())
            .export(flow_steps, is_process_finished_ok)
    }

    fn persist_snapshot(&self, flow_steps: &FlowSteps) -> Result<()> {
        self.persistence
            .persist_file(STATE_FILENAME, &flow_steps.to_json()?)?;
        let frames = serde_json::to_vec(&self.tracker.snapshot())?;
        self.persistence.persist_file(FRAMES_FILENAME, &frames)
    }

    fn load_snapshot(&self) -> Result<FlowSteps> {
        let bytes = self
            .persistence
            .load_persisted_file(STATE_FILENAME)?
            .ok_or_else(|| TelemetryError::Persistence(format!("{STATE_FILENAME} not found")))?;
        let flow_steps = FlowSteps::from_json(&bytes, self.clock.clone())?;

        // without frames the log still resumes; open flow calls then close at export
        match self.load_frames() {
            Ok(snapshot) => self.tracker.restore(snapshot),
            Err(e) => warn!(error = %e, "Failed to load frame trace context"),
        }

        Ok(flow_steps)
    }

    fn load_frames(&self) -> Result<TrackerSnapshot> {
        match self.persistence.load_persisted_file(FRAMES_FILENAME)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(TrackerSnapshot::default()),
        }
    }
}

impl std::fmt::Debug for TelemetryCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryCollector")
            .field("instance_id", &self.process.instance_id)
            .field("state", &self.state())
            .finish()
    }
}
