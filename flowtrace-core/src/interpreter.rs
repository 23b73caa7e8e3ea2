//! The interpreter contract consumed by the telemetry pipeline.
//!
//! The workflow interpreter itself lives outside this crate. This module
//! describes the slice of it the collector observes: logical threads and
//! their frame stacks, the commands those threads execute, and the
//! expression evaluator used for display names.
//!
//! ## Frames and threads
//!
//! ```text
//! ThreadId(0)                 ThreadId(1)  (forked by a parallel block)
//!   frame C  <- innermost       frame F
//!   frame B                       (inherits a snapshot of B's trace context)
//!   frame A  <- process root
//! ```
//!
//! [`ExecutionState::frames`] returns a thread's frames innermost first. The
//! collector never holds on to frames; it keys its own side-table by
//! [`FrameId`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a logical interpreter thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

/// Identifier of one activation record on a thread's call stack.
///
/// Frame ids are stable across suspend/resume because the interpreter
/// persists its frames together with the rest of the process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub Uuid);

impl FrameId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source location of a step in the flow definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub filename: Option<String>,
    pub line_num: i32,
    pub column: i32,
}

impl Location {
    pub fn new(filename: impl Into<String>, line_num: i32, column: i32) -> Self {
        Self {
            filename: Some(filename.into()),
            line_num,
            column,
        }
    }
}

/// Kind of a flow step, used to select which commands get traced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
    TaskCall,
    FlowCall,
    Expression,
    Script,
    If,
    Switch,
    SetVariables,
    Checkpoint,
    FormCall,
    Group,
    Parallel,
    Exit,
    Return,
    Other,
}

impl StepKind {
    pub const ALL: [StepKind; 14] = [
        StepKind::TaskCall,
        StepKind::FlowCall,
        StepKind::Expression,
        StepKind::Script,
        StepKind::If,
        StepKind::Switch,
        StepKind::SetVariables,
        StepKind::Checkpoint,
        StepKind::FormCall,
        StepKind::Group,
        StepKind::Parallel,
        StepKind::Exit,
        StepKind::Return,
        StepKind::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::TaskCall => "taskCall",
            StepKind::FlowCall => "flowCall",
            StepKind::Expression => "expression",
            StepKind::Script => "script",
            StepKind::If => "if",
            StepKind::Switch => "switch",
            StepKind::SetVariables => "setVariables",
            StepKind::Checkpoint => "checkpoint",
            StepKind::FormCall => "formCall",
            StepKind::Group => "group",
            StepKind::Parallel => "parallel",
            StepKind::Exit => "exit",
            StepKind::Return => "return",
            StepKind::Other => "other",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepKind::ALL
            .iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("Unknown step kind: '{s}'"))
    }
}

/// Step payload as defined in the flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    TaskCall { name: String },
    /// `flow_name` may be an expression template resolved at call time.
    FlowCall { flow_name: String },
    Expression { expr: String },
    Script { language_or_ref: String },
    If { expression: String },
    Switch { expression: String },
    SetVariables,
    Checkpoint { name: String },
    FormCall { name: String },
    Group,
    Parallel,
    Exit,
    Return,
    /// A step type this crate has no dedicated arm for.
    Other { type_name: String },
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::TaskCall { .. } => StepKind::TaskCall,
            Step::FlowCall { .. } => StepKind::FlowCall,
            Step::Expression { .. } => StepKind::Expression,
            Step::Script { .. } => StepKind::Script,
            Step::If { .. } => StepKind::If,
            Step::Switch { .. } => StepKind::Switch,
            Step::SetVariables => StepKind::SetVariables,
            Step::Checkpoint { .. } => StepKind::Checkpoint,
            Step::FormCall { .. } => StepKind::FormCall,
            Step::Group => StepKind::Group,
            Step::Parallel => StepKind::Parallel,
            Step::Exit => StepKind::Exit,
            Step::Return => StepKind::Return,
            Step::Other { .. } => StepKind::Other,
        }
    }
}

/// A command that executes one step of a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCommand {
    /// Assigned once per call site; shared by every loop iteration.
    pub correlation_id: Uuid,
    pub step: Step,
    pub location: Location,
    /// Optional `name:` expression attached to the step.
    pub segment_name: Option<String>,
}

impl StepCommand {
    pub fn new(correlation_id: Uuid, step: Step) -> Self {
        Self {
            correlation_id,
            step,
            location: Location::default(),
            segment_name: None,
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn with_segment_name(mut self, segment_name: impl Into<String>) -> Self {
        self.segment_name = Some(segment_name.into());
        self
    }

    pub fn is_flow_call(&self) -> bool {
        matches!(self.step, Step::FlowCall { .. })
    }
}

/// Commands observed by the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Executes a step.
    Step(StepCommand),
    /// Continues a task that was suspended; its step was opened before the
    /// suspension.
    TaskResume(StepCommand),
    /// Tears down the innermost frame of the thread.
    PopFrame,
    /// Interpreter-internal command with no step attached.
    Other(String),
}

impl Command {
    pub fn step_command(&self) -> Option<&StepCommand> {
        match self {
            Command::Step(cmd) | Command::TaskResume(cmd) => Some(cmd),
            Command::PopFrame | Command::Other(_) => None,
        }
    }
}

/// Hook verdict returned to the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
}

/// Read access to the interpreter state for one process instance.
pub trait ExecutionState {
    /// Frames of `thread`, innermost first. Empty if the thread is gone.
    fn frames(&self, thread: ThreadId) -> Vec<FrameId>;

    /// Current loop index visible from the thread's innermost frame.
    fn loop_index(&self, thread: ThreadId) -> Option<u32>;

    /// Name of the flow currently executing on `thread`.
    fn flow_name(&self, thread: ThreadId) -> Option<String>;

    /// Whether `thread` is carrying an unhandled error.
    fn has_thread_error(&self, thread: ThreadId) -> bool;

    /// Whether any logical thread is parked in the suspended state.
    fn has_suspended_threads(&self) -> bool;

    fn root_thread(&self) -> ThreadId;

    fn current_frame(&self, thread: ThreadId) -> Option<FrameId> {
        self.frames(thread).first().copied()
    }
}

/// Expression evaluation collaborator.
///
/// `Ok(None)` means the expression evaluated to null. Callers treat both
/// `Ok(None)` and `Err(_)` as "no override".
pub trait ExpressionEvaluator: Send + Sync {
    fn eval_string(
        &self,
        state: &dyn ExecutionState,
        thread: ThreadId,
        template: &str,
    ) -> anyhow::Result<Option<String>>;
}

/// Static facts about the observed process instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub instance_id: Uuid,
    /// The flow the process was started with.
    pub entry_point: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_kind_parsing() {
        assert_eq!("taskCall".parse::<StepKind>().unwrap(), StepKind::TaskCall);
        assert_eq!("FLOWCALL".parse::<StepKind>().unwrap(), StepKind::FlowCall);
        assert!("nope".parse::<StepKind>().is_err());
    }

    #[test]
    fn test_step_kind_serde_names_match_as_str() {
        for kind in StepKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_command_step_accessor() {
        let cmd = StepCommand::new(Uuid::new_v4(), Step::Return);
        assert!(Command::Step(cmd.clone()).step_command().is_some());
        assert!(Command::TaskResume(cmd).step_command().is_some());
        assert!(Command::PopFrame.step_command().is_none());
        assert!(Command::Other("jump".into()).step_command().is_none());
    }
}
