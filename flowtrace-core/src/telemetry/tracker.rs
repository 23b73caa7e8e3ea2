//! Frame-scoped parent/correlation tracking.
//!
//! A step command does not know its logical parent step; the interpreter's
//! frame stack does, but only implicitly. The tracker keeps an explicit
//! [`FrameTraceContext`] per frame in a side-table it owns:
//!
//! ```text
//! frame (flow call callee)
//!   ├── parent_step_id         StepId of the flow-call step
//!   ├── active_correlation_id  correlation id of the flow call
//!   └── flow_call_marker       this frame's own id
//! ```
//!
//! A new step's parent is the `parent_step_id` of the nearest frame on the
//! thread's stack that has one. A flow-call step is closed only when the frame
//! carrying a marker equal to its own id is popped, so the flow call's end
//! covers everything that ran inside it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;
use uuid::Uuid;

use super::step_id::StepId;
use crate::interpreter::FrameId;

/// Trace context attached to one interpreter frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameTraceContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_id: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_correlation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_call_marker: Option<FrameId>,
}

impl FrameTraceContext {
    /// Whether this context marks `frame` as a flow-call callee frame.
    pub fn is_flow_call_frame(&self, frame: FrameId) -> bool {
        self.flow_call_marker == Some(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedFrame {
    pub frame_id: FrameId,
    #[serde(flatten)]
    pub context: FrameTraceContext,
}

/// Serialized side-table, written next to the execution log on suspension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    #[serde(default)]
    pub frames: Vec<PersistedFrame>,
}

/// Side-table of frame trace contexts, keyed by frame id.
#[derive(Debug, Default)]
pub struct ParentTracker {
    frames: Mutex<HashMap<FrameId, FrameTraceContext>>,
}

impl ParentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FrameId, FrameTraceContext>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Combined lookup: the `parent_step_id` of the innermost frame in
    /// `frames` (innermost first) that defines one.
    pub fn parent_step_id(&self, frames: &[FrameId]) -> Option<StepId> {
        let table = self.lock();
        frames
            .iter()
            .find_map(|frame| table.get(frame).and_then(|ctx| ctx.parent_step_id))
    }

    /// Combined lookup of the active correlation id.
    pub fn active_correlation_id(&self, frames: &[FrameId]) -> Option<Uuid> {
        let table = self.lock();
        frames
            .iter()
            .find_map(|frame| table.get(frame).and_then(|ctx| ctx.active_correlation_id))
    }

    /// Stamp the callee frame of a flow call that just succeeded.
    pub fn bootstrap_flow_call(&self, callee_frame: FrameId, flow_call_step: StepId) {
        let context = FrameTraceContext {
            parent_step_id: Some(flow_call_step),
            active_correlation_id: Some(flow_call_step.correlation_id),
            flow_call_marker: Some(callee_frame),
        };
        self.lock().insert(callee_frame, context);
        trace!(frame = %callee_frame, step_id = %flow_call_step, "Flow call frame stamped");
    }

    /// Correlation id of the flow call whose callee is `frame`, if `frame`
    /// carries its own marker.
    pub fn flow_call_correlation(&self, frame: FrameId) -> Option<Uuid> {
        self.lock()
            .get(&frame)
            .filter(|ctx| ctx.is_flow_call_frame(frame))
            .and_then(|ctx| ctx.active_correlation_id)
    }

    /// Drop the entry of a frame that is being torn down.
    pub fn forget_frame(&self, frame: FrameId) -> Option<FrameTraceContext> {
        self.lock().remove(&frame)
    }

    /// Give a forked thread's root frame a frozen copy of the forking
    /// thread's effective context. The flow-call marker is never copied.
    pub fn fork(&self, forking_frames: &[FrameId], fork_frame: FrameId) {
        let mut table = self.lock();
        let lookup = |select: fn(&FrameTraceContext) -> bool| {
            forking_frames
                .iter()
                .filter_map(|frame| table.get(frame))
                .find(|ctx| select(ctx))
                .copied()
        };
        let parent_step_id = lookup(|ctx| ctx.parent_step_id.is_some()).and_then(|c| c.parent_step_id);
        let active_correlation_id =
            lookup(|ctx| ctx.active_correlation_id.is_some()).and_then(|c| c.active_correlation_id);

        if parent_step_id.is_none() && active_correlation_id.is_none() {
            return;
        }

        table.insert(
            fork_frame,
            FrameTraceContext {
                parent_step_id,
                active_correlation_id,
                flow_call_marker: None,
            },
        );
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn context(&self, frame: FrameId) -> Option<FrameTraceContext> {
        self.lock().get(&frame).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let mut frames: Vec<PersistedFrame> = self
            .lock()
            .iter()
            .map(|(frame_id, context)| PersistedFrame {
                frame_id: *frame_id,
                context: *context,
            })
            .collect();
        frames.sort_by_key(|frame| frame.frame_id.0);
        TrackerSnapshot { frames }
    }

    /// Replace the side-table with a previously taken snapshot.
    pub fn restore(&self, snapshot: TrackerSnapshot) {
        let mut table = self.lock();
        table.clear();
        table.extend(
            snapshot
                .frames
                .into_iter()
                .map(|frame| (frame.frame_id, frame.context)),
        );
    }
}
