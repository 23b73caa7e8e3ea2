//! Execution log of one process instance.
//!
//! `FlowSteps` is an append/mutate store of [`StepInfo`] records. Records are
//! appended in start order and replaced exactly once when the step ends.
//! Lookups go through a `StepId -> position` index so ending a step is O(1).
//!
//! The log is shared by every logical thread of the process, so the record
//! sequence and the index sit behind one mutex. Nothing inside the critical
//! sections does I/O; serialization works on a cloned snapshot
//! ([`PersistedFlowSteps`]).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};
use uuid::Uuid;

use super::step_id::StepId;
use crate::clock::{system_clock, SharedClock};
use crate::error::Result;

/// One recorded step execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInfo {
    pub id: StepId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<StepId>,
    /// Epoch milliseconds
    pub started_at: i64,
    /// Epoch milliseconds, `None` while the step is running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub line_num: i32,
    #[serde(default)]
    pub column: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_name: Option<String>,
    /// Task invoked by a task call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    /// Flow invoked by a flow call, as written in the flow definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub called_flow: Option<String>,
    /// Only meaningful once `ended_at` is set
    #[serde(default)]
    pub success: bool,
}

impl StepInfo {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Copy of this record carrying the end transition.
    ///
    /// `ended_at` never precedes `started_at`.
    pub fn ended(&self, ended_at: i64, success: bool) -> StepInfo {
        StepInfo {
            ended_at: Some(ended_at.max(self.started_at)),
            success,
            ..self.clone()
        }
    }

    pub fn duration_millis(&self) -> Option<i64> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

/// Everything known about a step when it starts.
#[derive(Debug, Clone, Default)]
pub struct StepStart {
    pub name: String,
    pub parent_id: Option<StepId>,
    pub filename: Option<String>,
    pub line_num: i32,
    pub column: i32,
    pub flow_name: Option<String>,
    pub task_name: Option<String>,
    pub called_flow: Option<String>,
}

/// Serialized form of [`FlowSteps`], written on suspension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedFlowSteps {
    pub instance_id: Uuid,
    pub flow_name: String,
    pub started_at: i64,
    #[serde(default)]
    pub steps: Vec<StepInfo>,
}

#[derive(Debug, Default)]
struct StepLog {
    steps: Vec<StepInfo>,
    index: HashMap<StepId, usize>,
}

impl StepLog {
    fn from_steps(steps: Vec<StepInfo>) -> Self {
        // later duplicates win, matching the repointing done by `on_step_start`
        let index = steps
            .iter()
            .enumerate()
            .map(|(position, step)| (step.id, position))
            .collect();
        Self { steps, index }
    }
}

/// Thread-safe execution log for one process instance.
pub struct FlowSteps {
    instance_id: Uuid,
    flow_name: String,
    started_at: i64,
    log: Mutex<StepLog>,
    clock: SharedClock,
}

impl FlowSteps {
    /// Fresh log for a process starting now.
    pub fn new(instance_id: Uuid, flow_name: impl Into<String>) -> Self {
        Self::with_clock(instance_id, flow_name, system_clock())
    }

    pub fn with_clock(instance_id: Uuid, flow_name: impl Into<String>, clock: SharedClock) -> Self {
        let started_at = clock.now_millis();
        Self {
            instance_id,
            flow_name: flow_name.into(),
            started_at,
            log: Mutex::new(StepLog::default()),
            clock,
        }
    }

    /// Rebuild a log from its persisted form, including the index.
    pub fn from_persisted(persisted: PersistedFlowSteps, clock: SharedClock) -> Self {
        Self {
            instance_id: persisted.instance_id,
            flow_name: persisted.flow_name,
            started_at: persisted.started_at,
            log: Mutex::new(StepLog::from_steps(persisted.steps)),
            clock,
        }
    }

    pub fn to_persisted(&self) -> PersistedFlowSteps {
        PersistedFlowSteps {
            instance_id: self.instance_id,
            flow_name: self.flow_name.clone(),
            started_at: self.started_at,
            steps: self.steps(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_persisted())?)
    }

    pub fn from_json(bytes: &[u8], clock: SharedClock) -> Result<Self> {
        let persisted: PersistedFlowSteps = serde_json::from_slice(bytes)?;
        Ok(Self::from_persisted(persisted, clock))
    }

    fn lock(&self) -> MutexGuard<'_, StepLog> {
        // a panicking hook must not take telemetry down for other threads
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the start of a step from its name and location.
    pub fn on_step_start(
        &self,
        id: StepId,
        name: impl Into<String>,
        parent_id: Option<StepId>,
        filename: Option<String>,
        line_num: i32,
        flow_name: Option<String>,
    ) {
        self.start_step(
            id,
            StepStart {
                name: name.into(),
                parent_id,
                filename,
                line_num,
                flow_name,
                ..Default::default()
            },
        );
    }

    /// Record the start of a step.
    ///
    /// Starting an id that is already present appends an independent record
    /// and repoints the index to it. If the earlier record is still open it
    /// is closed as failed first.
    pub fn start_step(&self, id: StepId, start: StepStart) {
        let now = self.clock.now_millis();
        let step = StepInfo {
            id,
            name: start.name,
            parent_id: start.parent_id,
            started_at: now,
            ended_at: None,
            filename: start.filename,
            line_num: start.line_num,
            column: start.column,
            flow_name: start.flow_name,
            task_name: start.task_name,
            called_flow: start.called_flow,
            success: false,
        };

        let restarted = {
            let mut log = self.lock();
            let restarted = match log.index.get(&id).copied() {
                Some(previous) if log.steps[previous].is_open() => {
                    let superseded = log.steps[previous].ended(now, false);
                    log.steps[previous] = superseded;
                    true
                }
                _ => false,
            };
            log.steps.push(step);
            let position = log.steps.len() - 1;
            log.index.insert(id, position);
            restarted
        };

        if restarted {
            warn!(step_id = %id, "Step restarted while still open; closing previous attempt");
        }
    }

    /// Record the end of a step. Returns `false` if `id` was never started.
    pub fn on_step_end(&self, id: StepId, success: bool) -> bool {
        let now = self.clock.now_millis();
        let mut log = self.lock();
        let Some(&position) = log.index.get(&id) else {
            return false;
        };
        let ended = log.steps[position].ended(now, success);
        log.steps[position] = ended;
        drop(log);

        debug!(step_id = %id, success, "Step ended");
        true
    }

    /// Snapshot of all records in start order.
    pub fn steps(&self) -> Vec<StepInfo> {
        self.lock().steps.clone()
    }

    /// Snapshot of the `StepId -> position` index.
    pub fn index(&self) -> HashMap<StepId, usize> {
        self.lock().index.clone()
    }

    /// The record currently indexed under `id`.
    pub fn get(&self, id: &StepId) -> Option<StepInfo> {
        let log = self.lock();
        log.index.get(id).map(|&position| log.steps[position].clone())
    }

    /// Records that have not received an end event.
    pub fn open_steps(&self) -> Vec<StepInfo> {
        self.lock()
            .steps
            .iter()
            .filter(|step| step.is_open())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }
}

impl std::fmt::Debug for FlowSteps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowSteps")
            .field("instance_id", &self.instance_id)
            .field("flow_name", &self.flow_name)
            .field("started_at", &self.started_at)
            .field("steps", &self.len())
            .finish()
    }
}
