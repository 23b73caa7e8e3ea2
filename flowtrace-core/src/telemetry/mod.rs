//! Execution-trace reconstruction and export.
//!
//! The collector observes the interpreter's command stream and rebuilds a
//! hierarchical trace of steps, including nested flow calls, loop iterations
//! and parallel forks, across suspend/resume boundaries.
//!
//! ## Architecture
//!
//! ```text
//! interpreter hooks
//!   │
//!   ▼
//! TelemetryCollector ── ParentTracker (per-frame parent/correlation context)
//!   │
//!   ├── FlowSteps (execution log, StepId -> StepInfo)
//!   │     └── persisted on suspension (opentelemetry.json)
//!   │
//!   └── TelemetryExporter (on finish or failure)
//!         ├── root span + one span per step
//!         └── BatchSpanProcessor -> SpanExporter (OTLP/HTTP, JSON lines, memory)
//! ```
//!
//! ## Key Features
//!
//! - **Frame-scoped parents**: a step's parent is found by walking the
//!   thread's frames, never a thread-local
//! - **Flow calls end on frame teardown**: the span covers every descendant
//! - **Best effort**: failures degrade to "no telemetry" and never abort the
//!   observed process

pub mod collector;
pub mod exporter;
pub mod flow_steps;
pub mod naming;
pub mod otlp;
pub mod persistence;
pub mod span;
pub mod step_id;
pub mod tracker;
pub mod writer;

pub use collector::{CollectorState, TelemetryCollector};
pub use exporter::{BatchSpanProcessor, InMemorySpanExporter, SpanExporter, TelemetryExporter};
pub use flow_steps::{FlowSteps, PersistedFlowSteps, StepInfo, StepStart};
pub use otlp::OtlpHttpExporter;
pub use persistence::{DirPersistence, MemoryPersistence, PersistenceService};
pub use span::{Resource, SpanId, SpanRecord, SpanStatus, TraceId};
pub use step_id::StepId;
pub use tracker::{FrameTraceContext, ParentTracker};
pub use writer::{JsonLinesExporter, TelemetryWriter};
