//! Converts an execution log into a span tree and publishes it.
//!
//! Export runs once per process instance, on the terminal lifecycle event:
//!
//! 1. one trace id for the whole run
//! 2. a root span covering the process (`processId` attribute)
//! 3. a pre-pass assigning a span id to every recorded step, so children can
//!    reference parents regardless of record order
//! 4. one span per step; a parent that was never recorded maps to the root
//! 5. step spans, then the root, go through a [`BatchSpanProcessor`] which is
//!    flushed before returning

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use super::flow_steps::{FlowSteps, StepInfo};
use super::span::{millis_to_nanos, Attributes, Resource, SpanId, SpanRecord, SpanStatus, TraceId};
use super::step_id::StepId;
use crate::clock::SharedClock;
use crate::config::TelemetryConfig;
use crate::error::Result;

const SDK_NAME: &str = "flowtrace";

/// Destination for finished spans.
pub trait SpanExporter: Send + Sync {
    fn export(&self, resource: &Resource, batch: &[SpanRecord]) -> Result<()>;
}

/// Buffers finished spans and exports them in bounded batches.
pub struct BatchSpanProcessor<'a> {
    exporter: &'a dyn SpanExporter,
    resource: Resource,
    max_export_batch_size: usize,
    buffer: Vec<SpanRecord>,
    exported: usize,
}

impl<'a> BatchSpanProcessor<'a> {
    pub fn new(exporter: &'a dyn SpanExporter, resource: Resource, max_export_batch_size: usize) -> Self {
        let max_export_batch_size = max_export_batch_size.max(1);
        Self {
            exporter,
            resource,
            max_export_batch_size,
            buffer: Vec::with_capacity(max_export_batch_size),
            exported: 0,
        }
    }

    /// Queue a finished span, exporting a batch once the buffer is full.
    pub fn on_end(&mut self, span: SpanRecord) -> Result<()> {
        self.buffer.push(span);
        if self.buffer.len() >= self.max_export_batch_size {
            self.export_buffer()?;
        }
        Ok(())
    }

    /// Export everything still buffered.
    pub fn force_flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.export_buffer()
    }

    /// Spans handed to the exporter so far.
    pub fn exported(&self) -> usize {
        self.exported
    }

    fn export_buffer(&mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.buffer);
        debug!(spans = batch.len(), "Exporting span batch");
        self.exporter.export(&self.resource, &batch)?;
        self.exported += batch.len();
        Ok(())
    }
}

/// Collects exported spans in memory.
#[derive(Debug, Default)]
pub struct InMemorySpanExporter {
    batches: Mutex<Vec<(Resource, Vec<SpanRecord>)>>,
}

impl InMemorySpanExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// All exported spans, in export order.
    pub fn spans(&self) -> Vec<SpanRecord> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flat_map(|(_, spans)| spans.iter().cloned())
            .collect()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, spans)| spans.len())
            .collect()
    }

    pub fn last_resource(&self) -> Option<Resource> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .map(|(resource, _)| resource.clone())
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&self, resource: &Resource, batch: &[SpanRecord]) -> Result<()> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((resource.clone(), batch.to_vec()));
        Ok(())
    }
}

/// Builds and publishes the trace of one process instance.
pub struct TelemetryExporter {
    exporter: Arc<dyn SpanExporter>,
    service_name: String,
    max_export_batch_size: usize,
    clock: SharedClock,
}

impl TelemetryExporter {
    pub fn new(exporter: Arc<dyn SpanExporter>, config: &TelemetryConfig, clock: SharedClock) -> Self {
        Self {
            exporter,
            service_name: config.service_name.clone(),
            max_export_batch_size: config.max_export_batch_size,
            clock,
        }
    }

    pub fn resource(&self, flow_steps: &FlowSteps) -> Resource {
        Resource::default()
            .with_attribute("service.name", self.service_name.as_str())
            .with_attribute("service.version", env!("CARGO_PKG_VERSION"))
            .with_attribute("telemetry.sdk.name", SDK_NAME)
            .with_attribute("telemetry.sdk.language", "rust")
            .with_attribute("flowName", flow_steps.flow_name())
            .with_attribute("processId", flow_steps.instance_id().to_string())
    }

    /// Export `flow_steps` as one trace and return its id.
    pub fn export(&self, flow_steps: &FlowSteps, is_process_finished_ok: bool) -> Result<TraceId> {
        let trace_id = TraceId::random();
        let now = self.clock.now_millis();
        let spans = build_spans(flow_steps, is_process_finished_ok, now, trace_id);
        let span_count = spans.len();

        let mut processor =
            BatchSpanProcessor::new(self.exporter.as_ref(), self.resource(flow_steps), self.max_export_batch_size);
        for span in spans {
            processor.on_end(span)?;
        }
        processor.force_flush()?;

        info!(
            trace_id = %trace_id,
            instance_id = %flow_steps.instance_id(),
            spans = span_count,
            ok = is_process_finished_ok,
            "Exported process trace"
        );
        Ok(trace_id)
    }
}

/// Build the span tree for `flow_steps`: step spans in record order, root last.
///
/// Steps without an end are closed at `now` with the overall outcome.
pub fn build_spans(
    flow_steps: &FlowSteps,
    is_process_finished_ok: bool,
    now: i64,
    trace_id: TraceId,
) -> Vec<SpanRecord> {
    let steps = flow_steps.steps();
    let root_span_id = SpanId::random();

    // later records win for repeated ids, like the log's own index
    let span_ids: Vec<SpanId> = steps.iter().map(|_| SpanId::random()).collect();
    let by_step_id: HashMap<StepId, SpanId> = steps
        .iter()
        .zip(&span_ids)
        .map(|(step, span_id)| (step.id, *span_id))
        .collect();

    let mut spans: Vec<SpanRecord> = steps
        .iter()
        .zip(span_ids)
        .map(|(step, span_id)| {
            let parent_span_id = step
                .parent_id
                .and_then(|parent| by_step_id.get(&parent).copied())
                .unwrap_or(root_span_id);
            step_span(step, trace_id, span_id, parent_span_id, is_process_finished_ok, now)
        })
        .collect();

    let mut root_attributes = Attributes::new();
    root_attributes.insert("processId".into(), flow_steps.instance_id().to_string().into());

    spans.push(SpanRecord {
        trace_id,
        span_id: root_span_id,
        parent_span_id: None,
        name: flow_steps.flow_name().to_string(),
        start_time_unix_nano: millis_to_nanos(flow_steps.started_at()),
        end_time_unix_nano: millis_to_nanos(now.max(flow_steps.started_at())),
        status: SpanStatus::from_success(is_process_finished_ok),
        attributes: root_attributes,
    });

    spans
}

fn step_span(
    step: &StepInfo,
    trace_id: TraceId,
    span_id: SpanId,
    parent_span_id: SpanId,
    is_process_finished_ok: bool,
    now: i64,
) -> SpanRecord {
    let (ended_at, success) = match step.ended_at {
        Some(ended_at) => (ended_at, step.success),
        None => (now.max(step.started_at), is_process_finished_ok),
    };

    let mut attributes = Attributes::new();
    if let Some(filename) = &step.filename {
        attributes.insert("filename".into(), filename.as_str().into());
    }
    attributes.insert("lineNum".into(), i64::from(step.line_num).into());
    attributes.insert("column".into(), i64::from(step.column).into());
    if let Some(flow_name) = &step.flow_name {
        attributes.insert("flowName".into(), flow_name.as_str().into());
    }
    attributes.insert("correlationId".into(), step.id.correlation_id.to_string().into());
    if let Some(task_name) = &step.task_name {
        attributes.insert("taskName".into(), task_name.as_str().into());
    }
    if let Some(called_flow) = &step.called_flow {
        attributes.insert("calledFlow".into(), called_flow.as_str().into());
    }
    if let Some(loop_index) = step.id.loop_index {
        attributes.insert("loopIndex".into(), i64::from(loop_index).into());
    }

    SpanRecord {
        trace_id,
        span_id,
        parent_span_id: Some(parent_span_id),
        name: step.name.clone(),
        start_time_unix_nano: millis_to_nanos(step.started_at),
        end_time_unix_nano: millis_to_nanos(ended_at),
        status: SpanStatus::from_success(success),
        attributes,
    }
}
