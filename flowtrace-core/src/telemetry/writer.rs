//! File and text output for traces.
//!
//! - [`JsonLinesExporter`]: appends exported spans to a file, one JSON object
//!   per line
//! - [`TelemetryWriter::format_step_tree`]: renders an execution log as an
//!   indented step tree for operators

use chrono::{DateTime, Local};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::exporter::SpanExporter;
use super::flow_steps::{FlowSteps, StepInfo};
use super::span::{Resource, SpanRecord};
use super::step_id::StepId;
use crate::error::Result;

/// Appends spans to a JSON-lines file.
#[derive(Debug)]
pub struct JsonLinesExporter {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SpanExporter for JsonLinesExporter {
    fn export(&self, _resource: &Resource, batch: &[SpanRecord]) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);

        // newline-terminated for log shippers
        for span in batch {
            serde_json::to_writer(&mut writer, span)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Human-readable rendering of execution logs.
pub struct TelemetryWriter;

impl TelemetryWriter {
    /// Render `flow_steps` as an indented tree in start order.
    ///
    /// Steps whose parent was never recorded are listed at the top level.
    pub fn format_step_tree(flow_steps: &FlowSteps) -> String {
        let steps = flow_steps.steps();
        let index: HashMap<StepId, usize> = flow_steps.index();

        let mut roots = Vec::new();
        let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
        for (position, step) in steps.iter().enumerate() {
            match step.parent_id.and_then(|parent| index.get(&parent).copied()) {
                Some(parent) if parent != position => children.entry(parent).or_default().push(position),
                _ => roots.push(position),
            }
        }

        let open = steps.iter().filter(|s| s.is_open()).count();

        let mut output = String::new();
        output.push_str(&format!(
            "===== Flowtrace Steps [{}] [{}] =====\n",
            format_millis(flow_steps.started_at()),
            flow_steps.instance_id()
        ));
        output.push_str(&format!("Flow: {}\n", flow_steps.flow_name()));
        output.push_str(&format!("Steps: {} ({} open)\n", steps.len(), open));
        output.push('\n');

        if steps.is_empty() {
            output.push_str("(No steps recorded)\n");
        }

        let mut visited = HashSet::new();
        for root in roots {
            write_subtree(&mut output, &steps, &children, root, 0, &mut visited);
        }
        // parent cycles are unreachable from any root
        for position in 0..steps.len() {
            write_subtree(&mut output, &steps, &children, position, 0, &mut visited);
        }

        output.push('\n');
        output.push_str("===== End Steps =====\n");
        output
    }
}

fn write_subtree(
    output: &mut String,
    steps: &[StepInfo],
    children: &HashMap<usize, Vec<usize>>,
    position: usize,
    depth: usize,
    visited: &mut HashSet<usize>,
) {
    if !visited.insert(position) {
        return;
    }
    output.push_str(&"  ".repeat(depth));
    output.push_str(&format_step(&steps[position]));
    output.push('\n');

    for &child in children.get(&position).map(Vec::as_slice).unwrap_or_default() {
        write_subtree(output, steps, children, child, depth + 1, visited);
    }
}

fn format_step(step: &StepInfo) -> String {
    let status = match (step.is_open(), step.success) {
        (true, _) => "OPEN",
        (false, true) => "OK",
        (false, false) => "FAILED",
    };

    let mut line = format!("- {} [{}]", step.name, status);
    if let Some(index) = step.id.loop_index {
        line.push_str(&format!(" #{index}"));
    }
    if let Some(duration) = step.duration_millis() {
        line.push_str(&format!(" {duration}ms"));
    }
    if let Some(filename) = &step.filename {
        line.push_str(&format!(" ({}:{})", filename, step.line_num));
    }
    line
}

fn format_millis(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|utc| {
            let local: DateTime<Local> = utc.into();
            local.format("%Y-%m-%d %H:%M:%S").to_string()
        })
        .unwrap_or_else(|| millis.to_string())
}
