//! Display names for traced steps.

use tracing::warn;

use crate::interpreter::{ExecutionState, ExpressionEvaluator, Step, StepCommand, ThreadId};

/// Resolve the display name of a step.
///
/// An explicit segment name wins when it evaluates to a value. Otherwise the
/// per-kind default description is used.
pub fn step_name(
    evaluator: &dyn ExpressionEvaluator,
    state: &dyn ExecutionState,
    thread: ThreadId,
    command: &StepCommand,
) -> String {
    if let Some(segment_name) = &command.segment_name {
        if let Some(name) = evaluate(evaluator, state, thread, segment_name) {
            return name;
        }
    }
    default_description(evaluator, state, thread, &command.step)
}

/// Default description for a step kind.
pub fn default_description(
    evaluator: &dyn ExpressionEvaluator,
    state: &dyn ExecutionState,
    thread: ThreadId,
    step: &Step,
) -> String {
    match step {
        Step::FlowCall { flow_name } => {
            let name = evaluate(evaluator, state, thread, flow_name)
                .unwrap_or_else(|| flow_name.clone());
            format!("Flow call: {name}")
        }
        Step::TaskCall { name } => format!("Task: {name}"),
        Step::Expression { expr } => format!("Expression: {expr}"),
        Step::Script { language_or_ref } => format!("Script: {language_or_ref}"),
        Step::If { expression } => format!("Check: {expression}"),
        Step::Switch { expression } => format!("Switch: {expression}"),
        Step::SetVariables => "Set variables".to_string(),
        Step::Checkpoint { name } => format!("Checkpoint: {name}"),
        Step::FormCall { name } => format!("Form call: {name}"),
        Step::Group => "Group of steps".to_string(),
        Step::Parallel => "Parallel block".to_string(),
        Step::Exit => "Exit".to_string(),
        Step::Return => "Return".to_string(),
        Step::Other { type_name } => type_name.clone(),
    }
}

fn evaluate(
    evaluator: &dyn ExpressionEvaluator,
    state: &dyn ExecutionState,
    thread: ThreadId,
    template: &str,
) -> Option<String> {
    match evaluator.eval_string(state, thread, template) {
        Ok(value) => value,
        Err(e) => {
            warn!(template, error = %e, "Failed to evaluate step name");
            None
        }
    }
}
