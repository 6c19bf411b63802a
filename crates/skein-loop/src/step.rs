use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use skein_stream::{FinishReason, Part, ToolResultState, Usage};

/// A tool call extracted from a step's parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallView {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
    pub provider_executed: bool,
}

/// One completed request/response cycle with the model capability,
/// including the tool results produced before the next step started.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub parts: Vec<Part>,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

impl Step {
    pub fn tool_calls(&self) -> Vec<ToolCallView> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::ToolCall {
                    tool_call_id,
                    tool_name,
                    input,
                    provider_executed,
                } => Some(ToolCallView {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    input: input.clone(),
                    provider_executed: *provider_executed,
                }),
                _ => None,
            })
            .collect()
    }

    /// Tool calls without a terminal result in this step.
    pub fn pending_tool_calls(&self) -> Vec<ToolCallView> {
        let mut resolved: HashMap<&str, bool> = HashMap::new();
        for part in &self.parts {
            match part {
                Part::ToolCall { tool_call_id, .. } => {
                    resolved.entry(tool_call_id).or_insert(false);
                }
                Part::ToolResult {
                    tool_call_id,
                    state: ToolResultState::Final,
                    ..
                } => {
                    resolved.insert(tool_call_id, true);
                }
                _ => {}
            }
        }
        self.tool_calls()
            .into_iter()
            .filter(|call| !resolved.get(call.tool_call_id.as_str()).copied().unwrap_or(false))
            .collect()
    }

    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::TextDelta { delta, .. } = part {
                out.push_str(delta);
            }
        }
        out
    }
}

/// Decides after every step whether the loop performs another one.
pub trait StopCondition: Send + Sync {
    fn should_stop(&self, steps: &[Step]) -> bool;
}

impl<F> StopCondition for F
where
    F: Fn(&[Step]) -> bool + Send + Sync,
{
    fn should_stop(&self, steps: &[Step]) -> bool {
        (self)(steps)
    }
}

/// Stop once the given number of steps has completed.
pub struct MaxSteps(pub usize);

impl StopCondition for MaxSteps {
    fn should_stop(&self, steps: &[Step]) -> bool {
        steps.len() >= self.0
    }
}

/// Stop when the latest step left no tool call unresolved and requested
/// none to begin with.
pub struct NoPendingToolCalls;

impl StopCondition for NoPendingToolCalls {
    fn should_stop(&self, steps: &[Step]) -> bool {
        steps
            .last()
            .map(|step| step.tool_calls().is_empty() && step.pending_tool_calls().is_empty())
            .unwrap_or(false)
    }
}

/// Stop once a tool with the given name has been called in any step.
pub struct ToolCalled(pub String);

impl StopCondition for ToolCalled {
    fn should_stop(&self, steps: &[Step]) -> bool {
        steps.iter().any(|step| {
            step.tool_calls()
                .iter()
                .any(|call| call.tool_name == self.0)
        })
    }
}

/// First matching condition wins.
pub struct AnyOf(pub Vec<Arc<dyn StopCondition>>);

impl StopCondition for AnyOf {
    fn should_stop(&self, steps: &[Step]) -> bool {
        self.0.iter().any(|condition| condition.should_stop(steps))
    }
}
