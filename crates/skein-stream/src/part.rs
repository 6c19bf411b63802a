use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal state of a generation step or run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolResultState {
    Partial,
    Final,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    #[serde(rename = "cacheRead")]
    pub cache_read: u64,
    #[serde(rename = "cacheWrite")]
    pub cache_write: u64,
    pub reasoning: u64,
    #[serde(rename = "totalTokens")]
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
        self.cache_read = self.cache_read.saturating_add(other.cache_read);
        self.cache_write = self.cache_write.saturating_add(other.cache_write);
        self.reasoning = self.reasoning.saturating_add(other.reasoning);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// Declared shape of a tool visible to the model capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Atomic typed event in the generation stream.
///
/// Region-bracketing variants (`TextStart`/`TextEnd`, `ReasoningStart`/
/// `ReasoningEnd`) carry an `id` the interior deltas reference, so a decoder
/// can reassemble regions regardless of chunk boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Start {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    StepStart,
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
        #[serde(rename = "providerExecuted", default)]
        provider_executed: bool,
    },
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        state: ToolResultState,
        output: Value,
        #[serde(rename = "isError", default)]
        is_error: bool,
    },
    ToolApprovalRequest {
        #[serde(rename = "approvalId")]
        approval_id: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
    },
    ToolApprovalResponse {
        #[serde(rename = "approvalId")]
        approval_id: String,
        approved: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    SourceUrl {
        #[serde(rename = "sourceId")]
        source_id: String,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    SourceDocument {
        #[serde(rename = "sourceId")]
        source_id: String,
        #[serde(rename = "mediaType")]
        media_type: String,
        title: String,
    },
    File {
        #[serde(rename = "mediaType")]
        media_type: String,
        data: String,
    },
    Data {
        name: String,
        data: Value,
    },
    Raw {
        payload: Value,
    },
    StepFinish {
        reason: FinishReason,
        usage: Usage,
    },
    Finish {
        reason: FinishReason,
    },
    Error {
        message: String,
    },
}

impl Part {
    pub fn text_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::TextDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    pub fn tool_call(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self::ToolCall {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            input,
            provider_executed: false,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, output: Value) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            state: ToolResultState::Final,
            output,
            is_error: false,
        }
    }

    pub fn tool_error(tool_call_id: impl Into<String>, output: Value) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            state: ToolResultState::Final,
            output,
            is_error: true,
        }
    }

    pub fn data(name: impl Into<String>, data: Value) -> Self {
        Self::Data {
            name: name.into(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// True for the parts that end a whole run, not just a step.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Part::Finish { .. } | Part::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn part_wire_tags_are_kebab_case() {
        let encoded = serde_json::to_string(&Part::text_delta("t1", "hi")).unwrap();
        assert_eq!(encoded, r#"{"type":"text-delta","id":"t1","delta":"hi"}"#);

        let encoded = serde_json::to_string(&Part::ToolApprovalRequest {
            approval_id: "ap-1".to_string(),
            tool_call_id: "tc-1".to_string(),
        })
        .unwrap();
        assert_eq!(
            encoded,
            r#"{"type":"tool-approval-request","approvalId":"ap-1","toolCallId":"tc-1"}"#
        );
    }

    #[test]
    fn tool_call_provider_executed_defaults_to_false() {
        let part: Part = serde_json::from_str(
            r#"{"type":"tool-call","toolCallId":"tc-1","toolName":"search","input":{"q":"x"}}"#,
        )
        .unwrap();
        assert_eq!(
            part,
            Part::tool_call("tc-1", "search", json!({"q": "x"}))
        );
    }

    #[test]
    fn usage_add_saturates_instead_of_overflowing() {
        let mut usage = Usage {
            input: u64::MAX - 1,
            ..Usage::default()
        };
        usage.add(&Usage {
            input: 5,
            output: 3,
            ..Usage::default()
        });
        assert_eq!(usage.input, u64::MAX);
        assert_eq!(usage.output, 3);
    }
}
