use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::part::{Part, ToolResultState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// A reconstructed piece of a message: regions folded, tool calls paired
/// with their results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        id: String,
        text: String,
    },
    Reasoning {
        id: String,
        text: String,
    },
    ToolInvocation {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(rename = "isError", default)]
        is_error: bool,
        #[serde(rename = "providerExecuted", default)]
        provider_executed: bool,
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
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            parts: Vec::new(),
        }
    }

    pub fn user(id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut message = Self::new(id, Role::User);
        message.parts.push(MessagePart::Text {
            id: "t0".to_string(),
            text: text.into(),
        });
        message
    }

    /// Folds a part sequence into a single message with the given identity.
    pub fn from_parts(id: impl Into<String>, role: Role, parts: &[Part]) -> Self {
        let mut builder = MessageBuilder::new(id.into(), role);
        for part in parts {
            builder.apply(part);
        }
        builder.finish()
    }

    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text, .. } = part {
                out.push_str(text);
            }
        }
        out
    }
}

/// Folds an ordered part sequence into messages: one message per `start`
/// part, text and reasoning regions concatenated in arrival order, tool
/// calls paired with their terminal results.
pub fn reconstruct(parts: &[Part]) -> Vec<Message> {
    let mut messages = Vec::new();
    let mut builder: Option<MessageBuilder> = None;

    for part in parts {
        if let Part::Start { message_id } = part {
            if let Some(done) = builder.take() {
                messages.push(done.finish());
            }
            builder = Some(MessageBuilder::new(message_id.clone(), Role::Assistant));
            continue;
        }

        builder
            .get_or_insert_with(|| {
                MessageBuilder::new(format!("message-{}", messages.len()), Role::Assistant)
            })
            .apply(part);
    }

    if let Some(done) = builder.take() {
        messages.push(done.finish());
    }
    messages
}

struct MessageBuilder {
    message: Message,
    text_regions: HashMap<String, usize>,
    reasoning_regions: HashMap<String, usize>,
    tool_calls: HashMap<String, usize>,
}

impl MessageBuilder {
    fn new(id: String, role: Role) -> Self {
        Self {
            message: Message::new(id, role),
            text_regions: HashMap::new(),
            reasoning_regions: HashMap::new(),
            tool_calls: HashMap::new(),
        }
    }

    fn apply(&mut self, part: &Part) {
        match part {
            Part::TextStart { id } => {
                self.open_text(id);
            }
            Part::TextDelta { id, delta } => {
                let index = self.open_text(id);
                if let MessagePart::Text { text, .. } = &mut self.message.parts[index] {
                    text.push_str(delta);
                }
            }
            Part::ReasoningStart { id } => {
                self.open_reasoning(id);
            }
            Part::ReasoningDelta { id, delta } => {
                let index = self.open_reasoning(id);
                if let MessagePart::Reasoning { text, .. } = &mut self.message.parts[index] {
                    text.push_str(delta);
                }
            }
            Part::ToolCall {
                tool_call_id,
                tool_name,
                input,
                provider_executed,
            } => {
                let index = self.message.parts.len();
                self.message.parts.push(MessagePart::ToolInvocation {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    input: input.clone(),
                    output: None,
                    is_error: false,
                    provider_executed: *provider_executed,
                });
                self.tool_calls.insert(tool_call_id.clone(), index);
            }
            Part::ToolResult {
                tool_call_id,
                output,
                is_error,
                state: _,
            } => {
                // Later states overwrite earlier partial ones.
                let index = match self.tool_calls.get(tool_call_id) {
                    Some(index) => *index,
                    None => {
                        let index = self.message.parts.len();
                        self.message.parts.push(MessagePart::ToolInvocation {
                            tool_call_id: tool_call_id.clone(),
                            tool_name: String::new(),
                            input: Value::Null,
                            output: None,
                            is_error: false,
                            provider_executed: false,
                        });
                        self.tool_calls.insert(tool_call_id.clone(), index);
                        index
                    }
                };
                if let MessagePart::ToolInvocation {
                    output: slot,
                    is_error: error_slot,
                    ..
                } = &mut self.message.parts[index]
                {
                    *slot = Some(output.clone());
                    *error_slot = *is_error;
                }
            }
            Part::SourceUrl {
                source_id,
                url,
                title,
            } => {
                self.message.parts.push(MessagePart::SourceUrl {
                    source_id: source_id.clone(),
                    url: url.clone(),
                    title: title.clone(),
                });
            }
            Part::SourceDocument {
                source_id,
                media_type,
                title,
            } => {
                self.message.parts.push(MessagePart::SourceDocument {
                    source_id: source_id.clone(),
                    media_type: media_type.clone(),
                    title: title.clone(),
                });
            }
            Part::File { media_type, data } => {
                self.message.parts.push(MessagePart::File {
                    media_type: media_type.clone(),
                    data: data.clone(),
                });
            }
            Part::Data { name, data } => {
                self.message.parts.push(MessagePart::Data {
                    name: name.clone(),
                    data: data.clone(),
                });
            }
            Part::Error { message } => {
                self.message.parts.push(MessagePart::Error {
                    message: message.clone(),
                });
            }
            // Lifecycle and control parts carry no message content.
            Part::Start { .. }
            | Part::StepStart
            | Part::StepFinish { .. }
            | Part::Finish { .. }
            | Part::TextEnd { .. }
            | Part::ReasoningEnd { .. }
            | Part::ToolApprovalRequest { .. }
            | Part::ToolApprovalResponse { .. }
            | Part::Raw { .. } => {}
        }
    }

    fn open_text(&mut self, id: &str) -> usize {
        if let Some(index) = self.text_regions.get(id) {
            return *index;
        }
        let index = self.message.parts.len();
        self.message.parts.push(MessagePart::Text {
            id: id.to_string(),
            text: String::new(),
        });
        self.text_regions.insert(id.to_string(), index);
        index
    }

    fn open_reasoning(&mut self, id: &str) -> usize {
        if let Some(index) = self.reasoning_regions.get(id) {
            return *index;
        }
        let index = self.message.parts.len();
        self.message.parts.push(MessagePart::Reasoning {
            id: id.to_string(),
            text: String::new(),
        });
        self.reasoning_regions.insert(id.to_string(), index);
        index
    }

    fn finish(self) -> Message {
        self.message
    }
}

/// True when every tool call in the sequence has a terminal result.
pub fn tool_calls_resolved(parts: &[Part]) -> bool {
    let mut resolved: HashMap<&str, bool> = HashMap::new();
    for part in parts {
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
    resolved.values().all(|done| *done)
}
