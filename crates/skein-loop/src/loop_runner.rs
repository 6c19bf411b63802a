use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use skein_stream::{
    encode_chunk, FinishReason, Message, MessagePart, ObjectAccumulator, Part, PartStream,
    PartWriter, Role, SerialJobExecutor, SkeinError, SkeinErrorCode, SourceRegistrar,
    StreamMerger, StreamSource, ToolResultState, Usage,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::approval::{ApprovalBroker, ApprovalDecision, ApprovalResponder};
use crate::resume::StoreRef;
use crate::step::Step;
use crate::types::{AbortSignal, RunConfig, RunRequest, StepRequest, ToolExecuteFn, ToolProgress};

/// Handle to a running multi-step generation: the live part stream, the
/// final message, and the channel for approval decisions.
pub struct RunHandle {
    stream: PartStream,
    approvals: ApprovalResponder,
}

impl RunHandle {
    pub fn stream(&self) -> PartStream {
        self.stream.clone()
    }

    pub async fn next(&self) -> Option<Part> {
        self.stream.next().await
    }

    pub async fn message(&self) -> Option<Message> {
        self.stream.result().await
    }

    pub fn approvals(&self) -> ApprovalResponder {
        self.approvals.clone()
    }

    pub fn respond(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), SkeinError> {
        self.approvals.respond(approval_id, decision)
    }
}

/// Drives one-or-more generation steps to completion, executing tools and
/// splicing their results back into the merged output stream.
pub fn run_loop(
    request: RunRequest,
    config: RunConfig,
    signal: Option<AbortSignal>,
) -> RunHandle {
    let stream = PartStream::new();
    let broker = ApprovalBroker::new();
    let handle = RunHandle {
        stream: stream.clone(),
        approvals: broker.responder(),
    };

    let runner = LoopRunner::new(request, config, signal, stream, broker);
    tokio::spawn(async move {
        runner.run().await;
    });

    handle
}

struct LoopRunner {
    config: RunConfig,
    signal: Option<AbortSignal>,
    stream: PartStream,
    broker: ApprovalBroker,
    message_id: String,
    system_prompt: Option<String>,
    conversation: Vec<Message>,
    response_schema: Option<Value>,
    steps: Vec<Step>,
    emitted: Vec<Part>,
    object: Option<ObjectAccumulator>,
    appender: StoreAppender,
    approval_seq: usize,
}

impl LoopRunner {
    fn new(
        request: RunRequest,
        config: RunConfig,
        signal: Option<AbortSignal>,
        stream: PartStream,
        broker: ApprovalBroker,
    ) -> Self {
        let appender = StoreAppender {
            serial: SerialJobExecutor::new(),
            store: config.store.clone(),
            stream_id: config.stream_id.clone(),
        };
        let object = request.response_schema.as_ref().map(|_| ObjectAccumulator::new());
        Self {
            config,
            signal,
            stream,
            broker,
            message_id: request.message_id,
            system_prompt: request.system_prompt,
            conversation: request.messages,
            response_schema: request.response_schema,
            steps: Vec::new(),
            emitted: Vec::new(),
            object,
            appender,
            approval_seq: 0,
        }
    }

    async fn run(mut self) {
        self.emit(Part::Start {
            message_id: self.message_id.clone(),
        })
        .await;

        let reason = self.drive_steps().await;
        let reason = self.finalize_object(reason).await;

        self.emit(Part::Finish { reason }).await;
        let message = Message::from_parts(self.message_id.clone(), Role::Assistant, &self.emitted);
        self.stream.end(Some(message));
    }

    async fn drive_steps(&mut self) -> FinishReason {
        loop {
            if self.is_aborted() {
                return FinishReason::Aborted;
            }

            self.emit(Part::StepStart).await;
            let step = match self.run_step().await {
                Ok(step) => step,
                Err(error) => {
                    // Capability and protocol failures end the whole run;
                    // output already forwarded stays in place.
                    warn!(code = ?error.code, error = error.message.as_str(), "run failed");
                    let aborted = error.is_abort();
                    self.emit(Part::error(error.as_compact_json())).await;
                    return if aborted {
                        FinishReason::Aborted
                    } else {
                        FinishReason::Error
                    };
                }
            };

            let reason = step.finish_reason;
            let had_tool_calls = !step.tool_calls().is_empty();
            self.append_step_messages(&step);
            self.steps.push(step);
            debug!(
                step = self.steps.len(),
                reason = ?reason,
                had_tool_calls,
                "step finished"
            );

            match reason {
                FinishReason::Aborted | FinishReason::Error => return reason,
                // Complete tool calls already ran; a truncated step never
                // starts a successor.
                FinishReason::Length | FinishReason::ContentFilter => return reason,
                FinishReason::Stop | FinishReason::ToolCalls => {}
            }
            if self.config.stop_when.should_stop(&self.steps) {
                return reason;
            }
            if !had_tool_calls {
                return reason;
            }
            // A denied call is answered with an error result, never retried
            // with a fresh step.
            if approval_denied(self.steps.last().expect("step just pushed")) {
                return reason;
            }
        }
    }

    async fn run_step(&mut self) -> Result<Step, SkeinError> {
        let request = StepRequest {
            system_prompt: self.system_prompt.clone(),
            messages: self.conversation.clone(),
            tools: self
                .config
                .tools
                .iter()
                .map(|tool| tool.spec.clone())
                .collect(),
            response_schema: self.response_schema.clone(),
        };
        let capability_stream = self
            .config
            .capability
            .generate(request, self.signal.clone())?;

        let (mut merger, registrar) =
            StreamMerger::new(Box::new(StreamSource::new(capability_stream)));
        let mut registrar = Some(registrar);
        let mut step_parts: Vec<Part> = Vec::new();
        let mut resolved: HashMap<String, bool> = HashMap::new();
        let mut finish: Option<(FinishReason, Usage)> = None;

        loop {
            let next = match &self.signal {
                Some(signal) => tokio::select! {
                    _ = signal.cancelled() => None,
                    part = merger.next() => part,
                },
                None => merger.next().await,
            };
            let Some(part) = next else {
                if self.is_aborted() {
                    merger.cancel();
                }
                break;
            };

            let mut follow_up: Option<Part> = None;
            match &part {
                Part::StepFinish { reason, usage } => {
                    // The model turn is over; the merge drains the remaining
                    // tool sources, then the step closes with this reason.
                    finish = Some((*reason, *usage));
                    registrar = None;
                    continue;
                }
                Part::Error { message } => {
                    merger.cancel();
                    return Err(SkeinError::new(
                        SkeinErrorCode::CapabilityFailed,
                        message.clone(),
                    ));
                }
                Part::Raw { .. } => {
                    if !self.config.include_raw_chunks {
                        continue;
                    }
                }
                Part::ToolCall {
                    tool_call_id,
                    tool_name,
                    input,
                    provider_executed,
                } => {
                    resolved.insert(tool_call_id.clone(), false);
                    if !provider_executed {
                        follow_up =
                            self.prepare_tool_call(registrar.as_ref(), tool_call_id, tool_name, input);
                    }
                }
                Part::ToolResult {
                    tool_call_id,
                    state: ToolResultState::Final,
                    ..
                } => {
                    resolved.insert(tool_call_id.clone(), true);
                }
                Part::TextDelta { delta, .. } => {
                    if let Some(accumulator) = &mut self.object {
                        follow_up = accumulator
                            .push_delta(delta)
                            .map(|partial| Part::data("object", partial));
                    }
                }
                _ => {}
            }

            step_parts.push(part.clone());
            self.emit(part).await;
            if let Some(extra) = follow_up {
                if let Part::ToolResult { tool_call_id, .. } = &extra {
                    resolved.insert(tool_call_id.clone(), true);
                }
                step_parts.push(extra.clone());
                self.emit(extra).await;
            }
        }
        drop(merger);

        let aborted = self.is_aborted();
        let mut unresolved: Vec<String> = resolved
            .iter()
            .filter(|(_, done)| !**done)
            .map(|(id, _)| id.clone())
            .collect();
        unresolved.sort();
        for tool_call_id in unresolved {
            // Pairing invariant: unresolved calls are reported, never
            // silently dropped.
            let message = if aborted {
                "Tool call aborted before completion"
            } else {
                "Tool call produced no result"
            };
            let part = Part::tool_error(tool_call_id, json!({ "error": message }));
            step_parts.push(part.clone());
            self.emit(part).await;
        }

        let (reason, usage) = if aborted {
            let usage = finish.map(|(_, usage)| usage).unwrap_or_default();
            (FinishReason::Aborted, usage)
        } else {
            finish.ok_or_else(|| {
                SkeinError::new(
                    SkeinErrorCode::Protocol,
                    "Capability stream ended without a step-finish event",
                )
            })?
        };

        self.emit(Part::StepFinish { reason, usage }).await;
        Ok(Step {
            parts: step_parts,
            usage,
            finish_reason: reason,
        })
    }

    fn prepare_tool_call(
        &mut self,
        registrar: Option<&SourceRegistrar>,
        tool_call_id: &str,
        tool_name: &str,
        input: &Value,
    ) -> Option<Part> {
        let Some(tool) = self
            .config
            .tools
            .iter()
            .find(|tool| tool.spec.name == tool_name)
        else {
            let error = SkeinError::new(
                SkeinErrorCode::ToolNotFound,
                format!("Tool '{tool_name}' not found"),
            );
            warn!(tool_call_id, tool_name, "tool call rejected");
            return Some(Part::tool_error(tool_call_id, json!({ "error": error })));
        };

        if let Err(error) = skein_stream::validate_tool_input(&tool.spec, tool_call_id, input) {
            warn!(tool_call_id, tool_name, "tool input failed validation");
            return Some(Part::tool_error(tool_call_id, json!({ "error": error })));
        }

        let Some(registrar) = registrar else {
            let error = SkeinError::new(
                SkeinErrorCode::Protocol,
                "Tool call arrived after step finish",
            );
            return Some(Part::tool_error(tool_call_id, json!({ "error": error })));
        };

        let approval = if self.config.approval_policy.requires_approval(tool_name) {
            self.approval_seq += 1;
            let approval_id = format!("approval-{}", self.approval_seq);
            let receiver = self.broker.register(&approval_id);
            Some((approval_id, receiver))
        } else {
            None
        };

        tokio::spawn(execute_tool_call(
            Arc::clone(&tool.execute),
            tool_call_id.to_string(),
            tool_name.to_string(),
            input.clone(),
            registrar.open_writer(),
            approval,
            self.signal.clone(),
        ));
        None
    }

    fn append_step_messages(&mut self, step: &Step) {
        let call_parts: Vec<Part> = step
            .parts
            .iter()
            .filter(|part| !matches!(part, Part::ToolResult { .. }))
            .cloned()
            .collect();
        self.conversation.push(Message::from_parts(
            self.message_id.clone(),
            Role::Assistant,
            &call_parts,
        ));

        let calls: HashMap<String, (String, Value, bool)> = step
            .tool_calls()
            .into_iter()
            .map(|call| {
                (
                    call.tool_call_id,
                    (call.tool_name, call.input, call.provider_executed),
                )
            })
            .collect();
        for part in &step.parts {
            if let Part::ToolResult {
                tool_call_id,
                state: ToolResultState::Final,
                output,
                is_error,
            } = part
            {
                let (tool_name, input, provider_executed) = calls
                    .get(tool_call_id)
                    .cloned()
                    .unwrap_or_else(|| (String::new(), Value::Null, false));
                let mut message = Message::new(format!("{tool_call_id}-result"), Role::Tool);
                message.parts.push(MessagePart::ToolInvocation {
                    tool_call_id: tool_call_id.clone(),
                    tool_name,
                    input,
                    output: Some(output.clone()),
                    is_error: *is_error,
                    provider_executed,
                });
                self.conversation.push(message);
            }
        }
    }

    async fn finalize_object(&mut self, reason: FinishReason) -> FinishReason {
        let Some(schema) = self.response_schema.clone() else {
            return reason;
        };
        if reason != FinishReason::Stop {
            return reason;
        }
        let text = self
            .object
            .as_ref()
            .map(|accumulator| accumulator.text().to_string())
            .unwrap_or_default();

        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(error) => {
                let error = SkeinError::new(
                    SkeinErrorCode::SchemaInvalid,
                    format!("Structured output is not complete JSON: {error}"),
                );
                self.emit(Part::error(error.as_compact_json())).await;
                return FinishReason::Error;
            }
        };
        if let Err(error) = skein_stream::validate_object(&schema, &value) {
            self.emit(Part::error(error.as_compact_json())).await;
            return FinishReason::Error;
        }

        reason
    }

    async fn emit(&mut self, part: Part) {
        self.appender.append(&part).await;
        self.emitted.push(part.clone());
        self.stream.push(part);
    }

    fn is_aborted(&self) -> bool {
        self.signal
            .as_ref()
            .map(|signal| signal.is_aborted())
            .unwrap_or(false)
    }
}

struct StoreAppender {
    serial: SerialJobExecutor,
    store: Option<StoreRef>,
    stream_id: Option<String>,
}

impl StoreAppender {
    /// Queues the chunk append; the serial executor keeps persistence order
    /// identical to emit order without blocking on the store itself.
    async fn append(&self, part: &Part) {
        let (Some(store), Some(stream_id)) = (&self.store, &self.stream_id) else {
            return;
        };
        match encode_chunk(part) {
            Ok(chunk) => {
                let store = Arc::clone(store);
                let stream_id = stream_id.clone();
                self.serial
                    .run(async move { store.append(&stream_id, chunk).await })
                    .await;
            }
            Err(error) => warn!(error = %error, "failed to encode part for persistence"),
        }
    }
}

fn approval_denied(step: &Step) -> bool {
    step.parts
        .iter()
        .any(|part| matches!(part, Part::ToolApprovalResponse { approved: false, .. }))
}

async fn execute_tool_call(
    executor: ToolExecuteFn,
    tool_call_id: String,
    tool_name: String,
    input: Value,
    writer: PartWriter,
    approval: Option<(String, oneshot::Receiver<ApprovalDecision>)>,
    signal: Option<AbortSignal>,
) {
    if let Some((approval_id, receiver)) = approval {
        let request = Part::ToolApprovalRequest {
            approval_id: approval_id.clone(),
            tool_call_id: tool_call_id.clone(),
        };
        if writer.write(request).await.is_err() {
            return;
        }

        // No timeout here: cancellation comes only from the caller's signal.
        let decision = match &signal {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => None,
                decision = receiver => decision.ok(),
            },
            None => receiver.await.ok(),
        };
        let Some(decision) = decision else {
            let _ = writer
                .write(Part::tool_error(
                    tool_call_id,
                    json!({ "error": "Tool call aborted before approval" }),
                ))
                .await;
            return;
        };

        let _ = writer
            .write(Part::ToolApprovalResponse {
                approval_id,
                approved: decision.approved,
                reason: decision.reason.clone(),
            })
            .await;
        if !decision.approved {
            let reason = decision
                .reason
                .unwrap_or_else(|| "Tool call was not approved".to_string());
            let _ = writer
                .write(Part::tool_error(tool_call_id, json!({ "error": reason })))
                .await;
            return;
        }
    }

    let progress = ToolProgress::new(tool_call_id.clone(), writer.clone());
    let started = Instant::now();
    let future = executor.execute(tool_call_id.clone(), input, progress);
    let outcome = match &signal {
        Some(signal) => tokio::select! {
            _ = signal.cancelled() => Err(SkeinError::new(
                SkeinErrorCode::Aborted,
                "Tool execution aborted",
            )),
            result = future => result,
        },
        None => future.await,
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    let part = match outcome {
        Ok(output) => {
            debug!(
                tool_call_id = tool_call_id.as_str(),
                tool_name = tool_name.as_str(),
                duration_ms,
                "tool execution finished"
            );
            Part::tool_result(tool_call_id, output)
        }
        Err(error) => {
            debug!(
                tool_call_id = tool_call_id.as_str(),
                tool_name = tool_name.as_str(),
                duration_ms,
                error = error.message.as_str(),
                "tool execution failed"
            );
            Part::tool_error(tool_call_id, json!({ "error": error }))
        }
    };
    let _ = writer.write(part).await;
}
