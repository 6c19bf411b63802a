use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use skein_loop::{
    layer_capability, resume_run, run_loop, AbortController, AbortSignal, ApprovalDecision,
    ApprovalPolicy, CapabilityLayer, CapabilityRef, InMemoryStreamStore, LoggingLayer, MaxSteps,
    RunConfig, RunHandle, RunRequest, StepRequest, Tool, ToolExecuteFn, ToolFuture, ToolProgress,
};
use skein_stream::{
    FinishReason, Message, Part, PartStream, PartStreamWriter, Role, SkeinError, ToolResultState,
    Usage,
};
use tokio::time::sleep;

fn sample_usage() -> Usage {
    Usage {
        input: 100,
        output: 20,
        cache_read: 0,
        cache_write: 0,
        reasoning: 0,
        total_tokens: 120,
    }
}

fn text_step(id: &str, chunks: &[&str]) -> Vec<Part> {
    let mut parts = vec![Part::TextStart { id: id.to_string() }];
    for chunk in chunks {
        parts.push(Part::text_delta(id, *chunk));
    }
    parts.push(Part::TextEnd { id: id.to_string() });
    parts.push(Part::StepFinish {
        reason: FinishReason::Stop,
        usage: sample_usage(),
    });
    parts
}

fn tool_step(tool_call_id: &str, tool_name: &str, input: Value) -> Vec<Part> {
    vec![
        Part::tool_call(tool_call_id, tool_name, input),
        Part::StepFinish {
            reason: FinishReason::ToolCalls,
            usage: sample_usage(),
        },
    ]
}

fn scripted_capability(scripts: Vec<Vec<Part>>) -> CapabilityRef {
    let calls = Arc::new(AtomicUsize::new(0));
    Arc::new(
        move |_request: StepRequest, _signal: Option<AbortSignal>| -> Result<PartStream, SkeinError> {
            let index = calls.fetch_add(1, Ordering::SeqCst);
            let stream = PartStream::new();
            let writer = PartStreamWriter::new(stream.clone());
            for part in scripts.get(index).cloned().unwrap_or_default() {
                writer.push(part);
            }
            writer.close(None);
            Ok(stream)
        },
    )
}

fn echo_tool() -> Tool {
    let execute: ToolExecuteFn = Arc::new(
        |_tool_call_id: String, input: Value, _progress: ToolProgress| -> ToolFuture {
            Box::pin(async move { Ok(json!({ "echo": input })) })
        },
    );
    Tool::new("echo", "Echoes its input", json!({"type": "object"}), execute)
}

fn slow_tool(name: &str) -> Tool {
    let execute: ToolExecuteFn = Arc::new(
        |_tool_call_id: String, _input: Value, _progress: ToolProgress| -> ToolFuture {
            Box::pin(async move {
                sleep(Duration::from_secs(3600)).await;
                Ok(json!({"done": true}))
            })
        },
    );
    Tool::new(name, "Sleeps forever", json!({"type": "object"}), execute)
}

async fn drain(handle: &RunHandle) -> Vec<Part> {
    let mut parts = Vec::new();
    while let Some(part) = handle.next().await {
        parts.push(part);
    }
    parts
}

fn count_step_starts(parts: &[Part]) -> usize {
    parts
        .iter()
        .filter(|part| matches!(part, Part::StepStart))
        .count()
}

fn finish_reason(parts: &[Part]) -> Option<FinishReason> {
    parts.iter().find_map(|part| match part {
        Part::Finish { reason } => Some(*reason),
        _ => None,
    })
}

fn final_tool_results<'a>(parts: &'a [Part], tool_call_id: &str) -> Vec<&'a Part> {
    parts
        .iter()
        .filter(|part| {
            matches!(
                part,
                Part::ToolResult { tool_call_id: id, state: ToolResultState::Final, .. }
                    if id == tool_call_id
            )
        })
        .collect()
}

#[tokio::test]
async fn plain_text_run_completes_in_one_step() {
    let capability = scripted_capability(vec![text_step("t1", &["Hello, ", "world."])]);
    // A logging layer must be transparent to the part stream.
    let layers: Vec<Arc<dyn CapabilityLayer>> = vec![Arc::new(LoggingLayer)];
    let capability = layer_capability(capability, &layers);
    let handle = run_loop(
        RunRequest::new("m1"),
        RunConfig::new(capability),
        None,
    );

    let parts = drain(&handle).await;
    assert_eq!(count_step_starts(&parts), 1);
    assert_eq!(finish_reason(&parts), Some(FinishReason::Stop));

    let message = handle.message().await.expect("final message");
    assert_eq!(message.id, "m1");
    assert_eq!(message.role, Role::Assistant);
    assert_eq!(message.text(), "Hello, world.");
}

#[tokio::test]
async fn tool_call_results_feed_the_next_step() {
    let capability = scripted_capability(vec![
        tool_step("tc-1", "echo", json!({"q": "x"})),
        text_step("t1", &["done"]),
    ]);
    let mut config = RunConfig::new(capability);
    config.tools = vec![echo_tool()];

    let handle = run_loop(RunRequest::new("m1"), config, None);
    let parts = drain(&handle).await;

    assert_eq!(count_step_starts(&parts), 2);
    assert_eq!(finish_reason(&parts), Some(FinishReason::Stop));

    let results = final_tool_results(&parts, "tc-1");
    assert_eq!(results.len(), 1, "exactly one terminal result per call");
    let Part::ToolResult { output, is_error, .. } = results[0] else {
        unreachable!()
    };
    assert!(!is_error);
    assert_eq!(output, &json!({"echo": {"q": "x"}}));

    let message = handle.message().await.expect("final message");
    assert!(message.parts.iter().any(|part| matches!(
        part,
        skein_stream::MessagePart::ToolInvocation { output: Some(_), .. }
    )));
}

#[tokio::test]
async fn max_steps_stop_condition_bounds_a_tool_loop() {
    // A tool that always asks for another round would loop forever without
    // the step bound.
    let capability = scripted_capability(vec![
        tool_step("tc-1", "echo", json!({})),
        tool_step("tc-2", "echo", json!({})),
        tool_step("tc-3", "echo", json!({})),
    ]);
    let mut config = RunConfig::new(capability);
    config.tools = vec![echo_tool()];
    config.stop_when = Arc::new(MaxSteps(3));

    let handle = run_loop(RunRequest::new("m1"), config, None);
    let parts = drain(&handle).await;

    assert_eq!(count_step_starts(&parts), 3);
    let reason = finish_reason(&parts).unwrap();
    assert_ne!(reason, FinishReason::Stop);
    assert_eq!(reason, FinishReason::ToolCalls);
}

#[tokio::test]
async fn denied_approval_yields_an_error_result_and_no_retry_step() {
    // The second script would only run if the loop (incorrectly) retried.
    let capability = scripted_capability(vec![
        tool_step("tc-1", "echo", json!({"q": "x"})),
        tool_step("tc-9", "echo", json!({"q": "retry"})),
    ]);
    let mut config = RunConfig::new(capability);
    config.tools = vec![echo_tool()];
    config.approval_policy = ApprovalPolicy::Always;

    let handle = run_loop(RunRequest::new("m1"), config, None);

    let mut parts = Vec::new();
    while let Some(part) = handle.next().await {
        if let Part::ToolApprovalRequest { approval_id, .. } = &part {
            handle
                .respond(approval_id, ApprovalDecision::deny("not allowed"))
                .unwrap();
        }
        parts.push(part);
    }

    assert!(parts
        .iter()
        .any(|part| matches!(part, Part::ToolApprovalResponse { approved: false, .. })));

    let results = final_tool_results(&parts, "tc-1");
    assert_eq!(results.len(), 1);
    let Part::ToolResult { output, is_error, .. } = results[0] else {
        unreachable!()
    };
    assert!(*is_error);
    assert_eq!(output["error"], "not allowed");

    assert_eq!(count_step_starts(&parts), 1, "no retry step after denial");
    assert!(final_tool_results(&parts, "tc-9").is_empty());
}

#[tokio::test]
async fn approved_tool_runs_after_the_caller_consents() {
    let capability = scripted_capability(vec![
        tool_step("tc-1", "echo", json!({"q": "x"})),
        text_step("t1", &["done"]),
    ]);
    let mut config = RunConfig::new(capability);
    config.tools = vec![echo_tool()];
    config.approval_policy = ApprovalPolicy::per_tool(["echo"]);

    let handle = run_loop(RunRequest::new("m1"), config, None);
    let mut parts = Vec::new();
    while let Some(part) = handle.next().await {
        if let Part::ToolApprovalRequest { approval_id, .. } = &part {
            handle
                .respond(approval_id, ApprovalDecision::approve())
                .unwrap();
        }
        parts.push(part);
    }

    let results = final_tool_results(&parts, "tc-1");
    assert_eq!(results.len(), 1);
    let Part::ToolResult { is_error, .. } = results[0] else {
        unreachable!()
    };
    assert!(!*is_error);
    assert_eq!(finish_reason(&parts), Some(FinishReason::Stop));
}

#[tokio::test]
async fn responding_to_an_unissued_approval_fails_fast() {
    let capability = scripted_capability(vec![text_step("t1", &["hi"])]);
    let handle = run_loop(RunRequest::new("m1"), RunConfig::new(capability), None);

    let error = handle
        .respond("approval-999", ApprovalDecision::approve())
        .unwrap_err();
    assert_eq!(error.code, skein_stream::SkeinErrorCode::ApprovalUnknown);
    drain(&handle).await;
}

#[tokio::test]
async fn abort_preserves_streamed_output_and_reports_unresolved_calls() {
    let mut first_step = vec![
        Part::TextStart {
            id: "t1".to_string(),
        },
        Part::text_delta("t1", "partial answer"),
    ];
    first_step.extend(tool_step("tc-1", "stall", json!({})));

    let capability = scripted_capability(vec![first_step]);
    let mut config = RunConfig::new(capability);
    config.tools = vec![slow_tool("stall")];

    let controller = AbortController::new();
    let handle = run_loop(RunRequest::new("m1"), config, Some(controller.signal()));

    let mut parts = Vec::new();
    while let Some(part) = handle.next().await {
        if matches!(part, Part::ToolCall { .. }) {
            controller.abort();
        }
        parts.push(part);
    }

    // Already-forwarded output is never retracted.
    assert!(parts
        .iter()
        .any(|part| matches!(part, Part::TextDelta { delta, .. } if delta == "partial answer")));
    assert_eq!(finish_reason(&parts), Some(FinishReason::Aborted));

    // The unresolved call is reported, not silently dropped.
    let results = final_tool_results(&parts, "tc-1");
    assert_eq!(results.len(), 1);
    let Part::ToolResult { is_error, .. } = results[0] else {
        unreachable!()
    };
    assert!(*is_error);
}

#[tokio::test]
async fn progressive_tool_updates_surface_partial_states_in_order() {
    let execute: ToolExecuteFn = Arc::new(
        |_tool_call_id: String, _input: Value, progress: ToolProgress| -> ToolFuture {
            Box::pin(async move {
                progress.update(json!({"pct": 50})).await?;
                progress.update(json!({"pct": 90})).await?;
                Ok(json!({"pct": 100}))
            })
        },
    );
    let tool = Tool::new("report", "Reports progress", json!({"type": "object"}), execute);

    let capability = scripted_capability(vec![
        tool_step("tc-1", "report", json!({})),
        text_step("t1", &["done"]),
    ]);
    let mut config = RunConfig::new(capability);
    config.tools = vec![tool];

    let handle = run_loop(RunRequest::new("m1"), config, None);
    let parts = drain(&handle).await;

    let states: Vec<(ToolResultState, Value)> = parts
        .iter()
        .filter_map(|part| match part {
            Part::ToolResult { state, output, .. } => Some((*state, output.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            (ToolResultState::Partial, json!({"pct": 50})),
            (ToolResultState::Partial, json!({"pct": 90})),
            (ToolResultState::Final, json!({"pct": 100})),
        ]
    );
}

#[tokio::test]
async fn invalid_tool_input_fails_that_call_only() {
    let execute: ToolExecuteFn = Arc::new(
        |_tool_call_id: String, _input: Value, _progress: ToolProgress| -> ToolFuture {
            Box::pin(async move { Ok(json!({"hits": 1})) })
        },
    );
    let tool = Tool::new(
        "search",
        "Searches the index",
        json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        }),
        execute,
    );

    let capability = scripted_capability(vec![
        tool_step("tc-1", "search", json!({"q": 1})),
        text_step("t1", &["recovered"]),
    ]);
    let mut config = RunConfig::new(capability);
    config.tools = vec![tool];

    let handle = run_loop(RunRequest::new("m1"), config, None);
    let parts = drain(&handle).await;

    let results = final_tool_results(&parts, "tc-1");
    assert_eq!(results.len(), 1);
    let Part::ToolResult { output, is_error, .. } = results[0] else {
        unreachable!()
    };
    assert!(*is_error);
    assert_eq!(output["error"]["code"], "tool_input_invalid");

    // The loop recovered and produced the follow-up step.
    assert_eq!(finish_reason(&parts), Some(FinishReason::Stop));
    assert_eq!(handle.message().await.unwrap().text(), "recovered");
}

#[tokio::test]
async fn unknown_tool_is_an_error_result_not_a_crash() {
    let capability = scripted_capability(vec![
        tool_step("tc-1", "missing", json!({})),
        text_step("t1", &["ok"]),
    ]);
    let handle = run_loop(RunRequest::new("m1"), RunConfig::new(capability), None);
    let parts = drain(&handle).await;

    let results = final_tool_results(&parts, "tc-1");
    assert_eq!(results.len(), 1);
    let Part::ToolResult { output, is_error, .. } = results[0] else {
        unreachable!()
    };
    assert!(*is_error);
    assert_eq!(output["error"]["code"], "tool_not_found");
    assert_eq!(finish_reason(&parts), Some(FinishReason::Stop));
}

#[tokio::test]
async fn provider_executed_results_pass_through_unchanged() {
    let capability = scripted_capability(vec![
        vec![
            Part::ToolCall {
                tool_call_id: "tc-1".to_string(),
                tool_name: "web_search".to_string(),
                input: json!({"q": "weather"}),
                provider_executed: true,
            },
            Part::tool_result("tc-1", json!({"summary": "sunny"})),
            Part::StepFinish {
                reason: FinishReason::ToolCalls,
                usage: sample_usage(),
            },
        ],
        text_step("t1", &["sunny today"]),
    ]);

    // No local tool named web_search is configured; the provider ran it.
    let handle = run_loop(RunRequest::new("m1"), RunConfig::new(capability), None);
    let parts = drain(&handle).await;

    let results = final_tool_results(&parts, "tc-1");
    assert_eq!(results.len(), 1);
    let Part::ToolResult { output, is_error, .. } = results[0] else {
        unreachable!()
    };
    assert!(!*is_error);
    assert_eq!(output, &json!({"summary": "sunny"}));
    assert_eq!(finish_reason(&parts), Some(FinishReason::Stop));
}

#[tokio::test]
async fn capability_failure_is_fatal_but_keeps_forwarded_output() {
    let capability = scripted_capability(vec![vec![
        Part::TextStart {
            id: "t1".to_string(),
        },
        Part::text_delta("t1", "so far"),
        Part::error("upstream disconnected"),
    ]]);
    let handle = run_loop(RunRequest::new("m1"), RunConfig::new(capability), None);
    let parts = drain(&handle).await;

    assert!(parts
        .iter()
        .any(|part| matches!(part, Part::TextDelta { delta, .. } if delta == "so far")));
    assert_eq!(finish_reason(&parts), Some(FinishReason::Error));
    assert!(parts.iter().any(|part| matches!(part, Part::Error { .. })));

    // The partially-built message is still accessible.
    let message = handle.message().await.expect("partial message");
    assert_eq!(message.text(), "so far");
}

#[tokio::test]
async fn structured_object_mode_streams_changed_partials() {
    let chunks = [r#"{"a""#, r#": 1, "#, r#""b": "h"#, r#"i"}"#];
    let capability = scripted_capability(vec![text_step("t1", &chunks)]);

    let mut request = RunRequest::new("m1");
    request.response_schema = Some(json!({
        "type": "object",
        "properties": {"a": {"type": "integer"}, "b": {"type": "string"}},
        "required": ["a", "b"]
    }));

    let handle = run_loop(request, RunConfig::new(capability), None);
    let parts = drain(&handle).await;

    let objects: Vec<Value> = parts
        .iter()
        .filter_map(|part| match part {
            Part::Data { name, data } if name == "object" => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert!(!objects.is_empty());
    assert_eq!(objects.last().unwrap(), &json!({"a": 1, "b": "hi"}));
    // Partials only grow: every surfaced field stays surfaced.
    for pair in objects.windows(2) {
        for key in pair[0].as_object().unwrap().keys() {
            assert!(pair[1].as_object().unwrap().contains_key(key));
        }
    }
    assert_eq!(finish_reason(&parts), Some(FinishReason::Stop));
}

#[tokio::test]
async fn structured_object_failing_its_schema_is_a_terminal_error() {
    let capability = scripted_capability(vec![text_step("t1", &[r#"{"a": 1}"#])]);

    let mut request = RunRequest::new("m1");
    request.response_schema = Some(json!({
        "type": "object",
        "properties": {"a": {"type": "integer"}, "b": {"type": "string"}},
        "required": ["a", "b"]
    }));

    let handle = run_loop(request, RunConfig::new(capability), None);
    let parts = drain(&handle).await;

    assert_eq!(finish_reason(&parts), Some(FinishReason::Error));
    assert!(parts.iter().any(|part| matches!(part, Part::Error { .. })));
}

#[tokio::test]
async fn persisted_chunks_replay_into_the_same_part_sequence() {
    let store = Arc::new(InMemoryStreamStore::new());
    let capability = scripted_capability(vec![
        tool_step("tc-1", "echo", json!({"q": "x"})),
        text_step("t1", &["persisted ", "answer"]),
    ]);
    let mut config = RunConfig::new(capability);
    config.tools = vec![echo_tool()];
    config.store = Some(store.clone());
    config.stream_id = Some("run-1".to_string());

    let handle = run_loop(RunRequest::new("m1"), config, None);
    let live = drain(&handle).await;

    // Appends are queued through the serial executor; let the tail land.
    sleep(Duration::from_millis(100)).await;

    let resumed_stream = resume_run(store, "run-1");
    let mut resumed = Vec::new();
    while let Some(part) = resumed_stream.next().await {
        resumed.push(part);
    }
    assert_eq!(resumed, live);

    let resumed_message = resumed_stream.result().await.expect("resumed message");
    let live_message = handle.message().await.expect("live message");
    assert_eq!(resumed_message.id, live_message.id);
    assert_eq!(resumed_message.text(), live_message.text());
}

#[tokio::test]
async fn raw_provider_chunks_are_filtered_unless_requested() {
    let step = vec![
        Part::Raw {
            payload: json!({"provider": "native-event"}),
        },
        Part::TextStart {
            id: "t1".to_string(),
        },
        Part::text_delta("t1", "hi"),
        Part::TextEnd {
            id: "t1".to_string(),
        },
        Part::StepFinish {
            reason: FinishReason::Stop,
            usage: sample_usage(),
        },
    ];

    let handle = run_loop(
        RunRequest::new("m1"),
        RunConfig::new(scripted_capability(vec![step.clone()])),
        None,
    );
    let parts = drain(&handle).await;
    assert!(!parts.iter().any(|part| matches!(part, Part::Raw { .. })));

    let mut config = RunConfig::new(scripted_capability(vec![step]));
    config.include_raw_chunks = true;
    let handle = run_loop(RunRequest::new("m1"), config, None);
    let parts = drain(&handle).await;
    assert!(parts.iter().any(|part| matches!(part, Part::Raw { .. })));
}

#[tokio::test]
async fn run_messages_carry_the_conversation_into_each_step() {
    // Capture the messages the capability sees on its second step.
    let seen = Arc::new(std::sync::Mutex::new(Vec::<Vec<Message>>::new()));
    let seen_in_capability = Arc::clone(&seen);
    let calls = Arc::new(AtomicUsize::new(0));
    let capability: CapabilityRef = Arc::new(
        move |request: StepRequest, _signal: Option<AbortSignal>| -> Result<PartStream, SkeinError> {
            seen_in_capability.lock().unwrap().push(request.messages);
            let index = calls.fetch_add(1, Ordering::SeqCst);
            let script = if index == 0 {
                tool_step("tc-1", "echo", json!({"q": "x"}))
            } else {
                text_step("t1", &["done"])
            };
            let stream = PartStream::new();
            for part in script {
                stream.push(part);
            }
            stream.end(None);
            Ok(stream)
        },
    );

    let mut config = RunConfig::new(capability);
    config.tools = vec![echo_tool()];
    let mut request = RunRequest::new("m1");
    request.messages = vec![Message::user("u1", "please search")];

    let handle = run_loop(request, config, None);
    drain(&handle).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].len(), 1, "first step sees the original message");
    // Second step: original + assistant tool call + tool result.
    assert_eq!(seen[1].len(), 3);
    assert_eq!(seen[1][1].role, Role::Assistant);
    assert_eq!(seen[1][2].role, Role::Tool);
}
