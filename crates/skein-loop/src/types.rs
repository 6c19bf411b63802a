use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use skein_stream::{
    Message, Part, PartStream, PartWriter, SkeinError, ToolResultState, ToolSpec,
};
use tokio::sync::Notify;

/// One request/response cycle's worth of input to the model capability.
#[derive(Clone)]
pub struct StepRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub response_schema: Option<Value>,
}

/// The model capability: given a step request, produce a live part stream
/// ending in `step-finish` (or `error`).
pub trait GenerateCapability: Send + Sync {
    fn generate(
        &self,
        request: StepRequest,
        signal: Option<AbortSignal>,
    ) -> Result<PartStream, SkeinError>;
}

impl<F> GenerateCapability for F
where
    F: Fn(StepRequest, Option<AbortSignal>) -> Result<PartStream, SkeinError>
        + Send
        + Sync
        + 'static,
{
    fn generate(
        &self,
        request: StepRequest,
        signal: Option<AbortSignal>,
    ) -> Result<PartStream, SkeinError> {
        (self)(request, signal)
    }
}

pub type CapabilityRef = Arc<dyn GenerateCapability>;

/// Handle a tool executor uses to surface intermediate states while it runs.
/// Each update becomes a `tool-result` part in the `partial` state.
#[derive(Clone)]
pub struct ToolProgress {
    tool_call_id: String,
    writer: PartWriter,
}

impl ToolProgress {
    pub fn new(tool_call_id: String, writer: PartWriter) -> Self {
        Self {
            tool_call_id,
            writer,
        }
    }

    pub async fn update(&self, output: Value) -> Result<(), SkeinError> {
        self.writer
            .write(Part::ToolResult {
                tool_call_id: self.tool_call_id.clone(),
                state: ToolResultState::Partial,
                output,
                is_error: false,
            })
            .await
    }
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, SkeinError>> + Send>>;

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        tool_call_id: String,
        input: Value,
        progress: ToolProgress,
    ) -> Result<Value, SkeinError>;
}

#[async_trait]
impl<F> ToolExecutor for F
where
    F: Fn(String, Value, ToolProgress) -> ToolFuture + Send + Sync + 'static,
{
    async fn execute(
        &self,
        tool_call_id: String,
        input: Value,
        progress: ToolProgress,
    ) -> Result<Value, SkeinError> {
        (self)(tool_call_id, input, progress).await
    }
}

pub type ToolExecuteFn = Arc<dyn ToolExecutor>;

#[derive(Clone)]
pub struct Tool {
    pub spec: ToolSpec,
    pub provider_executed: bool,
    pub execute: ToolExecuteFn,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        execute: ToolExecuteFn,
    ) -> Self {
        Self {
            spec: ToolSpec {
                name: name.into(),
                description: description.into(),
                input_schema,
            },
            provider_executed: false,
            execute,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ApprovalPolicy {
    #[default]
    Never,
    Always,
    PerTool(HashSet<String>),
}

impl ApprovalPolicy {
    pub fn per_tool<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::PerTool(names.into_iter().map(Into::into).collect())
    }

    pub fn requires_approval(&self, tool_name: &str) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::PerTool(names) => names.contains(tool_name),
        }
    }
}

#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        // Register before checking, so an abort landing in between is not
        // lost.
        let mut notified = std::pin::pin!(self.inner.notify.notified());
        notified.as_mut().enable();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }
}

pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal {
                inner: Arc::new(AbortInner {
                    aborted: AtomicBool::new(false),
                    notify: Notify::new(),
                }),
            },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(&self) {
        self.signal.inner.aborted.store(true, Ordering::SeqCst);
        self.signal.inner.notify.notify_waiters();
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-side description of a run.
#[derive(Clone)]
pub struct RunRequest {
    pub message_id: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub response_schema: Option<Value>,
}

impl RunRequest {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            system_prompt: None,
            messages: Vec::new(),
            response_schema: None,
        }
    }
}

#[derive(Clone)]
pub struct RunConfig {
    pub capability: CapabilityRef,
    pub tools: Vec<Tool>,
    pub stop_when: Arc<dyn crate::step::StopCondition>,
    pub approval_policy: ApprovalPolicy,
    pub include_raw_chunks: bool,
    pub store: Option<crate::resume::StoreRef>,
    pub stream_id: Option<String>,
}

impl RunConfig {
    pub fn new(capability: CapabilityRef) -> Self {
        Self {
            capability,
            tools: Vec::new(),
            stop_when: Arc::new(crate::step::NoPendingToolCalls),
            approval_policy: ApprovalPolicy::Never,
            include_raw_chunks: false,
            store: None,
            stream_id: None,
        }
    }
}
