//! Multi-step generation loop: tool execution, approval gating, stop
//! conditions, and resumable output streams over `skein-stream`.

mod approval;
mod loop_runner;
mod middleware;
mod resume;
mod step;
mod types;

pub use approval::{ApprovalDecision, ApprovalResponder};
pub use loop_runner::{run_loop, RunHandle};
pub use middleware::{layer_capability, CapabilityLayer, LoggingLayer};
pub use resume::{resume_run, InMemoryStreamStore, ResumableStreamStore, StoreRef};
pub use step::{
    AnyOf, MaxSteps, NoPendingToolCalls, Step, StopCondition, ToolCallView, ToolCalled,
};
pub use types::{
    AbortController, AbortSignal, ApprovalPolicy, CapabilityRef, GenerateCapability, RunConfig,
    RunRequest, StepRequest, Tool, ToolExecuteFn, ToolExecutor, ToolFuture, ToolProgress,
};
