//! Protocol types and stream machinery for multi-step model generation.

mod codec;
mod error;
mod event_stream;
mod merge;
mod message;
mod part;
mod partial_json;
mod serial;
mod validation;

pub use codec::{decode_chunk, decode_log, encode_chunk, encode_log};
pub use error::{SkeinError, SkeinErrorCode};
pub use event_stream::{EventStream, PartStream, PartStreamWriter};
pub use merge::{
    BoxedPartSource, ChannelSource, PartSource, PartWriter, SourceRegistrar, StreamMerger,
    StreamSource,
};
pub use message::{reconstruct, tool_calls_resolved, Message, MessagePart, Role};
pub use part::{FinishReason, Part, ToolResultState, ToolSpec, Usage};
pub use partial_json::{parse_partial, ObjectAccumulator};
pub use serial::SerialJobExecutor;
pub use validation::{validate_object, validate_tool_input};
