use serde_json::Value;

use crate::error::{SkeinError, SkeinErrorCode};
use crate::part::Part;

const KNOWN_EVENT_TYPES: &[&str] = &[
    "start",
    "step-start",
    "text-start",
    "text-delta",
    "text-end",
    "reasoning-start",
    "reasoning-delta",
    "reasoning-end",
    "tool-call",
    "tool-result",
    "tool-approval-request",
    "tool-approval-response",
    "source-url",
    "source-document",
    "file",
    "data",
    "raw",
    "step-finish",
    "finish",
    "error",
];

/// Serializes one part as a single-line wire event record.
pub fn encode_chunk(part: &Part) -> Result<String, SkeinError> {
    serde_json::to_string(part).map_err(|error| {
        SkeinError::new(
            SkeinErrorCode::Protocol,
            format!("Failed to encode part: {error}"),
        )
    })
}

/// Decodes one wire event record.
///
/// Records with an unknown `type` are forward-compatible no-ops and decode
/// to `Ok(None)`; records that are not event-shaped, or that carry a known
/// type with malformed fields, are protocol errors.
pub fn decode_chunk(line: &str) -> Result<Option<Part>, SkeinError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    match serde_json::from_str::<Part>(trimmed) {
        Ok(part) => Ok(Some(part)),
        Err(parse_error) => {
            let value: Value = serde_json::from_str(trimmed).map_err(|error| {
                SkeinError::new(
                    SkeinErrorCode::Protocol,
                    format!("Wire chunk is not a JSON event record: {error}"),
                )
            })?;
            let event_type = value.get("type").and_then(Value::as_str).ok_or_else(|| {
                SkeinError::new(
                    SkeinErrorCode::Protocol,
                    "Wire chunk has no event type discriminator",
                )
            })?;
            if KNOWN_EVENT_TYPES.contains(&event_type) {
                return Err(SkeinError::new(
                    SkeinErrorCode::Protocol,
                    format!("Malformed '{event_type}' event record: {parse_error}"),
                ));
            }
            Ok(None)
        }
    }
}

/// Encodes a part sequence as a newline-delimited event log.
pub fn encode_log(parts: &[Part]) -> Result<String, SkeinError> {
    let mut out = String::new();
    for part in parts {
        out.push_str(&encode_chunk(part)?);
        out.push('\n');
    }
    Ok(out)
}

/// Decodes a newline-delimited event log, skipping unknown event types.
pub fn decode_log(log: &str) -> Result<Vec<Part>, SkeinError> {
    let mut parts = Vec::new();
    for line in log.lines() {
        if let Some(part) = decode_chunk(line)? {
            parts.push(part);
        }
    }
    Ok(parts)
}
