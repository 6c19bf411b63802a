use std::sync::Arc;

use skein_stream::{PartStream, SkeinError};
use tracing::{debug, warn};

use crate::types::{AbortSignal, CapabilityRef, GenerateCapability, StepRequest};

/// A capability-transforming stage. Layers compose by explicit ordered
/// wrapping; each stage sees the same `GenerateCapability` contract.
pub trait CapabilityLayer: Send + Sync {
    fn wrap(&self, inner: CapabilityRef) -> CapabilityRef;
}

/// Composes layers so the first layer in the slice sees requests first.
pub fn layer_capability(base: CapabilityRef, layers: &[Arc<dyn CapabilityLayer>]) -> CapabilityRef {
    layers
        .iter()
        .rev()
        .fold(base, |inner, layer| layer.wrap(inner))
}

/// Logs request and outcome metadata around the wrapped capability.
pub struct LoggingLayer;

impl CapabilityLayer for LoggingLayer {
    fn wrap(&self, inner: CapabilityRef) -> CapabilityRef {
        Arc::new(LoggingCapability { inner })
    }
}

struct LoggingCapability {
    inner: CapabilityRef,
}

impl GenerateCapability for LoggingCapability {
    fn generate(
        &self,
        request: StepRequest,
        signal: Option<AbortSignal>,
    ) -> Result<PartStream, SkeinError> {
        debug!(
            messages = request.messages.len(),
            tools = request.tools.len(),
            structured = request.response_schema.is_some(),
            "capability request"
        );
        match self.inner.generate(request, signal) {
            Ok(stream) => Ok(stream),
            Err(error) => {
                warn!(code = ?error.code, error = error.message.as_str(), "capability request failed");
                Err(error)
            }
        }
    }
}
