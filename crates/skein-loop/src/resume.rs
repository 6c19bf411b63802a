use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use skein_stream::{decode_chunk, reconstruct, Part, PartStream, SkeinError};

/// Append-only chunk log keyed by stream id. The core only ever calls
/// `append` while producing and `resume` when a client re-attaches;
/// persistence itself belongs to the implementor.
#[async_trait]
pub trait ResumableStreamStore: Send + Sync {
    async fn append(&self, stream_id: &str, chunk: String) -> Result<(), SkeinError>;
    async fn resume(&self, stream_id: &str) -> Result<Vec<String>, SkeinError>;
}

pub type StoreRef = Arc<dyn ResumableStreamStore>;

#[derive(Default)]
pub struct InMemoryStreamStore {
    chunks: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResumableStreamStore for InMemoryStreamStore {
    async fn append(&self, stream_id: &str, chunk: String) -> Result<(), SkeinError> {
        self.chunks
            .lock()
            .expect("store mutex poisoned")
            .entry(stream_id.to_string())
            .or_default()
            .push(chunk);
        Ok(())
    }

    async fn resume(&self, stream_id: &str) -> Result<Vec<String>, SkeinError> {
        Ok(self
            .chunks
            .lock()
            .expect("store mutex poisoned")
            .get(stream_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Replays a persisted chunk log as a part stream, ending with the
/// reconstructed message. Unknown event types in the log are skipped.
pub fn resume_run(store: StoreRef, stream_id: &str) -> PartStream {
    let stream = PartStream::new();
    let output = stream.clone();
    let stream_id = stream_id.to_string();

    tokio::spawn(async move {
        let chunks = match store.resume(&stream_id).await {
            Ok(chunks) => chunks,
            Err(error) => {
                output.push(Part::error(error.as_compact_json()));
                output.end(None);
                return;
            }
        };

        let mut parts = Vec::new();
        for chunk in chunks {
            match decode_chunk(&chunk) {
                Ok(Some(part)) => {
                    parts.push(part.clone());
                    output.push(part);
                }
                Ok(None) => {}
                Err(error) => {
                    output.push(Part::error(error.as_compact_json()));
                    break;
                }
            }
        }

        output.end(reconstruct(&parts).pop());
    });

    stream
}
