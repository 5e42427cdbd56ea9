//! Pipeline event stream
//!
//! External subscribers observe the pipeline through a broadcast
//! channel of typed events. Delivery is at-least-once; per session the
//! order follows the underlying state changes.

use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted by the pipeline
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    SegmentReady {
        session_id: Uuid,
        index: usize,
        path: PathBuf,
        duration_secs: f64,
    },
    ManifestUpdated {
        session_id: Uuid,
        path: PathBuf,
    },
    TranscodeCompleted {
        session_id: Uuid,
        media_id: String,
        content_hash: String,
        manifest_url: String,
        segments_total: usize,
        duration_secs: f64,
    },
    TranscodeFailed {
        session_id: Uuid,
        media_id: String,
        error: String,
        content_hash: String,
    },
}

/// Broadcast bus for pipeline events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Lagging or absent subscribers are not errors.
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
