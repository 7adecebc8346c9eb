use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Pipeline stage a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Authenticate,
    ListTags,
    ResolveManifest,
    FetchConfig,
    FetchLayer,
    Assemble,
    Cleanup,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Authenticate => "authenticate",
            Self::ListTags => "list-tags",
            Self::ResolveManifest => "resolve-manifest",
            Self::FetchConfig => "fetch-config",
            Self::FetchLayer => "fetch-layer",
            Self::Assemble => "assemble",
            Self::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// Outcome carried by a progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Started,
    Completed,
    /// Bytes written for a completed item
    Transferred { bytes: u64 },
    Failed { error: String },
}

/// Structured progress event emitted by the pull pipeline.
///
/// The core never formats text for humans; presentation is left to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullEvent {
    /// Pipeline stage
    pub stage: Stage,

    /// Item identifier (reference, digest, or archive path)
    pub item: String,

    /// What happened
    pub outcome: Outcome,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl PullEvent {
    pub fn new(stage: Stage, item: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            stage,
            item: item.into(),
            outcome,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn started(stage: Stage, item: impl Into<String>) -> Self {
        Self::new(stage, item, Outcome::Started)
    }

    pub fn completed(stage: Stage, item: impl Into<String>) -> Self {
        Self::new(stage, item, Outcome::Completed)
    }

    pub fn failed(stage: Stage, item: impl Into<String>, error: impl ToString) -> Self {
        Self::new(
            stage,
            item,
            Outcome::Failed {
                error: error.to_string(),
            },
        )
    }

    /// Whether this event describes a single blob rather than a whole stage.
    pub fn is_item_level(&self) -> bool {
        matches!(self.stage, Stage::FetchLayer)
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<PullEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: PullEvent) {
        tracing::trace!(stage = %event.stage, item = %event.item, "pull event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PullEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
