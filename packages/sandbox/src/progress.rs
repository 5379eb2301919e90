// ABOUTME: Progress reporting for long-running sandbox operations
// ABOUTME: Emits monotonic milestone values to an optional sink and never fails the caller

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Request accepted
pub const PROGRESS_ACCEPTED: u32 = 10;
/// Command composed, image available
pub const PROGRESS_COMPOSED: u32 = 25;
/// Environment started
pub const PROGRESS_STARTED: u32 = 50;
/// Increment per wait tick
pub const PROGRESS_TICK_STEP: u32 = 5;
/// Ticks never reach completion
pub const PROGRESS_TICK_CAP: u32 = 95;
pub const PROGRESS_DONE: u32 = 100;

/// Next tick value after `current`, saturating at the tick cap
pub fn next_tick(current: u32) -> u32 {
    (current + PROGRESS_TICK_STEP).min(PROGRESS_TICK_CAP)
}

/// Opaque correlation token supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressToken(String);

impl ProgressToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProgressToken {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ProgressToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub token: ProgressToken,
    pub progress: u32,
}

#[derive(Error, Debug)]
#[error("progress delivery failed: {0}")]
pub struct ProgressSendError(pub String);

/// Destination for progress notifications
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn send(&self, event: ProgressEvent) -> Result<(), ProgressSendError>;
}

/// Sink that forwards events over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressSink for ChannelProgressSink {
    async fn send(&self, event: ProgressEvent) -> Result<(), ProgressSendError> {
        self.tx
            .send(event)
            .map_err(|_| ProgressSendError("receiver dropped".to_string()))
    }
}

/// Per-request reporter; without a token every call is a silent no-op
pub struct ProgressReporter {
    token: Option<ProgressToken>,
    sink: Option<Arc<dyn ProgressSink>>,
    last: AtomicU32,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("token", &self.token)
            .field("last", &self.last.load(Ordering::Relaxed))
            .finish()
    }
}

impl ProgressReporter {
    pub fn new(token: Option<ProgressToken>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            token,
            sink: Some(sink),
            last: AtomicU32::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self {
            token: None,
            sink: None,
            last: AtomicU32::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some() && self.sink.is_some()
    }

    /// Highest value reported so far
    pub fn last(&self) -> u32 {
        self.last.load(Ordering::SeqCst)
    }

    pub async fn report(&self, value: u32) {
        let (Some(token), Some(sink)) = (&self.token, &self.sink) else {
            return;
        };

        let previous = self.last.fetch_max(value, Ordering::SeqCst);
        if value < previous {
            debug!(token = %token, value, previous, "Dropping out-of-order progress value");
            return;
        }

        let event = ProgressEvent {
            token: token.clone(),
            progress: value,
        };
        if let Err(e) = sink.send(event).await {
            warn!(token = %token, value, "Failed to send progress notification: {}", e);
        }
    }
}
