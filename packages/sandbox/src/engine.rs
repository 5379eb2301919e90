// ABOUTME: Container engine capability contract consumed by the lifecycle manager
// ABOUTME: Defines the engine trait and the value types that cross it

use crate::compose::Mount;
use crate::logs::Framing;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("No such container: {0}")]
    NotFound(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Create error: {0}")]
    Create(String),

    #[error("Start error: {0}")]
    Start(String),

    #[error("Wait error: {0}")]
    Wait(String),

    #[error("Exec error: {0}")]
    Exec(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Logs error: {0}")]
    Logs(String),

    #[error("Stop error: {0}")]
    Stop(String),

    #[error("Remove error: {0}")]
    Remove(String),

    #[error("List error: {0}")]
    List(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Everything needed to create one environment
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    /// Merged output, no channel framing
    pub tty: bool,
    pub open_stdin: bool,
}

/// Point-in-time view of an environment known to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Engine state word, e.g. `running`
    pub state: String,
    /// Human readable status, e.g. `Up 3 minutes`
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn new(stream: StreamType, data: Vec<u8>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            stream,
            data,
        }
    }
}

/// Log chunks already separated by the engine client
pub struct OutputStream {
    pub receiver: tokio::sync::mpsc::UnboundedReceiver<EngineResult<OutputChunk>>,
}

/// Log output in whichever shape the engine produces it
pub enum LogStream {
    Chunks(OutputStream),
    Framed {
        reader: Pin<Box<dyn AsyncRead + Send>>,
        framing: Framing,
    },
}

/// Container engine backend
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check whether the engine answers
    async fn is_available(&self) -> bool;

    /// Pull an image; pulling a cached image is a cheap no-op
    async fn pull_image(&self, image: &str) -> EngineResult<()>;

    /// Create (but do not start) an environment, returning its identifier
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;

    /// Block until the environment exits and return its exit code
    async fn wait_container(&self, id: &str) -> EngineResult<i64>;

    /// Run a command inside a running environment
    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        working_dir: Option<&str>,
    ) -> EngineResult<ExecResult>;

    /// Unpack a tar archive into `dest_dir` inside the environment
    async fn upload_archive(&self, id: &str, dest_dir: &str, archive: Vec<u8>)
        -> EngineResult<()>;

    /// Fetch `path` from the environment as a tar archive
    async fn download_archive(&self, id: &str, path: &str) -> EngineResult<Vec<u8>>;

    /// Full log output captured so far
    async fn logs(&self, id: &str) -> EngineResult<LogStream>;

    /// Stop with a grace period; an already stopped environment is not an error
    async fn stop_container(&self, id: &str, timeout_secs: u64) -> EngineResult<()>;

    /// Remove an environment and its volumes; a missing environment is not an error
    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()>;

    /// Running environments carrying `label` (`key=value`)
    async fn list_containers(&self, label: &str) -> EngineResult<Vec<ContainerSummary>>;
}
