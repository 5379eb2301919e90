// ABOUTME: Sandbox orchestration engine for running untrusted code in throwaway containers
// ABOUTME: Dependency detection, command composition, file transfer, log demux and lifecycle management

pub mod archive;
pub mod compose;
pub mod detector;
pub mod docker;
pub mod engine;
pub mod error;
pub mod languages;
pub mod logs;
pub mod manager;
pub mod progress;
pub mod settings;
pub mod tools;

pub use compose::{compose, CodeRequest, ComposedCommand, ExecutionRequest, ProjectRequest};
pub use detector::{detect, DependencySet};
pub use docker::DockerEngine;
pub use engine::{ContainerEngine, ContainerSpec, ContainerSummary, EngineError, LogStream};
pub use error::{Result, SandboxError};
pub use languages::{Language, LanguageProfile, LanguageRegistry, REGISTRY};
pub use logs::{FrameDecoder, Framing, LogBuffers};
pub use manager::{ExecTranscript, RunOutcome, SandboxHandle, SandboxInfo, SandboxManager, SandboxState};
pub use progress::{ChannelProgressSink, ProgressReporter, ProgressSink, ProgressToken};
pub use settings::SandboxSettings;
pub use tools::{call_tool, read_logs_resource, tool_definitions, CallToolRequest, CallToolResult};
