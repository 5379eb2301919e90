// ABOUTME: Tool-level handlers exposing the sandbox manager to a calling agent
// ABOUTME: Typed arguments in, textual results out, plus the tool catalogue and the logs resource

use crate::compose::{CodeRequest, ProjectRequest};
use crate::error::SandboxError;
use crate::languages::Language;
use crate::manager::{short_id, RunOutcome, SandboxManager};
use crate::progress::ProgressReporter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const LOGS_URI_SCHEME: &str = "containers://";
pub const LOGS_URI_TEMPLATE: &str = "containers://{id}/logs";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: ToolInputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInputSchema {
    #[serde(rename = "type")]
    pub type_name: String,
    pub properties: HashMap<String, ToolInputSchemaProperty>,
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInputSchemaProperty {
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "enum")]
    pub enum_values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ToolInputSchemaProperty>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolRequest {
    pub name: String,
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError")]
    pub is_error: Option<bool>,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: None,
        }
    }

    pub fn error(err: &SandboxError) -> Self {
        Self {
            content: vec![ToolContent::text(format!("Error: {}", err))],
            is_error: Some(true),
        }
    }

    /// Concatenated text of every content item
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceTemplate {
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceContents {
    pub uri: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub text: String,
}

/// Protocol-level faults; sandbox failures are reported as error results instead
#[derive(Error, Debug)]
pub enum ToolCallError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Invalid resource URI: {0}")]
    InvalidResourceUri(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

// Argument shapes

#[derive(Debug, Clone, Deserialize)]
pub struct RunCodeArgs {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub entrypoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunProjectArgs {
    #[serde(rename = "projectDir", alias = "project_dir")]
    pub project_dir: String,
    pub language: String,
    /// Whitespace separated command line
    pub entrypoint: String,
    #[serde(default)]
    pub background: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeArgs {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// `commands` may be a list or a single command string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Commands {
    Many(Vec<String>),
    One(String),
}

impl Commands {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::Many(commands) => commands,
            Self::One(command) => vec![command],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecArgs {
    #[serde(alias = "container_id")]
    pub container_id_or_name: String,
    pub commands: Commands,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CopyProjectArgs {
    #[serde(alias = "container_id")]
    pub container_id_or_name: String,
    pub local_src_dir: String,
    #[serde(default)]
    pub dest_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CopyFileArgs {
    #[serde(alias = "container_id")]
    pub container_id_or_name: String,
    pub local_src_file: String,
    #[serde(default)]
    pub dest_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CopyFileFromArgs {
    #[serde(alias = "container_id")]
    pub container_id_or_name: String,
    pub container_src_path: String,
    #[serde(default)]
    pub local_dest_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteFileArgs {
    #[serde(alias = "container_id")]
    pub container_id_or_name: String,
    pub file_name: String,
    pub file_contents: String,
    #[serde(default)]
    pub dest_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopArgs {
    #[serde(alias = "container_id")]
    pub container_id_or_name: String,
}

fn property(type_name: &str, description: &str) -> ToolInputSchemaProperty {
    ToolInputSchemaProperty {
        type_name: Some(type_name.to_string()),
        description: Some(description.to_string()),
        enum_values: None,
        items: None,
    }
}

fn language_property() -> ToolInputSchemaProperty {
    ToolInputSchemaProperty {
        enum_values: Some(Language::ids().into_iter().map(str::to_string).collect()),
        ..property("string", "Language of the code")
    }
}

fn container_property(description: &str) -> (String, ToolInputSchemaProperty) {
    (
        "container_id_or_name".to_string(),
        property("string", description),
    )
}

fn tool(
    name: &str,
    description: &str,
    properties: Vec<(String, ToolInputSchemaProperty)>,
    required: &[&str],
) -> Tool {
    Tool {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema: ToolInputSchema {
            type_name: "object".to_string(),
            properties: properties.into_iter().collect(),
            required: required.iter().map(|r| r.to_string()).collect(),
        },
    }
}

/// Catalogue of every tool with its input schema
pub fn tool_definitions() -> Vec<Tool> {
    let from_initialize = "ID or name of the container returned from the initialize call";

    vec![
        tool(
            "run_code",
            "Run code in a fresh sandboxed environment. Dependencies are detected from the \
             imports and installed before the code runs. Returns the combined output.",
            vec![
                ("code".to_string(), property("string", "The code to run")),
                ("language".to_string(), language_property()),
                (
                    "entrypoint".to_string(),
                    property("string", "Optional file name for the code, e.g. main.ts"),
                ),
            ],
            &["code", "language"],
        ),
        tool(
            "run_project",
            "Run a local project directory in a fresh sandboxed environment. The directory is \
             mounted at the working directory and its manifest, if any, is installed first.",
            vec![
                (
                    "projectDir".to_string(),
                    property("string", "Path to the project directory on the local filesystem"),
                ),
                ("language".to_string(), language_property()),
                (
                    "entrypoint".to_string(),
                    property("string", "Command to run the project, e.g. `python main.py`"),
                ),
                (
                    "background".to_string(),
                    property("boolean", "Leave the environment running and return immediately"),
                ),
            ],
            &["projectDir", "language", "entrypoint"],
        ),
        tool(
            "sandbox_initialize",
            "Initialize a new compute environment for code execution. Returns a container_id \
             that can be used with the other tools to interact with this environment.",
            vec![
                (
                    "image".to_string(),
                    property(
                        "string",
                        "Image to use as the base environment (e.g., 'python:3.12-slim-bookworm')",
                    ),
                ),
                (
                    "name".to_string(),
                    property("string", "Optional human-readable name for the sandbox container"),
                ),
            ],
            &[],
        ),
        tool(
            "sandbox_list",
            "Lists all running sandbox containers, returning their ID, name, image, and status.",
            vec![],
            &[],
        ),
        tool(
            "sandbox_exec",
            "Execute commands in the sandboxed environment, stopping at the first failure.",
            vec![
                container_property(from_initialize),
                (
                    "commands".to_string(),
                    ToolInputSchemaProperty {
                        items: Some(Box::new(ToolInputSchemaProperty {
                            type_name: Some("string".to_string()),
                            description: None,
                            enum_values: None,
                            items: None,
                        })),
                        ..property(
                            "array",
                            "List of command(s) to run, e.g. [\"pip install numpy\", \"python script.py\"]",
                        )
                    },
                ),
            ],
            &["container_id_or_name", "commands"],
        ),
        tool(
            "copy_project",
            "Copy a directory to the sandboxed filesystem.",
            vec![
                container_property(from_initialize),
                (
                    "local_src_dir".to_string(),
                    property("string", "Path to a directory in the local file system"),
                ),
                (
                    "dest_dir".to_string(),
                    property(
                        "string",
                        "Where to place the directory, relative to the container working dir",
                    ),
                ),
            ],
            &["container_id_or_name", "local_src_dir"],
        ),
        tool(
            "copy_file",
            "Copy a single file to the sandboxed filesystem.",
            vec![
                container_property(from_initialize),
                (
                    "local_src_file".to_string(),
                    property("string", "Path to a file in the local file system"),
                ),
                (
                    "dest_path".to_string(),
                    property(
                        "string",
                        "Where to save the file, relative to the container working dir",
                    ),
                ),
            ],
            &["container_id_or_name", "local_src_file"],
        ),
        tool(
            "copy_file_from_sandbox",
            "Copy a single file from the sandboxed filesystem to the local filesystem.",
            vec![
                container_property("ID or name of the container to copy from"),
                (
                    "container_src_path".to_string(),
                    property("string", "Path to the file in the container to copy"),
                ),
                (
                    "local_dest_path".to_string(),
                    property(
                        "string",
                        "Where to save the file locally. Default: current directory, same name",
                    ),
                ),
            ],
            &["container_id_or_name", "container_src_path"],
        ),
        tool(
            "write_file_sandbox",
            "Write a file to the sandboxed filesystem.",
            vec![
                container_property(from_initialize),
                (
                    "file_name".to_string(),
                    property("string", "Name of the file to create"),
                ),
                (
                    "file_contents".to_string(),
                    property("string", "Contents to write to the file"),
                ),
                (
                    "dest_dir".to_string(),
                    property(
                        "string",
                        "Directory to create the file in, relative to the container working dir",
                    ),
                ),
            ],
            &["container_id_or_name", "file_name", "file_contents"],
        ),
        tool(
            "sandbox_stop",
            "Stop and remove a running container sandbox.",
            vec![container_property(
                "ID or name of the container to stop and remove",
            )],
            &["container_id_or_name"],
        ),
    ]
}

pub fn logs_resource_template() -> ResourceTemplate {
    ResourceTemplate {
        uri_template: LOGS_URI_TEMPLATE.to_string(),
        name: "Container Logs".to_string(),
        description: Some(
            "Returns all container logs from the specified container as a single text resource."
                .to_string(),
        ),
        mime_type: "text/plain".to_string(),
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(
    tool: &str,
    arguments: Option<Value>,
) -> Result<T, ToolCallError> {
    let arguments = arguments.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(arguments).map_err(|e| ToolCallError::InvalidArguments {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

fn optional(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn outcome_text(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Completed {
            exit_code, output, ..
        } if *exit_code != 0 => format!(
            "{}\nProcess exited with code {}",
            output.combined_text().trim_end_matches('\n'),
            exit_code
        ),
        other => other.text(),
    }
}

async fn run_code(
    manager: &SandboxManager,
    args: RunCodeArgs,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> crate::error::Result<String> {
    let request = CodeRequest {
        language: Language::from_str(args.language.trim())?,
        code: args.code,
        entrypoint: args.entrypoint,
    };
    let outcome = manager.run_code(&request, progress, cancel).await?;
    Ok(outcome_text(&outcome))
}

async fn run_project(
    manager: &SandboxManager,
    args: RunProjectArgs,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> crate::error::Result<String> {
    let request = ProjectRequest {
        language: Language::from_str(args.language.trim())?,
        project_dir: PathBuf::from(args.project_dir.trim()),
        entrypoint: args
            .entrypoint
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        background: args.background,
    };
    let outcome = manager.run_project(&request, progress, cancel).await?;
    Ok(outcome_text(&outcome))
}

async fn dispatch(
    manager: &SandboxManager,
    request: CallToolRequest,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<crate::error::Result<String>, ToolCallError> {
    let name = request.name.as_str();
    let arguments = request.arguments;

    let result = match name {
        "run_code" => run_code(manager, parse_args(name, arguments)?, progress, cancel).await,
        "run_project" => {
            run_project(manager, parse_args(name, arguments)?, progress, cancel).await
        }
        "sandbox_initialize" => {
            let args: InitializeArgs = parse_args(name, arguments)?;
            manager
                .initialize(optional(&args.image), optional(&args.name))
                .await
                .map(|handle| format!("container_id: {}", handle.id))
        }
        "sandbox_list" => match manager.list().await {
            Ok(entries) => serde_json::to_string_pretty(&entries).map_err(SandboxError::from),
            Err(e) => Err(e),
        },
        "sandbox_exec" => {
            let args: ExecArgs = parse_args(name, arguments)?;
            manager
                .exec(&args.container_id_or_name, &args.commands.into_vec())
                .await
                .map(|transcript| transcript.text)
        }
        "copy_project" => {
            let args: CopyProjectArgs = parse_args(name, arguments)?;
            manager
                .copy_project(
                    &args.container_id_or_name,
                    Path::new(args.local_src_dir.trim()),
                    optional(&args.dest_dir),
                )
                .await
                .map(|landed| {
                    format!(
                        "Successfully copied {} to {} in container {}",
                        args.local_src_dir, landed, args.container_id_or_name
                    )
                })
        }
        "copy_file" => {
            let args: CopyFileArgs = parse_args(name, arguments)?;
            manager
                .copy_file(
                    &args.container_id_or_name,
                    Path::new(args.local_src_file.trim()),
                    optional(&args.dest_path),
                )
                .await
                .map(|dest| {
                    format!(
                        "Successfully copied {} to {} in container {}",
                        args.local_src_file, dest, args.container_id_or_name
                    )
                })
        }
        "copy_file_from_sandbox" => {
            let args: CopyFileFromArgs = parse_args(name, arguments)?;
            manager
                .copy_file_from(
                    &args.container_id_or_name,
                    &args.container_src_path,
                    optional(&args.local_dest_path).map(Path::new),
                )
                .await
                .map(|local| {
                    format!(
                        "Successfully copied {} from container {} to {}",
                        args.container_src_path,
                        args.container_id_or_name,
                        local.display()
                    )
                })
        }
        "write_file_sandbox" => {
            let args: WriteFileArgs = parse_args(name, arguments)?;
            manager
                .write_file(
                    &args.container_id_or_name,
                    &args.file_name,
                    args.file_contents.as_bytes(),
                    optional(&args.dest_dir),
                )
                .await
                .map(|written| {
                    format!(
                        "Successfully wrote file {} to container {}",
                        written, args.container_id_or_name
                    )
                })
        }
        "sandbox_stop" => {
            let args: StopArgs = parse_args(name, arguments)?;
            manager
                .stop(&args.container_id_or_name)
                .await
                .map(|_| {
                    format!(
                        "Successfully stopped and removed container: {}",
                        args.container_id_or_name
                    )
                })
        }
        _ => return Err(ToolCallError::UnknownTool(name.to_string())),
    };
    Ok(result)
}

/// Run one tool call; sandbox failures come back as error results, not faults
pub async fn call_tool(
    manager: &SandboxManager,
    request: CallToolRequest,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<CallToolResult, ToolCallError> {
    let name = request.name.clone();
    debug!("Calling tool {}", name);

    match dispatch(manager, request, progress, cancel).await? {
        Ok(text) => Ok(CallToolResult::text(text)),
        Err(e) => {
            warn!("Tool {} failed: {}", name, e);
            Ok(CallToolResult::error(&e))
        }
    }
}

/// Environment identifier named by a `containers://{id}/logs` URI
pub fn parse_logs_uri(uri: &str) -> Result<&str, ToolCallError> {
    uri.strip_prefix(LOGS_URI_SCHEME)
        .and_then(|rest| rest.strip_suffix("/logs"))
        .filter(|id| !id.is_empty() && !id.contains('/'))
        .ok_or_else(|| ToolCallError::InvalidResourceUri(uri.to_string()))
}

/// Read the `containers://{id}/logs` resource
pub async fn read_logs_resource(
    manager: &SandboxManager,
    uri: &str,
) -> Result<ResourceContents, ToolCallError> {
    let id = parse_logs_uri(uri)?;
    let buffers = manager.logs(id).await?;
    debug!("Read {} bytes of logs from {}", buffers.combined.len(), short_id(id));

    Ok(ResourceContents {
        uri: format!("{}{}/logs", LOGS_URI_SCHEME, id),
        mime_type: "text/plain".to_string(),
        text: buffers.stdout_then_stderr(),
    })
}
