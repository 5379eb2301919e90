// ABOUTME: Sandbox lifecycle manager driving environments through create, start, wait, exec and teardown
// ABOUTME: Glues detection and composition to the container engine and reports progress while waiting

use crate::archive;
use crate::compose::{
    self, CodeRequest, ComposedCommand, ProjectRequest, StagedFile, STAGED_FILE_MODE,
};
use crate::detector;
use crate::docker::DockerEngine;
use crate::engine::{ContainerEngine, ContainerSpec, ContainerSummary};
use crate::error::{Result, SandboxError};
use crate::languages::REGISTRY;
use crate::logs::{self, LogBuffers};
use crate::progress::{self, ProgressReporter};
use crate::settings::SandboxSettings;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SHORT_ID_LEN: usize = 12;

pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Created,
    Running,
    Waiting,
    Exited(i64),
    Stopped,
    Removed,
}

/// An environment this manager created
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxHandle {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub image: String,
    pub state: SandboxState,
}

impl SandboxHandle {
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// Entry of a `list` snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxInfo {
    #[serde(rename = "container_id")]
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
}

impl From<ContainerSummary> for SandboxInfo {
    fn from(summary: ContainerSummary) -> Self {
        Self {
            id: short_id(&summary.id).to_string(),
            name: summary.name,
            image: summary.image,
            status: summary.status,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Started and left running for later interaction
    Background {
        handle: SandboxHandle,
        message: String,
    },
    /// Ran to completion; the exited environment is kept for inspection
    Completed {
        handle: SandboxHandle,
        exit_code: i64,
        output: LogBuffers,
    },
}

impl RunOutcome {
    pub fn handle(&self) -> &SandboxHandle {
        match self {
            Self::Background { handle, .. } | Self::Completed { handle, .. } => handle,
        }
    }

    pub fn text(&self) -> String {
        match self {
            Self::Background { message, .. } => message.clone(),
            Self::Completed { output, .. } => output.combined_text(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecStep {
    pub command: String,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecTranscript {
    pub steps: Vec<ExecStep>,
    pub text: String,
}

impl ExecTranscript {
    /// Exit code of the step that stopped the sequence, if any
    pub fn failed_exit_code(&self) -> Option<i64> {
        self.steps
            .last()
            .map(|s| s.exit_code)
            .filter(|code| *code != 0)
    }

    fn record(&mut self, step: ExecStep) {
        self.text.push_str(&format!("$ {}\n", step.command));
        if !step.stdout.is_empty() {
            self.text.push_str(&step.stdout);
            if !step.stdout.ends_with('\n') {
                self.text.push('\n');
            }
        }
        if !step.stderr.is_empty() {
            self.text.push_str("Error: ");
            self.text.push_str(&step.stderr);
            if !step.stderr.ends_with('\n') {
                self.text.push('\n');
            }
        }
        if step.exit_code != 0 {
            self.text
                .push_str(&format!("Command exited with code {}\n", step.exit_code));
        }
        self.steps.push(step);
    }
}

/// Sandbox lifecycle manager
pub struct SandboxManager {
    engine: Arc<dyn ContainerEngine>,
    settings: SandboxSettings,
}

impl SandboxManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, settings: SandboxSettings) -> Self {
        Self { engine, settings }
    }

    /// Manager backed by the local Docker daemon
    pub fn with_docker(settings: SandboxSettings) -> Result<Self> {
        let engine = DockerEngine::connect(settings.pull_timeout())
            .map_err(|e| SandboxError::EnvironmentCreate(e.to_string()))?;
        Ok(Self::new(Arc::new(engine), settings))
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    fn labels(&self, name: Option<&str>, kind: &str) -> HashMap<String, String> {
        let prefix = &self.settings.label_prefix;
        let mut labels = HashMap::from([
            (self.settings.managed_label(), "true".to_string()),
            (format!("{}.kind", prefix), kind.to_string()),
            (format!("{}.request", prefix), Uuid::new_v4().to_string()),
        ]);
        if let Some(name) = name {
            labels.insert(format!("{}.name", prefix), name.to_string());
        }
        labels
    }

    async fn pull(&self, image: &str) -> Result<()> {
        self.engine
            .pull_image(image)
            .await
            .map_err(|e| SandboxError::ImagePull {
                image: image.to_string(),
                reason: e.to_string(),
            })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.engine
            .create_container(spec)
            .await
            .map_err(|e| SandboxError::EnvironmentCreate(e.to_string()))
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.engine.start_container(id).await.map_err(|e| {
            error!("Failed to start environment {}: {}", id, e);
            SandboxError::from_engine(e, |reason| SandboxError::EnvironmentStart {
                id: id.to_string(),
                reason,
            })
        })
    }

    /// Best-effort removal of an environment that failed to come up
    async fn discard(&self, id: &str) {
        if let Err(e) = self.engine.remove_container(id, true).await {
            warn!("Failed to clean up environment {}: {}", id, e);
        }
    }

    /// Pull, create and start an idle interactive environment
    pub async fn initialize(
        &self,
        image: Option<&str>,
        name: Option<&str>,
    ) -> Result<SandboxHandle> {
        let image = image
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .unwrap_or(&self.settings.default_image)
            .to_string();
        let name = name.map(str::trim).filter(|n| !n.is_empty());

        self.pull(&image).await?;

        let spec = ContainerSpec {
            name: name.map(str::to_string),
            image: image.clone(),
            cmd: None,
            working_dir: Some(self.settings.work_dir.clone()),
            labels: self.labels(name, "interactive"),
            mounts: Vec::new(),
            tty: true,
            open_stdin: true,
        };
        let id = self.create(&spec).await?;
        if let Err(e) = self.start(&id).await {
            self.discard(&id).await;
            return Err(e);
        }

        info!("Initialized environment {} from {}", short_id(&id), image);
        Ok(SandboxHandle {
            id,
            name: name.map(str::to_string),
            image,
            state: SandboxState::Running,
        })
    }

    /// Create and start a fresh environment for `composed`, optionally waiting for it
    pub async fn run(
        &self,
        composed: &ComposedCommand,
        image: &str,
        background: bool,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        self.pull(image).await?;

        let spec = ContainerSpec {
            name: None,
            image: image.to_string(),
            cmd: Some(composed.argv.clone()),
            working_dir: Some(self.settings.work_dir.clone()),
            labels: self.labels(None, if background { "background" } else { "run" }),
            mounts: composed.mounts.clone(),
            tty: false,
            open_stdin: false,
        };
        let id = self.create(&spec).await?;
        let mut handle = SandboxHandle {
            id: id.clone(),
            name: None,
            image: image.to_string(),
            state: SandboxState::Created,
        };

        if !composed.staged_files.is_empty() {
            if let Err(e) = self.stage_files(&id, &composed.staged_files).await {
                self.discard(&id).await;
                return Err(e);
            }
        }

        if let Err(e) = self.start(&id).await {
            self.discard(&id).await;
            return Err(e);
        }
        handle.state = SandboxState::Running;
        progress.report(progress::PROGRESS_STARTED).await;
        info!("Started environment {}: {}", short_id(&id), composed.display());

        if background {
            let message = format!(
                "Container started in background with ID: {}",
                short_id(&id)
            );
            return Ok(RunOutcome::Background { handle, message });
        }

        handle.state = SandboxState::Waiting;
        let exit_code = self.wait_with_ticks(&id, progress, cancel).await?;
        handle.state = SandboxState::Exited(exit_code);

        let output = self.logs(&id).await?;
        info!(
            "Environment {} exited with code {}",
            short_id(&id),
            exit_code
        );
        Ok(RunOutcome::Completed {
            handle,
            exit_code,
            output,
        })
    }

    /// Place in-memory files under the working directory of a created environment
    async fn stage_files(&self, id: &str, files: &[StagedFile]) -> Result<()> {
        let root = self.settings.work_dir.trim_matches('/');
        let anchored: Vec<StagedFile> = files
            .iter()
            .map(|f| StagedFile {
                path: if root.is_empty() {
                    f.path.clone()
                } else {
                    format!("{}/{}", root, f.path)
                },
                contents: f.contents.clone(),
                mode: f.mode,
            })
            .collect();

        let data = archive::build_staged_archive(&anchored)?;
        debug!(
            "Staging {} file(s) ({} bytes) into {}",
            files.len(),
            data.len(),
            short_id(id)
        );
        self.engine
            .upload_archive(id, "/", data)
            .await
            .map_err(|e| SandboxError::from_engine(e, SandboxError::Archive))
    }

    /// Wait for exit while ticking progress; ticks stop the moment the wait resolves
    async fn wait_with_ticks(
        &self,
        id: &str,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        let wait = self.engine.wait_container(id);
        tokio::pin!(wait);

        let mut ticker = tokio::time::interval(self.settings.progress_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of an interval fires immediately
        ticker.tick().await;

        let mut value = progress::PROGRESS_STARTED;
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    warn!("Wait for environment {} cancelled", short_id(id));
                    return Err(SandboxError::cancelled(id));
                }
                result = &mut wait => {
                    return result.map_err(|e| {
                        error!("Failed waiting for environment {}: {}", id, e);
                        SandboxError::from_engine(e, |reason| SandboxError::Wait {
                            id: id.to_string(),
                            reason,
                            cancelled: false,
                        })
                    });
                }
                _ = ticker.tick() => {
                    let next = progress::next_tick(value);
                    if next != value {
                        value = next;
                        progress.report(value).await;
                    }
                }
            }
        }
    }

    /// Full combined output of an environment
    pub async fn logs(&self, id: &str) -> Result<LogBuffers> {
        let stream = self
            .engine
            .logs(id)
            .await
            .map_err(|e| SandboxError::from_engine(e, SandboxError::LogRetrieval))?;
        logs::collect(stream).await
    }

    /// Run commands in order, stopping at the first non-zero exit
    pub async fn exec(&self, id: &str, commands: &[String]) -> Result<ExecTranscript> {
        if commands.is_empty() {
            return Err(SandboxError::InvalidArgument(
                "at least one command is required".to_string(),
            ));
        }

        let mut transcript = ExecTranscript::default();
        for command in commands {
            debug!("Exec in {}: {}", short_id(id), command);
            let result = self
                .engine
                .exec(
                    id,
                    vec!["sh".to_string(), "-c".to_string(), command.clone()],
                    Some(&self.settings.work_dir),
                )
                .await
                .map_err(|e| SandboxError::from_engine(e, SandboxError::Exec))?;

            let exit_code = result.exit_code;
            transcript.record(ExecStep {
                command: command.clone(),
                exit_code,
                stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            });
            if exit_code != 0 {
                debug!(
                    "Command {:?} exited with {}, skipping the rest",
                    command, exit_code
                );
                break;
            }
        }
        Ok(transcript)
    }

    /// Snapshot of running environments created by this engine
    pub async fn list(&self) -> Result<Vec<SandboxInfo>> {
        let containers = self
            .engine
            .list_containers(&self.settings.managed_filter())
            .await
            .map_err(|e| SandboxError::List(e.to_string()))?;
        Ok(containers.into_iter().map(SandboxInfo::from).collect())
    }

    /// Stop with a grace period, then force-remove with volumes
    pub async fn stop(&self, id_or_name: &str) -> Result<SandboxState> {
        let stop_error = |reason: String| SandboxError::Stop {
            id: id_or_name.to_string(),
            reason,
        };

        self.engine
            .stop_container(id_or_name, self.settings.stop_timeout_secs)
            .await
            .map_err(|e| SandboxError::from_engine(e, stop_error))?;
        self.engine
            .remove_container(id_or_name, true)
            .await
            .map_err(|e| SandboxError::from_engine(e, stop_error))?;

        info!("Stopped and removed environment {}", id_or_name);
        Ok(SandboxState::Removed)
    }

    /// `mkdir -p` inside a running environment
    async fn ensure_dir(&self, id: &str, dir: &str) -> Result<()> {
        let result = self
            .engine
            .exec(
                id,
                vec!["mkdir".to_string(), "-p".to_string(), dir.to_string()],
                None,
            )
            .await
            .map_err(|e| SandboxError::from_engine(e, SandboxError::Archive))?;
        if result.exit_code != 0 {
            return Err(SandboxError::Archive(format!(
                "failed to create {}: {}",
                dir,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn upload(&self, id: &str, dir: &str, data: Vec<u8>) -> Result<()> {
        self.ensure_dir(id, dir).await?;
        self.engine
            .upload_archive(id, dir, data)
            .await
            .map_err(|e| SandboxError::from_engine(e, SandboxError::Archive))
    }

    fn resolve_dir(&self, dest: Option<&str>) -> String {
        dest.map(str::trim)
            .filter(|d| !d.is_empty())
            .map(|d| self.settings.sandbox_path(d))
            .unwrap_or_else(|| self.settings.work_dir.clone())
    }

    /// Copy a local directory so it lands at `<dest>/<basename>`
    pub async fn copy_project(
        &self,
        id: &str,
        local_dir: &Path,
        dest: Option<&str>,
    ) -> Result<String> {
        let data = archive::build_dir_archive(local_dir)?;
        let base = std::fs::canonicalize(local_dir)?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dest_dir = self.resolve_dir(dest);

        self.upload(id, &dest_dir, data).await?;
        let landed = format!("{}/{}", dest_dir.trim_end_matches('/'), base);
        info!("Copied {} to {}:{}", local_dir.display(), short_id(id), landed);
        Ok(landed)
    }

    /// Copy one local file; a destination ending in `/` names a directory
    pub async fn copy_file(
        &self,
        id: &str,
        local_file: &Path,
        dest_path: Option<&str>,
    ) -> Result<String> {
        let file_name = local_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                SandboxError::InvalidArgument(format!(
                    "{} has no file name",
                    local_file.display()
                ))
            })?;

        let dest = dest_path
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(|d| {
                if d.ends_with('/') {
                    format!("{}{}", self.settings.sandbox_path(d), file_name)
                } else {
                    self.settings.sandbox_path(d)
                }
            })
            .unwrap_or_else(|| self.settings.sandbox_path(&file_name));

        let (dir, name) = match dest.rsplit_once('/') {
            Some(("", name)) => ("/".to_string(), name.to_string()),
            Some((dir, name)) => (dir.to_string(), name.to_string()),
            None => (self.settings.work_dir.clone(), dest.clone()),
        };

        let data = archive::build_file_archive(local_file, &name)?;
        self.upload(id, &dir, data).await?;
        info!("Copied {} to {}:{}", local_file.display(), short_id(id), dest);
        Ok(dest)
    }

    /// Fetch one file out of an environment, restoring its permission bits
    pub async fn copy_file_from(
        &self,
        id: &str,
        sandbox_path: &str,
        local_dest: Option<&Path>,
    ) -> Result<PathBuf> {
        let sandbox_path = sandbox_path.trim();
        if sandbox_path.is_empty() {
            return Err(SandboxError::InvalidArgument(
                "sandbox path is required".to_string(),
            ));
        }
        let source = self.settings.sandbox_path(sandbox_path);

        let data = self
            .engine
            .download_archive(id, &source)
            .await
            .map_err(|e| SandboxError::from_engine(e, SandboxError::Archive))?;

        let local = match local_dest {
            Some(path) if !path.as_os_str().is_empty() => path.to_path_buf(),
            _ => {
                let base = source.trim_end_matches('/').rsplit('/').next().unwrap_or("");
                if base.is_empty() {
                    return Err(SandboxError::InvalidArgument(format!(
                        "cannot derive a local file name from {}",
                        source
                    )));
                }
                PathBuf::from(base)
            }
        };

        archive::extract_single_file(&data, &local)?;
        info!("Copied {}:{} to {}", short_id(id), source, local.display());
        Ok(local)
    }

    /// Write in-memory contents to a file inside an environment
    pub async fn write_file(
        &self,
        id: &str,
        file_name: &str,
        contents: &[u8],
        dest_dir: Option<&str>,
    ) -> Result<String> {
        let file_name = file_name.trim();
        if file_name.is_empty() {
            return Err(SandboxError::InvalidArgument(
                "file name is required".to_string(),
            ));
        }
        if file_name.starts_with('/') || file_name.split('/').any(|part| part == "..") {
            return Err(SandboxError::InvalidArgument(format!(
                "file name must be relative to the destination: {}",
                file_name
            )));
        }

        let dir = self.resolve_dir(dest_dir);
        let data = archive::build_staged_archive(&[StagedFile {
            path: file_name.to_string(),
            contents: contents.to_vec(),
            mode: STAGED_FILE_MODE,
        }])?;
        self.upload(id, &dir, data).await?;

        let written = format!("{}/{}", dir.trim_end_matches('/'), file_name);
        info!("Wrote {} bytes to {}:{}", contents.len(), short_id(id), written);
        Ok(written)
    }

    /// Detect, compose and run inline code in a fresh environment
    pub async fn run_code(
        &self,
        request: &CodeRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        progress.report(progress::PROGRESS_ACCEPTED).await;

        let profile = REGISTRY.profile(request.language)?;
        let deps = detector::detect(&request.code, request.language);
        if !deps.is_empty() {
            info!(
                "Detected {} dependencies: {}",
                request.language,
                deps.as_slice().join(", ")
            );
        }
        let composed = compose::compose_inline(profile, request, &deps)?;
        let image = self.settings.image_for(request.language)?;
        progress.report(progress::PROGRESS_COMPOSED).await;

        let outcome = self.run(&composed, &image, false, progress, cancel).await?;
        progress.report(progress::PROGRESS_DONE).await;
        Ok(outcome)
    }

    /// Compose and run a project directory, optionally in the background
    pub async fn run_project(
        &self,
        request: &ProjectRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        progress.report(progress::PROGRESS_ACCEPTED).await;

        let profile = REGISTRY.profile(request.language)?;
        let composed = compose::compose_project(profile, request, &self.settings.work_dir)?;
        let image = self.settings.image_for(request.language)?;
        progress.report(progress::PROGRESS_COMPOSED).await;

        let outcome = self
            .run(&composed, &image, request.background, progress, cancel)
            .await?;
        progress.report(progress::PROGRESS_DONE).await;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(command: &str, exit_code: i64, stdout: &str, stderr: &str) -> ExecStep {
        ExecStep {
            command: command.to_string(),
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_transcript_format() {
        let mut transcript = ExecTranscript::default();
        transcript.record(step("echo hi", 0, "hi\n", ""));
        transcript.record(step("false", 1, "", "nope"));

        assert_eq!(
            transcript.text,
            "$ echo hi\nhi\n$ false\nError: nope\nCommand exited with code 1\n"
        );
        assert_eq!(transcript.failed_exit_code(), Some(1));
    }

    #[test]
    fn test_successful_transcript_has_no_failure() {
        let mut transcript = ExecTranscript::default();
        transcript.record(step("true", 0, "", ""));
        assert_eq!(transcript.failed_exit_code(), None);
        assert_eq!(transcript.text, "$ true\n");
    }

    #[test]
    fn test_summary_uses_short_id() {
        let info = SandboxInfo::from(ContainerSummary {
            id: "f00dfacecafe1234567890".to_string(),
            name: "box".to_string(),
            image: "alpine".to_string(),
            state: "running".to_string(),
            status: "Up 2 seconds".to_string(),
        });
        assert_eq!(info.id, "f00dfacecafe");
        assert_eq!(info.status, "Up 2 seconds");
    }
}
