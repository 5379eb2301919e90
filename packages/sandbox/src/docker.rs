// ABOUTME: Docker implementation of the container engine contract
// ABOUTME: Uses the bollard client for image pulls, container lifecycle, exec, archives and logs

use crate::engine::{
    ContainerEngine, ContainerSpec, ContainerSummary, EngineError, EngineResult, ExecResult,
    LogStream, OutputChunk, OutputStream, StreamType,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
        LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions, UploadToContainerOptions, WaitContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Docker engine; the client is shared and holds no per-request state
#[derive(Clone)]
pub struct DockerEngine {
    client: Docker,
    pull_timeout: Duration,
}

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

/// 404 becomes `NotFound`, everything else goes through `other`
fn classify(id: &str, err: BollardError, other: fn(String) -> EngineError) -> EngineError {
    if is_status(&err, 404) {
        EngineError::NotFound(id.to_string())
    } else {
        other(err.to_string())
    }
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform default socket
    pub fn connect(pull_timeout: Duration) -> EngineResult<Self> {
        match std::env::var(codebox_config::DOCKER_HOST) {
            Ok(host) => debug!("Connecting to Docker at {}", host),
            Err(_) => debug!("Connecting to the local Docker socket"),
        }
        let client = Docker::connect_with_defaults()
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        Ok(Self::with_client(client, pull_timeout))
    }

    pub fn with_client(client: Docker, pull_timeout: Duration) -> Self {
        Self {
            client,
            pull_timeout,
        }
    }

    fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| {
                format!(
                    "{}:{}:{}",
                    m.host_path.display(),
                    m.container_path,
                    if m.readonly { "ro" } else { "rw" }
                )
            })
            .collect();

        let host_config = bollard::models::HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            tty: Some(spec.tty),
            open_stdin: Some(spec.open_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> EngineResult<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(EngineError::Image(e.to_string())),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn is_available(&self) -> bool {
        match self.client.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Docker not available: {}", e);
                false
            }
        }
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        if self.image_exists(image).await? {
            debug!("Image {} already present, skipping pull", image);
            return Ok(());
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| EngineError::Image(e.to_string()))?;
                if let Some(status) = &info.status {
                    if status != &last_status {
                        debug!("Pull status: {}", status);
                        last_status = status.clone();
                    }
                }
                if let Some(err) = info.error {
                    return Err(EngineError::Image(err));
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Failed to pull image {}: {}", image, e);
                Err(e)
            }
            Err(_) => Err(EngineError::Image(format!(
                "timed out after {:?}",
                self.pull_timeout
            ))),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let created = self
            .client
            .create_container(options, Self::to_bollard_config(spec))
            .await
            .map_err(|e| {
                error!("Failed to create container from {}: {}", spec.image, e);
                EngineError::Create(e.to_string())
            })?;

        for warning in &created.warnings {
            warn!("Container {} created with warning: {}", created.id, warning);
        }
        info!("Created container {} from {}", created.id, spec.image);
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(id, e, EngineError::Start))?;
        info!("Started container {}", id);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> EngineResult<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = Box::pin(self.client.wait_container(id, Some(options)));

        let mut exit_code = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(response) => {
                    if let Some(message) = response.error.and_then(|e| e.message) {
                        return Err(EngineError::Wait(message));
                    }
                    exit_code = response.status_code;
                }
                // bollard reports a non-zero exit as an error carrying the code
                Err(BollardError::DockerContainerWaitError { code, .. }) => {
                    exit_code = code;
                }
                Err(e) => return Err(classify(id, e, EngineError::Wait)),
            }
        }
        debug!("Container {} exited with code {}", id, exit_code);
        Ok(exit_code)
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        working_dir: Option<&str>,
    ) -> EngineResult<ExecResult> {
        debug!("Executing in container {}: {:?}", id, cmd);

        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: working_dir.map(str::to_string),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(id, exec_config)
            .await
            .map_err(|e| classify(id, e, EngineError::Exec))?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| EngineError::Exec(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                        Ok(_) => {}
                        Err(e) => return Err(EngineError::Exec(e.to_string())),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(EngineError::Exec(
                    "exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| EngineError::Exec(e.to_string()))?;

        let Some(exit_code) = inspect.exit_code else {
            warn!("Exec {} in container {} finished without an exit code", exec.id, id);
            return Err(EngineError::Exec(format!(
                "no exit code reported for exec {}",
                exec.id
            )));
        };

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn upload_archive(
        &self,
        id: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> EngineResult<()> {
        debug!(
            "Uploading {} byte archive to container {}:{}",
            archive.len(),
            id,
            dest_dir
        );

        let options = UploadToContainerOptions {
            path: dest_dir.to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(id, Some(options), archive.into())
            .await
            .map_err(|e| classify(id, e, EngineError::Transfer))
    }

    async fn download_archive(&self, id: &str, path: &str) -> EngineResult<Vec<u8>> {
        debug!("Downloading container {}:{}", id, path);

        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.client.download_from_container(id, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| {
                if is_status(&e, 404) {
                    EngineError::Transfer(format!("no such path in container: {}", path))
                } else {
                    EngineError::Transfer(e.to_string())
                }
            })?;
            data.extend_from_slice(&bytes);
        }
        Ok(data)
    }

    async fn logs(&self, id: &str) -> EngineResult<LogStream> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };

        let mut logs = Box::pin(self.client.logs(id, Some(options)));

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        // Surface a missing container before handing back the stream
        let first = match logs.next().await {
            Some(Err(e)) => return Err(classify(id, e, EngineError::Logs)),
            Some(Ok(first)) => first,
            None => return Ok(LogStream::Chunks(OutputStream { receiver: rx })),
        };

        tokio::spawn(async move {
            let mut next: Option<Result<LogOutput, bollard::errors::Error>> = Some(Ok(first));
            while let Some(item) = next.take() {
                let chunk = match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        Some(Ok(OutputChunk::new(StreamType::Stdout, message.to_vec())))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        Some(Ok(OutputChunk::new(StreamType::Stderr, message.to_vec())))
                    }
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => {
                        error!("Error streaming logs: {}", e);
                        Some(Err(EngineError::Logs(e.to_string())))
                    }
                };
                if let Some(chunk) = chunk {
                    let failed = chunk.is_err();
                    if tx.send(chunk).is_err() || failed {
                        break;
                    }
                }
                next = logs.next().await;
            }
        });

        Ok(LogStream::Chunks(OutputStream { receiver: rx }))
    }

    async fn stop_container(&self, id: &str, timeout_secs: u64) -> EngineResult<()> {
        info!("Stopping container {} (timeout: {}s)", id, timeout_secs);

        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };
        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            // Container already stopped is not an error
            Err(e) if is_status(&e, 304) => {
                debug!("Container {} already stopped", id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to stop container {}: {}", id, e);
                Err(classify(id, e, EngineError::Stop))
            }
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(id, Some(options)).await {
            Ok(_) => {
                info!("Removed container {}", id);
                Ok(())
            }
            // Container already removed is not an error
            Err(e) if is_status(&e, 404) => {
                debug!("Container {} already removed", id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to remove container {}: {}", id, e);
                Err(EngineError::Remove(e.to_string()))
            }
        }
    }

    async fn list_containers(&self, label: &str) -> EngineResult<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);

        let options = ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| EngineError::List(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                Some(ContainerSummary {
                    id,
                    name,
                    image: c.image.unwrap_or_default(),
                    state: c.state.unwrap_or_default(),
                    status: c.status.unwrap_or_default(),
                })
            })
            .collect())
    }
}
