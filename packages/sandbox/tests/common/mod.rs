// ABOUTME: In-memory container engine used by the integration tests
// ABOUTME: Tracks containers, their files and scripted output without talking to a daemon

#![allow(dead_code)]

use async_trait::async_trait;
use codebox_sandbox::archive::{self, EntryKind};
use codebox_sandbox::compose::{Mount, StagedFile};
use codebox_sandbox::engine::{
    ContainerEngine, ContainerSpec, ContainerSummary, EngineError, EngineResult, ExecResult,
    LogStream, StreamType,
};
use codebox_sandbox::logs::{encode_frame, Framing};
use codebox_sandbox::{SandboxManager, SandboxSettings};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeState {
    Created,
    Running,
    Exited(i64),
    Stopped,
}

#[derive(Debug, Clone)]
pub struct FakeFile {
    pub contents: Vec<u8>,
    pub mode: u32,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: Option<String>,
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<Mount>,
    pub tty: bool,
    pub state: FakeState,
    pub files: BTreeMap<String, FakeFile>,
    pub dirs: BTreeSet<String>,
    /// Files present when the container was started
    pub files_at_start: Vec<String>,
    pub exec_log: Vec<Vec<String>>,
}

/// Output produced by a container that runs a command to completion
#[derive(Debug, Clone, Default)]
pub struct RunScript {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

#[derive(Default)]
struct Behaviour {
    script: RunScript,
    wait_delay: Duration,
    hang_on_wait: bool,
    fail_pull: bool,
    fail_start: bool,
}

#[derive(Default)]
pub struct FakeEngine {
    containers: Mutex<HashMap<String, FakeContainer>>,
    pulled: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    behaviour: Mutex<Behaviour>,
}

fn join(dir: &str, path: &str) -> String {
    format!(
        "{}/{}",
        dir.trim_end_matches('/'),
        path.trim_start_matches("./").trim_end_matches('/')
    )
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_output(&self, stdout: &str, stderr: &str, exit_code: i64) {
        self.behaviour.lock().unwrap().script = RunScript {
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            exit_code,
        };
    }

    pub fn set_wait_delay(&self, delay: Duration) {
        self.behaviour.lock().unwrap().wait_delay = delay;
    }

    pub fn hang_on_wait(&self) {
        self.behaviour.lock().unwrap().hang_on_wait = true;
    }

    pub fn fail_pull(&self) {
        self.behaviour.lock().unwrap().fail_pull = true;
    }

    pub fn fail_start(&self) {
        self.behaviour.lock().unwrap().fail_start = true;
    }

    pub fn pulled(&self) -> Vec<String> {
        self.pulled.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn only_container(&self) -> FakeContainer {
        let containers = self.containers.lock().unwrap();
        assert_eq!(containers.len(), 1, "expected exactly one container");
        containers.values().next().cloned().unwrap()
    }

    pub fn container(&self, id_or_name: &str) -> Option<FakeContainer> {
        let containers = self.containers.lock().unwrap();
        Self::find(&containers, id_or_name).cloned()
    }

    pub fn file(&self, id_or_name: &str, path: &str) -> Option<FakeFile> {
        self.container(id_or_name)
            .and_then(|c| c.files.get(path).cloned())
    }

    /// Place a file directly, as if a command inside the container wrote it
    pub fn put_file(&self, id_or_name: &str, path: &str, contents: &[u8], mode: u32) {
        let mut containers = self.containers.lock().unwrap();
        let container = Self::find_mut(&mut containers, id_or_name).unwrap();
        container.files.insert(
            path.to_string(),
            FakeFile {
                contents: contents.to_vec(),
                mode,
            },
        );
    }

    fn find<'a>(
        containers: &'a HashMap<String, FakeContainer>,
        key: &str,
    ) -> Option<&'a FakeContainer> {
        containers
            .values()
            .find(|c| c.id.starts_with(key) || c.name.as_deref() == Some(key))
    }

    fn find_mut<'a>(
        containers: &'a mut HashMap<String, FakeContainer>,
        key: &str,
    ) -> Option<&'a mut FakeContainer> {
        containers
            .values_mut()
            .find(|c| c.id.starts_with(key) || c.name.as_deref() == Some(key))
    }

    fn with_container<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut FakeContainer) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut containers = self.containers.lock().unwrap();
        match Self::find_mut(&mut containers, key) {
            Some(container) => f(container),
            None => Err(EngineError::NotFound(key.to_string())),
        }
    }

    fn run_shell(container: &mut FakeContainer, command: &str) -> ExecResult {
        let command = command.trim();
        if let Some(code) = command.strip_prefix("exit ") {
            return ExecResult {
                exit_code: code.trim().parse().unwrap_or(1),
                ..Default::default()
            };
        }
        if let Some(text) = command.strip_prefix("echo ") {
            return ExecResult {
                stdout: format!("{}\n", text).into_bytes(),
                ..Default::default()
            };
        }
        if let Some(path) = command.strip_prefix("cat ") {
            return match container.files.get(path.trim()) {
                Some(file) => ExecResult {
                    stdout: file.contents.clone(),
                    ..Default::default()
                },
                None => ExecResult {
                    exit_code: 1,
                    stderr: format!("cat: {}: No such file or directory\n", path.trim())
                        .into_bytes(),
                    ..Default::default()
                },
            };
        }
        ExecResult::default()
    }
}

/// Manager over a fresh fake engine with default settings
pub fn fake_manager() -> (SandboxManager, Arc<FakeEngine>) {
    fake_manager_with(SandboxSettings::default())
}

pub fn fake_manager_with(settings: SandboxSettings) -> (SandboxManager, Arc<FakeEngine>) {
    let engine = FakeEngine::new();
    let manager = SandboxManager::new(engine.clone(), settings);
    (manager, engine)
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn is_available(&self) -> bool {
        true
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        if self.behaviour.lock().unwrap().fail_pull {
            return Err(EngineError::Image(format!("manifest for {} not found", image)));
        }
        self.pulled.lock().unwrap().push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let mut containers = self.containers.lock().unwrap();
        if let Some(name) = &spec.name {
            if containers
                .values()
                .any(|c| c.name.as_deref() == Some(name.as_str()))
            {
                return Err(EngineError::Create(format!(
                    "container name {:?} is already in use",
                    name
                )));
            }
        }

        let id = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        let mut dirs = BTreeSet::new();
        if let Some(dir) = &spec.working_dir {
            dirs.insert(dir.clone());
        }
        containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                cmd: spec.cmd.clone(),
                labels: spec.labels.clone(),
                mounts: spec.mounts.clone(),
                tty: spec.tty,
                state: FakeState::Created,
                files: BTreeMap::new(),
                dirs,
                files_at_start: Vec::new(),
                exec_log: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        let fail = self.behaviour.lock().unwrap().fail_start;
        self.with_container(id, |c| {
            if fail {
                return Err(EngineError::Start("OCI runtime create failed".to_string()));
            }
            c.state = FakeState::Running;
            c.files_at_start = c.files.keys().cloned().collect();
            Ok(())
        })
    }

    async fn wait_container(&self, id: &str) -> EngineResult<i64> {
        let (delay, hang, exit_code) = {
            let behaviour = self.behaviour.lock().unwrap();
            (
                behaviour.wait_delay,
                behaviour.hang_on_wait,
                behaviour.script.exit_code,
            )
        };
        self.with_container(id, |_| Ok(()))?;

        if hang {
            futures::future::pending::<()>().await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.with_container(id, |c| {
            c.state = FakeState::Exited(exit_code);
            Ok(exit_code)
        })
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        _working_dir: Option<&str>,
    ) -> EngineResult<ExecResult> {
        self.with_container(id, |c| {
            if c.state != FakeState::Running {
                return Err(EngineError::Exec(format!("container {} is not running", id)));
            }
            c.exec_log.push(cmd.clone());

            let result = match cmd.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
                ["mkdir", "-p", dir] => {
                    c.dirs.insert(dir.to_string());
                    ExecResult::default()
                }
                ["sh", "-c", command] => Self::run_shell(c, command),
                _ => ExecResult::default(),
            };
            Ok(result)
        })
    }

    async fn upload_archive(&self, id: &str, dest_dir: &str, data: Vec<u8>) -> EngineResult<()> {
        let entries =
            archive::read_entries(&data).map_err(|e| EngineError::Transfer(e.to_string()))?;
        self.with_container(id, |c| {
            for (entry, contents) in entries {
                let path = join(dest_dir, &entry.path);
                match entry.kind {
                    EntryKind::Directory => {
                        c.dirs.insert(path);
                    }
                    EntryKind::File => {
                        c.files.insert(
                            path,
                            FakeFile {
                                contents,
                                mode: entry.mode,
                            },
                        );
                    }
                    EntryKind::Other => {}
                }
            }
            Ok(())
        })
    }

    async fn download_archive(&self, id: &str, path: &str) -> EngineResult<Vec<u8>> {
        let file = self.with_container(id, |c| Ok(c.files.get(path).cloned()))?;
        let name = path.rsplit('/').next().unwrap_or(path).to_string();

        match file {
            Some(file) => archive::build_staged_archive(&[StagedFile {
                path: name,
                contents: file.contents,
                mode: file.mode,
            }])
            .map_err(|e| EngineError::Transfer(e.to_string())),
            None => {
                let is_dir = self.with_container(id, |c| Ok(c.dirs.contains(path)))?;
                if !is_dir {
                    return Err(EngineError::Transfer(format!(
                        "Could not find the file {} in container {}",
                        path, id
                    )));
                }
                let mut builder = tar::Builder::new(Vec::new());
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                header.set_cksum();
                builder
                    .append_data(&mut header, format!("{}/", name), std::io::empty())
                    .map_err(|e| EngineError::Transfer(e.to_string()))?;
                builder
                    .into_inner()
                    .map_err(|e| EngineError::Transfer(e.to_string()))
            }
        }
    }

    async fn logs(&self, id: &str) -> EngineResult<LogStream> {
        let script = self.behaviour.lock().unwrap().script.clone();
        let produced = self.with_container(id, |c| {
            Ok(c.cmd.is_some() && c.state != FakeState::Created)
        })?;

        let mut bytes = Vec::new();
        if produced {
            if !script.stdout.is_empty() {
                bytes.extend(encode_frame(StreamType::Stdout, &script.stdout));
            }
            if !script.stderr.is_empty() {
                bytes.extend(encode_frame(StreamType::Stderr, &script.stderr));
            }
        }
        Ok(LogStream::Framed {
            reader: Box::pin(std::io::Cursor::new(bytes)),
            framing: Framing::Multiplexed,
        })
    }

    async fn stop_container(&self, id: &str, _timeout_secs: u64) -> EngineResult<()> {
        self.with_container(id, |c| {
            if c.state == FakeState::Running {
                c.state = FakeState::Stopped;
            }
            Ok(())
        })
    }

    async fn remove_container(&self, id: &str, _force: bool) -> EngineResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let key = Self::find(&containers, id).map(|c| c.id.clone());
        if let Some(key) = key {
            containers.remove(&key);
            self.removed.lock().unwrap().push(key);
        }
        Ok(())
    }

    async fn list_containers(&self, label: &str) -> EngineResult<Vec<ContainerSummary>> {
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        let containers = self.containers.lock().unwrap();
        let mut summaries: Vec<ContainerSummary> = containers
            .values()
            .filter(|c| c.state == FakeState::Running)
            .filter(|c| c.labels.get(key).map(String::as_str) == Some(value))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone().unwrap_or_default(),
                image: c.image.clone(),
                state: "running".to_string(),
                status: "Up Less than a second".to_string(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }
}
