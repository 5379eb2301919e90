// ABOUTME: Command composition for inline code and project directory runs
// ABOUTME: Joins an optional install step and the run step with fail-fast sequencing

use crate::detector::{self, DependencySet};
use crate::error::{Result, SandboxError};
use crate::languages::{InlineStyle, Language, LanguageProfile, ManifestFormat, REGISTRY};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Permission bits for files synthesized in memory
pub const STAGED_FILE_MODE: u32 = 0o644;

/// A request to run something in a fresh environment
#[derive(Debug, Clone)]
pub enum ExecutionRequest {
    Inline(CodeRequest),
    Project(ProjectRequest),
}

impl ExecutionRequest {
    pub fn language(&self) -> Language {
        match self {
            Self::Inline(req) => req.language,
            Self::Project(req) => req.language,
        }
    }

    /// Background mode only exists for project runs
    pub fn background(&self) -> bool {
        match self {
            Self::Inline(_) => false,
            Self::Project(req) => req.background,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRequest {
    pub language: Language,
    pub code: String,
    /// Optional source filename for the inline code, e.g. `main.ts`
    #[serde(default)]
    pub entrypoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRequest {
    pub language: Language,
    pub project_dir: PathBuf,
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub background: bool,
}

/// In-memory file placed under the working directory before start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: String,
    pub contents: Vec<u8>,
    pub mode: u32,
}

impl StagedFile {
    fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            mode: STAGED_FILE_MODE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub readonly: bool,
}

/// Final invocation for an environment; the run step is always present
#[derive(Debug, Clone)]
pub struct ComposedCommand {
    pub install: Option<String>,
    pub run: Vec<String>,
    pub argv: Vec<String>,
    pub staged_files: Vec<StagedFile>,
    pub mounts: Vec<Mount>,
}

impl ComposedCommand {
    fn new(install: Option<String>, run: Vec<String>) -> Self {
        let argv = match &install {
            Some(install) => vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("{} && {}", install, shell_join(&run)),
            ],
            None => run.clone(),
        };
        Self {
            install,
            run,
            argv,
            staged_files: Vec::new(),
            mounts: Vec::new(),
        }
    }

    pub fn has_install(&self) -> bool {
        self.install.is_some()
    }

    /// Human-readable single-line form of the invocation
    pub fn display(&self) -> String {
        match &self.install {
            Some(install) => format!("{} && {}", install, shell_join(&self.run)),
            None => shell_join(&self.run),
        }
    }

    pub fn staged_file(&self, path: &str) -> Option<&StagedFile> {
        self.staged_files.iter().find(|f| f.path == path)
    }
}

/// Compose a request against the global registry, detecting inline dependencies
pub fn compose(request: &ExecutionRequest, work_dir: &str) -> Result<ComposedCommand> {
    let profile = REGISTRY.profile(request.language())?;
    match request {
        ExecutionRequest::Inline(req) => {
            let deps = detector::detect(&req.code, req.language);
            compose_inline(profile, req, &deps)
        }
        ExecutionRequest::Project(req) => compose_project(profile, req, work_dir),
    }
}

pub fn compose_inline(
    profile: &LanguageProfile,
    request: &CodeRequest,
    deps: &DependencySet,
) -> Result<ComposedCommand> {
    if request.code.trim().is_empty() {
        return Err(SandboxError::InvalidArgument("code is required".to_string()));
    }

    let inline = &profile.inline;
    let entrypoint = request
        .entrypoint
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty());
    if let Some(entry) = entrypoint {
        validate_source_name(profile, entry)?;
    }

    let mut staged = Vec::new();
    let run = match (entrypoint, inline.style, inline.eval_flag.as_deref()) {
        (None, InlineStyle::Argument, Some(flag)) => {
            let mut run = profile.run_command.clone();
            run.push(flag.to_string());
            run.push(request.code.clone());
            run
        }
        (None, InlineStyle::Argument, None) => {
            return Err(SandboxError::InvalidArgument(format!(
                "{} cannot run inline code without a source file",
                profile.display_name
            )));
        }
        _ => {
            let source = entrypoint.unwrap_or(&inline.source_file);
            staged.push(StagedFile::new(source, request.code.as_bytes()));
            runtime_invocation(profile, source)
        }
    };

    let install = if deps.is_empty() {
        None
    } else {
        Some(inline.install_command())
    };
    if install.is_some() || inline.always_stage_manifest {
        staged.push(StagedFile::new(
            inline.manifest_file.as_str(),
            synthesize_manifest(inline.manifest_format, deps),
        ));
    }

    let mut composed = ComposedCommand::new(install, run);
    composed.staged_files = staged;
    debug!(
        language = %profile.id,
        dependencies = deps.len(),
        staged = composed.staged_files.len(),
        "Composed inline command"
    );
    Ok(composed)
}

pub fn compose_project(
    profile: &LanguageProfile,
    request: &ProjectRequest,
    work_dir: &str,
) -> Result<ComposedCommand> {
    if request.project_dir.as_os_str().is_empty() {
        return Err(SandboxError::InvalidArgument(
            "project directory is required".to_string(),
        ));
    }
    if !request.project_dir.exists() {
        return Err(SandboxError::PathNotFound(
            request.project_dir.display().to_string(),
        ));
    }
    if !request.project_dir.is_dir() {
        return Err(SandboxError::InvalidArgument(format!(
            "{} is not a directory",
            request.project_dir.display()
        )));
    }
    let project_dir = std::fs::canonicalize(&request.project_dir)?;

    let tokens: Vec<String> = request
        .entrypoint
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return Err(SandboxError::InvalidArgument(
            "entrypoint is required".to_string(),
        ));
    }

    let install = probe_manifest(profile, &project_dir).map(str::to_string);
    let run = normalize_entrypoint(profile, &tokens);

    let mut composed = ComposedCommand::new(install, run);
    composed.mounts.push(Mount {
        host_path: project_dir,
        container_path: work_dir.to_string(),
        readonly: false,
    });
    debug!(
        language = %profile.id,
        install = composed.install.as_deref().unwrap_or("-"),
        "Composed project command"
    );
    Ok(composed)
}

/// Install incantation for the first recognised manifest present in `dir`
pub fn probe_manifest<'a>(profile: &'a LanguageProfile, dir: &Path) -> Option<&'a str> {
    profile
        .manifests
        .iter()
        .find(|m| dir.join(&m.file).is_file())
        .map(|m| m.install.as_str())
}

fn validate_source_name(profile: &LanguageProfile, name: &str) -> Result<()> {
    if name.split_whitespace().count() > 1 {
        return Err(SandboxError::InvalidArgument(format!(
            "inline entrypoint must be a single file name, got {:?}",
            name
        )));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(SandboxError::InvalidArgument(format!(
            "inline entrypoint must not contain path components: {}",
            name
        )));
    }
    let ext = extension_of(name).unwrap_or_default();
    if !profile.accepts_extension(&ext) {
        return Err(SandboxError::InvalidArgument(format!(
            "{} does not run {} files (expected one of {})",
            profile.display_name,
            if ext.is_empty() { "extensionless" } else { &ext },
            profile.source_extensions.join(", ")
        )));
    }
    Ok(())
}

fn extension_of(token: &str) -> Option<String> {
    Path::new(token)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
}

/// `run_command` plus extension flags for a single script path
fn runtime_invocation(profile: &LanguageProfile, script: &str) -> Vec<String> {
    let ext = extension_of(script).unwrap_or_default();
    let mut run = profile.run_command.clone();
    run.extend(profile.flags_for_extension(&ext).iter().cloned());
    run.push(script.to_string());
    run
}

/// Rewrite user entrypoint tokens so the runtime and its extension flags lead
fn normalize_entrypoint(profile: &LanguageProfile, tokens: &[String]) -> Vec<String> {
    let Some(first) = tokens.first() else {
        return Vec::new();
    };
    let last_ext = tokens.last().and_then(|t| extension_of(t)).unwrap_or_default();
    let flags = profile.flags_for_extension(&last_ext);
    let runtime = profile.run_command.first().map(String::as_str);

    let first_is_script = extension_of(first)
        .map(|ext| profile.accepts_extension(&ext))
        .unwrap_or(false);

    if first_is_script {
        let mut run = profile.run_command.clone();
        run.extend(flags.iter().cloned());
        run.extend(tokens.iter().cloned());
        return run;
    }

    if !flags.is_empty() && Some(first.as_str()) == runtime {
        let mut run = profile.run_command.clone();
        run.extend(flags.iter().cloned());
        // Keep any flags the caller already passed, minus duplicates of ours
        run.extend(
            tokens[1..]
                .iter()
                .filter(|t| !flags.contains(*t))
                .cloned(),
        );
        return run;
    }

    tokens.to_vec()
}

fn synthesize_manifest(format: ManifestFormat, deps: &DependencySet) -> String {
    match format {
        ManifestFormat::Lines => {
            let mut out = String::new();
            for dep in deps {
                out.push_str(dep);
                out.push('\n');
            }
            out
        }
        ManifestFormat::PackageJson => {
            let dependencies: serde_json::Map<String, serde_json::Value> = deps
                .iter()
                .map(|dep| (dep.to_string(), serde_json::Value::from("latest")))
                .collect();
            let manifest = serde_json::json!({ "dependencies": dependencies });
            // Serializing an in-memory Value cannot fail
            serde_json::to_string_pretty(&manifest).unwrap_or_default()
        }
        ManifestFormat::GoMod => "module sandbox\n".to_string(),
    }
}

const SHELL_SAFE: &str = "_./:=@%+,-";

/// Single-quote a token for `/bin/sh` when it holds anything outside the safe set
pub fn shell_quote(token: &str) -> String {
    if !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || SHELL_SAFE.contains(c))
    {
        return token.to_string();
    }
    format!("'{}'", token.replace('\'', r"'\''"))
}

pub fn shell_join(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|t| shell_quote(t))
        .collect::<Vec<_>>()
        .join(" ")
}
