// ABOUTME: Tar archive codec for moving files into and out of sandboxes
// ABOUTME: Anchors directory trees under their base name and preserves permission bits

use crate::compose::StagedFile;
use crate::error::{Result, SandboxError};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Other,
}

/// Metadata of one archive member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub modified: DateTime<Utc>,
}

fn archive_error(context: &str, err: io::Error) -> SandboxError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        SandboxError::Permission(format!("{}: {}", context, err))
    } else {
        SandboxError::Archive(format!("{}: {}", context, err))
    }
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)
}

fn mtime_of(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn header_for(kind: EntryType, size: u64, mode: u32, mtime: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(mtime);
    header
}

/// Archive path for `rel` under `base`, always with forward slashes
fn anchored_path(base: &str, rel: &Path) -> String {
    let mut path = base.to_string();
    for component in rel.components() {
        if let Component::Normal(part) = component {
            path.push('/');
            path.push_str(&part.to_string_lossy());
        }
    }
    path
}

/// Archive a directory so it unpacks as a single `<basename>/...` subtree.
///
/// Entries follow a sorted walk, so the same tree always yields the same
/// member order. Directories become header-only entries; symlinks and special
/// files are skipped.
pub fn build_dir_archive(local_dir: &Path) -> Result<Vec<u8>> {
    if !local_dir.exists() {
        return Err(SandboxError::PathNotFound(local_dir.display().to_string()));
    }
    if !local_dir.is_dir() {
        return Err(SandboxError::InvalidArgument(format!(
            "{} is not a directory",
            local_dir.display()
        )));
    }

    let root = fs::canonicalize(local_dir)?;
    let base = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            SandboxError::InvalidArgument(format!(
                "cannot archive {} without a base name",
                local_dir.display()
            ))
        })?;

    let mut builder = Builder::new(Vec::new());
    let mut files = 0usize;

    for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let context = e
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| root.display().to_string());
            match e.into_io_error() {
                Some(io_err) => archive_error(&context, io_err),
                None => SandboxError::Archive(format!("{}: filesystem loop", context)),
            }
        })?;

        let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
        let path = anchored_path(&base, rel);
        let file_type = entry.file_type();
        let meta = entry
            .metadata()
            .map_err(|e| SandboxError::Archive(format!("{}: {}", path, e)))?;

        if file_type.is_dir() {
            let mut header = header_for(EntryType::Directory, 0, mode_of(&meta), mtime_of(&meta));
            builder
                .append_data(&mut header, format!("{}/", path), io::empty())
                .map_err(|e| archive_error(&path, e))?;
        } else if file_type.is_file() {
            let mut header = header_for(
                EntryType::Regular,
                meta.len(),
                mode_of(&meta),
                mtime_of(&meta),
            );
            let file = fs::File::open(entry.path()).map_err(|e| archive_error(&path, e))?;
            builder
                .append_data(&mut header, &path, file)
                .map_err(|e| archive_error(&path, e))?;
            files += 1;
        } else {
            warn!(path = %entry.path().display(), "Skipping symlink or special file");
        }
    }

    let data = builder
        .into_inner()
        .map_err(|e| archive_error("finalizing archive", e))?;
    debug!(base = %base, files, bytes = data.len(), "Built directory archive");
    Ok(data)
}

/// Archive one regular file under `name`
pub fn build_file_archive(local_file: &Path, name: &str) -> Result<Vec<u8>> {
    let meta = match fs::metadata(local_file) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SandboxError::PathNotFound(local_file.display().to_string()))
        }
        Err(e) => return Err(archive_error(&local_file.display().to_string(), e)),
    };
    if meta.is_dir() {
        return Err(SandboxError::InvalidArgument(format!(
            "{} is a directory, not a file",
            local_file.display()
        )));
    }

    let mut builder = Builder::new(Vec::new());
    let mut header = header_for(
        EntryType::Regular,
        meta.len(),
        mode_of(&meta),
        mtime_of(&meta),
    );
    let file = fs::File::open(local_file).map_err(|e| archive_error(name, e))?;
    builder
        .append_data(&mut header, name, file)
        .map_err(|e| archive_error(name, e))?;
    builder
        .into_inner()
        .map_err(|e| archive_error("finalizing archive", e))
}

/// Archive in-memory files at their relative paths
pub fn build_staged_archive(files: &[StagedFile]) -> Result<Vec<u8>> {
    let mtime = Utc::now().timestamp().max(0) as u64;
    let mut builder = Builder::new(Vec::new());
    for file in files {
        let mut header = header_for(
            EntryType::Regular,
            file.contents.len() as u64,
            file.mode,
            mtime,
        );
        builder
            .append_data(&mut header, &file.path, file.contents.as_slice())
            .map_err(|e| archive_error(&file.path, e))?;
    }
    builder
        .into_inner()
        .map_err(|e| archive_error("finalizing archive", e))
}

fn entry_meta<R: Read>(entry: &tar::Entry<'_, R>) -> Result<ArchiveEntry> {
    let header = entry.header();
    let path = entry
        .path()
        .map_err(|e| archive_error("reading entry path", e))?
        .to_string_lossy()
        .trim_end_matches('/')
        .to_string();
    let kind = match header.entry_type() {
        t if t.is_file() => EntryKind::File,
        t if t.is_dir() => EntryKind::Directory,
        _ => EntryKind::Other,
    };
    let mode = header
        .mode()
        .map_err(|e| archive_error(&path, e))?;
    let mtime = header.mtime().map_err(|e| archive_error(&path, e))?;
    let size = header.size().map_err(|e| archive_error(&path, e))?;

    Ok(ArchiveEntry {
        path,
        kind,
        size,
        mode,
        modified: Utc
            .timestamp_opt(mtime as i64, 0)
            .single()
            .unwrap_or_default(),
    })
}

/// Read every member with its payload; directories carry an empty payload
pub fn read_entries(data: &[u8]) -> Result<Vec<(ArchiveEntry, Vec<u8>)>> {
    let mut archive = Archive::new(data);
    let mut out = Vec::new();
    for entry in archive
        .entries()
        .map_err(|e| archive_error("reading archive", e))?
    {
        let mut entry = entry.map_err(|e| archive_error("reading archive", e))?;
        let meta = entry_meta(&entry)?;
        let mut payload = Vec::new();
        if meta.kind == EntryKind::File {
            entry
                .read_to_end(&mut payload)
                .map_err(|e| archive_error(&meta.path, e))?;
        }
        out.push((meta, payload));
    }
    Ok(out)
}

pub fn list_entries(data: &[u8]) -> Result<Vec<ArchiveEntry>> {
    Ok(read_entries(data)?.into_iter().map(|(meta, _)| meta).collect())
}

/// Unpack an archive beneath `dest`, creating it first
pub fn extract_archive(data: &[u8], dest: &Path) -> Result<Vec<ArchiveEntry>> {
    fs::create_dir_all(dest).map_err(|e| archive_error(&dest.display().to_string(), e))?;

    let mut archive = Archive::new(data);
    archive.set_preserve_permissions(true);
    let mut extracted = Vec::new();
    for entry in archive
        .entries()
        .map_err(|e| archive_error("reading archive", e))?
    {
        let mut entry = entry.map_err(|e| archive_error("reading archive", e))?;
        let meta = entry_meta(&entry)?;
        if meta.kind == EntryKind::Other {
            warn!(path = %meta.path, "Skipping unsupported archive member");
            continue;
        }
        // unpack_in refuses members that would escape `dest`
        let placed = entry
            .unpack_in(dest)
            .map_err(|e| archive_error(&meta.path, e))?;
        if !placed {
            return Err(SandboxError::Archive(format!(
                "archive member escapes destination: {}",
                meta.path
            )));
        }
        extracted.push(meta);
    }
    Ok(extracted)
}

/// Write the single regular file held by `data` to `dest`, restoring its mode
pub fn extract_single_file(data: &[u8], dest: &Path) -> Result<ArchiveEntry> {
    let mut found: Option<(ArchiveEntry, Vec<u8>)> = None;

    for (meta, payload) in read_entries(data)? {
        match meta.kind {
            EntryKind::Directory => {
                return Err(SandboxError::InvalidArgument(format!(
                    "{} is a directory, not a file",
                    meta.path
                )))
            }
            EntryKind::Other => {
                return Err(SandboxError::Archive(format!(
                    "{} is not a regular file",
                    meta.path
                )))
            }
            EntryKind::File if found.is_some() => {
                return Err(SandboxError::Archive(
                    "expected exactly one file in archive".to_string(),
                ))
            }
            EntryKind::File => found = Some((meta, payload)),
        }
    }

    let (meta, payload) =
        found.ok_or_else(|| SandboxError::Archive("archive contains no file".to_string()))?;

    let dest_label = dest.display().to_string();
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| archive_error(&dest_label, e))?;
    }
    fs::write(dest, &payload).map_err(|e| archive_error(&dest_label, e))?;
    apply_mode(dest, meta.mode).map_err(|e| archive_error(&dest_label, e))?;

    debug!(
        dest = %dest_label,
        size = payload.len(),
        mode = format!("{:o}", meta.mode),
        "Extracted file from archive"
    );
    Ok(meta)
}
