//! Sandboxed copies of a project scope, tree diffs between scope and
//! sandbox, and applying those diffs back onto the project root.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use similar::{ChangeTag, TextDiff};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::{Error, Result};
use crate::core::model::{ChangeType, Diff, FileChange, ResolvedConfig};

/// Directory names never copied into a sandbox nor diffed.
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules", ".agent-core"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub project_root: PathBuf,
    /// Scope relative to the project root, `/`-separated, empty for the root.
    pub scope_path: String,
    pub sandbox_id: String,
    pub sandbox_path: PathBuf,
}

impl Workspace {
    /// Copy the run's scope into `<sandbox_root>/sbx-<run_id>`.
    pub fn provision(sandbox_root: &Path, run_id: Uuid, config: &ResolvedConfig) -> Result<Self> {
        let project_root = PathBuf::from(&config.project_root);
        let scope_path = normalize_scope(&config.scope_path)?;
        let scope_dir = join_scope(&project_root, &scope_path);
        if !scope_dir.is_dir() {
            return Err(Error::invalid_args(format!(
                "scope '{}' is not a directory under the project root",
                scope_path
            )));
        }

        let sandbox_id = format!("sbx-{}", run_id);
        let sandbox_path = sandbox_root.join(&sandbox_id);
        if sandbox_path.exists() {
            std::fs::remove_dir_all(&sandbox_path)?;
        }
        std::fs::create_dir_all(&sandbox_path)?;
        copy_tree(&scope_dir, &sandbox_path)?;
        debug!(
            "Provisioned sandbox {} from {}",
            sandbox_path.display(),
            scope_dir.display()
        );

        Ok(Self {
            project_root,
            scope_path,
            sandbox_id,
            sandbox_path,
        })
    }

    pub fn scope_dir(&self) -> PathBuf {
        join_scope(&self.project_root, &self.scope_path)
    }

    /// Runner output is written next to the sandbox so it survives cleanup.
    pub fn log_path(&self) -> PathBuf {
        self.sandbox_path.with_extension("log")
    }

    /// Changes the sandbox holds relative to the current scope contents.
    /// Paths are relative to the project root.
    pub fn diff(&self) -> Result<Diff> {
        let before = list_files(&self.scope_dir())?;
        let after = list_files(&self.sandbox_path)?;

        let mut paths: Vec<&String> = before.keys().chain(after.keys()).collect();
        paths.sort();
        paths.dedup();

        let mut files = Vec::new();
        let mut unified = String::new();
        for rel in paths {
            let old = before.get(rel).map(std::fs::read).transpose()?;
            let new = after.get(rel).map(std::fs::read).transpose()?;
            if old == new {
                continue;
            }
            let path = self.project_path(rel);
            let (change, text) = file_change(&path, old.as_deref(), new.as_deref());
            unified.push_str(&text);
            files.push(change);
        }

        Ok(Diff {
            unified_diff: unified,
            files,
        })
    }

    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.sandbox_path) {
            warn!(
                "Failed to remove sandbox {}: {}",
                self.sandbox_path.display(),
                e
            );
        }
    }

    fn project_path(&self, rel: &str) -> String {
        if self.scope_path.is_empty() {
            rel.to_string()
        } else {
            format!("{}/{}", self.scope_path, rel)
        }
    }
}

/// Validate a scope path: relative, without `..`, normalized to `/`.
pub fn normalize_scope(scope: &str) -> Result<String> {
    let trimmed = scope.trim();
    if trimmed.is_empty() || trimmed == "." {
        return Ok(String::new());
    }
    let path = Path::new(trimmed);
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(Error::invalid_args(format!(
                    "scope_path '{}' must be relative and stay inside the project root",
                    scope
                )));
            }
        }
    }
    Ok(parts.join("/"))
}

fn join_scope(root: &Path, scope: &str) -> PathBuf {
    if scope.is_empty() {
        root.to_path_buf()
    } else {
        root.join(scope)
    }
}

fn skipped(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| SKIPPED_DIRS.contains(&n))
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        let target = to.join(entry.file_name());
        if kind.is_dir() {
            if skipped(&entry.file_name()) {
                continue;
            }
            std::fs::create_dir_all(&target)?;
            copy_tree(&entry.path(), &target)?;
        } else if kind.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Regular files under `root`, keyed by `/`-separated relative path.
fn list_files(root: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let mut out = BTreeMap::new();
    if root.is_dir() {
        walk(root, "", &mut out)?;
    }
    Ok(out)
}

fn walk(dir: &Path, prefix: &str, out: &mut BTreeMap<String, PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        if kind.is_dir() {
            if !skipped(&entry.file_name()) {
                walk(&entry.path(), &rel, out)?;
            }
        } else if kind.is_file() {
            out.insert(rel, entry.path());
        }
    }
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn as_text(bytes: &[u8]) -> Option<&str> {
    if bytes.contains(&0) {
        return None;
    }
    std::str::from_utf8(bytes).ok()
}

fn file_change(path: &str, old: Option<&[u8]>, new: Option<&[u8]>) -> (FileChange, String) {
    let change_type = match (old, new) {
        (None, _) => ChangeType::Added,
        (_, None) => ChangeType::Deleted,
        _ => ChangeType::Modified,
    };
    let old_sha256 = old.map(sha256_hex);

    let old_text = old.map(as_text).unwrap_or(Some(""));
    let new_text = new.map(as_text).unwrap_or(Some(""));
    let (Some(old_text), Some(new_text)) = (old_text, new_text) else {
        let change = FileChange {
            path: path.to_string(),
            change_type,
            additions: 0,
            deletions: 0,
            old_sha256,
            new_content: None,
            binary: true,
        };
        return (change, format!("Binary files a/{0} and b/{0} differ\n", path));
    };

    let diff = TextDiff::from_lines(old_text, new_text);
    let mut additions = 0;
    let mut deletions = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => additions += 1,
            ChangeTag::Delete => deletions += 1,
            ChangeTag::Equal => {}
        }
    }
    let old_header = match change_type {
        ChangeType::Added => "/dev/null".to_string(),
        _ => format!("a/{}", path),
    };
    let new_header = match change_type {
        ChangeType::Deleted => "/dev/null".to_string(),
        _ => format!("b/{}", path),
    };
    let text = diff
        .unified_diff()
        .context_radius(3)
        .header(&old_header, &new_header)
        .to_string();

    let change = FileChange {
        path: path.to_string(),
        change_type,
        additions,
        deletions,
        old_sha256,
        new_content: new.map(|_| new_text.to_string()),
        binary: false,
    };
    (change, text)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    /// `(path, reason)` for every file left untouched.
    pub failed: Vec<(String, String)>,
}

impl ApplyReport {
    pub fn remaining(&self) -> Vec<String> {
        self.failed.iter().map(|(path, _)| path.clone()).collect()
    }

    pub fn is_partial(&self) -> bool {
        !self.applied.is_empty() && !self.failed.is_empty()
    }
}

/// Write each change under `project_root`, independently per file. A file
/// whose current content no longer matches the hash recorded when the diff
/// was taken is left alone.
pub fn apply_files(project_root: &Path, files: &[FileChange]) -> ApplyReport {
    let mut report = ApplyReport::default();
    for change in files {
        match apply_one(project_root, change) {
            Ok(()) => report.applied.push(change.path.clone()),
            Err(reason) => {
                warn!("Could not apply {}: {}", change.path, reason);
                report.failed.push((change.path.clone(), reason));
            }
        }
    }
    report
}

fn apply_one(project_root: &Path, change: &FileChange) -> std::result::Result<(), String> {
    let rel = normalize_scope(&change.path).map_err(|e| e.message().to_string())?;
    if rel.is_empty() {
        return Err("empty path".into());
    }
    let target = project_root.join(&rel);

    let current = match std::fs::read(&target) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(format!("unreadable: {}", e)),
    };
    let drifted = match (&change.old_sha256, &current) {
        (None, None) => false,
        (Some(expected), Some(bytes)) => *expected != sha256_hex(bytes),
        _ => true,
    };
    if drifted {
        return Err("file changed since the diff was produced".into());
    }

    match change.change_type {
        ChangeType::Deleted => std::fs::remove_file(&target).map_err(|e| e.to_string()),
        ChangeType::Added | ChangeType::Modified => {
            if change.binary {
                return Err("binary changes cannot be applied".into());
            }
            let content = change
                .new_content
                .as_deref()
                .ok_or_else(|| "diff carries no content for this file".to_string())?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
            std::fs::write(&target, content).map_err(|e| e.to_string())
        }
    }
}

/// Commit `paths` in the project root's git repository. `None` when the
/// root is not a repository.
pub async fn commit_paths(project_root: &Path, paths: &[String], message: &str) -> Result<Option<String>> {
    if !project_root.join(".git").exists() || paths.is_empty() {
        return Ok(None);
    }

    let git = |args: Vec<String>| {
        let root = project_root.to_path_buf();
        async move {
            let output = tokio::process::Command::new("git")
                .args(&args)
                .current_dir(&root)
                .output()
                .await
                .map_err(|e| Error::internal("failed to launch git").with_source(e))?;
            if !output.status.success() {
                return Err(Error::internal(format!(
                    "git {} failed: {}",
                    args.first().map(String::as_str).unwrap_or_default(),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
    };

    let mut add = vec!["add".to_string(), "-A".to_string(), "--".to_string()];
    add.extend(paths.iter().cloned());
    git(add).await?;
    git(vec!["commit".into(), "-m".into(), message.to_string()]).await?;
    let hash = git(vec!["rev-parse".into(), "HEAD".into()]).await?;
    Ok(Some(hash))
}
