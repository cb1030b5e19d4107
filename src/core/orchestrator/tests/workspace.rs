use std::path::Path;

use uuid::Uuid;

use crate::core::error::ErrorKind;
use crate::core::model::{ChangeType, ResolvedConfig, RunnerType};
use crate::core::orchestrator::workspace::{Workspace, apply_files, normalize_scope, sha256_hex};

fn config(root: &Path, scope: &str) -> ResolvedConfig {
    ResolvedConfig {
        runner_type: RunnerType::ClaudeCode,
        requires_approval: false,
        timeout_ms: 60_000,
        project_root: root.to_string_lossy().into_owned(),
        scope_path: scope.to_string(),
        profile_key: None,
        runner_allow_list: Vec::new(),
        runner_options: serde_json::Map::new(),
    }
}

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::create_dir_all(root.join(".git/objects")).unwrap();
    std::fs::create_dir_all(root.join("target/debug")).unwrap();
    std::fs::write(root.join("src/lib.rs"), "pub fn a() {}\npub fn b() {}\n").unwrap();
    std::fs::write(root.join("src/old.rs"), "// gone soon\n").unwrap();
    std::fs::write(root.join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
    std::fs::write(root.join("target/debug/app"), [0u8, 1, 2]).unwrap();
    dir
}

#[test]
fn provision_copies_scope_without_build_or_vcs_dirs() {
    let root = project();
    let sandboxes = tempfile::tempdir().unwrap();
    let run_id = Uuid::new_v4();
    let ws = Workspace::provision(sandboxes.path(), run_id, &config(root.path(), "")).unwrap();

    assert_eq!(ws.sandbox_id, format!("sbx-{}", run_id));
    assert!(ws.sandbox_path.join("src/lib.rs").exists());
    assert!(!ws.sandbox_path.join(".git").exists());
    assert!(!ws.sandbox_path.join("target").exists());
    assert!(ws.diff().unwrap().is_empty());

    ws.cleanup();
    assert!(!ws.sandbox_path.exists());
}

#[test]
fn diff_reports_added_modified_and_deleted_files() {
    let root = project();
    let sandboxes = tempfile::tempdir().unwrap();
    let ws = Workspace::provision(sandboxes.path(), Uuid::new_v4(), &config(root.path(), "src")).unwrap();

    std::fs::write(ws.sandbox_path.join("lib.rs"), "pub fn a() {}\npub fn c() {}\n").unwrap();
    std::fs::remove_file(ws.sandbox_path.join("old.rs")).unwrap();
    std::fs::write(ws.sandbox_path.join("new.rs"), "pub struct New;\n").unwrap();

    let diff = ws.diff().unwrap();
    let paths: Vec<&str> = diff.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["src/lib.rs", "src/new.rs", "src/old.rs"]);

    let lib = &diff.files[0];
    assert_eq!(lib.change_type, ChangeType::Modified);
    assert_eq!((lib.additions, lib.deletions), (1, 1));
    let original = std::fs::read(root.path().join("src/lib.rs")).unwrap();
    assert_eq!(lib.old_sha256.as_deref(), Some(sha256_hex(&original).as_str()));

    let new = &diff.files[1];
    assert_eq!(new.change_type, ChangeType::Added);
    assert!(new.old_sha256.is_none());
    assert_eq!(new.new_content.as_deref(), Some("pub struct New;\n"));

    let old = &diff.files[2];
    assert_eq!(old.change_type, ChangeType::Deleted);
    assert!(old.new_content.is_none());
    assert_eq!(old.deletions, 1);

    assert!(diff.unified_diff.contains("--- a/src/lib.rs"));
    assert!(diff.unified_diff.contains("+++ b/src/lib.rs"));
    assert!(diff.unified_diff.contains("-pub fn b() {}"));
    assert!(diff.unified_diff.contains("+pub fn c() {}"));
    assert!(diff.unified_diff.contains("--- /dev/null"));
}

#[test]
fn binary_changes_are_flagged_and_not_applied() {
    let root = project();
    let sandboxes = tempfile::tempdir().unwrap();
    let ws = Workspace::provision(sandboxes.path(), Uuid::new_v4(), &config(root.path(), "")).unwrap();
    std::fs::write(ws.sandbox_path.join("logo.png"), [0x89u8, b'P', b'N', b'G', 0, 0]).unwrap();

    let diff = ws.diff().unwrap();
    assert_eq!(diff.files.len(), 1);
    assert!(diff.files[0].binary);
    assert!(diff.unified_diff.starts_with("Binary files"));

    let report = apply_files(root.path(), &diff.files);
    assert!(report.applied.is_empty());
    assert_eq!(report.remaining(), vec!["logo.png".to_string()]);
}

#[test]
fn apply_writes_changes_and_skips_drifted_files() {
    let root = project();
    let sandboxes = tempfile::tempdir().unwrap();
    let ws = Workspace::provision(sandboxes.path(), Uuid::new_v4(), &config(root.path(), "")).unwrap();
    std::fs::write(ws.sandbox_path.join("src/lib.rs"), "pub fn z() {}\n").unwrap();
    std::fs::remove_file(ws.sandbox_path.join("src/old.rs")).unwrap();
    std::fs::create_dir_all(ws.sandbox_path.join("docs")).unwrap();
    std::fs::write(ws.sandbox_path.join("docs/guide.md"), "# Guide\n").unwrap();
    let diff = ws.diff().unwrap();

    // Someone edits lib.rs after the diff was taken.
    std::fs::write(root.path().join("src/lib.rs"), "pub fn edited() {}\n").unwrap();

    let report = apply_files(root.path(), &diff.files);
    assert_eq!(report.applied, vec!["docs/guide.md".to_string(), "src/old.rs".to_string()]);
    assert_eq!(report.remaining(), vec!["src/lib.rs".to_string()]);
    assert!(report.is_partial());

    assert_eq!(
        std::fs::read_to_string(root.path().join("docs/guide.md")).unwrap(),
        "# Guide\n"
    );
    assert!(!root.path().join("src/old.rs").exists());
    assert_eq!(
        std::fs::read_to_string(root.path().join("src/lib.rs")).unwrap(),
        "pub fn edited() {}\n"
    );
}

#[test]
fn added_file_that_appeared_meanwhile_is_not_overwritten() {
    let root = project();
    let sandboxes = tempfile::tempdir().unwrap();
    let ws = Workspace::provision(sandboxes.path(), Uuid::new_v4(), &config(root.path(), "")).unwrap();
    std::fs::write(ws.sandbox_path.join("NEW.md"), "ours\n").unwrap();
    let diff = ws.diff().unwrap();
    std::fs::write(root.path().join("NEW.md"), "theirs\n").unwrap();

    let report = apply_files(root.path(), &diff.files);
    assert!(report.applied.is_empty());
    assert_eq!(std::fs::read_to_string(root.path().join("NEW.md")).unwrap(), "theirs\n");
}

#[test]
fn scope_paths_are_normalized_and_confined() {
    assert_eq!(normalize_scope("").unwrap(), "");
    assert_eq!(normalize_scope(".").unwrap(), "");
    assert_eq!(normalize_scope("./crates//core/").unwrap(), "crates/core");
    for bad in ["../etc", "/abs/path", "a/../../b"] {
        let err = normalize_scope(bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgs, "{}", bad);
    }
}

#[test]
fn missing_scope_directory_is_rejected() {
    let root = project();
    let sandboxes = tempfile::tempdir().unwrap();
    let err = Workspace::provision(sandboxes.path(), Uuid::new_v4(), &config(root.path(), "nope")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgs);
}
