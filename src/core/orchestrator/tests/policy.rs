use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::core::error::ErrorKind;
use crate::core::model::{PolicyRules, Profile, RunnerType};
use crate::core::orchestrator::idempotency::{fingerprint, normalize_key};
use crate::core::orchestrator::policy::{ResolveDefaults, ResolveInput, resolve};
use crate::core::orchestrator::SpawnRequest;

fn defaults(root: &std::path::Path) -> ResolveDefaults {
    ResolveDefaults {
        timeout: Duration::from_secs(30 * 60),
        requires_approval: false,
        allow_list: RunnerType::ALL.to_vec(),
        root: root.to_path_buf(),
    }
}

fn profile(requires_approval: bool, minutes: i64) -> Profile {
    let mut config = serde_json::Map::new();
    config.insert("model".into(), serde_json::json!("large"));
    Profile {
        id: Uuid::new_v4(),
        key: "careful".into(),
        runner_type: RunnerType::Codex,
        config,
        default_timeout_minutes: minutes,
        requires_approval,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[test]
fn defaults_apply_without_profile_or_policy() {
    let root = tempfile::tempdir().unwrap();
    let cfg = resolve(
        &ResolveInput::default(),
        None,
        &PolicyRules::default(),
        &defaults(root.path()),
    )
    .unwrap();
    assert_eq!(cfg.runner_type, RunnerType::ClaudeCode);
    assert!(!cfg.requires_approval);
    assert_eq!(cfg.timeout_ms, 30 * 60 * 1000);
    assert_eq!(cfg.scope_path, "");
    assert_eq!(
        std::path::PathBuf::from(&cfg.project_root),
        root.path().canonicalize().unwrap()
    );
    assert!(cfg.profile_key.is_none());
}

#[test]
fn profile_supplies_runner_timeout_and_options() {
    let root = tempfile::tempdir().unwrap();
    let p = profile(true, 5);
    let cfg = resolve(
        &ResolveInput::default(),
        Some(&p),
        &PolicyRules::default(),
        &defaults(root.path()),
    )
    .unwrap();
    assert_eq!(cfg.runner_type, RunnerType::Codex);
    assert!(cfg.requires_approval);
    assert_eq!(cfg.timeout_ms, 5 * 60 * 1000);
    assert_eq!(cfg.profile_key.as_deref(), Some("careful"));
    assert_eq!(cfg.runner_options.get("model"), Some(&serde_json::json!("large")));
}

#[test]
fn request_overrides_profile_but_policy_overrides_both() {
    let root = tempfile::tempdir().unwrap();
    let p = profile(true, 5);
    let input = ResolveInput {
        requires_approval: Some(false),
        timeout: Some(Duration::from_secs(120 * 60)),
        ..ResolveInput::default()
    };

    let cfg = resolve(&input, Some(&p), &PolicyRules::default(), &defaults(root.path())).unwrap();
    assert!(!cfg.requires_approval);
    assert_eq!(cfg.timeout_ms, 120 * 60 * 1000);

    let rules = PolicyRules {
        requires_approval: Some(true),
        max_timeout_minutes: Some(60),
        runner_allow_list: Vec::new(),
    };
    let cfg = resolve(&input, Some(&p), &rules, &defaults(root.path())).unwrap();
    assert!(cfg.requires_approval);
    assert_eq!(cfg.timeout_ms, 60 * 60 * 1000);
}

#[test]
fn allow_list_from_policy_wins_over_settings() {
    let root = tempfile::tempdir().unwrap();
    let rules = PolicyRules {
        runner_allow_list: vec!["codex".into()],
        ..PolicyRules::default()
    };
    let err = resolve(&ResolveInput::default(), None, &rules, &defaults(root.path())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgs);

    let input = ResolveInput {
        runner_type: Some(RunnerType::Codex),
        ..ResolveInput::default()
    };
    let cfg = resolve(&input, None, &rules, &defaults(root.path())).unwrap();
    assert_eq!(cfg.runner_allow_list, vec!["codex".to_string()]);
}

#[test]
fn conflicting_runner_and_profile_is_invalid() {
    let root = tempfile::tempdir().unwrap();
    let input = ResolveInput {
        runner_type: Some(RunnerType::OpenCode),
        ..ResolveInput::default()
    };
    let err = resolve(&input, Some(&profile(false, 5)), &PolicyRules::default(), &defaults(root.path()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgs);
}

#[test]
fn bad_workspace_inputs_are_invalid() {
    let root = tempfile::tempdir().unwrap();
    let cases = [
        ResolveInput {
            workspace_path: Some("relative/dir".into()),
            ..ResolveInput::default()
        },
        ResolveInput {
            workspace_path: Some(root.path().join("missing").to_string_lossy().into_owned()),
            ..ResolveInput::default()
        },
        ResolveInput {
            scope_path: Some("../outside".into()),
            ..ResolveInput::default()
        },
        ResolveInput {
            scope_path: Some("not/there".into()),
            ..ResolveInput::default()
        },
        ResolveInput {
            timeout: Some(Duration::ZERO),
            ..ResolveInput::default()
        },
    ];
    for input in cases {
        let err = resolve(&input, None, &PolicyRules::default(), &defaults(root.path())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgs, "{:?}", input);
    }
}

#[test]
fn fingerprint_ignores_the_key_itself() {
    let mut a = SpawnRequest {
        task: "add a README".into(),
        runner_type: Some(RunnerType::ClaudeCode),
        ..SpawnRequest::default()
    };
    let mut b = a.clone();
    a.idempotency_key = Some("k1".into());
    b.idempotency_key = Some("k2".into());
    assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());

    b.timeout = Some(Duration::from_secs(60));
    assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    assert_eq!(fingerprint(&a).unwrap().len(), 64);
}

#[test]
fn blank_keys_mean_no_idempotency() {
    assert_eq!(normalize_key(None), None);
    assert_eq!(normalize_key(Some("  ")), None);
    assert_eq!(normalize_key(Some(" k ")), Some("k".to_string()));
}
