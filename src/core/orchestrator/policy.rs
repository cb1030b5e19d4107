//! Turns a spawn request plus the stored profile and policies into the
//! configuration a run is pinned to.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::{Error, Result};
use crate::core::model::{PolicyRules, Profile, ResolvedConfig, RunnerType};

use super::workspace::normalize_scope;

pub const DEFAULT_POLICY_KEY: &str = "default";

pub fn profile_policy_key(profile_key: &str) -> String {
    format!("profile:{}", profile_key)
}

/// Request-level knobs that take part in resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveInput {
    pub runner_type: Option<RunnerType>,
    pub requires_approval: Option<bool>,
    pub timeout: Option<Duration>,
    pub workspace_path: Option<String>,
    pub scope_path: Option<String>,
}

/// Engine-wide fallbacks.
#[derive(Debug, Clone)]
pub struct ResolveDefaults {
    pub timeout: Duration,
    pub requires_approval: bool,
    pub allow_list: Vec<RunnerType>,
    pub root: PathBuf,
}

/// Precedence: the policy forces `requires_approval` when it sets it; else
/// the request, the profile, then the engine default. The timeout comes from
/// the request, the profile or the default, capped by the policy maximum.
pub fn resolve(
    input: &ResolveInput,
    profile: Option<&Profile>,
    rules: &PolicyRules,
    defaults: &ResolveDefaults,
) -> Result<ResolvedConfig> {
    let runner_type = match (input.runner_type, profile) {
        (Some(requested), Some(p)) if requested != p.runner_type => {
            return Err(Error::invalid_args(format!(
                "profile '{}' uses runner {}, not {}",
                p.key, p.runner_type, requested
            )));
        }
        (Some(requested), _) => requested,
        (None, Some(p)) => p.runner_type,
        (None, None) => RunnerType::default(),
    };

    let allowed = if rules.runner_allow_list.is_empty() {
        defaults.allow_list.clone()
    } else {
        rules
            .runner_allow_list
            .iter()
            .filter_map(|t| RunnerType::from_tag(t))
            .collect()
    };
    if !allowed.contains(&runner_type) {
        return Err(Error::invalid_args(format!(
            "runner type {} is not allowed",
            runner_type
        )));
    }

    let requires_approval = rules
        .requires_approval
        .or(input.requires_approval)
        .or(profile.map(|p| p.requires_approval))
        .unwrap_or(defaults.requires_approval);

    let mut timeout = match input.timeout {
        Some(t) if t.is_zero() => {
            return Err(Error::invalid_args("timeout must be greater than zero"));
        }
        Some(t) => t,
        None => profile
            .filter(|p| p.default_timeout_minutes > 0)
            .map(|p| {
                Duration::from_secs((p.default_timeout_minutes as u64).saturating_mul(60))
            })
            .unwrap_or(defaults.timeout),
    };
    if let Some(max) = rules.max_timeout_minutes.filter(|m| *m > 0) {
        timeout = timeout.min(Duration::from_secs((max as u64).saturating_mul(60)));
    }

    let project_root = resolve_root(input.workspace_path.as_deref(), &defaults.root)?;
    let scope_path = normalize_scope(input.scope_path.as_deref().unwrap_or_default())?;
    let scope_dir = if scope_path.is_empty() {
        project_root.clone()
    } else {
        project_root.join(&scope_path)
    };
    if !scope_dir.is_dir() {
        return Err(Error::invalid_args(format!(
            "scope_path '{}' does not exist under {}",
            scope_path,
            project_root.display()
        )));
    }

    Ok(ResolvedConfig {
        runner_type,
        requires_approval,
        timeout_ms: timeout.as_millis().min(i64::MAX as u128) as i64,
        project_root: project_root.to_string_lossy().into_owned(),
        scope_path,
        profile_key: profile.map(|p| p.key.clone()),
        runner_allow_list: allowed.iter().map(|t| t.as_str().to_string()).collect(),
        runner_options: profile.map(|p| p.config.clone()).unwrap_or_default(),
    })
}

fn resolve_root(requested: Option<&str>, fallback: &Path) -> Result<PathBuf> {
    let root = match requested.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) => PathBuf::from(p),
        None => fallback.to_path_buf(),
    };
    if !root.is_absolute() {
        return Err(Error::invalid_args(format!(
            "workspace_path '{}' must be absolute",
            root.display()
        )));
    }
    if !root.is_dir() {
        return Err(Error::invalid_args(format!(
            "workspace_path '{}' is not a directory",
            root.display()
        )));
    }
    root.canonicalize()
        .map_err(|e| Error::invalid_args("workspace_path cannot be resolved").with_source(e))
}
