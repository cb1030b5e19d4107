use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Home directory of the invoking user, falling back to the working directory.
    fn home_dir() -> PathBuf;

    /// Root data directory.
    /// Unix: `~/.agent-core`, Windows: `%APPDATA%\agent-core`.
    fn data_dir() -> PathBuf;
}

pub const DATA_ROOT_ENV: &str = "DATA_ROOT";

/// `DATA_ROOT` wins over the platform default.
pub(crate) fn resolve_data_dir(default: PathBuf) -> PathBuf {
    resolve_data_dir_with(default, |key| std::env::var(key).ok())
}

pub(crate) fn resolve_data_dir_with(
    default: PathBuf,
    lookup: impl Fn(&str) -> Option<String>,
) -> PathBuf {
    lookup(DATA_ROOT_ENV)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or(default)
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_root_env_overrides_default() {
        let dir = resolve_data_dir_with(PathBuf::from("/home/u/.agent-core"), |k| {
            (k == DATA_ROOT_ENV).then(|| "/srv/agent".to_string())
        });
        assert_eq!(dir, PathBuf::from("/srv/agent"));
    }

    #[test]
    fn blank_data_root_is_ignored() {
        let dir = resolve_data_dir_with(PathBuf::from("/home/u/.agent-core"), |_| {
            Some("  ".to_string())
        });
        assert_eq!(dir, PathBuf::from("/home/u/.agent-core"));
    }
}
