//! Locating agent CLI binaries.
//!
//! Lookup order for each CLI: the `cli_path.<cli>` setting, then the CLI's
//! environment variable, then `PATH`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cli::CliType;
use crate::error::CliError;
use crate::store::Database;

/// Resolves a [`CliType`] to an executable path.
#[derive(Clone, Default)]
pub struct BinaryResolver {
    store: Option<Arc<dyn Database>>,
}

impl BinaryResolver {
    /// Resolver without settings overrides (environment and PATH only).
    pub fn new() -> Self {
        Self { store: None }
    }

    /// Resolver that consults the settings table first.
    pub fn with_store(store: Arc<dyn Database>) -> Self {
        Self { store: Some(store) }
    }

    /// Find the executable for `cli`.
    pub async fn resolve(&self, cli: CliType) -> Result<PathBuf, CliError> {
        if let Some(path) = self.from_settings(cli).await {
            debug!(cli = %cli, path = %path.display(), "Using CLI path from settings");
            return Ok(path);
        }

        if let Ok(raw) = std::env::var(cli.env_var()) {
            let raw = raw.trim();
            if !raw.is_empty() {
                debug!(cli = %cli, env_var = cli.env_var(), "Using CLI path from environment");
                return Ok(PathBuf::from(raw));
            }
        }

        let path_var = std::env::var_os("PATH").unwrap_or_default();
        find_in_path(cli.binary_name(), &path_var).ok_or(CliError::BinaryNotFound {
            cli,
            env_var: cli.env_var(),
        })
    }

    async fn from_settings(&self, cli: CliType) -> Option<PathBuf> {
        let store = self.store.as_ref()?;
        match store.get_setting(&cli.setting_key()).await {
            Ok(Some(value)) => value
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            Ok(None) => None,
            Err(e) => {
                warn!(cli = %cli, error = %e, "Failed to read CLI path setting");
                None
            }
        }
    }
}

/// Search a `PATH`-style variable for an executable called `name`.
pub fn find_in_path(name: &str, path_var: &std::ffi::OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    #[cfg(unix)]
    fn make_executable(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn finds_executable_in_later_path_entry() {
        let empty = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let expected = make_executable(bin.path(), "gemini");

        let path_var = std::env::join_paths([empty.path(), bin.path()]).unwrap();
        assert_eq!(find_in_path("gemini", &path_var), Some(expected));
    }

    #[cfg(unix)]
    #[test]
    fn skips_non_executable_files() {
        let bin = tempfile::tempdir().unwrap();
        std::fs::write(bin.path().join("codex"), "not a program").unwrap();

        let path_var = std::env::join_paths([bin.path()]).unwrap();
        assert_eq!(find_in_path("codex", &path_var), None);
    }

    #[tokio::test]
    async fn settings_override_wins() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.set_setting("cli_path.codex", &serde_json::json!("/opt/codex/bin/codex"))
            .await
            .unwrap();

        let resolver = BinaryResolver::with_store(db);
        let path = resolver.resolve(CliType::Codex).await.unwrap();
        assert_eq!(path, PathBuf::from("/opt/codex/bin/codex"));
    }

    #[tokio::test]
    async fn blank_setting_is_ignored() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.set_setting("cli_path.claude", &serde_json::json!("  "))
            .await
            .unwrap();

        let resolver = BinaryResolver::with_store(db);
        assert!(resolver.from_settings(CliType::Claude).await.is_none());
    }
}
