//! CLI health checks — availability and version checks.
//!
//! Each check runs `<cli> --version` in a throwaway directory, bounded by a
//! timeout. Results are cached until the next check.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cli::CliType;
use crate::cli::binary::BinaryResolver;

/// Default check timeout.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(60);

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.\d+\.\d+)").expect("valid version regex"));

/// Outcome of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    NotFound,
}

/// Cached check result for one CLI.
#[derive(Debug, Clone, Serialize)]
pub struct CliHealth {
    pub cli: CliType,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl CliHealth {
    fn new(cli: CliType, status: HealthStatus) -> Self {
        Self {
            cli,
            status,
            version: None,
            path: None,
            detail: None,
            checked_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Checks every supported CLI and keeps the latest results.
pub struct HealthChecker {
    resolver: BinaryResolver,
    timeout: Duration,
    results: RwLock<HashMap<CliType, CliHealth>>,
}

impl HealthChecker {
    pub fn new(resolver: BinaryResolver, timeout: Duration) -> Self {
        Self {
            resolver,
            timeout,
            results: RwLock::new(HashMap::new()),
        }
    }

    /// Check one CLI and cache the result.
    pub async fn check(&self, cli: CliType) -> CliHealth {
        let health = self.run_version_check(cli).await;
        match health.status {
            HealthStatus::Healthy => {
                debug!(cli = %cli, version = ?health.version, "CLI healthy")
            }
            HealthStatus::NotFound => debug!(cli = %cli, "CLI not installed"),
            HealthStatus::Unhealthy => {
                warn!(cli = %cli, detail = ?health.detail, "CLI unhealthy")
            }
        }
        self.results.write().await.insert(cli, health.clone());
        health
    }

    /// Check every CLI concurrently.
    pub async fn check_all(&self) -> Vec<CliHealth> {
        let results =
            futures::future::join_all(CliType::ALL.iter().map(|cli| self.check(*cli))).await;
        let healthy = results.iter().filter(|h| h.is_healthy()).count();
        info!(healthy, total = results.len(), "CLI health check complete");
        results
    }

    /// Last cached result for `cli`.
    pub async fn get(&self, cli: CliType) -> Option<CliHealth> {
        self.results.read().await.get(&cli).cloned()
    }

    /// All cached results in check order.
    pub async fn snapshot(&self) -> Vec<CliHealth> {
        let results = self.results.read().await;
        CliType::ALL
            .iter()
            .filter_map(|cli| results.get(cli).cloned())
            .collect()
    }

    async fn run_version_check(&self, cli: CliType) -> CliHealth {
        let path = match self.resolver.resolve(cli).await {
            Ok(path) => path,
            Err(e) => {
                let mut health = CliHealth::new(cli, HealthStatus::NotFound);
                health.detail = Some(e.to_string());
                return health;
            }
        };

        let mut health = CliHealth::new(cli, HealthStatus::Unhealthy);
        health.path = Some(path.clone());

        let scratch = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                health.detail = Some(format!("failed to create scratch directory: {e}"));
                return health;
            }
        };

        let child = Command::new(&path)
            .arg("--version")
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                health.detail = Some(format!("failed to spawn: {e}"));
                return health;
            }
        };

        // On timeout the child is dropped, and `kill_on_drop` kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                health.detail = Some(format!("failed waiting for version check: {e}"));
                return health;
            }
            Err(_) => {
                health.detail = Some(format!("timed out after {}s", self.timeout.as_secs()));
                return health;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            health.detail = Some(format!(
                "exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
            return health;
        }
        if stdout.trim().is_empty() {
            health.detail = Some("no output".to_string());
            return health;
        }

        health.status = HealthStatus::Healthy;
        health.version = extract_version(&stdout);
        health
    }
}

/// Pull the first `x.y.z` out of `--version` output.
pub fn extract_version(output: &str) -> Option<String> {
    VERSION_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
