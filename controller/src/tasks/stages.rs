//! Stage adapter contract consumed by the reconcile engine
//!
//! Fetch, template and deploy are performed by external tools. The engine only
//! sees the traits below and the [`StageResult`] each call produces.

use crate::crds::{AppFetch, AppTemplate, DeployStatus, StageStatus};
use crate::tasks::cluster::{ClusterAccess, ClusterResolver};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Pipeline stage (delete and inspect are deploy-tool operations)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Template,
    Deploy,
    Delete,
    Inspect,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fetch => "Fetch",
            Self::Template => "Template",
            Self::Deploy => "Deploy",
            Self::Delete => "Delete",
            Self::Inspect => "Inspect",
        };
        f.write_str(name)
    }
}

/// Outcome of one stage adapter call
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageResult {
    #[must_use]
    pub fn success(started_at: DateTime<Utc>, stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            error: None,
            started_at,
            updated_at: Utc::now(),
        }
    }

    /// A failure that never reached a tool process
    #[must_use]
    pub fn failure(started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            exit_code: 1,
            stdout: String::new(),
            stderr: error.clone(),
            error: Some(error),
            started_at,
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }

    /// Most useful description of a failure: stderr, else the error text
    #[must_use]
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        self.error
            .clone()
            .unwrap_or_else(|| format!("exit code {}", self.exit_code))
    }

    #[must_use]
    pub fn to_stage_status(&self) -> StageStatus {
        StageStatus {
            exit_code: self.effective_exit_code(),
            started_at: Some(self.started_at),
            updated_at: Some(self.updated_at),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            error: self.error.clone().unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn to_deploy_status(&self) -> DeployStatus {
        DeployStatus {
            exit_code: self.effective_exit_code(),
            started_at: Some(self.started_at),
            updated_at: Some(self.updated_at),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            finished: true,
            error: self.error.clone().unwrap_or_default(),
        }
    }

    // An adapter error with a zero exit code must still read as failed.
    fn effective_exit_code(&self) -> i32 {
        if self.exit_code == 0 && self.error.is_some() {
            1
        } else {
            self.exit_code
        }
    }
}

/// Where and as what the deploy tool operates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    /// Deploy-tool application name (e.g. `simple-app-ctrl`)
    pub app_name: String,
    /// Namespace holding the deploy tool's app record
    pub namespace: String,
    pub into_ns: Option<String>,
    pub map_ns: Vec<String>,
    pub access: ClusterAccess,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Materialize every fetch source under `dst`
    async fn fetch(&self, namespace: &str, sources: &[AppFetch], dst: &Path) -> StageResult;
}

#[async_trait]
pub trait Templater: Send + Sync {
    /// Run the template steps over `fetched`; stdout carries the rendered YAML
    async fn template(
        &self,
        namespace: &str,
        app_name: &str,
        steps: &[AppTemplate],
        fetched: &Path,
    ) -> StageResult;
}

#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, target: &DeployTarget, templated: &str, args: &[String]) -> StageResult;

    async fn delete(&self, target: &DeployTarget, args: &[String]) -> StageResult;

    async fn inspect(&self, target: &DeployTarget, args: &[String]) -> StageResult;
}

/// The adapters the engine runs, shareable across reconciles
#[derive(Clone)]
pub struct Stages {
    pub fetcher: Arc<dyn Fetcher>,
    pub templater: Arc<dyn Templater>,
    pub deployer: Arc<dyn Deployer>,
    /// Deploy credentials for each App
    pub clusters: Arc<dyn ClusterResolver>,
}

impl Stages {
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        templater: Arc<dyn Templater>,
        deployer: Arc<dyn Deployer>,
        clusters: Arc<dyn ClusterResolver>,
    ) -> Self {
        Self {
            fetcher,
            templater,
            deployer,
            clusters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::StageRecord;

    #[test]
    fn adapter_error_with_zero_exit_is_recorded_as_failure() {
        let mut result = StageResult::success(Utc::now(), "");
        result.error = Some("connection reset".to_string());

        let status = result.to_stage_status();
        assert_eq!(status.exit_code, 1);
        assert!(status.is_failed());
        assert_eq!(result.failure_message(), "connection reset");
    }

    #[test]
    fn deploy_status_is_marked_finished() {
        let result = StageResult::failure(Utc::now(), "kapp: Error: timed out");
        let status = result.to_deploy_status();
        assert!(status.finished);
        assert!(status.is_failed());
        assert_eq!(status.stderr, "kapp: Error: timed out");
    }
}
