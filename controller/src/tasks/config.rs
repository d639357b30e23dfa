//! App Controller Configuration
//!
//! Reconcile pacing, tool binaries and watch scope. Loaded from the mounted
//! config file, falling back to defaults when the file is absent.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{api::Api, Client};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Reconcile pacing
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// External tool binaries used by the stage adapters
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Watch scope
    #[serde(default)]
    pub controller: WatchConfig,
}

/// Reconcile pacing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileConfig {
    /// Interval between successful reconciles unless a resource overrides it
    #[serde(default = "default_sync_period")]
    pub sync_period_seconds: u64,

    /// Lower bound applied to per-resource sync periods
    #[serde(default = "default_min_sync_period")]
    pub min_sync_period_seconds: u64,

    /// Requeue interval while a resource still reports `Reconciling`
    #[serde(default = "default_reconciling_requeue")]
    pub reconciling_requeue_seconds: u64,

    /// Requeue interval after a reconcile-level error (status write, finalizer)
    #[serde(default = "default_failure_requeue")]
    pub failure_requeue_seconds: u64,
}

fn default_sync_period() -> u64 {
    30 * 60
}

fn default_min_sync_period() -> u64 {
    30
}

fn default_reconciling_requeue() -> u64 {
    5
}

fn default_failure_requeue() -> u64 {
    10
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            sync_period_seconds: default_sync_period(),
            min_sync_period_seconds: default_min_sync_period(),
            reconciling_requeue_seconds: default_reconciling_requeue(),
            failure_requeue_seconds: default_failure_requeue(),
        }
    }
}

impl ReconcileConfig {
    #[must_use]
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_seconds)
    }

    #[must_use]
    pub fn reconciling_requeue(&self) -> Duration {
        Duration::from_secs(self.reconciling_requeue_seconds)
    }

    #[must_use]
    pub fn failure_requeue(&self) -> Duration {
        Duration::from_secs(self.failure_requeue_seconds)
    }

    /// Resolve a resource's `syncPeriod` override, clamped to the minimum.
    /// Unparseable overrides fall back to the global period.
    #[must_use]
    pub fn effective_sync_period(&self, sync_period: Option<&str>) -> Duration {
        let min = Duration::from_secs(self.min_sync_period_seconds);
        sync_period
            .and_then(|raw| parse_duration(raw).ok())
            .map_or_else(|| self.sync_period(), |period| period.max(min))
    }
}

/// Binaries invoked by the process-backed stage adapters
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfig {
    #[serde(default = "default_kapp")]
    pub kapp: String,

    #[serde(default = "default_ytt")]
    pub ytt: String,

    #[serde(default = "default_helm")]
    pub helm: String,

    #[serde(default = "default_git")]
    pub git: String,

    #[serde(default = "default_imgpkg")]
    pub imgpkg: String,

    /// Kill a tool process after this many seconds (0 disables the limit)
    #[serde(default)]
    pub command_timeout_seconds: u64,
}

fn default_kapp() -> String {
    "kapp".to_string()
}

fn default_ytt() -> String {
    "ytt".to_string()
}

fn default_helm() -> String {
    "helm".to_string()
}

fn default_git() -> String {
    "git".to_string()
}

fn default_imgpkg() -> String {
    "imgpkg".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            kapp: default_kapp(),
            ytt: default_ytt(),
            helm: default_helm(),
            git: default_git(),
            imgpkg: default_imgpkg(),
            command_timeout_seconds: 0,
        }
    }
}

impl ToolsConfig {
    #[must_use]
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_seconds > 0).then(|| Duration::from_secs(self.command_timeout_seconds))
    }
}

/// Watch scope configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    /// Restrict watches to one namespace (all namespaces when unset)
    #[serde(default)]
    pub watch_namespace: Option<String>,
}

impl ControllerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let reconcile = &self.reconcile;
        if reconcile.sync_period_seconds == 0 {
            return Err(anyhow::anyhow!(
                "reconcile.syncPeriodSeconds must be greater than zero"
            ));
        }
        if reconcile.min_sync_period_seconds > reconcile.sync_period_seconds {
            return Err(anyhow::anyhow!(
                "reconcile.minSyncPeriodSeconds ({}) must not exceed reconcile.syncPeriodSeconds ({})",
                reconcile.min_sync_period_seconds,
                reconcile.sync_period_seconds
            ));
        }
        if reconcile.reconciling_requeue_seconds == 0 || reconcile.failure_requeue_seconds == 0 {
            return Err(anyhow::anyhow!(
                "reconcile requeue intervals must be greater than zero"
            ));
        }

        let tools = &self.tools;
        for (name, binary) in [
            ("kapp", &tools.kapp),
            ("ytt", &tools.ytt),
            ("helm", &tools.helm),
            ("git", &tools.git),
            ("imgpkg", &tools.imgpkg),
        ] {
            if binary.trim().is_empty() {
                return Err(anyhow::anyhow!("tools.{name} must name a binary"));
            }
        }

        Ok(())
    }

    /// Load configuration from mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Load configuration from a `ConfigMap` through the API
    pub async fn from_configmap(
        client: &Client,
        namespace: &str,
        name: &str,
    ) -> Result<Self, anyhow::Error> {
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        let cm = api.get(name).await?;

        let data = cm
            .data
            .ok_or_else(|| anyhow::anyhow!("ConfigMap has no data"))?;
        let config_str = data
            .get("config.yaml")
            .ok_or_else(|| anyhow::anyhow!("ConfigMap missing config.yaml"))?;

        Ok(serde_yaml::from_str(config_str)?)
    }
}

lazy_static! {
    static ref DURATION_PART: Regex = Regex::new(r"(\d+)(ms|h|m|s)").unwrap();
}

/// Parse a Go-style duration such as `500ms`, `30s`, `10m`, `1h` or `1h30m`.
pub fn parse_duration(raw: &str) -> Result<Duration, anyhow::Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow::anyhow!("empty duration"));
    }

    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in DURATION_PART.captures_iter(trimmed) {
        let whole = caps.get(0).map_or("", |m| m.as_str());
        let value: u64 = caps[1]
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid duration '{raw}': {e}"))?;
        total += match &caps[2] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            _ => Duration::from_secs(value * 3600),
        };
        consumed += whole.len();
    }

    if consumed != trimmed.len() {
        return Err(anyhow::anyhow!("invalid duration '{raw}'"));
    }
    Ok(total)
}
