//! Status types shared by the `App` and `PackageRepository` resources

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition types recorded by the reconcile engine
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    Reconciling,
    ReconcileSucceeded,
    ReconcileFailed,
    Deleting,
    DeleteFailed,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reconciling => "Reconciling",
            Self::ReconcileSucceeded => "ReconcileSucceeded",
            Self::ReconcileFailed => "ReconcileFailed",
            Self::Deleting => "Deleting",
            Self::DeleteFailed => "DeleteFailed",
        };
        f.write_str(name)
    }
}

/// Status of a condition (True, False, or Unknown)
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Condition for an `App` or `PackageRepository`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Reason for the condition's last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message about the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    #[must_use]
    pub fn new(condition_type: ConditionType) -> Self {
        Self {
            condition_type,
            status: ConditionStatus::True,
            reason: None,
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Status fields common to every reconciled resource
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenericStatus {
    /// Generation of the spec last acted upon
    #[serde(default)]
    pub observed_generation: i64,

    /// Ordered conditions; the first one is the headline state
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Free text fallback shown when no condition applies
    #[serde(default)]
    pub friendly_description: String,

    /// Stderr of the stage that made the last reconcile fail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub useful_error_message: String,
}

/// Timestamp and exit-code view over a stage's recorded status.
///
/// Every check compares a stage's own `started_at` / `updated_at` pair only;
/// timestamps of neighbouring stages never take part.
pub trait StageRecord {
    fn exit_code(&self) -> i32;
    fn started_at(&self) -> Option<DateTime<Utc>>;
    fn updated_at(&self) -> Option<DateTime<Utc>>;

    /// A non-zero exit recorded no earlier than the stage's own start.
    ///
    /// An exit code left over from a previous run (updated before the current
    /// start) is not a failure of the current run.
    fn is_failed(&self) -> bool {
        if self.exit_code() == 0 {
            return false;
        }
        match (self.started_at(), self.updated_at()) {
            (Some(started), Some(updated)) => updated >= started,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    /// Started but no terminal update recorded for that start yet.
    fn is_in_progress(&self) -> bool {
        match (self.started_at(), self.updated_at()) {
            (Some(started), Some(updated)) => started > updated,
            (Some(_), None) => true,
            _ => false,
        }
    }

    fn is_succeeded(&self) -> bool {
        self.exit_code() == 0 && self.updated_at().is_some() && !self.is_in_progress()
    }
}

/// Recorded result of the fetch, template, or inspect stage
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageStatus {
    #[serde(default)]
    pub exit_code: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub stdout: String,

    #[serde(default)]
    pub stderr: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl StageStatus {
    /// Status for a stage that has just started
    #[must_use]
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Self::default()
        }
    }
}

impl StageRecord for StageStatus {
    fn exit_code(&self) -> i32 {
        self.exit_code
    }

    fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

/// Recorded result of the deploy (or delete) stage
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployStatus {
    #[serde(default)]
    pub exit_code: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub stdout: String,

    #[serde(default)]
    pub stderr: String,

    /// Whether the deploy tool exited (successfully or not)
    #[serde(default)]
    pub finished: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl DeployStatus {
    #[must_use]
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Self::default()
        }
    }
}

impl StageRecord for DeployStatus {
    fn exit_code(&self) -> i32 {
        self.exit_code
    }

    fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

/// Status of an `App`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    #[serde(flatten)]
    pub generic: GenericStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch: Option<StageStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<StageStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inspect: Option<StageStatus>,

    #[serde(default)]
    pub consecutive_reconcile_successes: u32,

    #[serde(default)]
    pub consecutive_reconcile_failures: u32,
}

impl AppStatus {
    /// True when a condition of the given type is present with status True
    #[must_use]
    pub fn has_condition(&self, condition_type: ConditionType) -> bool {
        self.generic
            .conditions
            .iter()
            .any(|c| c.condition_type == condition_type && c.status == ConditionStatus::True)
    }

    /// The App has reached `ReconcileSucceeded`
    #[must_use]
    pub fn is_reconciled(&self) -> bool {
        self.has_condition(ConditionType::ReconcileSucceeded)
    }

    #[must_use]
    pub fn is_failing(&self) -> bool {
        self.has_condition(ConditionType::ReconcileFailed)
    }

    /// Time at which the last full reconcile finished, if any
    #[must_use]
    pub fn last_reconcile_time(&self) -> Option<DateTime<Utc>> {
        let deploy = self.deploy.as_ref().and_then(|d| d.updated_at);
        let fetch = self.fetch.as_ref().and_then(|f| f.updated_at);
        let template = self.template.as_ref().and_then(|t| t.updated_at);
        [deploy, template, fetch].into_iter().flatten().max()
    }
}
