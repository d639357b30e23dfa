//! `PackageRepository` Custom Resource Definition
//!
//! A repository is reconciled by the same engine as an `App`: its fetch source
//! is pulled, templated with ytt and deployed with kapp.

use super::app::AppFetch;
use super::status::{AppStatus, DeployStatus, GenericStatus, StageStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `PackageRepository` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "packaging.carvel.dev", version = "v1alpha1", kind = "PackageRepository")]
#[kube(namespaced)]
#[kube(status = "PackageRepositoryStatus")]
#[kube(printcolumn = r#"{"name":"Description","type":"string","jsonPath":".status.friendlyDescription"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct PackageRepositorySpec {
    /// Where to fetch the repository contents from
    pub fetch: AppFetch,

    #[serde(default)]
    pub paused: bool,

    #[serde(default)]
    pub sync_period: Option<String>,
}

/// Status of a `PackageRepository`; mirrors `AppStatus` without inspect
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageRepositoryStatus {
    #[serde(flatten)]
    pub generic: GenericStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch: Option<StageStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<StageStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployStatus>,

    #[serde(default)]
    pub consecutive_reconcile_successes: u32,

    #[serde(default)]
    pub consecutive_reconcile_failures: u32,
}

impl From<&AppStatus> for PackageRepositoryStatus {
    fn from(status: &AppStatus) -> Self {
        Self {
            generic: status.generic.clone(),
            fetch: status.fetch.clone(),
            template: status.template.clone(),
            deploy: status.deploy.clone(),
            consecutive_reconcile_successes: status.consecutive_reconcile_successes,
            consecutive_reconcile_failures: status.consecutive_reconcile_failures,
        }
    }
}

impl From<&PackageRepositoryStatus> for AppStatus {
    fn from(status: &PackageRepositoryStatus) -> Self {
        Self {
            generic: status.generic.clone(),
            fetch: status.fetch.clone(),
            template: status.template.clone(),
            deploy: status.deploy.clone(),
            inspect: None,
            consecutive_reconcile_successes: status.consecutive_reconcile_successes,
            consecutive_reconcile_failures: status.consecutive_reconcile_failures,
        }
    }
}
