//! `App` Custom Resource Definition: fetch, template and deploy a set of manifests

use super::status::AppStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reference to a Secret or ConfigMap in the App's namespace
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectRef {
    pub name: String,
}

/// Destination cluster reached through a kubeconfig Secret
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppCluster {
    /// Namespace used for resources that do not specify one
    #[serde(default)]
    pub namespace: Option<String>,

    /// Secret holding a kubeconfig for the destination cluster
    #[serde(default)]
    pub kubeconfig_secret_ref: Option<KubeconfigSecretRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigSecretRef {
    pub name: String,

    /// Key within the secret (defaults to `value`)
    #[serde(default)]
    pub key: Option<String>,
}

/// Inline file contents, optionally sourced from Secrets/ConfigMaps
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InlineSource {
    #[serde(default)]
    pub paths: BTreeMap<String, String>,

    #[serde(default)]
    pub paths_from: Vec<InlineSourceRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InlineSourceRef {
    #[serde(default)]
    pub secret_ref: Option<InlineRef>,

    #[serde(default)]
    pub config_map_ref: Option<InlineRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InlineRef {
    pub name: String,

    /// Directory under which the referenced keys are written
    #[serde(default)]
    pub directory_path: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FetchGit {
    pub url: String,

    /// Branch, tag or commit (e.g. "origin/main", "v1.2.0")
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,

    #[serde(default)]
    pub secret_ref: Option<LocalObjectRef>,

    #[serde(default)]
    pub sub_path: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FetchHttp {
    pub url: String,

    /// Expected hex-encoded sha256 of the downloaded content
    #[serde(default)]
    pub sha256: Option<String>,

    #[serde(default)]
    pub secret_ref: Option<LocalObjectRef>,

    #[serde(default)]
    pub sub_path: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FetchImage {
    pub url: String,

    #[serde(default)]
    pub secret_ref: Option<LocalObjectRef>,

    #[serde(default)]
    pub sub_path: Option<String>,
}

/// One fetch source; exactly one of the source fields is expected
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppFetch {
    #[serde(default)]
    pub inline: Option<InlineSource>,

    #[serde(default)]
    pub git: Option<FetchGit>,

    #[serde(default)]
    pub http: Option<FetchHttp>,

    #[serde(default)]
    pub image: Option<FetchImage>,

    /// Directory (relative to the fetch root) to place this source in
    #[serde(default)]
    pub path: Option<String>,
}

/// Data values source for a templating step
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValuesSource {
    #[serde(default)]
    pub secret_ref: Option<LocalObjectRef>,

    #[serde(default)]
    pub config_map_ref: Option<LocalObjectRef>,

    /// Path inside the fetched content
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateYtt {
    #[serde(default)]
    pub ignore_unknown_comments: bool,

    #[serde(default)]
    pub inline: Option<InlineSource>,

    /// Paths inside the fetched content (defaults to the whole tree)
    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default)]
    pub values_from: Vec<ValuesSource>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateHelm {
    /// Release name (defaults to the App name)
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub namespace: Option<String>,

    /// Chart path inside the fetched content
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub values_from: Vec<ValuesSource>,
}

/// One templating step; steps run in order
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppTemplate {
    #[serde(default)]
    pub ytt: Option<TemplateYtt>,

    #[serde(default)]
    pub helm_template: Option<TemplateHelm>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RawOptions {
    #[serde(default)]
    pub raw_options: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeployKapp {
    #[serde(default)]
    pub into_ns: Option<String>,

    #[serde(default)]
    pub map_ns: Vec<String>,

    /// Extra deploy flags; filtered through the restricted flag set
    #[serde(default)]
    pub raw_options: Vec<String>,

    /// Run an inspect after deploy with these flags
    #[serde(default)]
    pub inspect: Option<RawOptions>,

    #[serde(default)]
    pub delete: Option<RawOptions>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppDeploy {
    #[serde(default)]
    pub kapp: Option<DeployKapp>,
}

/// `App` CRD: desired state for a fetch → template → deploy pipeline
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "kappctrl.k14s.io", version = "v1alpha1", kind = "App")]
#[kube(namespaced)]
#[kube(status = "AppStatus")]
#[kube(printcolumn = r#"{"name":"Description","type":"string","jsonPath":".status.friendlyDescription"}"#)]
#[kube(printcolumn = r#"{"name":"Since-Deploy","type":"date","jsonPath":".status.deploy.startedAt"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// ServiceAccount in the App's namespace whose token kapp deploys with.
    /// Exactly one of this and `cluster` must be set.
    #[serde(default)]
    pub service_account_name: Option<String>,

    #[serde(default)]
    pub cluster: Option<AppCluster>,

    #[serde(default)]
    pub fetch: Vec<AppFetch>,

    #[serde(default)]
    pub template: Vec<AppTemplate>,

    #[serde(default)]
    pub deploy: Vec<AppDeploy>,

    /// Stop reconciling (status is still kept current)
    #[serde(default)]
    pub paused: bool,

    #[serde(default)]
    pub canceled: bool,

    /// How often to re-run the pipeline once reconciled (e.g. "30s", "10m")
    #[serde(default)]
    pub sync_period: Option<String>,

    /// Skip the deploy tool's delete when the App is deleted
    #[serde(default)]
    pub noop_delete: bool,
}

impl AppSpec {
    /// The kapp deploy step, if any
    #[must_use]
    pub fn kapp(&self) -> Option<&DeployKapp> {
        self.deploy.iter().find_map(|d| d.kapp.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_spec_deserialization() {
        let yaml = r#"
serviceAccountName: default-ns-sa
syncPeriod: 1m
fetch:
- git:
    url: https://github.com/k14s/k8s-simple-app-example
    ref: origin/develop
    subPath: config-step-2-template
template:
- ytt:
    valuesFrom:
    - secretRef:
        name: simple-app-values
deploy:
- kapp:
    intoNs: simple-app
    rawOptions: ["--wait-timeout=5m"]
    delete:
      rawOptions: ["--apply-ignored=true"]
"#;

        let spec: AppSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.service_account_name.as_deref(), Some("default-ns-sa"));
        let git = spec.fetch[0].git.as_ref().unwrap();
        assert_eq!(git.git_ref.as_deref(), Some("origin/develop"));
        assert_eq!(
            spec.template[0].ytt.as_ref().unwrap().values_from[0]
                .secret_ref
                .as_ref()
                .unwrap()
                .name,
            "simple-app-values"
        );
        let kapp = spec.kapp().unwrap();
        assert_eq!(kapp.raw_options, vec!["--wait-timeout=5m"]);
        assert_eq!(
            kapp.delete.as_ref().unwrap().raw_options,
            vec!["--apply-ignored=true"]
        );
        assert!(!spec.paused);
    }
}
