//! Destination cluster credentials for the deploy tool
//!
//! An App deploys either with a token for one of its namespace's service
//! accounts or with a kubeconfig stored in a Secret. The kubeconfig is handed
//! to kapp by the controller and never through user-supplied flags.

use crate::crds::AppSpec;
use crate::tasks::sources::ObjectReader;
use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, PostParams};
use kube::Client;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Secret key read when `kubeconfigSecretRef.key` is unset
pub const DEFAULT_KUBECONFIG_KEY: &str = "value";

/// CA bundle mounted into every pod
pub const IN_CLUSTER_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

const TOKEN_EXPIRATION_SECONDS: i64 = 3600;

/// Where an App's deploy credentials come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterSource {
    ServiceAccount {
        name: String,
    },
    KubeconfigSecret {
        name: String,
        key: String,
        /// Namespace on the destination cluster for the kapp app record
        namespace: Option<String>,
    },
}

/// Pick the credential source an App asks for
pub fn cluster_source(spec: &AppSpec) -> anyhow::Result<ClusterSource> {
    match (&spec.service_account_name, &spec.cluster) {
        (Some(_), Some(_)) => Err(anyhow::anyhow!(
            "Expected only one of serviceAccountName or cluster to be specified"
        )),
        (Some(name), None) if !name.trim().is_empty() => Ok(ClusterSource::ServiceAccount {
            name: name.clone(),
        }),
        (None, Some(cluster)) => {
            let secret = cluster.kubeconfig_secret_ref.as_ref().ok_or_else(|| {
                anyhow::anyhow!("Expected cluster.kubeconfigSecretRef to be specified")
            })?;
            Ok(ClusterSource::KubeconfigSecret {
                name: secret.name.clone(),
                key: secret
                    .key
                    .clone()
                    .unwrap_or_else(|| DEFAULT_KUBECONFIG_KEY.to_string()),
                namespace: cluster.namespace.clone(),
            })
        }
        _ => Err(anyhow::anyhow!(
            "Expected serviceAccountName or cluster to be specified"
        )),
    }
}

/// Credentials the deploy tool runs with
#[derive(Clone, PartialEq, Eq)]
pub enum ClusterAccess {
    /// The controller's own in-cluster identity (synthesized resources only)
    Controller,
    /// A kubeconfig document passed to the deploy tool
    Kubeconfig(String),
}

impl fmt::Debug for ClusterAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Controller => f.write_str("Controller"),
            Self::Kubeconfig(_) => f.write_str("Kubeconfig(<redacted>)"),
        }
    }
}

/// Turns a [`ClusterSource`] into a kubeconfig document
#[async_trait]
pub trait ClusterResolver: Send + Sync {
    async fn kubeconfig(&self, namespace: &str, source: &ClusterSource) -> anyhow::Result<String>;
}

/// Issues short-lived service account tokens
#[async_trait]
pub trait ServiceAccountTokens: Send + Sync {
    async fn token(&self, namespace: &str, service_account: &str) -> anyhow::Result<String>;
}

#[async_trait]
impl ServiceAccountTokens for Client {
    async fn token(&self, namespace: &str, service_account: &str) -> anyhow::Result<String> {
        let api: Api<ServiceAccount> = Api::namespaced(self.clone(), namespace);
        let request = TokenRequest {
            spec: TokenRequestSpec {
                audiences: Vec::new(),
                expiration_seconds: Some(TOKEN_EXPIRATION_SECONDS),
                ..TokenRequestSpec::default()
            },
            ..TokenRequest::default()
        };

        let issued: TokenRequest = api
            .create_subresource(
                "token",
                service_account,
                &PostParams::default(),
                serde_json::to_vec(&request)?,
            )
            .await
            .map_err(|e| {
                anyhow::anyhow!("Requesting token for service account {namespace}/{service_account}: {e}")
            })?;

        issued
            .status
            .map(|s| s.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Token request for {namespace}/{service_account} returned no token"))
    }
}

/// API server address as seen from inside the pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InClusterEndpoint {
    pub server: String,
    pub ca_path: String,
}

impl InClusterEndpoint {
    /// Read from the `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` variables
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").ok()?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        Some(Self {
            server: format!("https://{host}:{port}"),
            ca_path: IN_CLUSTER_CA_PATH.to_string(),
        })
    }
}

/// Kubeconfig for a service account token against the local API server
pub fn service_account_kubeconfig(
    endpoint: &InClusterEndpoint,
    namespace: &str,
    token: &str,
) -> anyhow::Result<String> {
    let config = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "dst-cluster",
            "cluster": {
                "server": endpoint.server,
                "certificate-authority": endpoint.ca_path,
            },
        }],
        "users": [{
            "name": "dst-user",
            "user": { "token": token },
        }],
        "contexts": [{
            "name": "dst-ctx",
            "context": {
                "cluster": "dst-cluster",
                "user": "dst-user",
                "namespace": namespace,
            },
        }],
        "current-context": "dst-ctx",
    });
    Ok(serde_yaml::to_string(&config)?)
}

/// Resolves credentials through the Kubernetes API
pub struct KubeconfigResolver {
    objects: Arc<dyn ObjectReader>,
    tokens: Arc<dyn ServiceAccountTokens>,
    endpoint: Option<InClusterEndpoint>,
}

impl KubeconfigResolver {
    #[must_use]
    pub fn new(
        objects: Arc<dyn ObjectReader>,
        tokens: Arc<dyn ServiceAccountTokens>,
        endpoint: Option<InClusterEndpoint>,
    ) -> Self {
        Self {
            objects,
            tokens,
            endpoint,
        }
    }
}

#[async_trait]
impl ClusterResolver for KubeconfigResolver {
    async fn kubeconfig(&self, namespace: &str, source: &ClusterSource) -> anyhow::Result<String> {
        match source {
            ClusterSource::ServiceAccount { name } => {
                let endpoint = self.endpoint.as_ref().ok_or_else(|| {
                    anyhow::anyhow!("Service account credentials require running inside a cluster")
                })?;
                let token = self.tokens.token(namespace, name).await?;
                debug!(namespace, service_account = %name, "Issued service account token");
                service_account_kubeconfig(endpoint, namespace, &token)
            }
            ClusterSource::KubeconfigSecret { name, key, .. } => {
                let data = self.objects.secret_data(namespace, name).await?;
                let raw = data.get(key).ok_or_else(|| {
                    anyhow::anyhow!("Secret {namespace}/{name} has no key '{key}'")
                })?;
                let yaml = String::from_utf8(raw.clone()).map_err(|_| {
                    anyhow::anyhow!("Secret {namespace}/{name} key '{key}' is not valid UTF-8")
                })?;
                if yaml.trim().is_empty() {
                    return Err(anyhow::anyhow!("Secret {namespace}/{name} key '{key}' is empty"));
                }
                Ok(yaml)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{AppCluster, KubeconfigSecretRef};
    use std::collections::BTreeMap;

    struct FakeSecrets(BTreeMap<String, Vec<u8>>);

    #[async_trait]
    impl ObjectReader for FakeSecrets {
        async fn secret_data(
            &self,
            _namespace: &str,
            name: &str,
        ) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
            if name == "remote-kubeconfig" {
                Ok(self.0.clone())
            } else {
                Err(anyhow::anyhow!("secrets \"{name}\" not found"))
            }
        }

        async fn config_map_data(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> anyhow::Result<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
    }

    struct FixedToken;

    #[async_trait]
    impl ServiceAccountTokens for FixedToken {
        async fn token(&self, namespace: &str, service_account: &str) -> anyhow::Result<String> {
            Ok(format!("token-for-{namespace}-{service_account}"))
        }
    }

    fn endpoint() -> InClusterEndpoint {
        InClusterEndpoint {
            server: "https://10.96.0.1:443".to_string(),
            ca_path: IN_CLUSTER_CA_PATH.to_string(),
        }
    }

    fn resolver(secret: &[(&str, &str)]) -> KubeconfigResolver {
        let data = secret
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.as_bytes().to_vec()))
            .collect();
        KubeconfigResolver::new(
            Arc::new(FakeSecrets(data)),
            Arc::new(FixedToken),
            Some(endpoint()),
        )
    }

    #[test]
    fn exactly_one_source_is_required() {
        let mut spec = AppSpec::default();
        assert!(cluster_source(&spec)
            .unwrap_err()
            .to_string()
            .contains("serviceAccountName or cluster"));

        spec.service_account_name = Some("restricted-sa".to_string());
        assert_eq!(
            cluster_source(&spec).unwrap(),
            ClusterSource::ServiceAccount {
                name: "restricted-sa".to_string()
            }
        );

        spec.cluster = Some(AppCluster::default());
        assert!(cluster_source(&spec)
            .unwrap_err()
            .to_string()
            .contains("only one of"));

        spec.service_account_name = None;
        assert!(cluster_source(&spec)
            .unwrap_err()
            .to_string()
            .contains("kubeconfigSecretRef"));
    }

    #[test]
    fn kubeconfig_secret_defaults_to_value_key() {
        let spec = AppSpec {
            cluster: Some(AppCluster {
                namespace: Some("remote-apps".to_string()),
                kubeconfig_secret_ref: Some(KubeconfigSecretRef {
                    name: "remote-kubeconfig".to_string(),
                    key: None,
                }),
            }),
            ..AppSpec::default()
        };
        assert_eq!(
            cluster_source(&spec).unwrap(),
            ClusterSource::KubeconfigSecret {
                name: "remote-kubeconfig".to_string(),
                key: "value".to_string(),
                namespace: Some("remote-apps".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn service_account_kubeconfig_carries_token_and_namespace() {
        let yaml = resolver(&[])
            .kubeconfig(
                "default",
                &ClusterSource::ServiceAccount {
                    name: "restricted-sa".to_string(),
                },
            )
            .await
            .unwrap();

        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            parsed["users"][0]["user"]["token"].as_str(),
            Some("token-for-default-restricted-sa")
        );
        assert_eq!(
            parsed["contexts"][0]["context"]["namespace"].as_str(),
            Some("default")
        );
        assert_eq!(
            parsed["clusters"][0]["cluster"]["server"].as_str(),
            Some("https://10.96.0.1:443")
        );
    }

    #[tokio::test]
    async fn service_account_needs_in_cluster_endpoint() {
        let resolver = KubeconfigResolver::new(
            Arc::new(FakeSecrets(BTreeMap::new())),
            Arc::new(FixedToken),
            None,
        );
        let err = resolver
            .kubeconfig(
                "default",
                &ClusterSource::ServiceAccount {
                    name: "sa".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("inside a cluster"));
    }

    #[tokio::test]
    async fn kubeconfig_secret_key_is_read_verbatim() {
        let source = ClusterSource::KubeconfigSecret {
            name: "remote-kubeconfig".to_string(),
            key: "value".to_string(),
            namespace: None,
        };
        let yaml = resolver(&[("value", "apiVersion: v1\nkind: Config\n")])
            .kubeconfig("default", &source)
            .await
            .unwrap();
        assert_eq!(yaml, "apiVersion: v1\nkind: Config\n");

        let err = resolver(&[("other", "x")])
            .kubeconfig("default", &source)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no key 'value'"));
    }

    #[test]
    fn debug_output_hides_credentials() {
        let access = ClusterAccess::Kubeconfig("token: s3cr3t".to_string());
        assert!(!format!("{access:?}").contains("s3cr3t"));
    }
}
