use crate::crds::{App, PackageRepository};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, Instrument};

pub mod app;
pub mod cluster;
pub mod config;
pub mod deploy;
pub mod exec;
pub mod fetch;
pub mod pkgrepository;
pub mod reftracker;
pub mod sources;
pub mod stages;
pub mod template;
pub mod types;

// Re-export commonly used items
pub use app::reconcile_app;
pub use config::ControllerConfig;
pub use pkgrepository::reconcile_package_repository;
pub use types::{Error, Result};

use config::{ReconcileConfig, ToolsConfig};
use exec::{CommandRunner, ProcessRunner};
use reftracker::{AppRefTracker, RefKey, RefKind};
use sources::ObjectReader;
use stages::Stages;
use types::Context;

/// Requeue interval for a failed reconcile: the stage failure's own backoff,
/// a quick retry for lost status races, otherwise the configured failure delay
#[must_use]
pub fn requeue_for_error(err: &Error, config: &ReconcileConfig) -> Action {
    if let Some(after) = err.requeue_after() {
        Action::requeue(after)
    } else if err.is_conflict() {
        Action::requeue(config.reconciling_requeue())
    } else {
        Action::requeue(config.failure_requeue())
    }
}

/// Process-backed fetch, template and deploy adapters plus credential lookup
#[must_use]
pub fn default_stages(client: &Client, tools: &ToolsConfig) -> Stages {
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(tools.command_timeout()));
    let objects: Arc<dyn ObjectReader> = Arc::new(client.clone());

    Stages::new(
        Arc::new(fetch::SourceFetcher::new(
            tools.clone(),
            runner.clone(),
            objects.clone(),
        )),
        Arc::new(template::ToolTemplater::new(
            tools.clone(),
            runner.clone(),
            objects.clone(),
        )),
        Arc::new(deploy::Kapp::new(&tools.kapp, runner)),
        Arc::new(cluster::KubeconfigResolver::new(
            objects,
            Arc::new(client.clone()),
            cluster::InClusterEndpoint::from_env(),
        )),
    )
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Owners of kind `kind` to requeue after a change to `reference`
fn dependents<K>(tracker: &AppRefTracker, reference: &RefKey, kind: RefKind) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    tracker
        .mark_apps_for_update(reference)
        .into_iter()
        .filter(|owner| owner.kind == kind)
        .map(|owner| ObjectRef::new(&owner.name).within(&owner.namespace))
        .collect()
}

/// Main entry point for the App and PackageRepository controllers
#[instrument(skip(client, config), fields(namespace = ?config.controller.watch_namespace))]
pub async fn run_task_controller(client: Client, config: Arc<ControllerConfig>) -> Result<()> {
    if let Err(validation_error) = config.validate() {
        error!("Configuration validation failed: {}", validation_error);
        return Err(Error::ConfigError(validation_error.to_string()));
    }

    let context = Arc::new(Context {
        client: client.clone(),
        config: config.clone(),
        tracker: Arc::new(AppRefTracker::new()),
        stages: default_stages(&client, &config.tools),
    });
    debug!("Controller context created successfully");

    let namespace = config.controller.watch_namespace.clone();
    log_existing::<App>(&client, namespace.as_deref(), "App").await;
    log_existing::<PackageRepository>(&client, namespace.as_deref(), "PackageRepository").await;

    info!("Starting App and PackageRepository controllers...");

    let app_controller_handle = tokio::spawn({
        let context = context.clone();
        let client = client.clone();
        let namespace = namespace.clone();
        async move { run_app_controller(client, namespace, context).await }
    });

    let repo_controller_handle = tokio::spawn({
        let context = context.clone();
        let client = client.clone();
        let namespace = namespace.clone();
        async move { run_package_repository_controller(client, namespace, context).await }
    });

    match tokio::try_join!(app_controller_handle, repo_controller_handle) {
        Ok((app_result, repo_result)) => {
            if let Err(e) = app_result {
                error!("App controller failed: {:?}", e);
            }
            if let Err(e) = repo_result {
                error!("PackageRepository controller failed: {:?}", e);
            }
        }
        Err(e) => {
            error!("Controller task join error: {:?}", e);
        }
    }

    info!("Task controllers shutting down");
    Ok(())
}

async fn log_existing<K>(client: &Client, namespace: Option<&str>, kind: &str)
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug,
{
    let api: Api<K> = scoped_api(client, namespace);
    match api.list(&ListParams::default()).await {
        Ok(list) => {
            info!("Controller startup: found {} {}(s)", list.items.len(), kind);
            for obj in list.items {
                debug!(
                    "Existing {}: {}/{}",
                    kind,
                    obj.namespace().unwrap_or_default(),
                    obj.name_any()
                );
            }
        }
        Err(e) => {
            error!("Failed to list {}s at startup: {}", kind, e);
        }
    }
}

/// Run the App controller
#[instrument(skip(client, context))]
async fn run_app_controller(
    client: Client,
    namespace: Option<String>,
    context: Arc<Context>,
) -> Result<()> {
    info!("Starting App controller");

    let apps: Api<App> = scoped_api(&client, namespace.as_deref());
    let secrets: Api<Secret> = scoped_api(&client, namespace.as_deref());
    let config_maps: Api<ConfigMap> = scoped_api(&client, namespace.as_deref());
    let watcher_config = Config::default().any_semantic();

    let secret_tracker = context.tracker.clone();
    let cm_tracker = context.tracker.clone();

    Controller::new(apps, watcher_config.clone())
        .watches(secrets, watcher_config.clone(), move |secret: Secret| {
            let key = RefKey::secret(&secret.namespace().unwrap_or_default(), &secret.name_any());
            dependents::<App>(&secret_tracker, &key, RefKind::App)
        })
        .watches(config_maps, watcher_config, move |cm: ConfigMap| {
            let key = RefKey::config_map(&cm.namespace().unwrap_or_default(), &cm.name_any());
            dependents::<App>(&cm_tracker, &key, RefKind::App)
        })
        .run(reconcile_app, app::error_policy_app, context)
        .for_each(|reconciliation_result| {
            let app_span = tracing::info_span!("app_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(app_resource) => {
                        debug!(resource = ?app_resource, "App reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        error!(error = ?reconciliation_err, "App reconciliation error");
                    }
                }
            }
            .instrument(app_span)
        })
        .await;

    info!("App controller shutting down");
    Ok(())
}

/// Run the PackageRepository controller
#[instrument(skip(client, context))]
async fn run_package_repository_controller(
    client: Client,
    namespace: Option<String>,
    context: Arc<Context>,
) -> Result<()> {
    info!("Starting PackageRepository controller");

    let repos: Api<PackageRepository> = scoped_api(&client, namespace.as_deref());
    let secrets: Api<Secret> = scoped_api(&client, namespace.as_deref());
    let watcher_config = Config::default().any_semantic();

    let tracker = context.tracker.clone();

    Controller::new(repos, watcher_config.clone())
        .watches(secrets, watcher_config, move |secret: Secret| {
            let key = RefKey::secret(&secret.namespace().unwrap_or_default(), &secret.name_any());
            dependents::<PackageRepository>(&tracker, &key, RefKind::PackageRepository)
        })
        .run(
            reconcile_package_repository,
            pkgrepository::error_policy_package_repository,
            context,
        )
        .for_each(|reconciliation_result| {
            let repo_span = tracing::info_span!("package_repository_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(repo_resource) => {
                        debug!(resource = ?repo_resource, "PackageRepository reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        error!(error = ?reconciliation_err, "PackageRepository reconciliation error");
                    }
                }
            }
            .instrument(repo_span)
        })
        .await;

    info!("PackageRepository controller shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::stages::Stage;
    use kube::core::ErrorResponse;
    use std::time::Duration;

    #[test]
    fn requeue_prefers_stage_backoff() {
        let config = ReconcileConfig::default();
        let stage_failure = Error::StageFailed {
            stage: Stage::Deploy,
            message: "kapp exited 1".to_string(),
            requeue_after: Duration::from_secs(8),
        };
        assert_eq!(
            requeue_for_error(&stage_failure, &config),
            Action::requeue(Duration::from_secs(8))
        );

        let conflict = Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }));
        assert_eq!(
            requeue_for_error(&conflict, &config),
            Action::requeue(config.reconciling_requeue())
        );
        assert_eq!(
            requeue_for_error(&Error::MissingObjectKey, &config),
            Action::requeue(config.failure_requeue())
        );
    }

    #[test]
    fn dependents_filter_by_owner_kind() {
        let tracker = AppRefTracker::new();
        let secret = RefKey::secret("default", "creds");
        tracker.reconcile_refs(&RefKey::app("default", "simple-app"), [secret.clone()].into());
        tracker.reconcile_refs(
            &RefKey::package_repository("default", "repo"),
            [secret.clone()].into(),
        );

        let apps = dependents::<App>(&tracker, &secret, RefKind::App);
        assert_eq!(apps, vec![ObjectRef::new("simple-app").within("default")]);
        assert!(tracker.take_update(&RefKey::app("default", "simple-app")));
    }
}
