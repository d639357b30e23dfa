use super::{app_from_repository, kapp_app_name};
use crate::crds::PackageRepository;
use crate::tasks::app::{AppReconciler, ResourceHooks};
use crate::tasks::reftracker::RefKey;
use crate::tasks::requeue_for_error;
use crate::tasks::types::{Context, Error, Result};
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Reconcile one `PackageRepository`
#[instrument(skip(repo, ctx), fields(repository = %repo.name_any(), namespace = ?repo.namespace()))]
pub async fn reconcile_package_repository(
    repo: Arc<PackageRepository>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let name = repo.name_any();
    let namespace = repo.namespace().ok_or(Error::MissingObjectKey)?;
    debug!("🔄 Reconciling PackageRepository");

    let api: Api<PackageRepository> = Api::namespaced(ctx.client.clone(), &namespace);
    let hooks = Arc::new(ResourceHooks::new(&name, (*repo).clone(), Arc::new(api)));
    let mut reconciler = AppReconciler::new(
        app_from_repository(&repo),
        kapp_app_name(&name),
        hooks,
        ctx.stages.clone(),
        ctx.config.reconcile.clone(),
    )?
    .with_controller_credentials();

    let key = RefKey::package_repository(&namespace, &name);
    if repo.metadata.deletion_timestamp.is_some() {
        let action = reconciler.reconcile(false).await?;
        ctx.tracker.remove_app(&key);
        info!("PackageRepository deleted, references released");
        return Ok(action);
    }

    ctx.tracker.reconcile_refs(&key, reconciler.resource_refs());

    let force = ctx.tracker.take_update(&key);
    reconciler.reconcile(force).await
}

/// Error policy for the PackageRepository controller
#[instrument(skip(repo, ctx), fields(repository = %repo.name_any()))]
pub fn error_policy_package_repository(
    repo: Arc<PackageRepository>,
    err: &Error,
    ctx: Arc<Context>,
) -> Action {
    error!(error = %err, "PackageRepository reconciliation failed");
    requeue_for_error(err, &ctx.config.reconcile)
}
