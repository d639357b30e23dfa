use super::engine::AppReconciler;
use super::progress::{metric_string, progress_between, status_string};
use super::resource::ResourceHooks;
use crate::crds::App;
use crate::tasks::reftracker::RefKey;
use crate::tasks::requeue_for_error;
use crate::tasks::types::{Context, Error, Result};
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// kapp app name recorded for a directly reconciled App
#[must_use]
pub fn kapp_app_name(name: &str) -> String {
    format!("{name}-ctrl")
}

/// Reconcile one `App`
#[instrument(skip(app, ctx), fields(app = %app.name_any(), namespace = ?app.namespace()))]
pub async fn reconcile_app(app: Arc<App>, ctx: Arc<Context>) -> Result<Action> {
    let name = app.name_any();
    let namespace = app.namespace().ok_or(Error::MissingObjectKey)?;
    debug!("🔄 Reconciling App");

    let api: Api<App> = Api::namespaced(ctx.client.clone(), &namespace);
    let hooks = Arc::new(ResourceHooks::new(&name, (*app).clone(), Arc::new(api)));
    let mut reconciler = AppReconciler::new(
        (*app).clone(),
        kapp_app_name(&name),
        hooks,
        ctx.stages.clone(),
        ctx.config.reconcile.clone(),
    )?;

    let key = RefKey::app(&namespace, &name);
    if app.metadata.deletion_timestamp.is_some() {
        let action = reconciler.reconcile(false).await?;
        ctx.tracker.remove_app(&key);
        info!("App deleted, references released");
        return Ok(action);
    }

    let changes = ctx.tracker.reconcile_refs(&key, reconciler.resource_refs());
    if !changes.is_empty() {
        debug!(
            added = changes.added.len(),
            removed = changes.removed.len(),
            "App references changed"
        );
    }

    let force = ctx.tracker.take_update(&key);
    if force {
        info!("Referenced Secret or ConfigMap changed, forcing reconcile");
    }

    let before = reconciler.status().clone();
    let result = reconciler.reconcile(force).await;
    let after = reconciler.status();
    for event in progress_between(&before, after) {
        debug!(?event, "App progress");
    }
    debug!(
        status = %status_string(after),
        streak = %metric_string(after),
        "App reconcile finished"
    );
    result
}

/// Error policy for the App controller
#[instrument(skip(app, ctx), fields(app = %app.name_any()))]
pub fn error_policy_app(app: Arc<App>, err: &Error, ctx: Arc<Context>) -> Action {
    error!(error = %err, "App reconciliation failed");
    requeue_for_error(err, &ctx.config.reconcile)
}
