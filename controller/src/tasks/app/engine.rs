//! Reconcile engine shared by every resource kind that deploys through kapp
//!
//! One engine instance handles one reconcile of one resource. The caller
//! guarantees that at most one reconcile per resource key is in flight; the
//! controller work queue provides that.

use super::hooks::Hooks;
use super::timer::{failure_backoff, ReconcileTimer};
use crate::crds::{
    App, AppStatus, Condition, ConditionType, DeployKapp, DeployStatus, StageStatus,
};
use crate::tasks::cluster::{cluster_source, ClusterAccess, ClusterSource};
use crate::tasks::config::ReconcileConfig;
use crate::tasks::deploy::{build_invocation, KappOperation};
use crate::tasks::reftracker::{self, ReferenceSet};
use crate::tasks::stages::{DeployTarget, Stage, StageResult, Stages};
use crate::tasks::types::{Error, Result};
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A stage that ended the current run early
struct StageFailure {
    stage: Stage,
    result: StageResult,
}

pub struct AppReconciler {
    app: App,
    namespace: String,
    status: AppStatus,
    kapp_app_name: String,
    hooks: Arc<dyn Hooks>,
    stages: Stages,
    config: ReconcileConfig,
    controller_credentials: bool,
}

impl AppReconciler {
    /// `kapp_app_name` is the name kapp records the deployment under
    pub fn new(
        app: App,
        kapp_app_name: impl Into<String>,
        hooks: Arc<dyn Hooks>,
        stages: Stages,
        config: ReconcileConfig,
    ) -> Result<Self> {
        let namespace = app.namespace().ok_or(Error::MissingObjectKey)?;
        if app.metadata.name.is_none() {
            return Err(Error::MissingObjectKey);
        }
        let status = app.status.clone().unwrap_or_default();

        Ok(Self {
            app,
            namespace,
            status,
            kapp_app_name: kapp_app_name.into(),
            hooks,
            stages,
            config,
            controller_credentials: false,
        })
    }

    /// Deploy with the controller's own identity instead of the App's
    /// `serviceAccountName`/`cluster` settings
    #[must_use]
    pub fn with_controller_credentials(mut self) -> Self {
        self.controller_credentials = true;
        self
    }

    /// Current in-memory status
    #[must_use]
    pub fn status(&self) -> &AppStatus {
        &self.status
    }

    /// Secrets and ConfigMaps the wrapped App depends on
    #[must_use]
    pub fn resource_refs(&self) -> ReferenceSet {
        reftracker::compute(&self.app.spec, &self.namespace)
    }

    fn generation(&self) -> i64 {
        self.app.metadata.generation.unwrap_or_default()
    }

    fn sync_period(&self) -> Duration {
        self.config
            .effective_sync_period(self.app.spec.sync_period.as_deref())
    }

    /// Run one reconcile. `force` bypasses the sync-period short-circuit.
    pub async fn reconcile(&mut self, force: bool) -> Result<Action> {
        let name = self.app.name_any();

        if self.app.metadata.deletion_timestamp.is_some() {
            info!(app = %name, namespace = %self.namespace, "🗑️ App marked for deletion");
            return self.reconcile_delete().await;
        }

        if self.app.spec.canceled || self.app.spec.paused {
            info!(app = %name, namespace = %self.namespace, "App is canceled or paused, not reconciling");
            return self.set_canceled_or_paused().await;
        }

        let now = Utc::now();
        let timer = ReconcileTimer::new(&self.status, self.generation(), self.sync_period());
        if !force && !timer.is_ready_at(now) {
            let wait = timer.duration_until_ready(now);
            debug!(app = %name, requeue_secs = wait.as_secs(), "Reconcile not due yet");
            return Ok(Action::requeue(wait));
        }

        self.reconcile_deploy().await
    }

    async fn persist(&self, desc: &str) -> Result<()> {
        self.hooks.update_status(desc, &self.status).await
    }

    fn kapp(&self) -> Option<&DeployKapp> {
        self.app.spec.kapp()
    }

    /// Deploy target with resolved credentials; `Err` carries a message for
    /// the stage status
    async fn deploy_target(&self) -> std::result::Result<DeployTarget, String> {
        let kapp = self.kapp();
        let mut target = DeployTarget {
            app_name: self.kapp_app_name.clone(),
            namespace: self.namespace.clone(),
            into_ns: kapp.and_then(|k| k.into_ns.clone()),
            map_ns: kapp.map(|k| k.map_ns.clone()).unwrap_or_default(),
            access: ClusterAccess::Controller,
        };
        if self.controller_credentials {
            return Ok(target);
        }

        let source = cluster_source(&self.app.spec).map_err(|e| e.to_string())?;
        if let ClusterSource::KubeconfigSecret {
            namespace: Some(ns),
            ..
        } = &source
        {
            target.namespace = ns.clone();
        }
        let kubeconfig = self
            .stages
            .clusters
            .kubeconfig(&self.namespace, &source)
            .await
            .map_err(|e| format!("Resolving cluster credentials: {e:#}"))?;
        target.access = ClusterAccess::Kubeconfig(kubeconfig);
        Ok(target)
    }

    async fn set_canceled_or_paused(&mut self) -> Result<Action> {
        self.status.generic.friendly_description = "Canceled/paused".to_string();
        self.status.generic.observed_generation = self.generation();
        self.persist("app canceled/paused").await?;
        Ok(Action::await_change())
    }

    async fn reconcile_delete(&mut self) -> Result<Action> {
        self.status.generic.conditions = vec![Condition::new(ConditionType::Deleting)];
        self.status.generic.friendly_description = "Deleting".to_string();
        self.persist("app deleting").await?;

        if self.app.spec.noop_delete {
            info!(app = %self.app.name_any(), "noopDelete set, leaving deployed resources in place");
        } else if let Some(kapp) = self.kapp() {
            let raw = kapp
                .delete
                .as_ref()
                .map(|d| d.raw_options.clone())
                .unwrap_or_default();

            let started_at = Utc::now();
            self.status.deploy = Some(DeployStatus::started(started_at));
            self.persist("marking delete started").await?;

            let result = match build_invocation(KappOperation::Delete, &raw) {
                Ok(args) => match self.deploy_target().await {
                    Ok(target) => self.stages.deployer.delete(&target, &args).await,
                    Err(message) => StageResult::failure(started_at, message),
                },
                Err(e) => StageResult::failure(started_at, e.to_string()),
            };
            self.status.deploy = Some(result.to_deploy_status());

            if !result.is_success() {
                let message = result.failure_message();
                warn!(app = %self.app.name_any(), error = %message, "Delete failed");
                self.status.generic.conditions =
                    vec![Condition::new(ConditionType::DeleteFailed).with_message(message.clone())];
                self.status.generic.friendly_description = format!("Delete failed: {message}");
                self.status.generic.useful_error_message = result.stderr.clone();
                self.persist("app delete failed").await?;

                return Err(Error::StageFailed {
                    stage: Stage::Delete,
                    message,
                    requeue_after: self.config.failure_requeue(),
                });
            }
        }

        self.hooks.unblock_deletion().await?;
        info!(app = %self.app.name_any(), "✅ Deletion unblocked");
        Ok(Action::await_change())
    }

    async fn reconcile_deploy(&mut self) -> Result<Action> {
        self.hooks.block_deletion().await?;

        self.status.generic.observed_generation = self.generation();
        self.status.generic.conditions = vec![Condition::new(ConditionType::Reconciling)];
        self.status.generic.friendly_description = "Reconciling".to_string();
        self.persist("marking reconciling").await?;

        match self.run_pipeline().await? {
            None => {
                self.status.generic.conditions =
                    vec![Condition::new(ConditionType::ReconcileSucceeded)];
                self.status.generic.friendly_description = "Reconcile succeeded".to_string();
                self.status.generic.useful_error_message.clear();
                self.status.consecutive_reconcile_successes =
                    self.status.consecutive_reconcile_successes.saturating_add(1);
                self.status.consecutive_reconcile_failures = 0;
                self.persist("marking reconcile success").await?;

                info!(
                    app = %self.app.name_any(),
                    successes = self.status.consecutive_reconcile_successes,
                    "✅ Reconcile succeeded"
                );
                Ok(Action::requeue(self.sync_period()))
            }
            Some(StageFailure { stage, result }) => {
                let message = result.failure_message();
                self.status.generic.conditions = vec![Condition::new(ConditionType::ReconcileFailed)
                    .with_message(format!("{stage} failed: {message}"))];
                self.status.generic.friendly_description =
                    format!("Reconcile failed: {stage} failed: {message}");
                self.status.generic.useful_error_message = if result.stderr.trim().is_empty() {
                    message.clone()
                } else {
                    result.stderr.clone()
                };
                self.status.consecutive_reconcile_failures =
                    self.status.consecutive_reconcile_failures.saturating_add(1);
                self.status.consecutive_reconcile_successes = 0;
                self.persist("marking reconcile failure").await?;

                let requeue_after =
                    failure_backoff(self.status.consecutive_reconcile_failures, self.sync_period());
                warn!(
                    app = %self.app.name_any(),
                    %stage,
                    failures = self.status.consecutive_reconcile_failures,
                    "Reconcile failed"
                );
                Err(Error::StageFailed {
                    stage,
                    message,
                    requeue_after,
                })
            }
        }
    }

    /// Fetch, template and deploy. `Ok(Some(_))` names the stage that failed;
    /// `Err` is reserved for status persistence errors.
    async fn run_pipeline(&mut self) -> Result<Option<StageFailure>> {
        let started_at = Utc::now();
        self.status.fetch = Some(StageStatus::started(started_at));
        self.persist("marking fetch started").await?;

        let workdir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                let result =
                    StageResult::failure(started_at, format!("Creating working directory: {e}"));
                self.status.fetch = Some(result.to_stage_status());
                self.persist("marking fetch completed").await?;
                return Ok(Some(StageFailure {
                    stage: Stage::Fetch,
                    result,
                }));
            }
        };
        let fetched = workdir.path();

        let result = self
            .stages
            .fetcher
            .fetch(&self.namespace, &self.app.spec.fetch, fetched)
            .await;
        self.status.fetch = Some(result.to_stage_status());
        self.persist("marking fetch completed").await?;
        if !result.is_success() {
            return Ok(Some(StageFailure {
                stage: Stage::Fetch,
                result,
            }));
        }

        let started_at = Utc::now();
        self.status.template = Some(StageStatus::started(started_at));
        self.persist("marking template started").await?;

        let result = self
            .stages
            .templater
            .template(
                &self.namespace,
                &self.app.name_any(),
                &self.app.spec.template,
                fetched,
            )
            .await;
        // Rendered manifests stay out of status.
        let mut template_status = result.to_stage_status();
        template_status.stdout.clear();
        self.status.template = Some(template_status);
        self.persist("marking template completed").await?;
        if !result.is_success() {
            return Ok(Some(StageFailure {
                stage: Stage::Template,
                result,
            }));
        }
        let templated = result.stdout;

        let started_at = Utc::now();
        self.status.deploy = Some(DeployStatus::started(started_at));
        self.persist("marking deploy started").await?;

        let invocation = match self.kapp() {
            None => Err("Expected a kapp deploy step".to_string()),
            Some(kapp) => build_invocation(KappOperation::Deploy, &kapp.raw_options)
                .map_err(|e| e.to_string()),
        };
        let prepared = match invocation {
            Ok(args) => self.deploy_target().await.map(|target| (target, args)),
            Err(message) => Err(message),
        };
        let (result, target) = match prepared {
            Ok((target, args)) => {
                let result = self
                    .stages
                    .deployer
                    .deploy(&target, &templated, &args)
                    .await;
                (result, Some(target))
            }
            Err(message) => (StageResult::failure(started_at, message), None),
        };
        self.status.deploy = Some(result.to_deploy_status());
        self.persist("marking deploy completed").await?;

        if let Some(target) = &target {
            self.run_inspect(target).await?;
        }

        if result.is_success() {
            Ok(None)
        } else {
            Ok(Some(StageFailure {
                stage: Stage::Deploy,
                result,
            }))
        }
    }

    /// Post-deploy inspect; its outcome is recorded but never fails the run
    async fn run_inspect(&mut self, target: &DeployTarget) -> Result<()> {
        let Some(raw) = self
            .kapp()
            .and_then(|k| k.inspect.as_ref())
            .map(|i| i.raw_options.clone())
        else {
            return Ok(());
        };

        let started_at = Utc::now();
        self.status.inspect = Some(StageStatus::started(started_at));
        self.persist("marking inspect started").await?;

        let result = match build_invocation(KappOperation::Inspect, &raw) {
            Ok(args) => self.stages.deployer.inspect(target, &args).await,
            Err(e) => StageResult::failure(started_at, e.to_string()),
        };
        if !result.is_success() {
            warn!(app = %target.app_name, error = %result.failure_message(), "Inspect failed");
        }
        self.status.inspect = Some(result.to_stage_status());
        self.persist("marking inspect completed").await
    }
}
