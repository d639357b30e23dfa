//! Hooks implementation backed by a persisted Kubernetes resource
//!
//! Status writes and finalizer edits always start from the latest version of
//! the object so concurrent metadata changes are not lost.

use super::hooks::Hooks;
use crate::crds::{App, AppStatus};
use crate::tasks::types::{Result, FINALIZER_NAME, PREV_FINALIZER_NAME, STATUS_UPDATE_ATTEMPTS};
use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The three API calls the adapter needs
#[async_trait]
pub trait ResourceClient<K>: Send + Sync {
    async fn get(&self, name: &str) -> Result<K>;

    async fn replace(&self, name: &str, obj: &K) -> Result<K>;

    async fn replace_status(&self, name: &str, obj: &K) -> Result<K>;
}

#[async_trait]
impl<K> ResourceClient<K> for Api<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K> {
        Ok(Api::get(self, name).await?)
    }

    async fn replace(&self, name: &str, obj: &K) -> Result<K> {
        Ok(Api::replace(self, name, &PostParams::default(), obj).await?)
    }

    async fn replace_status(&self, name: &str, obj: &K) -> Result<K> {
        let data = serde_json::to_vec(obj)?;
        Ok(Api::replace_status(self, name, &PostParams::default(), data).await?)
    }
}

/// A resource kind whose status is driven by the App engine
pub trait AppHost: Resource + Clone + Send + Sync + 'static {
    /// Copy the engine's status onto this object's status field
    fn apply_app_status(&mut self, status: &AppStatus);
}

impl AppHost for App {
    fn apply_app_status(&mut self, status: &AppStatus) {
        self.status = Some(status.clone());
    }
}

fn has_finalizer<K: Resource>(obj: &K) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == FINALIZER_NAME))
}

fn is_not_found(err: &crate::tasks::types::Error) -> bool {
    matches!(
        err,
        crate::tasks::types::Error::KubeError(kube::Error::Api(ae)) if ae.code == 404
    )
}

/// [`Hooks`] over one named object of kind `K`
pub struct ResourceHooks<K> {
    name: String,
    cached: K,
    client: Arc<dyn ResourceClient<K>>,
}

impl<K: AppHost> ResourceHooks<K> {
    /// `cached` is the object as seen by the reconcile that created the hooks
    #[must_use]
    pub fn new(name: impl Into<String>, cached: K, client: Arc<dyn ResourceClient<K>>) -> Self {
        Self {
            name: name.into(),
            cached,
            client,
        }
    }

    async fn try_update_status(&self, status: &AppStatus) -> Result<()> {
        let mut latest = self.client.get(&self.name).await?;
        latest.apply_app_status(status);
        self.client.replace_status(&self.name, &latest).await?;
        Ok(())
    }
}

#[async_trait]
impl<K: AppHost> Hooks for ResourceHooks<K> {
    async fn block_deletion(&self) -> Result<()> {
        if has_finalizer(&self.cached) {
            return Ok(());
        }

        let mut latest = self.client.get(&self.name).await?;
        if has_finalizer(&latest) {
            return Ok(());
        }

        latest
            .meta_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(FINALIZER_NAME.to_string());
        self.client.replace(&self.name, &latest).await?;
        info!(name = %self.name, finalizer = FINALIZER_NAME, "Added deletion finalizer");
        Ok(())
    }

    async fn unblock_deletion(&self) -> Result<()> {
        let mut latest = match self.client.get(&self.name).await {
            Ok(obj) => obj,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e),
        };

        let Some(finalizers) = latest.meta_mut().finalizers.as_mut() else {
            return Ok(());
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != FINALIZER_NAME && f != PREV_FINALIZER_NAME);
        if finalizers.len() == before {
            return Ok(());
        }

        self.client.replace(&self.name, &latest).await?;
        info!(name = %self.name, "Removed deletion finalizers");
        Ok(())
    }

    async fn update_status(&self, desc: &str, status: &AppStatus) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.try_update_status(status).await {
                Ok(()) => {
                    debug!(name = %self.name, desc, attempt, "Status updated");
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < STATUS_UPDATE_ATTEMPTS => {
                    debug!(name = %self.name, desc, attempt, "Status update conflicted, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    warn!(name = %self.name, desc, attempt, error = %e, "Status update failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{AppSpec, Condition, ConditionType};
    use crate::tasks::types::Error;
    use kube::core::ErrorResponse;
    use std::sync::Mutex;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: if code == 409 { "Conflict" } else { "NotFound" }.to_string(),
            code,
        }))
    }

    struct FakeClient {
        object: Mutex<App>,
        conflicts: Mutex<usize>,
        status_attempts: Mutex<usize>,
        replaces: Mutex<usize>,
    }

    impl FakeClient {
        fn new(object: App, conflicts: usize) -> Arc<Self> {
            Arc::new(Self {
                object: Mutex::new(object),
                conflicts: Mutex::new(conflicts),
                status_attempts: Mutex::new(0),
                replaces: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl ResourceClient<App> for FakeClient {
        async fn get(&self, _name: &str) -> Result<App> {
            Ok(self.object.lock().unwrap().clone())
        }

        async fn replace(&self, _name: &str, obj: &App) -> Result<App> {
            *self.replaces.lock().unwrap() += 1;
            *self.object.lock().unwrap() = obj.clone();
            Ok(obj.clone())
        }

        async fn replace_status(&self, _name: &str, obj: &App) -> Result<App> {
            *self.status_attempts.lock().unwrap() += 1;
            let mut conflicts = self.conflicts.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                return Err(api_error(409));
            }
            self.object.lock().unwrap().status = obj.status.clone();
            Ok(obj.clone())
        }
    }

    fn app(finalizers: &[&str]) -> App {
        let mut app = App::new("simple-app", AppSpec::default());
        app.metadata.namespace = Some("default".to_string());
        if !finalizers.is_empty() {
            app.metadata.finalizers = Some(finalizers.iter().map(|f| (*f).to_string()).collect());
        }
        app
    }

    fn reconciled() -> AppStatus {
        let mut status = AppStatus::default();
        status.generic.conditions = vec![Condition::new(ConditionType::ReconcileSucceeded)];
        status
    }

    #[tokio::test]
    async fn status_update_succeeds_on_fifth_attempt() {
        let client = FakeClient::new(app(&[]), 4);
        let hooks = ResourceHooks::new("simple-app", app(&[]), client.clone());

        hooks.update_status("test", &reconciled()).await.unwrap();
        assert_eq!(*client.status_attempts.lock().unwrap(), 5);
        assert!(client
            .object
            .lock()
            .unwrap()
            .status
            .as_ref()
            .unwrap()
            .is_reconciled());
    }

    #[tokio::test]
    async fn status_update_gives_up_after_five_conflicts() {
        let client = FakeClient::new(app(&[]), 5);
        let hooks = ResourceHooks::new("simple-app", app(&[]), client.clone());

        let err = hooks.update_status("test", &reconciled()).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(*client.status_attempts.lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn status_update_keeps_latest_metadata() {
        let client = FakeClient::new(app(&["example.com/other"]), 0);
        let hooks = ResourceHooks::new("simple-app", app(&[]), client.clone());

        hooks.update_status("test", &reconciled()).await.unwrap();
        let stored = client.object.lock().unwrap().clone();
        assert_eq!(
            stored.metadata.finalizers,
            Some(vec!["example.com/other".to_string()])
        );
    }

    #[tokio::test]
    async fn block_deletion_is_idempotent() {
        let client = FakeClient::new(app(&[]), 0);
        let hooks = ResourceHooks::new("simple-app", app(&[]), client.clone());

        hooks.block_deletion().await.unwrap();
        hooks.block_deletion().await.unwrap();

        let finalizers = client.object.lock().unwrap().metadata.finalizers.clone().unwrap();
        assert_eq!(finalizers, vec![FINALIZER_NAME.to_string()]);
        assert_eq!(*client.replaces.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn block_deletion_skips_write_when_cached_has_finalizer() {
        let client = FakeClient::new(app(&[]), 0);
        let hooks = ResourceHooks::new("simple-app", app(&[FINALIZER_NAME]), client.clone());

        hooks.block_deletion().await.unwrap();
        assert_eq!(*client.replaces.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn unblock_removes_current_and_previous_names() {
        let client = FakeClient::new(
            app(&[PREV_FINALIZER_NAME, "example.com/other", FINALIZER_NAME]),
            0,
        );
        let hooks = ResourceHooks::new("simple-app", app(&[]), client.clone());

        hooks.unblock_deletion().await.unwrap();
        let finalizers = client.object.lock().unwrap().metadata.finalizers.clone().unwrap();
        assert_eq!(finalizers, vec!["example.com/other".to_string()]);

        hooks.unblock_deletion().await.unwrap();
        assert_eq!(*client.replaces.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn unblock_removes_a_lone_deprecated_finalizer() {
        let client = FakeClient::new(app(&["example.com/other", PREV_FINALIZER_NAME]), 0);
        let hooks = ResourceHooks::new("simple-app", app(&[]), client.clone());

        hooks.unblock_deletion().await.unwrap();
        let finalizers = client.object.lock().unwrap().metadata.finalizers.clone().unwrap();
        assert_eq!(finalizers, vec!["example.com/other".to_string()]);
        assert_eq!(*client.replaces.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn unblock_removes_a_lone_current_finalizer() {
        let client = FakeClient::new(app(&[FINALIZER_NAME]), 0);
        let hooks = ResourceHooks::new("simple-app", app(&[FINALIZER_NAME]), client.clone());

        hooks.unblock_deletion().await.unwrap();
        let stored = client.object.lock().unwrap().clone();
        assert!(stored.metadata.finalizers.unwrap_or_default().is_empty());
        assert_eq!(*client.replaces.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn unblock_leaves_foreign_finalizers_untouched() {
        let client = FakeClient::new(app(&["example.com/other"]), 0);
        let hooks = ResourceHooks::new("simple-app", app(&[]), client.clone());

        hooks.unblock_deletion().await.unwrap();
        assert_eq!(*client.replaces.lock().unwrap(), 0);
    }
}
