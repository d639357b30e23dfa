use crate::crds::AppStatus;
use crate::tasks::types::Result;
use async_trait::async_trait;

/// Persistence and finalizer operations the engine delegates to the
/// resource kind it is reconciling.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Attach the deletion finalizer; a no-op when it is already present
    async fn block_deletion(&self) -> Result<()>;

    /// Remove the current and the previous finalizer names
    async fn unblock_deletion(&self) -> Result<()>;

    /// Write `status` onto the latest persisted resource
    async fn update_status(&self, desc: &str, status: &AppStatus) -> Result<()>;
}
