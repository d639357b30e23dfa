//! App reconciliation: the engine, its hooks and the `App` controller

pub mod controller;
pub mod engine;
pub mod hooks;
pub mod progress;
pub mod resource;
pub mod timer;

pub use controller::{error_policy_app, kapp_app_name, reconcile_app};
pub use engine::AppReconciler;
pub use hooks::Hooks;
pub use resource::{AppHost, ResourceClient, ResourceHooks};
