//! `PackageRepository` reconciliation through the App engine
//!
//! A repository is reconciled as a synthesized App: its fetch source, a ytt
//! pass over the fetched content and a kapp deploy that tolerates an empty
//! resource list.

mod controller;

pub use controller::{error_policy_package_repository, reconcile_package_repository};

use crate::crds::{
    App, AppDeploy, AppSpec, AppStatus, AppTemplate, DeployKapp, PackageRepository,
    PackageRepositoryStatus, TemplateYtt,
};
use crate::tasks::app::AppHost;

/// Deploy flags every repository App runs with
pub const REPOSITORY_DEPLOY_FLAGS: &[&str] = &["--dangerous-allow-empty-list-of-resources=true"];

/// kapp app name recorded for a repository
#[must_use]
pub fn kapp_app_name(name: &str) -> String {
    format!("{name}.pkgr")
}

/// Build the App that reconciles `repo`. Metadata is carried over so the
/// engine sees the repository's generation and deletion state.
#[must_use]
pub fn app_from_repository(repo: &PackageRepository) -> App {
    let spec = AppSpec {
        fetch: vec![repo.spec.fetch.clone()],
        template: vec![AppTemplate {
            ytt: Some(TemplateYtt {
                ignore_unknown_comments: true,
                ..TemplateYtt::default()
            }),
            helm_template: None,
        }],
        deploy: vec![AppDeploy {
            kapp: Some(DeployKapp {
                raw_options: REPOSITORY_DEPLOY_FLAGS
                    .iter()
                    .map(|f| (*f).to_string())
                    .collect(),
                ..DeployKapp::default()
            }),
        }],
        paused: repo.spec.paused,
        sync_period: repo.spec.sync_period.clone(),
        ..AppSpec::default()
    };

    App {
        metadata: repo.metadata.clone(),
        spec,
        status: repo.status.as_ref().map(AppStatus::from),
    }
}

impl AppHost for PackageRepository {
    fn apply_app_status(&mut self, status: &AppStatus) {
        self.status = Some(PackageRepositoryStatus::from(status));
    }
}
