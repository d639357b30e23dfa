//! kapp-backed deploy stage

pub mod restrict;

use crate::tasks::cluster::ClusterAccess;
use crate::tasks::exec::{CommandRunner, CommandSpec};
use crate::tasks::stages::{DeployTarget, Deployer, StageResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub use restrict::{build_invocation, KappOperation};

/// Environment variable kapp reads a kubeconfig document from
pub const KUBECONFIG_YAML_ENV: &str = "KAPP_KUBECONFIG_YAML";

/// Deploys templated manifests with kapp.
///
/// `args` handed to every operation must already have passed
/// [`restrict::build_invocation`].
#[derive(Clone)]
pub struct Kapp {
    binary: String,
    runner: Arc<dyn CommandRunner>,
}

impl Kapp {
    #[must_use]
    pub fn new(binary: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            binary: binary.into(),
            runner,
        }
    }

    fn base_args(&self, verb: &str, target: &DeployTarget) -> CommandSpec {
        let cmd = CommandSpec::new(&self.binary).args([
            verb,
            "--app",
            target.app_name.as_str(),
            "--namespace",
            target.namespace.as_str(),
        ]);
        match &target.access {
            ClusterAccess::Controller => cmd,
            ClusterAccess::Kubeconfig(yaml) => cmd.env(KUBECONFIG_YAML_ENV, yaml.as_str()),
        }
    }
}

#[async_trait]
impl Deployer for Kapp {
    async fn deploy(&self, target: &DeployTarget, templated: &str, args: &[String]) -> StageResult {
        info!(app = %target.app_name, namespace = %target.namespace, "Running kapp deploy");

        let mut cmd = self
            .base_args("deploy", target)
            .args(["-f", "-", "--yes"])
            .stdin(templated);
        if let Some(into_ns) = &target.into_ns {
            cmd = cmd.arg(format!("--into-ns={into_ns}"));
        }
        for map_ns in &target.map_ns {
            cmd = cmd.arg(format!("--map-ns={map_ns}"));
        }

        self.runner.run(cmd.args(args.iter().cloned())).await
    }

    async fn delete(&self, target: &DeployTarget, args: &[String]) -> StageResult {
        info!(app = %target.app_name, namespace = %target.namespace, "Running kapp delete");

        let cmd = self
            .base_args("delete", target)
            .arg("--yes")
            .args(args.iter().cloned());
        self.runner.run(cmd).await
    }

    async fn inspect(&self, target: &DeployTarget, args: &[String]) -> StageResult {
        let cmd = self.base_args("inspect", target).args(args.iter().cloned());
        self.runner.run(cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<CommandSpec>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, cmd: CommandSpec) -> StageResult {
            self.calls.lock().unwrap().push(cmd);
            StageResult::success(Utc::now(), "Succeeded")
        }
    }

    fn target() -> DeployTarget {
        DeployTarget {
            app_name: "simple-app-ctrl".to_string(),
            namespace: "default".to_string(),
            into_ns: Some("apps".to_string()),
            map_ns: vec!["default=apps".to_string()],
            access: ClusterAccess::Kubeconfig("kind: Config\n".to_string()),
        }
    }

    #[tokio::test]
    async fn deploy_passes_manifests_on_stdin() {
        let runner = Arc::new(RecordingRunner::default());
        let kapp = Kapp::new("kapp", runner.clone());

        let result = kapp
            .deploy(&target(), "kind: ConfigMap", &["--wait-timeout=5m".to_string()])
            .await;
        assert!(result.is_success());

        let calls = runner.calls.lock().unwrap();
        let cmd = &calls[0];
        assert_eq!(cmd.program, "kapp");
        assert_eq!(
            cmd.args,
            vec![
                "deploy",
                "--app",
                "simple-app-ctrl",
                "--namespace",
                "default",
                "-f",
                "-",
                "--yes",
                "--into-ns=apps",
                "--map-ns=default=apps",
                "--wait-timeout=5m",
            ]
        );
        assert_eq!(cmd.stdin.as_deref(), Some("kind: ConfigMap"));
        assert_eq!(
            cmd.env,
            vec![(KUBECONFIG_YAML_ENV.to_string(), "kind: Config\n".to_string())]
        );
    }

    #[tokio::test]
    async fn controller_access_adds_no_kubeconfig() {
        let runner = Arc::new(RecordingRunner::default());
        let kapp = Kapp::new("kapp", runner.clone());
        let mut target = target();
        target.access = ClusterAccess::Controller;

        kapp.deploy(&target, "kind: ConfigMap", &[]).await;

        let calls = runner.calls.lock().unwrap();
        assert!(calls[0].env.is_empty());
        assert!(!calls[0].args.iter().any(|a| a.starts_with("--kubeconfig")));
    }

    #[tokio::test]
    async fn delete_and_inspect_append_user_flags_last() {
        let runner = Arc::new(RecordingRunner::default());
        let kapp = Kapp::new("/bin/kapp", runner.clone());

        kapp.delete(&target(), &["--apply-ignored=true".to_string()])
            .await;
        kapp.inspect(&target(), &["--tree".to_string()]).await;

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].args.first().map(String::as_str), Some("delete"));
        assert_eq!(calls[0].args.last().map(String::as_str), Some("--apply-ignored=true"));
        assert!(calls[0].stdin.is_none());
        assert_eq!(calls[1].args.first().map(String::as_str), Some("inspect"));
        assert_eq!(calls[1].args.last().map(String::as_str), Some("--tree"));
    }
}
