//! Template stage: ytt and helm template steps run in order

use crate::crds::{AppTemplate, TemplateHelm, TemplateYtt, ValuesSource};
use crate::tasks::config::ToolsConfig;
use crate::tasks::exec::{positional, CommandRunner, CommandSpec};
use crate::tasks::sources::{join_relative, write_file, ObjectReader};
use crate::tasks::stages::{StageResult, Templater};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Renders fetched content with ytt and `helm template`
#[derive(Clone)]
pub struct ToolTemplater {
    tools: ToolsConfig,
    runner: Arc<dyn CommandRunner>,
    objects: Arc<dyn ObjectReader>,
}

impl ToolTemplater {
    #[must_use]
    pub fn new(
        tools: ToolsConfig,
        runner: Arc<dyn CommandRunner>,
        objects: Arc<dyn ObjectReader>,
    ) -> Self {
        Self {
            tools,
            runner,
            objects,
        }
    }

    /// Write every values source into `scratch` and return the file paths
    async fn values_files(
        &self,
        namespace: &str,
        sources: &[ValuesSource],
        fetched: &Path,
        scratch: &Path,
    ) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for (idx, source) in sources.iter().enumerate() {
            let dir = scratch.join(format!("values-{idx}"));
            if let Some(secret) = &source.secret_ref {
                for (key, value) in self.objects.secret_data(namespace, &secret.name).await? {
                    let file = join_relative(&dir, &key)?;
                    write_file(&file, &value)?;
                    files.push(file);
                }
            }
            if let Some(cm) = &source.config_map_ref {
                for (key, value) in self.objects.config_map_data(namespace, &cm.name).await? {
                    let file = join_relative(&dir, &key)?;
                    write_file(&file, value.as_bytes())?;
                    files.push(file);
                }
            }
            if let Some(path) = &source.path {
                files.push(join_relative(fetched, path)?);
            }
        }
        Ok(files)
    }

    async fn ytt(
        &self,
        namespace: &str,
        ytt: &TemplateYtt,
        fetched: &Path,
        previous: Option<&str>,
        started_at: DateTime<Utc>,
    ) -> StageResult {
        let scratch = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return StageResult::failure(started_at, format!("Creating scratch dir: {e}")),
        };

        let mut cmd = CommandSpec::new(&self.tools.ytt).current_dir(fetched);
        match previous {
            Some(input) => cmd = cmd.args(["-f", "-"]).stdin(input),
            None if ytt.paths.is_empty() => cmd = cmd.args(["-f", "."]),
            None => {
                for path in &ytt.paths {
                    if let Err(e) = join_relative(fetched, path) {
                        return StageResult::failure(started_at, format!("{e:#}"));
                    }
                    cmd = cmd.args(["-f", path.as_str()]);
                }
            }
        }

        if let Some(inline) = &ytt.inline {
            let inline_dir = scratch.path().join("inline");
            for (path, contents) in &inline.paths {
                let written = join_relative(&inline_dir, path)
                    .and_then(|file| write_file(&file, contents.as_bytes()));
                if let Err(e) = written {
                    return StageResult::failure(started_at, format!("{e:#}"));
                }
            }
            if !inline.paths.is_empty() {
                cmd = cmd.arg("-f").arg(inline_dir.to_string_lossy());
            }
        }

        let values = match self
            .values_files(namespace, &ytt.values_from, fetched, scratch.path())
            .await
        {
            Ok(values) => values,
            Err(e) => return StageResult::failure(started_at, format!("{e:#}")),
        };
        for file in values {
            cmd = cmd.arg("--data-values-file").arg(file.to_string_lossy());
        }
        if ytt.ignore_unknown_comments {
            cmd = cmd.arg("--ignore-unknown-comments");
        }

        self.runner.run(cmd).await
    }

    async fn helm(
        &self,
        namespace: &str,
        app_name: &str,
        helm: &TemplateHelm,
        fetched: &Path,
        started_at: DateTime<Utc>,
    ) -> StageResult {
        let scratch = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return StageResult::failure(started_at, format!("Creating scratch dir: {e}")),
        };
        let chart = match helm.path.as_deref() {
            Some(path) => match join_relative(fetched, path) {
                Ok(chart) => chart,
                Err(e) => return StageResult::failure(started_at, format!("{e:#}")),
            },
            None => fetched.to_path_buf(),
        };

        let release = helm.name.as_deref().unwrap_or(app_name);
        let release = match positional("helm release name", release) {
            Ok(release) => release,
            Err(e) => return StageResult::failure(started_at, format!("{e:#}")),
        };

        let mut cmd = CommandSpec::new(&self.tools.helm)
            .arg("template")
            .arg("--namespace")
            .arg(helm.namespace.as_deref().unwrap_or(namespace));

        let values = match self
            .values_files(namespace, &helm.values_from, fetched, scratch.path())
            .await
        {
            Ok(values) => values,
            Err(e) => return StageResult::failure(started_at, format!("{e:#}")),
        };
        for file in values {
            cmd = cmd.arg("--values").arg(file.to_string_lossy());
        }
        let cmd = cmd.arg("--").arg(release).arg(chart.to_string_lossy());

        self.runner.run(cmd).await
    }
}

#[async_trait]
impl Templater for ToolTemplater {
    async fn template(
        &self,
        namespace: &str,
        app_name: &str,
        steps: &[AppTemplate],
        fetched: &Path,
    ) -> StageResult {
        let started_at = Utc::now();
        if steps.is_empty() {
            return StageResult::failure(started_at, "Expected at least one template step");
        }

        // Each step after the first consumes the previous step's output.
        let mut previous: Option<String> = None;
        let mut last = StageResult::success(started_at, "");
        for (idx, step) in steps.iter().enumerate() {
            debug!(namespace, app = app_name, step = idx, "Running template step");
            let mut result = if let Some(ytt) = &step.ytt {
                self.ytt(namespace, ytt, fetched, previous.as_deref(), started_at)
                    .await
            } else if let Some(helm) = &step.helm_template {
                if previous.is_some() {
                    StageResult::failure(
                        started_at,
                        "helmTemplate is only supported as the first template step",
                    )
                } else {
                    self.helm(namespace, app_name, helm, fetched, started_at)
                        .await
                }
            } else {
                StageResult::failure(started_at, "Expected one of ytt or helmTemplate")
            };

            result.started_at = started_at;
            if !result.is_success() {
                return result;
            }
            previous = Some(result.stdout.clone());
            last = result;
        }

        info!(namespace, app = app_name, steps = steps.len(), "Template completed");
        last
    }
}
