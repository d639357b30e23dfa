//! Fetch stage: materialize inline, git, http and image sources on disk

use crate::crds::{AppFetch, FetchGit, FetchHttp, FetchImage, InlineSource};
use crate::tasks::config::ToolsConfig;
use crate::tasks::exec::{positional, CommandRunner, CommandSpec};
use crate::tasks::sources::{
    copy_dir_all, join_relative, resolve_sub_path, write_file, ObjectReader,
};
use crate::tasks::stages::{Fetcher, StageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Fetches sources with git, imgpkg and plain HTTP
#[derive(Clone)]
pub struct SourceFetcher {
    tools: ToolsConfig,
    runner: Arc<dyn CommandRunner>,
    objects: Arc<dyn ObjectReader>,
    http: reqwest::Client,
}

impl SourceFetcher {
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
            http: reqwest::Client::new(),
        }
    }

    async fn fetch_inline(
        &self,
        namespace: &str,
        inline: &InlineSource,
        dst: &Path,
    ) -> anyhow::Result<String> {
        for (path, contents) in &inline.paths {
            write_file(&join_relative(dst, path)?, contents.as_bytes())?;
        }

        let mut written = inline.paths.len();
        for source in &inline.paths_from {
            if let Some(secret) = &source.secret_ref {
                let dir = match &secret.directory_path {
                    Some(rel) => join_relative(dst, rel)?,
                    None => dst.to_path_buf(),
                };
                for (key, value) in self.objects.secret_data(namespace, &secret.name).await? {
                    write_file(&join_relative(&dir, &key)?, &value)?;
                    written += 1;
                }
            }
            if let Some(cm) = &source.config_map_ref {
                let dir = match &cm.directory_path {
                    Some(rel) => join_relative(dst, rel)?,
                    None => dst.to_path_buf(),
                };
                for (key, value) in self.objects.config_map_data(namespace, &cm.name).await? {
                    write_file(&join_relative(&dir, &key)?, value.as_bytes())?;
                    written += 1;
                }
            }
        }

        Ok(format!("Wrote {written} inline file(s)\n"))
    }

    async fn fetch_git(
        &self,
        namespace: &str,
        git: &FetchGit,
        dst: &Path,
        started_at: DateTime<Utc>,
    ) -> StageResult {
        let checkout = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return StageResult::failure(started_at, format!("Creating checkout dir: {e}")),
        };
        let key_dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return StageResult::failure(started_at, format!("Creating key dir: {e}")),
        };

        let git_ref = git.git_ref.as_deref();
        let git_ref = match git_ref.map(|r| positional("git ref", r)).transpose() {
            Ok(git_ref) => git_ref,
            Err(e) => return StageResult::failure(started_at, format!("{e:#}")),
        };

        let mut clone = CommandSpec::new(&self.tools.git)
            .args(["clone", "--quiet", "--", git.url.as_str()])
            .arg(checkout.path().to_string_lossy());
        if let Some(secret_ref) = &git.secret_ref {
            let data = match self.objects.secret_data(namespace, &secret_ref.name).await {
                Ok(data) => data,
                Err(e) => return StageResult::failure(started_at, format!("{e:#}")),
            };
            if let Some(key) = data.get("ssh-privatekey") {
                let key_path = key_dir.path().join("id");
                if let Err(e) = write_private_key(&key_path, key) {
                    return StageResult::failure(started_at, format!("Writing ssh key: {e:#}"));
                }
                clone = clone.env(
                    "GIT_SSH_COMMAND",
                    format!(
                        "ssh -i {} -o StrictHostKeyChecking=no -o IdentitiesOnly=yes",
                        key_path.display()
                    ),
                );
            }
        }

        let result = self.runner.run(clone).await;
        if !result.is_success() {
            return result;
        }

        if let Some(git_ref) = git_ref {
            let checkout_ref = CommandSpec::new(&self.tools.git)
                .args(["checkout", "--quiet", git_ref, "--"])
                .current_dir(checkout.path());
            let result = self.runner.run(checkout_ref).await;
            if !result.is_success() {
                return result;
            }
        }

        let src = match &git.sub_path {
            Some(sub) => match resolve_sub_path(checkout.path(), sub) {
                Ok(path) => path,
                Err(e) => return StageResult::failure(started_at, format!("{e:#}")),
            },
            None => checkout.path().to_path_buf(),
        };
        if let Err(e) = copy_dir_all(&src, dst) {
            return StageResult::failure(started_at, format!("Copying {}: {e:#}", src.display()));
        }
        // Keep repository metadata out of the templated tree.
        let _ = std::fs::remove_dir_all(dst.join(".git"));

        StageResult::success(started_at, format!("Fetched {}\n", git.url))
    }

    async fn fetch_http(
        &self,
        namespace: &str,
        http: &FetchHttp,
        dst: &Path,
    ) -> anyhow::Result<String> {
        let mut request = self.http.get(&http.url);
        if let Some(secret_ref) = &http.secret_ref {
            let data = self.objects.secret_data(namespace, &secret_ref.name).await?;
            if let Some(username) = data.get("username") {
                let password = data.get("password").map(|p| String::from_utf8_lossy(p).into_owned());
                request = request.basic_auth(String::from_utf8_lossy(username), password);
            }
        }

        let response = request.send().await?.error_for_status()?;
        let body = response.bytes().await?;

        if let Some(expected) = &http.sha256 {
            let actual = hex::encode(Sha256::digest(&body));
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(anyhow::anyhow!(
                    "Expected sha256 {expected} for {} but got {actual}",
                    http.url
                ));
            }
        }

        let unpacked = tempfile::tempdir()?;
        let file_name = archive_file_name(&http.url);
        if file_name.ends_with(".tgz") || file_name.ends_with(".tar.gz") {
            tar::Archive::new(GzDecoder::new(&body[..])).unpack(unpacked.path())?;
        } else if file_name.ends_with(".tar") {
            tar::Archive::new(&body[..]).unpack(unpacked.path())?;
        } else {
            write_file(&join_relative(unpacked.path(), file_name)?, &body)?;
        }

        let src = match &http.sub_path {
            Some(sub) => resolve_sub_path(unpacked.path(), sub)?,
            None => unpacked.path().to_path_buf(),
        };
        copy_dir_all(&src, dst)?;

        Ok(format!("Fetched {} ({} bytes)\n", http.url, body.len()))
    }

    async fn fetch_image(
        &self,
        namespace: &str,
        image: &FetchImage,
        dst: &Path,
        started_at: DateTime<Utc>,
    ) -> StageResult {
        let pulled = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return StageResult::failure(started_at, format!("Creating pull dir: {e}")),
        };

        let url = match positional("image url", &image.url) {
            Ok(url) => url,
            Err(e) => return StageResult::failure(started_at, format!("{e:#}")),
        };
        let mut pull = CommandSpec::new(&self.tools.imgpkg)
            .args(["pull", "-i", url, "-o"])
            .arg(pulled.path().to_string_lossy());
        if let Some(secret_ref) = &image.secret_ref {
            let data = match self.objects.secret_data(namespace, &secret_ref.name).await {
                Ok(data) => data,
                Err(e) => return StageResult::failure(started_at, format!("{e:#}")),
            };
            for (key, var) in [("username", "IMGPKG_USERNAME"), ("password", "IMGPKG_PASSWORD")] {
                if let Some(value) = data.get(key) {
                    pull = pull.env(var, String::from_utf8_lossy(value));
                }
            }
        }

        let result = self.runner.run(pull).await;
        if !result.is_success() {
            return result;
        }

        let src = match &image.sub_path {
            Some(sub) => match resolve_sub_path(pulled.path(), sub) {
                Ok(path) => path,
                Err(e) => return StageResult::failure(started_at, format!("{e:#}")),
            },
            None => pulled.path().to_path_buf(),
        };
        if let Err(e) = copy_dir_all(&src, dst) {
            return StageResult::failure(started_at, format!("Copying {}: {e:#}", src.display()));
        }

        StageResult::success(started_at, format!("Fetched {}\n", image.url))
    }

    async fn fetch_one(
        &self,
        namespace: &str,
        source: &AppFetch,
        dst: &Path,
        started_at: DateTime<Utc>,
    ) -> StageResult {
        let native = if let Some(inline) = &source.inline {
            self.fetch_inline(namespace, inline, dst).await
        } else if let Some(http) = &source.http {
            self.fetch_http(namespace, http, dst).await
        } else if let Some(git) = &source.git {
            return self.fetch_git(namespace, git, dst, started_at).await;
        } else if let Some(image) = &source.image {
            return self.fetch_image(namespace, image, dst, started_at).await;
        } else {
            Err(anyhow::anyhow!("Expected one of inline, git, http or image"))
        };

        match native {
            Ok(stdout) => StageResult::success(started_at, stdout),
            Err(e) => StageResult::failure(started_at, format!("{e:#}")),
        }
    }
}

#[async_trait]
impl Fetcher for SourceFetcher {
    async fn fetch(&self, namespace: &str, sources: &[AppFetch], dst: &Path) -> StageResult {
        let started_at = Utc::now();
        if sources.is_empty() {
            return StageResult::failure(started_at, "Expected at least one fetch source");
        }

        let mut stdout = String::new();
        for (idx, source) in sources.iter().enumerate() {
            // A lone source fills the root; several get their own directories.
            let dir = match (&source.path, sources.len()) {
                (Some(rel), _) => match join_relative(dst, rel) {
                    Ok(dir) => dir,
                    Err(e) => return StageResult::failure(started_at, format!("{e:#}")),
                },
                (None, 1) => dst.to_path_buf(),
                (None, _) => dst.join(idx.to_string()),
            };
            if let Err(e) = std::fs::create_dir_all(&dir) {
                return StageResult::failure(started_at, format!("Creating {}: {e}", dir.display()));
            }

            debug!(namespace, index = idx, dir = %dir.display(), "Fetching source");
            let mut result = self.fetch_one(namespace, source, &dir, started_at).await;
            if !result.is_success() {
                result.started_at = started_at;
                result.stdout = format!("{stdout}{}", result.stdout);
                return result;
            }
            let _ = write!(stdout, "{}", result.stdout);
        }

        info!(namespace, sources = sources.len(), "Fetch completed");
        StageResult::success(started_at, stdout)
    }
}

fn archive_file_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("content")
}

fn write_private_key(path: &Path, key: &[u8]) -> anyhow::Result<()> {
    write_file(path, key)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
