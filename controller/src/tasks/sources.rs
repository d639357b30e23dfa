//! Read access to the Secrets and ConfigMaps referenced by stage configuration

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

#[async_trait]
pub trait ObjectReader: Send + Sync {
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<BTreeMap<String, Vec<u8>>>;

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<BTreeMap<String, String>>;
}

#[async_trait]
impl ObjectReader for Client {
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
        let api: Api<Secret> = Api::namespaced(self.clone(), namespace);
        let secret = api
            .get(name)
            .await
            .map_err(|e| anyhow::anyhow!("Getting secret {namespace}/{name}: {e}"))?;

        let mut data: BTreeMap<String, Vec<u8>> = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect();
        for (k, v) in secret.string_data.unwrap_or_default() {
            data.insert(k, v.into_bytes());
        }
        Ok(data)
    }

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        let api: Api<ConfigMap> = Api::namespaced(self.clone(), namespace);
        let cm = api
            .get(name)
            .await
            .map_err(|e| anyhow::anyhow!("Getting config map {namespace}/{name}: {e}"))?;
        Ok(cm.data.unwrap_or_default())
    }
}

/// Join a user-supplied relative path onto `base`, refusing absolute paths
/// and parent-directory components.
pub fn join_relative(base: &Path, rel: &str) -> anyhow::Result<PathBuf> {
    let rel_path = Path::new(rel);
    let mut joined = base.to_path_buf();
    for component in rel_path.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            _ => return Err(anyhow::anyhow!("Path '{rel}' must be relative and stay inside its directory")),
        }
    }
    Ok(joined)
}

/// Write a file, creating parent directories as needed
pub fn write_file(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

/// Join `rel` onto `base` like [`join_relative`] and make sure the result,
/// with symlinks resolved, is still a directory under `base`
pub fn resolve_sub_path(base: &Path, rel: &str) -> anyhow::Result<PathBuf> {
    let root = base.canonicalize()?;
    let resolved = join_relative(&root, rel)?
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("Sub path '{rel}': {e}"))?;
    if !resolved.starts_with(&root) {
        return Err(anyhow::anyhow!("Sub path '{rel}' resolves outside the fetched directory"));
    }
    Ok(resolved)
}

/// Recursively copy the contents of `src` into `dst`.
///
/// Symlinks are recreated only when they are relative and resolve inside
/// `src`; any other link fails the copy.
pub fn copy_dir_all(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let root = src.canonicalize()?;
    copy_tree(&root, &root, dst)
}

fn copy_tree(root: &Path, src: &Path, dst: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let path = entry?.path();
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = dst.join(name);
        let file_type = std::fs::symlink_metadata(&path)?.file_type();
        if file_type.is_symlink() {
            copy_symlink(root, &path, &target)?;
        } else if file_type.is_dir() {
            copy_tree(root, &path, &target)?;
        } else if file_type.is_file() {
            std::fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

fn copy_symlink(root: &Path, link: &Path, target: &Path) -> anyhow::Result<()> {
    let shown = link.strip_prefix(root).unwrap_or(link).display().to_string();
    let pointee = std::fs::read_link(link)?;
    let resolved = link
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("Symlink {shown} cannot be resolved: {e}"))?;
    if pointee.is_absolute() || !resolved.starts_with(root) {
        return Err(anyhow::anyhow!(
            "Symlink {shown} points outside the fetched directory"
        ));
    }
    recreate_symlink(&pointee, target)
}

#[cfg(unix)]
fn recreate_symlink(pointee: &Path, target: &Path) -> anyhow::Result<()> {
    std::os::unix::fs::symlink(pointee, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn recreate_symlink(pointee: &Path, _target: &Path) -> anyhow::Result<()> {
    Err(anyhow::anyhow!(
        "Symlink to {} is not supported on this platform",
        pointee.display()
    ))
}
