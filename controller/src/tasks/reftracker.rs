//! Secret and ConfigMap references held by reconciled resources
//!
//! Each reconcile recomputes the references of its resource and records them
//! here. Watches on Secrets and ConfigMaps look up the dependent resources
//! and flag them so their next reconcile is forced.

use crate::crds::{AppFetch, AppSpec, InlineSource, ValuesSource};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefKind {
    Secret,
    ConfigMap,
    App,
    PackageRepository,
}

/// Kind, namespace and name of a tracked object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefKey {
    pub kind: RefKind,
    pub namespace: String,
    pub name: String,
}

impl RefKey {
    #[must_use]
    pub fn new(kind: RefKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn secret(namespace: &str, name: &str) -> Self {
        Self::new(RefKind::Secret, namespace, name)
    }

    #[must_use]
    pub fn config_map(namespace: &str, name: &str) -> Self {
        Self::new(RefKind::ConfigMap, namespace, name)
    }

    #[must_use]
    pub fn app(namespace: &str, name: &str) -> Self {
        Self::new(RefKind::App, namespace, name)
    }

    #[must_use]
    pub fn package_repository(namespace: &str, name: &str) -> Self {
        Self::new(RefKind::PackageRepository, namespace, name)
    }
}

pub type ReferenceSet = BTreeSet<RefKey>;

/// References an App spec depends on. Pure: equal specs give equal sets.
#[must_use]
pub fn compute(spec: &AppSpec, namespace: &str) -> ReferenceSet {
    let mut refs = ReferenceSet::new();

    for fetch in &spec.fetch {
        fetch_refs(fetch, namespace, &mut refs);
    }

    for step in &spec.template {
        if let Some(ytt) = &step.ytt {
            if let Some(inline) = &ytt.inline {
                inline_refs(inline, namespace, &mut refs);
            }
            values_refs(&ytt.values_from, namespace, &mut refs);
        }
        if let Some(helm) = &step.helm_template {
            values_refs(&helm.values_from, namespace, &mut refs);
        }
    }

    if let Some(secret) = spec
        .cluster
        .as_ref()
        .and_then(|c| c.kubeconfig_secret_ref.as_ref())
    {
        refs.insert(RefKey::secret(namespace, &secret.name));
    }

    refs
}

// References of a single fetch source
fn fetch_refs(fetch: &AppFetch, namespace: &str, refs: &mut ReferenceSet) {
    if let Some(inline) = &fetch.inline {
        inline_refs(inline, namespace, refs);
    }
    let secret_refs = [
        fetch.git.as_ref().and_then(|g| g.secret_ref.as_ref()),
        fetch.http.as_ref().and_then(|h| h.secret_ref.as_ref()),
        fetch.image.as_ref().and_then(|i| i.secret_ref.as_ref()),
    ];
    for secret in secret_refs.into_iter().flatten() {
        refs.insert(RefKey::secret(namespace, &secret.name));
    }
}

fn inline_refs(inline: &InlineSource, namespace: &str, refs: &mut ReferenceSet) {
    for source in &inline.paths_from {
        if let Some(secret) = &source.secret_ref {
            refs.insert(RefKey::secret(namespace, &secret.name));
        }
        if let Some(cm) = &source.config_map_ref {
            refs.insert(RefKey::config_map(namespace, &cm.name));
        }
    }
}

fn values_refs(values: &[ValuesSource], namespace: &str, refs: &mut ReferenceSet) {
    for source in values {
        if let Some(secret) = &source.secret_ref {
            refs.insert(RefKey::secret(namespace, &secret.name));
        }
        if let Some(cm) = &source.config_map_ref {
            refs.insert(RefKey::config_map(namespace, &cm.name));
        }
    }
}

/// Difference between an owner's previous and new reference sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefChanges {
    pub added: ReferenceSet,
    pub removed: ReferenceSet,
}

impl RefChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    apps_by_ref: HashMap<RefKey, BTreeSet<RefKey>>,
    refs_by_app: HashMap<RefKey, ReferenceSet>,
    needs_update: HashSet<RefKey>,
}

/// Process-wide reference index. The lock is never held across an await.
#[derive(Debug, Default)]
pub struct AppRefTracker {
    state: Mutex<TrackerState>,
}

impl AppRefTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the references held by `app`
    pub fn reconcile_refs(&self, app: &RefKey, refs: ReferenceSet) -> RefChanges {
        let mut state = self.lock();
        let previous = state.refs_by_app.remove(app).unwrap_or_default();

        let changes = RefChanges {
            added: refs.difference(&previous).cloned().collect(),
            removed: previous.difference(&refs).cloned().collect(),
        };

        for removed in &changes.removed {
            if let Some(apps) = state.apps_by_ref.get_mut(removed) {
                apps.remove(app);
                if apps.is_empty() {
                    state.apps_by_ref.remove(removed);
                }
            }
        }
        for added in &changes.added {
            state
                .apps_by_ref
                .entry(added.clone())
                .or_default()
                .insert(app.clone());
        }
        if !refs.is_empty() {
            state.refs_by_app.insert(app.clone(), refs);
        }

        changes
    }

    /// Forget `app` entirely (after deletion)
    pub fn remove_app(&self, app: &RefKey) {
        let mut state = self.lock();
        state.needs_update.remove(app);
        let Some(refs) = state.refs_by_app.remove(app) else {
            return;
        };
        for reference in refs {
            if let Some(apps) = state.apps_by_ref.get_mut(&reference) {
                apps.remove(app);
                if apps.is_empty() {
                    state.apps_by_ref.remove(&reference);
                }
            }
        }
    }

    /// Owners that depend on `reference`
    #[must_use]
    pub fn apps_for_ref(&self, reference: &RefKey) -> Vec<RefKey> {
        self.lock()
            .apps_by_ref
            .get(reference)
            .map(|apps| apps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Flag every owner of `reference` for a forced reconcile and return them
    pub fn mark_apps_for_update(&self, reference: &RefKey) -> Vec<RefKey> {
        let mut state = self.lock();
        let apps: Vec<RefKey> = state
            .apps_by_ref
            .get(reference)
            .map(|apps| apps.iter().cloned().collect())
            .unwrap_or_default();
        state.needs_update.extend(apps.iter().cloned());
        apps
    }

    /// Consume the update flag for `app`
    pub fn take_update(&self, app: &RefKey) -> bool {
        self.lock().needs_update.remove(app)
    }
}
