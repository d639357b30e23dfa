//! Secret/ConfigMap reference tracking across App spec changes

use app_controller::crds::App;
use app_controller::tasks::reftracker::{compute, AppRefTracker, RefKey, ReferenceSet};

const APP_YAML: &str = r"
apiVersion: kappctrl.k14s.io/v1alpha1
kind: App
metadata:
  name: simple-app
  namespace: default
spec:
  fetch:
  - inline:
      paths:
        config.yml: |
          greeting: hello
      pathsFrom:
      - secretRef:
          name: inline-secret
      - configMapRef:
          name: inline-cm
  - git:
      url: https://github.com/k14s/k8s-simple-app-example
      ref: origin/develop
      secretRef:
        name: git-creds
  template:
  - ytt:
      valuesFrom:
      - configMapRef:
          name: values-cm
  deploy:
  - kapp: {}
";

fn app() -> App {
    serde_yaml::from_str(APP_YAML).unwrap()
}

#[test]
fn spec_references_are_collected_per_kind() {
    let app = app();
    let refs = compute(&app.spec, "default");

    assert_eq!(
        refs,
        ReferenceSet::from([
            RefKey::secret("default", "inline-secret"),
            RefKey::secret("default", "git-creds"),
            RefKey::config_map("default", "inline-cm"),
            RefKey::config_map("default", "values-cm"),
        ])
    );
}

#[test]
fn editing_a_spec_moves_the_app_between_references() {
    let tracker = AppRefTracker::new();
    let owner = RefKey::app("default", "simple-app");
    let mut app = app();

    tracker.reconcile_refs(&owner, compute(&app.spec, "default"));
    assert_eq!(
        tracker.apps_for_ref(&RefKey::secret("default", "git-creds")),
        vec![owner.clone()]
    );

    // Drop the git source; its secret no longer maps to the App
    app.spec.fetch.truncate(1);
    let changes = tracker.reconcile_refs(&owner, compute(&app.spec, "default"));
    assert_eq!(
        changes.removed,
        ReferenceSet::from([RefKey::secret("default", "git-creds")])
    );
    assert!(tracker
        .apps_for_ref(&RefKey::secret("default", "git-creds"))
        .is_empty());
    assert!(!tracker.take_update(&owner));

    // A change to a still-referenced ConfigMap forces exactly one reconcile
    let marked = tracker.mark_apps_for_update(&RefKey::config_map("default", "values-cm"));
    assert_eq!(marked, vec![owner.clone()]);
    assert!(tracker.take_update(&owner));
    assert!(!tracker.take_update(&owner));

    tracker.remove_app(&owner);
    assert!(tracker
        .apps_for_ref(&RefKey::config_map("default", "values-cm"))
        .is_empty());
}
