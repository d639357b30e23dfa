//! # Restricted kapp flags
//!
//! `rawOptions` come from a CRD field but end up as arguments to kapp, which
//! runs with broad cluster permissions. Every user-supplied flag must appear
//! in the allow-list for the operation being invoked; a single unknown flag
//! rejects the whole invocation.

use crate::tasks::types::{Error, Result};
use lazy_static::lazy_static;
use std::collections::BTreeSet;
use std::fmt;

/// kapp operations that accept user-supplied flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KappOperation {
    Deploy,
    Inspect,
    Delete,
}

impl KappOperation {
    /// Whether the operation changes cluster state
    #[must_use]
    pub fn mutates(self) -> bool {
        matches!(self, Self::Deploy | Self::Delete)
    }
}

impl fmt::Display for KappOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Deploy => "deploy",
            Self::Inspect => "inspect",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

const SHARED_FLAGS: &[&str] = &[
    // Globals
    "--column",
    "--debug",
    "--json",
    "--tty",
    "--dangerous-ignore-failing-api-services",
    "--dangerous-scope-to-fallback-allowed-namespaces",
    // Filtering
    "--filter",
    "--filter-age",
    "--filter-kind",
    "--filter-kind-name",
    "--filter-kind-ns",
    "--filter-kind-ns-name",
    "--filter-name",
    "--filter-ns",
    "--kube-api-qps",
    "--kube-api-burst",
];

const CHANGE_FLAGS: &[&str] = &[
    // Diffing
    "--diff-changes",
    "--diff-against-last-applied",
    "--diff-context",
    "--diff-line-numbers",
    "--diff-mask",
    "--diff-run",
    "--diff-summary",
    // Applying
    "--apply-check-interval",
    "--apply-concurrency",
    "--apply-default-update-strategy",
    "--apply-ignored",
    "--apply-timeout",
    // Waiting
    "--wait",
    "--wait-check-interval",
    "--wait-concurrency",
    "--wait-ignored",
    "--wait-timeout",
];

const DEPLOY_FLAGS: &[&str] = &[
    "--dangerous-allow-empty-list-of-resources",
    "--dangerous-override-ownership-of-existing-resources",
    "--into-ns",
    "--map-ns",
    "--logs",
    "--logs-all",
    "--app-changes-max-to-keep",
    "--labels",
    "--patch",
];

const INSPECT_FLAGS: &[&str] = &["--raw", "--status", "--tree"];

/// Immutable allow-list for one operation
#[derive(Debug, Clone)]
pub struct FlagSet {
    flags: BTreeSet<&'static str>,
}

impl FlagSet {
    #[must_use]
    pub fn new(groups: &[&[&'static str]]) -> Self {
        Self {
            flags: groups.iter().flat_map(|g| g.iter().copied()).collect(),
        }
    }

    /// Whether `opt` (`--name` or `--name=value`) names an allowed flag
    #[must_use]
    pub fn contains(&self, opt: &str) -> bool {
        self.flags.contains(flag_name(opt))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

/// The portion of an option before `=`
fn flag_name(opt: &str) -> &str {
    opt.split_once('=').map_or(opt, |(name, _)| name)
}

fn operation_flags(operation: KappOperation) -> &'static [&'static str] {
    match operation {
        KappOperation::Deploy => DEPLOY_FLAGS,
        KappOperation::Inspect => INSPECT_FLAGS,
        KappOperation::Delete => &[],
    }
}

/// shared ∪ change (for mutating operations) ∪ operation-specific flags
fn flag_set_for(operation: KappOperation) -> FlagSet {
    let change: &[&'static str] = if operation.mutates() { CHANGE_FLAGS } else { &[] };
    FlagSet::new(&[SHARED_FLAGS, change, operation_flags(operation)])
}

lazy_static! {
    static ref DEPLOY_FLAG_SET: FlagSet = flag_set_for(KappOperation::Deploy);
    static ref INSPECT_FLAG_SET: FlagSet = flag_set_for(KappOperation::Inspect);
    static ref DELETE_FLAG_SET: FlagSet = flag_set_for(KappOperation::Delete);
}

/// Allow-list for an operation
#[must_use]
pub fn allowed_flags(operation: KappOperation) -> &'static FlagSet {
    match operation {
        KappOperation::Deploy => &*DEPLOY_FLAG_SET,
        KappOperation::Inspect => &*INSPECT_FLAG_SET,
        KappOperation::Delete => &*DELETE_FLAG_SET,
    }
}

/// Check user-supplied flags for `operation` and return them unchanged.
///
/// A bare (non `-`-prefixed) token directly after an allowed flag written
/// without `=` is taken as that flag's value. Value contents are not
/// validated here.
pub fn build_invocation(operation: KappOperation, user_flags: &[String]) -> Result<Vec<String>> {
    let allowed = allowed_flags(operation);
    let mut expecting_value = false;

    for opt in user_flags {
        if expecting_value && !opt.starts_with('-') {
            expecting_value = false;
            continue;
        }

        if !allowed.contains(opt) {
            return Err(Error::RestrictedFlag {
                flag: opt.clone(),
                operation,
            });
        }
        expecting_value = !opt.contains('=');
    }

    Ok(user_flags.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn deploy_accepts_allowed_flag_unchanged() {
        let input = flags(&["--wait"]);
        assert_eq!(
            build_invocation(KappOperation::Deploy, &input).unwrap(),
            input
        );
    }

    #[test]
    fn deploy_rejects_unknown_flag_by_name() {
        let err = build_invocation(KappOperation::Deploy, &flags(&["--wait", "--danger-flag"]))
            .unwrap_err();
        match &err {
            Error::RestrictedFlag { flag, operation } => {
                assert_eq!(flag, "--danger-flag");
                assert_eq!(*operation, KappOperation::Deploy);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("--danger-flag"));
    }

    #[test]
    fn kubeconfig_is_never_allowed() {
        for op in [
            KappOperation::Deploy,
            KappOperation::Inspect,
            KappOperation::Delete,
        ] {
            assert!(build_invocation(op, &flags(&["--kubeconfig=/tmp/admin"])).is_err());
        }
    }

    #[test]
    fn value_after_equals_is_not_inspected() {
        let input = flags(&["--wait-timeout=5m", "--diff-changes=true"]);
        assert!(build_invocation(KappOperation::Deploy, &input).is_ok());
    }

    #[test]
    fn separate_value_token_follows_its_flag() {
        let input = flags(&["--wait-timeout", "5m", "--json"]);
        assert_eq!(
            build_invocation(KappOperation::Delete, &input).unwrap(),
            input
        );
    }

    #[test]
    fn dash_token_after_flag_is_checked_as_a_flag() {
        let err = build_invocation(KappOperation::Deploy, &flags(&["--wait", "-f"])).unwrap_err();
        assert!(err.to_string().contains("'-f'"));
    }

    #[test]
    fn leading_bare_token_is_rejected() {
        assert!(build_invocation(KappOperation::Deploy, &flags(&["kube-system"])).is_err());
    }

    #[test]
    fn change_flags_are_not_valid_for_inspect() {
        assert!(build_invocation(KappOperation::Inspect, &flags(&["--tree"])).is_ok());
        assert!(build_invocation(KappOperation::Inspect, &flags(&["--wait"])).is_err());
        assert!(build_invocation(KappOperation::Delete, &flags(&["--into-ns=x"])).is_err());
    }

    #[test]
    fn flag_sets_are_unions_of_groups() {
        assert_eq!(
            allowed_flags(KappOperation::Delete).len(),
            SHARED_FLAGS.len() + CHANGE_FLAGS.len()
        );
        assert_eq!(
            allowed_flags(KappOperation::Inspect).len(),
            SHARED_FLAGS.len() + INSPECT_FLAGS.len()
        );
        assert!(KappOperation::Delete.mutates());
        assert!(!KappOperation::Inspect.mutates());
    }
}
