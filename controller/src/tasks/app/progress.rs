//! Stage progress derived from status snapshots
//!
//! Used by anything that narrates an App's progress (terminal tailers,
//! events). Success and failure are judged from exit codes and each stage's
//! own timestamps. A stage that started before the previous stage's last
//! update belongs to an earlier run and is treated as not started yet.

use crate::crds::{AppStatus, ConditionType, StageRecord};
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    Fetch,
    Template,
    Deploy,
}

impl fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fetch => "fetch",
            Self::Template => "template",
            Self::Deploy => "deploy",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started(ProgressStage),
    Succeeded(ProgressStage),
    Failed { stage: ProgressStage, error: String },
    DeployProgressing,
    Reconciled,
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started(stage) => write!(f, "{stage}: started"),
            Self::Succeeded(stage) => write!(f, "{stage}: succeeded"),
            Self::Failed { stage, error } => write!(f, "{stage}: failed: {error}"),
            Self::DeployProgressing => f.write_str("deploy: in progress"),
            Self::Reconciled => f.write_str("App reconciled"),
        }
    }
}

/// Events up to the current point of the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub events: Vec<ProgressEvent>,
    /// Stage the pipeline stopped at (failed or still running)
    pub current: Option<ProgressStage>,
    pub error: Option<String>,
}

fn stage_error<S: StageRecord>(stderr: &str, error: &str, record: &S) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        stderr.to_string()
    } else if !error.is_empty() {
        error.to_string()
    } else {
        format!("exit code {}", record.exit_code())
    }
}

/// True when `record` was started in the same run as the stage before it
fn started_this_run<S: StageRecord>(record: &S, previous_update: Option<DateTime<Utc>>) -> bool {
    match (record.started_at(), previous_update) {
        (Some(started), Some(previous)) => started >= previous,
        (None, Some(_)) => false,
        (_, None) => true,
    }
}

enum Checkpoint {
    Continue,
    Stop,
}

fn walk<S: StageRecord>(
    stage: ProgressStage,
    record: Option<&S>,
    previous_update: Option<DateTime<Utc>>,
    stderr: &str,
    error: &str,
    progress: &mut Progress,
) -> Checkpoint {
    let Some(record) = record else {
        return Checkpoint::Stop;
    };
    if record.started_at().is_none() && record.updated_at().is_none() {
        return Checkpoint::Stop;
    }
    if !started_this_run(record, previous_update) {
        return Checkpoint::Stop;
    }

    progress.events.push(ProgressEvent::Started(stage));
    if record.is_in_progress() {
        progress.current = Some(stage);
        return Checkpoint::Stop;
    }
    if record.is_failed() {
        let error = stage_error(stderr, error, record);
        progress.events.push(ProgressEvent::Failed {
            stage,
            error: error.clone(),
        });
        progress.current = Some(stage);
        progress.error = Some(error);
        return Checkpoint::Stop;
    }
    progress.events.push(ProgressEvent::Succeeded(stage));
    Checkpoint::Continue
}

/// Walk fetch, template and deploy in order, stopping at the first stage
/// that failed or is still running.
#[must_use]
pub fn progress_till_current(status: &AppStatus) -> Progress {
    let mut progress = Progress {
        events: Vec::new(),
        current: None,
        error: None,
    };

    let fetch = status.fetch.as_ref();
    if let Checkpoint::Stop = walk(
        ProgressStage::Fetch,
        fetch,
        None,
        fetch.map_or("", |s| s.stderr.as_str()),
        fetch.map_or("", |s| s.error.as_str()),
        &mut progress,
    ) {
        return progress;
    }

    let template = status.template.as_ref();
    if let Checkpoint::Stop = walk(
        ProgressStage::Template,
        template,
        fetch.and_then(StageRecord::updated_at),
        template.map_or("", |s| s.stderr.as_str()),
        template.map_or("", |s| s.error.as_str()),
        &mut progress,
    ) {
        return progress;
    }

    let deploy = status.deploy.as_ref();
    if let Checkpoint::Continue = walk(
        ProgressStage::Deploy,
        deploy,
        template.and_then(StageRecord::updated_at),
        deploy.map_or("", |s| s.stderr.as_str()),
        deploy.map_or("", |s| s.error.as_str()),
        &mut progress,
    ) {
        if status.is_reconciled() {
            progress.events.push(ProgressEvent::Reconciled);
        }
    }
    progress
}

/// Transitions between two snapshots of the same App
#[must_use]
pub fn progress_between(old: &AppStatus, new: &AppStatus) -> Vec<ProgressEvent> {
    let mut events = Vec::new();

    transition(
        ProgressStage::Fetch,
        old.fetch.as_ref(),
        new.fetch.as_ref(),
        None,
        new.fetch.as_ref().map(|s| (s.stderr.as_str(), s.error.as_str())),
        &mut events,
    );
    transition(
        ProgressStage::Template,
        old.template.as_ref(),
        new.template.as_ref(),
        new.fetch.as_ref().and_then(StageRecord::updated_at),
        new.template.as_ref().map(|s| (s.stderr.as_str(), s.error.as_str())),
        &mut events,
    );
    transition(
        ProgressStage::Deploy,
        old.deploy.as_ref(),
        new.deploy.as_ref(),
        new.template.as_ref().and_then(StageRecord::updated_at),
        new.deploy.as_ref().map(|s| (s.stderr.as_str(), s.error.as_str())),
        &mut events,
    );

    if let (Some(old_deploy), Some(new_deploy)) = (&old.deploy, &new.deploy) {
        if new_deploy.is_in_progress()
            && old_deploy.started_at == new_deploy.started_at
            && new_deploy.stdout.len() > old_deploy.stdout.len()
        {
            events.push(ProgressEvent::DeployProgressing);
        }
    }

    if !old.is_reconciled() && new.is_reconciled() {
        events.push(ProgressEvent::Reconciled);
    }
    events
}

fn transition<S: StageRecord>(
    stage: ProgressStage,
    old: Option<&S>,
    new: Option<&S>,
    previous_update: Option<DateTime<Utc>>,
    output: Option<(&str, &str)>,
    events: &mut Vec<ProgressEvent>,
) {
    let Some(new) = new else {
        return;
    };
    if !started_this_run(new, previous_update) {
        return;
    }

    let restarted = new.started_at().is_some()
        && old.and_then(|o| o.started_at()) != new.started_at();
    if restarted {
        events.push(ProgressEvent::Started(stage));
    }

    let was_done = old.is_some_and(|o| !restarted && !o.is_in_progress() && o.updated_at().is_some());
    if was_done || new.is_in_progress() {
        return;
    }
    if new.is_failed() {
        let (stderr, error) = output.unwrap_or_default();
        events.push(ProgressEvent::Failed {
            stage,
            error: stage_error(stderr, error, new),
        });
    } else if new.is_succeeded() {
        events.push(ProgressEvent::Succeeded(stage));
    }
}

/// One-line summary from the headline condition
#[must_use]
pub fn status_string(status: &AppStatus) -> String {
    let Some(condition) = status.generic.conditions.first() else {
        return status.generic.friendly_description.clone();
    };

    match condition.condition_type {
        ConditionType::Reconciling => "Reconciling".to_string(),
        ConditionType::ReconcileSucceeded => "Reconcile succeeded".to_string(),
        ConditionType::ReconcileFailed => match &condition.message {
            Some(message) => format!("Reconcile failed: {message}"),
            None => "Reconcile failed".to_string(),
        },
        ConditionType::Deleting => "Deleting".to_string(),
        ConditionType::DeleteFailed => match &condition.message {
            Some(message) => format!("Delete failed: {message}"),
            None => "Delete failed".to_string(),
        },
    }
}

/// Streak summary, e.g. `Succeeded 3 times in a row`
#[must_use]
pub fn metric_string(status: &AppStatus) -> String {
    if status.consecutive_reconcile_successes > 0 {
        format!(
            "Succeeded {} time(s) in a row",
            status.consecutive_reconcile_successes
        )
    } else if status.consecutive_reconcile_failures > 0 {
        format!(
            "Failed {} time(s) in a row",
            status.consecutive_reconcile_failures
        )
    } else {
        "No completed reconciles".to_string()
    }
}
