// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! CronJob convergence and Job history analysis.

use crate::error::{is_conflict, MaintenanceError, Result};
use crate::kubernetes::MaintenanceBackend;
use crate::maintenance::cronjob::{identity_of, is_managed, needs_update};
use crate::maintenance::plan::Plan;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::ResourceExt;
use tracing::{debug, info, instrument};

/// Jobs considered when looking for consecutive failures
const JOB_HISTORY_WINDOW: usize = 50;

/// What applying one desired CronJob did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Created,
    Updated,
    Unchanged,
}

/// Create the CronJob or replace it in place when its rendered inputs changed
#[instrument(skip(backend, desired, live), fields(cronjob = %desired.name_any()))]
pub async fn apply_cron_job(
    backend: &dyn MaintenanceBackend,
    mut desired: CronJob,
    live: Option<&CronJob>,
) -> Result<JobAction> {
    let Some(live) = live else {
        info!("Creating maintenance CronJob {}", desired.name_any());
        backend.create_cron_job(&desired).await?;
        return Ok(JobAction::Created);
    };

    if !needs_update(live, &desired) {
        debug!("CronJob {} is up to date", desired.name_any());
        return Ok(JobAction::Unchanged);
    }

    info!("Updating maintenance CronJob {}", desired.name_any());
    desired.metadata.resource_version = live.resource_version();
    match backend.replace_cron_job(&desired).await {
        Ok(()) => Ok(JobAction::Updated),
        Err(MaintenanceError::KubeError(e)) if is_conflict(&e) => Err(MaintenanceError::Incomplete(
            format!("CronJob {} changed concurrently, retrying", desired.name_any()),
        )),
        Err(e) => Err(e),
    }
}

/// Live CronJobs no desired job accounts for, split into those safe to delete
/// right away and those that wait until every desired job is in place
pub fn orphan_cron_jobs<'a>(
    live: &'a [CronJob],
    plan: &Plan,
    operator_namespace: &str,
) -> (Vec<&'a CronJob>, Vec<&'a CronJob>) {
    live.iter()
        .filter(|job| is_managed(&job.metadata))
        .filter(|job| {
            !plan.is_desired(
                job.namespace().as_deref().unwrap_or_default(),
                &job.name_any(),
            )
        })
        .partition(|job| {
            let released = identity_of(job).map_or(true, |id| !plan.jobs.contains_key(&id));
            job.namespace().as_deref() == Some(operator_namespace) && released
        })
}

/// Maintenance outcome facts derived from spawned Jobs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobHistory {
    pub last_success: Option<DateTime<Utc>>,
    /// Failed Jobs since the most recent success
    pub consecutive_failures: i32,
}

fn condition_true(job: &Job, condition: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|c| {
            c.iter()
                .any(|c| c.type_ == condition && c.status == "True")
        })
}

fn created(job: &Job) -> Option<DateTime<Utc>> {
    job.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

/// Walk the most recent Jobs newest first until the first success
pub fn summarize_job_history(jobs: &[Job]) -> JobHistory {
    let mut ordered: Vec<&Job> = jobs.iter().collect();
    ordered.sort_by_key(|job| std::cmp::Reverse(created(job)));

    let mut history = JobHistory::default();
    for job in ordered.into_iter().take(JOB_HISTORY_WINDOW) {
        if condition_true(job, "Complete") {
            history.last_success = job
                .status
                .as_ref()
                .and_then(|s| s.completion_time.as_ref())
                .map(|t| t.0)
                .or_else(|| created(job));
            break;
        }
        if condition_true(job, "Failed") {
            history.consecutive_failures += 1;
        }
    }
    history
}

/// Last success according to the CronJob or its Jobs, whichever is newer
pub fn last_success(cron_job: Option<&CronJob>, history: &JobHistory) -> Option<DateTime<Utc>> {
    let from_cron_job = cron_job
        .and_then(|c| c.status.as_ref())
        .and_then(|s| s.last_successful_time.as_ref())
        .map(|t| t.0);
    from_cron_job.max(history.last_success)
}
