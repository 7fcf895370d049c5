// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Central coordinator for maintenance convergence.
//!
//! Reconcilers and watchers never touch CronJobs themselves. They send a
//! trigger to the [`MaintenanceManager`], which coalesces everything queued
//! into a single pass over fresh listings.

use crate::config::Config;
use crate::error::{MaintenanceError, Result};
use crate::kubernetes::MaintenanceBackend;
use crate::maintenance::cronjob::render;
use crate::maintenance::identity::RepositoryIdentity;
use crate::maintenance::plan::{compute, Plan, PlanInput};
use crate::maintenance::schedule;
use crate::sync::jobs::{
    apply_cron_job, last_success, orphan_cron_jobs, summarize_job_history, JobAction,
};
use crate::sync::secrets::{collect_orphan_credentials, project_credentials};
use crate::sync::status::{build_status, status_update, PolicyFacts};
use crate::types::KopiaMaintenance;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::CronJob;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// What one convergence pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub credentials_deleted: usize,
    /// Identities whose credentials could not be projected
    pub blocked: BTreeMap<RepositoryIdentity, String>,
    /// Identities whose CronJob could not be converged
    pub failed: BTreeMap<RepositoryIdentity, String>,
    /// Superseded CronJobs kept until every desired job is in place
    pub deferred: usize,
}

impl PassSummary {
    /// Every desired CronJob is in place and nothing waits for cleanup
    pub fn is_complete(&self) -> bool {
        self.blocked.is_empty() && self.failed.is_empty() && self.deferred == 0
    }
}

enum Trigger {
    Notify(String),
    Converge(oneshot::Sender<Result<PassSummary>>),
}

/// Handle to request passes from the [`MaintenanceManager`]
#[derive(Clone)]
pub struct MaintenanceHandle {
    trigger_tx: mpsc::Sender<Trigger>,
}

impl MaintenanceHandle {
    /// Ask for a pass without waiting for it
    pub async fn notify(&self, reason: impl Into<String>) {
        if let Err(e) = self.trigger_tx.send(Trigger::Notify(reason.into())).await {
            error!("Failed to send trigger to maintenance manager: {}", e);
        }
    }

    /// Run a pass and wait for its outcome
    pub async fn converge(&self) -> Result<PassSummary> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.trigger_tx
            .send(Trigger::Converge(reply_tx))
            .await
            .map_err(|_| MaintenanceError::ManagerUnavailable("manager stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| MaintenanceError::ManagerUnavailable("pass was dropped".to_string()))?
    }
}

/// Owns every write to CronJobs, projected credentials and policy status
pub struct MaintenanceManager {
    backend: Arc<dyn MaintenanceBackend>,
    config: Config,
    image: watch::Receiver<String>,
    trigger_rx: mpsc::Receiver<Trigger>,
}

impl MaintenanceManager {
    pub fn new(
        backend: Arc<dyn MaintenanceBackend>,
        config: Config,
        image: watch::Receiver<String>,
    ) -> (Self, MaintenanceHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(256);

        let manager = Self {
            backend,
            config,
            image,
            trigger_rx,
        };

        let handle = MaintenanceHandle { trigger_tx };
        (manager, handle)
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("Maintenance manager started, performing initial pass...");
        self.converge_and_reply(Vec::new()).await;
        info!("Initial pass complete, listening for triggers...");

        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        resync.tick().await;

        let mut image_open = true;
        loop {
            tokio::select! {
                trigger = self.trigger_rx.recv() => {
                    let Some(trigger) = trigger else {
                        break;
                    };
                    let waiters = self.coalesce(trigger);
                    self.converge_and_reply(waiters).await;
                }
                _ = resync.tick() => {
                    debug!("Periodic resync");
                    self.converge_and_reply(Vec::new()).await;
                }
                changed = self.image.changed(), if image_open => {
                    if changed.is_ok() {
                        info!("Maintenance image changed to {}", *self.image.borrow());
                        self.converge_and_reply(Vec::new()).await;
                    } else {
                        image_open = false;
                    }
                }
            }
        }

        warn!("All maintenance handles dropped, manager stopping");
        Ok(())
    }

    /// Drain queued triggers so a burst of events costs one pass
    fn coalesce(&mut self, first: Trigger) -> Vec<oneshot::Sender<Result<PassSummary>>> {
        let mut waiters = Vec::new();
        let mut reasons = Vec::new();
        let mut next = Some(first);
        while let Some(trigger) = next {
            match trigger {
                Trigger::Notify(reason) => reasons.push(reason),
                Trigger::Converge(reply) => waiters.push(reply),
            }
            next = self.trigger_rx.try_recv().ok();
        }
        debug!(
            waiters = waiters.len(),
            "Converging after {} notification(s): {}",
            reasons.len(),
            reasons.join(", ")
        );
        waiters
    }

    async fn converge_and_reply(&self, waiters: Vec<oneshot::Sender<Result<PassSummary>>>) {
        let result = self.pass(Utc::now()).await;
        match &result {
            Ok(summary) if summary.is_complete() => debug!(?summary, "Pass complete"),
            Ok(summary) => warn!(
                blocked = summary.blocked.len(),
                failed = summary.failed.len(),
                deferred = summary.deferred,
                "Pass incomplete"
            ),
            Err(e) => error!("Maintenance pass failed: {}", e),
        }

        for waiter in waiters {
            let reply = match &result {
                Ok(summary) => Ok(summary.clone()),
                Err(e) => Err(MaintenanceError::Incomplete(e.to_string())),
            };
            // Dropped when the reconciler that asked was cancelled or timed out
            let _ = waiter.send(reply);
        }
    }

    /// One level-triggered pass: plan, project, converge, collect, report
    #[instrument(skip(self))]
    pub async fn pass(&self, now: DateTime<Utc>) -> Result<PassSummary> {
        let backend = self.backend.as_ref();
        let image = self.image.borrow().clone();
        let namespace = self.config.operator_namespace.as_str();

        let policies = backend.list_policies().await?;
        let sources = backend.list_sources().await?;
        let namespaces = backend.namespace_labels().await?;
        let live = backend.list_cron_jobs().await?;

        let plan = compute(&PlanInput {
            policies: &policies,
            sources: &sources,
            namespaces: &namespaces,
            existing: &live,
            config: &self.config,
            now,
        });
        debug!(
            jobs = plan.jobs.len(),
            policies = plan.policies.len(),
            "Computed desired state"
        );

        let mut summary = PassSummary::default();
        let mut created = Vec::new();
        for job in plan.jobs.values() {
            match project_credentials(backend, job).await {
                Ok(_) => {}
                Err(MaintenanceError::CredentialUnavailable(message)) => {
                    warn!(identity = %job.identity, "Keeping CronJob as is: {}", message);
                    summary.blocked.insert(job.identity.clone(), message);
                    continue;
                }
                Err(e) => return Err(e),
            }

            let current = find_cron_job(&live, &job.namespace, &job.name);
            let action = match render(job, &self.config, &image) {
                Ok(desired) => apply_cron_job(backend, desired, current).await,
                Err(e) => Err(e),
            };
            match action {
                Ok(JobAction::Created) => {
                    summary.created += 1;
                    created.push(job.identity.clone());
                }
                Ok(JobAction::Updated) => summary.updated += 1,
                Ok(JobAction::Unchanged) => {}
                Err(e) => {
                    warn!(cronjob = %job.name, "Failed to converge CronJob: {}", e);
                    summary.failed.insert(job.identity.clone(), e.to_string());
                }
            }
        }

        let (orphans, superseded) = orphan_cron_jobs(&live, &plan, namespace);
        for job in orphans {
            self.delete_cron_job(job).await?;
            summary.deleted += 1;
        }
        if summary.blocked.is_empty() && summary.failed.is_empty() {
            for job in superseded {
                info!(
                    "Removing superseded CronJob {}/{}",
                    job.namespace().unwrap_or_default(),
                    job.name_any()
                );
                self.delete_cron_job(job).await?;
                summary.deleted += 1;
            }
        } else {
            summary.deferred = superseded.len();
        }

        summary.credentials_deleted = collect_orphan_credentials(backend, namespace, &plan).await?;

        self.write_statuses(&policies, &plan, &live, &summary, &created, now)
            .await;

        Ok(summary)
    }

    async fn delete_cron_job(&self, job: &CronJob) -> Result<()> {
        let namespace = job.namespace().unwrap_or_default();
        info!("Deleting maintenance CronJob {}/{}", namespace, job.name_any());
        self.backend.delete_cron_job(&namespace, &job.name_any()).await
    }

    async fn write_statuses(
        &self,
        policies: &[KopiaMaintenance],
        plan: &Plan,
        live: &[CronJob],
        summary: &PassSummary,
        created: &[RepositoryIdentity],
        now: DateTime<Utc>,
    ) {
        let resync = chrono::Duration::from_std(self.config.resync_interval)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));

        for policy in policies {
            let name = policy.name_any();
            let Some(report) = plan.policies.get(&name) else {
                continue;
            };

            let mut facts = PolicyFacts::default();
            let governed = plan
                .jobs
                .values()
                .filter(|job| job.winning_policy.as_deref() == Some(name.as_str()));
            for job in governed {
                let history = match self.backend.list_jobs(&job.namespace, &job.identity).await {
                    Ok(jobs) => summarize_job_history(&jobs),
                    Err(e) => {
                        warn!(cronjob = %job.name, "Failed to list maintenance Jobs: {}", e);
                        Default::default()
                    }
                };
                let cron_job = find_cron_job(live, &job.namespace, &job.name);
                facts.last_maintenance = facts
                    .last_maintenance
                    .max(last_success(cron_job, &history));
                facts.consecutive_failures = facts
                    .consecutive_failures
                    .max(history.consecutive_failures);
                if !job.settings.suspend {
                    if let Some(next) = schedule::next_run(&job.settings.schedule, now) {
                        facts.next_run = Some(facts.next_run.map_or(next, |n| n.min(next)));
                    }
                }
                if let Some(message) = summary.blocked.get(&job.identity) {
                    facts.credential_error.get_or_insert_with(|| message.clone());
                }
                if let Some(message) = summary.failed.get(&job.identity) {
                    facts.apply_error.get_or_insert_with(|| message.clone());
                }
                facts.created |= created.contains(&job.identity);
            }

            let status = build_status(policy, report, &facts, now);
            let Some(status) = status_update(policy, status, now, resync) else {
                continue;
            };
            if let Err(e) = self.backend.patch_policy_status(&name, &status).await {
                warn!(policy = %name, "Failed to update KopiaMaintenance status: {}", e);
            }
        }
    }
}

fn find_cron_job<'a>(live: &'a [CronJob], namespace: &str, name: &str) -> Option<&'a CronJob> {
    live.iter()
        .find(|c| c.namespace().as_deref() == Some(namespace) && c.name_any() == name)
}
