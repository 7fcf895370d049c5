// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Settles competing maintenance declarations.
//!
//! Two levels of competition exist. Several policies can match one source;
//! the highest priority wins, ties going to the smaller name. Several
//! contributions (from different sources or policies) can then land on one
//! repository identity; the configured [`ArbitrationStrategy`] picks the one
//! governing the CronJob.

use crate::config::ArbitrationStrategy;
use crate::constants::defaults;
use crate::error::{MaintenanceError, Result};
use crate::maintenance::identity::RepositoryIdentity;
use crate::maintenance::schedule;
use crate::types::{CustomCaSpec, KopiaMaintenance, ReplicationSource};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Toleration};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// Where a source gets its maintenance from
#[derive(Debug, Clone, Copy)]
pub enum SourceMode<'a> {
    /// The winning matching policy
    PolicyManaged(&'a KopiaMaintenance),
    /// Deprecated fields embedded in the source
    LegacyEmbedded,
    /// Neither; maintained with defaults only when configured to
    Unmanaged,
}

/// Sort policies so that the winner comes first
pub fn rank_policies(policies: &mut [&KopiaMaintenance]) {
    policies.sort_by(|a, b| {
        b.spec
            .priority
            .cmp(&a.spec.priority)
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
}

/// A policy match always takes precedence over embedded settings
pub fn source_mode<'a>(
    source: &ReplicationSource,
    ranked_matches: &[&'a KopiaMaintenance],
) -> SourceMode<'a> {
    match ranked_matches.first() {
        Some(winner) => SourceMode::PolicyManaged(winner),
        None if source.has_legacy_maintenance() => SourceMode::LegacyEmbedded,
        None => SourceMode::Unmanaged,
    }
}

/// Everything rendered into a CronJob besides identity and naming
#[derive(Debug, Clone, PartialEq)]
pub struct JobSettings {
    pub schedule: String,
    pub suspend: bool,
    pub successful_jobs_history_limit: i32,
    pub failed_jobs_history_limit: i32,
    pub resources: Option<ResourceRequirements>,
    pub service_account_name: Option<String>,
    pub pod_labels: BTreeMap<String, String>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub affinity: Option<Affinity>,
}

impl Default for JobSettings {
    fn default() -> Self {
        JobSettings {
            schedule: defaults::SCHEDULE.to_string(),
            suspend: false,
            successful_jobs_history_limit: defaults::SUCCESSFUL_JOBS_HISTORY_LIMIT,
            failed_jobs_history_limit: defaults::FAILED_JOBS_HISTORY_LIMIT,
            resources: None,
            service_account_name: None,
            pod_labels: BTreeMap::new(),
            node_selector: BTreeMap::new(),
            tolerations: Vec::new(),
            affinity: None,
        }
    }
}

impl JobSettings {
    pub fn from_policy(policy: &KopiaMaintenance) -> Self {
        let spec = &policy.spec;
        JobSettings {
            schedule: policy.schedule().to_string(),
            suspend: spec.suspend.unwrap_or(false),
            successful_jobs_history_limit: spec
                .successful_jobs_history_limit
                .unwrap_or(defaults::SUCCESSFUL_JOBS_HISTORY_LIMIT),
            failed_jobs_history_limit: spec
                .failed_jobs_history_limit
                .unwrap_or(defaults::FAILED_JOBS_HISTORY_LIMIT),
            resources: spec.resources.clone(),
            service_account_name: spec.service_account_name.clone(),
            pod_labels: spec.mover_pod_labels.clone(),
            node_selector: spec.node_selector.clone(),
            tolerations: spec.tolerations.clone(),
            affinity: spec.affinity.clone(),
        }
    }

    pub fn from_legacy(source: &ReplicationSource) -> Self {
        let mut settings = JobSettings::default();
        if let Some(schedule) = source.legacy_schedule() {
            settings.schedule = schedule;
        }
        let cron = source
            .kopia()
            .and_then(|k| k.maintenance_cron_job.as_ref());
        if let Some(cron) = cron {
            settings.suspend = cron.suspend.unwrap_or(false);
            if let Some(limit) = cron.successful_jobs_history_limit {
                settings.successful_jobs_history_limit = limit;
            }
            if let Some(limit) = cron.failed_jobs_history_limit {
                settings.failed_jobs_history_limit = limit;
            }
            settings.resources = cron.resources.clone();
        }
        settings
    }

    /// Rejects settings the API server would refuse in a CronJob
    pub fn validate(&self) -> Result<()> {
        schedule::validate(&self.schedule)?;
        for (field, limit) in [
            ("successfulJobsHistoryLimit", self.successful_jobs_history_limit),
            ("failedJobsHistoryLimit", self.failed_jobs_history_limit),
        ] {
            if limit < 0 {
                return Err(MaintenanceError::Validation(format!(
                    "{} must not be negative",
                    field
                )));
            }
        }
        Ok(())
    }
}

/// What kind of declaration produced a contribution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Policy { name: String, priority: i32 },
    Legacy,
    Unmanaged,
}

impl Origin {
    pub fn policy_name(&self) -> Option<&str> {
        match self {
            Origin::Policy { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// One declaration asking for maintenance of one repository
#[derive(Debug, Clone)]
pub struct Contribution {
    pub identity: RepositoryIdentity,
    pub origin: Origin,
    /// Namespace holding the repository secret
    pub namespace: String,
    /// Name of the declaring ReplicationSource, or of the policy in direct mode
    pub source: String,
    pub repository: String,
    pub custom_ca: Option<CustomCaSpec>,
    pub created: Option<DateTime<Utc>>,
    pub settings: JobSettings,
}

/// A schedule proposal turned down under first-wins arbitration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConflict {
    pub namespace: String,
    pub source: String,
    pub rejected_schedule: String,
    pub timestamp: DateTime<Utc>,
}

/// Schedule bookkeeping read back from a live CronJob
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleState {
    pub schedule: String,
    pub origin_namespace: Option<String>,
    pub conflicts: Vec<ScheduleConflict>,
}

/// Outcome of arbitration for one identity
#[derive(Debug, Clone)]
pub struct Decision<'a> {
    /// Supplies repository, credentials and every setting but the schedule
    pub governing: &'a Contribution,
    pub schedule: String,
    pub origin_namespace: Option<String>,
    pub conflicts: Vec<ScheduleConflict>,
}

/// Pick the governing contribution for one identity; None means cleanup
pub fn arbitrate<'a>(
    strategy: ArbitrationStrategy,
    contributions: &'a [Contribution],
    existing: Option<&ScheduleState>,
    now: DateTime<Utc>,
) -> Option<Decision<'a>> {
    match strategy {
        ArbitrationStrategy::Priority => {
            let governing = contributions.iter().min_by(|a, b| {
                priority_key(a).cmp(&priority_key(b))
            })?;
            Some(Decision {
                governing,
                schedule: governing.settings.schedule.clone(),
                origin_namespace: None,
                conflicts: Vec::new(),
            })
        }
        ArbitrationStrategy::FirstWins => first_wins(contributions, existing, now),
    }
}

fn priority_key(c: &Contribution) -> (u8, Reverse<i32>, &str, &str, &str) {
    let (class, priority, name) = match &c.origin {
        Origin::Policy { name, priority } => (0, *priority, name.as_str()),
        Origin::Legacy => (1, 0, ""),
        Origin::Unmanaged => (2, 0, ""),
    };
    (class, Reverse(priority), name, &c.namespace, &c.source)
}

fn creation_key(c: &Contribution) -> (bool, Option<DateTime<Utc>>, &str, &str) {
    (c.created.is_none(), c.created, &c.namespace, &c.source)
}

fn first_wins<'a>(
    contributions: &'a [Contribution],
    existing: Option<&ScheduleState>,
    now: DateTime<Utc>,
) -> Option<Decision<'a>> {
    let earliest = contributions
        .iter()
        .min_by(|a, b| creation_key(a).cmp(&creation_key(b)))?;

    let established = existing
        .filter(|state| !state.schedule.is_empty())
        .and_then(|state| {
            state
                .origin_namespace
                .as_deref()
                .map(|origin| (state, origin))
        });

    let (governing, schedule, origin) = match established {
        Some((state, origin)) => {
            let from_origin = contributions
                .iter()
                .filter(|c| c.namespace == origin)
                .min_by(|a, b| creation_key(a).cmp(&creation_key(b)));
            match from_origin {
                Some(c) => (c, c.settings.schedule.clone(), origin.to_string()),
                // Origin namespace is gone; its schedule outlives it
                None => (earliest, state.schedule.clone(), origin.to_string()),
            }
        }
        None => (
            earliest,
            earliest.settings.schedule.clone(),
            earliest.namespace.clone(),
        ),
    };

    let previous = existing.map(|s| s.conflicts.as_slice()).unwrap_or_default();
    let mut conflicts: Vec<ScheduleConflict> = contributions
        .iter()
        .filter(|c| c.namespace != origin && c.settings.schedule != schedule)
        .map(|c| {
            let timestamp = previous
                .iter()
                .find(|p| {
                    p.namespace == c.namespace
                        && p.source == c.source
                        && p.rejected_schedule == c.settings.schedule
                })
                .map(|p| p.timestamp)
                .unwrap_or(now);
            ScheduleConflict {
                namespace: c.namespace.clone(),
                source: c.source.clone(),
                rejected_schedule: c.settings.schedule.clone(),
                timestamp,
            }
        })
        .collect();
    conflicts.sort_by(|a, b| (&a.namespace, &a.source).cmp(&(&b.namespace, &b.source)));
    conflicts.dedup_by(|a, b| a.namespace == b.namespace && a.source == b.source);

    Some(Decision {
        governing,
        schedule,
        origin_namespace: Some(origin),
        conflicts,
    })
}
