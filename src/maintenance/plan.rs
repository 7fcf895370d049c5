// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Desired state for one convergence pass.
//!
//! [`compute`] turns fresh listings of policies, sources and live CronJobs
//! into one [`DesiredJob`] per repository identity with a winner, plus a
//! [`PolicyReport`] per policy for the status writer.

use crate::config::Config;
use crate::constants::naming::{
    CA_PREFIX, CREDENTIAL_PREFIX, CRONJOB_PREFIX, MAX_CRONJOB_NAME_LENGTH,
};
use crate::maintenance::arbitration::{
    arbitrate, rank_policies, source_mode, Contribution, JobSettings, Origin, ScheduleConflict,
    SourceMode,
};
use crate::maintenance::cronjob::{identity_of, schedule_state};
use crate::maintenance::identity::RepositoryIdentity;
use crate::maintenance::matcher::{matches, NamespaceLabels};
use crate::types::maintenance::MatchedSource;
use crate::types::{CustomCaSpec, KopiaMaintenance, ReplicationSource};
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::CronJob;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Listings a pass plans from
pub struct PlanInput<'a> {
    pub policies: &'a [KopiaMaintenance],
    pub sources: &'a [ReplicationSource],
    pub namespaces: &'a dyn NamespaceLabels,
    /// Managed CronJobs currently in the cluster
    pub existing: &'a [CronJob],
    pub config: &'a Config,
    pub now: DateTime<Utc>,
}

/// One maintenance CronJob that should exist
#[derive(Debug, Clone)]
pub struct DesiredJob {
    pub identity: RepositoryIdentity,
    pub name: String,
    /// Execution namespace
    pub namespace: String,
    /// Repository secret name
    pub repository: String,
    /// Namespace the repository secret and CA are projected from
    pub repository_namespace: String,
    pub custom_ca: Option<CustomCaSpec>,
    pub contributing_namespaces: BTreeSet<String>,
    /// Arbitrated settings; the schedule may differ from the governing contribution's
    pub settings: JobSettings,
    pub winning_policy: Option<String>,
    pub schedule_origin: Option<String>,
    pub conflicts: Vec<ScheduleConflict>,
}

impl DesiredJob {
    pub fn credential_name(&self) -> String {
        credential_name(&self.identity)
    }

    /// Projected CA object name, when the repository uses a custom CA
    pub fn ca_name(&self) -> Option<String> {
        self.custom_ca
            .as_ref()
            .filter(|ca| !ca.is_empty())
            .map(|_| ca_name(&self.identity))
    }
}

/// A policy failing validation, carried into its status
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyFailure {
    pub reason: &'static str,
    pub message: String,
}

/// Per-policy outcome of a pass
#[derive(Debug, Clone, Default)]
pub struct PolicyReport {
    pub name: String,
    pub generation: Option<i64>,
    pub enabled: bool,
    pub failure: Option<PolicyFailure>,
    pub effective_schedule: Option<String>,
    pub matched_sources: Vec<MatchedSource>,
    /// Identities this policy asked maintenance for
    pub identities: BTreeSet<RepositoryIdentity>,
    /// CronJobs this policy governs
    pub active_cron_jobs: BTreeSet<String>,
    pub conflicting: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    pub jobs: BTreeMap<RepositoryIdentity, DesiredJob>,
    pub policies: BTreeMap<String, PolicyReport>,
}

impl Plan {
    pub fn is_desired(&self, namespace: &str, name: &str) -> bool {
        self.jobs
            .values()
            .any(|j| j.namespace == namespace && j.name == name)
    }
}

pub fn credential_name(identity: &RepositoryIdentity) -> String {
    format!("{}{}", CREDENTIAL_PREFIX, identity)
}

pub fn ca_name(identity: &RepositoryIdentity) -> String {
    format!("{}{}", CA_PREFIX, identity)
}

/// `kopia-maint-<readable>-<hash16>`, never longer than the CronJob name ceiling
pub fn cron_job_name(repository: &str, identity: &RepositoryIdentity) -> String {
    let budget = MAX_CRONJOB_NAME_LENGTH - CRONJOB_PREFIX.len() - 1 - identity.as_str().len();
    let readable = dns_label_fragment(repository, budget);
    if readable.is_empty() {
        format!("{}{}", CRONJOB_PREFIX, identity)
    } else {
        format!("{}{}-{}", CRONJOB_PREFIX, readable, identity)
    }
}

/// Lowercase alphanumerics and single dashes, at most `max` characters
fn dns_label_fragment(value: &str, max: usize) -> String {
    let mut out = String::with_capacity(max);
    for c in value.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
        if out.len() >= max {
            break;
        }
    }
    out.truncate(max);
    out.trim_end_matches('-').to_string()
}

/// Compute the desired state of one pass. Never fails: invalid policies are
/// reported and skipped.
pub fn compute(input: &PlanInput) -> Plan {
    let mut plan = Plan::default();
    let mut valid: Vec<&KopiaMaintenance> = Vec::new();

    for policy in input.policies {
        // A policy on its way out releases everything it governed
        if policy.is_being_deleted() {
            continue;
        }
        let mut report = PolicyReport {
            name: policy.name_any(),
            generation: policy.metadata.generation,
            enabled: policy.is_enabled(),
            ..Default::default()
        };
        match policy.validate() {
            Ok(()) => {
                if report.enabled {
                    report.effective_schedule = Some(policy.schedule().to_string());
                }
                valid.push(policy);
            }
            Err(e) => {
                debug!(policy = %report.name, "Policy failed validation: {}", e);
                report.failure = Some(PolicyFailure {
                    reason: e.reason(),
                    message: e.to_string(),
                });
            }
        }
        plan.policies.insert(report.name.clone(), report);
    }

    let mut contributions: Vec<Contribution> = Vec::new();
    contributions.extend(
        valid
            .iter()
            .filter(|p| p.is_direct_repository_mode() && p.is_enabled())
            .filter_map(|p| direct_contribution(p, input.config)),
    );

    let selectors: Vec<&KopiaMaintenance> = valid
        .iter()
        .copied()
        .filter(|p| !p.is_direct_repository_mode())
        .collect();

    for source in input.sources {
        let Some(kopia) = source.kopia() else {
            continue;
        };
        let namespace = source.namespace().unwrap_or_default();
        let name = source.name_any();

        let mut matched: Vec<&KopiaMaintenance> = selectors
            .iter()
            .copied()
            .filter(|p| matches(p, source, input.namespaces))
            .collect();
        rank_policies(&mut matched);
        record_matches(&mut plan.policies, &matched, &namespace, &name, &kopia.repository);

        let (origin, settings) = match source_mode(source, &matched) {
            SourceMode::PolicyManaged(winner) => {
                if !winner.is_enabled() {
                    continue;
                }
                (
                    Origin::Policy {
                        name: winner.name_any(),
                        priority: winner.spec.priority,
                    },
                    JobSettings::from_policy(winner),
                )
            }
            SourceMode::LegacyEmbedded => {
                warn!(
                    source = %name,
                    namespace = %namespace,
                    "Embedded maintenanceCronJob / maintenanceIntervalDays are deprecated, use a KopiaMaintenance instead"
                );
                if !source.legacy_maintenance_enabled() {
                    continue;
                }
                let settings = JobSettings::from_legacy(source);
                if let Err(e) = settings.validate() {
                    warn!(
                        source = %name,
                        namespace = %namespace,
                        error = %e,
                        "Ignoring invalid embedded maintenance settings"
                    );
                    continue;
                }
                (Origin::Legacy, settings)
            }
            SourceMode::Unmanaged => {
                if !input.config.manage_unconfigured_sources {
                    continue;
                }
                (Origin::Unmanaged, JobSettings::default())
            }
        };

        contributions.push(Contribution {
            identity: RepositoryIdentity::compute(&kopia.repository, kopia.custom_ca.as_ref()),
            origin,
            namespace,
            source: name,
            repository: kopia.repository.clone(),
            custom_ca: kopia.custom_ca.clone().filter(|ca| !ca.is_empty()),
            created: source.metadata.creation_timestamp.as_ref().map(|t| t.0),
            settings,
        });
    }

    let mut by_identity: BTreeMap<RepositoryIdentity, Vec<Contribution>> = BTreeMap::new();
    for contribution in contributions {
        by_identity
            .entry(contribution.identity.clone())
            .or_default()
            .push(contribution);
    }

    for (identity, group) in by_identity {
        let state = input
            .existing
            .iter()
            .filter(|job| job.namespace().as_deref() == Some(input.config.operator_namespace.as_str()))
            .find(|job| identity_of(job).as_ref() == Some(&identity))
            .map(schedule_state);

        let Some(decision) = arbitrate(input.config.strategy, &group, state.as_ref(), input.now)
        else {
            continue;
        };
        let governing = decision.governing;
        let winning_policy = governing.origin.policy_name().map(str::to_string);

        let job = DesiredJob {
            name: cron_job_name(&governing.repository, &identity),
            namespace: input.config.operator_namespace.clone(),
            repository: governing.repository.clone(),
            repository_namespace: governing.namespace.clone(),
            custom_ca: governing.custom_ca.clone(),
            contributing_namespaces: group.iter().map(|c| c.namespace.clone()).collect(),
            settings: JobSettings {
                schedule: decision.schedule.clone(),
                ..governing.settings.clone()
            },
            winning_policy: winning_policy.clone(),
            schedule_origin: decision.origin_namespace.clone(),
            conflicts: decision.conflicts.clone(),
            identity: identity.clone(),
        };

        for contributor in group.iter().filter_map(|c| c.origin.policy_name()) {
            if let Some(report) = plan.policies.get_mut(contributor) {
                report.identities.insert(identity.clone());
                if let Some(winner) = winning_policy.as_deref().filter(|w| *w != contributor) {
                    report.conflicting.insert(winner.to_string());
                }
            }
        }
        if let Some(report) = winning_policy
            .as_deref()
            .and_then(|w| plan.policies.get_mut(w))
        {
            report.active_cron_jobs.insert(job.name.clone());
        }

        plan.jobs.insert(identity, job);
    }

    plan
}

fn direct_contribution(policy: &KopiaMaintenance, config: &Config) -> Option<Contribution> {
    let repository = policy.spec.repository.as_ref()?;
    let namespace = if repository.namespace.is_empty() {
        config.operator_namespace.clone()
    } else {
        repository.namespace.clone()
    };
    let custom_ca = repository.custom_ca.clone().filter(|ca| !ca.is_empty());
    Some(Contribution {
        identity: RepositoryIdentity::compute(&repository.repository, custom_ca.as_ref()),
        origin: Origin::Policy {
            name: policy.name_any(),
            priority: policy.spec.priority,
        },
        namespace,
        source: policy.name_any(),
        repository: repository.repository.clone(),
        custom_ca,
        created: policy.metadata.creation_timestamp.as_ref().map(|t| t.0),
        settings: JobSettings::from_policy(policy),
    })
}

fn record_matches(
    reports: &mut BTreeMap<String, PolicyReport>,
    matched: &[&KopiaMaintenance],
    namespace: &str,
    name: &str,
    repository: &str,
) {
    let names: Vec<String> = matched.iter().map(|p| p.name_any()).collect();
    for policy in &names {
        let Some(report) = reports.get_mut(policy) else {
            continue;
        };
        report.matched_sources.push(MatchedSource {
            name: name.to_string(),
            namespace: namespace.to_string(),
            repository: repository.to_string(),
        });
        report
            .conflicting
            .extend(names.iter().filter(|other| *other != policy).cloned());
    }
}
