// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! KopiaMaintenance status derived from a pass.

use crate::kubernetes::events::reasons;
use crate::maintenance::plan::PolicyReport;
use crate::types::maintenance::{Condition, KopiaMaintenanceStatus};
use crate::types::KopiaMaintenance;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

pub const READY: &str = "Ready";
pub const PROGRESSING: &str = "Progressing";

/// Pass outcomes for the CronJobs one policy governs
#[derive(Debug, Clone, Default)]
pub struct PolicyFacts {
    pub last_maintenance: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    pub next_run: Option<DateTime<Utc>>,
    /// Why credentials could not be projected for a governed repository
    pub credential_error: Option<String>,
    /// Why a governed CronJob could not be converged
    pub apply_error: Option<String>,
    /// A governed CronJob was created this pass
    pub created: bool,
}

fn condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: String,
    generation: Option<i64>,
) -> Condition {
    Condition {
        condition_type: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: None,
        observed_generation: generation,
    }
}

fn ready_condition(report: &PolicyReport, facts: &PolicyFacts) -> Condition {
    let generation = report.generation;
    if let Some(failure) = &report.failure {
        return condition(READY, false, failure.reason, failure.message.clone(), generation);
    }
    if !report.enabled {
        return condition(
            READY,
            false,
            reasons::MAINTENANCE_DISABLED,
            "Maintenance is disabled for this policy".to_string(),
            generation,
        );
    }
    if let Some(message) = &facts.credential_error {
        return condition(READY, false, reasons::CREDENTIAL_UNAVAILABLE, message.clone(), generation);
    }
    if let Some(message) = &facts.apply_error {
        return condition(READY, false, reasons::RECONCILE_FAILED, message.clone(), generation);
    }
    if report.identities.is_empty() {
        return condition(
            READY,
            true,
            reasons::NO_MATCHING_SOURCES,
            "No repositories match this policy".to_string(),
            generation,
        );
    }
    let message = match report.active_cron_jobs.len() {
        0 => "Every matched repository is maintained under another policy".to_string(),
        1 => "Maintaining 1 repository".to_string(),
        n => format!("Maintaining {} repositories", n),
    };
    condition(READY, true, reasons::MAINTENANCE_ACTIVE, message, generation)
}

fn progressing_condition(
    policy: &KopiaMaintenance,
    report: &PolicyReport,
    facts: &PolicyFacts,
) -> Condition {
    let observed = policy.status.as_ref().and_then(|s| s.observed_generation);
    if report.generation.is_some() && observed != report.generation {
        return condition(
            PROGRESSING,
            true,
            reasons::NEW_GENERATION_OBSERVED,
            "Applying a new specification".to_string(),
            report.generation,
        );
    }
    if facts.created {
        return condition(
            PROGRESSING,
            true,
            reasons::CREATING_CRON_JOB,
            "Creating maintenance CronJobs".to_string(),
            report.generation,
        );
    }
    condition(
        PROGRESSING,
        false,
        reasons::RECONCILE_COMPLETE,
        String::new(),
        report.generation,
    )
}

/// Keep the previous transition time of conditions whose status did not flip
fn carry_transitions(conditions: &mut [Condition], previous: &[Condition], now: DateTime<Utc>) {
    for c in conditions.iter_mut() {
        let before = previous
            .iter()
            .find(|p| p.condition_type == c.condition_type && p.status == c.status);
        c.last_transition_time = before
            .and_then(|p| p.last_transition_time.clone())
            .or(Some(Time(now)));
    }
}

/// Status for `policy` without `lastReconcileTime`
pub fn build_status(
    policy: &KopiaMaintenance,
    report: &PolicyReport,
    facts: &PolicyFacts,
    now: DateTime<Utc>,
) -> KopiaMaintenanceStatus {
    let previous = policy.status.clone().unwrap_or_default();

    let mut matched_sources = report.matched_sources.clone();
    matched_sources.sort();
    matched_sources.dedup();

    let mut conditions = vec![
        ready_condition(report, facts),
        progressing_condition(policy, report, facts),
    ];
    carry_transitions(&mut conditions, &previous.conditions, now);

    let active = report.failure.is_none() && report.enabled;
    KopiaMaintenanceStatus {
        observed_generation: report.generation,
        enabled: report.enabled,
        effective_schedule: report.effective_schedule.clone(),
        matched_sources,
        active_cron_jobs: report.active_cron_jobs.iter().cloned().collect(),
        last_reconcile_time: None,
        last_maintenance_time: facts
            .last_maintenance
            .map(Time)
            .or(previous.last_maintenance_time),
        next_scheduled_maintenance: facts.next_run.filter(|_| active).map(Time),
        maintenance_failures: facts.consecutive_failures,
        conditions,
        conflicting_maintenances: report.conflicting.iter().cloned().collect(),
    }
}

/// The status to patch, or `None` when the live status is current and recent
pub fn status_update(
    policy: &KopiaMaintenance,
    mut status: KopiaMaintenanceStatus,
    now: DateTime<Utc>,
    resync: Duration,
) -> Option<KopiaMaintenanceStatus> {
    let live = policy.status.as_ref();
    let last = live.and_then(|s| s.last_reconcile_time.as_ref()).map(|t| t.0);
    status.last_reconcile_time = last.map(Time);

    let unchanged = live == Some(&status);
    let recent = last.is_some_and(|t| now - t < resync);
    if unchanged && recent {
        return None;
    }
    status.last_reconcile_time = Some(Time(now));
    Some(status)
}
