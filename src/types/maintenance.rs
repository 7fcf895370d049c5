// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! KopiaMaintenance: user-declared maintenance policy for Kopia repositories.

use crate::constants::defaults;
use crate::error::{MaintenanceError, Result};
use crate::maintenance::schedule;
use crate::types::replication_source::CustomCaSpec;
use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[kube(group = "volsync.backube", version = "v1alpha1", kind = "KopiaMaintenance")]
#[kube(status = "KopiaMaintenanceStatus")]
#[kube(printcolumn = r#"{"name":"Enabled","type":"boolean","jsonPath":".spec.enabled"}"#)]
#[kube(printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#)]
#[kube(printcolumn = r#"{"name":"Priority","type":"integer","jsonPath":".spec.priority"}"#)]
#[kube(
    printcolumn = r#"{"name":"Last Maintenance","type":"string","format":"date-time","jsonPath":".status.lastMaintenanceTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KopiaMaintenanceSpec {
    /// Matches existing ReplicationSources by their repository configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_selector: Option<KopiaRepositorySelector>,
    /// Maintains one repository directly, independent of any ReplicationSource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<KopiaRepositorySpec>,
    /// Cron expression or @alias; defaults to daily at 02:00
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Higher wins when several policies match the same source
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_jobs_history_limit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_jobs_history_limit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mover_pod_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KopiaRepositorySpec {
    /// Secret holding the repository connection details
    #[serde(default)]
    pub repository: String,
    /// Namespace of the secret; the operator namespace when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, rename = "customCA", skip_serializing_if = "Option::is_none")]
    pub custom_ca: Option<CustomCaSpec>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository_type: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KopiaRepositorySelector {
    /// Repository secret name, `*` and `?` wildcards allowed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<NamespaceSelector>,
    #[serde(default, rename = "customCA", skip_serializing_if = "Option::is_none")]
    pub custom_ca: Option<CustomCaSelector>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository_type: String,
    /// Labels the ReplicationSource must carry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_names: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_names: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomCaSelector {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_map_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KopiaMaintenanceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched_sources: Vec<MatchedSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_cron_jobs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_maintenance_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_scheduled_maintenance: Option<Time>,
    /// Consecutive failed maintenance runs since the last success
    #[serde(default)]
    pub maintenance_failures: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Other policies matching the same sources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicting_maintenances: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchedSource {
    pub name: String,
    pub namespace: String,
    pub repository: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl KopiaMaintenance {
    pub fn is_enabled(&self) -> bool {
        self.spec.enabled.unwrap_or(true)
    }

    pub fn schedule(&self) -> &str {
        if self.spec.schedule.is_empty() {
            defaults::SCHEDULE
        } else {
            &self.spec.schedule
        }
    }

    pub fn is_direct_repository_mode(&self) -> bool {
        self.spec.repository.is_some()
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }

    /// Check the structural rules and the schedule
    pub fn validate(&self) -> Result<()> {
        let has_selector = self.spec.repository_selector.is_some();
        let has_repository = self.spec.repository.is_some();

        if !has_selector && !has_repository {
            return Err(MaintenanceError::Validation(
                "either repositorySelector or repository must be specified".to_string(),
            ));
        }
        if has_selector && has_repository {
            return Err(MaintenanceError::Validation(
                "repositorySelector and repository are mutually exclusive - specify only one"
                    .to_string(),
            ));
        }
        if let Some(repository) = &self.spec.repository {
            if repository.repository.is_empty() {
                return Err(MaintenanceError::Validation(
                    "repository.repository field is required when using direct repository mode"
                        .to_string(),
                ));
            }
        }
        if !(defaults::PRIORITY_MIN..=defaults::PRIORITY_MAX).contains(&self.spec.priority) {
            return Err(MaintenanceError::Validation(format!(
                "priority {} is outside [{}, {}]",
                self.spec.priority,
                defaults::PRIORITY_MIN,
                defaults::PRIORITY_MAX
            )));
        }
        for (field, limit) in [
            ("successfulJobsHistoryLimit", self.spec.successful_jobs_history_limit),
            ("failedJobsHistoryLimit", self.spec.failed_jobs_history_limit),
        ] {
            if limit.is_some_and(|l| l < 0) {
                return Err(MaintenanceError::Validation(format!(
                    "{} must not be negative",
                    field
                )));
            }
        }

        schedule::validate(self.schedule())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn make_maintenance(spec: KopiaMaintenanceSpec) -> KopiaMaintenance {
        KopiaMaintenance {
            metadata: ObjectMeta {
                name: Some("test".to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    fn direct(repository: &str) -> Option<KopiaRepositorySpec> {
        Some(KopiaRepositorySpec {
            repository: repository.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_validate_rejects_both_modes() {
        let km = make_maintenance(KopiaMaintenanceSpec {
            repository: direct("repo"),
            repository_selector: Some(KopiaRepositorySelector::default()),
            ..Default::default()
        });
        let err = km.validate().unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
        assert_eq!(err.reason(), "ValidationFailed");
    }

    #[test]
    fn test_validate_rejects_neither_mode() {
        let km = make_maintenance(KopiaMaintenanceSpec::default());
        let err = km.validate().unwrap_err();
        assert!(err
            .to_string()
            .contains("either repositorySelector or repository must be specified"));
    }

    #[test]
    fn test_validate_rejects_empty_direct_repository() {
        let km = make_maintenance(KopiaMaintenanceSpec {
            repository: direct(""),
            ..Default::default()
        });
        let err = km.validate().unwrap_err();
        assert!(err.to_string().contains("repository.repository field is required"));
    }

    #[test]
    fn test_validate_accepts_single_mode() {
        let direct_mode = make_maintenance(KopiaMaintenanceSpec {
            repository: direct("repo"),
            ..Default::default()
        });
        assert!(direct_mode.validate().is_ok());

        let selector_mode = make_maintenance(KopiaMaintenanceSpec {
            repository_selector: Some(KopiaRepositorySelector {
                repository: "kopia-*".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(selector_mode.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_schedule() {
        let km = make_maintenance(KopiaMaintenanceSpec {
            repository: direct("repo"),
            schedule: "every night".to_string(),
            ..Default::default()
        });
        let err = km.validate().unwrap_err();
        assert_eq!(err.reason(), "InvalidSchedule");
        assert!(err.to_string().contains("invalid schedule"));
    }

    #[test]
    fn test_validate_rejects_out_of_range_priority() {
        let km = make_maintenance(KopiaMaintenanceSpec {
            repository: direct("repo"),
            priority: 101,
            ..Default::default()
        });
        assert!(km.validate().unwrap_err().to_string().contains("priority"));
    }

    #[test]
    fn test_defaults() {
        let km = make_maintenance(KopiaMaintenanceSpec::default());
        assert!(km.is_enabled());
        assert_eq!(km.schedule(), "0 2 * * *");
        assert!(!km.is_direct_repository_mode());
    }

    #[test]
    fn test_direct_mode_detection() {
        let km = make_maintenance(KopiaMaintenanceSpec {
            repository: Some(KopiaRepositorySpec {
                repository: "repo".to_string(),
                namespace: "backups".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(km.is_direct_repository_mode());
        assert!(km.validate().is_ok());
    }

    #[test]
    fn test_finalizer_detection() {
        let mut km = make_maintenance(KopiaMaintenanceSpec::default());
        assert!(!km.has_finalizer("x/y"));
        km.metadata.finalizers = Some(vec!["x/y".to_string()]);
        assert!(km.has_finalizer("x/y"));
    }
}
