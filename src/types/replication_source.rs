// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The subset of VolSync's ReplicationSource read by the maintenance controller.

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[kube(group = "volsync.backube", version = "v1alpha1", kind = "ReplicationSource")]
#[kube(namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kopia: Option<ReplicationSourceKopiaSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceKopiaSpec {
    /// Name of the secret holding the repository connection details
    #[serde(default)]
    pub repository: String,
    #[serde(default, rename = "customCA", skip_serializing_if = "Option::is_none")]
    pub custom_ca: Option<CustomCaSpec>,
    /// Deprecated embedded maintenance settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_cron_job: Option<MaintenanceCronJobSpec>,
    /// Deprecated interval form; 0 disables maintenance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_interval_days: Option<i32>,
}

/// Custom CA used to reach the repository endpoint
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomCaSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_map_name: String,
    /// Key inside the secret or configmap holding the CA bundle
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
}

impl CustomCaSpec {
    /// A CA with neither a secret nor a configmap is no CA at all
    pub fn is_empty(&self) -> bool {
        self.secret_name.is_empty() && self.config_map_name.is_empty()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceCronJobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_jobs_history_limit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_jobs_history_limit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

impl ReplicationSource {
    /// Kopia settings, when this source uses a non-empty Kopia repository
    pub fn kopia(&self) -> Option<&ReplicationSourceKopiaSpec> {
        self.spec.kopia.as_ref().filter(|k| !k.repository.is_empty())
    }

    /// Whether the deprecated embedded maintenance fields are present
    pub fn has_legacy_maintenance(&self) -> bool {
        self.kopia().is_some_and(|k| {
            k.maintenance_cron_job.is_some() || k.maintenance_interval_days.is_some()
        })
    }

    /// Whether the embedded settings leave maintenance switched on
    pub fn legacy_maintenance_enabled(&self) -> bool {
        let Some(kopia) = self.kopia() else {
            return false;
        };
        if let Some(cron) = &kopia.maintenance_cron_job {
            return cron.enabled.unwrap_or(true);
        }
        kopia.maintenance_interval_days != Some(0)
    }

    /// Schedule derived from the embedded settings
    pub fn legacy_schedule(&self) -> Option<String> {
        let kopia = self.kopia()?;
        if let Some(cron) = &kopia.maintenance_cron_job {
            if !cron.schedule.is_empty() {
                return Some(cron.schedule.clone());
            }
        }
        match kopia.maintenance_interval_days {
            Some(7) => Some("0 2 * * 0".to_string()),
            Some(30) | Some(31) => Some("0 2 1 * *".to_string()),
            _ => None,
        }
    }
}
