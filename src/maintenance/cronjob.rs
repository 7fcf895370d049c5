// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Renders a [`DesiredJob`] into a `batch/v1` CronJob and reads our
//! bookkeeping back from live ones.

use crate::config::Config;
use crate::constants::{annotations, defaults, labels, OPERATOR_NAME};
use crate::error::Result;
use crate::maintenance::arbitration::{ScheduleConflict, ScheduleState};
use crate::maintenance::identity::RepositoryIdentity;
use crate::maintenance::plan::DesiredJob;
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvFromSource, EnvVar,
    KeyToPath, PodSecurityContext, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecretEnvSource, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const CONTAINER_NAME: &str = "kopia-maintenance";
const CACHE_VOLUME: &str = "kopia-cache";
const CACHE_MOUNT_PATH: &str = "/cache";
const CACHE_SIZE_LIMIT: &str = "1Gi";
const TMP_VOLUME: &str = "tempdir";
const CA_VOLUME: &str = "custom-ca";
const CA_MOUNT_PATH: &str = "/customCA";
const CA_FILENAME: &str = "ca.crt";
const RUN_AS_USER: i64 = 1000;
const BACKOFF_LIMIT: i32 = 3;

/// Whether an object carries the managed label
pub fn is_managed(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(labels::MANAGED))
        .is_some_and(|v| v == "true")
}

/// Identity recorded on a managed CronJob
pub fn identity_of(job: &CronJob) -> Option<RepositoryIdentity> {
    job.labels()
        .get(labels::REPOSITORY_HASH)
        .and_then(|v| RepositoryIdentity::from_label(v))
}

/// First-wins bookkeeping recorded on a live CronJob
pub fn schedule_state(job: &CronJob) -> ScheduleState {
    let annotations = job.annotations();
    let conflicts = annotations
        .get(annotations::SCHEDULE_CONFLICTS)
        .and_then(|raw| serde_json::from_str::<Vec<ScheduleConflict>>(raw).ok())
        .unwrap_or_default();
    ScheduleState {
        schedule: job
            .spec
            .as_ref()
            .map(|s| s.schedule.clone())
            .unwrap_or_default(),
        origin_namespace: annotations.get(annotations::SCHEDULE_ORIGIN).cloned(),
        conflicts,
    }
}

/// True when the live CronJob was rendered from different inputs or its
/// enforced fields were edited in place
pub fn needs_update(live: &CronJob, desired: &CronJob) -> bool {
    let hash = |job: &CronJob| job.annotations().get(annotations::SPEC_HASH).cloned();
    hash(live) != hash(desired) || enforced_fields(live) != enforced_fields(desired)
}

/// Fields the controller owns on a rendered CronJob
#[derive(Debug, PartialEq)]
struct EnforcedFields<'a> {
    schedule: Option<&'a str>,
    suspend: bool,
    concurrency_policy: Option<&'a str>,
    successful_jobs_history_limit: Option<i32>,
    failed_jobs_history_limit: Option<i32>,
    image: Option<&'a str>,
    resources: Option<&'a ResourceRequirements>,
}

fn enforced_fields(job: &CronJob) -> EnforcedFields<'_> {
    let spec = job.spec.as_ref();
    let container = spec
        .and_then(|s| s.job_template.spec.as_ref())
        .and_then(|j| j.template.spec.as_ref())
        .and_then(|p| p.containers.iter().find(|c| c.name == CONTAINER_NAME));
    EnforcedFields {
        schedule: spec.map(|s| s.schedule.as_str()),
        suspend: spec.and_then(|s| s.suspend).unwrap_or(false),
        concurrency_policy: spec.and_then(|s| s.concurrency_policy.as_deref()),
        successful_jobs_history_limit: spec.and_then(|s| s.successful_jobs_history_limit),
        failed_jobs_history_limit: spec.and_then(|s| s.failed_jobs_history_limit),
        image: container.and_then(|c| c.image.as_deref()),
        resources: container.and_then(|c| c.resources.as_ref()),
    }
}

fn default_resources() -> ResourceRequirements {
    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    ResourceRequirements {
        requests: Some(quantities(defaults::CPU_REQUEST, defaults::MEMORY_REQUEST)),
        limits: Some(quantities(defaults::CPU_LIMIT, defaults::MEMORY_LIMIT)),
        ..Default::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn volumes(job: &DesiredJob) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = vec![
        Volume {
            name: CACHE_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                size_limit: Some(Quantity(CACHE_SIZE_LIMIT.to_string())),
                ..Default::default()
            }),
            ..Default::default()
        },
        // Writable scratch space under a read-only root filesystem
        Volume {
            name: TMP_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    let mut mounts = vec![
        VolumeMount {
            name: CACHE_VOLUME.to_string(),
            mount_path: CACHE_MOUNT_PATH.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: TMP_VOLUME.to_string(),
            mount_path: "/tmp".to_string(),
            ..Default::default()
        },
    ];

    if let (Some(ca), Some(projected)) = (job.custom_ca.as_ref(), job.ca_name()) {
        let key = if ca.key.is_empty() { CA_FILENAME } else { &ca.key };
        let items = Some(vec![KeyToPath {
            key: key.to_string(),
            path: CA_FILENAME.to_string(),
            ..Default::default()
        }]);
        let mut volume = Volume {
            name: CA_VOLUME.to_string(),
            ..Default::default()
        };
        if !ca.secret_name.is_empty() {
            volume.secret = Some(SecretVolumeSource {
                secret_name: Some(projected),
                items,
                ..Default::default()
            });
        } else {
            volume.config_map = Some(ConfigMapVolumeSource {
                name: projected,
                items,
                ..Default::default()
            });
        }
        volumes.push(volume);
        mounts.push(VolumeMount {
            name: CA_VOLUME.to_string(),
            mount_path: CA_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    (volumes, mounts)
}

fn container(job: &DesiredJob, image: &str, mounts: Vec<VolumeMount>) -> Container {
    let mut env_vars = vec![
        env("DIRECTION", "maintenance"),
        env("KOPIA_CACHE_DIR", CACHE_MOUNT_PATH),
        env("DATA_DIR", "/data"),
        env("KOPIA_OVERRIDE_USERNAME", defaults::MAINTENANCE_USERNAME),
        env("KOPIA_OVERRIDE_HOSTNAME", job.repository_namespace.clone()),
    ];
    if job.ca_name().is_some() {
        env_vars.push(env("CUSTOM_CA", format!("{}/{}", CA_MOUNT_PATH, CA_FILENAME)));
    }

    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/bin/bash".to_string(), "-c".to_string()]),
        args: Some(vec!["/entry.sh maintenance".to_string()]),
        env: Some(env_vars),
        env_from: Some(vec![EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: job.credential_name(),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        volume_mounts: Some(mounts),
        resources: Some(
            job.settings
                .resources
                .clone()
                .unwrap_or_else(default_resources),
        ),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            privileged: Some(false),
            read_only_root_filesystem: Some(true),
            run_as_non_root: Some(true),
            run_as_user: Some(RUN_AS_USER),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Render the CronJob for one identity, stamped with a hash of its inputs
pub fn render(job: &DesiredJob, config: &Config, image: &str) -> Result<CronJob> {
    let identity_labels = BTreeMap::from([
        (labels::MANAGED.to_string(), "true".to_string()),
        (labels::REPOSITORY_HASH.to_string(), job.identity.to_string()),
    ]);
    let mut object_labels = identity_labels.clone();
    object_labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        OPERATOR_NAME.to_string(),
    );

    let mut pod_labels = job.settings.pod_labels.clone();
    pod_labels.extend(identity_labels);

    let mut object_annotations = BTreeMap::from([
        (annotations::REPOSITORY_CONFIG.to_string(), job.repository.clone()),
        (
            annotations::CONTRIBUTING_NAMESPACES.to_string(),
            job.contributing_namespaces
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
        ),
        (annotations::CONTAINER_VERSION.to_string(), image.to_string()),
    ]);
    if let Some(policy) = &job.winning_policy {
        object_annotations.insert(annotations::WINNING_POLICY.to_string(), policy.clone());
    }
    if let Some(origin) = &job.schedule_origin {
        object_annotations.insert(annotations::SCHEDULE_ORIGIN.to_string(), origin.clone());
    }
    if !job.conflicts.is_empty() {
        object_annotations.insert(
            annotations::SCHEDULE_CONFLICTS.to_string(),
            serde_json::to_string(&job.conflicts)?,
        );
    }

    let (volumes, mounts) = volumes(job);
    let settings = &job.settings;
    let spec = CronJobSpec {
        schedule: settings.schedule.clone(),
        concurrency_policy: Some("Forbid".to_string()),
        suspend: Some(settings.suspend),
        successful_jobs_history_limit: Some(settings.successful_jobs_history_limit),
        failed_jobs_history_limit: Some(settings.failed_jobs_history_limit),
        job_template: JobTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(object_labels.clone()),
                ..Default::default()
            }),
            spec: Some(JobSpec {
                backoff_limit: Some(BACKOFF_LIMIT),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(
                            settings
                                .service_account_name
                                .clone()
                                .unwrap_or_else(|| config.maintenance_service_account.clone()),
                        ),
                        restart_policy: Some("OnFailure".to_string()),
                        security_context: Some(PodSecurityContext {
                            run_as_non_root: Some(true),
                            run_as_user: Some(RUN_AS_USER),
                            fs_group: Some(RUN_AS_USER),
                            ..Default::default()
                        }),
                        containers: vec![container(job, image, mounts)],
                        volumes: Some(volumes),
                        node_selector: (!settings.node_selector.is_empty())
                            .then(|| settings.node_selector.clone()),
                        tolerations: (!settings.tolerations.is_empty())
                            .then(|| settings.tolerations.clone()),
                        affinity: settings.affinity.clone(),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
        },
        ..Default::default()
    };

    let hash = spec_hash(&spec, &object_labels, &object_annotations)?;
    object_annotations.insert(annotations::SPEC_HASH.to_string(), hash);

    Ok(CronJob {
        metadata: ObjectMeta {
            name: Some(job.name.clone()),
            namespace: Some(job.namespace.clone()),
            labels: Some(object_labels),
            annotations: Some(object_annotations),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}

fn spec_hash(
    spec: &CronJobSpec,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> Result<String> {
    let document = serde_json::to_string(&json!({
        "spec": spec,
        "labels": labels,
        "annotations": annotations,
    }))?;
    let mut hash = hex::encode(Sha256::digest(document.as_bytes()));
    hash.truncate(16);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::arbitration::JobSettings;
    use crate::types::CustomCaSpec;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    fn desired(custom_ca: Option<CustomCaSpec>) -> DesiredJob {
        let identity = RepositoryIdentity::compute("repo", custom_ca.as_ref());
        DesiredJob {
            name: format!("kopia-maint-repo-{}", identity),
            namespace: "volsync-system".to_string(),
            repository: "repo".to_string(),
            repository_namespace: "team-a".to_string(),
            custom_ca,
            contributing_namespaces: BTreeSet::from(["team-b".to_string(), "team-a".to_string()]),
            settings: JobSettings::default(),
            winning_policy: Some("nightly".to_string()),
            schedule_origin: None,
            conflicts: Vec::new(),
            identity,
        }
    }

    fn pod_spec(job: &CronJob) -> &PodSpec {
        job.spec
            .as_ref()
            .unwrap()
            .job_template
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
    }

    fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    #[test]
    fn test_render_labels_and_annotations() {
        let job = desired(None);
        let cron = render(&job, &Config::default(), "image:v1").unwrap();

        assert_eq!(cron.namespace().as_deref(), Some("volsync-system"));
        assert!(is_managed(&cron.metadata));
        assert_eq!(identity_of(&cron), Some(job.identity.clone()));
        let annotations = cron.annotations();
        assert_eq!(annotations[annotations::CONTRIBUTING_NAMESPACES], "team-a,team-b");
        assert_eq!(annotations[annotations::CONTAINER_VERSION], "image:v1");
        assert_eq!(annotations[annotations::WINNING_POLICY], "nightly");
        assert!(annotations.contains_key(annotations::SPEC_HASH));
        assert!(cron.metadata.owner_references.is_none());
    }

    #[test]
    fn test_render_hardening() {
        let cron = render(&desired(None), &Config::default(), "image:v1").unwrap();
        let spec = cron.spec.as_ref().unwrap();
        assert_eq!(spec.concurrency_policy.as_deref(), Some("Forbid"));
        assert_eq!(spec.schedule, "0 2 * * *");
        assert_eq!(
            spec.job_template.spec.as_ref().unwrap().backoff_limit,
            Some(3)
        );

        let pod = pod_spec(&cron);
        assert_eq!(
            pod.service_account_name.as_deref(),
            Some("volsync-kopia-maintenance")
        );
        let container = &pod.containers[0];
        let security = container.security_context.as_ref().unwrap();
        assert_eq!(security.read_only_root_filesystem, Some(true));
        assert_eq!(security.run_as_non_root, Some(true));
        assert_eq!(
            security.capabilities.as_ref().unwrap().drop,
            Some(vec!["ALL".to_string()])
        );
        assert_eq!(env_value(container, "DIRECTION"), Some("maintenance"));
        assert_eq!(
            env_value(container, "KOPIA_OVERRIDE_USERNAME"),
            Some("maintenance@volsync")
        );
        assert_eq!(env_value(container, "KOPIA_OVERRIDE_HOSTNAME"), Some("team-a"));
        assert!(env_value(container, "CUSTOM_CA").is_none());

        let secret_ref = container.env_from.as_ref().unwrap()[0]
            .secret_ref
            .as_ref()
            .unwrap();
        assert!(secret_ref.name.starts_with("kopia-maint-repo-"));

        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["memory"], Quantity("1Gi".to_string()));

        let volumes = pod.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(
            volumes[0].empty_dir.as_ref().unwrap().size_limit,
            Some(Quantity("1Gi".to_string()))
        );
    }

    #[test]
    fn test_render_custom_ca_mount() {
        let ca = CustomCaSpec {
            config_map_name: "corp-ca".to_string(),
            key: "bundle.pem".to_string(),
            ..Default::default()
        };
        let job = desired(Some(ca));
        let cron = render(&job, &Config::default(), "image:v1").unwrap();
        let pod = pod_spec(&cron);

        let ca_volume = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == "custom-ca")
            .unwrap();
        let config_map = ca_volume.config_map.as_ref().unwrap();
        assert_eq!(config_map.name, format!("kopia-maint-ca-{}", job.identity));
        assert_eq!(config_map.items.as_ref().unwrap()[0].key, "bundle.pem");
        assert_eq!(
            env_value(&pod.containers[0], "CUSTOM_CA"),
            Some("/customCA/ca.crt")
        );
    }

    #[test]
    fn test_hash_tracks_inputs() {
        let config = Config::default();
        let job = desired(None);
        let a = render(&job, &config, "image:v1").unwrap();
        let same = render(&job, &config, "image:v1").unwrap();
        assert!(!needs_update(&a, &same));

        let new_image = render(&job, &config, "image:v2").unwrap();
        assert!(needs_update(&a, &new_image));

        let mut rescheduled = job.clone();
        rescheduled.settings.schedule = "0 4 * * *".to_string();
        assert!(needs_update(&a, &render(&rescheduled, &config, "image:v1").unwrap()));

        let mut joined = job.clone();
        joined.contributing_namespaces.insert("team-c".to_string());
        assert!(needs_update(&a, &render(&joined, &config, "image:v1").unwrap()));
    }

    #[test]
    fn test_in_place_edits_are_reverted() {
        let config = Config::default();
        let desired_job = render(&desired(None), &config, "image:v1").unwrap();

        let mut edited = desired_job.clone();
        if let Some(spec) = edited.spec.as_mut() {
            spec.schedule = "*/1 * * * *".to_string();
            spec.suspend = Some(true);
        }
        assert!(needs_update(&edited, &desired_job));

        let mut limits = desired_job.clone();
        if let Some(spec) = limits.spec.as_mut() {
            spec.failed_jobs_history_limit = Some(10);
        }
        assert!(needs_update(&limits, &desired_job));

        let mut resources = desired_job.clone();
        let container = resources
            .spec
            .as_mut()
            .and_then(|s| s.job_template.spec.as_mut())
            .and_then(|j| j.template.spec.as_mut())
            .map(|p| &mut p.containers[0])
            .unwrap();
        container.resources = None;
        assert!(needs_update(&resources, &desired_job));
    }

    #[test]
    fn test_server_populated_fields_are_not_drift() {
        let config = Config::default();
        let desired_job = render(&desired(None), &config, "image:v1").unwrap();

        let mut live = desired_job.clone();
        live.metadata.resource_version = Some("42".to_string());
        live.metadata.uid = Some("uid".to_string());
        if let Some(spec) = live.spec.as_mut() {
            spec.starting_deadline_seconds = None;
            spec.time_zone = None;
        }
        assert!(!needs_update(&live, &desired_job));
    }

    #[test]
    fn test_schedule_state_round_trip() {
        let mut job = desired(None);
        job.schedule_origin = Some("team-a".to_string());
        job.conflicts = vec![ScheduleConflict {
            namespace: "team-b".to_string(),
            source: "app".to_string(),
            rejected_schedule: "0 5 * * *".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
        }];
        let cron = render(&job, &Config::default(), "image:v1").unwrap();

        let state = schedule_state(&cron);
        assert_eq!(state.schedule, "0 2 * * *");
        assert_eq!(state.origin_namespace.as_deref(), Some("team-a"));
        assert_eq!(state.conflicts, job.conflicts);
    }

    #[test]
    fn test_schedule_state_tolerates_garbage_annotation() {
        let mut cron = render(&desired(None), &Config::default(), "image:v1").unwrap();
        cron.annotations_mut()
            .insert(annotations::SCHEDULE_CONFLICTS.to_string(), "{not json".to_string());
        assert!(schedule_state(&cron).conflicts.is_empty());
    }
}
