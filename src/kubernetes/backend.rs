// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The API surface the convergence pass runs against.

use crate::constants::{labels, FINALIZER, OPERATOR_NAME};
use crate::error::{is_not_found, Result};
use crate::kubernetes::namespaces::list_namespace_labels;
use crate::maintenance::identity::RepositoryIdentity;
use crate::types::{KopiaMaintenance, KopiaMaintenanceStatus, ReplicationSource};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Api, Client, ResourceExt,
};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// Kind of a credential copied into the execution namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectedKind {
    Secret,
    ConfigMap,
}

/// A projected credential as found in the execution namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedObject {
    pub kind: ProjectedKind,
    pub name: String,
    pub identity: Option<RepositoryIdentity>,
}

/// Everything the controller reads from and writes to the cluster
#[async_trait]
pub trait MaintenanceBackend: Send + Sync {
    async fn list_policies(&self) -> Result<Vec<KopiaMaintenance>>;

    async fn list_sources(&self) -> Result<Vec<ReplicationSource>>;

    /// Labels of every namespace, keyed by namespace name
    async fn namespace_labels(&self) -> Result<BTreeMap<String, BTreeMap<String, String>>>;

    /// Managed CronJobs in every namespace, including ones from older releases
    async fn list_cron_jobs(&self) -> Result<Vec<CronJob>>;

    async fn create_cron_job(&self, job: &CronJob) -> Result<()>;

    /// Replace guarded by the resourceVersion carried in `job`
    async fn replace_cron_job(&self, job: &CronJob) -> Result<()>;

    /// Deleting a missing CronJob succeeds
    async fn delete_cron_job(&self, namespace: &str, name: &str) -> Result<()>;

    /// Jobs spawned for one identity in one namespace
    async fn list_jobs(&self, namespace: &str, identity: &RepositoryIdentity) -> Result<Vec<Job>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Idempotent server-side apply
    async fn apply_secret(&self, secret: &Secret) -> Result<()>;

    /// Idempotent server-side apply
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    async fn list_projected(&self, namespace: &str) -> Result<Vec<ProjectedObject>>;

    /// Deleting a missing object succeeds
    async fn delete_projected(&self, namespace: &str, object: &ProjectedObject) -> Result<()>;

    async fn patch_policy_status(&self, name: &str, status: &KopiaMaintenanceStatus)
        -> Result<()>;

    async fn add_finalizer(&self, name: &str) -> Result<()>;

    async fn remove_finalizer(&self, name: &str) -> Result<()>;
}

/// [`MaintenanceBackend`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn managed_selector() -> ListParams {
    ListParams::default().labels(&format!("{}=true", labels::MANAGED))
}

fn ignore_not_found(result: std::result::Result<(), kube::Error>) -> Result<()> {
    match result {
        Err(e) if is_not_found(&e) => Ok(()),
        other => Ok(other?),
    }
}

fn projected(
    kind: ProjectedKind,
    name: String,
    object_labels: &BTreeMap<String, String>,
) -> ProjectedObject {
    ProjectedObject {
        kind,
        name,
        identity: object_labels
            .get(labels::REPOSITORY_HASH)
            .and_then(|v| RepositoryIdentity::from_label(v)),
    }
}

#[async_trait]
impl MaintenanceBackend for KubeBackend {
    async fn list_policies(&self) -> Result<Vec<KopiaMaintenance>> {
        let api: Api<KopiaMaintenance> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_sources(&self) -> Result<Vec<ReplicationSource>> {
        let api: Api<ReplicationSource> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn namespace_labels(&self) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        list_namespace_labels(&self.client).await
    }

    async fn list_cron_jobs(&self) -> Result<Vec<CronJob>> {
        let api: Api<CronJob> = Api::all(self.client.clone());
        Ok(api.list(&managed_selector()).await?.items)
    }

    #[instrument(skip(self, job), fields(cronjob = %job.name_any()))]
    async fn create_cron_job(&self, job: &CronJob) -> Result<()> {
        let namespace = job.namespace().unwrap_or_default();
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), job).await?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(cronjob = %job.name_any()))]
    async fn replace_cron_job(&self, job: &CronJob) -> Result<()> {
        let namespace = job.namespace().unwrap_or_default();
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&job.name_any(), &PostParams::default(), job)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_cron_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), namespace);
        // Background propagation removes the Jobs the CronJob spawned
        let result = api
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ());
        ignore_not_found(result)
    }

    async fn list_jobs(&self, namespace: &str, identity: &RepositoryIdentity) -> Result<Vec<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!(
            "{}=true,{}={}",
            labels::MANAGED,
            labels::REPOSITORY_HASH,
            identity
        ));
        Ok(api.list(&params).await?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    #[instrument(skip(self, secret), fields(secret = %secret.name_any()))]
    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret.namespace().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let pp = PatchParams::apply(OPERATOR_NAME).force();
        api.patch(&secret.name_any(), &pp, &Patch::Apply(secret))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, config_map), fields(configmap = %config_map.name_any()))]
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let namespace = config_map.namespace().unwrap_or_default();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        let pp = PatchParams::apply(OPERATOR_NAME).force();
        api.patch(&config_map.name_any(), &pp, &Patch::Apply(config_map))
            .await?;
        Ok(())
    }

    async fn list_projected(&self, namespace: &str) -> Result<Vec<ProjectedObject>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);

        let mut objects: Vec<ProjectedObject> = secrets
            .list(&managed_selector())
            .await?
            .items
            .into_iter()
            .map(|s| projected(ProjectedKind::Secret, s.name_any(), s.labels()))
            .collect();
        objects.extend(
            config_maps
                .list(&managed_selector())
                .await?
                .items
                .into_iter()
                .map(|c| projected(ProjectedKind::ConfigMap, c.name_any(), c.labels())),
        );
        Ok(objects)
    }

    #[instrument(skip(self, object), fields(name = %object.name))]
    async fn delete_projected(&self, namespace: &str, object: &ProjectedObject) -> Result<()> {
        let dp = DeleteParams::default();
        let result = match object.kind {
            ProjectedKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                api.delete(&object.name, &dp).await.map(|_| ())
            }
            ProjectedKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                api.delete(&object.name, &dp).await.map(|_| ())
            }
        };
        ignore_not_found(result)
    }

    #[instrument(skip(self, status))]
    async fn patch_policy_status(
        &self,
        name: &str,
        status: &KopiaMaintenanceStatus,
    ) -> Result<()> {
        let api: Api<KopiaMaintenance> = Api::all(self.client.clone());
        let patch = status_patch(status)?;
        api.patch_status(name, &PatchParams::apply(OPERATOR_NAME), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn add_finalizer(&self, name: &str) -> Result<()> {
        let api: Api<KopiaMaintenance> = Api::all(self.client.clone());
        let policy = api.get(name).await?;
        let mut finalizers = policy.finalizers().to_vec();
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        finalizers.push(FINALIZER.to_string());

        // resourceVersion turns a concurrent finalizer edit into a conflict
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": policy.resource_version(),
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("Added finalizer to KopiaMaintenance {}", name);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_finalizer(&self, name: &str) -> Result<()> {
        let api: Api<KopiaMaintenance> = Api::all(self.client.clone());
        let policy = match api.get_opt(name).await? {
            Some(p) => p,
            None => return Ok(()),
        };
        let finalizers: Vec<String> = policy
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": policy.resource_version(),
            }
        });
        let result = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ());
        ignore_not_found(result)?;
        debug!("Removed finalizer from KopiaMaintenance {}", name);
        Ok(())
    }
}

/// Status fields that serialize to nothing when empty
const CLEARABLE_STATUS_FIELDS: &[&str] = &[
    "observedGeneration",
    "effectiveSchedule",
    "matchedSources",
    "activeCronJobs",
    "lastReconcileTime",
    "lastMaintenanceTime",
    "nextScheduledMaintenance",
    "conditions",
    "conflictingMaintenances",
];

/// Merge patch body for a status write. Empty fields are sent as `null` so
/// the API server drops the previous value instead of keeping it.
pub fn status_patch(status: &KopiaMaintenanceStatus) -> Result<serde_json::Value> {
    let mut body = serde_json::to_value(status)?;
    if let Some(fields) = body.as_object_mut() {
        for field in CLEARABLE_STATUS_FIELDS {
            fields
                .entry(field.to_string())
                .or_insert(serde_json::Value::Null);
        }
    }
    Ok(serde_json::json!({ "status": body }))
}
