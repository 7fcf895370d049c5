// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Credential projection into the execution namespace.
//!
//! The maintenance CronJob runs in the operator namespace, but repository
//! secrets and CA bundles live next to the sources that declared them. Each
//! pass copies them over under identity-derived names.

use crate::constants::labels;
use crate::error::{MaintenanceError, Result};
use crate::kubernetes::{MaintenanceBackend, ProjectedKind, ProjectedObject};
use crate::maintenance::identity::RepositoryIdentity;
use crate::maintenance::plan::{DesiredJob, Plan};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

const ROLE_REPOSITORY: &str = "repository";
const ROLE_CA: &str = "ca";

fn projected_labels(identity: &RepositoryIdentity, role: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::MANAGED.to_string(), "true".to_string()),
        (labels::REPOSITORY_HASH.to_string(), identity.to_string()),
        (labels::PROJECTION_ROLE.to_string(), role.to_string()),
    ])
}

/// Copy of `source` under a new name, carrying only data and type
pub fn projected_secret(
    source: &Secret,
    name: &str,
    namespace: &str,
    identity: &RepositoryIdentity,
    role: &str,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(projected_labels(identity, role)),
            ..Default::default()
        },
        data: source.data.clone(),
        string_data: source.string_data.clone(),
        type_: source.type_.clone(),
        immutable: None,
    }
}

pub fn projected_config_map(
    source: &ConfigMap,
    name: &str,
    namespace: &str,
    identity: &RepositoryIdentity,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(projected_labels(identity, ROLE_CA)),
            ..Default::default()
        },
        data: source.data.clone(),
        binary_data: source.binary_data.clone(),
        immutable: None,
    }
}

/// Project the repository secret and custom CA of one job; returns the
/// projected secret name
#[instrument(skip(backend, job), fields(identity = %job.identity, repository = %job.repository))]
pub async fn project_credentials(
    backend: &dyn MaintenanceBackend,
    job: &DesiredJob,
) -> Result<String> {
    let source_namespace = &job.repository_namespace;
    let target = job.credential_name();

    let secret = backend
        .get_secret(source_namespace, &job.repository)
        .await?
        .ok_or_else(|| {
            MaintenanceError::CredentialUnavailable(format!(
                "secret {}/{} not found",
                source_namespace, job.repository
            ))
        })?;
    backend
        .apply_secret(&projected_secret(
            &secret,
            &target,
            &job.namespace,
            &job.identity,
            ROLE_REPOSITORY,
        ))
        .await?;
    debug!(
        "Projected secret {}/{} to {}/{}",
        source_namespace, job.repository, job.namespace, target
    );

    if let (Some(ca), Some(ca_target)) = (job.custom_ca.as_ref(), job.ca_name()) {
        if !ca.secret_name.is_empty() {
            let source = backend
                .get_secret(source_namespace, &ca.secret_name)
                .await?
                .ok_or_else(|| {
                    MaintenanceError::CredentialUnavailable(format!(
                        "CA secret {}/{} not found",
                        source_namespace, ca.secret_name
                    ))
                })?;
            backend
                .apply_secret(&projected_secret(
                    &source,
                    &ca_target,
                    &job.namespace,
                    &job.identity,
                    ROLE_CA,
                ))
                .await?;
        } else {
            let source = backend
                .get_config_map(source_namespace, &ca.config_map_name)
                .await?
                .ok_or_else(|| {
                    MaintenanceError::CredentialUnavailable(format!(
                        "CA configmap {}/{} not found",
                        source_namespace, ca.config_map_name
                    ))
                })?;
            backend
                .apply_config_map(&projected_config_map(
                    &source,
                    &ca_target,
                    &job.namespace,
                    &job.identity,
                ))
                .await?;
        }
        debug!("Projected custom CA to {}/{}", job.namespace, ca_target);
    }

    Ok(target)
}

/// Projected objects no desired job refers to
pub fn orphan_credentials<'a>(
    projected: &'a [ProjectedObject],
    plan: &Plan,
) -> Vec<&'a ProjectedObject> {
    projected
        .iter()
        .filter(|object| {
            let job = object.identity.as_ref().and_then(|id| plan.jobs.get(id));
            match job {
                None => true,
                Some(job) => match object.kind {
                    ProjectedKind::Secret => {
                        object.name != job.credential_name()
                            && job.ca_name().as_deref() != Some(object.name.as_str())
                    }
                    ProjectedKind::ConfigMap => {
                        job.ca_name().as_deref() != Some(object.name.as_str())
                    }
                },
            }
        })
        .collect()
}

/// Delete projected credentials whose identity lost its CronJob
pub async fn collect_orphan_credentials(
    backend: &dyn MaintenanceBackend,
    namespace: &str,
    plan: &Plan,
) -> Result<usize> {
    let projected = backend.list_projected(namespace).await?;
    let orphans = orphan_credentials(&projected, plan);
    for object in &orphans {
        info!("Deleting orphaned projected credential {}/{}", namespace, object.name);
        backend.delete_projected(namespace, object).await?;
    }
    Ok(orphans.len())
}
