// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Test utilities: an HTTP mock for `kube::Client` and an in-memory backend.

use crate::constants::{labels, FINALIZER};
use crate::error::{MaintenanceError, Result};
use crate::kubernetes::backend::status_patch;
use crate::kubernetes::{MaintenanceBackend, ProjectedKind, ProjectedObject};
use crate::maintenance::identity::RepositoryIdentity;
use crate::types::{KopiaMaintenance, KopiaMaintenanceStatus, ReplicationSource};
use async_trait::async_trait;
use http::{Request, Response};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::client::Body;
use kube::{Client, ResourceExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// A mock HTTP service that returns predefined responses based on request paths.
#[derive(Clone)]
pub struct MockService {
    responses: Arc<Mutex<HashMap<(String, String), (u16, String)>>>,
}

impl MockService {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn on(self, method: &str, path: &str, status: u16, body: &str) -> Self {
        self.responses.lock().unwrap().insert(
            (method.to_string(), path.to_string()),
            (status, body.to_string()),
        );
        self
    }

    /// Add a response for GET requests matching the exact path
    pub fn on_get(self, path: &str, status: u16, body: &str) -> Self {
        self.on("GET", path, status, body)
    }

    pub fn on_put(self, path: &str, status: u16, body: &str) -> Self {
        self.on("PUT", path, status, body)
    }

    pub fn on_delete(self, path: &str, status: u16, body: &str) -> Self {
        self.on("DELETE", path, status, body)
    }

    /// Build a kube Client from this mock service
    pub fn into_client(self) -> Client {
        Client::new(self, "https://kubernetes.default.svc")
    }

    fn find_response(&self, method: &str, path: &str) -> Option<(u16, String)> {
        let responses = self.responses.lock().unwrap();

        if let Some(resp) = responses.get(&(method.to_string(), path.to_string())) {
            return Some(resp.clone());
        }

        // Prefix match for paths like /api/v1/namespaces/foo
        for ((m, p), resp) in responses.iter() {
            if m == method && path.starts_with(p) {
                return Some(resp.clone());
            }
        }

        None
    }
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<Request<Body>> for MockService {
    type Response = Response<Body>;
    type Error = tower::BoxError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        let response = self.find_response(&method, &path);

        Box::pin(async move {
            let (status, body) =
                response.unwrap_or_else(|| (404, not_found_json("resource", &path)));
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(body.into_bytes()))
                .unwrap())
        })
    }
}

/// A NamespaceList response with the given names and labels
pub fn namespace_list_json(namespaces: &[(&str, &[(&str, &str)])]) -> String {
    let items: Vec<serde_json::Value> = namespaces
        .iter()
        .map(|(name, ns_labels)| {
            let ns_labels: BTreeMap<&str, &str> = ns_labels.iter().copied().collect();
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": {
                    "name": name,
                    "labels": ns_labels,
                }
            })
        })
        .collect();
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "NamespaceList",
        "metadata": {"resourceVersion": "1"},
        "items": items,
    })
    .to_string()
}

/// Create a 404 not found response
pub fn not_found_json(resource: &str, name: &str) -> String {
    serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": format!("{} \"{}\" not found", resource, name),
        "reason": "NotFound",
        "code": 404
    })
    .to_string()
}

fn api_error(code: u16, reason: &str, message: String) -> MaintenanceError {
    MaintenanceError::KubeError(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn policy_not_found(name: &str) -> MaintenanceError {
    api_error(
        404,
        "NotFound",
        format!("kopiamaintenances \"{}\" not found", name),
    )
}

type Key = (String, String);

fn key_of<K: ResourceExt>(object: &K) -> Key {
    (object.namespace().unwrap_or_default(), object.name_any())
}

#[derive(Default)]
struct FakeState {
    revision: u64,
    policies: BTreeMap<String, KopiaMaintenance>,
    sources: BTreeMap<Key, ReplicationSource>,
    namespaces: BTreeMap<String, BTreeMap<String, String>>,
    cron_jobs: BTreeMap<Key, CronJob>,
    jobs: Vec<Job>,
    secrets: BTreeMap<Key, Secret>,
    config_maps: BTreeMap<Key, ConfigMap>,
    /// Fail every listing with a 500
    unavailable: bool,
}

impl FakeState {
    fn next_revision(&mut self) -> Option<String> {
        self.revision += 1;
        Some(self.revision.to_string())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(api_error(500, "InternalError", "apiserver unavailable".to_string()));
        }
        Ok(())
    }
}

/// RFC 7396 JSON merge patch: `null` removes a key, objects merge recursively
pub fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let Some(patch) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(Default::default());
    }
    if let Some(fields) = target.as_object_mut() {
        for (key, value) in patch {
            if value.is_null() {
                fields.remove(key);
            } else {
                merge_patch(
                    fields.entry(key.clone()).or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
    }
}

/// In-memory [`MaintenanceBackend`] with API-server-like semantics for
/// resourceVersions, 404s and finalizers
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    pub fn insert_policy(&self, mut policy: KopiaMaintenance) {
        let mut state = self.state.lock().unwrap();
        policy.metadata.resource_version = state.next_revision();
        state.policies.insert(policy.name_any(), policy);
    }

    pub fn policy(&self, name: &str) -> Option<KopiaMaintenance> {
        self.state.lock().unwrap().policies.get(name).cloned()
    }

    /// Mark a policy deleted the way the API server does while finalizers remain
    pub fn begin_policy_deletion(&self, name: &str, at: chrono::DateTime<chrono::Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(policy) = state.policies.get_mut(name) {
            policy.metadata.deletion_timestamp =
                Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(at));
        }
    }

    pub fn insert_source(&self, source: ReplicationSource) {
        self.state
            .lock()
            .unwrap()
            .sources
            .insert(key_of(&source), source);
    }

    pub fn remove_source(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .sources
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn insert_namespace(&self, name: &str, ns_labels: &[(&str, &str)]) {
        self.state.lock().unwrap().namespaces.insert(
            name.to_string(),
            ns_labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    pub fn insert_cron_job(&self, mut job: CronJob) {
        let mut state = self.state.lock().unwrap();
        job.metadata.resource_version = state.next_revision();
        state.cron_jobs.insert(key_of(&job), job);
    }

    pub fn cron_jobs(&self) -> Vec<CronJob> {
        self.state.lock().unwrap().cron_jobs.values().cloned().collect()
    }

    pub fn insert_job(&self, job: Job) {
        self.state.lock().unwrap().jobs.push(job);
    }

    pub fn insert_secret(&self, secret: Secret) {
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert(key_of(&secret), secret);
    }

    pub fn remove_secret(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .secrets
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Names of the secrets in one namespace
    pub fn secret_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn insert_config_map(&self, config_map: ConfigMap) {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert(key_of(&config_map), config_map);
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

fn projected_from(
    kind: ProjectedKind,
    name: &str,
    object_labels: &BTreeMap<String, String>,
) -> Option<ProjectedObject> {
    if object_labels.get(labels::MANAGED).map(String::as_str) != Some("true") {
        return None;
    }
    Some(ProjectedObject {
        kind,
        name: name.to_string(),
        identity: object_labels
            .get(labels::REPOSITORY_HASH)
            .and_then(|v| RepositoryIdentity::from_label(v)),
    })
}

#[async_trait]
impl MaintenanceBackend for FakeBackend {
    async fn list_policies(&self) -> Result<Vec<KopiaMaintenance>> {
        let state = self.state.lock().unwrap();
        state.check_available()?;
        Ok(state.policies.values().cloned().collect())
    }

    async fn list_sources(&self) -> Result<Vec<ReplicationSource>> {
        let state = self.state.lock().unwrap();
        state.check_available()?;
        Ok(state.sources.values().cloned().collect())
    }

    async fn namespace_labels(&self) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        let state = self.state.lock().unwrap();
        state.check_available()?;
        Ok(state.namespaces.clone())
    }

    async fn list_cron_jobs(&self) -> Result<Vec<CronJob>> {
        let state = self.state.lock().unwrap();
        state.check_available()?;
        Ok(state
            .cron_jobs
            .values()
            .filter(|job| job.labels().get(labels::MANAGED).map(String::as_str) == Some("true"))
            .cloned()
            .collect())
    }

    async fn create_cron_job(&self, job: &CronJob) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = key_of(job);
        if state.cron_jobs.contains_key(&key) {
            let message = format!("cronjobs \"{}\" already exists", key.1);
            return Err(api_error(409, "AlreadyExists", message));
        }
        let mut job = job.clone();
        job.metadata.resource_version = state.next_revision();
        state.cron_jobs.insert(key, job);
        Ok(())
    }

    async fn replace_cron_job(&self, job: &CronJob) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = key_of(job);
        let Some(live) = state.cron_jobs.get(&key) else {
            let message = format!("cronjobs \"{}\" not found", key.1);
            return Err(api_error(404, "NotFound", message));
        };
        if live.metadata.resource_version != job.metadata.resource_version {
            return Err(api_error(409, "Conflict", "the object has been modified".to_string()));
        }
        let mut job = job.clone();
        job.status = live.status.clone();
        job.metadata.resource_version = state.next_revision();
        state.cron_jobs.insert(key, job);
        Ok(())
    }

    async fn delete_cron_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .cron_jobs
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_jobs(&self, namespace: &str, identity: &RepositoryIdentity) -> Result<Vec<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .iter()
            .filter(|job| job.namespace().as_deref() == Some(namespace))
            .filter(|job| {
                job.labels().get(labels::REPOSITORY_HASH).map(String::as_str)
                    == Some(identity.as_str())
            })
            .cloned()
            .collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secret(namespace, name))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.config_map(namespace, name))
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<()> {
        self.insert_secret(secret.clone());
        Ok(())
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        self.insert_config_map(config_map.clone());
        Ok(())
    }

    async fn list_projected(&self, namespace: &str) -> Result<Vec<ProjectedObject>> {
        let state = self.state.lock().unwrap();
        let secrets = state
            .secrets
            .values()
            .filter(|s| s.namespace().as_deref() == Some(namespace))
            .filter_map(|s| projected_from(ProjectedKind::Secret, &s.name_any(), s.labels()));
        let config_maps = state
            .config_maps
            .values()
            .filter(|c| c.namespace().as_deref() == Some(namespace))
            .filter_map(|c| projected_from(ProjectedKind::ConfigMap, &c.name_any(), c.labels()));
        Ok(secrets.chain(config_maps).collect())
    }

    async fn delete_projected(&self, namespace: &str, object: &ProjectedObject) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = (namespace.to_string(), object.name.clone());
        match object.kind {
            ProjectedKind::Secret => {
                state.secrets.remove(&key);
            }
            ProjectedKind::ConfigMap => {
                state.config_maps.remove(&key);
            }
        }
        Ok(())
    }

    async fn patch_policy_status(
        &self,
        name: &str,
        status: &KopiaMaintenanceStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let revision = state.next_revision();
        let Some(policy) = state.policies.get_mut(name) else {
            return Err(policy_not_found(name));
        };
        // Same JSON merge patch semantics as the API server
        let patch = status_patch(status)?;
        let mut current = serde_json::to_value(policy.status.clone().unwrap_or_default())?;
        merge_patch(&mut current, &patch["status"]);
        policy.status = Some(serde_json::from_value(current)?);
        policy.metadata.resource_version = revision;
        Ok(())
    }

    async fn add_finalizer(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(policy) = state.policies.get_mut(name) else {
            return Err(policy_not_found(name));
        };
        let finalizers = policy.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == FINALIZER) {
            finalizers.push(FINALIZER.to_string());
        }
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(policy) = state.policies.get_mut(name) else {
            return Ok(());
        };
        if let Some(finalizers) = policy.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != FINALIZER);
        }
        let released = policy.finalizers().is_empty() && policy.is_being_deleted();
        if released {
            state.policies.remove(name);
        }
        Ok(())
    }
}
