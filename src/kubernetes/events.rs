// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes Events on KopiaMaintenance objects.
//!
//! Publishing is fire-and-forget: a failed event is logged and never fails
//! a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Drops every event; used where no API server is reachable
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Reason strings shown in `kubectl get events` and status conditions
pub mod reasons {
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const INVALID_SCHEDULE: &str = "InvalidSchedule";
    pub const MAINTENANCE_ACTIVE: &str = "MaintenanceActive";
    pub const MAINTENANCE_DISABLED: &str = "MaintenanceDisabled";
    pub const NO_MATCHING_SOURCES: &str = "NoMatchingSources";
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    pub const RECONCILE_COMPLETE: &str = "ReconcileComplete";
    pub const NEW_GENERATION_OBSERVED: &str = "NewGenerationObserved";
    pub const CREATING_CRON_JOB: &str = "CreatingCronJob";
    pub const RECONCILE_ERROR: &str = "ReconcileError";
    pub const CREDENTIAL_UNAVAILABLE: &str = "CredentialUnavailable";
}

pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const VALIDATE: &str = "Validate";
    pub const DELETE: &str = "Delete";
}
