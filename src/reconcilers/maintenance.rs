// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! KopiaMaintenance reconciler - guards deletion with a finalizer, reports
//! validation failures and asks the maintenance manager to converge.

use crate::config::Config;
use crate::constants::{requeue, FINALIZER};
use crate::error::{MaintenanceError, Result};
use crate::kubernetes::events::{actions, reasons};
use crate::kubernetes::{EventPublisher, MaintenanceBackend};
use crate::sync::MaintenanceHandle;
use crate::types::KopiaMaintenance;
use futures::StreamExt;
use kube::{
    runtime::{controller, controller::Action, events::EventType, watcher, Controller},
    Api, Client, Resource, ResourceExt,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub struct MaintenanceReconciler {
    backend: Arc<dyn MaintenanceBackend>,
    handle: MaintenanceHandle,
    events: Arc<dyn EventPublisher>,
    config: Config,
}

impl MaintenanceReconciler {
    pub fn new(
        backend: Arc<dyn MaintenanceBackend>,
        handle: MaintenanceHandle,
        events: Arc<dyn EventPublisher>,
        config: Config,
    ) -> Self {
        Self {
            backend,
            handle,
            events,
            config,
        }
    }

    pub async fn run(self, client: Client) -> anyhow::Result<()> {
        let policies: Api<KopiaMaintenance> = Api::all(client);
        let controller_config =
            controller::Config::default().concurrency(self.config.max_concurrent_reconciles);
        let context = Arc::new(self);

        Controller::new(policies, watcher::Config::default())
            .with_config(controller_config)
            .run(reconcile, error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled KopiaMaintenance: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        Ok(())
    }
}

async fn reconcile(
    policy: Arc<KopiaMaintenance>,
    ctx: Arc<MaintenanceReconciler>,
) -> Result<Action> {
    match reconcile_policy(&policy, &ctx).await {
        Ok(action) => Ok(action),
        Err(e) => {
            ctx.events
                .publish(
                    &policy.object_ref(&()),
                    EventType::Warning,
                    reasons::RECONCILE_ERROR,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
            Err(e)
        }
    }
}

#[instrument(skip(policy, ctx), fields(policy = %policy.name_any()))]
async fn reconcile_policy(
    policy: &KopiaMaintenance,
    ctx: &MaintenanceReconciler,
) -> Result<Action> {
    let name = policy.name_any();

    if policy.is_being_deleted() {
        return cleanup(policy, ctx).await;
    }

    if !policy.has_finalizer(FINALIZER) {
        ctx.backend.add_finalizer(&name).await?;
    }

    if let Err(e) = policy.validate() {
        warn!("KopiaMaintenance {} is invalid: {}", name, e);
        ctx.events
            .publish(
                &policy.object_ref(&()),
                EventType::Warning,
                e.reason(),
                actions::VALIDATE,
                Some(e.to_string()),
            )
            .await;
        // The pass records the failure in status and releases governed jobs
        ctx.handle.converge().await?;
        return Ok(Action::await_change());
    }

    let summary = ctx.handle.converge().await?;
    if summary.is_complete() {
        Ok(Action::requeue(Duration::from_secs(requeue::STEADY_SECS)))
    } else {
        debug!(?summary, "Convergence incomplete, retrying sooner");
        Ok(Action::requeue(Duration::from_secs(requeue::TRANSIENT_SECS)))
    }
}

async fn cleanup(policy: &KopiaMaintenance, ctx: &MaintenanceReconciler) -> Result<Action> {
    let name = policy.name_any();
    if !policy.has_finalizer(FINALIZER) {
        return Ok(Action::await_change());
    }

    info!("KopiaMaintenance {} is being deleted, releasing its CronJobs", name);
    // Deleting policies are left out of the plan, so one pass releases them
    if let Err(e) = ctx.handle.converge().await {
        warn!("Cleanup of KopiaMaintenance {} blocked: {}", name, e);
        ctx.events
            .publish(
                &policy.object_ref(&()),
                EventType::Warning,
                reasons::RECONCILE_ERROR,
                actions::DELETE,
                Some(e.to_string()),
            )
            .await;
        return Ok(Action::requeue(Duration::from_secs(requeue::CLEANUP_SECS)));
    }

    ctx.backend.remove_finalizer(&name).await?;
    info!("Released KopiaMaintenance {}", name);
    Ok(Action::await_change())
}

fn error_policy(
    _policy: Arc<KopiaMaintenance>,
    error: &MaintenanceError,
    _ctx: Arc<MaintenanceReconciler>,
) -> Action {
    error!("Reconciliation error: {}", error);
    Action::requeue(Duration::from_secs(requeue::TRANSIENT_SECS))
}
