// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use kube::Client;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kopia_maintainer::config::Config;
use kopia_maintainer::constants::OPERATOR_NAME;
use kopia_maintainer::kubernetes::{wait_for_volsync_crds, KubeBackend, KubeEventPublisher};
use kopia_maintainer::reconcilers::{MaintenanceReconciler, SourceWatcher};
use kopia_maintainer::sync::MaintenanceManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Kopia maintenance controller");

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: operator_namespace={}, strategy={:?}, image={}",
        config.operator_namespace, config.strategy, config.container_image
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    info!("Waiting for VolSync CRDs to become available...");
    wait_for_volsync_crds(&client).await?;

    // The image is fixed for the life of the process; an upgraded operator pod
    // re-renders every CronJob through the spec-hash annotation on its first pass
    let (_image_tx, image_rx) = watch::channel(config.container_image.clone());
    let backend = Arc::new(KubeBackend::new(client.clone()));
    let events = Arc::new(KubeEventPublisher::new(client.clone(), OPERATOR_NAME));

    let (manager, handle) = MaintenanceManager::new(backend.clone(), config.clone(), image_rx);
    let policy_reconciler = MaintenanceReconciler::new(backend, handle.clone(), events, config);
    let source_watcher = SourceWatcher::new(client.clone(), handle);

    info!("Starting reconcilers...");

    tokio::try_join!(
        manager.run(),
        policy_reconciler.run(client),
        source_watcher.run()
    )?;

    warn!("All reconcilers stopped unexpectedly");
    Ok(())
}
