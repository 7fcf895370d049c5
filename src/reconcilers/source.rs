// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! ReplicationSource watcher - notifies the maintenance manager when sources
//! appear, change or go away.

use crate::sync::MaintenanceHandle;
use crate::types::ReplicationSource;
use futures::{StreamExt, TryStreamExt};
use kube::{Api, Client, ResourceExt};
use kube_runtime::{watcher, WatchStreamExt};
use tracing::{debug, error, info};

pub struct SourceWatcher {
    client: Client,
    handle: MaintenanceHandle,
}

impl SourceWatcher {
    pub fn new(client: Client, handle: MaintenanceHandle) -> Self {
        Self { client, handle }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let sources: Api<ReplicationSource> = Api::all(self.client.clone());
        let mut stream = watcher(sources, watcher::Config::default())
            .default_backoff()
            .boxed();

        info!("Watching ReplicationSources");
        loop {
            match stream.try_next().await {
                Ok(Some(event)) => {
                    if let Some(reason) = trigger_reason(&event) {
                        debug!("{}", reason);
                        self.handle.notify(reason).await;
                    }
                }
                Ok(None) => break,
                Err(e) => error!(error = ?e, "ReplicationSource watcher stream error"),
            }
        }

        Ok(())
    }
}

fn source_key(source: &ReplicationSource) -> String {
    format!("{}/{}", source.namespace().unwrap_or_default(), source.name_any())
}

/// Events that can change the plan; the initial listing counts once
fn trigger_reason(event: &watcher::Event<ReplicationSource>) -> Option<String> {
    match event {
        watcher::Event::Apply(s) => Some(format!("ReplicationSource {} changed", source_key(s))),
        watcher::Event::Delete(s) => Some(format!("ReplicationSource {} deleted", source_key(s))),
        watcher::Event::InitDone => Some("ReplicationSources relisted".to_string()),
        watcher::Event::Init | watcher::Event::InitApply(_) => None,
    }
}
