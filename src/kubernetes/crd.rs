// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! CRD availability checking utilities

use crate::constants::crd::{POLL_INTERVAL_SECS, POLL_MAX_INTERVAL_SECS};
use crate::error::Result;
use kube::{discovery::Discovery, Client};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

const GROUP: &str = "volsync.backube";
const VERSION: &str = "v1alpha1";

/// Wait until the VolSync CRDs the controller watches are served.
/// This uses exponential backoff starting at POLL_INTERVAL_SECS seconds.
pub async fn wait_for_volsync_crds(client: &Client) -> Result<()> {
    let mut interval = POLL_INTERVAL_SECS;

    loop {
        match missing_kinds(client).await {
            Ok(missing) if missing.is_empty() => {
                info!("VolSync CRDs ({}/{}) are available", GROUP, VERSION);
                return Ok(());
            }
            Ok(missing) => {
                info!(
                    "Waiting for {} ({}/{}), retrying in {} seconds...",
                    missing.join(", "),
                    GROUP,
                    VERSION,
                    interval
                );
            }
            Err(e) => {
                warn!(
                    "Error checking for VolSync CRDs: {}, retrying in {} seconds...",
                    e, interval
                );
            }
        }

        sleep(Duration::from_secs(interval)).await;

        // Exponential backoff with max cap
        interval = (interval * 2).min(POLL_MAX_INTERVAL_SECS);
    }
}

/// Kinds not yet served by the API server
async fn missing_kinds(client: &Client) -> Result<Vec<&'static str>> {
    let discovery = Discovery::new(client.clone())
        .filter(&[GROUP])
        .run()
        .await?;

    let mut served = Vec::new();
    for group in discovery.groups() {
        if group.name() == GROUP {
            for (ar, _) in group.recommended_resources() {
                if ar.version == VERSION {
                    served.push(ar.kind);
                }
            }
        }
    }

    Ok(["ReplicationSource", "KopiaMaintenance"]
        .into_iter()
        .filter(|kind| !served.iter().any(|s| s == kind))
        .collect())
}
