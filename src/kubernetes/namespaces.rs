// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Namespace metadata lookups

use crate::error::Result;
use k8s_openapi::api::core::v1::Namespace;
use kube::{api::ListParams, Api, Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// Labels of every namespace in the cluster, keyed by namespace name
#[instrument(skip(client))]
pub async fn list_namespace_labels(
    client: &Client,
) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let list = namespaces.list(&ListParams::default()).await?;
    debug!("Listed {} namespaces", list.items.len());

    Ok(list
        .items
        .into_iter()
        .map(|ns| {
            let labels = ns.labels().clone();
            (ns.name_any(), labels)
        })
        .collect())
}
