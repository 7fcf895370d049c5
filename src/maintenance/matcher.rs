// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Decides whether a selector-mode KopiaMaintenance applies to a ReplicationSource.

use crate::maintenance::pattern::matches_pattern;
use crate::types::maintenance::{CustomCaSelector, NamespaceSelector};
use crate::types::{CustomCaSpec, KopiaMaintenance, ReplicationSource};
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Namespace metadata lookup used by `namespaceSelector.matchLabels`
pub trait NamespaceLabels {
    /// Labels of the namespace, or None when it could not be looked up
    fn labels_of(&self, namespace: &str) -> Option<&BTreeMap<String, String>>;
}

impl NamespaceLabels for BTreeMap<String, BTreeMap<String, String>> {
    fn labels_of(&self, namespace: &str) -> Option<&BTreeMap<String, String>> {
        self.get(namespace)
    }
}

/// All selector clauses must hold; absent clauses always hold
pub fn matches(
    policy: &KopiaMaintenance,
    source: &ReplicationSource,
    namespaces: &dyn NamespaceLabels,
) -> bool {
    // Direct repository mode manages its own repository and never claims sources
    if policy.is_direct_repository_mode() {
        return false;
    }
    let Some(selector) = policy.spec.repository_selector.as_ref() else {
        return false;
    };
    let Some(kopia) = source.kopia() else {
        return false;
    };

    if !matches_pattern(&kopia.repository, &selector.repository) {
        return false;
    }

    if let Some(ns_selector) = &selector.namespace_selector {
        if !matches_namespace(&source.namespace().unwrap_or_default(), ns_selector, namespaces) {
            return false;
        }
    }

    if let Some(ca_selector) = &selector.custom_ca {
        let empty = CustomCaSpec::default();
        if !matches_custom_ca(kopia.custom_ca.as_ref().unwrap_or(&empty), ca_selector) {
            return false;
        }
    }

    contains_all(source.labels(), &selector.labels)
}

fn matches_namespace(
    namespace: &str,
    selector: &NamespaceSelector,
    namespaces: &dyn NamespaceLabels,
) -> bool {
    if selector.exclude_names.iter().any(|n| n == namespace) {
        return false;
    }
    if !selector.match_names.is_empty() && !selector.match_names.iter().any(|n| n == namespace) {
        return false;
    }
    if !selector.match_labels.is_empty() {
        return namespaces
            .labels_of(namespace)
            .is_some_and(|labels| contains_all(labels, &selector.match_labels));
    }
    true
}

/// Names are compared only when both sides carry one
fn matches_custom_ca(ca: &CustomCaSpec, selector: &CustomCaSelector) -> bool {
    let field_matches = |value: &str, pattern: &str| {
        value.is_empty() || pattern.is_empty() || matches_pattern(value, pattern)
    };
    field_matches(&ca.secret_name, &selector.secret_name)
        && field_matches(&ca.config_map_name, &selector.config_map_name)
}

fn contains_all(labels: &BTreeMap<String, String>, required: &BTreeMap<String, String>) -> bool {
    required
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}
