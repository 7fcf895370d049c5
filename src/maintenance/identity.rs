// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Repository identity: the grouping key for everything that refers to one
//! physical Kopia repository.
//!
//! The identity covers the repository secret name and the custom CA only.
//! Namespace and schedule stay out so that one repository used from several
//! namespaces collapses to one identity. The token keeps 16 hex characters
//! (64 bits) of a SHA-256 digest; a collision between two repositories has a
//! 2^-64 chance per pair, which is accepted for the handful of repositories a
//! cluster holds.

use crate::constants::naming::IDENTITY_HEX_LENGTH;
use crate::types::CustomCaSpec;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic repository identity token
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryIdentity(String);

impl RepositoryIdentity {
    /// Hash a repository reference; never fails
    pub fn compute(repository: &str, custom_ca: Option<&CustomCaSpec>) -> Self {
        let ca = custom_ca.filter(|ca| !ca.is_empty()).map(|ca| {
            json!({
                "secretName": ca.secret_name,
                "configMapName": ca.config_map_name,
            })
        });
        // serde_json objects are key-sorted, so the document is canonical
        let canonical = json!({
            "repository": repository,
            "customCA": ca,
        })
        .to_string();

        let digest = Sha256::digest(canonical.as_bytes());
        let mut token = hex::encode(digest);
        token.truncate(IDENTITY_HEX_LENGTH);
        RepositoryIdentity(token)
    }

    /// Rebuild an identity from a label value written earlier
    pub fn from_label(value: &str) -> Option<Self> {
        let valid = value.len() == IDENTITY_HEX_LENGTH
            && value
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        valid.then(|| RepositoryIdentity(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
