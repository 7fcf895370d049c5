// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::kubernetes::events::reasons;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MaintenanceError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Invalid KopiaMaintenance: {0}")]
    Validation(String),

    #[error("invalid schedule {schedule:?}: {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("Repository credentials unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Maintenance manager unavailable: {0}")]
    ManagerUnavailable(String),

    #[error("Convergence incomplete: {0}")]
    Incomplete(String),
}

impl MaintenanceError {
    /// Whether retrying later may succeed without the user changing anything
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            MaintenanceError::Validation(_) | MaintenanceError::InvalidSchedule { .. }
        )
    }

    /// The status reason other tooling greps for
    pub fn reason(&self) -> &'static str {
        match self {
            MaintenanceError::Validation(_) => reasons::VALIDATION_FAILED,
            MaintenanceError::InvalidSchedule { .. } => reasons::INVALID_SCHEDULE,
            MaintenanceError::CredentialUnavailable(_) => reasons::CREDENTIAL_UNAVAILABLE,
            _ => reasons::RECONCILE_FAILED,
        }
    }
}

/// True when the API answered 404, which cleanup paths treat as already done
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// True when an optimistic-concurrency write lost the race
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

pub type Result<T> = std::result::Result<T, MaintenanceError>;
