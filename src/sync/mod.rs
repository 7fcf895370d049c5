// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Convergence of the cluster towards the computed plan.

pub mod jobs;
pub mod manager;
pub mod secrets;
pub mod status;

pub use manager::{MaintenanceHandle, MaintenanceManager, PassSummary};
pub use secrets::project_credentials;
