// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Custom resources read and written by the controller.

pub mod maintenance;
pub mod replication_source;

pub use maintenance::{KopiaMaintenance, KopiaMaintenanceSpec, KopiaMaintenanceStatus};
pub use replication_source::{CustomCaSpec, ReplicationSource};
