// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Repository deduplication, arbitration and desired-state computation.
//!
//! Everything in here is free of API calls; the sync manager feeds it fresh
//! listings and applies the resulting plan.

pub mod arbitration;
pub mod cronjob;
pub mod identity;
pub mod matcher;
pub mod pattern;
pub mod plan;
pub mod schedule;

pub use arbitration::{Contribution, JobSettings, Origin, ScheduleConflict, SourceMode};
pub use identity::RepositoryIdentity;
pub use plan::{DesiredJob, Plan, PolicyReport};
