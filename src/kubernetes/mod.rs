// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes plumbing: the backend seam, CRD discovery, namespaces and events.

pub mod backend;
pub mod crd;
pub mod events;
pub mod namespaces;

pub use backend::{KubeBackend, MaintenanceBackend, ProjectedKind, ProjectedObject};
pub use crd::wait_for_volsync_crds;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use namespaces::list_namespace_labels;
