// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// Label keys placed on managed CronJobs, Jobs and projected credentials
pub mod labels {
    /// Marks an object as managed by the maintenance controller ("true")
    pub const MANAGED: &str = "volsync.backube/kopia-maintenance";
    /// Repository identity token the object belongs to
    pub const REPOSITORY_HASH: &str = "volsync.backube/repository-hash";
    /// Distinguishes projected repository credentials from projected CA material
    pub const PROJECTION_ROLE: &str = "volsync.backube/projection-role";
}

/// Annotation keys placed on managed CronJobs
pub mod annotations {
    /// Name of the repository secret the CronJob maintains
    pub const REPOSITORY_CONFIG: &str = "volsync.backube/repository-config";
    /// Comma separated, sorted list of namespaces whose sources reference the repository
    pub const CONTRIBUTING_NAMESPACES: &str = "volsync.backube/contributing-namespaces";
    /// Namespace that set the live schedule (first-wins arbitration)
    pub const SCHEDULE_ORIGIN: &str = "volsync.backube/schedule-origin-namespace";
    /// JSON list of rejected schedule proposals (first-wins arbitration)
    pub const SCHEDULE_CONFLICTS: &str = "volsync.backube/schedule-conflicts";
    /// Hash of the rendered CronJob spec, used to detect drift
    pub const SPEC_HASH: &str = "volsync.backube/spec-hash";
    /// Container image the CronJob was rendered with
    pub const CONTAINER_VERSION: &str = "volsync.backube/container-version";
    /// Policy that won arbitration for the repository, when policy managed
    pub const WINNING_POLICY: &str = "volsync.backube/kopia-maintenance-policy";
}

/// The operator name used for server-side apply and as the event reporter
pub const OPERATOR_NAME: &str = "kopia-maintenance";

/// Finalizer guarding KopiaMaintenance deletion until its jobs are released
pub const FINALIZER: &str = "volsync.backube/kopiamaintenance-protection";

/// Defaults applied when a policy or legacy source leaves a field unset
pub mod defaults {
    /// Daily at 02:00
    pub const SCHEDULE: &str = "0 2 * * *";
    pub const SUCCESSFUL_JOBS_HISTORY_LIMIT: i32 = 3;
    pub const FAILED_JOBS_HISTORY_LIMIT: i32 = 1;
    pub const CPU_REQUEST: &str = "100m";
    pub const MEMORY_REQUEST: &str = "256Mi";
    pub const CPU_LIMIT: &str = "500m";
    pub const MEMORY_LIMIT: &str = "1Gi";
    pub const PRIORITY_MIN: i32 = -100;
    pub const PRIORITY_MAX: i32 = 100;
    /// Username Kopia reports for maintenance ownership
    pub const MAINTENANCE_USERNAME: &str = "maintenance@volsync";
}

/// Naming budget for generated objects
pub mod naming {
    /// Prefix of every generated CronJob name
    pub const CRONJOB_PREFIX: &str = "kopia-maint-";
    /// Prefix of projected repository secrets
    pub const CREDENTIAL_PREFIX: &str = "kopia-maint-repo-";
    /// Prefix of projected custom CA objects
    pub const CA_PREFIX: &str = "kopia-maint-ca-";
    /// CronJob names must leave room for the 11 character suffix of spawned Jobs
    pub const MAX_CRONJOB_NAME_LENGTH: usize = 52;
    /// Hex characters of the repository identity kept in names
    pub const IDENTITY_HEX_LENGTH: usize = 16;
}

/// Requeue intervals returned to the controller runtime
pub mod requeue {
    /// Periodic recheck of a healthy policy
    pub const STEADY_SECS: u64 = 300;
    /// Retry after a transient infrastructure failure
    pub const TRANSIENT_SECS: u64 = 60;
    /// Retry while a finalizer cleanup is blocked
    pub const CLEANUP_SECS: u64 = 30;
}

/// CRD polling configuration
pub mod crd {
    /// Initial polling interval in seconds when waiting for CRD
    pub const POLL_INTERVAL_SECS: u64 = 10;
    /// Maximum polling interval in seconds (exponential backoff cap)
    pub const POLL_MAX_INTERVAL_SECS: u64 = 60;
}
