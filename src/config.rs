// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// How competing declarations for one repository are settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArbitrationStrategy {
    /// Highest priority policy wins, ties go to the smaller name
    #[default]
    Priority,
    /// The namespace that first set a schedule keeps it
    FirstWins,
}

impl FromStr for ArbitrationStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "priority" => Ok(ArbitrationStrategy::Priority),
            "first-wins" | "firstwins" | "first_wins" => Ok(ArbitrationStrategy::FirstWins),
            other => bail!("unknown arbitration strategy '{}'", other),
        }
    }
}

/// Operator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace where maintenance CronJobs and projected credentials live
    pub operator_namespace: String,
    /// Container image running the maintenance entrypoint
    pub container_image: String,
    pub strategy: ArbitrationStrategy,
    /// Upper bound on concurrently reconciled KopiaMaintenance objects
    pub max_concurrent_reconciles: u16,
    /// Interval of the periodic full convergence pass
    pub resync_interval: Duration,
    pub maintenance_service_account: String,
    /// Maintain Kopia sources that carry no maintenance configuration at all
    pub manage_unconfigured_sources: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            operator_namespace: "volsync-system".to_string(),
            container_image: "quay.io/backube/volsync:latest".to_string(),
            strategy: ArbitrationStrategy::Priority,
            max_concurrent_reconciles: 3,
            resync_interval: Duration::from_secs(300),
            maintenance_service_account: "volsync-kopia-maintenance".to_string(),
            manage_unconfigured_sources: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Config::default();

        let operator_namespace = var("OPERATOR_NAMESPACE").unwrap_or(defaults.operator_namespace);
        let container_image = var("KOPIA_MAINTENANCE_IMAGE")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.container_image);
        let strategy = match var("ARBITRATION_STRATEGY") {
            Some(v) => v.parse().context("ARBITRATION_STRATEGY is invalid")?,
            None => defaults.strategy,
        };
        let max_concurrent_reconciles = match var("MAX_CONCURRENT_RECONCILES") {
            Some(v) => v
                .parse()
                .context("MAX_CONCURRENT_RECONCILES must be a positive integer")?,
            None => defaults.max_concurrent_reconciles,
        };
        let resync_interval = match var("RESYNC_INTERVAL_SECS") {
            Some(v) => Duration::from_secs(
                v.parse()
                    .context("RESYNC_INTERVAL_SECS must be a number of seconds")?,
            ),
            None => defaults.resync_interval,
        };
        let maintenance_service_account =
            var("MAINTENANCE_SERVICE_ACCOUNT").unwrap_or(defaults.maintenance_service_account);
        let manage_unconfigured_sources: bool = var("MANAGE_UNCONFIGURED_SOURCES")
            .unwrap_or("false".to_string())
            .parse()
            .unwrap_or(false);

        if max_concurrent_reconciles == 0 {
            bail!("MAX_CONCURRENT_RECONCILES must be at least 1");
        }
        if resync_interval.is_zero() {
            bail!("RESYNC_INTERVAL_SECS must be at least 1");
        }

        Ok(Config {
            operator_namespace,
            container_image,
            strategy,
            max_concurrent_reconciles,
            resync_interval,
            maintenance_service_account,
            manage_unconfigured_sources,
        })
    }
}
