use std::path::Path;

use regex::Regex;
use tracing::{info, warn};

use crate::config::RemediationConfig;
use crate::error::{RemediationError, RemediationResult};
use crate::models::{BatchReport, Device, ProfilePolicy};
use crate::system::devices::{list_ghosts, remove_devices, DeviceInventory};
use crate::system::profiles::{delete_stale, ProfileCleanup, ProfileCleanupReport, ProfileStore};

/// Compiled name patterns, built once from the config.
#[derive(Debug, Clone)]
pub struct Patterns {
    pub product: Regex,
    pub adapter: Regex,
    pub profile: Regex,
}

impl Patterns {
    pub fn from_config(config: &RemediationConfig) -> RemediationResult<Self> {
        let compile = |label: &str, pattern: &str| {
            Regex::new(pattern)
                .map_err(|err| RemediationError::Command(format!("invalid {label} pattern: {err}")))
        };
        Ok(Self {
            product: compile("product", &config.product_name_pattern)?,
            adapter: compile("adapter", &config.adapter_name_pattern)?,
            profile: compile("profile", &config.profile_name_pattern)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub ghosts: Vec<Device>,
    pub devices: BatchReport,
    pub profiles: ProfileCleanupReport,
}

impl CleanupReport {
    pub fn failed(&self) -> usize {
        self.devices.failed.saturating_add(self.profiles.deletions.failed)
    }

    pub fn attempted(&self) -> usize {
        self.devices
            .attempted
            .saturating_add(self.profiles.deletions.attempted)
    }

    /// Partial-batch failures as an error, for callers that treat them as fatal.
    pub fn into_result(self) -> RemediationResult<Self> {
        if self.failed() > 0 {
            return Err(RemediationError::PartialBatch {
                attempted: self.attempted(),
                failed: self.failed(),
            });
        }
        Ok(self)
    }
}

/// Removes ghost adapters, then deletes stale profiles while keeping the one
/// bound to the live connection.
pub fn run_cleanup(
    devices: &dyn DeviceInventory,
    profiles: &dyn ProfileStore,
    patterns: &Patterns,
    config: &RemediationConfig,
    export_dir: Option<&Path>,
) -> RemediationResult<CleanupReport> {
    let ghosts = list_ghosts(devices, &patterns.adapter)?;
    info!(count = ghosts.len(), "ghost adapters found");
    let device_report = remove_devices(devices, ghosts.iter().map(|d| d.instance_id.as_str()));

    let active_guid = match profiles.find_active_guid(&patterns.adapter) {
        Ok(guid) => guid,
        Err(err) => {
            // Without a known active profile nothing can be protected; fail closed.
            warn!(error = %err, "active connection lookup failed");
            return Err(err);
        }
    };
    if let Some(guid) = active_guid.as_deref() {
        info!(guid, "active profile identified");
    }

    let profile_report = delete_stale(
        profiles,
        &ProfileCleanup {
            pattern: &patterns.profile,
            canonical_name: &config.canonical_profile_name,
            policy: ProfilePolicy::PreserveActive,
            export_dir,
        },
        active_guid.as_deref(),
    )?;

    let report = CleanupReport {
        ghosts,
        devices: device_report,
        profiles: profile_report,
    };
    info!(
        devices_removed = report.devices.succeeded,
        profiles_deleted = report.profiles.deletions.succeeded,
        failed = report.failed(),
        "cleanup finished"
    );
    Ok(report)
}
