use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stage of the remediation state machine. The phase is the only state that
/// crosses a reboot, carried as the resume task's argument.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Fresh,
    AfterReboot1,
    AfterReboot2,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Fresh, Phase::AfterReboot1, Phase::AfterReboot2];

    pub fn as_flag(&self) -> &'static str {
        match self {
            Phase::Fresh => "fresh",
            Phase::AfterReboot1 => "after-reboot-1",
            Phase::AfterReboot2 => "after-reboot-2",
        }
    }

    /// The phase resumed after this phase's reboot, if it ends in one.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Fresh => Some(Phase::AfterReboot1),
            Phase::AfterReboot1 => Some(Phase::AfterReboot2),
            Phase::AfterReboot2 => None,
        }
    }

    /// Name of the resume task that launches this phase. `Fresh` is never
    /// resumed, it is only started by a person.
    pub fn resume_task_name(&self) -> Option<&'static str> {
        match self {
            Phase::Fresh => None,
            Phase::AfterReboot1 => Some("VpnRemediate-AfterReboot1"),
            Phase::AfterReboot2 => Some("VpnRemediate-AfterReboot2"),
        }
    }

    pub fn all_resume_task_names() -> Vec<&'static str> {
        Self::ALL
            .iter()
            .filter_map(|phase| phase.resume_task_name())
            .collect()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_flag())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "" | "fresh" => Ok(Phase::Fresh),
            "after-reboot-1" | "afterreboot1" => Ok(Phase::AfterReboot1),
            "after-reboot-2" | "afterreboot2" => Ok(Phase::AfterReboot2),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

/// Status string the device manager reports for a working device.
pub const HEALTHY_DEVICE_STATUS: &str = "OK";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceHealth {
    Healthy,
    Ghost,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub friendly_name: String,
    pub instance_id: String,
    pub status: Option<String>,
}

impl Device {
    pub fn health(&self) -> DeviceHealth {
        classify_device(self.status.as_deref())
    }
}

/// A device is healthy only when its status is exactly the healthy sentinel;
/// every other value, including a missing one, is a ghost.
pub fn classify_device(status: Option<&str>) -> DeviceHealth {
    match status {
        Some(HEALTHY_DEVICE_STATUS) => DeviceHealth::Healthy,
        _ => DeviceHealth::Ghost,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkProfile {
    pub name: String,
    pub guid: String,
    pub registry_path: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProfilePolicy {
    /// Keep the profile bound to the live connection, delete the rest.
    PreserveActive,
    /// Delete every matching profile, active one included.
    DeleteAll,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskTrigger {
    AtLogon,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumeTask {
    pub name: String,
    pub command: String,
    pub arguments: String,
    pub trigger: TaskTrigger,
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    pub version: Option<String>,
    pub publisher: Option<String>,
    /// Registry key name under the uninstall hive; an MSI product code for
    /// MSI-based installs.
    pub product_code: String,
    pub uninstall_string: Option<String>,
    pub quiet_uninstall_string: Option<String>,
    pub source: String,
}

impl PackageInfo {
    pub fn is_msi(&self) -> bool {
        let code = self.product_code.trim();
        code.starts_with('{') && code.ends_with('}') && code.len() == 38
    }
}

/// How an installer exit code is treated by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    Success,
    SuccessRebootRequired,
    Busy,
    Failed(i32),
}

impl ExitDisposition {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::SuccessRebootRequired)
    }
}

/// Outcome of a removal batch. Every item is attempted regardless of earlier
/// failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<String>,
}

impl BatchReport {
    pub fn record_success(&mut self) {
        self.attempted = self.attempted.saturating_add(1);
        self.succeeded = self.succeeded.saturating_add(1);
    }

    pub fn record_failure(&mut self, detail: String) {
        self.attempted = self.attempted.saturating_add(1);
        self.failed = self.failed.saturating_add(1);
        self.failures.push(detail);
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepDisposition {
    Succeeded,
    Warned,
    Fatal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub phase: Phase,
    pub step: String,
    pub disposition: StepDisposition,
    pub detail: String,
    pub timestamp_utc: String,
}

/// Final state of one process invocation of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Resume task committed and reboot issued; work continues in `next`.
    RebootPending { next: Phase },
    Completed,
    /// Completed, but at least one best-effort confirmation failed.
    CompletedDegraded { warnings: Vec<String> },
    Failed { step: String, reason: String },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Failed { .. } => 1,
            _ => 0,
        }
    }
}
