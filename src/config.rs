use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "remediation.json";

/// Everything the run needs that is not the phase. Built once at startup and
/// passed by reference into every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    pub target_network_identity: String,
    pub installer_source_url: String,
    pub installer_sha256: Option<String>,
    pub polling_timeout_seconds: u64,
    pub polling_interval_seconds: u64,
    /// Matched against the installed-software display name.
    pub product_name_pattern: String,
    /// Matched against device friendly names and connection interface aliases.
    pub adapter_name_pattern: String,
    pub canonical_profile_name: String,
    /// Base friendly name for `generate-test-devices`. Must match
    /// `adapter_name_pattern` for the placeholders to be cleaned up.
    pub test_device_name: String,
    /// Which profile names count as ours. The default covers the canonical
    /// name and its numbered duplicates, nothing else.
    pub profile_name_pattern: String,
    pub client_process_names: Vec<String>,
    pub client_service_name: String,
    pub client_executable: String,
    pub connectivity_endpoint: String,
    pub mdm_task_path: String,
    pub client_registry_key: String,
    pub force_reinstall: bool,
    pub installer_busy_retries: u32,
    pub installer_busy_backoff_seconds: u64,
    pub reboot_delay_seconds: u64,
    pub fatal_pause_seconds: u64,
    pub data_directory: PathBuf,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            target_network_identity: "example.twingate.com".to_string(),
            installer_source_url: "https://api.twingate.com/download/windows?installer=msi"
                .to_string(),
            installer_sha256: None,
            polling_timeout_seconds: 300,
            polling_interval_seconds: 10,
            product_name_pattern: "^Twingate".to_string(),
            adapter_name_pattern: "^Twingate".to_string(),
            canonical_profile_name: "Twingate".to_string(),
            test_device_name: "Twingate Test Adapter".to_string(),
            profile_name_pattern: r"^Twingate( \d+)?$".to_string(),
            client_process_names: vec![
                "Twingate.exe".to_string(),
                "Twingate.Service.exe".to_string(),
            ],
            client_service_name: "twingate.service".to_string(),
            client_executable: "C:\\Program Files\\Twingate\\Twingate.exe".to_string(),
            connectivity_endpoint: String::new(),
            mdm_task_path: "\\Microsoft\\Windows\\EnterpriseMgmt\\".to_string(),
            client_registry_key: "SOFTWARE\\Twingate".to_string(),
            force_reinstall: false,
            installer_busy_retries: 3,
            installer_busy_backoff_seconds: 30,
            reboot_delay_seconds: 15,
            fatal_pause_seconds: 10,
            data_directory: PathBuf::from("C:\\ProgramData\\VpnRemediate"),
        }
    }
}

impl RemediationConfig {
    /// Loads an explicit config file, or the default file next to the
    /// executable when present, or the built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let beside_exe = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_CONFIG_FILE)));
        match beside_exe {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (label, pattern) in [
            ("product_name_pattern", &self.product_name_pattern),
            ("adapter_name_pattern", &self.adapter_name_pattern),
            ("profile_name_pattern", &self.profile_name_pattern),
        ] {
            regex::Regex::new(pattern)
                .with_context(|| format!("invalid regex in {label}: {pattern}"))?;
        }
        if self.polling_interval_seconds > self.polling_timeout_seconds {
            anyhow::bail!("polling_interval_seconds exceeds polling_timeout_seconds");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_seconds)
    }

    /// Attempts that fit into the polling timeout, at least one.
    pub fn poll_attempts(&self) -> u32 {
        if self.polling_interval_seconds == 0 {
            return self.polling_timeout_seconds.clamp(1, 30) as u32;
        }
        let attempts = self.polling_timeout_seconds / self.polling_interval_seconds;
        attempts.clamp(1, u32::MAX as u64) as u32
    }

    pub fn log_directory(&self) -> PathBuf {
        self.data_directory.join("logs")
    }

    pub fn backup_directory(&self) -> PathBuf {
        self.data_directory.join("backups")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_directory.join("journal.db")
    }

    pub fn installer_path(&self) -> PathBuf {
        self.data_directory.join("downloads").join("client-installer.msi")
    }
}
