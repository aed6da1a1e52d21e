use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{RemediationError, RemediationResult};
use crate::models::{BatchReport, NetworkProfile, ProfilePolicy};
use crate::system::process::ProcessRunner;

#[cfg(target_os = "windows")]
use winreg::{enums::*, RegKey};

pub const PROFILES_KEY: &str = "SOFTWARE\\Microsoft\\Windows NT\\CurrentVersion\\NetworkList\\Profiles";
pub const SIGNATURE_KEYS: &[&str] = &[
    "SOFTWARE\\Microsoft\\Windows NT\\CurrentVersion\\NetworkList\\Signatures\\Managed",
    "SOFTWARE\\Microsoft\\Windows NT\\CurrentVersion\\NetworkList\\Signatures\\Unmanaged",
];

/// Network-location profile records, keyed by GUID.
pub trait ProfileStore {
    fn list(&self) -> RemediationResult<Vec<NetworkProfile>>;

    /// GUID of the live connection bound to an interface matching `adapter_pattern`.
    fn find_active_guid(&self, adapter_pattern: &Regex) -> RemediationResult<Option<String>>;

    fn set_name(&self, guid: &str, name: &str) -> RemediationResult<()>;

    fn delete(&self, guid: &str) -> RemediationResult<()>;

    fn export(&self, guid: &str, destination: &Path) -> RemediationResult<()>;

    fn create(&self, guid: &str, name: &str) -> RemediationResult<()>;
}

pub fn guids_equal(left: &str, right: &str) -> bool {
    normalize_guid(left) == normalize_guid(right)
}

pub fn normalize_guid(value: &str) -> String {
    value
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .to_lowercase()
}

pub fn list_by_name_pattern(store: &dyn ProfileStore, pattern: &Regex) -> RemediationResult<Vec<NetworkProfile>> {
    Ok(store
        .list()?
        .into_iter()
        .filter(|profile| pattern.is_match(&profile.name))
        .collect())
}

/// Renames the record at `guid` to `canonical` if it exists under another
/// name. Returns whether a rename happened.
pub fn rename_to_canonical(store: &dyn ProfileStore, guid: &str, canonical: &str) -> RemediationResult<bool> {
    let Some(profile) = store
        .list()?
        .into_iter()
        .find(|profile| guids_equal(&profile.guid, guid))
    else {
        return Ok(false);
    };

    if profile.name == canonical {
        return Ok(false);
    }

    store.set_name(&profile.guid, canonical)?;
    info!(guid = %profile.guid, from = %profile.name, to = canonical, "profile renamed");
    Ok(true)
}

/// Writes `count` numbered duplicates of the canonical profile under fresh
/// GUIDs, the shape the client leaves behind after repeated reinstalls.
pub fn generate_test_profiles(store: &dyn ProfileStore, canonical: &str, count: usize) -> BatchReport {
    let mut report = BatchReport::default();
    for index in 0..count {
        let guid = format!("{{{}}}", uuid::Uuid::new_v4().to_string().to_uppercase());
        let name = format!("{canonical} {}", index + 2);
        match store.create(&guid, &name) {
            Ok(()) => {
                info!(guid = %guid, name = %name, "test profile created");
                report.record_success();
            }
            Err(err) => {
                warn!(guid = %guid, error = %err, "failed creating test profile");
                report.record_failure(format!("{name}: {err}"));
            }
        }
    }
    report
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileCleanupReport {
    pub active_guid: Option<String>,
    pub renamed: bool,
    pub backup: Option<PathBuf>,
    pub deletions: BatchReport,
}

pub struct ProfileCleanup<'a> {
    pub pattern: &'a Regex,
    pub canonical_name: &'a str,
    pub policy: ProfilePolicy,
    /// When set, the active profile's key is exported here before any edit.
    pub export_dir: Option<&'a Path>,
}

/// Deletes stale profiles under the given policy.
///
/// With `PreserveActive` the active record is renamed first, then excluded
/// from the deletion set; with `DeleteAll` every matching record goes.
pub fn delete_stale(
    store: &dyn ProfileStore,
    cleanup: &ProfileCleanup<'_>,
    active_guid: Option<&str>,
) -> RemediationResult<ProfileCleanupReport> {
    let mut report = ProfileCleanupReport {
        active_guid: active_guid.map(ToString::to_string),
        ..ProfileCleanupReport::default()
    };

    if let (Some(dir), Some(guid)) = (cleanup.export_dir, active_guid) {
        let exists = store.list()?.iter().any(|profile| guids_equal(&profile.guid, guid));
        if exists {
            report.backup = Some(export_profile(store, guid, dir)?);
        }
    }

    if cleanup.policy == ProfilePolicy::PreserveActive {
        if let Some(guid) = active_guid {
            report.renamed = rename_to_canonical(store, guid, cleanup.canonical_name)?;
        }
    }

    let candidates = list_by_name_pattern(store, cleanup.pattern)?;
    for profile in candidates {
        let is_active = active_guid
            .map(|guid| guids_equal(&profile.guid, guid))
            .unwrap_or(false);
        if is_active && cleanup.policy == ProfilePolicy::PreserveActive {
            continue;
        }

        match store.delete(&profile.guid) {
            Ok(()) => {
                info!(guid = %profile.guid, name = %profile.name, "profile deleted");
                report.deletions.record_success();
            }
            Err(err) => {
                warn!(guid = %profile.guid, error = %err, "profile deletion failed");
                report
                    .deletions
                    .record_failure(format!("{} ({}): {err}", profile.guid, profile.name));
            }
        }
    }

    Ok(report)
}

fn export_profile(store: &dyn ProfileStore, guid: &str, dir: &Path) -> RemediationResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let file_name = format!(
        "profile-{}-{}.reg",
        normalize_guid(guid),
        Local::now().format("%Y%m%d-%H%M%S")
    );
    let destination = dir.join(file_name);
    store.export(guid, &destination)?;
    info!(path = %destination.display(), "active profile exported");
    Ok(destination)
}

/// Profile store over the NetworkList registry hive.
pub struct RegistryProfileStore<'a> {
    runner: &'a dyn ProcessRunner,
}

impl<'a> RegistryProfileStore<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        Self { runner }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConnectionRow {
    interface_alias: Option<String>,
    #[serde(rename = "InstanceID")]
    instance_id: Option<String>,
}

fn parse_connection_rows(raw: &str) -> RemediationResult<Vec<ConnectionRow>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        Ok(serde_json::from_str(trimmed)?)
    } else {
        Ok(vec![serde_json::from_str(trimmed)?])
    }
}

impl ProfileStore for RegistryProfileStore<'_> {
    #[cfg(target_os = "windows")]
    fn list(&self) -> RemediationResult<Vec<NetworkProfile>> {
        let root = RegKey::predef(HKEY_LOCAL_MACHINE);
        let Ok(profiles) = root.open_subkey(PROFILES_KEY) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for guid in profiles.enum_keys().flatten() {
            let Ok(key) = profiles.open_subkey(&guid) else {
                continue;
            };
            let Ok(name) = key.get_value::<String, _>("ProfileName") else {
                continue;
            };
            out.push(NetworkProfile {
                registry_path: format!("HKLM\\{}\\{}", PROFILES_KEY, guid),
                name,
                guid,
            });
        }
        Ok(out)
    }

    #[cfg(not(target_os = "windows"))]
    fn list(&self) -> RemediationResult<Vec<NetworkProfile>> {
        Ok(Vec::new())
    }

    fn find_active_guid(&self, adapter_pattern: &Regex) -> RemediationResult<Option<String>> {
        let script = "$ErrorActionPreference='SilentlyContinue'; \
            Get-NetConnectionProfile | Select-Object InterfaceAlias,InstanceID | ConvertTo-Json -Compress";
        let output = self.runner.powershell(script)?;
        if !output.success() {
            return Err(RemediationError::Command(format!(
                "connection profile query failed: {}",
                output.stderr_line()
            )));
        }

        Ok(parse_connection_rows(&output.stdout)?
            .into_iter()
            .find(|row| {
                row.interface_alias
                    .as_deref()
                    .map(|alias| adapter_pattern.is_match(alias))
                    .unwrap_or(false)
            })
            .and_then(|row| row.instance_id)
            .filter(|guid| !guid.trim().is_empty()))
    }

    #[cfg(target_os = "windows")]
    fn set_name(&self, guid: &str, name: &str) -> RemediationResult<()> {
        let root = RegKey::predef(HKEY_LOCAL_MACHINE);
        let key = root.open_subkey_with_flags(format!("{}\\{}", PROFILES_KEY, guid), KEY_SET_VALUE)?;
        key.set_value("ProfileName", &name.to_string())?;
        key.set_value("Description", &name.to_string())?;
        Ok(())
    }

    #[cfg(not(target_os = "windows"))]
    fn set_name(&self, _guid: &str, _name: &str) -> RemediationResult<()> {
        Err(RemediationError::Unsupported)
    }

    #[cfg(target_os = "windows")]
    fn delete(&self, guid: &str) -> RemediationResult<()> {
        let root = RegKey::predef(HKEY_LOCAL_MACHINE);
        let profiles = root.open_subkey_with_flags(PROFILES_KEY, KEY_ALL_ACCESS)?;
        profiles.delete_subkey_all(guid)?;
        remove_signatures_for(&root, guid);
        Ok(())
    }

    #[cfg(not(target_os = "windows"))]
    fn delete(&self, _guid: &str) -> RemediationResult<()> {
        Err(RemediationError::Unsupported)
    }

    fn export(&self, guid: &str, destination: &Path) -> RemediationResult<()> {
        let output = self.runner.run(
            "reg.exe",
            &[
                "export".to_string(),
                format!("HKLM\\{}\\{}", PROFILES_KEY, guid),
                destination.to_string_lossy().to_string(),
                "/y".to_string(),
            ],
        )?;
        if !output.success() {
            return Err(RemediationError::Command(format!(
                "reg export exited with {}",
                output.code
            )));
        }
        Ok(())
    }

    #[cfg(target_os = "windows")]
    fn create(&self, guid: &str, name: &str) -> RemediationResult<()> {
        let root = RegKey::predef(HKEY_LOCAL_MACHINE);
        let (key, _) = root.create_subkey(format!("{}\\{}", PROFILES_KEY, guid))?;
        key.set_value("ProfileName", &name.to_string())?;
        key.set_value("Description", &name.to_string())?;
        key.set_value("Category", &0u32)?;
        key.set_value("Managed", &0u32)?;
        key.set_value("NameType", &53u32)?;
        Ok(())
    }

    #[cfg(not(target_os = "windows"))]
    fn create(&self, _guid: &str, _name: &str) -> RemediationResult<()> {
        Err(RemediationError::Unsupported)
    }
}

/// Signature entries pointing at a deleted profile would make the OS
/// resurrect it; drop them too.
#[cfg(target_os = "windows")]
fn remove_signatures_for(root: &RegKey, guid: &str) {
    for path in SIGNATURE_KEYS {
        let Ok(signatures) = root.open_subkey_with_flags(path, KEY_ALL_ACCESS) else {
            continue;
        };
        let names: Vec<String> = signatures.enum_keys().flatten().collect();
        for name in names {
            let Ok(entry) = signatures.open_subkey(&name) else {
                continue;
            };
            let Ok(profile_guid) = entry.get_value::<String, _>("ProfileGuid") else {
                continue;
            };
            if guids_equal(&profile_guid, guid) {
                if let Err(err) = signatures.delete_subkey_all(&name) {
                    warn!(signature = %name, error = %err, "failed removing profile signature");
                }
            }
        }
    }
}
