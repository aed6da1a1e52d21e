#[cfg(target_os = "windows")]
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::Path;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{RemediationError, RemediationResult};
use crate::models::PackageInfo;
use crate::system::process::ProcessRunner;

#[cfg(target_os = "windows")]
use winreg::{enums::*, RegKey, HKEY};

pub trait PackageManager {
    /// Every installed product whose display name matches, across the 64-bit,
    /// 32-bit and per-user uninstall views.
    fn find_all(&self, pattern: &Regex) -> RemediationResult<Vec<PackageInfo>>;

    /// Blocks until the uninstaller exits and returns its exit code.
    fn uninstall(&self, package: &PackageInfo) -> RemediationResult<i32>;

    /// Blocks until the installer exits and returns its exit code.
    fn install(&self, installer: &Path, args: &[String]) -> RemediationResult<i32>;

    /// Downloads the installer and returns its SHA-256 hex digest.
    fn download(&self, url: &str, destination: &Path) -> RemediationResult<String>;

    /// Writes the target network into the client's configuration of record.
    fn apply_network_identity(&self, network: &str) -> RemediationResult<()>;
}

pub fn find_installed(manager: &dyn PackageManager, pattern: &Regex) -> RemediationResult<Option<PackageInfo>> {
    Ok(manager.find_all(pattern)?.into_iter().next())
}

pub fn verify_presence(manager: &dyn PackageManager, pattern: &Regex) -> RemediationResult<bool> {
    Ok(!manager.find_all(pattern)?.is_empty())
}

pub fn verify_absence(manager: &dyn PackageManager, pattern: &Regex) -> RemediationResult<bool> {
    Ok(manager.find_all(pattern)?.is_empty())
}

/// Silent MSI arguments that bind the client to `network`.
pub fn install_arguments(network: &str) -> Vec<String> {
    vec![
        "/qn".to_string(),
        "/norestart".to_string(),
        format!("network={network}"),
        "auto_update=true".to_string(),
    ]
}

pub struct RegistryPackageManager<'a> {
    runner: &'a dyn ProcessRunner,
    client_registry_key: String,
}

impl<'a> RegistryPackageManager<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, client_registry_key: &str) -> Self {
        Self {
            runner,
            client_registry_key: client_registry_key.to_string(),
        }
    }
}

impl PackageManager for RegistryPackageManager<'_> {
    #[cfg(target_os = "windows")]
    fn find_all(&self, pattern: &Regex) -> RemediationResult<Vec<PackageInfo>> {
        let mut packages = Vec::new();
        let mut seen = HashSet::new();

        collect_from_hive(HKEY_LOCAL_MACHINE, "SOFTWARE\\Microsoft\\Windows\\CurrentVersion\\Uninstall", "HKLM", pattern, &mut packages, &mut seen);
        collect_from_hive(HKEY_LOCAL_MACHINE, "SOFTWARE\\WOW6432Node\\Microsoft\\Windows\\CurrentVersion\\Uninstall", "HKLM-WOW6432", pattern, &mut packages, &mut seen);
        collect_from_hive(HKEY_CURRENT_USER, "SOFTWARE\\Microsoft\\Windows\\CurrentVersion\\Uninstall", "HKCU", pattern, &mut packages, &mut seen);

        Ok(packages)
    }

    #[cfg(not(target_os = "windows"))]
    fn find_all(&self, _pattern: &Regex) -> RemediationResult<Vec<PackageInfo>> {
        Ok(Vec::new())
    }

    fn uninstall(&self, package: &PackageInfo) -> RemediationResult<i32> {
        let output = if package.is_msi() {
            self.runner.run(
                "msiexec.exe",
                &[
                    "/x".to_string(),
                    package.product_code.clone(),
                    "/qn".to_string(),
                    "/norestart".to_string(),
                ],
            )?
        } else {
            let command = package
                .quiet_uninstall_string
                .clone()
                .or_else(|| package.uninstall_string.clone())
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| {
                    RemediationError::Command(format!("{} has no uninstall command", package.name))
                })?;
            self.runner.run_raw("cmd.exe", &cmd_payload(&command))?
        };
        info!(package = %package.name, code = output.code, "uninstaller finished");
        Ok(output.code)
    }

    fn install(&self, installer: &Path, args: &[String]) -> RemediationResult<i32> {
        let mut full_args = vec!["/i".to_string(), installer.to_string_lossy().to_string()];
        full_args.extend(args.iter().cloned());
        let output = self.runner.run("msiexec.exe", &full_args)?;
        info!(installer = %installer.display(), code = output.code, "installer finished");
        Ok(output.code)
    }

    fn download(&self, url: &str, destination: &Path) -> RemediationResult<String> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut response = reqwest::blocking::get(url)?.error_for_status()?;
        let mut file = File::create(destination)?;
        let mut buffer = [0u8; 8192];
        loop {
            let read = response.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])?;
        }
        file.flush()?;
        drop(file);

        let digest = compute_sha256(destination)?;
        info!(url, path = %destination.display(), sha256 = %digest, "installer downloaded");
        Ok(digest)
    }

    #[cfg(target_os = "windows")]
    fn apply_network_identity(&self, network: &str) -> RemediationResult<()> {
        let root = RegKey::predef(HKEY_LOCAL_MACHINE);
        let (key, _) = root.create_subkey(&self.client_registry_key)?;
        key.set_value("Network", &network.to_string())?;
        info!(network, key = %self.client_registry_key, "network identity applied");
        Ok(())
    }

    #[cfg(not(target_os = "windows"))]
    fn apply_network_identity(&self, _network: &str) -> RemediationResult<()> {
        let _ = &self.client_registry_key;
        Err(RemediationError::Unsupported)
    }
}

#[cfg(target_os = "windows")]
fn collect_from_hive(
    hive: HKEY,
    path: &str,
    source: &str,
    pattern: &Regex,
    out: &mut Vec<PackageInfo>,
    seen: &mut HashSet<String>,
) {
    let root = RegKey::predef(hive);
    let Ok(uninstall) = root.open_subkey(path) else {
        return;
    };

    for key_name in uninstall.enum_keys().flatten() {
        let Ok(app_key) = uninstall.open_subkey(&key_name) else {
            continue;
        };
        let Ok(name) = app_key.get_value::<String, _>("DisplayName") else {
            continue;
        };
        if name.trim().is_empty() || !pattern.is_match(&name) {
            continue;
        }
        if !seen.insert(key_name.to_lowercase()) {
            continue;
        }

        out.push(PackageInfo {
            name,
            version: app_key.get_value::<String, _>("DisplayVersion").ok(),
            publisher: app_key.get_value::<String, _>("Publisher").ok(),
            product_code: key_name,
            uninstall_string: app_key.get_value::<String, _>("UninstallString").ok(),
            quiet_uninstall_string: app_key.get_value::<String, _>("QuietUninstallString").ok(),
            source: source.to_string(),
        });
    }
}

/// `cmd /S /C` strips exactly the outer pair of quotes and runs the rest
/// unchanged, so uninstall strings keep their own quoting.
fn cmd_payload(command: &str) -> String {
    format!("/D /S /C \"{}\"", command.trim())
}

pub fn compute_sha256(path: &Path) -> RemediationResult<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
