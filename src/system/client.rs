use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use sysinfo::System;
use tracing::{debug, info, warn};

use crate::config::RemediationConfig;
use crate::error::{RemediationError, RemediationResult};
use crate::system::process::{ps_quote, ProcessRunner};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Control over the VPN client's own processes and service.
pub trait ClientControl {
    /// Stops the service and kills remaining client processes. Does not verify.
    fn stop(&self) -> RemediationResult<()>;

    /// Names of client processes still running.
    fn running_processes(&self) -> Vec<String>;

    /// Starts the service if it is not running, then the client UI.
    fn start(&self) -> RemediationResult<()>;

    /// Whether the internal connectivity endpoint accepts a connection.
    fn endpoint_reachable(&self) -> bool;
}

pub trait PowerControl {
    fn reboot(&self, delay_seconds: u64, reason: &str) -> RemediationResult<()>;
}

pub struct SystemClient<'a> {
    runner: &'a dyn ProcessRunner,
    process_names: Vec<String>,
    service_name: String,
    executable: String,
    connectivity_endpoint: String,
}

impl<'a> SystemClient<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, config: &RemediationConfig) -> Self {
        Self {
            runner,
            process_names: config
                .client_process_names
                .iter()
                .map(|name| name.to_lowercase())
                .collect(),
            service_name: config.client_service_name.clone(),
            executable: config.client_executable.clone(),
            connectivity_endpoint: config.connectivity_endpoint.clone(),
        }
    }

    fn is_client_process(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.process_names.iter().any(|candidate| *candidate == lower)
    }
}

impl ClientControl for SystemClient<'_> {
    fn stop(&self) -> RemediationResult<()> {
        if !self.service_name.is_empty() {
            let script = format!(
                "$s = Get-Service -Name {} -ErrorAction SilentlyContinue; \
                 if ($s -and $s.Status -ne 'Stopped') {{ Stop-Service -InputObject $s -Force -ErrorAction Stop }}",
                ps_quote(&self.service_name)
            );
            let output = self.runner.powershell(&script)?;
            if !output.success() {
                warn!(service = %self.service_name, error = output.stderr_line(), "service stop reported failure");
            }
        }

        let mut system = System::new_all();
        system.refresh_all();
        for (pid, process) in system.processes() {
            let name = process.name().to_string_lossy().to_string();
            if !self.is_client_process(&name) {
                continue;
            }
            if process.kill() {
                info!(pid = pid.as_u32(), name = %name, "client process killed");
            } else {
                warn!(pid = pid.as_u32(), name = %name, "failed to kill client process");
            }
        }
        Ok(())
    }

    fn running_processes(&self) -> Vec<String> {
        let mut system = System::new_all();
        system.refresh_all();
        system
            .processes()
            .values()
            .map(|process| process.name().to_string_lossy().to_string())
            .filter(|name| self.is_client_process(name))
            .collect()
    }

    fn start(&self) -> RemediationResult<()> {
        if !self.service_name.is_empty() {
            let script = format!(
                "$s = Get-Service -Name {} -ErrorAction Stop; \
                 if ($s.Status -ne 'Running') {{ Start-Service -InputObject $s -ErrorAction Stop }}",
                ps_quote(&self.service_name)
            );
            let output = self.runner.powershell(&script)?;
            if !output.success() {
                return Err(RemediationError::Command(format!(
                    "starting service {} failed: {}",
                    self.service_name,
                    output.stderr_line()
                )));
            }
            info!(service = %self.service_name, "client service running");
        }

        self.runner.spawn(&self.executable, &[])?;
        info!(executable = %self.executable, "client launched");
        Ok(())
    }

    fn endpoint_reachable(&self) -> bool {
        if self.connectivity_endpoint.trim().is_empty() {
            debug!("no connectivity endpoint configured, skipping reachability check");
            return true;
        }
        tcp_reachable(&self.connectivity_endpoint, CONNECT_TIMEOUT)
    }
}

pub fn tcp_reachable(endpoint: &str, timeout: Duration) -> bool {
    let Ok(addresses) = endpoint.to_socket_addrs() else {
        debug!(endpoint, "connectivity endpoint did not resolve");
        return false;
    };
    addresses
        .into_iter()
        .any(|address| TcpStream::connect_timeout(&address, timeout).is_ok())
}

pub struct SystemPower<'a> {
    runner: &'a dyn ProcessRunner,
}

impl<'a> SystemPower<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        Self { runner }
    }
}

impl PowerControl for SystemPower<'_> {
    fn reboot(&self, delay_seconds: u64, reason: &str) -> RemediationResult<()> {
        let output = self.runner.run(
            "shutdown.exe",
            &[
                "/r".to_string(),
                "/t".to_string(),
                delay_seconds.to_string(),
                "/c".to_string(),
                reason.to_string(),
            ],
        )?;
        if !output.success() {
            return Err(RemediationError::Command(format!(
                "shutdown exited with {}: {}",
                output.code,
                output.stderr_line()
            )));
        }
        info!(delay_seconds, "reboot scheduled");
        Ok(())
    }
}
