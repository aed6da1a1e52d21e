use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{RemediationError, RemediationResult};
use crate::models::{BatchReport, Device, DeviceHealth};
use crate::system::process::ProcessRunner;

pub trait DeviceInventory {
    /// Every network device whose friendly name matches. Empty is not an error.
    fn list_by_name(&self, pattern: &Regex) -> RemediationResult<Vec<Device>>;

    fn remove(&self, instance_id: &str) -> RemediationResult<()>;

    /// Registers a root-enumerated network device with no driver, which the
    /// inventory then reports as a ghost. Returns its instance id.
    fn create_placeholder(&self, friendly_name: &str) -> RemediationResult<String>;
}

pub fn list_ghosts(inventory: &dyn DeviceInventory, pattern: &Regex) -> RemediationResult<Vec<Device>> {
    Ok(inventory
        .list_by_name(pattern)?
        .into_iter()
        .filter(|device| device.health() == DeviceHealth::Ghost)
        .collect())
}

pub fn has_healthy_device(inventory: &dyn DeviceInventory, pattern: &Regex) -> RemediationResult<bool> {
    Ok(inventory
        .list_by_name(pattern)?
        .iter()
        .any(|device| device.health() == DeviceHealth::Healthy))
}

/// Removes each device in turn. Failures are counted, never short-circuit.
pub fn remove_devices<'a, I>(inventory: &dyn DeviceInventory, instance_ids: I) -> BatchReport
where
    I: IntoIterator<Item = &'a str>,
{
    let mut report = BatchReport::default();
    for instance_id in instance_ids {
        match inventory.remove(instance_id) {
            Ok(()) => {
                info!(instance_id, "device removed");
                report.record_success();
            }
            Err(err) => {
                warn!(instance_id, error = %err, "device removal failed");
                report.record_failure(format!("{instance_id}: {err}"));
            }
        }
    }
    report
}

/// Creates `count` placeholder devices named `<base_name> #<n>` so the ghost
/// cleanup path can be exercised on a lab machine.
pub fn generate_test_devices(inventory: &dyn DeviceInventory, base_name: &str, count: usize) -> BatchReport {
    let mut report = BatchReport::default();
    for index in 1..=count {
        let name = format!("{base_name} #{index}");
        match inventory.create_placeholder(&name) {
            Ok(instance_id) => {
                info!(name = %name, instance_id = %instance_id, "test device created");
                report.record_success();
            }
            Err(err) => {
                warn!(name = %name, error = %err, "failed creating test device");
                report.record_failure(format!("{name}: {err}"));
            }
        }
    }
    report
}

/// Device inventory backed by the PnP cmdlets and `pnputil`.
pub struct PnpDeviceInventory<'a> {
    runner: &'a dyn ProcessRunner,
}

impl<'a> PnpDeviceInventory<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        Self { runner }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PnpRow {
    friendly_name: Option<String>,
    instance_id: Option<String>,
    status: Option<String>,
}

impl DeviceInventory for PnpDeviceInventory<'_> {
    fn list_by_name(&self, pattern: &Regex) -> RemediationResult<Vec<Device>> {
        let script = "$ErrorActionPreference='SilentlyContinue'; \
            Get-PnpDevice -Class Net | Select-Object FriendlyName,InstanceId,Status | ConvertTo-Json -Compress";
        let output = self.runner.powershell(script)?;
        if !output.success() {
            return Err(RemediationError::Command(format!(
                "device enumeration failed: {}",
                output.stderr_line()
            )));
        }

        Ok(parse_pnp_devices(&output.stdout)?
            .into_iter()
            .filter(|device| pattern.is_match(&device.friendly_name))
            .collect())
    }

    fn remove(&self, instance_id: &str) -> RemediationResult<()> {
        let output = self.runner.run(
            "pnputil.exe",
            &["/remove-device".to_string(), instance_id.to_string()],
        )?;
        if !output.success() {
            return Err(RemediationError::Command(format!(
                "pnputil exited with {}",
                output.code
            )));
        }
        Ok(())
    }

    #[cfg(target_os = "windows")]
    fn create_placeholder(&self, friendly_name: &str) -> RemediationResult<String> {
        register_root_net_device(friendly_name)
    }

    #[cfg(not(target_os = "windows"))]
    fn create_placeholder(&self, _friendly_name: &str) -> RemediationResult<String> {
        Err(RemediationError::Unsupported)
    }
}

#[cfg(target_os = "windows")]
const PLACEHOLDER_HARDWARE_ID: &str = "ROOT\\VpnRemediateTestAdapter";

#[cfg(target_os = "windows")]
fn register_root_net_device(friendly_name: &str) -> RemediationResult<String> {
    use windows_sys::core::GUID;
    use windows_sys::Win32::Devices::DeviceAndDriverInstallation::{
        SetupDiCallClassInstaller, SetupDiCreateDeviceInfoList, SetupDiCreateDeviceInfoW,
        SetupDiDestroyDeviceInfoList, SetupDiGetDeviceInstanceIdW, SetupDiSetDeviceRegistryPropertyW,
        DICD_GENERATE_ID, DIF_REGISTERDEVICE, HDEVINFO, SPDRP_FRIENDLYNAME, SPDRP_HARDWAREID,
        SP_DEVINFO_DATA,
    };
    use windows_sys::Win32::Foundation::{GetLastError, HWND, INVALID_HANDLE_VALUE};

    const NET_CLASS: GUID = GUID::from_u128(0x4d36e972_e325_11ce_bfc1_08002be10318);

    fn wide(value: &str) -> Vec<u16> {
        value.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn last_error(call: &str) -> RemediationError {
        let code = unsafe { GetLastError() };
        RemediationError::Command(format!("{call} failed with error {code}"))
    }

    let device_name = wide("Net");
    let display_name = wide(friendly_name);
    // REG_MULTI_SZ: the id plus the list terminator.
    let mut hardware_id = wide(PLACEHOLDER_HARDWARE_ID);
    hardware_id.push(0);
    let no_window = 0 as HWND;

    unsafe {
        let set = SetupDiCreateDeviceInfoList(&NET_CLASS, no_window);
        if set == INVALID_HANDLE_VALUE as HDEVINFO {
            return Err(last_error("SetupDiCreateDeviceInfoList"));
        }

        let result = (|| {
            let mut data: SP_DEVINFO_DATA = std::mem::zeroed();
            data.cbSize = std::mem::size_of::<SP_DEVINFO_DATA>() as u32;

            if SetupDiCreateDeviceInfoW(
                set,
                device_name.as_ptr(),
                &NET_CLASS,
                display_name.as_ptr(),
                no_window,
                DICD_GENERATE_ID,
                &mut data,
            ) == 0
            {
                return Err(last_error("SetupDiCreateDeviceInfoW"));
            }

            for (property, value) in [(SPDRP_HARDWAREID, &hardware_id), (SPDRP_FRIENDLYNAME, &display_name)] {
                if SetupDiSetDeviceRegistryPropertyW(
                    set,
                    &mut data,
                    property,
                    value.as_ptr() as *const u8,
                    (value.len() * std::mem::size_of::<u16>()) as u32,
                ) == 0
                {
                    return Err(last_error("SetupDiSetDeviceRegistryPropertyW"));
                }
            }

            if SetupDiCallClassInstaller(DIF_REGISTERDEVICE, set, &data) == 0 {
                return Err(last_error("SetupDiCallClassInstaller"));
            }

            let mut buffer = [0u16; 512];
            let mut required = 0u32;
            if SetupDiGetDeviceInstanceIdW(set, &data, buffer.as_mut_ptr(), buffer.len() as u32, &mut required) == 0 {
                return Err(last_error("SetupDiGetDeviceInstanceIdW"));
            }
            let length = buffer.iter().position(|unit| *unit == 0).unwrap_or(buffer.len());
            Ok(String::from_utf16_lossy(&buffer[..length]))
        })();

        SetupDiDestroyDeviceInfoList(set);
        result
    }
}

/// `ConvertTo-Json` emits nothing for no rows, an object for one row and an
/// array otherwise.
fn parse_pnp_devices(raw: &str) -> RemediationResult<Vec<Device>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let rows: Vec<PnpRow> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        vec![serde_json::from_str(trimmed)?]
    };

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let instance_id = row.instance_id.filter(|id| !id.trim().is_empty())?;
            Some(Device {
                friendly_name: row.friendly_name.unwrap_or_default(),
                instance_id,
                status: row.status,
            })
        })
        .collect())
}
