use tracing::{info, warn};

use crate::error::{RemediationError, RemediationResult};
use crate::system::process::{ps_quote, ProcessRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// This process holds administrative rights and may continue.
    Elevated,
    /// An elevated copy was started; this process must exit without side effects.
    Relaunched,
}

pub trait ElevationGuard {
    fn is_elevated(&self) -> bool;

    /// Starts an elevated copy of this executable with `args`. When `wait` is
    /// set the call blocks and returns the copy's exit code.
    fn relaunch_elevated(&self, args: &[String], wait: bool) -> RemediationResult<Option<i32>>;
}

/// Continues when already elevated; otherwise hands the original arguments to
/// an elevated copy and reports that this instance is done.
pub fn ensure_elevated(guard: &dyn ElevationGuard, args: &[String]) -> RemediationResult<Elevation> {
    if guard.is_elevated() {
        return Ok(Elevation::Elevated);
    }

    info!("not elevated, relaunching with administrative rights");
    guard.relaunch_elevated(args, false).map_err(|err| {
        warn!(error = %err, "elevation request failed");
        RemediationError::Elevation(err.to_string())
    })?;
    Ok(Elevation::Relaunched)
}

pub struct SystemElevation<'a> {
    runner: &'a dyn ProcessRunner,
}

impl<'a> SystemElevation<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        Self { runner }
    }
}

impl ElevationGuard for SystemElevation<'_> {
    fn is_elevated(&self) -> bool {
        is_process_elevated()
    }

    fn relaunch_elevated(&self, args: &[String], wait: bool) -> RemediationResult<Option<i32>> {
        let exe = std::env::current_exe()?;
        let mut script = format!(
            "$ErrorActionPreference='Stop'; $p = Start-Process -FilePath {} -Verb RunAs",
            ps_quote(&exe.to_string_lossy())
        );
        if !args.is_empty() {
            script.push_str(" -ArgumentList ");
            script.push_str(&ps_quote(&join_command_line(args)));
        }
        if wait {
            script.push_str(" -Wait -PassThru; exit $p.ExitCode");
        }

        let output = self.runner.powershell(&script)?;
        if wait {
            return Ok(Some(output.code));
        }
        if !output.success() {
            return Err(RemediationError::Elevation(format!(
                "elevated relaunch refused: {}",
                output.stderr_line()
            )));
        }
        Ok(None)
    }
}

/// Joins arguments into one Windows command line, quoting where needed.
pub fn join_command_line(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
                arg.clone()
            } else {
                format!("\"{}\"", arg.replace('"', "\\\""))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(target_os = "windows")]
fn is_process_elevated() -> bool {
    use std::mem::MaybeUninit;
    use std::ptr;

    unsafe {
        use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
        use windows_sys::Win32::Security::{
            GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
        };
        use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

        let mut token_handle: HANDLE = ptr::null_mut();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token_handle) == 0 {
            return false;
        }

        let mut elevation = MaybeUninit::<TOKEN_ELEVATION>::uninit();
        let mut return_length: u32 = 0;
        let result = GetTokenInformation(
            token_handle,
            TokenElevation,
            elevation.as_mut_ptr() as *mut _,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut return_length,
        );
        CloseHandle(token_handle);

        if result == 0 {
            return false;
        }
        elevation.assume_init().TokenIsElevated != 0
    }
}

#[cfg(not(target_os = "windows"))]
fn is_process_elevated() -> bool {
    false
}
