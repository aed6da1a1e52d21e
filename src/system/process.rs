use std::process::Command;

use tracing::debug;

use crate::error::{RemediationError, RemediationResult};
use crate::models::ExitDisposition;

/// Success, reboot required.
pub const EXIT_REBOOT_REQUIRED: i32 = 3010;
/// Success, installer already initiated the reboot.
pub const EXIT_REBOOT_INITIATED: i32 = 1641;
/// Another installation is already in progress.
pub const EXIT_INSTALL_IN_PROGRESS: i32 = 1618;

const CREATE_NO_WINDOW: u32 = 0x08000000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stderr_line(&self) -> &str {
        self.stderr.lines().next().unwrap_or_default().trim()
    }
}

/// Runs external commands to completion.
pub trait ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> RemediationResult<CommandOutput>;

    fn powershell(&self, script: &str) -> RemediationResult<CommandOutput> {
        self.run(
            "powershell.exe",
            &[
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-Command".to_string(),
                script.to_string(),
            ],
        )
    }

    /// Runs `program` with `raw_args` appended to its command line verbatim.
    /// For tools such as `cmd.exe` that parse their own command line and do
    /// not understand the standard argument quoting.
    fn run_raw(&self, program: &str, raw_args: &str) -> RemediationResult<CommandOutput>;

    /// Starts `program` and returns without waiting for it.
    fn spawn(&self, program: &str, args: &[String]) -> RemediationResult<()>;
}

pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> RemediationResult<CommandOutput> {
        let mut command = Command::new(program);
        command.args(args);
        execute(command, program)
    }

    fn run_raw(&self, program: &str, raw_args: &str) -> RemediationResult<CommandOutput> {
        let mut command = Command::new(program);
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            command.raw_arg(raw_args);
        }
        #[cfg(not(target_os = "windows"))]
        command.args(raw_args.split_whitespace());
        execute(command, program)
    }

    fn spawn(&self, program: &str, args: &[String]) -> RemediationResult<()> {
        Command::new(program)
            .args(args)
            .spawn()
            .map_err(|err| RemediationError::Command(format!("failed launching {program}: {err}")))?;
        debug!(program, "process started");
        Ok(())
    }
}

fn execute(mut command: Command, program: &str) -> RemediationResult<CommandOutput> {
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(target_os = "windows"))]
    let _ = CREATE_NO_WINDOW;

    let output = command
        .output()
        .map_err(|err| RemediationError::Command(format!("failed executing {program}: {err}")))?;
    // A child killed by a signal has no code; treat it as a generic failure.
    let code = output.status.code().unwrap_or(-1);
    debug!(program, code, "command finished");

    Ok(CommandOutput {
        code,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

pub fn classify_exit_code(code: i32) -> ExitDisposition {
    match code {
        0 => ExitDisposition::Success,
        EXIT_REBOOT_REQUIRED | EXIT_REBOOT_INITIATED => ExitDisposition::SuccessRebootRequired,
        EXIT_INSTALL_IN_PROGRESS => ExitDisposition::Busy,
        other => ExitDisposition::Failed(other),
    }
}

/// Quotes a value for a single-quoted PowerShell string literal.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installer_codes() {
        assert_eq!(classify_exit_code(0), ExitDisposition::Success);
        assert_eq!(classify_exit_code(3010), ExitDisposition::SuccessRebootRequired);
        assert_eq!(classify_exit_code(1641), ExitDisposition::SuccessRebootRequired);
        assert_eq!(classify_exit_code(1618), ExitDisposition::Busy);
        assert_eq!(classify_exit_code(1603), ExitDisposition::Failed(1603));
        assert!(classify_exit_code(3010).is_success());
        assert!(!classify_exit_code(1618).is_success());
    }

    #[test]
    fn powershell_literal_escapes_quotes() {
        assert_eq!(ps_quote("O'Brien"), "'O''Brien'");
    }
}
