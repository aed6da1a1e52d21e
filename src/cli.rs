use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::models::Phase;

/// Repairs a broken VPN client installation across reboots.
#[derive(Parser, Debug)]
#[command(name = "vpn-remediate")]
#[command(about = "Ghost adapter, stale profile and reinstall remediation for the VPN client", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to remediation.json next to the executable)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand (defaults to `remediate --phase=fresh`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run one phase of the uninstall, cleanup and reinstall procedure
    Remediate {
        /// fresh, after-reboot-1 or after-reboot-2
        #[arg(long, default_value = "fresh")]
        phase: Phase,
    },

    /// Remove ghost adapters and stale profiles, keeping the active profile
    Cleanup {
        /// Export the active profile's registry key here before editing
        #[arg(long)]
        export_dir: Option<PathBuf>,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,

        /// Only show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove specific devices (elevated sub-invocation)
    RemoveDevices {
        #[arg(long, value_delimiter = ',', required = true)]
        instance_ids: Vec<String>,
    },

    /// Write numbered stale profiles for exercising cleanup on a lab machine
    GenerateTestProfiles {
        #[arg(long, default_value_t = 5)]
        count: usize,
    },

    /// Register numbered driverless adapters for exercising ghost cleanup
    GenerateTestDevices {
        #[arg(long, default_value_t = 5)]
        count: usize,
    },

    /// Show resume tasks, package, device and profile state, and recent steps
    Status,
}

impl Commands {
    pub fn label(&self) -> String {
        match self {
            Commands::Remediate { phase } => phase.as_flag().to_string(),
            Commands::Cleanup { .. } => "cleanup".to_string(),
            Commands::RemoveDevices { .. } => "remove-devices".to_string(),
            Commands::GenerateTestProfiles { .. } => "generate-test-profiles".to_string(),
            Commands::GenerateTestDevices { .. } => "generate-test-devices".to_string(),
            Commands::Status => "status".to_string(),
        }
    }

    /// Arguments that reproduce this command in another process.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Commands::Remediate { phase } => {
                vec!["remediate".to_string(), format!("--phase={}", phase.as_flag())]
            }
            Commands::Cleanup {
                export_dir,
                yes,
                dry_run,
            } => {
                let mut args = vec!["cleanup".to_string()];
                if let Some(dir) = export_dir {
                    args.push("--export-dir".to_string());
                    args.push(dir.to_string_lossy().to_string());
                }
                if *yes {
                    args.push("--yes".to_string());
                }
                if *dry_run {
                    args.push("--dry-run".to_string());
                }
                args
            }
            Commands::RemoveDevices { instance_ids } => vec![
                "remove-devices".to_string(),
                format!("--instance-ids={}", instance_ids.join(",")),
            ],
            Commands::GenerateTestProfiles { count } => vec![
                "generate-test-profiles".to_string(),
                format!("--count={count}"),
            ],
            Commands::GenerateTestDevices { count } => vec![
                "generate-test-devices".to_string(),
                format!("--count={count}"),
            ],
            Commands::Status => vec!["status".to_string()],
        }
    }
}

impl Cli {
    pub fn command_or_default(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Remediate {
            phase: Phase::Fresh,
        })
    }
}
