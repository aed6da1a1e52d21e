use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use vpn_remediate::cleanup::{run_cleanup, Patterns};
use vpn_remediate::cli::{Cli, Commands};
use vpn_remediate::config::RemediationConfig;
use vpn_remediate::logging;
use vpn_remediate::models::{BatchReport, DeviceHealth, Phase, RunOutcome};
use vpn_remediate::orchestrator::{Orchestrator, RemediationRun};
use vpn_remediate::storage::RunJournal;
use vpn_remediate::system::client::{SystemClient, SystemPower};
use vpn_remediate::system::devices::{
    generate_test_devices, list_ghosts, remove_devices, DeviceInventory, PnpDeviceInventory,
};
use vpn_remediate::system::elevation::{ensure_elevated, Elevation, ElevationGuard, SystemElevation};
use vpn_remediate::system::packages::{find_installed, RegistryPackageManager};
use vpn_remediate::system::process::SystemProcessRunner;
use vpn_remediate::system::profiles::{
    generate_test_profiles, guids_equal, list_by_name_pattern, ProfileStore, RegistryProfileStore,
};
use vpn_remediate::system::tasks::{current_identity, ScheduledResume, Schtasks};
use vpn_remediate::system::Host;

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("vpn-remediate: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let command = cli.command_or_default();
    let config_path = cli.config.as_deref().map(absolute_path).transpose()?;
    let config = RemediationConfig::load(config_path.as_deref())?;

    let _guard = match logging::init_logging(&config.log_directory(), &command.label()) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("file logging unavailable: {err:#}");
            None
        }
    };

    // Arguments a relaunched or resumed copy needs to find the same config.
    let config_args: Vec<String> = config_path
        .iter()
        .flat_map(|path| ["--config".to_string(), path.to_string_lossy().to_string()])
        .collect();
    let forwarded = |command: &Commands| {
        let mut args = config_args.clone();
        args.extend(command.to_args());
        args
    };

    let runner = SystemProcessRunner;
    let elevation = SystemElevation::new(&runner);
    let devices = PnpDeviceInventory::new(&runner);
    let profiles = RegistryProfileStore::new(&runner);
    let packages = RegistryPackageManager::new(&runner, &config.client_registry_key);
    let scheduler = Schtasks::new(&runner);
    let exe = std::env::current_exe().context("failed to resolve own executable path")?;
    let resume = ScheduledResume::new(
        &scheduler,
        exe.to_string_lossy().to_string(),
        config_args.clone(),
        current_identity(),
    );
    let client = SystemClient::new(&runner, &config);
    let power = SystemPower::new(&runner);
    let host = Host {
        devices: &devices,
        profiles: &profiles,
        packages: &packages,
        tasks: &scheduler,
        resume: &resume,
        client: &client,
        power: &power,
    };

    info!(command = %command.label(), version = env!("CARGO_PKG_VERSION"), "vpn-remediate starting");

    match &command {
        Commands::Remediate { phase } => {
            if !elevate_or_handoff(&elevation, &forwarded(&command), &config)? {
                return Ok(0);
            }
            remediate(host, &config, *phase)
        }
        Commands::Cleanup {
            export_dir,
            yes,
            dry_run,
        } => cleanup(
            &devices,
            &profiles,
            &elevation,
            &config,
            export_dir.as_deref(),
            *yes,
            *dry_run,
            &forwarded,
        ),
        Commands::RemoveDevices { instance_ids } => {
            if !elevate_or_handoff(&elevation, &forwarded(&command), &config)? {
                return Ok(0);
            }
            let report = remove_devices(&devices, instance_ids.iter().map(String::as_str));
            for failure in &report.failures {
                println!("failed: {failure}");
            }
            println!("removed {} of {} device(s)", report.succeeded, report.attempted);
            Ok(if report.is_clean() { 0 } else { 1 })
        }
        Commands::GenerateTestProfiles { count } => {
            if !elevate_or_handoff(&elevation, &forwarded(&command), &config)? {
                return Ok(0);
            }
            let report = generate_test_profiles(&profiles, &config.canonical_profile_name, *count);
            print_generated(&report, "test profile(s)")
        }
        Commands::GenerateTestDevices { count } => {
            if !elevate_or_handoff(&elevation, &forwarded(&command), &config)? {
                return Ok(0);
            }
            let report = generate_test_devices(&devices, &config.test_device_name, *count);
            print_generated(&report, "test device(s)")
        }
        Commands::Status => status(host, &config),
    }
}

/// Returns true when this process may continue; false once an elevated copy
/// has been started in its place.
fn elevate_or_handoff(
    guard: &dyn ElevationGuard,
    args: &[String],
    config: &RemediationConfig,
) -> anyhow::Result<bool> {
    match ensure_elevated(guard, args) {
        Ok(Elevation::Elevated) => Ok(true),
        Ok(Elevation::Relaunched) => {
            info!("elevated copy started, exiting");
            Ok(false)
        }
        Err(err) => {
            error!(error = %err, "administrative rights are required");
            eprintln!("Administrative rights are required: {err}");
            pause(config);
            Err(err.into())
        }
    }
}

fn remediate(host: Host<'_>, config: &RemediationConfig, phase: Phase) -> anyhow::Result<i32> {
    let journal = match RunJournal::open(config.journal_path()) {
        Ok(journal) => Some(journal),
        Err(err) => {
            warn!(error = %err, "run journal unavailable, continuing without it");
            None
        }
    };

    let orchestrator = Orchestrator::new(host, config)?;
    let mut run = RemediationRun::new(phase, journal);
    let outcome = orchestrator.run(&mut run);

    match &outcome {
        RunOutcome::RebootPending { next } => {
            println!(
                "Phase {phase} complete. Restarting in {}s; remediation continues with {next} at next logon.",
                config.reboot_delay_seconds
            );
        }
        RunOutcome::Completed => println!("Remediation complete."),
        RunOutcome::CompletedDegraded { warnings } => {
            println!("Remediation complete with warnings. Verify the client manually:");
            for warning in warnings {
                println!("  - {warning}");
            }
        }
        RunOutcome::Failed { step, reason } => {
            eprintln!("Remediation failed at step '{step}': {reason}");
            eprintln!("Logs: {}", config.log_directory().display());
            pause(config);
        }
    }
    Ok(outcome.exit_code())
}

#[allow(clippy::too_many_arguments)]
fn cleanup(
    devices: &dyn DeviceInventory,
    profiles: &dyn ProfileStore,
    elevation: &dyn ElevationGuard,
    config: &RemediationConfig,
    export_dir: Option<&Path>,
    yes: bool,
    dry_run: bool,
    forwarded: &dyn Fn(&Commands) -> Vec<String>,
) -> anyhow::Result<i32> {
    let patterns = Patterns::from_config(config)?;

    let ghosts = list_ghosts(devices, &patterns.adapter)?;
    let candidates = list_by_name_pattern(profiles, &patterns.profile)?;
    let active = profiles.find_active_guid(&patterns.adapter)?;

    println!("Ghost adapters ({}):", ghosts.len());
    for device in &ghosts {
        println!(
            "  {} [{}] status={}",
            device.friendly_name,
            device.instance_id,
            device.status.as_deref().unwrap_or("unknown")
        );
    }
    println!("Matching profiles ({}):", candidates.len());
    let mut pending = ghosts.len();
    for profile in &candidates {
        let is_active = active.as_deref().is_some_and(|guid| guids_equal(guid, &profile.guid));
        let action = if !is_active {
            pending += 1;
            "delete".to_string()
        } else if profile.name != config.canonical_profile_name {
            pending += 1;
            format!("keep (active), rename to {}", config.canonical_profile_name)
        } else {
            "keep (active)".to_string()
        };
        println!("  {} {} -> {action}", profile.guid, profile.name);
    }

    if dry_run {
        return Ok(0);
    }
    if pending == 0 {
        println!("Nothing to clean up.");
        return Ok(0);
    }
    if !yes && !confirm("Proceed with cleanup?")? {
        println!("Cancelled.");
        return Ok(1);
    }

    if !elevation.is_elevated() {
        let command = Commands::Cleanup {
            export_dir: export_dir.map(absolute_path).transpose()?,
            yes: true,
            dry_run: false,
        };
        info!("cleanup needs administrative rights, handing off to an elevated copy");
        let code = elevation.relaunch_elevated(&forwarded(&command), true)?;
        return Ok(code.unwrap_or(1));
    }

    let report = run_cleanup(devices, profiles, &patterns, config, export_dir)?;
    if let Some(backup) = &report.profiles.backup {
        println!("Active profile exported to {}", backup.display());
    }
    println!(
        "Removed {} ghost adapter(s), deleted {} profile(s), {} failure(s).",
        report.devices.succeeded,
        report.profiles.deletions.succeeded,
        report.failed()
    );
    for failure in report.devices.failures.iter().chain(&report.profiles.deletions.failures) {
        println!("  failed: {failure}");
    }
    Ok(if report.failed() == 0 { 0 } else { 1 })
}

fn print_generated(report: &BatchReport, what: &str) -> anyhow::Result<i32> {
    for failure in &report.failures {
        println!("failed: {failure}");
    }
    println!("created {} of {} {what}", report.succeeded, report.attempted);
    Ok(if report.is_clean() { 0 } else { 1 })
}

fn status(host: Host<'_>, config: &RemediationConfig) -> anyhow::Result<i32> {
    let patterns = Patterns::from_config(config)?;

    match host.resume.pending() {
        Ok(pending) if pending.is_empty() => println!("Resume: none pending"),
        Ok(pending) => {
            let phases: Vec<String> = pending.iter().map(ToString::to_string).collect();
            println!("Resume: pending {}", phases.join(", "));
        }
        Err(err) => println!("Resume: unknown ({err})"),
    }

    match find_installed(host.packages, &patterns.product) {
        Ok(Some(package)) => println!(
            "Package: {} {}",
            package.name,
            package.version.as_deref().unwrap_or("")
        ),
        Ok(None) => println!("Package: not installed"),
        Err(err) => println!("Package: unknown ({err})"),
    }

    match host.devices.list_by_name(&patterns.adapter) {
        Ok(found) => {
            let ghosts = found.iter().filter(|d| d.health() == DeviceHealth::Ghost).count();
            println!("Adapters: {} total, {ghosts} ghost", found.len());
        }
        Err(err) => println!("Adapters: unknown ({err})"),
    }

    match list_by_name_pattern(host.profiles, &patterns.profile) {
        Ok(found) => {
            println!("Profiles: {}", found.len());
            for profile in found {
                println!("  {} {}", profile.guid, profile.name);
            }
        }
        Err(err) => println!("Profiles: unknown ({err})"),
    }

    match RunJournal::open(config.journal_path()).and_then(|journal| journal.recent(20)) {
        Ok(records) if !records.is_empty() => {
            println!("Recent steps:");
            for record in records {
                println!(
                    "  {} {:<16} {:<20} {:?} {}",
                    record.timestamp_utc, record.phase, record.step, record.disposition, record.detail
                );
            }
        }
        Ok(_) => println!("Recent steps: none"),
        Err(err) => println!("Recent steps: unavailable ({err:#})"),
    }
    Ok(0)
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush().context("failed to flush prompt")?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// Keeps the console open long enough for an operator to read the failure.
fn pause(config: &RemediationConfig) {
    if config.fatal_pause_seconds > 0 {
        std::thread::sleep(Duration::from_secs(config.fatal_pause_seconds));
    }
}

/// Elevated copies and resume tasks start in a different working directory.
fn absolute_path(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    Ok(cwd.join(path))
}
