//! The resumable remediation state machine.
//!
//! Each invocation runs exactly one phase, selected by the `--phase` flag.
//! A phase that ends in a reboot first commits the next phase as a resume
//! point; if that commit fails the reboot is never issued.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::cleanup::{run_cleanup, Patterns};
use crate::config::RemediationConfig;
use crate::error::{RemediationError, RemediationResult};
use crate::models::{
    ExitDisposition, Phase, ProfilePolicy, RunOutcome, StepDisposition, StepRecord,
};
use crate::retry::{retry, RetryPolicy};
use crate::storage::RunJournal;
use crate::system::devices::has_healthy_device;
use crate::system::packages::{find_installed, install_arguments, verify_absence, verify_presence};
use crate::system::process::classify_exit_code;
use crate::system::profiles::{delete_stale, ProfileCleanup};
use crate::system::Host;

/// One end-to-end attempt of a single phase.
pub struct RemediationRun {
    pub run_id: String,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    records: Vec<StepRecord>,
    journal: Option<RunJournal>,
}

impl RemediationRun {
    pub fn new(phase: Phase, journal: Option<RunJournal>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            phase,
            started_at: Utc::now(),
            records: Vec::new(),
            journal,
        }
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn record(&mut self, step: &str, disposition: StepDisposition, detail: impl Into<String>) {
        let record = StepRecord {
            run_id: self.run_id.clone(),
            phase: self.phase,
            step: step.to_string(),
            disposition,
            detail: detail.into(),
            timestamp_utc: Utc::now().to_rfc3339(),
        };
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.append(&record) {
                warn!(error = %err, "failed writing step to run journal");
            }
        }
        self.records.push(record);
    }
}

#[derive(Debug)]
struct StepFailure {
    step: String,
    reason: String,
}

type PhaseResult = Result<RunOutcome, StepFailure>;

pub struct Orchestrator<'a> {
    host: Host<'a>,
    config: &'a RemediationConfig,
    patterns: Patterns,
}

impl<'a> Orchestrator<'a> {
    pub fn new(host: Host<'a>, config: &'a RemediationConfig) -> RemediationResult<Self> {
        Ok(Self {
            host,
            config,
            patterns: Patterns::from_config(config)?,
        })
    }

    pub fn run(&self, run: &mut RemediationRun) -> RunOutcome {
        info!(phase = %run.phase, run_id = %run.run_id, "remediation phase starting");
        let result = match run.phase {
            Phase::Fresh => self.fresh(run),
            Phase::AfterReboot1 => self.after_reboot_1(run),
            Phase::AfterReboot2 => self.after_reboot_2(run),
        };

        let outcome = result.unwrap_or_else(|failure| RunOutcome::Failed {
            step: failure.step,
            reason: failure.reason,
        });
        let elapsed = Utc::now().signed_duration_since(run.started_at);
        info!(phase = %run.phase, outcome = ?outcome, elapsed_secs = elapsed.num_seconds(), "remediation phase finished");
        outcome
    }

    fn fresh(&self, run: &mut RemediationRun) -> PhaseResult {
        self.fatal(run, "stop-client", self.stop_client())?;
        let detail = self.fatal(run, "uninstall", self.uninstall_package())?;
        info!(detail = %detail, "uninstall step resolved");

        let absent = verify_absence(self.host.packages, &self.patterns.product).and_then(|absent| {
            if absent {
                Ok(())
            } else {
                Err(RemediationError::Precondition(
                    "package still registered after uninstall".to_string(),
                ))
            }
        });
        self.fatal(run, "verify-uninstall", absent)?;

        let backup_dir = self.config.backup_directory();
        let report = self.fatal(
            run,
            "cleanup",
            run_cleanup(
                self.host.devices,
                self.host.profiles,
                &self.patterns,
                self.config,
                Some(backup_dir.as_path()),
            )
            .and_then(|report| report.into_result()),
        )?;
        info!(
            ghosts = report.ghosts.len(),
            renamed = report.profiles.renamed,
            profiles_deleted = report.profiles.deletions.succeeded,
            "pre-reinstall cleanup complete"
        );

        self.commit_and_reboot(run)
    }

    fn after_reboot_1(&self, run: &mut RemediationRun) -> PhaseResult {
        self.fatal(run, "consume-resume", self.host.resume.consume(Phase::AfterReboot1))?;

        // Fresh slate: the new install creates its own profile on first connect.
        let cleanup = ProfileCleanup {
            pattern: &self.patterns.profile,
            canonical_name: &self.config.canonical_profile_name,
            policy: ProfilePolicy::DeleteAll,
            export_dir: None,
        };
        self.fatal(
            run,
            "delete-profiles",
            delete_stale(self.host.profiles, &cleanup, None).and_then(|report| {
                if report.deletions.is_clean() {
                    Ok(report)
                } else {
                    Err(RemediationError::PartialBatch {
                        attempted: report.deletions.attempted,
                        failed: report.deletions.failed,
                    })
                }
            }),
        )?;

        self.fatal(run, "install", self.install_package())?;

        let present = verify_presence(self.host.packages, &self.patterns.product).and_then(|present| {
            if present {
                Ok(())
            } else {
                Err(RemediationError::Precondition(
                    "package not registered after install".to_string(),
                ))
            }
        });
        self.fatal(run, "verify-install", present)?;

        self.commit_and_reboot(run)
    }

    fn after_reboot_2(&self, run: &mut RemediationRun) -> PhaseResult {
        self.fatal(run, "consume-resume", self.host.resume.consume(Phase::AfterReboot2))?;

        let mut warnings = Vec::new();

        let synced = self.host.tasks.trigger_now(&self.config.mdm_task_path).and_then(|started| {
            if started == 0 {
                Err(RemediationError::Advisory(format!(
                    "no device-management tasks under {}",
                    self.config.mdm_task_path
                )))
            } else {
                Ok(started)
            }
        });
        self.best_effort(run, "mdm-sync", synced, &mut warnings);

        self.best_effort(run, "launch-client", self.host.client.start(), &mut warnings);
        self.best_effort(run, "verify-connectivity", self.verify_connectivity(), &mut warnings);

        let final_cleanup = run_cleanup(
            self.host.devices,
            self.host.profiles,
            &self.patterns,
            self.config,
            None,
        )
        .and_then(|report| report.into_result());
        self.best_effort(run, "final-cleanup", final_cleanup, &mut warnings);

        if warnings.is_empty() {
            Ok(RunOutcome::Completed)
        } else {
            warn!(count = warnings.len(), "completed with warnings, verify the client manually");
            Ok(RunOutcome::CompletedDegraded { warnings })
        }
    }

    /// Persists the following phase as the resume point, and only then reboots.
    fn commit_and_reboot(&self, run: &mut RemediationRun) -> PhaseResult {
        let phase = run.phase;
        let committed = phase
            .next()
            .ok_or_else(|| RemediationError::Persistence(format!("{phase} has no following phase")))
            .and_then(|next| self.host.resume.persist(next).map(|()| next));
        let next = self.fatal(run, "persist-resume", committed)?;
        let reason = format!("VPN client remediation continues with {next} after restart");
        self.fatal(
            run,
            "reboot",
            self.host.power.reboot(self.config.reboot_delay_seconds, &reason),
        )?;
        Ok(RunOutcome::RebootPending { next })
    }

    fn stop_client(&self) -> RemediationResult<()> {
        self.host.client.stop()?;
        let outcome = retry(
            "client-stopped",
            RetryPolicy::fixed(self.config.poll_attempts(), self.config.poll_interval()),
            |_| self.host.client.running_processes(),
            |running| running.is_empty(),
        );
        if !outcome.succeeded {
            return Err(RemediationError::Precondition(format!(
                "client processes still running: {}",
                outcome.value.join(", ")
            )));
        }
        Ok(())
    }

    fn uninstall_package(&self) -> RemediationResult<String> {
        let installed = self.host.packages.find_all(&self.patterns.product)?;
        if installed.is_empty() {
            return Ok("package already absent".to_string());
        }

        for package in &installed {
            info!(package = %package.name, version = ?package.version, source = %package.source, "uninstalling");
            let disposition = self.run_installer("uninstall", || self.host.packages.uninstall(package))?;
            if disposition == ExitDisposition::SuccessRebootRequired {
                info!(package = %package.name, "uninstaller requested a reboot");
            }
        }
        Ok(format!("{} package(s) uninstalled", installed.len()))
    }

    fn install_package(&self) -> RemediationResult<String> {
        let network = &self.config.target_network_identity;
        if !self.config.force_reinstall {
            if let Some(existing) = find_installed(self.host.packages, &self.patterns.product)? {
                info!(package = %existing.name, "package already present, applying configuration only");
                self.host.packages.apply_network_identity(network)?;
                return Ok(format!("{} already installed, network identity applied", existing.name));
            }
        }

        let installer = self.config.installer_path();
        let digest = self
            .host
            .packages
            .download(&self.config.installer_source_url, &installer)?;
        if let Some(expected) = self.config.installer_sha256.as_deref() {
            if !expected.eq_ignore_ascii_case(digest.trim()) {
                return Err(RemediationError::Precondition(format!(
                    "installer digest {digest} does not match expected {expected}"
                )));
            }
        }

        let args = install_arguments(network);
        let disposition = self.run_installer("install", || self.host.packages.install(&installer, &args))?;
        Ok(format!("installed ({disposition:?})"))
    }

    /// Runs an installer operation, retrying while another install holds the
    /// installer service.
    fn run_installer<F>(&self, label: &str, mut operation: F) -> RemediationResult<ExitDisposition>
    where
        F: FnMut() -> RemediationResult<i32>,
    {
        let policy = RetryPolicy::linear(
            self.config.installer_busy_retries.saturating_add(1),
            std::time::Duration::from_secs(self.config.installer_busy_backoff_seconds),
        );
        let outcome = retry(
            label,
            policy,
            |_| operation(),
            |result| !matches!(result.as_ref().map(|code| classify_exit_code(*code)), Ok(ExitDisposition::Busy)),
        );

        let code = outcome.value?;
        match classify_exit_code(code) {
            ExitDisposition::Busy => Err(RemediationError::TransientTool {
                attempts: outcome.attempts,
                detail: format!("{label} kept returning {code}"),
            }),
            disposition if disposition.is_success() => Ok(disposition),
            _ => Err(RemediationError::Command(format!("{label} exited with code {code}"))),
        }
    }

    /// Polls for a healthy adapter and a reachable endpoint; on timeout the
    /// client is restarted once to force re-authentication and polled again.
    fn verify_connectivity(&self) -> RemediationResult<()> {
        if self.poll_connected() {
            return Ok(());
        }

        warn!("connectivity not confirmed, restarting client to re-authenticate");
        self.host.client.stop()?;
        self.host.client.start()?;
        if self.poll_connected() {
            return Ok(());
        }

        Err(RemediationError::Advisory(format!(
            "adapter not healthy or endpoint unreachable after {}s and one client restart",
            self.config.polling_timeout_seconds
        )))
    }

    fn poll_connected(&self) -> bool {
        retry(
            "connectivity",
            RetryPolicy::fixed(self.config.poll_attempts(), self.config.poll_interval()),
            |_| {
                has_healthy_device(self.host.devices, &self.patterns.adapter).unwrap_or(false)
                    && self.host.client.endpoint_reachable()
            },
            |connected| *connected,
        )
        .succeeded
    }

    fn fatal<T>(&self, run: &mut RemediationRun, step: &str, result: RemediationResult<T>) -> Result<T, StepFailure> {
        match result {
            Ok(value) => {
                run.record(step, StepDisposition::Succeeded, "");
                info!(step, "step succeeded");
                Ok(value)
            }
            Err(err) => self.fail(run, step, err),
        }
    }

    fn fail<T>(&self, run: &mut RemediationRun, step: &str, err: RemediationError) -> Result<T, StepFailure> {
        error!(step, category = err.category(), error = %err, "step failed, aborting run");
        run.record(step, StepDisposition::Fatal, format!("{}: {err}", err.category()));
        Err(StepFailure {
            step: step.to_string(),
            reason: err.to_string(),
        })
    }

    fn best_effort<T>(
        &self,
        run: &mut RemediationRun,
        step: &str,
        result: RemediationResult<T>,
        warnings: &mut Vec<String>,
    ) -> Option<T> {
        match result {
            Ok(value) => {
                run.record(step, StepDisposition::Succeeded, "");
                info!(step, "step succeeded");
                Some(value)
            }
            Err(err) => {
                warn!(step, error = %err, "best-effort step failed, continuing");
                run.record(step, StepDisposition::Warned, err.to_string());
                warnings.push(format!("{step}: {err}"));
                None
            }
        }
    }
}
