use tracing::{info, warn};

use crate::error::{RemediationError, RemediationResult};
use crate::models::{Phase, ResumeTask, TaskTrigger};
use crate::system::elevation::join_command_line;
use crate::system::process::{ps_quote, ProcessRunner};

pub trait TaskScheduler {
    fn exists(&self, name: &str) -> RemediationResult<bool>;

    /// Creates the task, overwriting nothing; callers go through `register`.
    fn create(&self, task: &ResumeTask) -> RemediationResult<()>;

    /// Removes the task. A task that does not exist is a no-op success.
    fn unregister(&self, name: &str) -> RemediationResult<()>;

    /// Starts every task under `task_path` without waiting for completion.
    /// Returns how many tasks were started.
    fn trigger_now(&self, task_path: &str) -> RemediationResult<usize>;

    /// Replaces any task of the same name with `task`.
    fn register(&self, task: &ResumeTask) -> RemediationResult<()> {
        self.unregister(&task.name)?;
        self.create(task)
    }
}

/// Where the next phase is recorded so that it survives a reboot.
pub trait ResumePoint {
    /// Records `next` as the phase to run after the coming reboot. Success
    /// here is the commit point of the current phase.
    fn persist(&self, next: Phase) -> RemediationResult<()>;

    /// Removes the record that launched `phase`.
    fn consume(&self, phase: Phase) -> RemediationResult<()>;

    /// Phases with a resume record currently in place.
    fn pending(&self) -> RemediationResult<Vec<Phase>>;
}

/// Resume points stored as at-logon scheduled tasks that re-run this binary.
pub struct ScheduledResume<'a> {
    scheduler: &'a dyn TaskScheduler,
    command: String,
    extra_args: Vec<String>,
    identity: String,
}

impl<'a> ScheduledResume<'a> {
    pub fn new(
        scheduler: &'a dyn TaskScheduler,
        command: String,
        extra_args: Vec<String>,
        identity: String,
    ) -> Self {
        Self {
            scheduler,
            command,
            extra_args,
            identity,
        }
    }

    pub fn task_for(&self, phase: Phase) -> Option<ResumeTask> {
        let name = phase.resume_task_name()?;
        let mut args = self.extra_args.clone();
        args.push("remediate".to_string());
        args.push(format!("--phase={}", phase.as_flag()));
        Some(ResumeTask {
            name: name.to_string(),
            command: self.command.clone(),
            arguments: join_command_line(&args),
            trigger: TaskTrigger::AtLogon,
            identity: self.identity.clone(),
        })
    }
}

impl ResumePoint for ScheduledResume<'_> {
    fn persist(&self, next: Phase) -> RemediationResult<()> {
        let task = self.task_for(next).ok_or_else(|| {
            RemediationError::Persistence(format!("phase {next} has no resume task"))
        })?;

        // Only one resume task may exist at a time.
        for name in Phase::all_resume_task_names() {
            self.scheduler
                .unregister(name)
                .map_err(|err| RemediationError::Persistence(format!("removing {name}: {err}")))?;
        }

        self.scheduler
            .register(&task)
            .map_err(|err| RemediationError::Persistence(format!("registering {}: {err}", task.name)))?;

        let present = self
            .scheduler
            .exists(&task.name)
            .map_err(|err| RemediationError::Persistence(format!("querying {}: {err}", task.name)))?;
        if !present {
            return Err(RemediationError::Persistence(format!(
                "{} not found after registration",
                task.name
            )));
        }

        info!(task = %task.name, arguments = %task.arguments, "resume task registered");
        Ok(())
    }

    fn consume(&self, phase: Phase) -> RemediationResult<()> {
        let Some(name) = phase.resume_task_name() else {
            return Ok(());
        };
        self.scheduler
            .unregister(name)
            .map_err(|err| RemediationError::Persistence(format!("removing {name}: {err}")))?;
        info!(task = name, "resume task consumed");
        Ok(())
    }

    fn pending(&self) -> RemediationResult<Vec<Phase>> {
        let mut phases = Vec::new();
        for phase in Phase::ALL {
            let Some(name) = phase.resume_task_name() else {
                continue;
            };
            if self.scheduler.exists(name)? {
                phases.push(phase);
            }
        }
        Ok(phases)
    }
}

/// Task scheduler driven through `schtasks.exe` and the ScheduledTasks cmdlets.
pub struct Schtasks<'a> {
    runner: &'a dyn ProcessRunner,
}

impl<'a> Schtasks<'a> {
    pub fn new(runner: &'a dyn ProcessRunner) -> Self {
        Self { runner }
    }
}

impl TaskScheduler for Schtasks<'_> {
    fn exists(&self, name: &str) -> RemediationResult<bool> {
        let output = self.runner.run(
            "schtasks.exe",
            &["/Query".to_string(), "/TN".to_string(), name.to_string()],
        )?;
        Ok(output.success())
    }

    fn create(&self, task: &ResumeTask) -> RemediationResult<()> {
        let schedule = match task.trigger {
            TaskTrigger::AtLogon => "ONLOGON",
        };
        let action = format!("\"{}\" {}", task.command, task.arguments);
        let output = self.runner.run(
            "schtasks.exe",
            &[
                "/Create".to_string(),
                "/TN".to_string(),
                task.name.clone(),
                "/TR".to_string(),
                action,
                "/SC".to_string(),
                schedule.to_string(),
                "/RL".to_string(),
                "HIGHEST".to_string(),
                "/RU".to_string(),
                task.identity.clone(),
                "/IT".to_string(),
                "/F".to_string(),
            ],
        )?;
        if !output.success() {
            return Err(RemediationError::Command(format!(
                "schtasks /Create exited with {}: {}",
                output.code,
                output.stderr_line()
            )));
        }
        Ok(())
    }

    fn unregister(&self, name: &str) -> RemediationResult<()> {
        if !self.exists(name)? {
            return Ok(());
        }
        let output = self.runner.run(
            "schtasks.exe",
            &[
                "/Delete".to_string(),
                "/TN".to_string(),
                name.to_string(),
                "/F".to_string(),
            ],
        )?;
        if !output.success() {
            return Err(RemediationError::Command(format!(
                "schtasks /Delete exited with {}: {}",
                output.code,
                output.stderr_line()
            )));
        }
        Ok(())
    }

    fn trigger_now(&self, task_path: &str) -> RemediationResult<usize> {
        let script = format!(
            "$t = @(Get-ScheduledTask -TaskPath {} -ErrorAction SilentlyContinue); \
             $t | Start-ScheduledTask -ErrorAction SilentlyContinue; $t.Count",
            ps_quote(&format!("{}*", task_path))
        );
        let output = self.runner.powershell(&script)?;
        if !output.success() {
            return Err(RemediationError::Command(format!(
                "starting tasks under {task_path} failed: {}",
                output.stderr_line()
            )));
        }
        let started = output.stdout.trim().parse::<usize>().unwrap_or(0);
        if started == 0 {
            warn!(task_path, "no tasks found to trigger");
        }
        Ok(started)
    }
}

/// `DOMAIN\user` of the invoking user, used as the resume task identity.
pub fn current_identity() -> String {
    let user = std::env::var("USERNAME").unwrap_or_default();
    match std::env::var("USERDOMAIN") {
        Ok(domain) if !domain.is_empty() => format!("{domain}\\{user}"),
        _ => user,
    }
}
