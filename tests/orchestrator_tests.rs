use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tempfile::TempDir;

use vpn_remediate::config::RemediationConfig;
use vpn_remediate::error::{RemediationError, RemediationResult};
use vpn_remediate::models::{
    Device, DeviceHealth, NetworkProfile, PackageInfo, Phase, ResumeTask, RunOutcome, StepDisposition,
    TaskTrigger,
};
use vpn_remediate::orchestrator::{Orchestrator, RemediationRun};
use vpn_remediate::storage::RunJournal;
use vpn_remediate::system::client::{ClientControl, PowerControl};
use vpn_remediate::system::devices::DeviceInventory;
use vpn_remediate::system::packages::PackageManager;
use vpn_remediate::system::profiles::{guids_equal, ProfileStore};
use vpn_remediate::system::tasks::{ResumePoint, ScheduledResume, TaskScheduler};
use vpn_remediate::system::Host;

/// An in-memory machine. Every mutation is appended to `events` so tests can
/// check ordering across components.
#[derive(Default)]
struct SimulatedMachine {
    devices: RefCell<Vec<Device>>,
    locked_devices: RefCell<Vec<String>>,
    profiles: RefCell<Vec<NetworkProfile>>,
    active_guid: RefCell<Option<String>>,
    packages: RefCell<Vec<PackageInfo>>,
    uninstall_calls: Cell<usize>,
    /// Uninstaller exits 0 but leaves the product registered.
    sticky_uninstall: Cell<bool>,
    install_codes: RefCell<VecDeque<i32>>,
    install_calls: Cell<usize>,
    install_args: RefCell<Vec<String>>,
    /// Installer reports success without registering anything.
    phantom_install: Cell<bool>,
    applied_network: RefCell<Option<String>>,
    tasks: RefCell<BTreeMap<String, ResumeTask>>,
    refuse_task_creation: Cell<bool>,
    mdm_tasks: Cell<usize>,
    running: RefCell<Vec<String>>,
    /// Processes that survive a stop request.
    stubborn_processes: Cell<bool>,
    service_running: Cell<bool>,
    launches: Cell<usize>,
    reboots: RefCell<Vec<String>>,
    events: RefCell<Vec<String>>,
}

impl SimulatedMachine {
    fn event(&self, value: String) {
        self.events.borrow_mut().push(value);
    }

    fn add_device(&self, name: &str, id: &str, status: Option<&str>) {
        self.devices.borrow_mut().push(Device {
            friendly_name: name.to_string(),
            instance_id: id.to_string(),
            status: status.map(ToString::to_string),
        });
    }

    fn add_profile(&self, guid: &str, name: &str) {
        self.profiles.borrow_mut().push(NetworkProfile {
            name: name.to_string(),
            guid: guid.to_string(),
            registry_path: format!("HKLM\\...\\Profiles\\{guid}"),
        });
    }

    fn install_client(&self) {
        self.packages.borrow_mut().push(client_package());
    }

    fn add_resume_task(&self, phase: Phase) {
        let name = phase.resume_task_name().unwrap().to_string();
        self.tasks.borrow_mut().insert(
            name.clone(),
            ResumeTask {
                name,
                command: "vpn-remediate.exe".to_string(),
                arguments: format!("remediate --phase={}", phase.as_flag()),
                trigger: TaskTrigger::AtLogon,
                identity: "LAB\\tech".to_string(),
            },
        );
    }

    fn task_names(&self) -> Vec<String> {
        self.tasks.borrow().keys().cloned().collect()
    }

    fn ghost_count(&self) -> usize {
        self.devices
            .borrow()
            .iter()
            .filter(|device| device.health() == DeviceHealth::Ghost)
            .count()
    }

    fn profile_named(&self, guid: &str) -> Option<String> {
        self.profiles
            .borrow()
            .iter()
            .find(|profile| guids_equal(&profile.guid, guid))
            .map(|profile| profile.name.clone())
    }

    fn position(&self, event: &str) -> Option<usize> {
        self.events.borrow().iter().position(|e| e == event)
    }
}

fn client_package() -> PackageInfo {
    PackageInfo {
        name: "Twingate".to_string(),
        version: Some("2024.1".to_string()),
        publisher: Some("Twingate Inc.".to_string()),
        product_code: "{A1B2C3D4-0000-1111-2222-333344445555}".to_string(),
        uninstall_string: None,
        quiet_uninstall_string: None,
        source: "HKLM".to_string(),
    }
}

impl DeviceInventory for SimulatedMachine {
    fn list_by_name(&self, pattern: &Regex) -> RemediationResult<Vec<Device>> {
        Ok(self
            .devices
            .borrow()
            .iter()
            .filter(|device| pattern.is_match(&device.friendly_name))
            .cloned()
            .collect())
    }

    fn remove(&self, instance_id: &str) -> RemediationResult<()> {
        if self.locked_devices.borrow().iter().any(|id| id == instance_id) {
            return Err(RemediationError::Command(format!("{instance_id} is in use")));
        }
        self.devices.borrow_mut().retain(|device| device.instance_id != instance_id);
        self.event(format!("remove-device:{instance_id}"));
        Ok(())
    }

    fn create_placeholder(&self, friendly_name: &str) -> RemediationResult<String> {
        let instance_id = format!("ROOT\\NET\\{:04}", self.devices.borrow().len());
        self.add_device(friendly_name, &instance_id, None);
        Ok(instance_id)
    }
}

impl ProfileStore for SimulatedMachine {
    fn list(&self) -> RemediationResult<Vec<NetworkProfile>> {
        Ok(self.profiles.borrow().clone())
    }

    fn find_active_guid(&self, _adapter_pattern: &Regex) -> RemediationResult<Option<String>> {
        Ok(self.active_guid.borrow().clone())
    }

    fn set_name(&self, guid: &str, name: &str) -> RemediationResult<()> {
        for profile in self.profiles.borrow_mut().iter_mut() {
            if guids_equal(&profile.guid, guid) {
                profile.name = name.to_string();
            }
        }
        self.event(format!("rename:{guid}:{name}"));
        Ok(())
    }

    fn delete(&self, guid: &str) -> RemediationResult<()> {
        self.profiles.borrow_mut().retain(|profile| !guids_equal(&profile.guid, guid));
        self.event(format!("delete-profile:{guid}"));
        Ok(())
    }

    fn export(&self, guid: &str, destination: &Path) -> RemediationResult<()> {
        fs::write(destination, format!("Windows Registry Editor Version 5.00\r\n; {guid}\r\n"))?;
        self.event(format!("export:{guid}"));
        Ok(())
    }

    fn create(&self, guid: &str, name: &str) -> RemediationResult<()> {
        self.add_profile(guid, name);
        Ok(())
    }
}

impl PackageManager for SimulatedMachine {
    fn find_all(&self, pattern: &Regex) -> RemediationResult<Vec<PackageInfo>> {
        Ok(self
            .packages
            .borrow()
            .iter()
            .filter(|package| pattern.is_match(&package.name))
            .cloned()
            .collect())
    }

    fn uninstall(&self, package: &PackageInfo) -> RemediationResult<i32> {
        self.uninstall_calls.set(self.uninstall_calls.get() + 1);
        if !self.sticky_uninstall.get() {
            self.packages
                .borrow_mut()
                .retain(|installed| installed.product_code != package.product_code);
        }
        self.event("uninstall".to_string());
        Ok(0)
    }

    fn install(&self, _installer: &Path, args: &[String]) -> RemediationResult<i32> {
        self.install_calls.set(self.install_calls.get() + 1);
        *self.install_args.borrow_mut() = args.to_vec();
        let code = self.install_codes.borrow_mut().pop_front().unwrap_or(0);
        if matches!(code, 0 | 1641 | 3010) && !self.phantom_install.get() {
            self.install_client();
            self.event("install".to_string());
        }
        Ok(code)
    }

    fn download(&self, _url: &str, destination: &Path) -> RemediationResult<String> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(destination, b"msi")?;
        Ok("0".repeat(64))
    }

    fn apply_network_identity(&self, network: &str) -> RemediationResult<()> {
        *self.applied_network.borrow_mut() = Some(network.to_string());
        Ok(())
    }
}

impl TaskScheduler for SimulatedMachine {
    fn exists(&self, name: &str) -> RemediationResult<bool> {
        Ok(self.tasks.borrow().contains_key(name))
    }

    fn create(&self, task: &ResumeTask) -> RemediationResult<()> {
        if self.refuse_task_creation.get() {
            return Err(RemediationError::Command("access denied".to_string()));
        }
        self.tasks.borrow_mut().insert(task.name.clone(), task.clone());
        self.event(format!("register:{}", task.name));
        Ok(())
    }

    fn unregister(&self, name: &str) -> RemediationResult<()> {
        self.tasks.borrow_mut().remove(name);
        Ok(())
    }

    fn trigger_now(&self, _task_path: &str) -> RemediationResult<usize> {
        Ok(self.mdm_tasks.get())
    }
}

impl ClientControl for SimulatedMachine {
    fn stop(&self) -> RemediationResult<()> {
        if !self.stubborn_processes.get() {
            self.running.borrow_mut().clear();
        }
        self.service_running.set(false);
        self.event("stop-client".to_string());
        Ok(())
    }

    fn running_processes(&self) -> Vec<String> {
        self.running.borrow().clone()
    }

    fn start(&self) -> RemediationResult<()> {
        self.service_running.set(true);
        self.launches.set(self.launches.get() + 1);
        self.event("start-client".to_string());
        Ok(())
    }

    fn endpoint_reachable(&self) -> bool {
        true
    }
}

impl PowerControl for SimulatedMachine {
    fn reboot(&self, _delay_seconds: u64, reason: &str) -> RemediationResult<()> {
        self.reboots.borrow_mut().push(reason.to_string());
        self.event("reboot".to_string());
        Ok(())
    }
}

fn test_config(data_dir: &TempDir) -> RemediationConfig {
    RemediationConfig {
        target_network_identity: "acme".to_string(),
        installer_source_url: "https://downloads.example.test/client.msi".to_string(),
        polling_timeout_seconds: 3,
        polling_interval_seconds: 0,
        installer_busy_backoff_seconds: 0,
        reboot_delay_seconds: 0,
        fatal_pause_seconds: 0,
        data_directory: data_dir.path().to_path_buf(),
        ..RemediationConfig::default()
    }
}

fn run_phase(machine: &SimulatedMachine, config: &RemediationConfig, phase: Phase) -> (RunOutcome, RemediationRun) {
    let resume = ScheduledResume::new(
        machine,
        "C:\\Tools\\vpn-remediate.exe".to_string(),
        Vec::new(),
        "LAB\\tech".to_string(),
    );
    let host = Host {
        devices: machine,
        profiles: machine,
        packages: machine,
        tasks: machine,
        resume: &resume,
        client: machine,
        power: machine,
    };
    let orchestrator = Orchestrator::new(host, config).unwrap();
    let mut run = RemediationRun::new(phase, None);
    let outcome = orchestrator.run(&mut run);
    (outcome, run)
}

fn step_disposition(run: &RemediationRun, step: &str) -> Option<StepDisposition> {
    run.records()
        .iter()
        .find(|record| record.step == step)
        .map(|record| record.disposition)
}

#[test]
fn fresh_phase_uninstalls_cleans_and_schedules_reboot() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();
    machine.install_client();
    machine.running.borrow_mut().push("twingate.exe".to_string());
    machine.add_device("Twingate Adapter", "ROOT\\NET\\0000", Some("OK"));
    machine.add_device("Twingate Adapter #2", "ROOT\\NET\\0001", Some("Unknown"));
    machine.add_device("Twingate Adapter #3", "ROOT\\NET\\0002", None);
    machine.add_device("Intel Ethernet", "PCI\\VEN_8086", Some("Error"));
    machine.add_profile("{G1}", "Twingate 7");
    machine.add_profile("{G2}", "Twingate 3");
    machine.add_profile("{G3}", "Office WiFi");
    *machine.active_guid.borrow_mut() = Some("{G1}".to_string());

    let (outcome, run) = run_phase(&machine, &config, Phase::Fresh);

    assert_eq!(
        outcome,
        RunOutcome::RebootPending {
            next: Phase::AfterReboot1
        }
    );
    assert_eq!(outcome.exit_code(), 0);
    assert!(machine.packages.borrow().is_empty());
    assert_eq!(
        machine
            .devices
            .borrow()
            .iter()
            .filter(|d| d.friendly_name.starts_with("Twingate") && d.health() == DeviceHealth::Ghost)
            .count(),
        0
    );
    // Unrelated adapters are never touched.
    assert!(machine.devices.borrow().iter().any(|d| d.instance_id == "PCI\\VEN_8086"));
    assert_eq!(machine.profile_named("{G1}").as_deref(), Some("Twingate"));
    assert_eq!(machine.profile_named("{G2}"), None);
    assert_eq!(machine.profile_named("{G3}").as_deref(), Some("Office WiFi"));
    assert_eq!(machine.task_names(), vec!["VpnRemediate-AfterReboot1".to_string()]);
    assert_eq!(machine.reboots.borrow().len(), 1);

    let export = machine.position("export:{G1}").unwrap();
    let rename = machine.position("rename:{G1}:Twingate").unwrap();
    let register = machine.position("register:VpnRemediate-AfterReboot1").unwrap();
    let reboot = machine.position("reboot").unwrap();
    assert!(export < rename);
    assert!(register < reboot);

    let backups: Vec<PathBuf> = fs::read_dir(config.backup_directory())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(step_disposition(&run, "cleanup"), Some(StepDisposition::Succeeded));
}

#[test]
fn resume_task_carries_next_phase_flag() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();

    run_phase(&machine, &config, Phase::Fresh);

    let tasks = machine.tasks.borrow();
    let task = tasks.get("VpnRemediate-AfterReboot1").unwrap();
    assert_eq!(task.command, "C:\\Tools\\vpn-remediate.exe");
    assert!(task.arguments.ends_with("remediate --phase=after-reboot-1"));
    assert_eq!(task.trigger, TaskTrigger::AtLogon);
}

#[test]
fn uninstall_is_idempotent_when_package_absent() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();

    let (outcome, run) = run_phase(&machine, &config, Phase::Fresh);

    assert!(matches!(outcome, RunOutcome::RebootPending { .. }));
    assert_eq!(machine.uninstall_calls.get(), 0);
    assert_eq!(step_disposition(&run, "uninstall"), Some(StepDisposition::Succeeded));
    assert_eq!(step_disposition(&run, "verify-uninstall"), Some(StepDisposition::Succeeded));
}

#[test]
fn failed_resume_registration_never_reboots() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();
    machine.install_client();
    machine.refuse_task_creation.set(true);

    let (outcome, run) = run_phase(&machine, &config, Phase::Fresh);

    match &outcome {
        RunOutcome::Failed { step, .. } => assert_eq!(step, "persist-resume"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(outcome.exit_code(), 1);
    assert!(machine.reboots.borrow().is_empty());
    assert_eq!(step_disposition(&run, "reboot"), None);
}

#[test]
fn partial_cleanup_failure_stops_before_persisting() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();
    machine.add_device("Twingate Adapter #2", "ROOT\\NET\\0001", Some("Unknown"));
    machine.add_device("Twingate Adapter #3", "ROOT\\NET\\0002", Some("Unknown"));
    machine.locked_devices.borrow_mut().push("ROOT\\NET\\0001".to_string());

    let (outcome, _run) = run_phase(&machine, &config, Phase::Fresh);

    assert!(matches!(&outcome, RunOutcome::Failed { step, .. } if step == "cleanup"));
    // The batch kept going past the locked device.
    assert!(machine.position("remove-device:ROOT\\NET\\0002").is_some());
    assert!(machine.tasks.borrow().is_empty());
    assert!(machine.reboots.borrow().is_empty());
}

#[test]
fn package_left_registered_fails_verify_uninstall() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();
    machine.install_client();
    machine.sticky_uninstall.set(true);
    machine.add_device("Twingate Adapter #2", "ROOT\\NET\\0001", Some("Unknown"));

    let (outcome, run) = run_phase(&machine, &config, Phase::Fresh);

    assert!(matches!(&outcome, RunOutcome::Failed { step, .. } if step == "verify-uninstall"));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(machine.uninstall_calls.get(), 1);
    assert_eq!(step_disposition(&run, "verify-uninstall"), Some(StepDisposition::Fatal));
    // Nothing past the failed post-condition ran.
    assert_eq!(step_disposition(&run, "cleanup"), None);
    assert_eq!(machine.ghost_count(), 1);
    assert!(machine.tasks.borrow().is_empty());
    assert!(machine.reboots.borrow().is_empty());
}

#[test]
fn client_processes_surviving_stop_abort_the_run() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();
    machine.install_client();
    machine.running.borrow_mut().push("twingate.exe".to_string());
    machine.stubborn_processes.set(true);

    let (outcome, run) = run_phase(&machine, &config, Phase::Fresh);

    match &outcome {
        RunOutcome::Failed { step, reason } => {
            assert_eq!(step, "stop-client");
            assert!(reason.contains("twingate.exe"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(step_disposition(&run, "stop-client"), Some(StepDisposition::Fatal));
    assert_eq!(machine.uninstall_calls.get(), 0);
    assert_eq!(machine.packages.borrow().len(), 1);
    assert!(machine.tasks.borrow().is_empty());
    assert!(machine.reboots.borrow().is_empty());
}

#[test]
fn installer_success_without_registration_fails_verify_install() {
    for code in [0, 3010] {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let machine = SimulatedMachine::default();
        machine.add_resume_task(Phase::AfterReboot1);
        machine.install_codes.borrow_mut().push_back(code);
        machine.phantom_install.set(true);

        let (outcome, run) = run_phase(&machine, &config, Phase::AfterReboot1);

        assert!(
            matches!(&outcome, RunOutcome::Failed { step, .. } if step == "verify-install"),
            "exit code {code}: {outcome:?}"
        );
        assert_eq!(step_disposition(&run, "install"), Some(StepDisposition::Succeeded));
        assert_eq!(step_disposition(&run, "verify-install"), Some(StepDisposition::Fatal));
        assert!(machine.tasks.borrow().is_empty());
        assert!(machine.reboots.borrow().is_empty());
    }
}

#[test]
fn after_reboot_1_installs_with_reboot_required_code() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();
    machine.add_resume_task(Phase::AfterReboot1);
    machine.install_codes.borrow_mut().push_back(3010);

    let (outcome, run) = run_phase(&machine, &config, Phase::AfterReboot1);

    assert_eq!(
        outcome,
        RunOutcome::RebootPending {
            next: Phase::AfterReboot2
        }
    );
    assert_eq!(step_disposition(&run, "install"), Some(StepDisposition::Succeeded));
    assert_eq!(machine.install_calls.get(), 1);
    assert!(machine.install_args.borrow().contains(&"network=acme".to_string()));
    assert_eq!(machine.task_names(), vec!["VpnRemediate-AfterReboot2".to_string()]);
    assert_eq!(machine.reboots.borrow().len(), 1);
}

#[test]
fn after_reboot_1_deletes_every_matching_profile() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();
    machine.add_resume_task(Phase::AfterReboot1);
    machine.add_profile("{G1}", "Twingate");
    machine.add_profile("{G2}", "Twingate 4");
    machine.add_profile("{G3}", "Home");
    *machine.active_guid.borrow_mut() = Some("{G1}".to_string());

    run_phase(&machine, &config, Phase::AfterReboot1);

    let names: Vec<String> = machine.profiles.borrow().iter().map(|p| p.name.clone()).collect();
    assert_eq!(names, vec!["Home".to_string()]);
}

#[test]
fn installer_busy_is_retried_then_fatal() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.installer_busy_retries = 2;
    let machine = SimulatedMachine::default();
    machine.add_resume_task(Phase::AfterReboot1);
    machine.install_codes.borrow_mut().extend([1618, 1618, 1618, 1618]);

    let (outcome, run) = run_phase(&machine, &config, Phase::AfterReboot1);

    assert!(matches!(&outcome, RunOutcome::Failed { step, .. } if step == "install"));
    assert_eq!(machine.install_calls.get(), 3);
    assert_eq!(step_disposition(&run, "install"), Some(StepDisposition::Fatal));
    assert!(machine.tasks.borrow().is_empty());
    assert!(machine.reboots.borrow().is_empty());
}

#[test]
fn installer_busy_then_success_continues() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();
    machine.add_resume_task(Phase::AfterReboot1);
    machine.install_codes.borrow_mut().extend([1618, 0]);

    let (outcome, _run) = run_phase(&machine, &config, Phase::AfterReboot1);

    assert!(matches!(outcome, RunOutcome::RebootPending { .. }));
    assert_eq!(machine.install_calls.get(), 2);
}

#[test]
fn present_package_is_configured_not_reinstalled() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();
    machine.add_resume_task(Phase::AfterReboot1);
    machine.install_client();

    let (outcome, _run) = run_phase(&machine, &config, Phase::AfterReboot1);

    assert!(matches!(outcome, RunOutcome::RebootPending { .. }));
    assert_eq!(machine.install_calls.get(), 0);
    assert_eq!(machine.applied_network.borrow().as_deref(), Some("acme"));
}

#[test]
fn after_reboot_2_unhealthy_adapter_is_degraded_success() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();
    machine.install_client();
    machine.add_resume_task(Phase::AfterReboot2);
    machine.add_device("Twingate Adapter", "ROOT\\NET\\0000", Some("Error"));
    machine.mdm_tasks.set(2);

    let (outcome, run) = run_phase(&machine, &config, Phase::AfterReboot2);

    match &outcome {
        RunOutcome::CompletedDegraded { warnings } => {
            assert!(warnings.iter().any(|w| w.starts_with("verify-connectivity")));
        }
        other => panic!("expected degraded success, got {other:?}"),
    }
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(step_disposition(&run, "verify-connectivity"), Some(StepDisposition::Warned));
    assert_eq!(step_disposition(&run, "mdm-sync"), Some(StepDisposition::Succeeded));
    // Initial launch plus one restart for re-authentication.
    assert_eq!(machine.launches.get(), 2);
    // The restart left the service up, not just the UI.
    assert!(machine.service_running.get());
    let events = machine.events.borrow();
    let last_stop = events.iter().rposition(|e| e == "stop-client").unwrap();
    let last_start = events.iter().rposition(|e| e == "start-client").unwrap();
    assert!(last_stop < last_start);
    drop(events);
    assert!(machine.tasks.borrow().is_empty());
    assert!(machine.reboots.borrow().is_empty());
}

#[test]
fn after_reboot_2_healthy_adapter_completes() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();
    machine.install_client();
    machine.add_resume_task(Phase::AfterReboot2);
    machine.add_device("Twingate Adapter", "ROOT\\NET\\0000", Some("OK"));
    machine.add_device("Twingate Adapter #2", "ROOT\\NET\\0001", Some("Unknown"));
    machine.mdm_tasks.set(1);

    let (outcome, _run) = run_phase(&machine, &config, Phase::AfterReboot2);

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(machine.ghost_count(), 0);
    assert_eq!(machine.launches.get(), 1);
}

#[test]
fn missing_mdm_tasks_only_warn() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();
    machine.add_resume_task(Phase::AfterReboot2);
    machine.add_device("Twingate Adapter", "ROOT\\NET\\0000", Some("OK"));

    let (outcome, run) = run_phase(&machine, &config, Phase::AfterReboot2);

    assert!(matches!(outcome, RunOutcome::CompletedDegraded { .. }));
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(step_disposition(&run, "mdm-sync"), Some(StepDisposition::Warned));
}

#[test]
fn persisting_twice_leaves_one_resume_task() {
    let machine = SimulatedMachine::default();
    let resume = ScheduledResume::new(&machine, "tool.exe".to_string(), Vec::new(), "LAB\\tech".to_string());

    resume.persist(Phase::AfterReboot1).unwrap();
    resume.persist(Phase::AfterReboot1).unwrap();
    assert_eq!(machine.task_names(), vec!["VpnRemediate-AfterReboot1".to_string()]);

    resume.persist(Phase::AfterReboot2).unwrap();
    assert_eq!(machine.task_names(), vec!["VpnRemediate-AfterReboot2".to_string()]);
    assert_eq!(resume.pending().unwrap(), vec![Phase::AfterReboot2]);
}

#[test]
fn steps_are_journaled_across_phases() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let machine = SimulatedMachine::default();
    let resume = ScheduledResume::new(&machine, "tool.exe".to_string(), Vec::new(), "LAB\\tech".to_string());
    let host = Host {
        devices: &machine,
        profiles: &machine,
        packages: &machine,
        tasks: &machine,
        resume: &resume,
        client: &machine,
        power: &machine,
    };
    let orchestrator = Orchestrator::new(host, &config).unwrap();

    for phase in [Phase::Fresh, Phase::AfterReboot1] {
        let journal = RunJournal::open(config.journal_path()).unwrap();
        let mut run = RemediationRun::new(phase, Some(journal));
        orchestrator.run(&mut run);
    }

    let recent = RunJournal::open(config.journal_path()).unwrap().recent(100).unwrap();
    assert_eq!(recent.first().map(|r| r.step.as_str()), Some("reboot"));
    assert_eq!(recent.first().map(|r| r.phase), Some(Phase::AfterReboot1));
    assert!(recent.iter().any(|r| r.phase == Phase::Fresh && r.step == "stop-client"));
}
