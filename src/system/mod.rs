pub mod client;
pub mod devices;
pub mod elevation;
pub mod packages;
pub mod process;
pub mod profiles;
pub mod tasks;

use self::client::{ClientControl, PowerControl};
use self::devices::DeviceInventory;
use self::packages::PackageManager;
use self::profiles::ProfileStore;
use self::tasks::{ResumePoint, TaskScheduler};

/// The machine as seen by the orchestrator. Every field is a seam that tests
/// replace with an in-memory simulation.
#[derive(Clone, Copy)]
pub struct Host<'a> {
    pub devices: &'a dyn DeviceInventory,
    pub profiles: &'a dyn ProfileStore,
    pub packages: &'a dyn PackageManager,
    pub tasks: &'a dyn TaskScheduler,
    pub resume: &'a dyn ResumePoint,
    pub client: &'a dyn ClientControl,
    pub power: &'a dyn PowerControl,
}
