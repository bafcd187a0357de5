//! Provisioning orchestrator.
//!
//! Takes a device from the boot ROM to a flashed (and optionally fused)
//! witness, refusing to touch it until every bundle checks out against the
//! firmware log.

pub mod backend;
pub mod jobs;
pub mod session;
pub mod state;

pub use backend::{DeviceBackend, OperationalDevice, UsbBackend};
pub use jobs::{applet_job, flash_jobs};
pub use session::{ProvisionReport, ProvisionSession, SafetyCheck};
pub use state::ProvisionState;
