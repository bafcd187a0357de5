//! Provisioning states.

use std::fmt;

/// Where a provisioning run is.
///
/// ```text
/// Init -> RecoveryBoot -> Flashing -> AwaitingOperational -> StatusCheck
///      -> [FuseBoot -> FuseFlash ->] Done
/// ```
///
/// Any state may move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProvisionState {
    /// Bundles fetched, not yet verified.
    #[default]
    Init,
    /// Booting the recovery image over SDP.
    RecoveryBoot,
    /// Writing images to MMC.
    Flashing,
    /// Waiting for the operational firmware.
    AwaitingOperational,
    /// Checking the device before fusing.
    StatusCheck,
    /// Booting recovery again on the freshly fused device.
    FuseBoot,
    /// Writing the real applet.
    FuseFlash,
    Done,
    Failed,
}

impl ProvisionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisionState::Done | ProvisionState::Failed)
    }

    /// States only visited when fusing.
    pub fn is_fuse_stage(&self) -> bool {
        matches!(self, ProvisionState::FuseBoot | ProvisionState::FuseFlash)
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionState::Init => write!(f, "INIT"),
            ProvisionState::RecoveryBoot => write!(f, "RECOVERY_BOOT"),
            ProvisionState::Flashing => write!(f, "FLASHING"),
            ProvisionState::AwaitingOperational => write!(f, "AWAITING_OPERATIONAL"),
            ProvisionState::StatusCheck => write!(f, "STATUS_CHECK"),
            ProvisionState::FuseBoot => write!(f, "FUSE_BOOT"),
            ProvisionState::FuseFlash => write!(f, "FUSE_FLASH"),
            ProvisionState::Done => write!(f, "DONE"),
            ProvisionState::Failed => write!(f, "FAILED"),
        }
    }
}
