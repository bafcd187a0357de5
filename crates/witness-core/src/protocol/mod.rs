//! Protocol module - wire formats spoken to the appliance.

pub mod constants;
pub mod imx;
pub mod sdp;
pub mod status;
pub mod u2fhid;

pub use constants::*;
pub use imx::{ImxError, Ivt};
pub use sdp::{SdpCommand, SdpCommandError};
pub use status::{CommandResponse, DeviceStatus, StatusError};
pub use u2fhid::{FrameError, Message, MessageAssembler};
