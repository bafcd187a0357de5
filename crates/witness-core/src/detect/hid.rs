//! Boot ROM (serial download) persona.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{DetectError, PersonaFilter, wait_until};
use crate::sdp::SdpTarget;
use crate::transport::{HidDeviceInfo, UsbEnumerator};

/// HID devices matching `filter`, usage page included.
pub fn detect_hid(
    enumerator: &dyn UsbEnumerator,
    filter: &PersonaFilter,
) -> Result<Vec<HidDeviceInfo>, DetectError> {
    let mut found = Vec::new();
    for info in enumerator.hid_devices()? {
        if !filter.matches_ids(&info) {
            continue;
        }
        if let Some(page) = filter.usage_page {
            if enumerator.usage_page(&info)? != Some(page) {
                continue;
            }
        }
        info!(
            vendor_id = %format!("{:04X}", info.vendor_id),
            product_id = %format!("{:04X}", info.product_id),
            path = %info.path,
            "Found device"
        );
        found.push(info);
    }
    Ok(found)
}

/// Wait for a device in serial download mode and open it.
pub fn wait_for_recovery(
    enumerator: &dyn UsbEnumerator,
    filter: &PersonaFilter,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<SdpTarget, DetectError> {
    info!("Waiting for device in serial download mode");
    let info = wait_until(poll, cancel, || match detect_hid(enumerator, filter) {
        Ok(mut found) => {
            if found.len() > 1 {
                warn!(count = found.len(), "Several devices found, using the first");
            }
            Ok((!found.is_empty()).then(|| found.swap_remove(0)))
        }
        Err(e) => {
            warn!(error = %e, "Failed to detect devices");
            Ok(None)
        }
    })?;

    let transport = enumerator.open(&info)?;
    Ok(SdpTarget::new(info, transport).with_cancellation(cancel.clone()))
}
