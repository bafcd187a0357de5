//! Device-mode detection.
//!
//! The appliance shows up as three personas over a provisioning run: the
//! boot ROM in serial download mode (HID), the recovery firmware exposing
//! the MMC as mass storage (block device), and the operational firmware
//! (U2FHID). Every wait here is built on [`wait_until`] and honors a
//! [`CancellationToken`].

pub mod block;
pub mod hid;
pub mod u2f;

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{
    FREESCALE_VENDOR_ID, OPERATIONAL_PRODUCT_ID, OPERATIONAL_USAGE_PAGE, OPERATIONAL_VENDOR_ID,
    RECOVERY_PIDS,
};
use crate::transport::{HidDeviceInfo, TransportError};

pub use block::wait_for_block_device;
pub use hid::{detect_hid, wait_for_recovery};
pub use u2f::{U2fDevice, U2fError, detect_u2f, wait_for_operational};

/// Persona poll interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Granularity of cancellable sleeps.
const CANCEL_CHECK: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("Wait cancelled")]
    Cancelled,

    #[error("Filesystem watch failed: {0}")]
    Watch(#[from] notify::Error),

    #[error("Invalid device pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Trigger failed: {0}")]
    Trigger(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    U2f(#[from] U2fError),
}

/// Which USB devices count as a given persona.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaFilter {
    pub vendor_id: u16,
    pub product_ids: Vec<u16>,
    /// Required HID usage page, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_page: Option<u16>,
}

impl PersonaFilter {
    /// i.MX6UL/ULL boot ROM in serial download mode.
    pub fn recovery() -> Self {
        Self {
            vendor_id: FREESCALE_VENDOR_ID,
            product_ids: RECOVERY_PIDS.to_vec(),
            usage_page: None,
        }
    }

    /// Operational firmware's U2FHID interface.
    pub fn operational() -> Self {
        Self {
            vendor_id: OPERATIONAL_VENDOR_ID,
            product_ids: vec![OPERATIONAL_PRODUCT_ID],
            usage_page: Some(OPERATIONAL_USAGE_PAGE),
        }
    }

    /// VID/PID match; the usage page is checked separately.
    pub fn matches_ids(&self, info: &HidDeviceInfo) -> bool {
        info.vendor_id == self.vendor_id && self.product_ids.contains(&info.product_id)
    }
}

/// Poll `probe` every `poll` until it yields a value or `cancel` fires.
pub fn wait_until<T, F>(poll: Duration, cancel: &CancellationToken, mut probe: F) -> Result<T, DetectError>
where
    F: FnMut() -> Result<Option<T>, DetectError>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(DetectError::Cancelled);
        }
        if let Some(found) = probe()? {
            return Ok(found);
        }
        sleep_cancellable(poll, cancel)?;
    }
}

/// Sleep for `duration`, returning early with `Cancelled` if `cancel` fires.
pub fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> Result<(), DetectError> {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return Err(DetectError::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        thread::sleep(remaining.min(CANCEL_CHECK));
    }
}

/// Cancellation scope for one device wait, bounded by an optional deadline.
///
/// The scope's token is a child of the caller's, so outside cancellation
/// still reaches the wait. Dropping the scope stops the deadline thread but
/// leaves the token alone: devices opened during the wait keep using it.
pub struct WaitScope {
    parent: CancellationToken,
    token: CancellationToken,
    timeout: Option<Duration>,
    stop: CancellationToken,
    deadline: Option<JoinHandle<()>>,
}

impl WaitScope {
    pub fn new(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        let token = parent.child_token();
        let stop = CancellationToken::new();
        let deadline = timeout.map(|after| {
            let token = token.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                if sleep_cancellable(after, &stop).is_ok() {
                    debug!(after_secs = after.as_secs(), "Wait deadline reached");
                    token.cancel();
                }
            })
        });
        Self {
            parent: parent.clone(),
            token,
            timeout,
            stop,
            deadline,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the deadline, not the caller, ended the wait.
    pub fn expired(&self) -> bool {
        self.token.is_cancelled() && !self.parent.is_cancelled()
    }

    /// Add a deadline explanation to `error` if the deadline ended the wait.
    pub fn explain(&self, error: anyhow::Error, what: &str) -> anyhow::Error {
        match self.timeout {
            Some(after) if self.expired() => {
                error.context(format!("Gave up waiting for {what} after {}s", after.as_secs()))
            }
            _ => error,
        }
    }
}

impl Drop for WaitScope {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.deadline.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_until_returns_first_value() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let found = wait_until(Duration::from_millis(1), &cancel, || {
            calls += 1;
            Ok((calls == 3).then_some(calls))
        })
        .unwrap();
        assert_eq!(found, 3);
    }

    #[test]
    fn test_wait_until_propagates_probe_error() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = wait_until(Duration::from_millis(1), &cancel, || {
            Err(DetectError::Trigger("boom".into()))
        });
        assert!(matches!(result, Err(DetectError::Trigger(_))));
    }

    #[test]
    fn test_deadline_cancels_wait() {
        let parent = CancellationToken::new();
        let scope = WaitScope::new(&parent, Some(Duration::from_millis(100)));
        let started = Instant::now();

        let result: Result<(), _> = wait_until(POLL_INTERVAL, scope.token(), || Ok(None));
        assert!(matches!(result, Err(DetectError::Cancelled)));
        assert!(started.elapsed() < POLL_INTERVAL);
    }

    #[test]
    fn test_wait_scope_deadline_vs_caller() {
        let parent = CancellationToken::new();
        let scope = WaitScope::new(&parent, Some(Duration::ZERO));
        let result: Result<(), _> = wait_until(Duration::from_millis(5), scope.token(), || Ok(None));
        assert!(matches!(result, Err(DetectError::Cancelled)));
        assert!(scope.expired());
        let err = scope.explain(anyhow::anyhow!("cancelled"), "the device");
        assert!(format!("{err:#}").starts_with("Gave up waiting for the device after 0s"));
        drop(scope);
        assert!(!parent.is_cancelled());

        // a finished wait leaves its token usable
        let scope = WaitScope::new(&parent, Some(Duration::from_secs(60)));
        let token = scope.token().clone();
        drop(scope);
        assert!(!token.is_cancelled());

        let scope = WaitScope::new(&parent, None);
        parent.cancel();
        assert!(scope.token().is_cancelled());
        assert!(!scope.expired());
    }

    #[test]
    fn test_persona_filters() {
        let rom = HidDeviceInfo {
            vendor_id: FREESCALE_VENDOR_ID,
            product_id: 0x0080,
            interface: 0,
            path: "1:4".into(),
            product: None,
        };
        assert!(PersonaFilter::recovery().matches_ids(&rom));
        assert!(!PersonaFilter::operational().matches_ids(&rom));
        assert_eq!(PersonaFilter::operational().usage_page, Some(0xF1D0));
    }
}
