//! Mass-storage persona: waiting for the recovery firmware's block device.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use glob::{MatchOptions, Pattern};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{DetectError, sleep_cancellable};

/// Wildcards never cross a `/`.
const DEVICE_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Run `trigger`, then wait for a new entry matching `glob` to be created
/// under `watch_dir`.
///
/// The watch is registered before the trigger runs. Entries that already
/// exist never satisfy the wait. Once matched, the device is given `settle`
/// to become usable.
pub fn wait_for_block_device<F>(
    watch_dir: &Path,
    glob: &str,
    settle: Duration,
    cancel: &CancellationToken,
    trigger: F,
) -> Result<PathBuf, DetectError>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    let pattern = Pattern::new(glob)?;
    let (tx, rx) = mpsc::channel();
    let mut watcher = RecommendedWatcher::new(tx, notify::Config::default())?;
    watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;
    debug!(watch_dir = %watch_dir.display(), glob, "Block device watcher started");

    trigger().map_err(|e| DetectError::Trigger(format!("{e:#}")))?;

    info!("Waiting for block device to appear");
    let path = loop {
        if cancel.is_cancelled() {
            return Err(DetectError::Cancelled);
        }
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(event)) => {
                if !matches!(event.kind, EventKind::Create(_)) {
                    continue;
                }
                if let Some(path) = event
                    .paths
                    .iter()
                    .find(|p| pattern.matches_path_with(p, DEVICE_MATCH))
                {
                    break path.clone();
                }
                trace!(paths = ?event.paths, "Ignoring created entry");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Watch error");
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(DetectError::Watch(notify::Error::generic("watcher channel closed")));
            }
        }
    };
    drop(watcher);

    info!(path = %path.display(), settle_secs = settle.as_secs(), "Block device appeared, settling");
    sleep_cancellable(settle, cancel)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_device_pattern() {
        let matches = |pattern: &str, path: &str| {
            Pattern::new(pattern).unwrap().matches_path_with(Path::new(path), DEVICE_MATCH)
        };
        assert!(matches("/dev/sd*", "/dev/sdb"));
        assert!(matches("/dev/sd*", "/dev/sd"));
        assert!(matches("/dev/sd?1", "/dev/sdc1"));
        assert!(!matches("/dev/sd*", "/dev/loop0"));
        assert!(!matches("/dev/*", "/dev/disk/by-id"));
        assert!(matches("/dev/disk/by-id/usb-*-0:0", "/dev/disk/by-id/usb-F-Secure_USB-0:0"));
    }

    #[test]
    fn test_bad_pattern_rejected_before_trigger() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let result = wait_for_block_device(dir.path(), "/dev/sd[", Duration::ZERO, &cancel, || {
            panic!("trigger must not run")
        });
        assert!(matches!(result, Err(DetectError::Pattern(_))));
    }

    #[test]
    fn test_new_device_detected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("sda"), b"").unwrap();
        let glob = format!("{}/sd*", dir.path().display());
        let cancel = CancellationToken::new();

        let root = dir.path().to_path_buf();
        let found = wait_for_block_device(dir.path(), &glob, Duration::ZERO, &cancel, move || {
            fs::write(root.join("loop0"), b"")?;
            fs::write(root.join("sdb"), b"")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(found, dir.path().join("sdb"));
    }

    #[test]
    fn test_existing_device_never_matches() {
        let dir = tempdir().unwrap();
        let existing = dir.path().join("sda");
        fs::write(&existing, b"").unwrap();
        let glob = format!("{}/sd*", dir.path().display());
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            stopper.cancel();
        });

        let result = wait_for_block_device(dir.path(), &glob, Duration::ZERO, &cancel, move || {
            fs::write(&existing, b"modified")?;
            Ok(())
        });
        assert!(matches!(result, Err(DetectError::Cancelled)));
        handle.join().unwrap();
    }

    #[test]
    fn test_trigger_failure() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let result = wait_for_block_device(dir.path(), "*", Duration::ZERO, &cancel, || {
            anyhow::bail!("SDP boot failed")
        });
        match result {
            Err(DetectError::Trigger(msg)) => assert!(msg.contains("SDP boot failed")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
