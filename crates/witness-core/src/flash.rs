//! Raw MMC writes through the recovery firmware's mass-storage device.

use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::layout::{MMC_BLOCK_SIZE, block_offset};

/// Blocks zeroed per write while wiping.
pub const WIPE_CHUNK_BLOCKS: u64 = 2048;
/// Minimum time between wipe progress reports.
pub const WIPE_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Short write flashing {label}: {written} of {expected} bytes")]
    ShortWrite {
        label: String,
        written: usize,
        expected: usize,
    },

    #[error("Failed to flash {label}: {source}")]
    Job {
        label: String,
        #[source]
        source: io::Error,
    },
}

/// One image to be written at a block address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashJob {
    pub label: String,
    pub image: Vec<u8>,
    pub start_block: u64,
}

impl FlashJob {
    pub fn new(label: impl Into<String>, image: Vec<u8>, start_block: u64) -> Self {
        Self {
            label: label.into(),
            image,
            start_block,
        }
    }

    pub fn offset(&self) -> u64 {
        block_offset(self.start_block)
    }
}

/// Seekable storage that can be flushed to the medium.
pub trait BlockDevice: Write + Seek {
    fn sync(&mut self) -> io::Result<()>;
}

impl BlockDevice for File {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

impl BlockDevice for Cursor<Vec<u8>> {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes flash jobs to a block device.
#[derive(Debug, Clone, Copy, Default)]
pub struct MmcFlasher;

impl MmcFlasher {
    pub fn new() -> Self {
        Self
    }

    fn open(path: &Path) -> Result<File, FlashError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| FlashError::Open {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Write `jobs` in order to the device at `path`.
    #[instrument(skip(self, jobs), fields(path = %path.display(), jobs = jobs.len()))]
    pub fn flash(&self, path: &Path, jobs: &[FlashJob]) -> Result<(), FlashError> {
        let mut dev = Self::open(path)?;
        self.flash_to(&mut dev, jobs)
    }

    /// Write `jobs` in order, syncing after each. Stops at the first failure.
    pub fn flash_to<D: BlockDevice + ?Sized>(&self, dev: &mut D, jobs: &[FlashJob]) -> Result<(), FlashError> {
        for job in jobs {
            self.write_job(dev, job)?;
            info!(
                job = %job.label,
                block = %format!("0x{:X}", job.start_block),
                len = job.image.len(),
                "Flashed"
            );
        }
        Ok(())
    }

    fn write_job<D: BlockDevice + ?Sized>(&self, dev: &mut D, job: &FlashJob) -> Result<(), FlashError> {
        let failed = |source| FlashError::Job {
            label: job.label.clone(),
            source,
        };

        dev.seek(SeekFrom::Start(job.offset())).map_err(failed)?;
        let written = write_counted(dev, &job.image).map_err(failed)?;
        if written != job.image.len() {
            return Err(FlashError::ShortWrite {
                label: job.label.clone(),
                written,
                expected: job.image.len(),
            });
        }
        dev.sync().map_err(failed)
    }

    /// Zero `blocks` blocks from `start_block` on the device at `path`.
    #[instrument(skip(self, on_progress), fields(path = %path.display()))]
    pub fn wipe_region(
        &self,
        path: &Path,
        start_block: u64,
        blocks: u64,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), FlashError> {
        let mut dev = Self::open(path)?;
        self.wipe_region_on(&mut dev, start_block, blocks, on_progress)
    }

    /// Zero a block range in chunks, reporting `(done, total)` blocks at most
    /// every [`WIPE_PROGRESS_INTERVAL`] and once at the end.
    pub fn wipe_region_on<D: BlockDevice + ?Sized>(
        &self,
        dev: &mut D,
        start_block: u64,
        blocks: u64,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), FlashError> {
        let label = format!("wipe 0x{:X}+0x{:X}", start_block, blocks);
        let failed = |source| FlashError::Job {
            label: label.clone(),
            source,
        };

        let zeros = vec![0u8; (WIPE_CHUNK_BLOCKS * MMC_BLOCK_SIZE) as usize];
        dev.seek(SeekFrom::Start(block_offset(start_block))).map_err(failed)?;

        let mut last_report = Instant::now();
        let mut done = 0;
        while done < blocks {
            let n = WIPE_CHUNK_BLOCKS.min(blocks - done);
            let chunk = &zeros[..(n * MMC_BLOCK_SIZE) as usize];
            let written = write_counted(dev, chunk).map_err(failed)?;
            if written != chunk.len() {
                return Err(FlashError::ShortWrite {
                    label: label.clone(),
                    written,
                    expected: chunk.len(),
                });
            }
            done += n;
            if last_report.elapsed() >= WIPE_PROGRESS_INTERVAL {
                on_progress(done, blocks);
                last_report = Instant::now();
            }
        }
        dev.sync().map_err(failed)?;
        on_progress(done, blocks);
        debug!(start_block, blocks, "Wipe complete");
        Ok(())
    }
}

/// Write until done or the device stops accepting data.
fn write_counted<W: Write + ?Sized>(dev: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match dev.write(&buf[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}
