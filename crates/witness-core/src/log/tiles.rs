//! Hash tiles (tlog-tiles layout).
//!
//! A tile at tile level `L` and index `N` holds up to 256 consecutive hashes
//! of tree level `8 * L`, starting at hash `N * 256`. Full tiles live at
//! `tile/L/N`, partial ones at `tile/L/N.p/W`, with `N` split into 3-digit
//! groups where all but the last carry an `x` prefix (`x001/x234/067`).

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use super::fetcher::LogFetcher;
use super::merkle::{HashSource, node_hash};
use super::{HASH_SIZE, Hash, LogError};

pub const TILE_HEIGHT: u8 = 8;
pub const TILE_WIDTH: u64 = 1 << TILE_HEIGHT;

/// Path of the tile at `level`/`index` holding `width` hashes.
pub fn tile_path(level: u8, index: u64, width: u64) -> String {
    let mut path = format!("tile/{level}/{}", encode_index(index));
    if width < TILE_WIDTH {
        path.push_str(&format!(".p/{width}"));
    }
    path
}

/// Inverse of [`tile_path`]: `(level, index, width)`.
pub fn parse_tile_path(path: &str) -> Option<(u8, u64, u64)> {
    let rest = path.strip_prefix("tile/")?;
    let (level, rest) = rest.split_once('/')?;
    let level: u8 = level.parse().ok()?;
    let (index_part, width) = match rest.split_once(".p/") {
        Some((index, width)) => {
            let width: u64 = width.parse().ok()?;
            if width == 0 || width >= TILE_WIDTH {
                return None;
            }
            (index, width)
        }
        None => (rest, TILE_WIDTH),
    };

    let groups: Vec<&str> = index_part.split('/').collect();
    let (last, leading) = groups.split_last()?;
    let mut index: u64 = 0;
    for group in leading {
        let digits = group.strip_prefix('x')?;
        index = index.checked_mul(1000)?.checked_add(parse_group(digits)?)?;
    }
    index = index.checked_mul(1000)?.checked_add(parse_group(last)?)?;
    Some((level, index, width))
}

fn parse_group(digits: &str) -> Option<u64> {
    if digits.len() != 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn encode_index(mut n: u64) -> String {
    let mut groups = vec![format!("{:03}", n % 1000)];
    n /= 1000;
    while n > 0 {
        groups.push(format!("x{:03}", n % 1000));
        n /= 1000;
    }
    groups.reverse();
    groups.join("/")
}

/// [`HashSource`] reading hash tiles through a [`LogFetcher`] for a tree of
/// a fixed size.
pub struct TileHashSource<'a> {
    fetcher: &'a dyn LogFetcher,
    size: u64,
    cache: Mutex<HashMap<(u8, u64), Vec<u8>>>,
}

impl<'a> TileHashSource<'a> {
    pub fn new(fetcher: &'a dyn LogFetcher, size: u64) -> Self {
        Self {
            fetcher,
            size,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn tile(&self, level: u8, index: u64, width: u64) -> Result<Vec<u8>, LogError> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tile) = cache.get(&(level, index)) {
            return Ok(tile.clone());
        }

        let path = tile_path(level, index, width);
        let data = match self.fetcher.fetch(&path) {
            Ok(data) => data,
            // Partial tiles may be gone once the full tile exists.
            Err(LogError::NotFound(_)) if width < TILE_WIDTH => {
                debug!(path = %path, "Partial tile missing, trying full tile");
                self.fetcher.fetch(&tile_path(level, index, TILE_WIDTH))?
            }
            Err(e) => return Err(e),
        };

        let need = width as usize * HASH_SIZE;
        if data.len() < need || data.len() % HASH_SIZE != 0 {
            return Err(LogError::Tile {
                path,
                message: format!("{} bytes, need {need}", data.len()),
            });
        }
        let data = data[..need].to_vec();
        cache.insert((level, index), data.clone());
        Ok(data)
    }
}

impl HashSource for TileHashSource<'_> {
    fn node_hash(&self, level: u8, index: u64) -> Result<Hash, LogError> {
        let tile_level = level / TILE_HEIGHT;
        let stored_level = tile_level * TILE_HEIGHT;
        let rise = level - stored_level;
        let first = index << rise;
        let count = 1u64 << rise;

        let available = self.size >> stored_level;
        if first + count > available {
            return Err(LogError::OutOfRange {
                what: format!("node {level}/{index}"),
                size: self.size,
            });
        }

        let tile_index = first / TILE_WIDTH;
        let offset = (first % TILE_WIDTH) as usize;
        let width = (available - tile_index * TILE_WIDTH).min(TILE_WIDTH);
        let tile = self.tile(tile_level, tile_index, width)?;

        let mut hashes: Vec<Hash> = tile[offset * HASH_SIZE..(offset + count as usize) * HASH_SIZE]
            .chunks_exact(HASH_SIZE)
            .map(|c| {
                let mut h = [0u8; HASH_SIZE];
                h.copy_from_slice(c);
                h
            })
            .collect();
        while hashes.len() > 1 {
            hashes = hashes.chunks_exact(2).map(|p| node_hash(&p[0], &p[1])).collect();
        }
        Ok(hashes[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::merkle::{LeafHashes, ProofBuilder, leaf_hash};
    use crate::log::memory::MemoryLog;

    #[test]
    fn test_tile_paths() {
        assert_eq!(tile_path(0, 0, 256), "tile/0/000");
        assert_eq!(tile_path(0, 5, 10), "tile/0/005.p/10");
        assert_eq!(tile_path(1, 1234067, 256), "tile/1/x001/x234/067");
        assert_eq!(tile_path(2, 1000, 3), "tile/2/x001/000.p/3");

        assert_eq!(parse_tile_path("tile/1/x001/x234/067"), Some((1, 1234067, 256)));
        assert_eq!(parse_tile_path("tile/0/005.p/10"), Some((0, 5, 10)));
        assert_eq!(parse_tile_path("tile/0/5"), None);
        assert_eq!(parse_tile_path("tile/0/x001"), None);
        assert_eq!(parse_tile_path("tile/0/000.p/256"), None);
        assert_eq!(parse_tile_path("checkpoint"), None);
    }

    #[test]
    fn test_tile_source_matches_memory_tree() {
        let mut log = MemoryLog::new("tiles-test").unwrap();
        for i in 0..300 {
            log.append(format!("entry {i}").as_bytes());
        }
        let leaves: Vec<Hash> = (0..300)
            .map(|i| leaf_hash(format!("entry {i}").as_bytes()))
            .collect();
        let memory = LeafHashes(&leaves);

        for size in [1u64, 7, 255, 256, 257, 300] {
            let tiles = TileHashSource::new(&log, size);
            let expected = ProofBuilder::new(&memory, size);
            let actual = ProofBuilder::new(&tiles, size);
            assert_eq!(actual.root().unwrap(), expected.root().unwrap(), "size {size}");
            let index = size / 2;
            assert_eq!(
                actual.inclusion_proof(index).unwrap(),
                expected.inclusion_proof(index).unwrap()
            );
        }
    }

    #[test]
    fn test_node_beyond_tree() {
        let mut log = MemoryLog::new("tiles-test").unwrap();
        for i in 0..4 {
            log.append(&[i]);
        }
        let tiles = TileHashSource::new(&log, 4);
        assert!(tiles.node_hash(0, 3).is_ok());
        assert!(matches!(tiles.node_hash(0, 4), Err(LogError::OutOfRange { .. })));
        assert!(matches!(tiles.node_hash(3, 0), Err(LogError::OutOfRange { .. })));
    }
}
