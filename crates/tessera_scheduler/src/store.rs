//! # Cell Storage
//!
//! The pipeline asks a [`CellStore`] once per cell whether persisted data
//! exists; stages at or below the persisted stage are then loaded instead
//! of generated. Unloaded cells are written back.
//!
//! ## File Format ([`CompressedCellStore`])
//!
//! One file per cell, `c.<x>.<z>.tsc`:
//!
//! ```text
//! [28 bytes: StoreHeader (magic "TSCL", version, heightmap count,
//!            x, z, stage, payload length, CRC32 of body)]
//! [N bytes:  LZ4 body, size-prepended]
//!
//! Body (uncompressed):
//! [payload_len bytes: payload]
//! per heightmap: [1 byte: kind][256 x u16 LE: values]
//! ```
//!
//! Files are written to a temporary name and renamed into place.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use parking_lot::RwLock;
use tessera_shared::{CellCoord, CELL_AREA};

use crate::cell::{Cell, CellView, Heightmap, HeightmapKind};
use crate::error::{StoreError, StoreResult};
use crate::stage::StageId;

/// Persistence seam for generated cells.
pub trait CellStore: Send + Sync {
    /// Loads the persisted cell, if any.
    ///
    /// # Errors
    ///
    /// Returns error if stored data exists but cannot be read.
    fn load(&self, coord: CellCoord) -> StoreResult<Option<Cell>>;

    /// Persists a cell, replacing earlier data.
    ///
    /// # Errors
    ///
    /// Returns error if the cell cannot be written.
    fn store(&self, cell: &Cell) -> StoreResult<()>;

    /// Whether persisted data exists.
    ///
    /// # Errors
    ///
    /// Returns error if the lookup itself fails.
    fn contains(&self, coord: CellCoord) -> StoreResult<bool> {
        Ok(self.load(coord)?.is_some())
    }
}

/// Store that keeps nothing. Every cell is generated from scratch.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl CellStore for NullStore {
    fn load(&self, _coord: CellCoord) -> StoreResult<Option<Cell>> {
        Ok(None)
    }

    fn store(&self, _cell: &Cell) -> StoreResult<()> {
        Ok(())
    }
}

/// In-memory store, mostly for tests and short-lived worlds.
#[derive(Debug, Default)]
pub struct MemoryCellStore {
    cells: RwLock<HashMap<CellCoord, Cell>>,
}

impl MemoryCellStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }
}

impl CellStore for MemoryCellStore {
    fn load(&self, coord: CellCoord) -> StoreResult<Option<Cell>> {
        Ok(self.cells.read().get(&coord).cloned())
    }

    fn store(&self, cell: &Cell) -> StoreResult<()> {
        self.cells.write().insert(cell.coord(), cell.clone());
        Ok(())
    }

    fn contains(&self, coord: CellCoord) -> StoreResult<bool> {
        Ok(self.cells.read().contains_key(&coord))
    }
}

/// Magic bytes identifying a cell file.
const STORE_MAGIC: u32 = u32::from_le_bytes(*b"TSCL");

/// Current cell file version.
const STORE_VERSION: u16 = 1;

/// Bytes per stored heightmap: kind + one u16 per column.
const HEIGHTMAP_BYTES: usize = 1 + CELL_AREA * 2;

/// Fixed-size header at the start of every cell file.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct StoreHeader {
    magic: u32,
    version: u16,
    heightmap_count: u16,
    x: i32,
    z: i32,
    stage: u32,
    payload_len: u32,
    crc: u32,
}

const HEADER_LEN: usize = std::mem::size_of::<StoreHeader>();

/// LZ4-compressed, CRC-checked store with one file per cell.
#[derive(Debug, Clone)]
pub struct CompressedCellStore {
    root: PathBuf,
}

impl CompressedCellStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory holding the cell files.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, coord: CellCoord) -> PathBuf {
        self.root.join(format!("c.{}.{}.tsc", coord.x, coord.z))
    }

    fn encode(cell: &Cell) -> Vec<u8> {
        let payload = cell.payload();
        let mut body = Vec::with_capacity(payload.len() + HeightmapKind::ALL.len() * HEIGHTMAP_BYTES);
        body.extend_from_slice(payload);
        let mut heightmap_count = 0u16;
        for (kind, map) in cell.iter_heightmaps() {
            body.push(kind as u8);
            for value in map.as_slice() {
                body.extend_from_slice(&value.to_le_bytes());
            }
            heightmap_count += 1;
        }
        let compressed = compress_prepend_size(&body);

        let coord = cell.coord();
        let header = StoreHeader {
            magic: STORE_MAGIC,
            version: STORE_VERSION,
            heightmap_count,
            x: coord.x,
            z: coord.z,
            stage: cell.stage().index(),
            payload_len: payload.len() as u32,
            crc: crc32fast::hash(&compressed),
        };

        let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
        out.extend_from_slice(bytemuck::bytes_of(&header));
        out.extend_from_slice(&compressed);
        out
    }

    fn decode(coord: CellCoord, bytes: &[u8]) -> StoreResult<Cell> {
        let corrupt = |reason: &str| StoreError::Corrupt {
            cell: coord,
            reason: reason.to_string(),
        };

        if bytes.len() < HEADER_LEN {
            return Err(corrupt("truncated header"));
        }
        let header: StoreHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_LEN]);
        if header.magic != STORE_MAGIC {
            return Err(corrupt("bad magic"));
        }
        if header.version != STORE_VERSION {
            return Err(corrupt(&format!("unsupported version {}", header.version)));
        }
        if CellCoord::new(header.x, header.z) != coord {
            return Err(corrupt("coordinate mismatch"));
        }
        let compressed = &bytes[HEADER_LEN..];
        if crc32fast::hash(compressed) != header.crc {
            return Err(corrupt("checksum mismatch"));
        }
        let body = decompress_size_prepended(compressed)
            .map_err(|e| corrupt(&format!("decompression failed: {e}")))?;

        let payload_len = header.payload_len as usize;
        let expected = payload_len + usize::from(header.heightmap_count) * HEIGHTMAP_BYTES;
        if body.len() != expected {
            return Err(corrupt("body length mismatch"));
        }
        let (payload, mut rest) = body.split_at(payload_len);

        let mut heightmaps = BTreeMap::new();
        while !rest.is_empty() {
            let (block, tail) = rest.split_at(HEIGHTMAP_BYTES);
            let kind = HeightmapKind::from_u8(block[0]).ok_or_else(|| corrupt("unknown heightmap kind"))?;
            let values = block[1..]
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .collect();
            let map = Heightmap::from_values(values).ok_or_else(|| corrupt("heightmap size"))?;
            heightmaps.insert(kind, map);
            rest = tail;
        }

        Ok(Cell::from_parts(
            coord,
            StageId::new(header.stage),
            payload.to_vec(),
            heightmaps,
        ))
    }
}

impl CellStore for CompressedCellStore {
    fn load(&self, coord: CellCoord) -> StoreResult<Option<Cell>> {
        let bytes = match fs::read(self.path_for(coord)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::decode(coord, &bytes).map(Some)
    }

    fn store(&self, cell: &Cell) -> StoreResult<()> {
        let path = self.path_for(cell.coord());
        let tmp = path.with_extension("tsc.tmp");
        fs::write(&tmp, Self::encode(cell))?;
        fs::rename(&tmp, &path)?;
        tracing::trace!("stored cell {} at stage {}", cell.coord(), cell.stage());
        Ok(())
    }

    fn contains(&self, coord: CellCoord) -> StoreResult<bool> {
        Ok(self.path_for(coord).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellViewMut;

    fn temp_store() -> CompressedCellStore {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        CompressedCellStore::open(std::env::temp_dir().join(format!("tessera_store_{id}"))).unwrap()
    }

    fn sample(coord: CellCoord) -> Cell {
        let mut cell = Cell::empty(coord);
        cell.set_stage(StageId::new(4));
        cell.payload_mut().extend((0..200u8).cycle().take(1000));
        cell.heightmap_mut(HeightmapKind::OceanFloorWg).set(2, 3, 61);
        cell.heightmap_mut(HeightmapKind::WorldSurface).set(15, 15, 90);
        cell
    }

    #[test]
    fn test_header_is_packed() {
        assert_eq!(HEADER_LEN, 28);
    }

    #[test]
    fn test_compressed_store_keeps_cell() {
        let store = temp_store();
        let coord = CellCoord::new(-3, 12);
        assert!(store.load(coord).unwrap().is_none());
        assert!(!store.contains(coord).unwrap());

        let cell = sample(coord);
        store.store(&cell).unwrap();
        assert!(store.contains(coord).unwrap());
        assert_eq!(store.load(coord).unwrap(), Some(cell));

        fs::remove_dir_all(store.root()).ok();
    }

    #[test]
    fn test_corruption_is_detected() {
        let store = temp_store();
        let coord = CellCoord::new(1, 1);
        store.store(&sample(coord)).unwrap();

        let path = store.path_for(coord);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = store.load(coord).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { cell, .. } if cell == coord));

        fs::write(&path, &bytes[..10]).unwrap();
        assert!(store.load(coord).is_err());

        fs::remove_dir_all(store.root()).ok();
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCellStore::new();
        let cell = sample(CellCoord::new(9, 9));
        store.store(&cell).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load(CellCoord::new(9, 9)).unwrap(), Some(cell));
        assert!(NullStore.load(CellCoord::new(9, 9)).unwrap().is_none());
    }
}
