use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use memmap2::{Mmap, MmapMut};

use crate::error::FdError;

/// Every region file starts with this 8-byte preamble. `count` is the number
/// of valid entries, `size_hash` pins the entry struct size across binary
/// upgrades, `generation` is bumped by whoever rewrites the table wholesale
/// (readers resync positions when it changes), `version` is the layout
/// version and unknown values refuse to attach.
pub const REGION_HEADER_SIZE: usize = 8;

const OFF_COUNT: usize = 0;
const OFF_SIZE_HASH: usize = 4;
const OFF_GENERATION: usize = 6;
const OFF_VERSION: usize = 7;

/// Entry types stored in a region. Entries are plain `repr(C)` structs,
/// written in place; the region layer never interprets them.
pub trait RegionEntry: Copy {
    const VERSION: u8;
}

fn size_hash<T>() -> u16 {
    (std::mem::size_of::<T>() & 0xffff) as u16
}

fn check_header<T: RegionEntry>(path: &Path, buf: &[u8]) -> Result<(), FdError> {
    if buf.len() < REGION_HEADER_SIZE {
        return Err(FdError::RegionTruncated(path.to_path_buf()));
    }
    let version = buf[OFF_VERSION];
    if version != T::VERSION {
        return Err(FdError::RegionVersion(path.to_path_buf(), version, T::VERSION));
    }
    let hash = u16::from_le_bytes([buf[OFF_SIZE_HASH], buf[OFF_SIZE_HASH + 1]]);
    if hash != size_hash::<T>() {
        return Err(FdError::RegionSizeHash(path.to_path_buf(), hash, size_hash::<T>()));
    }
    let count = i32::from_le_bytes(buf[OFF_COUNT..OFF_COUNT + 4].try_into().unwrap());
    let capacity = (buf.len() - REGION_HEADER_SIZE) / std::mem::size_of::<T>();
    if count < 0 || count as usize > capacity {
        return Err(FdError::RegionTruncated(path.to_path_buf()));
    }
    Ok(())
}

/// Writable attachment to a named memory-mapped table. The distribution
/// core is the sole writer of its regions; sibling processes attach
/// passively and tolerate momentary inconsistency.
pub struct Region<T: RegionEntry> {
    file: File,
    map: MmapMut,
    path: PathBuf,
    _entry: PhantomData<T>,
}

impl<T: RegionEntry> Region<T> {
    /// Create the region file if missing (sized for `initial_capacity`
    /// entries) and map it read-write. An existing file is validated
    /// against version and entry size before use.
    pub fn open_active(path: &Path, initial_capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open region {}", path.display()))?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            let size = REGION_HEADER_SIZE + initial_capacity * std::mem::size_of::<T>();
            file.set_len(size as u64)?;
            let mut map = unsafe { MmapMut::map_mut(&file)? };
            map[OFF_SIZE_HASH..OFF_SIZE_HASH + 2].copy_from_slice(&size_hash::<T>().to_le_bytes());
            map[OFF_VERSION] = T::VERSION;
            map.flush()?;
            return Ok(Region { file, map, path: path.to_path_buf(), _entry: PhantomData });
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        check_header::<T>(path, &map)?;
        Ok(Region { file, map, path: path.to_path_buf(), _entry: PhantomData })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> usize {
        i32::from_le_bytes(self.map[OFF_COUNT..OFF_COUNT + 4].try_into().unwrap()) as usize
    }

    pub fn set_count(&mut self, count: usize) {
        let count = count.min(self.capacity()) as i32;
        self.map[OFF_COUNT..OFF_COUNT + 4].copy_from_slice(&count.to_le_bytes());
    }

    pub fn generation(&self) -> u8 {
        self.map[OFF_GENERATION]
    }

    pub fn bump_generation(&mut self) {
        self.map[OFF_GENERATION] = self.map[OFF_GENERATION].wrapping_add(1);
    }

    /// Total entry slots the mapping can hold before a grow is needed.
    pub fn capacity(&self) -> usize {
        (self.map.len() - REGION_HEADER_SIZE) / std::mem::size_of::<T>()
    }

    /// All mapped slots, valid and spare alike. Callers index by `count()`.
    pub fn entries(&self) -> &[T] {
        let ptr = unsafe { self.map.as_ptr().add(REGION_HEADER_SIZE) } as *const T;
        debug_assert_eq!(ptr.align_offset(std::mem::align_of::<T>()), 0);
        unsafe { std::slice::from_raw_parts(ptr, self.capacity()) }
    }

    pub fn entries_mut(&mut self) -> &mut [T] {
        let capacity = self.capacity();
        let ptr = unsafe { self.map.as_mut_ptr().add(REGION_HEADER_SIZE) } as *mut T;
        debug_assert_eq!(ptr.align_offset(std::mem::align_of::<T>()), 0);
        unsafe { std::slice::from_raw_parts_mut(ptr, capacity) }
    }

    /// Grow the file by `additional` entry slots and remap. The new tail is
    /// zero-filled by the filesystem. Passive readers re-check the size and
    /// count on every pass, so no coordination is needed here.
    pub fn grow(&mut self, additional: usize) -> Result<()> {
        self.map.flush()?;
        let new_len =
            self.map.len() as u64 + (additional * std::mem::size_of::<T>()) as u64;
        self.file.set_len(new_len)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Append a new valid entry, growing by `chunk` slots when the table is
    /// full. Returns the entry's position.
    pub fn push(&mut self, entry: T, chunk: usize) -> Result<usize> {
        let count = self.count();
        if count == self.capacity() {
            self.grow(chunk.max(1))?;
        }
        self.entries_mut()[count] = entry;
        self.set_count(count + 1);
        Ok(count)
    }
}

/// Read-only attachment used by `status` and sibling processes. Never
/// resizes the file; a grow by the active writer is picked up by
/// re-attaching.
pub struct RegionView<T: RegionEntry> {
    map: Mmap,
    path: PathBuf,
    _entry: PhantomData<T>,
}

impl<T: RegionEntry> RegionView<T> {
    pub fn attach_passive(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open region {}", path.display()))?;
        let map = unsafe { Mmap::map(&file)? };
        check_header::<T>(path, &map)?;
        Ok(RegionView { map, path: path.to_path_buf(), _entry: PhantomData })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> usize {
        i32::from_le_bytes(self.map[OFF_COUNT..OFF_COUNT + 4].try_into().unwrap()) as usize
    }

    pub fn generation(&self) -> u8 {
        self.map[OFF_GENERATION]
    }

    pub fn entries(&self) -> &[T] {
        let capacity = (self.map.len() - REGION_HEADER_SIZE) / std::mem::size_of::<T>();
        let ptr = unsafe { self.map.as_ptr().add(REGION_HEADER_SIZE) } as *const T;
        unsafe { std::slice::from_raw_parts(ptr, capacity) }
    }
}
