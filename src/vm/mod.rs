//! VM collaborator - out-of-line memory ownership
//!
//! Based on Mach4 vm/vm_map.h/c
//!
//! The IPC core never manipulates address spaces itself. Out-of-line
//! descriptors go through the [`VmMap`] trait: copy-in *pins* a source
//! range into an owned [`VmMapCopy`], copy-out *maps* that copy into the
//! receiver (or overwrites a caller-chosen scatter region). [`SimpleMap`]
//! is a small in-memory map used by tests and by hosts without a real VM.

use std::collections::BTreeMap;
use std::fmt;

use spin::Mutex;

use crate::config::DEFAULT_REGION_LIMIT;
use crate::ipc::{IpcError, IpcResult};

/// Virtual address within a map
pub type VmAddress = u64;

/// Allocation granule of `SimpleMap`
pub const PAGE_SIZE: u64 = 4096;

/// First address handed out by `SimpleMap`
const MAP_MIN_ADDRESS: VmAddress = 0x1_0000;

#[inline]
fn round_page(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

// ============================================================================
// VmMapCopy
// ============================================================================

/// Kernel-owned snapshot of a memory range in flight (vm_map_copy_t)
///
/// Dropping it releases the memory.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct VmMapCopy {
    data: Vec<u8>,
}

impl VmMapCopy {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for VmMapCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmMapCopy").field("len", &self.data.len()).finish()
    }
}

// ============================================================================
// VmMap trait
// ============================================================================

/// Memory-ownership interface consumed by copy-in / copy-out
pub trait VmMap: Send + Sync {
    /// Borrow `[address, address + size)` into a kernel-held copy
    ///
    /// Fails with `InvalidMemory` if the range is not fully mapped.
    fn pin_region(&self, address: VmAddress, size: usize) -> IpcResult<VmMapCopy>;

    /// Remove a source range after it was sent with the deallocate flag
    fn deallocate(&self, address: VmAddress, size: usize) -> IpcResult<()>;

    /// Map a copy at a fresh address chosen by the map
    fn map_region(&self, copy: &VmMapCopy) -> IpcResult<VmAddress>;

    /// Write a copy over an existing range, returning the previous contents
    fn overwrite_region(&self, address: VmAddress, copy: &VmMapCopy) -> IpcResult<VmMapCopy>;

    /// Undo a `map_region`
    fn unmap_region(&self, address: VmAddress, size: usize) -> IpcResult<()>;
}

// ============================================================================
// SimpleMap
// ============================================================================

#[derive(Debug)]
struct MapInner {
    /// Regions keyed by start address
    regions: BTreeMap<VmAddress, Vec<u8>>,
    /// Hint for next allocation
    first_free: VmAddress,
}

impl MapInner {
    /// Start address and offset of the region containing the whole range
    fn locate(&self, address: VmAddress, size: usize) -> IpcResult<(VmAddress, usize)> {
        let (&start, data) = self
            .regions
            .range(..=address)
            .next_back()
            .ok_or(IpcError::InvalidMemory)?;
        let offset = (address - start) as usize;
        let end = offset.checked_add(size).ok_or(IpcError::InvalidMemory)?;
        if end > data.len() {
            return Err(IpcError::InvalidMemory);
        }
        Ok((start, offset))
    }
}

/// In-memory address map
#[derive(Debug)]
pub struct SimpleMap {
    inner: Mutex<MapInner>,
    region_limit: usize,
}

impl SimpleMap {
    pub fn new() -> Self {
        Self::with_region_limit(DEFAULT_REGION_LIMIT)
    }

    pub fn with_region_limit(region_limit: usize) -> Self {
        Self {
            inner: Mutex::new(MapInner {
                regions: BTreeMap::new(),
                first_free: MAP_MIN_ADDRESS,
            }),
            region_limit,
        }
    }

    /// Allocate a region holding `data` (vm_allocate + write)
    pub fn allocate(&self, data: &[u8]) -> IpcResult<VmAddress> {
        let mut inner = self.inner.lock();
        if inner.regions.len() >= self.region_limit {
            return Err(IpcError::ResourceExhausted);
        }
        let address = inner.first_free;
        // One guard page between regions.
        inner.first_free += round_page(data.len().max(1) as u64) + PAGE_SIZE;
        inner.regions.insert(address, data.to_vec());
        Ok(address)
    }

    /// Read `size` bytes at `address`
    pub fn read(&self, address: VmAddress, size: usize) -> IpcResult<Vec<u8>> {
        let inner = self.inner.lock();
        let (start, offset) = inner.locate(address, size)?;
        Ok(inner.regions[&start][offset..offset + size].to_vec())
    }

    /// Write `data` at `address` inside an existing region
    pub fn write(&self, address: VmAddress, data: &[u8]) -> IpcResult<()> {
        let mut inner = self.inner.lock();
        let (start, offset) = inner.locate(address, data.len())?;
        if let Some(region) = inner.regions.get_mut(&start) {
            region[offset..offset + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    /// Whether `address` starts a mapped region
    pub fn is_mapped(&self, address: VmAddress) -> bool {
        self.inner.lock().regions.contains_key(&address)
    }

    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }

    fn remove_whole(&self, address: VmAddress, size: usize) -> IpcResult<()> {
        let mut inner = self.inner.lock();
        match inner.regions.get(&address) {
            Some(region) if region.len() == size => {
                inner.regions.remove(&address);
                Ok(())
            }
            _ => Err(IpcError::InvalidMemory),
        }
    }
}

impl Default for SimpleMap {
    fn default() -> Self {
        Self::new()
    }
}

impl VmMap for SimpleMap {
    fn pin_region(&self, address: VmAddress, size: usize) -> IpcResult<VmMapCopy> {
        if size == 0 {
            return Ok(VmMapCopy::default());
        }
        self.read(address, size).map(VmMapCopy::from_bytes)
    }

    fn deallocate(&self, address: VmAddress, size: usize) -> IpcResult<()> {
        if size == 0 {
            return Ok(());
        }
        self.remove_whole(address, size)
    }

    fn map_region(&self, copy: &VmMapCopy) -> IpcResult<VmAddress> {
        self.allocate(copy.as_bytes())
    }

    fn overwrite_region(&self, address: VmAddress, copy: &VmMapCopy) -> IpcResult<VmMapCopy> {
        let mut inner = self.inner.lock();
        let (start, offset) = inner.locate(address, copy.len())?;
        let region = inner
            .regions
            .get_mut(&start)
            .ok_or(IpcError::InvalidMemory)?;
        let window = &mut region[offset..offset + copy.len()];
        let previous = window.to_vec();
        window.copy_from_slice(copy.as_bytes());
        Ok(VmMapCopy::from_bytes(previous))
    }

    fn unmap_region(&self, address: VmAddress, size: usize) -> IpcResult<()> {
        self.remove_whole(address, size)
    }
}
