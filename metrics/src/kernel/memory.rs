//! GPU-visible memory blocks
//!
//! Slot memory and the OA buffer are both reached through [`GpuMemory`]: a
//! GPU virtual address for emitted commands plus CPU read/write access for
//! readback.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use oa_metrics_shared::{Error, Result};

pub trait GpuMemory: Send + Sync + fmt::Debug {
    /// Address commands use to reach the first byte.
    fn gpu_address(&self) -> u64;

    fn size(&self) -> usize;

    /// Copy `out.len()` bytes starting at `offset`.
    fn read(&self, offset: usize, out: &mut [u8]) -> Result<()>;

    fn write(&self, offset: usize, data: &[u8]) -> Result<()>;
}

pub trait GpuMemoryAllocator: Send + Sync + fmt::Debug {
    fn allocate(&self, size: usize) -> Result<Arc<dyn GpuMemory>>;
}

/// Memory backed by a host vector. Clones share the same bytes.
#[derive(Clone)]
pub struct HostMemory {
    gpu_address: u64,
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl HostMemory {
    pub fn new(gpu_address: u64, size: usize) -> Self {
        Self {
            gpu_address,
            bytes: Arc::new(RwLock::new(vec![0; size])),
        }
    }

    /// Block holding existing bytes, e.g. an OA buffer captured to disk.
    pub fn from_bytes(gpu_address: u64, bytes: Vec<u8>) -> Self {
        Self {
            gpu_address,
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let size = self.size();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(Error::parameter(format!(
                "range {:#x}+{} outside of {} byte block at {:#x}",
                offset, len, size, self.gpu_address
            ))),
        }
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory")
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .field("size", &self.size())
            .finish()
    }
}

impl GpuMemory for HostMemory {
    fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    fn size(&self) -> usize {
        self.bytes.read().map(|b| b.len()).unwrap_or(0)
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        let bytes = self
            .bytes
            .read()
            .map_err(|_| Error::failed("gpu memory lock poisoned"))?;
        out.copy_from_slice(&bytes[offset..offset + out.len()]);
        Ok(())
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let mut bytes = self
            .bytes
            .write()
            .map_err(|_| Error::failed("gpu memory lock poisoned"))?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Hands out [`HostMemory`] blocks at increasing page-aligned addresses.
#[derive(Debug)]
pub struct HostAllocator {
    next_address: AtomicU64,
    limit: usize,
}

const PAGE_SIZE: u64 = 4096;

impl HostAllocator {
    pub fn new(base_address: u64) -> Self {
        Self::with_limit(base_address, usize::MAX)
    }

    /// Allocator refusing single blocks larger than `limit` bytes.
    pub fn with_limit(base_address: u64, limit: usize) -> Self {
        Self {
            next_address: AtomicU64::new(base_address),
            limit,
        }
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new(0x1_0000_0000)
    }
}

impl GpuMemoryAllocator for HostAllocator {
    fn allocate(&self, size: usize) -> Result<Arc<dyn GpuMemory>> {
        if size == 0 {
            return Err(Error::parameter("zero sized gpu allocation"));
        }
        if size > self.limit {
            return Err(Error::OutOfMemory(size));
        }

        let span = (size as u64).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let address = self.next_address.fetch_add(span, Ordering::Relaxed);
        Ok(Arc::new(HostMemory::new(address, size)))
    }
}
