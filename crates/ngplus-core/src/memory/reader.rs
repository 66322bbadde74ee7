use crate::error::{Error, Result};
use crate::memory::MemoryRegion;

/// Read access to a foreign address space.
pub trait ReadMemory {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    /// Base address of the process's primary module.
    fn base_address(&self) -> u64;

    /// Size in bytes of the primary module image.
    fn module_size(&self) -> usize;

    fn read_u64(&self, address: u64) -> Result<u64> {
        to_array::<8>(address, self.read_bytes(address, 8)?).map(u64::from_le_bytes)
    }

    fn read_i32(&self, address: u64) -> Result<i32> {
        to_array::<4>(address, self.read_bytes(address, 4)?).map(i32::from_le_bytes)
    }
}

fn to_array<const N: usize>(address: u64, bytes: Vec<u8>) -> Result<[u8; N]> {
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| Error::access(address, format!("short read: {len} of {N} bytes")))
}

/// Write access to a foreign address space.
pub trait WriteMemory {
    /// Writes all of `data` or fails; partial writes are reported as errors.
    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<()>;

    fn write_i32(&self, address: u64, value: i32) -> Result<()> {
        self.write_bytes(address, &value.to_le_bytes())
    }
}

/// Full access to a live process: read, write, region enumeration, liveness.
pub trait MemoryAccess: ReadMemory + WriteMemory + Send + Sync {
    /// Committed, readable regions of the address space in ascending order.
    fn mapped_regions(&self) -> Result<Vec<MemoryRegion>>;

    /// Whether the process behind this handle is still running.
    fn is_alive(&self) -> bool;
}
