pub mod host;
pub mod kfd;
mod mapping;

use crate::error::ReproResult;
use crate::handle::ExportedHandle;
use std::fmt;

/// Index of a device as seen by this process (GPU ordinal).
pub type DeviceIndex = u32;

/// Allocation granularity of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Granularity {
    /// Physical commits are rounded to this.
    pub minimum: usize,
    /// Reservations are rounded to this.
    pub recommended: usize,
}

/// Free and total physical memory of a device, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub free: u64,
    pub total: u64,
}

/// One reference to physical memory, mapped at `va`.
///
/// Returned by [`MemoryDriver::commit`] and [`MemoryDriver::import`]; must be
/// handed back to [`MemoryDriver::decommit`] exactly once. Not `Clone` so the
/// reference cannot be released twice.
#[derive(Debug, PartialEq, Eq)]
pub struct RawPhysical {
    pub device: DeviceIndex,
    pub va: u64,
    pub size: usize,
    pub(crate) token: u64,
}

/// Device-driver memory primitives the virtual memory manager is built on.
///
/// Mirrors the reserve / create+map / unmap+release / export / import split of
/// a GPU virtual-memory API. Implementations keep committed memory CPU-visible
/// at the same address as the device address.
///
/// Backing memory is reference-counted by the driver: every `commit` or `import`
/// acquires a reference and every `decommit` releases one. The backing is freed
/// only when the last reference, in any process, is gone.
pub trait MemoryDriver: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn device_count(&self) -> u32;

    fn granularity(&self, device: DeviceIndex) -> ReproResult<Granularity>;

    fn memory_info(&self, device: DeviceIndex) -> ReproResult<MemoryInfo>;

    /// Claims `size` bytes of address space aligned to `align`, without backing.
    fn reserve_address(&self, device: DeviceIndex, size: usize, align: usize) -> ReproResult<u64>;

    /// Returns a range obtained from `reserve_address`. Nothing may be mapped in it.
    fn free_address(&self, device: DeviceIndex, base: u64, size: usize) -> ReproResult<()>;

    /// Creates `size` bytes of physical memory on `device` and maps it at `va`.
    fn commit(&self, device: DeviceIndex, va: u64, size: usize) -> ReproResult<RawPhysical>;

    /// Produces a transferable handle for the backing of `physical`.
    fn export(&self, physical: &RawPhysical) -> ReproResult<ExportedHandle>;

    /// Acquires a new reference to the backing named by `handle` and maps it at `va`.
    fn import(
        &self,
        device: DeviceIndex,
        va: u64,
        handle: &ExportedHandle,
    ) -> ReproResult<RawPhysical>;

    /// Unmaps `physical` and releases its reference to the backing.
    fn decommit(&self, physical: RawPhysical) -> ReproResult<()>;
}
