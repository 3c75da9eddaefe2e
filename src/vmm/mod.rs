//! Device virtual memory: address reservations with physical memory committed
//! into sub-ranges, and export/import of that memory between processes.

pub mod manager;
pub mod range;

pub use manager::VirtualMemoryManager;

use crate::driver::DeviceIndex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub(crate) u64);

/// A contiguous range of device address space with no implied backing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualReservation {
    pub id: ReservationId,
    pub base: u64,
    /// Rounded up to the device's recommended granularity.
    pub size: usize,
    pub device: DeviceIndex,
    /// Wall time the driver spent reserving the range.
    pub reserve_latency: Duration,
}

impl VirtualReservation {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base + self.size as u64
    }
}

/// Physical memory mapped into a sub-range of a reservation.
///
/// This is a plain value; copies name the same allocation, and once it is
/// deallocated every copy becomes stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAllocation {
    pub id: AllocationId,
    pub reservation: ReservationId,
    pub device: DeviceIndex,
    pub offset: usize,
    pub size: usize,
    pub va: u64,
    /// Mapped from another allocation's exported handle.
    pub imported: bool,
}

impl PhysicalAllocation {
    /// CPU pointer to the mapping. Valid until the allocation is deallocated.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.va as *mut u8
    }
}
