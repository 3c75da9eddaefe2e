#![allow(clippy::cast_possible_truncation)]

use super::range::{RangeAllocator, RangeConflict};
use super::{AllocationId, PhysicalAllocation, ReservationId, VirtualReservation};
use crate::driver::{DeviceIndex, Granularity, MemoryDriver, MemoryInfo, RawPhysical};
use crate::error::{ReproError, ReproResult, fatal};
use crate::handle::ExportedHandle;
use crate::utils::round_to_granularity;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

// Process-wide; IDs are unique across managers.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct ReservationState {
    info: VirtualReservation,
    granularity: Granularity,
    // Offsets relative to the reservation base.
    ranges: RangeAllocator,
}

#[derive(Debug)]
struct AllocationRecord {
    info: PhysicalAllocation,
    physical: RawPhysical,
}

/// Reserves device address space and commits physical memory into it.
///
/// Every mutating operation takes `&mut self`: a manager, and every reservation
/// it owns, has a single writer. Share one across threads behind a `Mutex`.
#[derive(Debug)]
pub struct VirtualMemoryManager {
    driver: Arc<dyn MemoryDriver>,
    reservations: HashMap<ReservationId, ReservationState>,
    allocations: HashMap<AllocationId, AllocationRecord>,
}

fn range_error(conflict: RangeConflict, offset: Option<usize>, size: usize, total: usize) -> ReproError {
    match conflict {
        RangeConflict::OutOfBounds => ReproError::Range(format!(
            "{size} bytes at offset {} do not fit a {total}-byte reservation",
            offset.map_or_else(|| "auto".to_string(), |o| o.to_string())
        )),
        RangeConflict::Overlap { start, size: len } => ReproError::Range(format!(
            "{size} bytes at offset {} overlap the allocation at {start}+{len}",
            offset.unwrap_or_default()
        )),
        RangeConflict::Exhausted => ReproError::Range(format!(
            "no free {size}-byte sub-range left in a {total}-byte reservation"
        )),
    }
}

impl VirtualMemoryManager {
    #[must_use]
    pub fn new(driver: Arc<dyn MemoryDriver>) -> Self {
        Self {
            driver,
            reservations: HashMap::new(),
            allocations: HashMap::new(),
        }
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn MemoryDriver> {
        &self.driver
    }

    fn next_id() -> u64 {
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    }

    fn live_reservation(&self, reservation: &VirtualReservation) -> ReproResult<&ReservationState> {
        self.reservations
            .get(&reservation.id)
            .filter(|state| state.info == *reservation)
            .ok_or_else(|| {
                ReproError::InvalidHandle(format!(
                    "reservation at 0x{:x} is not live in this manager",
                    reservation.base
                ))
            })
    }

    fn live_allocation(&self, allocation: &PhysicalAllocation) -> ReproResult<&AllocationRecord> {
        self.allocations
            .get(&allocation.id)
            .filter(|record| record.info == *allocation)
            .ok_or_else(|| {
                ReproError::InvalidHandle(format!(
                    "allocation at offset {} of reservation {:?} is not live in this manager",
                    allocation.offset, allocation.reservation
                ))
            })
    }

    pub fn granularity(&self, device: DeviceIndex) -> ReproResult<Granularity> {
        self.driver.granularity(device)
    }

    pub fn memory_info(&self, device: DeviceIndex) -> ReproResult<MemoryInfo> {
        self.driver.memory_info(device)
    }

    /// Claims `size` bytes of device address space with no physical backing.
    ///
    /// The size is rounded up to the device's recommended granularity. The time
    /// spent inside the driver is recorded in [`VirtualReservation::reserve_latency`];
    /// it should not grow with `size`.
    ///
    /// # Errors
    /// `Reservation` for an invalid device, a zero size, or an unreservable range.
    pub fn reserve(&mut self, device: DeviceIndex, size: usize) -> ReproResult<VirtualReservation> {
        if device >= self.driver.device_count() {
            return Err(ReproError::Reservation(format!(
                "invalid device {device} ({} available)",
                self.driver.device_count()
            )));
        }
        if size == 0 {
            return Err(ReproError::Reservation("cannot reserve 0 bytes".into()));
        }

        let granularity = self.driver.granularity(device)?;
        let rounded = round_to_granularity(size, granularity.recommended).ok_or_else(|| {
            ReproError::Reservation(format!("{size} bytes overflows the address space"))
        })?;

        let start = Instant::now();
        let base = self
            .driver
            .reserve_address(device, rounded, granularity.recommended)?;
        let reserve_latency = start.elapsed();

        let info = VirtualReservation {
            id: ReservationId(Self::next_id()),
            base,
            size: rounded,
            device,
            reserve_latency,
        };
        tracing::info!(
            device,
            requested = size,
            size = rounded,
            base = format_args!("0x{base:x}"),
            latency_us = reserve_latency.as_micros() as u64,
            "reserved virtual range"
        );

        self.reservations.insert(
            info.id,
            ReservationState {
                info,
                granularity,
                ranges: RangeAllocator::new(0, rounded as u64, granularity.minimum as u64, 0),
            },
        );
        Ok(info)
    }

    fn reservation_mut(
        &mut self,
        device: DeviceIndex,
        reservation: &VirtualReservation,
    ) -> ReproResult<&mut ReservationState> {
        let state = self
            .reservations
            .get_mut(&reservation.id)
            .filter(|state| state.info == *reservation)
            .ok_or_else(|| {
                ReproError::InvalidHandle(format!(
                    "reservation at 0x{:x} is not live in this manager",
                    reservation.base
                ))
            })?;
        if state.info.device != device {
            return Err(ReproError::InvalidHandle(format!(
                "reservation at 0x{:x} belongs to device {}, not {device}",
                state.info.base, state.info.device
            )));
        }
        Ok(state)
    }

    /// Claims a sub-range and returns `(offset, rounded size)`.
    fn claim(
        state: &mut ReservationState,
        size: usize,
        offset: Option<usize>,
    ) -> ReproResult<(usize, usize)> {
        let total = state.info.size;
        let min = state.granularity.minimum;
        let rounded = round_to_granularity(size, min)
            .filter(|&r| r > 0)
            .ok_or_else(|| ReproError::Range(format!("invalid allocation size {size}")))?;

        let claimed = match offset {
            Some(o) => state.ranges.claim(o as u64, rounded as u64),
            None => state.ranges.allocate_first_fit(rounded as u64, min as u64),
        }
        .map_err(|c| range_error(c, offset, rounded, total))?;

        Ok((claimed as usize, rounded))
    }

    /// Commits physical memory and maps it into `reservation`, first-fit unless
    /// `offset` is given.
    ///
    /// # Errors
    /// `OutOfMemory` if the device cannot back the request, `Range` if the
    /// sub-range does not fit or overlaps an existing allocation.
    pub fn allocate(
        &mut self,
        device: DeviceIndex,
        reservation: &VirtualReservation,
        size: usize,
        offset: Option<usize>,
    ) -> ReproResult<PhysicalAllocation> {
        let id = AllocationId(Self::next_id());
        let driver = Arc::clone(&self.driver);

        let state = self.reservation_mut(device, reservation)?;
        let (offset, rounded) = Self::claim(state, size, offset)?;
        let va = state.info.base + offset as u64;

        let physical = match driver.commit(device, va, rounded) {
            Ok(p) => p,
            Err(e) => {
                state.ranges.release(offset as u64);
                tracing::warn!(device, size = rounded, offset, error = %e, "commit failed");
                return Err(e);
            }
        };

        let info = PhysicalAllocation {
            id,
            reservation: state.info.id,
            device,
            offset,
            size: rounded,
            va,
            imported: false,
        };
        tracing::debug!(device, offset, size = rounded, va = format_args!("0x{va:x}"), "committed");
        self.allocations
            .insert(id, AllocationRecord { info, physical });
        Ok(info)
    }

    /// Unmaps the allocation and releases its physical reference.
    ///
    /// # Errors
    /// `InvalidHandle` if the allocation was already deallocated or belongs to
    /// another manager.
    ///
    /// Aborts the process if the driver fails to unmap or the reservation's
    /// bookkeeping no longer knows the range.
    pub fn deallocate(&mut self, allocation: &PhysicalAllocation) -> ReproResult<()> {
        let record = match self.allocations.entry(allocation.id) {
            Entry::Occupied(e) if e.get().info == *allocation => e.remove(),
            _ => {
                return Err(ReproError::InvalidHandle(format!(
                    "allocation at offset {} of reservation {:?} was already deallocated or is not owned here",
                    allocation.offset, allocation.reservation
                )));
            }
        };

        let AllocationRecord { info, physical } = record;
        if let Err(e) = self.driver.decommit(physical) {
            fatal(&format!(
                "decommit of 0x{:x}+{} on device {} failed: {e}",
                info.va, info.size, info.device
            ));
        }

        let released = self
            .reservations
            .get_mut(&info.reservation)
            .and_then(|state| state.ranges.release(info.offset as u64));
        if released != Some(info.size as u64) {
            fatal(&format!(
                "reservation {:?} lost track of sub-range {}+{}",
                info.reservation, info.offset, info.size
            ));
        }

        tracing::debug!(device = info.device, offset = info.offset, size = info.size, "decommitted");
        Ok(())
    }

    /// Produces a transferable token for the allocation's physical memory.
    ///
    /// # Errors
    /// `InvalidHandle` for a deallocated allocation, `Unsupported` if the driver
    /// cannot export it.
    pub fn export(&self, allocation: &PhysicalAllocation) -> ReproResult<ExportedHandle> {
        let record = self.live_allocation(allocation)?;
        self.driver.export(&record.physical)
    }

    /// Maps the memory named by `handle` into `reservation`, sharing the backing
    /// with the exporter.
    ///
    /// # Errors
    /// `InvalidHandle` if the handle is stale or was made for an incompatible
    /// device, `Range` if the sub-range does not fit.
    pub fn import(
        &mut self,
        handle: &ExportedHandle,
        device: DeviceIndex,
        reservation: &VirtualReservation,
        offset: Option<usize>,
    ) -> ReproResult<PhysicalAllocation> {
        let id = AllocationId(Self::next_id());
        let driver = Arc::clone(&self.driver);

        let state = self.reservation_mut(device, reservation)?;
        if handle.size() == 0 || handle.size() % state.granularity.minimum != 0 {
            return Err(ReproError::InvalidHandle(format!(
                "handle size {} is not a multiple of device {device} granularity {}",
                handle.size(),
                state.granularity.minimum
            )));
        }
        let (offset, size) = Self::claim(state, handle.size(), offset)?;
        let va = state.info.base + offset as u64;

        let physical = match driver.import(device, va, handle) {
            Ok(p) => p,
            Err(e) => {
                state.ranges.release(offset as u64);
                return Err(e);
            }
        };

        let info = PhysicalAllocation {
            id,
            reservation: state.info.id,
            device,
            offset,
            size,
            va,
            imported: true,
        };
        tracing::debug!(
            device,
            from_device = handle.device(),
            from_pid = handle.pid(),
            offset,
            size,
            "imported"
        );
        self.allocations
            .insert(id, AllocationRecord { info, physical });
        Ok(info)
    }

    /// Sorted `(offset, size)` pairs currently committed in `reservation`.
    pub fn committed_ranges(
        &self,
        reservation: &VirtualReservation,
    ) -> ReproResult<Vec<(usize, usize)>> {
        let state = self.live_reservation(reservation)?;
        Ok(state
            .ranges
            .claims()
            .into_iter()
            .map(|(o, s)| (o as usize, s as usize))
            .collect())
    }

    /// Returns the address range to the driver.
    ///
    /// # Errors
    /// `Reservation` while sub-ranges are still committed; `InvalidHandle` if the
    /// reservation was already released.
    pub fn release(&mut self, reservation: &VirtualReservation) -> ReproResult<()> {
        let state = self.live_reservation(reservation)?;
        if !state.ranges.is_empty() {
            return Err(ReproError::Reservation(format!(
                "reservation at 0x{:x} still has {} committed sub-ranges",
                state.info.base,
                state.ranges.len()
            )));
        }

        self.driver
            .free_address(state.info.device, state.info.base, state.info.size)?;
        self.reservations.remove(&reservation.id);
        tracing::debug!(base = format_args!("0x{:x}", reservation.base), "released reservation");
        Ok(())
    }
}

impl Drop for VirtualMemoryManager {
    fn drop(&mut self) {
        // Imports first so exporters in this manager outlive their importers.
        let mut live: Vec<PhysicalAllocation> =
            self.allocations.values().map(|r| r.info).collect();
        live.sort_by_key(|a| (!a.imported, a.id));
        if !live.is_empty() {
            tracing::debug!(count = live.len(), "releasing live allocations on drop");
        }
        for alloc in &live {
            if let Err(e) = self.deallocate(alloc) {
                tracing::error!(error = %e, "failed to deallocate on drop");
            }
        }

        let reservations: Vec<VirtualReservation> =
            self.reservations.values().map(|s| s.info).collect();
        for r in &reservations {
            if let Err(e) = self.release(r) {
                tracing::error!(error = %e, "failed to release reservation on drop");
            }
        }
    }
}
