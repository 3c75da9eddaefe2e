//! Symmetric all-to-all barrier over peer-mapped device memory.
//!
//! Every participant owns one buffer holding a [`BarrierSlot`] per rank. To
//! arrive, a rank stores its new generation into its own slot of *every*
//! participant's buffer through the peer mappings, then polls its local buffer
//! until all slots carry that generation. Each slot has exactly one writer.

use crate::driver::{DeviceIndex, MemoryDriver};
use crate::error::{ReproError, ReproResult, fatal};
use crate::exchange::AllGather;
use crate::handle::ExportedHandle;
use crate::utils::round_to_granularity;
use crate::vmm::{PhysicalAllocation, VirtualMemoryManager, VirtualReservation};
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering, fence};
use std::thread;

pub const MAX_RANKS: usize = 8;

/// Spins between yields while polling for peers.
const SPINS_PER_YIELD: u32 = 1024;

/// Arrival record of one rank, one cache line wide.
#[repr(C, align(64))]
pub struct BarrierSlot {
    pub generation: AtomicU64,
    reserved: [u64; 7],
}

const _: () = assert!(mem::size_of::<BarrierSlot>() == 64);
const _: () = assert!(mem::align_of::<BarrierSlot>() == 64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    /// Never observable on a constructed barrier; `create` either finishes or fails.
    Uninitialized,
    HandlesPending,
    Ready,
    Running,
    Destroyed,
}

#[derive(Debug)]
pub struct MultiGpuBarrier {
    vmm: VirtualMemoryManager,
    device: DeviceIndex,
    rank: usize,
    world_size: usize,
    reservation: VirtualReservation,
    local: PhysicalAllocation,
    local_handle: ExportedHandle,
    /// Indexed by rank; the own entry is `local`.
    peers: Vec<PhysicalAllocation>,
    state: BarrierState,
    generation: u64,
}

impl MultiGpuBarrier {
    /// Allocates the local buffer with one slot per rank and exports it.
    ///
    /// # Errors
    /// `Protocol` for an invalid rank or world size; any VMM error from
    /// reserving or committing the buffer.
    pub fn create(
        driver: Arc<dyn MemoryDriver>,
        device: DeviceIndex,
        rank: usize,
        world_size: usize,
    ) -> ReproResult<Self> {
        if world_size == 0 || world_size > MAX_RANKS {
            return Err(ReproError::Protocol(format!(
                "world size {world_size} is not in 1..={MAX_RANKS}"
            )));
        }
        if rank >= world_size {
            return Err(ReproError::Protocol(format!(
                "rank {rank} is outside a world of {world_size}"
            )));
        }

        let mut vmm = VirtualMemoryManager::new(driver);
        let granularity = vmm.granularity(device)?;
        let slots_len = world_size * mem::size_of::<BarrierSlot>();
        let buffer_size = round_to_granularity(slots_len, granularity.minimum)
            .ok_or_else(|| ReproError::Reservation("barrier buffer size overflows".into()))?;

        // Local buffer plus one view per peer.
        let reservation = vmm.reserve(device, buffer_size * world_size)?;
        let local = vmm.allocate(device, &reservation, buffer_size, Some(0))?;
        let local_handle = vmm.export(&local)?;

        let barrier = Self {
            vmm,
            device,
            rank,
            world_size,
            reservation,
            local,
            local_handle,
            peers: Vec::new(),
            state: BarrierState::HandlesPending,
            generation: 0,
        };
        for r in 0..world_size {
            barrier.slot(&barrier.local, r).generation.store(0, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);

        tracing::info!(device, rank, world_size, buffer_size, "barrier created");
        Ok(barrier)
    }

    #[must_use]
    pub fn state(&self) -> BarrierState {
        self.state
    }

    /// Number of completed barrier episodes.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    #[must_use]
    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    /// Handle of the local buffer, to be distributed to every peer.
    ///
    /// # Errors
    /// `Protocol` once peer handles have been set.
    pub fn buffer_handle(&self) -> ReproResult<ExportedHandle> {
        if self.state != BarrierState::HandlesPending {
            return Err(ReproError::Protocol(format!(
                "buffer handle requested in state {:?}",
                self.state
            )));
        }
        Ok(self.local_handle)
    }

    /// Imports every peer's buffer. `handles[r]` must be rank `r`'s buffer
    /// handle, including this rank's own at `handles[self.rank()]`.
    ///
    /// On failure nothing stays mapped and the barrier remains in
    /// `HandlesPending`.
    ///
    /// # Errors
    /// `Protocol` if the length is not the world size, the own entry is not
    /// this barrier's buffer, or any peer buffer fails to import.
    pub fn set_peer_buffer_handles(&mut self, handles: &[ExportedHandle]) -> ReproResult<()> {
        if self.state != BarrierState::HandlesPending {
            return Err(ReproError::Protocol(format!(
                "peer handles already set (state {:?})",
                self.state
            )));
        }
        if handles.len() != self.world_size {
            return Err(ReproError::Protocol(format!(
                "expected {} handles, got {}",
                self.world_size,
                handles.len()
            )));
        }
        let own = &handles[self.rank];
        if own.backing() != self.local_handle.backing() || own.pid() != self.local_handle.pid() {
            return Err(ReproError::Protocol(format!(
                "handle at index {} is not this rank's buffer",
                self.rank
            )));
        }

        let mut peers = Vec::with_capacity(self.world_size);
        for (r, handle) in handles.iter().enumerate() {
            if r == self.rank {
                peers.push(self.local);
                continue;
            }
            let imported = self
                .vmm
                .import(handle, self.device, &self.reservation, None)
                .and_then(|view| {
                    if view.size < self.world_size * mem::size_of::<BarrierSlot>() {
                        self.vmm.deallocate(&view)?;
                        return Err(ReproError::Protocol(format!(
                            "buffer of {} bytes cannot hold {} slots",
                            view.size, self.world_size
                        )));
                    }
                    Ok(view)
                });
            match imported {
                Ok(view) => peers.push(view),
                Err(e) => {
                    for view in peers.iter().filter(|v| v.imported) {
                        self.vmm.deallocate(view)?;
                    }
                    return Err(ReproError::Protocol(format!(
                        "failed to map rank {r}'s buffer: {e}"
                    )));
                }
            }
        }

        self.peers = peers;
        self.state = BarrierState::Ready;
        tracing::info!(rank = self.rank, world_size = self.world_size, "peer buffers mapped");
        Ok(())
    }

    /// Exchanges buffer handles through `group` and maps every peer.
    pub fn connect(&mut self, group: &dyn AllGather) -> ReproResult<()> {
        let handle = self.buffer_handle()?;
        let handles = group.all_gather(self.rank, self.world_size, &handle)?;
        self.set_peer_buffer_handles(&handles)
    }

    fn slot(&self, buffer: &PhysicalAllocation, rank: usize) -> &BarrierSlot {
        debug_assert!(rank < self.world_size);
        // In-bounds by the size check at import; the mapping lives as long as `self`.
        unsafe { &*(buffer.as_ptr() as *const BarrierSlot).add(rank) }
    }

    /// Runs one barrier episode and returns the new generation.
    ///
    /// Blocks until every rank has arrived at this generation. There is no
    /// timeout: a peer that never arrives hangs every other rank.
    ///
    /// # Errors
    /// `Protocol` unless peer handles have been set.
    ///
    /// Aborts the process if a peer's marker is more than one generation ahead,
    /// which only corrupted memory can produce.
    pub fn run(&mut self) -> ReproResult<u64> {
        if self.state != BarrierState::Ready {
            return Err(ReproError::Protocol(format!(
                "run() in state {:?}",
                self.state
            )));
        }
        self.state = BarrierState::Running;
        let target = self.generation + 1;

        // Order prior traffic on this device before the arrival becomes visible.
        fence(Ordering::SeqCst);
        for peer in &self.peers {
            self.slot(peer, self.rank)
                .generation
                .store(target, Ordering::Release);
        }

        for r in 0..self.world_size {
            let slot = self.slot(&self.local, r);
            let mut spins = 0u32;
            loop {
                let seen = slot.generation.load(Ordering::Acquire);
                if seen >= target {
                    // A peer can be at most one episode ahead of us.
                    if seen > target + 1 {
                        fatal(&format!(
                            "rank {} saw generation {seen} from rank {r} while waiting for {target}",
                            self.rank
                        ));
                    }
                    break;
                }
                spins += 1;
                if spins == SPINS_PER_YIELD {
                    spins = 0;
                    thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
            }
        }
        fence(Ordering::SeqCst);

        self.generation = target;
        self.state = BarrierState::Ready;
        tracing::trace!(rank = self.rank, generation = target, "barrier episode complete");
        Ok(target)
    }
}

impl Drop for MultiGpuBarrier {
    fn drop(&mut self) {
        // Peer views go before our own buffer.
        for view in self.peers.iter().filter(|v| v.imported) {
            if let Err(e) = self.vmm.deallocate(view) {
                tracing::error!(rank = self.rank, error = %e, "failed to unmap peer buffer");
            }
        }
        if let Err(e) = self.vmm.deallocate(&self.local) {
            tracing::error!(rank = self.rank, error = %e, "failed to free barrier buffer");
        }
        if let Err(e) = self.vmm.release(&self.reservation) {
            tracing::error!(rank = self.rank, error = %e, "failed to release barrier reservation");
        }
        self.state = BarrierState::Destroyed;
        tracing::debug!(rank = self.rank, generation = self.generation, "barrier destroyed");
    }
}
