//! Host-memory emulation of one or more GPUs.
//!
//! Physical memory is a `memfd` object per commit, mapped `MAP_SHARED` over an
//! anonymous `PROT_NONE` placeholder that stands in for the reserved device
//! range. Exporting hands out the descriptor's identity; importing reopens the
//! descriptor, so two mappings of one backing really share pages, in this
//! process or another.

use super::mapping;
use super::{DeviceIndex, Granularity, MemoryDriver, MemoryInfo, RawPhysical};
use crate::error::{ReproError, ReproResult};
use crate::handle::{BackingId, ExportedHandle, HandleKind};
use crate::utils::page_size;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Largest reservation the host will attempt (47-bit user address space).
const MAX_RESERVATION: usize = 1 << 46;
const DEFAULT_RECOMMENDED_GRANULARITY: usize = 2 << 20;

#[derive(Debug)]
struct Backing {
    device: DeviceIndex,
    size: u64,
    refs: usize,
    // Imports of another process's memory are charged to that process.
    charged: bool,
}

#[derive(Debug)]
struct Mapping {
    fd: OwnedFd,
    backing: BackingId,
    device: DeviceIndex,
    va: u64,
    size: usize,
}

#[derive(Debug, Default)]
struct HostState {
    used: Vec<u64>,
    backings: HashMap<BackingId, Backing>,
    mappings: HashMap<u64, Mapping>,
    // Base -> (device, size)
    reservations: HashMap<u64, (DeviceIndex, usize)>,
    next_token: u64,
}

impl HostState {
    fn reservation_covering(&self, device: DeviceIndex, va: u64, size: usize) -> bool {
        self.reservations.iter().any(|(&base, &(dev, len))| {
            dev == device && va >= base && va + size as u64 <= base + len as u64
        })
    }

    fn acquire(&mut self, id: BackingId, device: DeviceIndex, size: u64, charged: bool) {
        self.backings
            .entry(id)
            .and_modify(|b| b.refs += 1)
            .or_insert(Backing {
                device,
                size,
                refs: 1,
                charged,
            });
    }

    fn release(&mut self, id: BackingId) {
        let Some(b) = self.backings.get_mut(&id) else {
            return;
        };
        b.refs -= 1;
        if b.refs == 0 {
            let b = self.backings.remove(&id).map(|b| (b.device, b.size, b.charged));
            if let Some((device, size, true)) = b {
                self.used[device as usize] -= size;
            }
        }
    }
}

/// Emulates `devices` GPUs, each with `capacity` bytes of physical memory.
#[derive(Debug)]
pub struct HostDriver {
    devices: u32,
    capacity: u64,
    granularity: Granularity,
    state: Mutex<HostState>,
}

impl HostDriver {
    #[must_use]
    pub fn new(devices: u32, capacity: u64) -> Self {
        let page = page_size();
        Self {
            devices,
            capacity,
            granularity: Granularity {
                minimum: page,
                recommended: DEFAULT_RECOMMENDED_GRANULARITY.max(page),
            },
            state: Mutex::new(HostState {
                used: vec![0; devices as usize],
                ..HostState::default()
            }),
        }
    }

    fn check_device(&self, device: DeviceIndex) -> ReproResult<()> {
        if device >= self.devices {
            return Err(ReproError::InvalidHandle(format!(
                "device {device} does not exist ({} emulated)",
                self.devices
            )));
        }
        Ok(())
    }

    fn install(
        &self,
        state: &mut HostState,
        fd: OwnedFd,
        backing: BackingId,
        device: DeviceIndex,
        va: u64,
        size: usize,
    ) -> RawPhysical {
        let token = state.next_token;
        state.next_token += 1;
        state.mappings.insert(
            token,
            Mapping {
                fd,
                backing,
                device,
                va,
                size,
            },
        );
        RawPhysical {
            device,
            va,
            size,
            token,
        }
    }
}

fn create_memfd(size: usize) -> io::Result<OwnedFd> {
    let raw = unsafe { libc::memfd_create(c"hsa-repro".as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    let ret = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

impl MemoryDriver for HostDriver {
    fn name(&self) -> &'static str {
        "host"
    }

    fn device_count(&self) -> u32 {
        self.devices
    }

    fn granularity(&self, device: DeviceIndex) -> ReproResult<Granularity> {
        self.check_device(device)?;
        Ok(self.granularity)
    }

    fn memory_info(&self, device: DeviceIndex) -> ReproResult<MemoryInfo> {
        self.check_device(device)?;
        let used = self.state.lock().used[device as usize];
        Ok(MemoryInfo {
            free: self.capacity - used,
            total: self.capacity,
        })
    }

    fn reserve_address(&self, device: DeviceIndex, size: usize, align: usize) -> ReproResult<u64> {
        if device >= self.devices {
            return Err(ReproError::Reservation(format!(
                "invalid device {device}"
            )));
        }
        if size == 0 || size > MAX_RESERVATION {
            return Err(ReproError::Reservation(format!(
                "cannot reserve {size} bytes (limit {MAX_RESERVATION})"
            )));
        }

        let base = mapping::reserve_placeholder(size, align)
            .map_err(|e| ReproError::Reservation(format!("{size} bytes: {e}")))?;
        self.state.lock().reservations.insert(base, (device, size));
        Ok(base)
    }

    fn free_address(&self, device: DeviceIndex, base: u64, size: usize) -> ReproResult<()> {
        let mut state = self.state.lock();
        match state.reservations.get(&base) {
            Some(&(dev, len)) if dev == device && len == size => {}
            _ => {
                return Err(ReproError::InvalidHandle(format!(
                    "no reservation of {size} bytes at 0x{base:x} on device {device}"
                )));
            }
        }
        let end = base + size as u64;
        if state.mappings.values().any(|m| m.va >= base && m.va < end) {
            return Err(ReproError::Reservation(format!(
                "reservation at 0x{base:x} still has mapped memory"
            )));
        }
        mapping::unmap(base, size)?;
        state.reservations.remove(&base);
        Ok(())
    }

    fn commit(&self, device: DeviceIndex, va: u64, size: usize) -> ReproResult<RawPhysical> {
        self.check_device(device)?;
        let mut state = self.state.lock();

        if !state.reservation_covering(device, va, size) {
            return Err(ReproError::Range(format!(
                "0x{va:x}+{size} is not inside a reservation of device {device}"
            )));
        }

        let used = state.used[device as usize];
        if used + size as u64 > self.capacity {
            return Err(ReproError::OutOfMemory {
                device,
                requested: size,
                free: self.capacity - used,
            });
        }

        let fd = create_memfd(size)?;
        let backing = BackingId::of_fd(fd.as_raw_fd())?;
        mapping::map_shared_fixed(va, size, fd.as_raw_fd(), 0)?;

        state.used[device as usize] += size as u64;
        state.acquire(backing, device, size as u64, true);
        Ok(self.install(&mut state, fd, backing, device, va, size))
    }

    fn export(&self, physical: &RawPhysical) -> ReproResult<ExportedHandle> {
        let state = self.state.lock();
        let m = state.mappings.get(&physical.token).ok_or_else(|| {
            ReproError::InvalidHandle(format!("physical token {} is not live", physical.token))
        })?;
        Ok(ExportedHandle::new(
            HandleKind::HostMemfd,
            m.fd.as_raw_fd(),
            m.device,
            0,
            m.size,
            m.backing,
        ))
    }

    fn import(
        &self,
        device: DeviceIndex,
        va: u64,
        handle: &ExportedHandle,
    ) -> ReproResult<RawPhysical> {
        self.check_device(device)?;
        if handle.kind() != HandleKind::HostMemfd {
            return Err(ReproError::Unsupported(format!(
                "host driver cannot import {:?} handles",
                handle.kind()
            )));
        }

        let fd = handle.reopen()?;
        let size = handle.size();

        let mut state = self.state.lock();
        if !state.reservation_covering(device, va, size) {
            return Err(ReproError::Range(format!(
                "0x{va:x}+{size} is not inside a reservation of device {device}"
            )));
        }
        mapping::map_shared_fixed(va, size, fd.as_raw_fd(), 0)?;

        // A local backing is already charged to its exporter; a foreign one is
        // charged in the exporting process.
        state.acquire(handle.backing(), handle.device(), size as u64, false);
        Ok(self.install(&mut state, fd, handle.backing(), device, va, size))
    }

    fn decommit(&self, physical: RawPhysical) -> ReproResult<()> {
        let mut state = self.state.lock();
        let m = state.mappings.remove(&physical.token).ok_or_else(|| {
            ReproError::InvalidHandle(format!("physical token {} is not live", physical.token))
        })?;

        // Unmap first; the descriptor is dropped with `m`.
        mapping::restore_placeholder(m.va, m.size)?;
        state.release(m.backing);
        Ok(())
    }
}
