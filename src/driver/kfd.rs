#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]

//! AMD GPUs through the kernel fusion driver (`/dev/kfd`).
//!
//! The GPU virtual address space of a KFD process is shared with the CPU (SVM):
//! reservations are carved out of the SVM aperture in user space and mirrored
//! by a CPU placeholder, so a committed buffer is visible to both at one address.

use super::mapping;
use super::{DeviceIndex, Granularity, MemoryDriver, MemoryInfo, RawPhysical};
use crate::error::{ReproError, ReproResult};
use crate::handle::{BackingId, ExportedHandle, HandleKind};
use crate::kfd::device::KfdDevice;
use crate::kfd::ioctl::{
    AllocMemoryOfGpuArgs, GetProcessAperturesNewArgs, KFD_IOC_ALLOC_MEM_FLAGS_COHERENT,
    KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC, KFD_IOC_ALLOC_MEM_FLAGS_UNCACHED, KFD_IOC_ALLOC_MEM_FLAGS_VRAM,
    KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE, KFD_IOCTL_MAJOR_VERSION,
    KFD_IOCTL_MINOR_VERSION_EXPORT_DMABUF, ProcessDeviceApertures,
};
use crate::kfd::sysfs::{HsaNodeProperties, Topology};
use crate::vmm::range::RangeAllocator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

// Constants from fmm.c
const SVM_RESERVATION_LIMIT: u64 = (1 << 47) - 1; // 47-bit VA limit
const SVM_MIN_BASE: u64 = 0x1000_0000; // Start at 256MB
const SVM_DEFAULT_ALIGN: u64 = 4096;
const SVM_GUARD_SIZE: u64 = 4096;

const KFD_MIN_GRANULARITY: usize = 4096;
const KFD_RECOMMENDED_GRANULARITY: usize = 2 << 20;

/// Flags for buffers that both host and peers poll: VRAM, host-visible, uncached.
const COMMIT_FLAGS: u32 = KFD_IOC_ALLOC_MEM_FLAGS_VRAM
    | KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE
    | KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC
    | KFD_IOC_ALLOC_MEM_FLAGS_COHERENT
    | KFD_IOC_ALLOC_MEM_FLAGS_UNCACHED;

#[derive(Debug)]
struct KfdGpu {
    node: HsaNodeProperties,
    drm: File,
}

#[derive(Debug)]
struct KfdMapping {
    device: DeviceIndex,
    bo: u64,
    va: u64,
    size: usize,
    // Set once exported, or for imports, the descriptor we imported from.
    dmabuf: Option<OwnedFd>,
}

#[derive(Debug, Default)]
struct KfdState {
    mappings: HashMap<u64, KfdMapping>,
    reservations: HashMap<u64, (DeviceIndex, usize)>,
    next_token: u64,
}

#[derive(Debug)]
pub struct KfdDriver {
    device: KfdDevice,
    gpus: Vec<KfdGpu>,
    can_export: bool,
    svm: Mutex<RangeAllocator>,
    state: Mutex<KfdState>,
}

impl KfdDriver {
    /// Opens `/dev/kfd`, discovers GPU nodes, and acquires a VM on each.
    ///
    /// # Errors
    /// Fails if the driver is absent, too old, or no GPU node can be opened.
    pub fn open() -> ReproResult<Self> {
        let device = KfdDevice::open()?;
        let version = device.get_version()?;
        if version.major_version != KFD_IOCTL_MAJOR_VERSION {
            return Err(ReproError::Unsupported(format!(
                "KFD interface {}.{} (need major {KFD_IOCTL_MAJOR_VERSION})",
                version.major_version, version.minor_version
            )));
        }
        let can_export = version.minor_version >= KFD_IOCTL_MINOR_VERSION_EXPORT_DMABUF;

        let topology = Topology::get_snapshot()?;
        let mut gpus = Vec::new();
        for node in topology.gpu_nodes() {
            if node.drm_render_minor < 0 {
                tracing::warn!(node = node.node_id, "GPU node without DRM render minor, skipping");
                continue;
            }
            let drm_path = format!("/dev/dri/renderD{}", node.drm_render_minor);
            let drm = OpenOptions::new().read(true).write(true).open(&drm_path)?;
            device.acquire_vm(node.kfd_gpu_id, drm.as_raw_fd() as u32)?;
            tracing::debug!(node = node.node_id, gpu_id = node.kfd_gpu_id, %drm_path, "acquired VM");
            gpus.push(KfdGpu { node, drm });
        }
        if gpus.is_empty() {
            return Err(ReproError::Driver("no usable GPU nodes in KFD topology".into()));
        }

        let svm = Self::svm_aperture(&device, topology.nodes.len(), &gpus)?;

        tracing::info!(
            major = version.major_version,
            minor = version.minor_version,
            gpus = gpus.len(),
            can_export,
            "KFD driver ready"
        );

        Ok(Self {
            device,
            gpus,
            can_export,
            svm: Mutex::new(svm),
            state: Mutex::new(KfdState::default()),
        })
    }

    /// Logic from `init_svm_apertures` in fmm.c: the usable SVM range is bounded
    /// by the smallest GPUVM limit among our GPUs.
    fn svm_aperture(
        device: &KfdDevice,
        num_nodes: usize,
        gpus: &[KfdGpu],
    ) -> ReproResult<RangeAllocator> {
        let mut apertures = vec![ProcessDeviceApertures::default(); num_nodes];
        let mut args = GetProcessAperturesNewArgs {
            kfd_process_device_apertures_ptr: apertures.as_mut_ptr() as u64,
            num_of_nodes: num_nodes as u32,
            pad: 0,
        };
        device.get_process_apertures_new(&mut args)?;

        let mut base = SVM_MIN_BASE;
        let mut limit = SVM_RESERVATION_LIMIT;
        for ap in apertures.iter().take(args.num_of_nodes as usize) {
            if !gpus.iter().any(|g| g.node.kfd_gpu_id == ap.gpu_id) {
                continue;
            }
            base = base.max(ap.gpuvm_base);
            limit = limit.min(ap.gpuvm_limit);
        }
        if base >= limit {
            return Err(ReproError::Driver(format!(
                "empty SVM aperture 0x{base:x}..0x{limit:x}"
            )));
        }

        Ok(RangeAllocator::new(
            base,
            limit + 1,
            SVM_DEFAULT_ALIGN,
            SVM_GUARD_SIZE,
        ))
    }

    fn gpu(&self, device: DeviceIndex) -> ReproResult<&KfdGpu> {
        self.gpus.get(device as usize).ok_or_else(|| {
            ReproError::InvalidHandle(format!(
                "device {device} does not exist ({} GPUs)",
                self.gpus.len()
            ))
        })
    }

    fn out_of_memory(&self, device: DeviceIndex, requested: usize) -> ReproError {
        let free = self
            .gpu(device)
            .and_then(|g| Ok(self.device.get_available_memory(g.node.kfd_gpu_id)?))
            .unwrap_or(0);
        ReproError::OutOfMemory {
            device,
            requested,
            free,
        }
    }

    fn check_reserved(
        state: &KfdState,
        device: DeviceIndex,
        va: u64,
        size: usize,
    ) -> ReproResult<()> {
        let inside = state.reservations.iter().any(|(&base, &(dev, len))| {
            dev == device && va >= base && va + size as u64 <= base + len as u64
        });
        if !inside {
            return Err(ReproError::Range(format!(
                "0x{va:x}+{size} is not inside a reservation of device {device}"
            )));
        }
        Ok(())
    }

    /// Releases a buffer object after a partial commit/import.
    fn discard_bo(&self, bo: u64, gpu_id: u32, mapped: bool) {
        if mapped {
            self.device.unmap_memory_from_gpu(bo, gpu_id).ok();
        }
        self.device.free_memory_of_gpu(bo).ok();
    }

    fn install(&self, state: &mut KfdState, m: KfdMapping) -> RawPhysical {
        let token = state.next_token;
        state.next_token += 1;
        let raw = RawPhysical {
            device: m.device,
            va: m.va,
            size: m.size,
            token,
        };
        state.mappings.insert(token, m);
        raw
    }
}

impl MemoryDriver for KfdDriver {
    fn name(&self) -> &'static str {
        "kfd"
    }

    fn device_count(&self) -> u32 {
        self.gpus.len() as u32
    }

    fn granularity(&self, device: DeviceIndex) -> ReproResult<Granularity> {
        self.gpu(device)?;
        Ok(Granularity {
            minimum: KFD_MIN_GRANULARITY,
            recommended: KFD_RECOMMENDED_GRANULARITY,
        })
    }

    fn memory_info(&self, device: DeviceIndex) -> ReproResult<MemoryInfo> {
        let gpu = self.gpu(device)?;
        let free = self.device.get_available_memory(gpu.node.kfd_gpu_id)?;
        Ok(MemoryInfo {
            free,
            total: gpu.node.local_mem_size,
        })
    }

    fn reserve_address(&self, device: DeviceIndex, size: usize, align: usize) -> ReproResult<u64> {
        if self.gpus.get(device as usize).is_none() {
            return Err(ReproError::Reservation(format!("invalid device {device}")));
        }

        let base = claim_svm_range(&mut self.svm.lock(), size, align, |base| {
            mapping::reserve_placeholder_at(base, size)
        })?;

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
        self.svm.lock().release(base);
        Ok(())
    }

    fn commit(&self, device: DeviceIndex, va: u64, size: usize) -> ReproResult<RawPhysical> {
        let gpu = self.gpu(device)?;
        let gpu_id = gpu.node.kfd_gpu_id;
        let mut state = self.state.lock();
        Self::check_reserved(&state, device, va, size)?;

        let mut args = AllocMemoryOfGpuArgs {
            va_addr: va,
            size: size as u64,
            handle: 0,
            mmap_offset: 0,
            gpu_id,
            flags: COMMIT_FLAGS,
        };
        if let Err(e) = self.device.alloc_memory_of_gpu(&mut args) {
            tracing::debug!(device, size, error = %e, "KFD alloc failed");
            return Err(match e.raw_os_error() {
                Some(libc::ENOMEM) => self.out_of_memory(device, size),
                _ => ReproError::Driver(format!("alloc_memory_of_gpu: {e}")),
            });
        }

        if let Err(e) = self.device.map_memory_to_gpu(args.handle, gpu_id) {
            self.discard_bo(args.handle, gpu_id, false);
            return Err(ReproError::Driver(format!("map_memory_to_gpu: {e}")));
        }

        // MAP_FIXED over the placeholder keeps the CPU address equal to the GPU VA.
        if let Err(e) = mapping::map_shared_fixed(va, size, gpu.drm.as_raw_fd(), args.mmap_offset)
        {
            self.discard_bo(args.handle, gpu_id, true);
            return Err(ReproError::Driver(format!("CPU mmap of BO: {e}")));
        }

        Ok(self.install(
            &mut state,
            KfdMapping {
                device,
                bo: args.handle,
                va,
                size,
                dmabuf: None,
            },
        ))
    }

    fn export(&self, physical: &RawPhysical) -> ReproResult<ExportedHandle> {
        if !self.can_export {
            return Err(ReproError::Unsupported(
                "KFD interface predates dma-buf export".into(),
            ));
        }
        let gpu_id = self.gpu(physical.device)?.node.kfd_gpu_id;

        let mut state = self.state.lock();
        let m = state.mappings.get_mut(&physical.token).ok_or_else(|| {
            ReproError::InvalidHandle(format!("physical token {} is not live", physical.token))
        })?;

        if m.dmabuf.is_none() {
            let fd = self.device.export_dmabuf(m.bo).map_err(|e| match e.raw_os_error() {
                Some(libc::EINVAL | libc::EOPNOTSUPP) => {
                    ReproError::Unsupported(format!("BO 0x{:x} is not exportable: {e}", m.bo))
                }
                _ => ReproError::Driver(format!("export_dmabuf: {e}")),
            })?;
            m.dmabuf = Some(fd);
        }
        let fd = m
            .dmabuf
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| ReproError::Driver("dma-buf export produced no descriptor".into()))?;

        let backing = BackingId::of_fd(fd)?;
        Ok(ExportedHandle::new(
            HandleKind::KfdDmabuf,
            fd,
            m.device,
            gpu_id,
            m.size,
            backing,
        ))
    }

    fn import(
        &self,
        device: DeviceIndex,
        va: u64,
        handle: &ExportedHandle,
    ) -> ReproResult<RawPhysical> {
        if handle.kind() != HandleKind::KfdDmabuf {
            return Err(ReproError::Unsupported(format!(
                "KFD driver cannot import {:?} handles",
                handle.kind()
            )));
        }
        let gpu = self.gpu(device)?;
        let gpu_id = gpu.node.kfd_gpu_id;
        let size = handle.size();

        let dmabuf = handle.reopen()?;
        let mut state = self.state.lock();
        Self::check_reserved(&state, device, va, size)?;

        let bo = self
            .device
            .import_dmabuf(va, gpu_id, dmabuf.as_raw_fd())
            .map_err(|e| {
                ReproError::InvalidHandle(format!("dma-buf import on gpu {gpu_id}: {e}"))
            })?;

        if let Err(e) = self.device.map_memory_to_gpu(bo, gpu_id) {
            self.discard_bo(bo, gpu_id, false);
            return Err(ReproError::Driver(format!("map_memory_to_gpu: {e}")));
        }
        if let Err(e) = mapping::map_shared_fixed(va, size, dmabuf.as_raw_fd(), 0) {
            self.discard_bo(bo, gpu_id, true);
            return Err(ReproError::Driver(format!("CPU mmap of dma-buf: {e}")));
        }

        Ok(self.install(
            &mut state,
            KfdMapping {
                device,
                bo,
                va,
                size,
                dmabuf: Some(dmabuf),
            },
        ))
    }

    fn decommit(&self, physical: RawPhysical) -> ReproResult<()> {
        let gpu_id = self.gpu(physical.device)?.node.kfd_gpu_id;
        let mut state = self.state.lock();
        let m = state.mappings.remove(&physical.token).ok_or_else(|| {
            ReproError::InvalidHandle(format!("physical token {} is not live", physical.token))
        })?;

        mapping::restore_placeholder(m.va, m.size)?;
        self.device
            .unmap_memory_from_gpu(m.bo, gpu_id)
            .map_err(|e| ReproError::Driver(format!("unmap_memory_from_gpu: {e}")))?;
        self.device
            .free_memory_of_gpu(m.bo)
            .map_err(|e| ReproError::Driver(format!("free_memory_of_gpu: {e}")))?;
        Ok(())
    }
}

/// Claims the lowest SVM hole whose CPU range `place` can also reserve.
///
/// Holes already mapped on the CPU side (`EEXIST`) are held while later holes
/// are tried, then given back.
fn claim_svm_range(
    svm: &mut RangeAllocator,
    size: usize,
    align: usize,
    mut place: impl FnMut(u64) -> io::Result<()>,
) -> ReproResult<u64> {
    let mut taken = Vec::new();
    let result = loop {
        let base = match svm.allocate_first_fit(size as u64, align as u64) {
            Ok(base) => base,
            Err(e) => {
                break Err(ReproError::Reservation(format!(
                    "SVM aperture cannot fit {size} bytes: {e:?}"
                )));
            }
        };
        match place(base) {
            Ok(()) => break Ok(base),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!(
                    base = format_args!("0x{base:x}"),
                    size,
                    "CPU range in use, trying next SVM hole"
                );
                taken.push(base);
            }
            Err(e) => {
                svm.release(base);
                break Err(ReproError::Reservation(format!(
                    "CPU range 0x{base:x}+{size} unavailable: {e}"
                )));
            }
        }
    };
    for base in taken {
        svm.release(base);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1 << 20;

    fn aperture() -> RangeAllocator {
        RangeAllocator::new(
            SVM_MIN_BASE,
            SVM_MIN_BASE + 64 * MIB as u64,
            SVM_DEFAULT_ALIGN,
            SVM_GUARD_SIZE,
        )
    }

    #[test]
    fn occupied_cpu_ranges_are_skipped() {
        let mut svm = aperture();
        let mut tried = Vec::new();
        let base = claim_svm_range(&mut svm, MIB, 2 * MIB, |base| {
            tried.push(base);
            if tried.len() < 3 {
                Err(io::Error::from_raw_os_error(libc::EEXIST))
            } else {
                Ok(())
            }
        })
        .unwrap();

        assert_eq!(tried.len(), 3);
        assert_eq!(base, tried[2]);
        assert!(tried.windows(2).all(|w| w[0] < w[1]));
        // Only the placed range stays claimed.
        assert_eq!(svm.len(), 1);
        assert!(svm.release(base).is_some());
        assert!(svm.is_empty());
    }

    #[test]
    fn other_placement_errors_give_up() {
        let mut svm = aperture();
        let err = claim_svm_range(&mut svm, MIB, 2 * MIB, |_| {
            Err(io::Error::from_raw_os_error(libc::ENOMEM))
        })
        .unwrap_err();
        assert!(matches!(err, ReproError::Reservation(_)));
        assert!(svm.is_empty());
    }

    #[test]
    fn exhausted_aperture_releases_skipped_holes() {
        let mut svm = aperture();
        let err = claim_svm_range(&mut svm, MIB, 2 * MIB, |_| {
            Err(io::Error::from_raw_os_error(libc::EEXIST))
        })
        .unwrap_err();
        assert!(matches!(err, ReproError::Reservation(_)));
        assert!(svm.is_empty());
    }

    #[test]
    fn reserve_commit_release_on_real_gpu() {
        if !KfdDevice::is_present() {
            return;
        }
        let Ok(driver) = KfdDriver::open() else {
            return;
        };
        let base = driver.reserve_address(0, 16 << 20, 2 << 20).unwrap();
        let phys = driver.commit(0, base, 1 << 20).unwrap();
        unsafe {
            std::ptr::write_volatile(base as *mut u64, 0xDEAD_BEEF);
            assert_eq!(std::ptr::read_volatile(base as *const u64), 0xDEAD_BEEF);
        }
        driver.decommit(phys).unwrap();
        driver.free_address(0, base, 16 << 20).unwrap();
    }
}
