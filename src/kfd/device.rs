use crate::kfd::ioctl::{
    AMDKFD_IOC_ACQUIRE_VM, AMDKFD_IOC_ALLOC_MEMORY_OF_GPU, AMDKFD_IOC_AVAILABLE_MEMORY,
    AMDKFD_IOC_EXPORT_DMABUF, AMDKFD_IOC_FREE_MEMORY_OF_GPU, AMDKFD_IOC_GET_PROCESS_APERTURES_NEW,
    AMDKFD_IOC_GET_VERSION, AMDKFD_IOC_IMPORT_DMABUF, AMDKFD_IOC_MAP_MEMORY_TO_GPU,
    AMDKFD_IOC_UNMAP_MEMORY_FROM_GPU, AcquireVmArgs, AllocMemoryOfGpuArgs, ExportDmabufArgs,
    FreeMemoryOfGpuArgs, GetAvailableMemoryArgs, GetProcessAperturesNewArgs, GetVersionArgs,
    ImportDmabufArgs, MapMemoryToGpuArgs, UnmapMemoryFromGpuArgs,
};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

pub const KFD_DEVICE_PATH: &str = "/dev/kfd";

/// A handle to the KFD driver character device (`/dev/kfd`).
///
/// Cheap to clone; every clone shares the same file descriptor, which stays open
/// until the last allocation referencing it has been released.
#[derive(Clone, Debug)]
pub struct KfdDevice {
    pub file: Arc<File>,
}

impl KfdDevice {
    /// Opens the KFD driver device.
    ///
    /// # Errors
    /// Returns an error if `/dev/kfd` cannot be opened (e.g., driver not loaded, permissions).
    pub fn open() -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(KFD_DEVICE_PATH)?;

        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Whether the KFD character device exists on this machine.
    #[must_use]
    pub fn is_present() -> bool {
        Path::new(KFD_DEVICE_PATH).exists()
    }

    /// Generic unsafe helper to execute an IOCTL.
    ///
    /// # Safety
    /// The caller must ensure that `arg` points to valid memory appropriate for the specific `cmd`.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Get the KFD driver version.
    pub fn get_version(&self) -> io::Result<GetVersionArgs> {
        let mut args = GetVersionArgs::default();
        unsafe {
            self.ioctl(AMDKFD_IOC_GET_VERSION, &mut args)?;
        }
        Ok(args)
    }

    // ===========================================================================================
    // VM & Apertures
    // ===========================================================================================

    /// Acquire the VM from the DRM render node.
    ///
    /// Links the KFD process context with the AMDGPU DRM context; required before any
    /// allocation on `gpu_id`.
    pub fn acquire_vm(&self, gpu_id: u32, drm_fd: u32) -> io::Result<()> {
        let mut args = AcquireVmArgs { drm_fd, gpu_id };
        unsafe { self.ioctl(AMDKFD_IOC_ACQUIRE_VM, &mut args) }
    }

    /// Retrieve process apertures (LDS, Scratch, GPUVM limits) for every node.
    ///
    /// `args.kfd_process_device_apertures_ptr` must point to a user-allocated array of
    /// `ProcessDeviceApertures` with `args.num_of_nodes` entries.
    pub fn get_process_apertures_new(
        &self,
        args: &mut GetProcessAperturesNewArgs,
    ) -> io::Result<()> {
        unsafe { self.ioctl(AMDKFD_IOC_GET_PROCESS_APERTURES_NEW, args) }
    }

    // ===========================================================================================
    // Memory Management
    // ===========================================================================================

    /// Allocate memory on a specific GPU at a caller-chosen virtual address.
    ///
    /// On success, `args.handle` and `args.mmap_offset` are populated by the driver.
    pub fn alloc_memory_of_gpu(&self, args: &mut AllocMemoryOfGpuArgs) -> io::Result<()> {
        unsafe { self.ioctl(AMDKFD_IOC_ALLOC_MEMORY_OF_GPU, args) }
    }

    /// Free memory previously allocated or imported.
    pub fn free_memory_of_gpu(&self, handle: u64) -> io::Result<()> {
        let mut args = FreeMemoryOfGpuArgs { handle };
        unsafe { self.ioctl(AMDKFD_IOC_FREE_MEMORY_OF_GPU, &mut args) }
    }

    /// Map a buffer object into the GPU page tables of a single device.
    pub fn map_memory_to_gpu(&self, handle: u64, gpu_id: u32) -> io::Result<()> {
        let mut args = MapMemoryToGpuArgs {
            handle,
            device_ids_array_ptr: &raw const gpu_id as u64,
            n_devices: 1,
            n_success: 0,
        };
        unsafe { self.ioctl(AMDKFD_IOC_MAP_MEMORY_TO_GPU, &mut args) }
    }

    /// Unmap a buffer object from the GPU page tables of a single device.
    pub fn unmap_memory_from_gpu(&self, handle: u64, gpu_id: u32) -> io::Result<()> {
        let mut args = UnmapMemoryFromGpuArgs {
            handle,
            device_ids_array_ptr: &raw const gpu_id as u64,
            n_devices: 1,
            n_success: 0,
        };
        unsafe { self.ioctl(AMDKFD_IOC_UNMAP_MEMORY_FROM_GPU, &mut args) }
    }

    /// Query available memory for a specific GPU.
    pub fn get_available_memory(&self, gpu_id: u32) -> io::Result<u64> {
        let mut args = GetAvailableMemoryArgs {
            available: 0,
            gpu_id,
            pad: 0,
        };
        unsafe {
            self.ioctl(AMDKFD_IOC_AVAILABLE_MEMORY, &mut args)?;
        }
        Ok(args.available)
    }

    // ===========================================================================================
    // DMA Buffer Interop
    // ===========================================================================================

    /// Export a buffer object as a DMA buffer file descriptor.
    pub fn export_dmabuf(&self, handle: u64) -> io::Result<OwnedFd> {
        let mut args = ExportDmabufArgs {
            handle,
            flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            dmabuf_fd: 0,
        };
        unsafe {
            self.ioctl(AMDKFD_IOC_EXPORT_DMABUF, &mut args)?;
            Ok(OwnedFd::from_raw_fd(args.dmabuf_fd as RawFd))
        }
    }

    /// Import a DMA buffer at `va_addr` on `gpu_id`, returning the new buffer object handle.
    pub fn import_dmabuf(&self, va_addr: u64, gpu_id: u32, dmabuf_fd: RawFd) -> io::Result<u64> {
        let mut args = ImportDmabufArgs {
            va_addr,
            handle: 0,
            gpu_id,
            dmabuf_fd: dmabuf_fd as u32,
        };
        unsafe {
            self.ioctl(AMDKFD_IOC_IMPORT_DMABUF, &mut args)?;
        }
        Ok(args.handle)
    }
}

impl AsRawFd for KfdDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
