//! The transferable form of a physical allocation.
//!
//! An [`ExportedHandle`] is a fixed-size byte blob that names an open file
//! descriptor (a `memfd` or a dma-buf) inside the exporting process. Another
//! process reconstructs the descriptor from `(pid, fd)` and checks that it still
//! refers to the same backing object before mapping it.

use crate::error::{ReproError, ReproResult};
use bytemuck::{Pod, Zeroable};
use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Size of the serialized handle on the wire.
pub const EXPORTED_HANDLE_LEN: usize = 64;

const HANDLE_MAGIC: u32 = 0x4852_5848; // "HXRH"
const HANDLE_VERSION: u16 = 1;

/// Which driver produced the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HandleKind {
    HostMemfd = 1,
    KfdDmabuf = 2,
}

impl HandleKind {
    const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::HostMemfd),
            2 => Some(Self::KfdDmabuf),
            _ => None,
        }
    }
}

/// Identity of a backing object: the `(st_dev, st_ino)` of its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackingId {
    pub dev: u64,
    pub ino: u64,
}

impl BackingId {
    /// Reads the identity of an open descriptor.
    pub fn of_fd(fd: RawFd) -> io::Result<Self> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::fstat(fd, &raw mut st) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
        })
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
struct HandleRecord {
    magic: u32,
    version: u16,
    kind: u16,
    pid: u32,
    fd: i32,
    device: u32,
    gpu_id: u32,
    size: u64,
    st_dev: u64,
    st_ino: u64,
    reserved: [u64; 2],
}

const _: () = assert!(std::mem::size_of::<HandleRecord>() == EXPORTED_HANDLE_LEN);

/// A serialized, cross-process-transferable reference to physical device memory.
///
/// Valid only while the exporting allocation is alive in the exporting process.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExportedHandle {
    record: HandleRecord,
}

impl ExportedHandle {
    pub(crate) fn new(
        kind: HandleKind,
        fd: RawFd,
        device: u32,
        gpu_id: u32,
        size: usize,
        backing: BackingId,
    ) -> Self {
        Self {
            record: HandleRecord {
                magic: HANDLE_MAGIC,
                version: HANDLE_VERSION,
                kind: kind as u16,
                pid: std::process::id(),
                fd,
                device,
                gpu_id,
                size: size as u64,
                st_dev: backing.dev,
                st_ino: backing.ino,
                reserved: [0; 2],
            },
        }
    }

    /// Parses a handle received from a peer.
    ///
    /// # Errors
    /// `InvalidHandle` if the blob has the wrong length or is not a handle produced by this crate.
    pub fn from_bytes(bytes: &[u8]) -> ReproResult<Self> {
        if bytes.len() != EXPORTED_HANDLE_LEN {
            return Err(ReproError::InvalidHandle(format!(
                "expected {EXPORTED_HANDLE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let record: HandleRecord = bytemuck::try_pod_read_unaligned(bytes)
            .map_err(|e| ReproError::InvalidHandle(format!("malformed handle: {e:?}")))?;

        if record.magic != HANDLE_MAGIC {
            return Err(ReproError::InvalidHandle(format!(
                "bad magic 0x{:08x}",
                record.magic
            )));
        }
        if record.version != HANDLE_VERSION {
            return Err(ReproError::InvalidHandle(format!(
                "unsupported handle version {}",
                record.version
            )));
        }
        if HandleKind::from_raw(record.kind).is_none() {
            return Err(ReproError::InvalidHandle(format!(
                "unknown handle kind {}",
                record.kind
            )));
        }
        Ok(Self { record })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(&self.record)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; EXPORTED_HANDLE_LEN] {
        let mut out = [0u8; EXPORTED_HANDLE_LEN];
        out.copy_from_slice(self.as_bytes());
        out
    }

    #[must_use]
    pub fn kind(&self) -> HandleKind {
        // Validated on construction.
        HandleKind::from_raw(self.record.kind).unwrap_or(HandleKind::HostMemfd)
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.record.pid
    }

    #[must_use]
    pub const fn fd(&self) -> RawFd {
        self.record.fd
    }

    /// Device index of the exporter.
    #[must_use]
    pub const fn device(&self) -> u32 {
        self.record.device
    }

    #[must_use]
    pub const fn gpu_id(&self) -> u32 {
        self.record.gpu_id
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.record.size as usize
    }

    #[must_use]
    pub const fn backing(&self) -> BackingId {
        BackingId {
            dev: self.record.st_dev,
            ino: self.record.st_ino,
        }
    }

    /// Opens a new descriptor for the backing object in this process.
    ///
    /// In the exporting process this duplicates the descriptor; elsewhere it is
    /// pulled from the exporter with `pidfd_getfd`, falling back to
    /// `/proc/<pid>/fd/<fd>`. The result must refer to the same backing object
    /// the handle was created for.
    pub(crate) fn reopen(&self) -> ReproResult<OwnedFd> {
        let fd = if self.pid() == std::process::id() {
            dup_cloexec(self.fd())
        } else {
            pidfd_getfd(self.pid(), self.fd()).or_else(|e| {
                tracing::debug!(pid = self.pid(), fd = self.fd(), error = %e,
                    "pidfd_getfd failed, falling back to procfs");
                open_proc_fd(self.pid(), self.fd())
            })
        }
        .map_err(|e| {
            ReproError::InvalidHandle(format!(
                "cannot reopen fd {} of pid {}: {e}",
                self.fd(),
                self.pid()
            ))
        })?;

        let found = BackingId::of_fd(fd.as_raw_fd())?;
        if found != self.backing() {
            return Err(ReproError::InvalidHandle(format!(
                "stale handle: fd {} of pid {} no longer refers to the exported allocation",
                self.fd(),
                self.pid()
            )));
        }
        Ok(fd)
    }
}

impl fmt::Debug for ExportedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedHandle")
            .field("kind", &self.kind())
            .field("pid", &self.pid())
            .field("fd", &self.fd())
            .field("device", &self.device())
            .field("size", &self.size())
            .field("backing", &self.backing())
            .finish()
    }
}

fn dup_cloexec(fd: RawFd) -> io::Result<OwnedFd> {
    let ret = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(ret) })
}

#[allow(clippy::cast_possible_truncation)]
fn pidfd_getfd(pid: u32, fd: RawFd) -> io::Result<OwnedFd> {
    let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0) };
    if pidfd < 0 {
        return Err(io::Error::last_os_error());
    }
    let pidfd = unsafe { OwnedFd::from_raw_fd(pidfd as RawFd) };

    let ret = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd.as_raw_fd(), fd, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

fn open_proc_fd(pid: u32, fd: RawFd) -> io::Result<OwnedFd> {
    let path = CString::new(format!("/proc/{pid}/fd/{fd}"))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let ret = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(ret) })
}
