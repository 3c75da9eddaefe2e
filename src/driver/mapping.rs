//! CPU-side address-space primitives shared by the drivers.

#![allow(clippy::cast_possible_wrap)]

use crate::utils::align_up;
use std::io;
use std::os::fd::RawFd;
use std::ptr;

const PLACEHOLDER_PROT: libc::c_int = libc::PROT_NONE;
const PLACEHOLDER_FLAGS: libc::c_int =
    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

/// Claims `size` bytes of inaccessible, unbacked address space aligned to `align`.
pub fn reserve_placeholder(size: usize, align: usize) -> io::Result<u64> {
    let span = size
        .checked_add(align)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;

    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            span,
            PLACEHOLDER_PROT,
            PLACEHOLDER_FLAGS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    // Trim the unaligned head and the surplus tail.
    let start = raw as u64;
    let base = align_up(start, align as u64);
    let head = (base - start) as usize;
    let tail = span - head - size;
    unsafe {
        if head > 0 {
            libc::munmap(raw, head);
        }
        if tail > 0 {
            libc::munmap((base as usize + size) as *mut libc::c_void, tail);
        }
    }
    Ok(base)
}

/// Claims `[addr, addr + size)` as a placeholder, failing if anything is mapped there.
pub fn reserve_placeholder_at(addr: u64, size: usize) -> io::Result<()> {
    let raw = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            size,
            PLACEHOLDER_PROT,
            PLACEHOLDER_FLAGS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    if raw as u64 != addr {
        // Kernels before 4.17 treat the flag as a hint.
        unsafe { libc::munmap(raw, size) };
        return Err(io::Error::from_raw_os_error(libc::EEXIST));
    }
    Ok(())
}

/// Replaces whatever is mapped at `[va, va + size)` with a placeholder.
pub fn restore_placeholder(va: u64, size: usize) -> io::Result<()> {
    let raw = unsafe {
        libc::mmap(
            va as *mut libc::c_void,
            size,
            PLACEHOLDER_PROT,
            PLACEHOLDER_FLAGS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Maps `size` bytes of `fd` at `offset` read/write over `va`.
pub fn map_shared_fixed(va: u64, size: usize, fd: RawFd, offset: u64) -> io::Result<()> {
    let raw = unsafe {
        libc::mmap(
            va as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            offset as libc::off_t,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn unmap(va: u64, size: usize) -> io::Result<()> {
    let ret = unsafe { libc::munmap(va as *mut libc::c_void, size) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
