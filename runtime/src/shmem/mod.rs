// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Shared-memory primitives.
//!
//! This is the narrow unsafe waist of the runtime: a mapped region
//! ([`ShmRegion`]), a process-relocatable pointer ([`ShmPointer`]), and a
//! typed allocator over the region ([`Allocator`]). Everything above this
//! module speaks `ShmPointer` and obtains short-lived typed views through
//! [`Allocator::convert`]; views are borrows, never owners.

mod allocator;

pub use allocator::{Allocator, ShmPointer};

use crate::error::{Result, RuntimeError};
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, mmap_anonymous, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

/// Which kind of mapping backs a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// A named POSIX `shm_open` segment, attachable from other processes.
    Posix,
    /// An anonymous shared mapping, visible only within this process. Used
    /// by tests and single-process deployments.
    Heap,
}

/// A mapped shared-memory region.
#[derive(Debug)]
pub struct ShmRegion {
    base: NonNull<u8>,
    len: usize,
    name: String,
    kind: BackendKind,
    owner: bool,
}

// Safety: the mapping is plain memory; all concurrent access within it is
// mediated by the atomics of the structures stored there.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

// === impl ShmRegion ===

impl ShmRegion {
    /// Create (or truncate) a named POSIX segment of `len` bytes and map it.
    pub fn create_posix(name: &str, len: usize) -> Result<Self> {
        let name = shm_name(name);
        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(io_err)?;
        ftruncate(&fd, len as libc::off_t).map_err(io_err)?;
        let base = Self::map(&fd, len)?;
        Ok(Self {
            base,
            len,
            name,
            kind: BackendKind::Posix,
            owner: true,
        })
    }

    /// Attach to an existing named POSIX segment of `len` bytes.
    pub fn attach_posix(name: &str, len: usize) -> Result<Self> {
        let name = shm_name(name);
        let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty()).map_err(io_err)?;
        let base = Self::map(&fd, len)?;
        Ok(Self {
            base,
            len,
            name,
            kind: BackendKind::Posix,
            owner: false,
        })
    }

    /// Create an anonymous shared mapping of `len` bytes.
    pub fn create_heap(len: usize) -> Result<Self> {
        let len_nz = NonZeroUsize::new(len)
            .ok_or(RuntimeError::ResourceExhausted("zero-length shm region"))?;
        // Safety: anonymous mapping, no file, no aliasing with existing maps.
        let base = unsafe {
            mmap_anonymous(
                None,
                len_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(io_err)?;
        Ok(Self {
            base: base.cast(),
            len,
            name: String::new(),
            kind: BackendKind::Heap,
            owner: true,
        })
    }

    fn map(fd: &impl std::os::fd::AsFd, len: usize) -> Result<NonNull<u8>> {
        let len_nz = NonZeroUsize::new(len)
            .ok_or(RuntimeError::ResourceExhausted("zero-length shm region"))?;
        // Safety: mapping a freshly opened segment at a kernel-chosen address.
        let base = unsafe {
            mmap(
                None,
                len_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(io_err)?;
        Ok(base.cast())
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // Safety: we mapped base..base+len in the constructor and nothing
        // else unmaps it.
        unsafe {
            let _ = munmap(self.base.cast(), self.len);
        }
        if self.owner && self.kind == BackendKind::Posix {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}

fn io_err(errno: nix::errno::Errno) -> RuntimeError {
    RuntimeError::Io(std::io::Error::from_raw_os_error(errno as i32))
}

/// POSIX requires segment names to begin with a slash.
fn shm_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

/// A length-counted byte buffer in shared memory, used by task payloads that
/// carry variable-length fields (names, paths). The owning task frees it via
/// its `release` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ShmBuf {
    pub ptr: ShmPointer,
    pub len: u64,
}

// === impl ShmBuf ===

impl ShmBuf {
    pub const fn null() -> Self {
        Self {
            ptr: ShmPointer::null(),
            len: 0,
        }
    }

    pub fn from_bytes(alloc: &Allocator, bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::null());
        }
        let ptr = alloc.allocate(bytes.len())?;
        // Safety: freshly allocated, sized for `bytes`.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                alloc.convert_raw(ptr).as_ptr(),
                bytes.len(),
            );
        }
        Ok(Self {
            ptr,
            len: bytes.len() as u64,
        })
    }

    pub fn from_str(alloc: &Allocator, s: &str) -> Result<Self> {
        Self::from_bytes(alloc, s.as_bytes())
    }

    pub fn as_slice<'a>(&self, alloc: &'a Allocator) -> &'a [u8] {
        if self.ptr.is_null() {
            return &[];
        }
        // Safety: allocation length was recorded at construction.
        unsafe {
            core::slice::from_raw_parts(alloc.convert_raw(self.ptr).as_ptr(), self.len as usize)
        }
    }

    pub fn to_string(&self, alloc: &Allocator) -> String {
        String::from_utf8_lossy(self.as_slice(alloc)).into_owned()
    }

    pub fn free(&mut self, alloc: &Allocator) {
        alloc.free(self.ptr);
        *self = Self::null();
    }

    /// Wire the buffer contents through an archive, reallocating on load.
    pub fn wire_with<A: crate::net::serialize::Archive>(&mut self, ar: &mut A, alloc: &Allocator) {
        let mut bytes = if ar.is_loading() {
            Vec::new()
        } else {
            self.as_slice(alloc).to_vec()
        };
        ar.bytes(&mut bytes);
        if ar.is_loading() {
            *self = Self::from_bytes(alloc, &bytes).unwrap_or(Self::null());
        }
    }
}
