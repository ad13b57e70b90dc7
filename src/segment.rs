//! Arena backing memory: the segment trait and its two reference backends.
//!
//! The broker manages object lifetimes inside exactly one contiguous region
//! of memory, the arena. [`Segment`] abstracts over how that region is
//! backed: [`MemfdSegment`] is the production backend (one memfd for the
//! whole arena, shareable with clients by passing the fd), [`HeapSegment`]
//! is the single-process twin used by tests and embeddings that never cross
//! a process boundary.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;

/// Descriptor for sharing a segment with client processes.
///
/// This is what a client needs to map the same arena. The fd form travels
/// via SCM_RIGHTS over a Unix socket; the named form is for segments that
/// live under a filesystem name.
#[derive(Debug, Clone)]
pub enum SegmentDescriptor {
    /// File descriptor (memfd or shm_open).
    Fd {
        /// The raw file descriptor.
        fd: RawFd,
        /// Size of the memory region.
        size: usize,
    },
    /// Named shared memory segment.
    Named {
        /// Name of the shared memory segment.
        name: String,
        /// Size of the memory region.
        size: usize,
    },
}

impl SegmentDescriptor {
    /// Size of the region this descriptor maps.
    #[inline]
    pub fn size(&self) -> usize {
        match self {
            SegmentDescriptor::Fd { size, .. } => *size,
            SegmentDescriptor::Named { size, .. } => *size,
        }
    }
}

/// Trait for arena backing memory.
///
/// A segment is one contiguous region; the broker's allocator carves object
/// ranges out of it and the pool zeroes ranges through it.
///
/// # Safety
///
/// Implementations must ensure that:
/// - Pointers remain valid and stable for the lifetime of the segment
/// - Thread-safety requirements are met (Send + Sync)
pub trait Segment: Send + Sync {
    /// Get a raw pointer to the start of this segment.
    fn as_ptr(&self) -> *const u8;

    /// Get a mutable pointer to the start of this segment.
    ///
    /// Returns `None` if the segment is mapped read-only. Read-only
    /// segments cannot back a broker arena (clearing and reallocation
    /// write through it); broker construction rejects them.
    fn as_mut_ptr(&self) -> Option<*mut u8>;

    /// Total size of the segment in bytes.
    fn len(&self) -> usize;

    /// Returns true if the segment has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a descriptor for sharing this segment with client processes.
    ///
    /// Returns `None` if the backend doesn't support cross-process sharing.
    fn descriptor(&self) -> Option<SegmentDescriptor>;

    /// Get the segment as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no mutable references exist to this memory.
    unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Caller guarantees no mutable references exist.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    /// Get the segment as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access to this memory. This returns
    /// a mutable reference from `&self` because the underlying memory may be
    /// mutable even when the segment handle is shared (e.g. memory-mapped
    /// regions). Callers must ensure proper synchronization.
    #[allow(clippy::mut_from_ref)]
    unsafe fn as_mut_slice(&self) -> Option<&mut [u8]> {
        // SAFETY: Caller guarantees exclusive access.
        self.as_mut_ptr()
            .map(|ptr| unsafe { std::slice::from_raw_parts_mut(ptr, self.len()) })
    }
}

impl dyn Segment {
    /// Check if this segment can be shared with other processes.
    pub fn is_shareable(&self) -> bool {
        self.descriptor().is_some()
    }
}

// ============================================================================
// HeapSegment
// ============================================================================

/// An arena backed by heap allocation.
///
/// The simplest backend, suitable for single-process embeddings and tests.
/// It does not support cross-process sharing.
///
/// # Example
///
/// ```rust
/// use depot::segment::{HeapSegment, Segment};
///
/// let segment = HeapSegment::new(4096).unwrap();
/// assert_eq!(segment.len(), 4096);
/// assert!(segment.descriptor().is_none());
/// ```
pub struct HeapSegment {
    /// The underlying memory allocation.
    /// Using a boxed slice ensures the memory is contiguous and won't be reallocated.
    data: Box<[u8]>,
}

impl HeapSegment {
    /// Create a new zero-initialized heap segment of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if size is 0.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        let data = vec![0u8; size].into_boxed_slice();

        Ok(Self { data })
    }
}

impl Segment for HeapSegment {
    fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        // We have exclusive ownership, so we can provide mutable access.
        // This is safe because HeapSegment is not Clone.
        Some(self.data.as_ptr() as *mut u8)
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn descriptor(&self) -> Option<SegmentDescriptor> {
        // Heap memory cannot be shared across processes
        None
    }
}

// ============================================================================
// MemfdSegment
// ============================================================================

/// An arena backed by an anonymous memfd mapping.
///
/// One fd covers the whole arena; clients map the same region by receiving
/// the fd and mmap-ing it themselves. The mapping is released on drop (the
/// kernel keeps the region alive for clients that still hold the fd).
pub struct MemfdSegment {
    /// The memfd file descriptor (one fd for the entire arena).
    fd: OwnedFd,
    /// Base pointer to the mmap'd region.
    base: NonNull<u8>,
    /// Total size of the arena in bytes.
    size: usize,
    /// Debug name passed to memfd_create.
    name: String,
}

impl MemfdSegment {
    /// Create a new memfd-backed arena of `size` bytes.
    pub fn new(size: usize) -> Result<Self> {
        Self::with_name("depot-arena", size)
    }

    /// Create a new memfd-backed arena with a debug name.
    pub fn with_name(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        let cname = CString::new(name).map_err(|e| Error::InvalidSegment(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;

        rustix::fs::ftruncate(&fd, size as u64)?;

        // SAFETY: mapping a fresh fd we own, at an address chosen by the
        // kernel, for exactly the length we just set.
        let base = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        Ok(Self {
            fd,
            base,
            size,
            name: name.to_string(),
        })
    }

    /// Get the file descriptor for sharing with client processes.
    #[inline]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Get the raw file descriptor.
    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Get the debug name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MemfdSegment {
    fn drop(&mut self) {
        // SAFETY: base/size describe the mapping we created in with_name.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.size);
        }
    }
}

// SAFETY: MemfdSegment is Send + Sync because:
// - The mapping address and size never change after construction
// - The fd is kernel-reference-counted
// - Access to the mapped bytes is governed by the broker's discipline,
//   not by this handle
unsafe impl Send for MemfdSegment {}
unsafe impl Sync for MemfdSegment {}

impl AsFd for MemfdSegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Segment for MemfdSegment {
    #[inline]
    fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    #[inline]
    fn as_mut_ptr(&self) -> Option<*mut u8> {
        Some(self.base.as_ptr())
    }

    #[inline]
    fn len(&self) -> usize {
        self.size
    }

    fn descriptor(&self) -> Option<SegmentDescriptor> {
        Some(SegmentDescriptor::Fd {
            fd: self.raw_fd(),
            size: self.size,
        })
    }
}
