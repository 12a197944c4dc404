//! Packet buffer pool shared by the hardware and simulation domains
//!
//! Pre-allocates one memory region (hugepages if available) carved into
//! fixed-size buffers, and hands them out through a lock-free free list.

use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};

/// 2MB hugepage size
const HUGEPAGE_SIZE: usize = 2 * 1024 * 1024;

/// Fixed-capacity pool of packet buffers
///
/// Allocation and release are O(1) and safe from any thread.
pub struct BufferPool {
    /// Base pointer to mmap'd region
    base: NonNull<u8>,
    /// Total size of mapped region
    size: usize,
    buffer_size: usize,
    count: usize,
    /// Free list of buffer indices
    free: ArrayQueue<u32>,
    using_hugepages: bool,
}

// SAFETY: the mapped region is only reached through PacketBuffer handles,
// each of which owns a distinct slot, and ArrayQueue is thread-safe.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Create a pool of `count` buffers, `buffer_size` bytes each.
    ///
    /// Attempts to use 2MB hugepages for better TLB performance.
    /// Falls back to regular pages if hugepages are not available.
    pub fn new(count: usize, buffer_size: usize) -> io::Result<Self> {
        if count == 0 || buffer_size == 0 || count > u32::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid buffer pool dimensions",
            ));
        }
        let requested = count
            .checked_mul(buffer_size)
            .ok_or_else(|| io::Error::other("buffer pool size overflow"))?;

        let (ptr, size, using_hugepages) =
            Self::try_mmap_hugepages(requested).or_else(|_| Self::mmap_regular(requested))?;

        let base =
            NonNull::new(ptr).ok_or_else(|| io::Error::other("mmap returned null pointer"))?;

        let free = ArrayQueue::new(count);
        for i in 0..count {
            // Cannot be full: capacity equals count
            let _ = free.push(i as u32);
        }

        tracing::debug!(
            buffer_count = count,
            buffer_size,
            hugepages = using_hugepages,
            "Buffer pool created"
        );

        Ok(Self {
            base,
            size,
            buffer_size,
            count,
            free,
            using_hugepages,
        })
    }

    fn try_mmap_hugepages(size: usize) -> io::Result<(*mut u8, usize, bool)> {
        // munmap of a hugetlb mapping needs a hugepage-aligned length
        let size = size
            .checked_next_multiple_of(HUGEPAGE_SIZE)
            .ok_or_else(|| io::Error::other("buffer pool size overflow"))?;
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_HUGETLB;
        Ok((Self::mmap(size, flags)?, size, true))
    }

    fn mmap_regular(size: usize) -> io::Result<(*mut u8, usize, bool)> {
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        Ok((Self::mmap(size, flags)?, size, false))
    }

    fn mmap(size: usize, flags: MapFlags) -> io::Result<*mut u8> {
        let length = NonZeroUsize::new(size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero-sized pool"))?;

        // SAFETY: anonymous private mapping, no existing memory is aliased
        let ptr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
            )?
        };

        Ok(ptr.as_ptr().cast())
    }

    /// Allocate a buffer from the pool
    ///
    /// Returns `None` if the pool is exhausted.
    #[inline]
    pub fn alloc(self: &Arc<Self>) -> Option<PacketBuffer> {
        self.free.pop().map(|index| PacketBuffer {
            pool: Arc::clone(self),
            index,
            len: 0,
        })
    }

    /// Number of buffers currently free
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of buffers
    pub fn capacity(&self) -> usize {
        self.count
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn using_hugepages(&self) -> bool {
        self.using_hugepages
    }

    #[inline]
    fn buffer_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: index < count, enforced by the free list contents
        unsafe { self.base.as_ptr().add(index as usize * self.buffer_size) }
    }

    #[inline]
    fn release(&self, index: u32) {
        // Cannot be full: every index is held either here or by one handle
        let _ = self.free.push(index);
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // SAFETY: self.base was allocated by mmap in new() with self.size bytes
        unsafe {
            let ptr = NonNull::new_unchecked(self.base.as_ptr().cast());
            let _ = munmap(ptr, self.size);
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.count)
            .field("available", &self.available())
            .field("buffer_size", &self.buffer_size)
            .field("hugepages", &self.using_hugepages)
            .finish()
    }
}

/// A packet buffer checked out of the pool
///
/// Exactly one stage holds a given buffer at a time; it moves between the
/// hardware, the exchange rings and the device facade, and returns to the
/// pool when dropped.
pub struct PacketBuffer {
    pool: Arc<BufferPool>,
    index: u32,
    /// Length of valid data
    len: usize,
}

impl PacketBuffer {
    /// Valid frame bytes
    #[inline]
    pub fn data(&self) -> &[u8] {
        // SAFETY: len <= buffer_size and the slot is owned by this handle
        unsafe { std::slice::from_raw_parts(self.pool.buffer_ptr(self.index), self.len) }
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: len <= buffer_size and the slot is owned by this handle
        unsafe { std::slice::from_raw_parts_mut(self.pool.buffer_ptr(self.index), self.len) }
    }

    /// The whole data room, for receiving into the buffer.
    /// Follow with `set_len`.
    #[inline]
    pub fn write_area(&mut self) -> &mut [u8] {
        // SAFETY: the slot is buffer_size bytes and owned by this handle
        unsafe {
            std::slice::from_raw_parts_mut(self.pool.buffer_ptr(self.index), self.pool.buffer_size)
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the logical frame length
    ///
    /// # Panics
    /// Panics if `len` exceeds the buffer capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity(), "frame length exceeds buffer capacity");
        self.len = len;
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.pool.buffer_size
    }

    /// Copy a whole frame in. Returns false, leaving the buffer untouched,
    /// if the frame does not fit.
    pub fn copy_from(&mut self, frame: &[u8]) -> bool {
        if frame.len() > self.capacity() {
            return false;
        }
        self.write_area()[..frame.len()].copy_from_slice(frame);
        self.len = frame.len();
        true
    }

    /// Slot index inside the pool
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for PacketBuffer {
    #[inline]
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}
