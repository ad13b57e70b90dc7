//! Sub-allocation of object ranges inside the arena.
//!
//! The broker does not decide where objects live; it delegates to an
//! [`Allocator`] that hands out byte offsets inside the one arena segment.
//! [`FreeList`] is the reference implementation: a first-fit free list with
//! neighbor coalescing, 16-byte grains, and zeroing/copying done directly
//! through the segment. Shared-arena deployments may substitute an
//! allocator that keeps its bookkeeping inside the arena itself; the
//! contract is the same either way.

use crate::segment::Segment;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Allocation grain: offsets and block sizes are multiples of this.
const GRAIN: u64 = 16;

/// Round a request up to the allocation grain.
///
/// Returns `None` on overflow or for zero (the broker rejects zero-size
/// requests before they get here).
#[inline]
fn round_up(size: u64) -> Option<u64> {
    if size == 0 {
        return None;
    }
    size.checked_add(GRAIN - 1).map(|v| v & !(GRAIN - 1))
}

/// Carves object ranges out of the arena.
///
/// All three operations are infallible in time (no suspension) and report
/// exhaustion by returning `None`. Offsets handed out by `alloc` are the
/// broker's problem to pass back verbatim; freeing an offset that was never
/// allocated is a fatal bookkeeping violation and panics.
pub trait Allocator: Send {
    /// Total number of bytes under management.
    fn capacity(&self) -> u64;

    /// Bytes not currently allocated. Fragmentation may keep a request
    /// smaller than this from succeeding.
    fn free_bytes(&self) -> u64;

    /// Allocate `size` bytes, optionally zeroed. Returns the arena offset,
    /// or `None` if no block fits.
    fn alloc(&mut self, size: u64, clear: bool) -> Option<u64>;

    /// Return a block to the allocator.
    fn free(&mut self, offset: u64);

    /// Resize a block, preserving contents up to the smaller of the two
    /// sizes. The block may move; the new offset is returned. On `None` the
    /// original block is untouched.
    fn realloc(&mut self, offset: u64, new_size: u64) -> Option<u64>;
}

/// First-fit free-list allocator over one segment.
///
/// Free spans are kept coalesced: no two entries are adjacent. `used` maps
/// every live block to its grain-rounded length so `free`/`realloc` can
/// validate their arguments.
pub struct FreeList {
    segment: Arc<dyn Segment>,
    /// offset -> span length, coalesced.
    free: BTreeMap<u64, u64>,
    /// offset -> block length (grain-rounded).
    used: HashMap<u64, u64>,
    capacity: u64,
}

impl FreeList {
    /// Create a free list covering the whole segment (rounded down to the
    /// allocation grain).
    pub fn new(segment: Arc<dyn Segment>) -> Self {
        let capacity = (segment.len() as u64) & !(GRAIN - 1);
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            segment,
            free,
            used: HashMap::new(),
            capacity,
        }
    }

    /// Number of live blocks.
    pub fn used_blocks(&self) -> usize {
        self.used.len()
    }

    /// Insert a span into the free map, merging with both neighbors.
    fn insert_free(&mut self, offset: u64, len: u64) {
        let mut start = offset;
        let mut span = len;

        if let Some((&prev_off, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_off + prev_len == offset {
                self.free.remove(&prev_off);
                start = prev_off;
                span += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(start + span)) {
            self.free.remove(&(start + span));
            span += next_len;
        }
        self.free.insert(start, span);
    }

    fn zero_range(&self, offset: u64, len: u64) {
        let Some(base) = self.segment.as_mut_ptr() else {
            debug_assert!(false, "zeroing through a read-only segment");
            return;
        };
        // SAFETY: offset/len describe a block inside the segment per the
        // free-list bookkeeping.
        unsafe { std::ptr::write_bytes(base.add(offset as usize), 0, len as usize) };
    }

    fn copy_range(&self, src: u64, dst: u64, len: u64) {
        let Some(base) = self.segment.as_mut_ptr() else {
            debug_assert!(false, "copying through a read-only segment");
            return;
        };
        // SAFETY: src and dst are distinct live blocks, so the ranges
        // cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(
                base.add(src as usize) as *const u8,
                base.add(dst as usize),
                len as usize,
            )
        };
    }
}

impl Allocator for FreeList {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    fn alloc(&mut self, size: u64, clear: bool) -> Option<u64> {
        let need = round_up(size)?;

        let fit = self
            .free
            .iter()
            .find(|&(_, &len)| len >= need)
            .map(|(&off, &len)| (off, len));
        let (off, len) = fit?;

        self.free.remove(&off);
        if len > need {
            self.free.insert(off + need, len - need);
        }
        self.used.insert(off, need);

        if clear {
            self.zero_range(off, need);
        }
        Some(off)
    }

    fn free(&mut self, offset: u64) {
        let Some(len) = self.used.remove(&offset) else {
            panic!("free of unallocated offset {offset}");
        };
        self.insert_free(offset, len);
    }

    fn realloc(&mut self, offset: u64, new_size: u64) -> Option<u64> {
        let Some(&old) = self.used.get(&offset) else {
            panic!("realloc of unallocated offset {offset}");
        };
        let need = round_up(new_size)?;

        if need == old {
            return Some(offset);
        }

        if need < old {
            // Shrink in place, releasing the tail.
            self.used.insert(offset, need);
            self.insert_free(offset + need, old - need);
            return Some(offset);
        }

        // Grow in place when a free span starts right after the block.
        let grow = need - old;
        if let Some(&adj) = self.free.get(&(offset + old)) {
            if adj >= grow {
                self.free.remove(&(offset + old));
                if adj > grow {
                    self.free.insert(offset + need, adj - grow);
                }
                self.used.insert(offset, need);
                return Some(offset);
            }
        }

        // Move: allocate first so failure leaves the block untouched.
        let new_off = self.alloc(need, false)?;
        self.copy_range(offset, new_off, old);
        self.free(offset);
        Some(new_off)
    }
}
