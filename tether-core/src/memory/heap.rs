//! Free-list allocator over a [`LinearBuffer`].
//!
//! The heap owns only bookkeeping; the bytes live in whatever buffer the
//! caller passes to each operation. Everything below the heap base belongs
//! to the module's static data and is never handed out.

use super::buffer::{LinearBuffer, PAGE_SIZE};
use crate::config::MemoryConfig;
use crate::error::{BridgeError, Result};
use std::collections::BTreeMap;

/// Lowest offset the heap will hand out, so offset 0 stays a null pointer.
const NULL_GUARD: u32 = 8;

/// Highest break the heap can record. The last byte of a full 4 GiB memory
/// is never handed out, so region ends always fit in a `u32`.
const MAX_OFFSET: u64 = u32::MAX as u64;

/// First-fit allocator with coalescing free blocks.
#[derive(Debug, Clone, Default)]
pub struct Heap {
    config: MemoryConfig,
    /// Start of the heap region; `None` until the first operation.
    base: Option<u32>,
    /// One past the highest byte ever handed out and still in use.
    brk: u32,
    /// Free blocks below `brk`, keyed by offset. Never adjacent to each other
    /// and never ending at `brk`.
    free: BTreeMap<u32, u32>,
    allocated: u64,
    generation: u64,
}

impl Heap {
    /// Create a heap with the given limits.
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Pin the heap base explicitly. Has no effect once the heap is in use.
    pub fn initialize(&mut self, base: u32) {
        if self.base.is_none() {
            let base = base.max(NULL_GUARD);
            self.base = Some(base);
            self.brk = base;
            tracing::debug!(base, "heap initialized");
        }
    }

    /// Check if the heap base is set.
    pub fn is_initialized(&self) -> bool {
        self.base.is_some()
    }

    /// Heap base, if initialized.
    pub fn base(&self) -> Option<u32> {
        self.base
    }

    /// Current break (end of the in-use region).
    pub fn brk(&self) -> u32 {
        self.brk
    }

    /// Bytes currently allocated to callers.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    /// Number of buffer growths so far. Any change means previously fetched
    /// views are stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of free blocks below the break.
    pub fn free_blocks(&self) -> usize {
        self.free.len()
    }

    /// Configured limits.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Reserve `size` bytes aligned to `align`.
    ///
    /// Zero-size requests return `align` without reserving anything.
    pub fn allocate<B: LinearBuffer + ?Sized>(
        &mut self,
        buf: &mut B,
        size: u32,
        align: u32,
    ) -> Result<u32> {
        check_layout(size, align)?;
        if size == 0 {
            return Ok(align);
        }
        self.ensure_base(buf);

        if let Some(offset) = self.take_free(size, align) {
            self.allocated += size as u64;
            tracing::trace!(offset, size, align, "allocated from free list");
            return Ok(offset);
        }

        let start = align_up(self.brk as u64, align);
        let end = start + size as u64;
        self.reserve(buf, end, size as u64)?;

        let old_brk = self.brk;
        self.brk = end as u32;
        if start > old_brk as u64 {
            self.insert_free(old_brk, start as u32 - old_brk);
        }
        self.allocated += size as u64;
        tracing::trace!(offset = start, size, align, "allocated at break");
        Ok(start as u32)
    }

    /// Resize a region, preserving the first `min(old_size, new_size)` bytes.
    ///
    /// The returned offset may differ from `offset`, in which case the old
    /// region is released.
    pub fn reallocate<B: LinearBuffer + ?Sized>(
        &mut self,
        buf: &mut B,
        offset: u32,
        old_size: u32,
        align: u32,
        new_size: u32,
    ) -> Result<u32> {
        check_layout(new_size, align)?;
        if old_size == 0 {
            return self.allocate(buf, new_size, align);
        }
        if new_size == 0 {
            self.free(offset, old_size, align)?;
            return Ok(align);
        }
        let old_end = offset as u64 + old_size as u64;
        if old_end > buf.len() as u64 || old_end > MAX_OFFSET {
            return Err(BridgeError::MemoryAccess {
                offset: offset as u64,
                len: old_size as u64,
                size: buf.len() as u64,
            });
        }
        if new_size <= old_size {
            if new_size < old_size {
                self.release(offset + new_size, old_size - new_size);
            }
            return Ok(offset);
        }

        let extra = new_size - old_size;
        let old_end = old_end as u32;

        // Grow into the free block that directly follows.
        if let Some(&next) = self.free.get(&old_end) {
            if next >= extra {
                self.free.remove(&old_end);
                if next > extra {
                    self.free.insert(old_end + extra, next - extra);
                }
                self.allocated += extra as u64;
                return Ok(offset);
            }
        }

        // Grow past the break.
        if old_end == self.brk {
            let end = offset as u64 + new_size as u64;
            self.reserve(buf, end, extra as u64)?;
            self.brk = end as u32;
            self.allocated += extra as u64;
            return Ok(offset);
        }

        let moved = self.allocate(buf, new_size, align)?;
        let (src, dst) = (offset as usize, moved as usize);
        buf.bytes_mut()
            .copy_within(src..src + old_size as usize, dst);
        self.release(offset, old_size);
        tracing::trace!(from = offset, to = moved, new_size, "reallocated by copy");
        Ok(moved)
    }

    /// Release a region. Double frees are not detected.
    pub fn free(&mut self, offset: u32, size: u32, align: u32) -> Result<()> {
        check_layout(size, align)?;
        if size == 0 {
            return Ok(());
        }
        self.release(offset, size);
        tracing::trace!(offset, size, "freed");
        Ok(())
    }

    fn ensure_base<B: LinearBuffer + ?Sized>(&mut self, buf: &B) {
        if self.base.is_none() {
            let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
            let base = self.config.heap_base.unwrap_or(len);
            self.initialize(base);
        }
    }

    /// Make sure the buffer covers `[0, end)`, growing within the ceiling.
    /// Leaves all state untouched on failure.
    fn reserve<B: LinearBuffer + ?Sized>(
        &mut self,
        buf: &mut B,
        end: u64,
        requested: u64,
    ) -> Result<()> {
        let limit = self.config.max_pages;
        if end > MAX_OFFSET {
            tracing::debug!(requested, end, "break would leave the 32-bit address space");
            return Err(BridgeError::OutOfMemory {
                requested,
                limit_pages: limit,
            });
        }
        if end <= buf.len() as u64 {
            return Ok(());
        }
        let needed = end.div_ceil(PAGE_SIZE as u64);
        if needed > limit as u64 {
            tracing::debug!(requested, needed_pages = needed, limit, "memory ceiling reached");
            return Err(BridgeError::OutOfMemory {
                requested,
                limit_pages: limit,
            });
        }
        let delta = needed as u32 - buf.pages();
        buf.grow(delta)?;
        self.generation += 1;
        tracing::debug!(
            delta,
            pages = needed,
            generation = self.generation,
            "linear memory grown"
        );
        Ok(())
    }

    fn take_free(&mut self, size: u32, align: u32) -> Option<u32> {
        let (block, block_size, start) = self.free.iter().find_map(|(&off, &len)| {
            let start = align_up(off as u64, align);
            (start + size as u64 <= off as u64 + len as u64).then_some((off, len, start as u32))
        })?;

        self.free.remove(&block);
        if start > block {
            self.free.insert(block, start - block);
        }
        let tail_start = start + size;
        let block_end = block + block_size;
        if block_end > tail_start {
            self.free.insert(tail_start, block_end - tail_start);
        }
        Some(start)
    }

    fn release(&mut self, offset: u32, size: u32) {
        self.allocated = self.allocated.saturating_sub(size as u64);
        self.insert_free(offset, size);
    }

    fn insert_free(&mut self, mut offset: u32, mut size: u32) {
        if let Some((&prev, &prev_size)) = self.free.range(..offset).next_back() {
            if prev + prev_size == offset {
                self.free.remove(&prev);
                offset = prev;
                size += prev_size;
            }
        }
        if let Some(next_size) = self.free.remove(&(offset + size)) {
            size += next_size;
        }
        if offset + size == self.brk {
            self.brk = offset;
        } else {
            self.free.insert(offset, size);
        }
    }
}

fn check_layout(size: u32, align: u32) -> Result<()> {
    if align == 0 || !align.is_power_of_two() {
        return Err(BridgeError::InvalidLayout { size, align });
    }
    Ok(())
}

fn align_up(value: u64, align: u32) -> u64 {
    let mask = align as u64 - 1;
    (value + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{VecBuffer, MAX_PAGES};

    fn heap(max_pages: u32) -> (Heap, VecBuffer) {
        let config = MemoryConfig::default().with_max_pages(max_pages);
        (Heap::new(config), VecBuffer::new(1))
    }

    #[test]
    fn base_defaults_to_initial_size() {
        let (mut heap, mut buf) = heap(4);
        let ptr = heap.allocate(&mut buf, 16, 8).unwrap();
        assert_eq!(heap.base(), Some(PAGE_SIZE));
        assert_eq!(ptr, PAGE_SIZE);
        assert_eq!(buf.pages(), 2);
        assert_eq!(heap.generation(), 1);
    }

    #[test]
    fn explicit_base_is_respected() {
        let (mut heap, mut buf) = heap(4);
        heap.initialize(1024);
        let ptr = heap.allocate(&mut buf, 16, 16).unwrap();
        assert_eq!(ptr, 1024);
        assert_eq!(heap.generation(), 0);
    }

    #[test]
    fn zero_size_returns_align() {
        let (mut heap, mut buf) = heap(4);
        assert_eq!(heap.allocate(&mut buf, 0, 4).unwrap(), 4);
        assert_eq!(heap.allocated_bytes(), 0);
        heap.free(4, 0, 4).unwrap();
    }

    #[test]
    fn rejects_bad_alignment() {
        let (mut heap, mut buf) = heap(4);
        let err = heap.allocate(&mut buf, 8, 3).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidLayout { align: 3, .. }));
    }

    #[test]
    fn alignment_is_honored() {
        let (mut heap, mut buf) = heap(4);
        heap.initialize(100);
        let a = heap.allocate(&mut buf, 3, 1).unwrap();
        let b = heap.allocate(&mut buf, 8, 64).unwrap();
        assert_eq!(a, 100);
        assert_eq!(b % 64, 0);
        assert!(b >= a + 3);
        // Padding between the two is reusable.
        let c = heap.allocate(&mut buf, 4, 4).unwrap();
        assert!(c >= a + 3 && c + 4 <= b);
    }

    #[test]
    fn freed_block_is_reused() {
        let (mut heap, mut buf) = heap(4);
        heap.initialize(64);
        let a = heap.allocate(&mut buf, 32, 8).unwrap();
        let _b = heap.allocate(&mut buf, 32, 8).unwrap();
        heap.free(a, 32, 8).unwrap();
        let c = heap.allocate(&mut buf, 16, 8).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn freeing_top_block_lowers_break() {
        let (mut heap, mut buf) = heap(4);
        heap.initialize(64);
        let a = heap.allocate(&mut buf, 32, 8).unwrap();
        let b = heap.allocate(&mut buf, 32, 8).unwrap();
        heap.free(a, 32, 8).unwrap();
        heap.free(b, 32, 8).unwrap();
        assert_eq!(heap.brk(), 64);
        assert_eq!(heap.free_blocks(), 0);
        assert_eq!(heap.allocated_bytes(), 0);
    }

    #[test]
    fn realloc_shrink_in_place() {
        let (mut heap, mut buf) = heap(4);
        heap.initialize(64);
        let a = heap.allocate(&mut buf, 64, 8).unwrap();
        let b = heap.reallocate(&mut buf, a, 64, 8, 16).unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.allocated_bytes(), 16);
    }

    #[test]
    fn realloc_grows_at_break_in_place() {
        let (mut heap, mut buf) = heap(4);
        heap.initialize(64);
        let a = heap.allocate(&mut buf, 16, 8).unwrap();
        let b = heap.reallocate(&mut buf, a, 16, 8, 128).unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.brk(), 64 + 128);
    }

    #[test]
    fn realloc_moves_and_preserves_prefix() {
        let (mut heap, mut buf) = heap(4);
        heap.initialize(64);
        let a = heap.allocate(&mut buf, 8, 8).unwrap();
        let _fence = heap.allocate(&mut buf, 8, 8).unwrap();
        buf.bytes_mut()[a as usize..a as usize + 8].copy_from_slice(b"abcdefgh");

        let moved = heap.reallocate(&mut buf, a, 8, 8, 32).unwrap();
        assert_ne!(moved, a);
        assert_eq!(&buf.bytes()[moved as usize..moved as usize + 8], b"abcdefgh");
    }

    #[test]
    fn out_of_memory_leaves_state_intact() {
        let (mut heap, mut buf) = heap(2);
        let a = heap.allocate(&mut buf, 1024, 8).unwrap();
        buf.bytes_mut()[a as usize] = 0xAB;
        let before = (heap.brk(), heap.allocated_bytes(), buf.pages());

        let err = heap.allocate(&mut buf, PAGE_SIZE, 8).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfMemory { limit_pages: 2, .. }));
        assert_eq!((heap.brk(), heap.allocated_bytes(), buf.pages()), before);
        assert_eq!(buf.bytes()[a as usize], 0xAB);
    }

    /// Reports a full 4 GiB memory without backing it.
    struct FullMemory;

    impl LinearBuffer for FullMemory {
        fn len(&self) -> usize {
            MAX_PAGES as usize * PAGE_SIZE as usize
        }

        fn grow(&mut self, _delta: u32) -> Result<()> {
            unreachable!("a full memory never needs to grow")
        }

        fn bytes(&self) -> &[u8] {
            &[]
        }

        fn bytes_mut(&mut self) -> &mut [u8] {
            &mut []
        }
    }

    #[test]
    fn break_never_wraps_at_address_space_end() {
        let mut heap = Heap::new(MemoryConfig::default().with_max_pages(MAX_PAGES));
        let mut buf = FullMemory;
        heap.initialize(u32::MAX - 63);

        let err = heap.allocate(&mut buf, 64, 1).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfMemory { .. }));
        assert_eq!(heap.brk(), u32::MAX - 63);

        let ptr = heap.allocate(&mut buf, 32, 1).unwrap();
        assert_eq!(ptr, u32::MAX - 63);
        assert_eq!(heap.brk(), u32::MAX - 31);

        let err = heap.reallocate(&mut buf, ptr, 32, 1, 64).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfMemory { .. }));
        assert_eq!(heap.brk(), u32::MAX - 31);
    }

    #[test]
    fn default_base_saturates_on_full_memory() {
        let mut heap = Heap::new(MemoryConfig::default().with_max_pages(MAX_PAGES));
        let err = heap.allocate(&mut FullMemory, 8, 8).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfMemory { .. }));
        assert_eq!(heap.base(), Some(u32::MAX));
    }
}
