//! Growable byte buffers the heap allocates from.

use crate::error::{BridgeError, Result};

/// WASM page size in bytes (64 KiB).
pub const PAGE_SIZE: u32 = 64 * 1024;

/// Largest page count addressable with 32-bit offsets.
pub const MAX_PAGES: u32 = 65536;

/// A contiguous byte region that only grows, in whole pages.
///
/// Growing may move the underlying storage, so slices returned by
/// [`bytes`](Self::bytes) and [`bytes_mut`](Self::bytes_mut) must be
/// re-fetched after any call to [`grow`](Self::grow).
pub trait LinearBuffer {
    /// Current size in bytes.
    fn len(&self) -> usize;

    /// Grow by `delta` pages.
    fn grow(&mut self, delta: u32) -> Result<()>;

    /// Read view of the whole buffer.
    fn bytes(&self) -> &[u8];

    /// Write view of the whole buffer.
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Current size in pages.
    fn pages(&self) -> u32 {
        (self.len() / PAGE_SIZE as usize) as u32
    }

    /// Check if the buffer is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A `Vec`-backed linear buffer with an optional page limit.
#[derive(Debug, Clone, Default)]
pub struct VecBuffer {
    data: Vec<u8>,
    max_pages: Option<u32>,
}

impl VecBuffer {
    /// Create a zeroed buffer of `pages` pages.
    pub fn new(pages: u32) -> Self {
        Self {
            data: vec![0; pages as usize * PAGE_SIZE as usize],
            max_pages: None,
        }
    }

    /// Cap growth at `max` pages.
    pub fn with_max_pages(mut self, max: u32) -> Self {
        self.max_pages = Some(max);
        self
    }
}

impl LinearBuffer for VecBuffer {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn grow(&mut self, delta: u32) -> Result<()> {
        let limit = self.max_pages.unwrap_or(MAX_PAGES);
        let new_pages = self.pages().saturating_add(delta);
        if new_pages > limit {
            return Err(BridgeError::OutOfMemory {
                requested: delta as u64 * PAGE_SIZE as u64,
                limit_pages: limit,
            });
        }
        self.data.resize(new_pages as usize * PAGE_SIZE as usize, 0);
        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
