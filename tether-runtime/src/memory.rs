//! Store-backed linear memory for the heap.
//!
//! The heap lives inside the store's host state while the bytes live in the
//! module's exported memory, so every heap operation temporarily takes the
//! heap out of the store, runs against a [`StoreBuffer`], and puts it back.

use crate::host::HostState;
use tether_core::memory::{Heap, LinearBuffer, PAGE_SIZE};
use tether_core::{BridgeError, Result};
use wasmtime::{AsContextMut, Memory, StoreContextMut};

/// A module's exported memory viewed as a [`LinearBuffer`].
pub struct StoreBuffer<'a> {
    memory: Memory,
    store: StoreContextMut<'a, HostState>,
}

impl<'a> StoreBuffer<'a> {
    /// Wrap a memory and the store that owns it.
    pub fn new(memory: Memory, store: StoreContextMut<'a, HostState>) -> Self {
        Self { memory, store }
    }
}

impl LinearBuffer for StoreBuffer<'_> {
    fn len(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    fn grow(&mut self, delta: u32) -> Result<()> {
        let limit = self.store.data().heap_limit_pages();
        self.memory
            .grow(&mut self.store, delta as u64)
            .map(|_| ())
            .map_err(|e| {
                tracing::debug!(delta, error = %e, "memory.grow refused");
                BridgeError::OutOfMemory {
                    requested: delta as u64 * PAGE_SIZE as u64,
                    limit_pages: limit,
                }
            })
    }

    fn bytes(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut self.store)
    }
}

/// Run a heap operation against a module's memory.
pub(crate) fn with_heap<R>(
    mut store: impl AsContextMut<Data = HostState>,
    memory: Memory,
    op: impl FnOnce(&mut Heap, &mut StoreBuffer<'_>) -> Result<R>,
) -> Result<R> {
    let mut ctx = store.as_context_mut();
    let mut heap = std::mem::take(&mut ctx.data_mut().heap);
    let result = {
        let mut buf = StoreBuffer::new(memory, ctx.as_context_mut());
        op(&mut heap, &mut buf)
    };
    ctx.data_mut().heap = heap;
    result
}

/// Copy bytes out of memory.
pub(crate) fn read(
    store: impl wasmtime::AsContext<Data = HostState>,
    memory: Memory,
    offset: u32,
    len: u32,
) -> Result<Vec<u8>> {
    let data = memory.data(&store);
    let start = offset as usize;
    data.get(start..start + len as usize)
        .map(<[u8]>::to_vec)
        .ok_or(BridgeError::MemoryAccess {
            offset: offset as u64,
            len: len as u64,
            size: data.len() as u64,
        })
}

/// Copy bytes into memory.
pub(crate) fn write(
    mut store: impl AsContextMut<Data = HostState>,
    memory: Memory,
    offset: u32,
    bytes: &[u8],
) -> Result<()> {
    let data = memory.data_mut(&mut store);
    let size = data.len() as u64;
    let start = offset as usize;
    let dest = data
        .get_mut(start..start + bytes.len())
        .ok_or(BridgeError::MemoryAccess {
            offset: offset as u64,
            len: bytes.len() as u64,
            size,
        })?;
    dest.copy_from_slice(bytes);
    Ok(())
}

/// Read a UTF-8 string. Invalid sequences are replaced.
pub(crate) fn read_string(
    store: impl wasmtime::AsContext<Data = HostState>,
    memory: Memory,
    ptr: u32,
    len: u32,
) -> Result<String> {
    let bytes = read(store, memory, ptr, len)?;
    Ok(String::from_utf8(bytes)
        .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
}

/// Allocate a region and copy a string into it. Returns `(ptr, len)`.
pub(crate) fn pass_string(
    mut store: impl AsContextMut<Data = HostState>,
    memory: Memory,
    value: &str,
) -> Result<(u32, u32)> {
    let len = u32::try_from(value.len()).map_err(|_| BridgeError::InvalidLayout {
        size: u32::MAX,
        align: 1,
    })?;
    let ptr = with_heap(&mut store, memory, |heap, buf| heap.allocate(buf, len, 1))?;
    write(&mut store, memory, ptr, value.as_bytes())?;
    Ok((ptr, len))
}
