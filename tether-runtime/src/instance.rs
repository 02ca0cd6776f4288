//! The live binding returned by a successful instantiation.

use crate::host::{destroy_from_host, invoke_from_host, settle, HostState};
use crate::memory::{self, with_heap};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tether_core::closure::ClosureRecord;
use tether_core::{
    BridgeError, Closure, ClosureBridge, Extern, Heap, HostValue, Result, TrampolineId,
};
use wasmtime::{Instance, Memory, Store, WasmParams, WasmResults};

/// Exported entry points, live memory and bridge state of one instance.
///
/// Only reachable once instantiation has reached `Ready`. Dropping the
/// handle drops the store, its memory and every value in its table.
pub struct ModuleHandle {
    name: String,
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    main_export: String,
}

impl ModuleHandle {
    pub(crate) fn new(
        name: String,
        store: Store<HostState>,
        instance: Instance,
        memory: Memory,
        main_export: String,
    ) -> Self {
        Self {
            name,
            store,
            instance,
            memory,
            main_export,
        }
    }

    /// Name or locator the module was loaded from.
    pub fn name(&self) -> &str {
        &self.name
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Call the entry point with an argument count and argument pointer.
    pub fn main(&mut self, argc: i32, argv: i32) -> Result<i32> {
        let export = self.main_export.clone();
        self.call::<(i32, i32), i32>(&export, (argc, argv))
    }

    /// Call any export with statically typed parameters and results.
    pub fn call<P, R>(&mut self, export: &str, params: P) -> Result<R>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self
            .instance
            .get_typed_func::<P, R>(&mut self.store, export)
            .map_err(|e| BridgeError::MissingExport {
                export: export.to_string(),
                cause: e.to_string(),
            })?;
        let _span = crate::instrument_export!(self.name, export).entered();
        let outcome = func.call(&mut self.store, params);
        settle(&mut self.store, export, outcome)
    }

    /// Check if the module exports a function with this name.
    pub fn has_export(&mut self, export: &str) -> bool {
        self.instance.get_func(&mut self.store, export).is_some()
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Reserve `size` bytes at `align`.
    pub fn malloc(&mut self, size: u32, align: u32) -> Result<u32> {
        with_heap(&mut self.store, self.memory, |heap, buf| {
            heap.allocate(buf, size, align)
        })
    }

    /// Resize a region, preserving its common prefix.
    pub fn realloc(&mut self, ptr: u32, old_size: u32, align: u32, new_size: u32) -> Result<u32> {
        with_heap(&mut self.store, self.memory, |heap, buf| {
            heap.reallocate(buf, ptr, old_size, align, new_size)
        })
    }

    /// Release a region.
    pub fn free(&mut self, ptr: u32, size: u32, align: u32) -> Result<()> {
        self.store.data_mut().heap.free(ptr, size, align)
    }

    /// Current memory size in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    /// Number of times memory has grown through the heap. A change means any
    /// offsets or lengths derived from an earlier view must be re-checked.
    pub fn generation(&self) -> u64 {
        self.store.data().heap.generation()
    }

    /// Borrow the whole memory. The borrow ends before the next call that
    /// could grow it.
    pub fn view(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    /// Copy bytes out of memory.
    pub fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        memory::read(&self.store, self.memory, offset, len)
    }

    /// Copy bytes into memory.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        memory::write(&mut self.store, self.memory, offset, bytes)
    }

    /// Copy a string into a fresh region and return `(ptr, len)`.
    pub fn pass_string(&mut self, value: &str) -> Result<(u32, u32)> {
        memory::pass_string(&mut self.store, self.memory, value)
    }

    /// Read a UTF-8 string from memory.
    pub fn read_string(&self, ptr: u32, len: u32) -> Result<String> {
        memory::read_string(&self.store, self.memory, ptr, len)
    }

    /// Heap statistics.
    pub fn heap(&self) -> &Heap {
        self.store.data().heap()
    }

    // =========================================================================
    // Reference table
    // =========================================================================

    /// Allocate an empty table slot.
    pub fn externref_table_alloc(&mut self) -> Result<u32> {
        self.store.data_mut().table.alloc()
    }

    /// Reseed the sentinel slots, as `__wbindgen_init_externref_table` does.
    pub fn init_externref_table(&mut self) {
        self.store.data_mut().table.reseed();
    }

    /// Store a value behind a new handle.
    pub fn insert_value(&mut self, value: impl Into<HostValue>) -> Result<u32> {
        self.store
            .data_mut()
            .table
            .insert(Extern::Value(value.into()))
    }

    /// Store a value in an allocated slot.
    pub fn set_value(&mut self, handle: u32, value: impl Into<HostValue>) -> Result<()> {
        self.store
            .data_mut()
            .table
            .set(handle, Extern::Value(value.into()))
    }

    /// Clone the value behind a handle.
    pub fn value(&self, handle: u32) -> Result<HostValue> {
        self.store
            .data()
            .table
            .get(handle)?
            .as_value()
            .cloned()
            .ok_or_else(|| BridgeError::InvalidHandle {
                handle,
                cause: "slot holds a closure".to_string(),
            })
    }

    /// Remove the value behind a handle and free the slot.
    pub fn take_value(&mut self, handle: u32) -> Result<HostValue> {
        let value = self.value(handle)?;
        self.store.data_mut().table.release(handle)?;
        Ok(value)
    }

    /// Free a slot, dropping its value.
    pub fn release_value(&mut self, handle: u32) -> Result<()> {
        self.store.data_mut().table.release(handle).map(|_| ())
    }

    /// Number of allocated slots, sentinels excluded.
    pub fn live_handles(&self) -> u32 {
        self.store.data().table.live_count()
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    /// Record a pending exception, as the module would before unwinding.
    pub fn exn_store(&mut self, value: impl Into<HostValue>) {
        self.store.data_mut().exceptions.store(value.into());
    }

    /// Take the pending exception, if any.
    pub fn exn_take(&mut self) -> Option<HostValue> {
        self.store.data_mut().exceptions.take()
    }

    // =========================================================================
    // Closures
    // =========================================================================

    /// Wrap a host callback so module code can call it through `trampoline`.
    pub fn wrap_callback<F>(&mut self, trampoline: TrampolineId, callback: F) -> Result<Closure>
    where
        F: Fn(&[HostValue]) -> std::result::Result<HostValue, HostValue> + Send + Sync + 'static,
    {
        let state = self.store.data_mut();
        state
            .closures
            .wrap(&mut state.table, trampoline, Arc::new(callback))
    }

    /// Take ownership of a closure handle the module produced.
    pub fn claim_closure(&self, handle: u32) -> Result<Closure> {
        let state = self.store.data();
        state.closures.claim(&state.table, handle)
    }

    /// Inspect a live closure.
    pub fn closure(&self, handle: u32) -> Result<&ClosureRecord> {
        ClosureBridge::resolve(&self.store.data().table, handle)
    }

    /// Invoke a closure by handle.
    pub fn invoke_closure(&mut self, handle: u32, args: &[HostValue]) -> Result<HostValue> {
        invoke_from_host(&mut self.store, handle, args)
    }

    /// Invoke a closure through its token.
    pub fn invoke(&mut self, closure: &Closure, args: &[HostValue]) -> Result<HostValue> {
        self.invoke_closure(closure.handle(), args)
    }

    /// Destroy a closure, consuming its token.
    pub fn destroy(&mut self, closure: Closure) -> Result<()> {
        self.destroy_closure(closure.handle())
    }

    /// Destroy a closure by handle. Any later invoke or destroy of the
    /// handle fails with [`BridgeError::UseAfterDestroy`].
    pub fn destroy_closure(&mut self, handle: u32) -> Result<()> {
        destroy_from_host(&mut self.store, handle)
    }

    // =========================================================================
    // Sharing
    // =========================================================================

    /// Put the handle behind a single lock for use from several threads.
    pub fn into_shared(self) -> SharedModule {
        SharedModule(Arc::new(Mutex::new(self)))
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("name", &self.name)
            .field("memory_size", &self.memory_size())
            .field("live_handles", &self.live_handles())
            .finish()
    }
}

/// A module handle shared across threads. Every call into the module and
/// the bridge goes through one mutex.
#[derive(Clone)]
pub struct SharedModule(Arc<Mutex<ModuleHandle>>);

impl SharedModule {
    /// Lock the handle.
    pub fn lock(&self) -> MutexGuard<'_, ModuleHandle> {
        self.0.lock()
    }

    /// Run `f` with exclusive access to the handle.
    pub fn with<R>(&self, f: impl FnOnce(&mut ModuleHandle) -> R) -> R {
        f(&mut self.0.lock())
    }
}
