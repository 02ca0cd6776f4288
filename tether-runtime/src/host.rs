//! Host function bindings for modules.
//!
//! Provides the imports a module may call to use the host's heap,
//! reference table, closure bridge and exception channel. All imports live
//! in one namespace (`wbg` by default).

use crate::config::RuntimeConfig;
use crate::convert::{lift_arg, lift_result, lower, val_type, zero};
use crate::memory::{read_string, with_heap};
use std::collections::HashMap;
use tether_core::closure::ClosureTarget;
use tether_core::table::{ExternRefTable, SlotState};
use tether_core::{
    AbiType, BridgeError, ClosureBridge, ExceptionChannel, Extern, Heap, HostValue, Result,
    TrampolineId,
};
use wasmtime::{
    AsContextMut, Caller, Func, FuncType, Linker, Memory, StoreLimits, StoreLimitsBuilder, Val,
    ValType,
};

/// Module exports that back a trampoline for module-owned closures.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ModuleTrampoline {
    pub(crate) invoke: Option<Func>,
    pub(crate) destroy: Option<Func>,
}

/// State provided to host functions.
///
/// One per store, so two module handles never share a heap, a table or an
/// exception slot.
pub struct HostState {
    pub(crate) heap: Heap,
    pub(crate) table: ExternRefTable<Extern>,
    pub(crate) closures: ClosureBridge,
    pub(crate) exceptions: ExceptionChannel,
    pub(crate) limits: StoreLimits,
    pub(crate) trampolines: HashMap<TrampolineId, ModuleTrampoline>,
    max_pages: u32,
}

impl HostState {
    /// Create host state for one instantiation.
    pub fn new(config: &RuntimeConfig) -> Self {
        let memory = &config.bridge.memory;
        let mut closures = ClosureBridge::new();
        for t in &config.trampolines {
            closures.register(t.id, t.signature.clone());
        }
        let max_bytes = memory.max_pages as usize * tether_core::memory::PAGE_SIZE as usize;
        Self {
            heap: Heap::new(memory.clone()),
            table: ExternRefTable::new(config.bridge.table.clone()),
            closures,
            exceptions: ExceptionChannel::new(),
            limits: StoreLimitsBuilder::new().memory_size(max_bytes).build(),
            trampolines: HashMap::new(),
            max_pages: memory.max_pages,
        }
    }

    /// Memory ceiling in pages.
    pub fn heap_limit_pages(&self) -> u32 {
        self.max_pages
    }

    /// Heap bookkeeping.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The reference table.
    pub fn table(&self) -> &ExternRefTable<Extern> {
        &self.table
    }

    /// Check if an exception is waiting to be read.
    pub fn has_pending_exception(&self) -> bool {
        self.exceptions.is_pending()
    }
}

/// Create a linker with all host functions registered.
pub fn create_linker(
    engine: &wasmtime::Engine,
    config: &RuntimeConfig,
) -> Result<Linker<HostState>> {
    let mut linker = Linker::new(engine);
    register_host_functions(&mut linker, config)?;
    Ok(linker)
}

/// Register every host import under the configured namespace.
pub fn register_host_functions(linker: &mut Linker<HostState>, config: &RuntimeConfig) -> Result<()> {
    let ns = config.namespace.as_str();

    // Memory
    register_memory_functions(linker, ns)?;

    // Reference table and values
    register_table_functions(linker, ns)?;

    // Exceptions
    register_exception_functions(linker, ns)?;

    // Closures
    register_closure_functions(linker, config)?;

    Ok(())
}

fn register_memory_functions(linker: &mut Linker<HostState>, ns: &str) -> Result<()> {
    // __wbindgen_malloc(size, align) -> ptr
    linker
        .func_wrap(
            ns,
            "__wbindgen_malloc",
            |mut caller: Caller<'_, HostState>, size: u32, align: u32| -> anyhow::Result<u32> {
                let memory = memory_of(&mut caller)?;
                Ok(with_heap(&mut caller, memory, |heap, buf| {
                    heap.allocate(buf, size, align)
                })?)
            },
        )
        .map_err(link_error("__wbindgen_malloc"))?;

    // __wbindgen_realloc(ptr, old_size, align, new_size) -> ptr
    linker
        .func_wrap(
            ns,
            "__wbindgen_realloc",
            |mut caller: Caller<'_, HostState>,
             ptr: u32,
             old_size: u32,
             align: u32,
             new_size: u32|
             -> anyhow::Result<u32> {
                let memory = memory_of(&mut caller)?;
                Ok(with_heap(&mut caller, memory, |heap, buf| {
                    heap.reallocate(buf, ptr, old_size, align, new_size)
                })?)
            },
        )
        .map_err(link_error("__wbindgen_realloc"))?;

    // __wbindgen_free(ptr, size, align)
    linker
        .func_wrap(
            ns,
            "__wbindgen_free",
            |mut caller: Caller<'_, HostState>, ptr: u32, size: u32, align: u32| -> anyhow::Result<()> {
                caller.data_mut().heap.free(ptr, size, align)?;
                Ok(())
            },
        )
        .map_err(link_error("__wbindgen_free"))?;

    Ok(())
}

fn register_table_functions(linker: &mut Linker<HostState>, ns: &str) -> Result<()> {
    // __externref_table_alloc() -> handle
    linker
        .func_wrap(
            ns,
            "__externref_table_alloc",
            |mut caller: Caller<'_, HostState>| -> anyhow::Result<u32> {
                Ok(caller.data_mut().table.alloc()?)
            },
        )
        .map_err(link_error("__externref_table_alloc"))?;

    // __wbindgen_init_externref_table()
    linker
        .func_wrap(
            ns,
            "__wbindgen_init_externref_table",
            |mut caller: Caller<'_, HostState>| {
                caller.data_mut().table.reseed();
            },
        )
        .map_err(link_error("__wbindgen_init_externref_table"))?;

    // __wbindgen_string_new(ptr, len) -> handle
    linker
        .func_wrap(
            ns,
            "__wbindgen_string_new",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> anyhow::Result<u32> {
                let memory = memory_of(&mut caller)?;
                let s = read_string(&caller, memory, ptr, len)?;
                Ok(caller.data_mut().table.insert(Extern::Value(HostValue::String(s)))?)
            },
        )
        .map_err(link_error("__wbindgen_string_new"))?;

    // __wbindgen_number_new(value) -> handle
    linker
        .func_wrap(
            ns,
            "__wbindgen_number_new",
            |mut caller: Caller<'_, HostState>, value: f64| -> anyhow::Result<u32> {
                Ok(caller
                    .data_mut()
                    .table
                    .insert(Extern::Value(HostValue::Number(value)))?)
            },
        )
        .map_err(link_error("__wbindgen_number_new"))?;

    // __wbindgen_number_get(handle) -> f64, NaN for non-numbers
    linker
        .func_wrap(
            ns,
            "__wbindgen_number_get",
            |caller: Caller<'_, HostState>, handle: u32| -> anyhow::Result<f64> {
                let slot = caller.data().table.get(handle)?;
                Ok(slot
                    .as_value()
                    .and_then(HostValue::as_f64)
                    .unwrap_or(f64::NAN))
            },
        )
        .map_err(link_error("__wbindgen_number_get"))?;

    // __wbindgen_object_clone_ref(handle) -> handle
    linker
        .func_wrap(
            ns,
            "__wbindgen_object_clone_ref",
            |mut caller: Caller<'_, HostState>, handle: u32| -> anyhow::Result<u32> {
                let table = &mut caller.data_mut().table;
                if table.is_reserved(handle) {
                    return Ok(handle);
                }
                let value = lift_arg(table, AbiType::Ref, &Val::I32(handle as i32))?;
                Ok(table.insert(Extern::Value(value))?)
            },
        )
        .map_err(link_error("__wbindgen_object_clone_ref"))?;

    // __wbindgen_object_drop_ref(handle)
    linker
        .func_wrap(
            ns,
            "__wbindgen_object_drop_ref",
            |mut caller: Caller<'_, HostState>, handle: u32| -> anyhow::Result<()> {
                let table = &mut caller.data_mut().table;
                if !table.is_reserved(handle) {
                    table.release(handle)?;
                }
                Ok(())
            },
        )
        .map_err(link_error("__wbindgen_object_drop_ref"))?;

    Ok(())
}

fn register_exception_functions(linker: &mut Linker<HostState>, ns: &str) -> Result<()> {
    // __wbindgen_exn_store(handle)
    linker
        .func_wrap(
            ns,
            "__wbindgen_exn_store",
            |mut caller: Caller<'_, HostState>, handle: u32| -> anyhow::Result<()> {
                let state = caller.data_mut();
                let value = lift_result(&mut state.table, AbiType::Ref, &Val::I32(handle as i32))?;
                state.exceptions.store(value);
                Ok(())
            },
        )
        .map_err(link_error("__wbindgen_exn_store"))?;

    // __wbindgen_throw(ptr, len): stores the message and unwinds
    linker
        .func_wrap(
            ns,
            "__wbindgen_throw",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> anyhow::Result<()> {
                let memory = memory_of(&mut caller)?;
                let message = read_string(&caller, memory, ptr, len)?;
                tracing::debug!(%message, "module threw");
                caller
                    .data_mut()
                    .exceptions
                    .store(HostValue::String(message.clone()));
                Err(anyhow::anyhow!("thrown: {}", message))
            },
        )
        .map_err(link_error("__wbindgen_throw"))?;

    Ok(())
}

fn register_closure_functions(linker: &mut Linker<HostState>, config: &RuntimeConfig) -> Result<()> {
    let ns = config.namespace.as_str();

    // __wbindgen_closure_wrap(data, vtable, trampoline) -> handle
    linker
        .func_wrap(
            ns,
            "__wbindgen_closure_wrap",
            |mut caller: Caller<'_, HostState>,
             data: u32,
             vtable: u32,
             trampoline: u32|
             -> anyhow::Result<u32> {
                let state = caller.data_mut();
                Ok(state
                    .closures
                    .wrap_module(&mut state.table, TrampolineId(trampoline), data, vtable)?)
            },
        )
        .map_err(link_error("__wbindgen_closure_wrap"))?;

    // __wbindgen_cb_drop(handle) -> 1 if the closure was live, 0 if already destroyed
    linker
        .func_wrap(
            ns,
            "__wbindgen_cb_drop",
            |mut caller: Caller<'_, HostState>, handle: u32| -> anyhow::Result<u32> {
                if caller.data().table.state(handle) == SlotState::Retired {
                    return Ok(0);
                }
                if let Some((func, args)) = retire_closure(caller.data_mut(), handle, None)? {
                    func.call(&mut caller, &args, &mut [])?;
                }
                Ok(1)
            },
        )
        .map_err(link_error("__wbindgen_cb_drop"))?;

    let engine = linker.engine().clone();
    for trampoline in &config.trampolines {
        let id = trampoline.id;
        let signature = &trampoline.signature;

        // __wbg_invoke_<id>(handle, params...) -> result
        let params = std::iter::once(ValType::I32).chain(signature.params.iter().map(|p| val_type(*p)));
        let results = signature.result.map(val_type);
        let invoke_ty = FuncType::new(&engine, params, results);
        let name = trampoline.invoke_import();
        linker
            .func_new(ns, &name, invoke_ty, move |mut caller, params, results| {
                let handle = params.first().and_then(Val::i32).unwrap_or_default() as u32;
                invoke_from_module(&mut caller, id, handle, &params[1..], results)
            })
            .map_err(link_error(&name))?;

        // __wbg_destroy_<id>(handle)
        let destroy_ty = FuncType::new(&engine, [ValType::I32], std::iter::empty());
        let name = trampoline.destroy_import();
        linker
            .func_new(ns, &name, destroy_ty, move |mut caller, params, _results| {
                let handle = params.first().and_then(Val::i32).unwrap_or_default() as u32;
                if let Some((func, args)) = retire_closure(caller.data_mut(), handle, Some(id))? {
                    func.call(&mut caller, &args, &mut [])?;
                }
                Ok(())
            })
            .map_err(link_error(&name))?;
    }

    Ok(())
}

/// Module-side invocation through trampoline `id`.
fn invoke_from_module(
    caller: &mut Caller<'_, HostState>,
    id: TrampolineId,
    handle: u32,
    params: &[Val],
    results: &mut [Val],
) -> anyhow::Result<()> {
    let state = caller.data_mut();
    let target = ClosureBridge::enter(&mut state.table, handle, Some(id), params.len())?;
    let signature = state
        .closures
        .signature(id)
        .cloned()
        .ok_or_else(|| undeclared(id))?;

    match target {
        ClosureTarget::Host(callback) => {
            let args = signature
                .params
                .iter()
                .zip(params)
                .map(|(ty, val)| lift_arg(&state.table, *ty, val))
                .collect::<Result<Vec<_>>>()?;
            match callback(&args) {
                Ok(out) => {
                    if let (Some(ty), Some(slot)) = (signature.result, results.first_mut()) {
                        *slot = lower(&mut state.table, handle, ty, &out)?;
                    }
                    Ok(())
                }
                Err(thrown) => {
                    state.exceptions.store(thrown);
                    Err(anyhow::anyhow!("closure {} threw", handle))
                }
            }
        }
        ClosureTarget::Module { data, vtable } => {
            let func = module_invoke(state, id)?;
            let mut full = Vec::with_capacity(params.len() + 2);
            full.push(Val::I32(data as i32));
            full.push(Val::I32(vtable as i32));
            full.extend_from_slice(params);
            func.call(caller, &full, results)
        }
    }
}

/// Host-side invocation of any closure.
pub(crate) fn invoke_from_host(
    mut store: impl AsContextMut<Data = HostState>,
    handle: u32,
    args: &[HostValue],
) -> Result<HostValue> {
    let mut ctx = store.as_context_mut();
    let state = ctx.data_mut();
    let record = ClosureBridge::resolve(&state.table, handle)?;
    let (id, signature) = (record.trampoline(), record.signature().clone());
    signature.check_args(handle, args)?;
    let target = ClosureBridge::enter(&mut state.table, handle, None, args.len())?;
    let export = format!("closure {}", handle);

    match target {
        ClosureTarget::Host(callback) => {
            callback(args).map_err(|value| BridgeError::Thrown { export, value })
        }
        ClosureTarget::Module { data, vtable } => {
            let func = module_invoke(state, id)?;
            let mut params = Vec::with_capacity(args.len() + 2);
            params.push(Val::I32(data as i32));
            params.push(Val::I32(vtable as i32));
            for (ty, arg) in signature.params.iter().zip(args) {
                params.push(lower(&mut state.table, handle, *ty, arg)?);
            }
            let mut results: Vec<Val> = signature.result.map(zero).into_iter().collect();
            let outcome = func.call(&mut ctx, &params, &mut results);
            settle(&mut ctx, &export, outcome)?;
            match (signature.result, results.first()) {
                (Some(ty), Some(val)) => lift_result(&mut ctx.data_mut().table, ty, val),
                _ => Ok(HostValue::Undefined),
            }
        }
    }
}

/// Host-side destroy of any closure.
pub(crate) fn destroy_from_host(
    mut store: impl AsContextMut<Data = HostState>,
    handle: u32,
) -> Result<()> {
    let mut ctx = store.as_context_mut();
    if let Some((func, args)) = retire_closure(ctx.data_mut(), handle, None)? {
        let outcome = func.call(&mut ctx, &args, &mut []);
        settle(&mut ctx, &format!("closure {} destroy", handle), outcome)?;
    }
    Ok(())
}

/// Retire a closure's slot. For module closures whose trampoline has a
/// destroy export, returns the export and its `(data, vtable)` arguments so
/// the caller can run it once the state borrow ends.
fn retire_closure(
    state: &mut HostState,
    handle: u32,
    via: Option<TrampolineId>,
) -> Result<Option<(Func, [Val; 2])>> {
    if let Some(via) = via {
        let record = ClosureBridge::resolve(&state.table, handle)?;
        if record.trampoline() != via {
            return Err(BridgeError::SignatureMismatch {
                handle,
                expected: format!("trampoline {}", record.trampoline()),
                actual: format!("trampoline {}", via),
            });
        }
    }
    let record = ClosureBridge::destroy_handle(&mut state.table, handle)?;
    let ClosureTarget::Module { data, vtable } = *record.target() else {
        return Ok(None);
    };
    let destroy = state
        .trampolines
        .get(&record.trampoline())
        .and_then(|t| t.destroy);
    Ok(destroy.map(|func| (func, [Val::I32(data as i32), Val::I32(vtable as i32)])))
}

fn module_invoke(state: &HostState, id: TrampolineId) -> Result<Func> {
    state
        .trampolines
        .get(&id)
        .and_then(|t| t.invoke)
        .ok_or_else(|| BridgeError::MissingExport {
            export: format!("invoke export for trampoline {}", id),
            cause: "module closures on this trampoline have no invoke export".to_string(),
        })
}

/// Resolve the outcome of a call into the module.
///
/// The pending-exception slot is always drained: a stored value wins over
/// whatever the engine reported, then a bridge error raised by a host
/// import, then an unknown trap.
pub(crate) fn settle<R>(
    mut store: impl AsContextMut<Data = HostState>,
    export: &str,
    outcome: anyhow::Result<R>,
) -> Result<R> {
    let mut ctx = store.as_context_mut();
    let exceptions = &mut ctx.data_mut().exceptions;
    match outcome {
        Ok(value) => {
            exceptions.check(export)?;
            Ok(value)
        }
        Err(e) => {
            if exceptions.is_pending() {
                return Err(exceptions.error_for(export, ""));
            }
            match e.downcast::<BridgeError>() {
                Ok(err) => Err(err),
                Err(e) => {
                    let cause = e.root_cause().to_string();
                    tracing::debug!(export, %cause, "call trapped");
                    Err(exceptions.error_for(export, cause))
                }
            }
        }
    }
}

fn memory_of(caller: &mut Caller<'_, HostState>) -> anyhow::Result<Memory> {
    match caller.get_export("memory") {
        Some(wasmtime::Extern::Memory(m)) => Ok(m),
        _ => Err(BridgeError::MissingExport {
            export: "memory".to_string(),
            cause: "module does not export its memory".to_string(),
        }
        .into()),
    }
}

fn undeclared(id: TrampolineId) -> BridgeError {
    BridgeError::MissingExport {
        export: format!("__wbg_invoke_{}", id),
        cause: "trampoline not declared".to_string(),
    }
}

fn link_error(function: &str) -> impl FnOnce(anyhow::Error) -> BridgeError + '_ {
    move |e| BridgeError::Link {
        module: "host".to_string(),
        cause: format!("failed to define '{}': {}", function, e),
    }
}
