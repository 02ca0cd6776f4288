//! Instantiation protocol.
//!
//! Every instantiation walks
//!
//! ```text
//! Unresolved -> Fetching -> Compiling -> Linking -> Initializing -> Ready
//! ```
//!
//! skipping the phases its input makes unnecessary, or ends in `Failed`.
//! A [`ModuleHandle`] only escapes from `Ready`, so no export is reachable
//! before the start routine has run exactly once. There is no retry and no
//! cancellation: once a run starts it ends in `Ready` or `Failed`.

use crate::config::RuntimeConfig;
use crate::convert::accepts;
use crate::engine::{CompiledModule, WasmRuntime};
use crate::fetch::{fetch, Locator};
use crate::host::{create_linker, settle, HostState, ModuleTrampoline};
use crate::instance::ModuleHandle;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tether_core::{AbiType, BridgeError, Result, Signature};
use tracing::Instrument;
use wasmtime::{ExternType, Module, Store, ValType};

/// Name used for modules given as raw bytes.
const BYTES_MODULE_NAME: &str = "<bytes>";

/// A boxed, sendable future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Instantiation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Input received, nothing done yet.
    Unresolved,
    /// Waiting for bytes.
    Fetching,
    /// Compiling bytes into a module.
    Compiling,
    /// Registering host imports and checking them against the module.
    Linking,
    /// Running start routines.
    Initializing,
    /// The handle was returned.
    Ready,
    /// Aborted; no handle was returned.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unresolved => "unresolved",
            Self::Fetching => "fetching",
            Self::Compiling => "compiling",
            Self::Linking => "linking",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        })
    }
}

/// Record of the phases one instantiation went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseLog {
    history: Vec<Phase>,
}

impl Default for PhaseLog {
    fn default() -> Self {
        Self {
            history: vec![Phase::Unresolved],
        }
    }
}

impl PhaseLog {
    /// Create a log in `Unresolved`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest phase.
    pub fn current(&self) -> Phase {
        self.history.last().copied().unwrap_or(Phase::Unresolved)
    }

    /// All phases in the order they were entered.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    /// Check if a phase was entered.
    pub fn visited(&self, phase: Phase) -> bool {
        self.history.contains(&phase)
    }

    fn enter(&mut self, phase: Phase, module: &str) {
        if self.current() != phase {
            tracing::info!(module, %phase, "instantiation phase");
            self.history.push(phase);
        }
    }

    fn fail(&mut self, module: &str, err: &BridgeError) {
        tracing::warn!(module, from = %self.current(), code = err.code(), error = %err, "instantiation failed");
        self.history.push(Phase::Failed);
    }
}

/// Input for the synchronous path: bytes or an already compiled module.
#[derive(Debug, Clone)]
pub enum SyncInitInput {
    /// Raw module bytes.
    Bytes(Vec<u8>),
    /// A precompiled module.
    Module(Arc<CompiledModule>),
}

impl From<Vec<u8>> for SyncInitInput {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Arc<CompiledModule>> for SyncInitInput {
    fn from(module: Arc<CompiledModule>) -> Self {
        Self::Module(module)
    }
}

/// Input for the asynchronous path.
pub enum InitInput {
    /// Raw module bytes.
    Bytes(Vec<u8>),
    /// A precompiled module.
    Module(Arc<CompiledModule>),
    /// A file path or URL to fetch.
    Locator(Locator),
    /// A future yielding any other input.
    Pending(BoxFuture<Result<InitInput>>),
}

impl InitInput {
    /// Parse a locator string.
    pub fn locator(s: &str) -> Self {
        Self::Locator(Locator::parse(s))
    }

    fn label(&self) -> String {
        match self {
            Self::Locator(locator) => locator.name(),
            Self::Module(compiled) => compiled.name().to_string(),
            Self::Bytes(_) | Self::Pending(_) => BYTES_MODULE_NAME.to_string(),
        }
    }

    /// Wrap a future producing the input.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<InitInput>> + Send + 'static,
    {
        Self::Pending(Box::pin(future))
    }
}

impl fmt::Debug for InitInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Module(m) => f.debug_tuple("Module").field(m).finish(),
            Self::Locator(l) => f.debug_tuple("Locator").field(l).finish(),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

impl From<SyncInitInput> for InitInput {
    fn from(input: SyncInitInput) -> Self {
        match input {
            SyncInitInput::Bytes(b) => Self::Bytes(b),
            SyncInitInput::Module(m) => Self::Module(m),
        }
    }
}

impl From<Vec<u8>> for InitInput {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Arc<CompiledModule>> for InitInput {
    fn from(module: Arc<CompiledModule>) -> Self {
        Self::Module(module)
    }
}

impl From<Locator> for InitInput {
    fn from(locator: Locator) -> Self {
        Self::Locator(locator)
    }
}

/// Drives inputs through the phases to a [`ModuleHandle`].
#[derive(Clone)]
pub struct Instantiator {
    runtime: Arc<WasmRuntime>,
}

impl Instantiator {
    /// Create an instantiator over a shared runtime.
    pub fn new(runtime: Arc<WasmRuntime>) -> Self {
        Self { runtime }
    }

    /// Create an instantiator with its own runtime.
    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(WasmRuntime::new(config)?)))
    }

    /// The runtime used for compilation.
    pub fn runtime(&self) -> &Arc<WasmRuntime> {
        &self.runtime
    }

    /// Instantiate from bytes or a compiled module.
    pub fn instantiate_sync(&self, input: impl Into<SyncInitInput>) -> Result<ModuleHandle> {
        self.instantiate_sync_with_log(input, &mut PhaseLog::new())
    }

    /// Like [`instantiate_sync`](Self::instantiate_sync), recording phases
    /// into `log`.
    pub fn instantiate_sync_with_log(
        &self,
        input: impl Into<SyncInitInput>,
        log: &mut PhaseLog,
    ) -> Result<ModuleHandle> {
        let input = input.into();
        let label = match &input {
            SyncInitInput::Bytes(_) => BYTES_MODULE_NAME.to_string(),
            SyncInitInput::Module(compiled) => compiled.name().to_string(),
        };
        let _span = crate::instrument_instantiation!(label).entered();
        let outcome = match input {
            SyncInitInput::Bytes(bytes) => {
                log.enter(Phase::Compiling, BYTES_MODULE_NAME);
                self.runtime
                    .compile(BYTES_MODULE_NAME, &bytes)
                    .and_then(|compiled| self.link_and_start(&compiled, log))
            }
            SyncInitInput::Module(compiled) => self.link_and_start(&compiled, log),
        };
        if let Err(e) = &outcome {
            log.fail(&label, e);
        }
        outcome
    }

    /// Resolve, compile and instantiate any input.
    pub async fn instantiate(&self, input: impl Into<InitInput>) -> Result<ModuleHandle> {
        self.instantiate_with_log(input, &mut PhaseLog::new()).await
    }

    /// Like [`instantiate`](Self::instantiate), recording phases into `log`.
    pub async fn instantiate_with_log(
        &self,
        input: impl Into<InitInput>,
        log: &mut PhaseLog,
    ) -> Result<ModuleHandle> {
        let input = input.into();
        let label = input.label();
        let outcome = self
            .run(input, log)
            .instrument(crate::instrument_instantiation!(label))
            .await;
        if let Err(e) = &outcome {
            log.fail(&label, e);
        }
        outcome
    }

    async fn run(&self, mut input: InitInput, log: &mut PhaseLog) -> Result<ModuleHandle> {
        let (name, bytes) = loop {
            match input {
                InitInput::Pending(future) => {
                    log.enter(Phase::Fetching, BYTES_MODULE_NAME);
                    input = future.await?;
                }
                InitInput::Locator(locator) => {
                    let name = locator.name();
                    log.enter(Phase::Fetching, &name);
                    let bytes = fetch(&locator, self.runtime.config().fetch_timeout()).await?;
                    break (name, bytes);
                }
                InitInput::Bytes(bytes) => break (BYTES_MODULE_NAME.to_string(), bytes),
                InitInput::Module(compiled) => return self.link_and_start(&compiled, log),
            }
        };

        log.enter(Phase::Compiling, &name);
        let runtime = Arc::clone(&self.runtime);
        let module_name = name.clone();
        let compiled = tokio::task::spawn_blocking(move || runtime.compile(&module_name, &bytes))
            .await
            .map_err(|e| BridgeError::Compile {
                module: name,
                cause: format!("compilation task failed: {}", e),
            })??;

        self.link_and_start(&compiled, log)
    }

    fn link_and_start(&self, compiled: &CompiledModule, log: &mut PhaseLog) -> Result<ModuleHandle> {
        let config = self.runtime.config();
        let name = compiled.name();
        let module = compiled.module();

        // Linking
        log.enter(Phase::Linking, name);
        let link = |cause: String| BridgeError::Link {
            module: name.to_string(),
            cause,
        };
        if !matches!(module.get_export("memory"), Some(ExternType::Memory(_))) {
            return Err(link("module does not export 'memory'".to_string()));
        }
        check_trampoline_exports(module, config).map_err(link)?;
        let linker = create_linker(self.runtime.engine(), config)?;
        let pre = linker
            .instantiate_pre(module)
            .map_err(|e| link(format!("{:#}", e)))?;

        // Initializing
        log.enter(Phase::Initializing, name);
        let init = |cause: String| BridgeError::Init {
            module: name.to_string(),
            cause,
        };
        let mut store = Store::new(self.runtime.engine(), HostState::new(config));
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = config.fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| init(format!("failed to set fuel: {}", e)))?;
        }
        if let Some(ticks) = config.epoch_deadline {
            store.set_epoch_deadline(ticks);
        }

        let outcome = pre.instantiate(&mut store);
        let instance =
            settle(&mut store, "start section", outcome).map_err(|e| init(e.to_string()))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| init("memory export disappeared".to_string()))?;

        let heap_base = config.bridge.memory.heap_base.or_else(|| {
            let global = instance.get_global(&mut store, "__heap_base")?;
            global.get(&mut store).i32().map(|b| b as u32)
        });
        if let Some(base) = heap_base {
            store.data_mut().heap.initialize(base);
        }

        for t in &config.trampolines {
            let invoke = t
                .invoke_export
                .as_deref()
                .and_then(|export| instance.get_func(&mut store, export));
            let destroy = t
                .destroy_export
                .as_deref()
                .and_then(|export| instance.get_func(&mut store, export));
            if invoke.is_some() || destroy.is_some() {
                store
                    .data_mut()
                    .trampolines
                    .insert(t.id, ModuleTrampoline { invoke, destroy });
            }
        }

        if let Some(start) = instance.get_func(&mut store, &config.start_export) {
            let start = start
                .typed::<(), ()>(&store)
                .map_err(|e| init(format!("'{}' has the wrong type: {}", config.start_export, e)))?;
            let outcome = start.call(&mut store, ());
            settle(&mut store, &config.start_export, outcome).map_err(|e| init(e.to_string()))?;
            tracing::debug!(module = name, export = %config.start_export, "start routine finished");
        }

        log.enter(Phase::Ready, name);
        Ok(ModuleHandle::new(
            name.to_string(),
            store,
            instance,
            memory,
            config.main_export.clone(),
        ))
    }
}

/// Check that trampoline exports exist with `(data, vtable, params...)`
/// parameter lists and matching results.
fn check_trampoline_exports(module: &Module, config: &RuntimeConfig) -> std::result::Result<(), String> {
    for t in &config.trampolines {
        if let Some(export) = &t.invoke_export {
            let mut params = vec![AbiType::I32, AbiType::I32];
            params.extend_from_slice(&t.signature.params);
            check_func_export(module, export, &Signature::new(params, t.signature.result))?;
        }
        if let Some(export) = &t.destroy_export {
            check_func_export(
                module,
                export,
                &Signature::new([AbiType::I32, AbiType::I32], None),
            )?;
        }
    }
    Ok(())
}

fn check_func_export(
    module: &Module,
    export: &str,
    expected: &Signature,
) -> std::result::Result<(), String> {
    let ty = match module.get_export(export) {
        Some(ExternType::Func(ty)) => ty,
        Some(_) => return Err(format!("trampoline export '{}' is not a function", export)),
        None => return Err(format!("trampoline export '{}' is missing", export)),
    };
    let params: Vec<ValType> = ty.params().collect();
    let results: Vec<ValType> = ty.results().collect();
    let params_match = params.len() == expected.params.len()
        && expected.params.iter().zip(&params).all(|(a, v)| accepts(*a, v));
    let results_match = match expected.result {
        None => results.is_empty(),
        Some(r) => results.len() == 1 && accepts(r, &results[0]),
    };
    if params_match && results_match {
        Ok(())
    } else {
        Err(format!(
            "trampoline export '{}' should be {} but is {:?} -> {:?}",
            export, expected, params, results
        ))
    }
}
