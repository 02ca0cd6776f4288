//! Integration tests for the instantiation protocol.

mod common;

use common::{bridge_config, wasm, ADDER, BRIDGE_WAT, MINIMAL_WAT};
use std::io::Write;
use std::sync::Arc;
use tether_core::{AbiType, BridgeError, Signature};
use tether_runtime::prelude::*;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn instantiator() -> Instantiator {
    Instantiator::with_config(RuntimeConfig::default().with_cache(false))
        .expect("Failed to create instantiator")
}

fn sync_error(config: RuntimeConfig, wat: &str) -> (BridgeError, PhaseLog) {
    let instantiator = Instantiator::with_config(config).expect("Failed to create instantiator");
    let mut log = PhaseLog::new();
    let err = instantiator
        .instantiate_sync_with_log(wasm(wat), &mut log)
        .unwrap_err();
    (err, log)
}

// =============================================================================
// Successful paths
// =============================================================================

#[test]
fn sync_from_bytes_walks_every_phase() {
    let mut log = PhaseLog::new();
    let mut module = instantiator()
        .instantiate_sync_with_log(wasm(MINIMAL_WAT), &mut log)
        .unwrap();
    assert_eq!(
        log.history(),
        &[
            Phase::Unresolved,
            Phase::Compiling,
            Phase::Linking,
            Phase::Initializing,
            Phase::Ready
        ]
    );
    assert_eq!(module.main(0, 0).unwrap(), 0);
    assert_eq!(module.main(2, 3).unwrap(), 5);
}

#[test]
fn precompiled_module_skips_compiling() {
    let instantiator = instantiator();
    let compiled = instantiator
        .runtime()
        .compile("minimal", &wasm(MINIMAL_WAT))
        .unwrap();

    let mut log = PhaseLog::new();
    let first = instantiator
        .instantiate_sync_with_log(compiled.clone(), &mut log)
        .unwrap();
    assert!(!log.visited(Phase::Compiling));
    assert_eq!(first.name(), "minimal");

    // Each instantiation gets its own store.
    let mut a = instantiator.instantiate_sync(compiled.clone()).unwrap();
    let mut b = instantiator.instantiate_sync(compiled).unwrap();
    a.insert_value("only in a").unwrap();
    assert_eq!(a.live_handles(), 1);
    assert_eq!(b.live_handles(), 0);
    assert_eq!(b.main(1, 1).unwrap(), 2);
}

#[tokio::test]
async fn async_from_bytes() {
    let mut module = instantiator()
        .instantiate(wasm(MINIMAL_WAT))
        .await
        .unwrap();
    assert_eq!(module.main(0, 0).unwrap(), 0);
}

#[tokio::test]
async fn async_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&wasm(MINIMAL_WAT)).unwrap();

    let mut log = PhaseLog::new();
    let mut module = instantiator()
        .instantiate_with_log(Locator::from(file.path()), &mut log)
        .await
        .unwrap();
    assert!(log.visited(Phase::Fetching));
    assert_eq!(log.current(), Phase::Ready);
    assert_eq!(module.name(), file.path().display().to_string());
    assert_eq!(module.main(4, 0).unwrap(), 4);
}

#[tokio::test]
async fn async_from_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pkg/app.wasm"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(wasm(MINIMAL_WAT)))
        .mount(&server)
        .await;

    let url = format!("{}/pkg/app.wasm", server.uri());
    let mut module = instantiator()
        .instantiate(InitInput::locator(&url))
        .await
        .unwrap();
    assert_eq!(module.main(1, 2).unwrap(), 3);
}

#[tokio::test]
async fn async_from_pending_input() {
    let bytes = wasm(MINIMAL_WAT);
    let input = InitInput::pending(async move { Ok(InitInput::Bytes(bytes)) });

    let mut log = PhaseLog::new();
    let mut module = instantiator()
        .instantiate_with_log(input, &mut log)
        .await
        .unwrap();
    assert!(log.visited(Phase::Fetching));
    assert!(log.visited(Phase::Compiling));
    assert_eq!(module.main(0, 0).unwrap(), 0);
}

#[test]
fn start_routine_runs_once_before_ready() {
    let wat = r#"
        (module
            (import "wbg" "__wbindgen_malloc" (func $malloc (param i32 i32) (result i32)))
            (memory (export "memory") 1)
            (global (export "__heap_base") i32 (i32.const 2048))
            (global $starts (mut i32) (i32.const 0))
            (global $ptr (mut i32) (i32.const 0))
            (func (export "__wbindgen_start")
                (global.set $starts (i32.add (global.get $starts) (i32.const 1)))
                (global.set $ptr (call $malloc (i32.const 64) (i32.const 8))))
            (func (export "starts") (result i32) (global.get $starts))
            (func (export "ptr") (result i32) (global.get $ptr)))
    "#;
    let mut module = common::instantiate(RuntimeConfig::default(), wat);
    assert_eq!(module.call::<(), i32>("starts", ()).unwrap(), 1);
    assert_eq!(module.call::<(), i32>("ptr", ()).unwrap(), 2048);
    assert_eq!(module.heap().allocated_bytes(), 64);
}

#[test]
fn module_trampolines_are_checked_at_link_time() {
    let mut module = common::instantiate(bridge_config(), BRIDGE_WAT);
    assert!(module.has_export("adder_invoke"));
    assert_eq!(module.main(0, 0).unwrap(), 0);
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn garbage_bytes_fail_to_compile() {
    let mut log = PhaseLog::new();
    let err = instantiator()
        .instantiate_sync_with_log(b"definitely not wasm".to_vec(), &mut log)
        .unwrap_err();
    assert_eq!(err.code(), "E101");
    assert!(err.is_instantiation_error());
    assert_eq!(log.current(), Phase::Failed);
    assert!(!log.visited(Phase::Linking));
}

#[tokio::test]
async fn missing_file_fails_before_linking() {
    let mut log = PhaseLog::new();
    let err = instantiator()
        .instantiate_with_log(InitInput::locator("/no/such/module.wasm"), &mut log)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "E101");
    assert!(log.visited(Phase::Fetching));
    assert!(!log.visited(Phase::Linking));
    assert_eq!(log.current(), Phase::Failed);
}

#[tokio::test]
async fn http_error_status_fails_to_compile() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let url = format!("{}/missing.wasm", server.uri());
    let mut log = PhaseLog::new();
    let err = instantiator()
        .instantiate_with_log(InitInput::locator(&url), &mut log)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Compile { .. }));
    assert!(err.to_string().contains("404"));
    assert!(!log.visited(Phase::Linking));
}

#[tokio::test]
async fn failed_pending_input_is_passed_through() {
    let input = InitInput::pending(async {
        Err(BridgeError::Compile {
            module: "remote".to_string(),
            cause: "upstream closed".to_string(),
        })
    });
    let err = instantiator().instantiate(input).await.unwrap_err();
    assert_eq!(err.code(), "E101");
}

#[test]
fn unknown_import_fails_to_link() {
    let (err, log) = sync_error(
        RuntimeConfig::default(),
        r#"
            (module
                (import "wbg" "__wbindgen_teleport" (func (param i32)))
                (memory (export "memory") 1))
        "#,
    );
    assert_eq!(err.code(), "E201");
    assert!(log.visited(Phase::Linking));
    assert!(!log.visited(Phase::Initializing));
}

#[test]
fn wrong_import_namespace_fails_to_link() {
    let (err, _) = sync_error(
        RuntimeConfig::default().with_namespace("env"),
        r#"
            (module
                (import "wbg" "__wbindgen_malloc" (func (param i32 i32) (result i32)))
                (memory (export "memory") 1))
        "#,
    );
    assert_eq!(err.code(), "E201");
}

#[test]
fn missing_memory_export_fails_to_link() {
    let (err, _) = sync_error(
        RuntimeConfig::default(),
        r#"(module (func (export "main") (param i32 i32) (result i32) (i32.const 0)))"#,
    );
    assert!(matches!(err, BridgeError::Link { ref cause, .. } if cause.contains("memory")));
}

#[test]
fn mistyped_trampoline_export_fails_to_link() {
    let config = RuntimeConfig::default().with_trampoline(
        Trampoline::new(ADDER, Signature::new([AbiType::F64], Some(AbiType::F64)))
            .with_exports("adder_invoke", "adder_destroy"),
    );
    let (err, _) = sync_error(
        config,
        r#"
            (module
                (memory (export "memory") 1)
                (func (export "adder_invoke") (param i32))
                (func (export "adder_destroy") (param i32 i32)))
        "#,
    );
    assert!(matches!(err, BridgeError::Link { ref cause, .. } if cause.contains("adder_invoke")));
}

#[test]
fn trapping_start_fails_to_initialize() {
    let (err, log) = sync_error(
        RuntimeConfig::default(),
        r#"
            (module
                (memory (export "memory") 1)
                (func (export "__wbindgen_start") unreachable))
        "#,
    );
    assert_eq!(err.code(), "E301");
    assert!(log.visited(Phase::Initializing));
    assert!(!log.visited(Phase::Ready));
}

#[test]
fn throwing_start_reports_message() {
    let (err, _) = sync_error(
        RuntimeConfig::default(),
        r#"
            (module
                (import "wbg" "__wbindgen_throw" (func $throw (param i32 i32)))
                (memory (export "memory") 1)
                (data (i32.const 8) "no config")
                (func (export "__wbindgen_start")
                    (call $throw (i32.const 8) (i32.const 9))))
        "#,
    );
    assert!(matches!(err, BridgeError::Init { ref cause, .. } if cause.contains("no config")));
}

#[test]
fn fuel_exhaustion_traps() {
    let mut module = common::instantiate(
        RuntimeConfig::default().with_fuel(10_000),
        r#"
            (module
                (memory (export "memory") 1)
                (func (export "spin") (loop $l (br $l))))
        "#,
    );
    let err = module.call::<(), ()>("spin", ()).unwrap_err();
    assert_eq!(err.code(), "E702");
}

// =============================================================================
// Sharing
// =============================================================================

#[test]
fn shared_module_serializes_calls() {
    let shared = instantiator()
        .instantiate_sync(wasm(MINIMAL_WAT))
        .unwrap()
        .into_shared();

    let threads: Vec<_> = (0..4)
        .map(|i| {
            let shared = shared.clone();
            std::thread::spawn(move || {
                shared.with(|module| {
                    let h = module.insert_value(i as f64).unwrap();
                    let out = module.main(i, 1).unwrap();
                    module.release_value(h).unwrap();
                    out
                })
            })
        })
        .collect();

    let mut results: Vec<i32> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    results.sort_unstable();
    assert_eq!(results, vec![1, 2, 3, 4]);
    assert_eq!(shared.lock().live_handles(), 0);
}

#[test]
fn runtime_can_be_shared_between_instantiators() {
    let runtime = Arc::new(WasmRuntime::new(RuntimeConfig::default()).unwrap());
    let a = Instantiator::new(runtime.clone());
    let b = Instantiator::new(runtime.clone());
    a.instantiate_sync(wasm(MINIMAL_WAT)).unwrap();
    b.instantiate_sync(wasm(MINIMAL_WAT)).unwrap();
    assert_eq!(runtime.cache_size(), 1);
}
