//! Common test utilities for integration tests.

#![allow(dead_code)]

use tether_core::{AbiType, Signature};
use tether_runtime::prelude::*;

/// Trampoline used by module-owned adder closures: `(f64) -> f64`.
pub const ADDER: u32 = 7;

/// Smallest module the protocol accepts: a memory and an entry point that
/// returns `argc + argv`.
pub const MINIMAL_WAT: &str = r#"
    (module
        (memory (export "memory") 1)
        (func (export "main") (param i32 i32) (result i32)
            (i32.add (local.get 0) (local.get 1))))
"#;

/// A module exercising every part of the bridge.
pub const BRIDGE_WAT: &str = r#"
    (module
        (import "wbg" "__wbindgen_malloc" (func $malloc (param i32 i32) (result i32)))
        (import "wbg" "__wbindgen_string_new" (func $string_new (param i32 i32) (result i32)))
        (import "wbg" "__wbindgen_object_drop_ref" (func $drop_ref (param i32)))
        (import "wbg" "__wbindgen_throw" (func $throw (param i32 i32)))
        (import "wbg" "__wbindgen_exn_store" (func $exn_store (param i32)))
        (import "wbg" "__wbindgen_closure_wrap" (func $closure_wrap (param i32 i32 i32) (result i32)))
        (import "wbg" "__wbindgen_cb_drop" (func $cb_drop (param i32) (result i32)))
        (import "wbg" "__wbg_invoke_0" (func $invoke_ref (param i32 i32)))
        (import "wbg" "__wbg_invoke_2" (func $invoke_pair (param i32 i32 i32)))
        (import "wbg" "__wbg_invoke_7" (func $invoke_f64 (param i32 f64) (result f64)))

        (memory (export "memory") 1)
        (global (export "__heap_base") i32 (i32.const 1024))
        (global $destroyed (mut i32) (i32.const -1))
        (data (i32.const 16) "boom")
        (data (i32.const 32) "hello")

        (func (export "main") (param i32 i32) (result i32)
            (local.get 0))

        (func (export "throws")
            (call $throw (i32.const 16) (i32.const 4)))

        (func (export "traps")
            unreachable)

        (func (export "stores_then_returns")
            (call $exn_store (call $string_new (i32.const 32) (i32.const 5))))

        (func (export "greet") (param $cb i32)
            (local $s i32)
            (local.set $s (call $string_new (i32.const 32) (i32.const 5)))
            (call $invoke_ref (local.get $cb) (local.get $s))
            (call $drop_ref (local.get $s)))

        (func (export "pair") (param $cb i32) (param $a i32) (param $b i32)
            (call $invoke_pair (local.get $cb) (local.get $a) (local.get $b)))

        (func (export "apply") (param $cb i32) (param $x f64) (result f64)
            (call $invoke_f64 (local.get $cb) (local.get $x)))

        (func (export "make_adder") (param $n i32) (result i32)
            (call $closure_wrap (local.get $n) (i32.const 0) (i32.const 7)))

        (func (export "drop_closure") (param $h i32) (result i32)
            (call $cb_drop (local.get $h)))

        (func (export "adder_invoke") (param $data i32) (param $vtable i32) (param $x f64) (result f64)
            (f64.add (local.get $x) (f64.convert_i32_u (local.get $data))))

        (func (export "adder_destroy") (param $data i32) (param $vtable i32)
            (global.set $destroyed (local.get $data)))

        (func (export "destroyed") (result i32)
            (global.get $destroyed))

        (func (export "alloc") (param $size i32) (result i32)
            (call $malloc (local.get $size) (i32.const 8))))
"#;

/// Parse WAT text into module bytes.
pub fn wasm(wat: &str) -> Vec<u8> {
    wat::parse_str(wat).expect("Failed to parse WAT")
}

/// Default configuration plus the adder trampoline.
pub fn bridge_config() -> RuntimeConfig {
    RuntimeConfig::default().with_cache(false).with_trampoline(
        Trampoline::new(ADDER, Signature::new([AbiType::F64], Some(AbiType::F64)))
            .with_exports("adder_invoke", "adder_destroy"),
    )
}

/// Instantiate `wat` synchronously.
pub fn instantiate(config: RuntimeConfig, wat: &str) -> ModuleHandle {
    Instantiator::with_config(config)
        .expect("Failed to create instantiator")
        .instantiate_sync(wasm(wat))
        .expect("Failed to instantiate")
}

/// Instantiate the bridge module.
pub fn bridge_module() -> ModuleHandle {
    instantiate(bridge_config(), BRIDGE_WAT)
}
