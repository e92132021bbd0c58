use std::time::{Duration, Instant};

use wasmgate_core::{
    EngineSettings, HostServices, Invocation, InvocationContext, RequestEnvelope, SandboxEngine,
    SandboxError, MAX_OUTPUT_BYTES,
};

fn engine_for(wat: &str, settings: EngineSettings) -> SandboxEngine {
    let wasm = wat::parse_str(wat).expect("wat compile");
    SandboxEngine::new(&wasm, settings, HostServices::detached()).expect("engine")
}

fn http_invocation(stdin: &str, deadline: Duration) -> Invocation {
    Invocation {
        stdin: stdin.as_bytes().to_vec(),
        argv: Vec::new(),
        env: std::collections::BTreeMap::new(),
        mounts: Vec::new(),
        deadline,
        context: InvocationContext::Http {
            request: RequestEnvelope::default(),
        },
    }
}

const HELLO_WAT: &str = r#"(module
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "{\"status\":200,\"headers\":{},\"body\":\"ok\"}")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 39))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))"#;

const ECHO_WAT: &str = r#"(module
  (import "wasi_snapshot_preview1" "fd_read" (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 64))
    (i32.store (i32.const 4) (i32.const 1024))
    (drop (call $fd_read (i32.const 0) (i32.const 0) (i32.const 1) (i32.const 8)))
    (i32.store (i32.const 4) (i32.load (i32.const 8)))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 12)))))"#;

const SPIN_WAT: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "_start")
    (loop $forever (br $forever))))"#;

const CRASH_WAT: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "_start") unreachable))"#;

// Writes 96 x 64 KiB = 6 MiB to stdout, one page per fd_write.
const FLOOD_WAT: &str = r#"(module
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 2)
  (func (export "_start")
    (local $i i32)
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 65536))
    (loop $again
      (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))
      (local.set $i (i32.add (local.get $i) (i32.const 1)))
      (br_if $again (i32.lt_u (local.get $i) (i32.const 96))))))"#;

const STDERR_WAT: &str = r#"(module
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "boom: bad input")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 15))
    (drop (call $fd_write (i32.const 2) (i32.const 0) (i32.const 1) (i32.const 8)))
    unreachable))"#;

#[test]
fn stdout_is_captured() {
    let engine = engine_for(HELLO_WAT, EngineSettings::default());
    let out = engine
        .run(http_invocation("{}", Duration::from_secs(5)))
        .expect("run");
    assert_eq!(
        String::from_utf8_lossy(&out.stdout),
        r#"{"status":200,"headers":{},"body":"ok"}"#
    );
    assert!(out.stderr.is_empty());
}

#[test]
fn stdin_payload_reaches_the_guest() {
    let engine = engine_for(ECHO_WAT, EngineSettings::default());
    let payload = r#"{"method":"POST","uri":"/x","headers":{},"body":"hi"}"#;
    let out = engine
        .run(http_invocation(payload, Duration::from_secs(5)))
        .expect("run");
    assert_eq!(String::from_utf8_lossy(&out.stdout), payload);
}

#[test]
fn spinning_guest_hits_the_deadline() {
    let engine = engine_for(SPIN_WAT, EngineSettings::default());
    let started = Instant::now();
    let failure = engine
        .run(http_invocation("{}", Duration::from_millis(150)))
        .expect_err("must time out");
    assert_eq!(failure.error, SandboxError::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn fuel_limit_stops_a_spinning_guest() {
    let engine = engine_for(
        SPIN_WAT,
        EngineSettings {
            fuel_limit: Some(50_000),
            ..EngineSettings::default()
        },
    );
    let failure = engine
        .run(http_invocation("{}", Duration::from_secs(30)))
        .expect_err("must run out of fuel");
    assert_eq!(failure.error, SandboxError::FuelExhausted);
}

#[test]
fn trapping_guest_reports_a_trap() {
    let engine = engine_for(CRASH_WAT, EngineSettings::default());
    let failure = engine
        .run(http_invocation("{}", Duration::from_secs(5)))
        .expect_err("must trap");
    assert!(matches!(failure.error, SandboxError::Trap(_)));
}

#[test]
fn stderr_survives_a_crash() {
    let engine = engine_for(STDERR_WAT, EngineSettings::default());
    let failure = engine
        .run(http_invocation("{}", Duration::from_secs(5)))
        .expect_err("must trap");
    assert_eq!(String::from_utf8_lossy(&failure.output.stderr), "boom: bad input");
    assert!(failure.to_string().contains("boom: bad input"));
}

#[test]
fn output_flood_is_cancelled_at_the_quota() {
    let engine = engine_for(FLOOD_WAT, EngineSettings::default());
    let failure = engine
        .run(http_invocation("{}", Duration::from_secs(30)))
        .expect_err("must blow the quota");
    assert_eq!(failure.error, SandboxError::OutputQuota);
    assert!(failure.output.stdout.len() <= MAX_OUTPUT_BYTES);
    assert_eq!(failure.output.stdout.len(), MAX_OUTPUT_BYTES);
}

#[test]
fn memory_cap_rejects_oversized_growth() {
    // Guest asks for 4 pages up front; the cap allows one.
    let wat = r#"(module
      (memory (export "memory") 4)
      (func (export "_start")))"#;
    let engine = engine_for(
        wat,
        EngineSettings {
            memory_limit_bytes: Some(65_536),
            ..EngineSettings::default()
        },
    );
    let failure = engine
        .run(http_invocation("{}", Duration::from_secs(5)))
        .expect_err("must refuse the memory");
    assert!(matches!(failure.error, SandboxError::Trap(_)));
}

#[test]
fn env_vars_are_visible_to_the_guest() {
    // environ_sizes_get reports one variable of the expected byte length.
    let wat = r#"(module
      (import "wasi_snapshot_preview1" "environ_sizes_get" (func $sizes (param i32 i32) (result i32)))
      (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
      (memory (export "memory") 1)
      (func (export "_start")
        (drop (call $sizes (i32.const 0) (i32.const 4)))
        (i32.store (i32.const 16) (i32.const 0))
        (i32.store (i32.const 20) (i32.const 8))
        (drop (call $fd_write (i32.const 1) (i32.const 16) (i32.const 1) (i32.const 24)))))"#;
    let engine = engine_for(wat, EngineSettings::default());
    let mut invocation = http_invocation("{}", Duration::from_secs(5));
    invocation.env.insert("MODE".to_string(), "fast".to_string());
    let out = engine.run(invocation).expect("run");
    // environ count || byte size, little-endian: 1 and "MODE=fast\0".len()
    assert_eq!(out.stdout.len(), 8);
    assert_eq!(u32::from_le_bytes(out.stdout[0..4].try_into().unwrap()), 1);
    assert_eq!(u32::from_le_bytes(out.stdout[4..8].try_into().unwrap()), 10);
}

#[test]
fn empty_module_bytes_are_rejected() {
    let err = SandboxEngine::new(&[], EngineSettings::default(), HostServices::detached())
        .err()
        .expect("must fail");
    assert!(matches!(err, SandboxError::InvalidModule(_)));
}
