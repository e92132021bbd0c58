use wasmtime::Config;

pub const WASM_PAGE_BYTES: u64 = 65_536;

/// Builds the wasmtime configuration shared by all wasmgate sandboxes.
///
/// Epoch interruption is the cancellation mechanism: the deadline watchdog
/// and the output-quota pipe both bump the engine epoch, which traps the
/// guest at its next yield point.
pub fn sandbox_engine_config(consume_fuel: bool) -> Config {
    let mut cfg = Config::new();
    cfg.epoch_interruption(true);
    if consume_fuel {
        cfg.consume_fuel(true);
    }
    cfg.wasm_threads(false);
    cfg.wasm_relaxed_simd(false);
    cfg.wasm_memory64(false);
    cfg
}

/// Number of 64 KiB pages needed to hold `bytes`, rounding up.
pub fn page_cap(bytes: u64) -> u64 {
    bytes.div_ceil(WASM_PAGE_BYTES)
}

/// Rounds a human-configured memory limit up to a whole number of pages.
pub fn page_aligned_bytes(bytes: u64) -> u64 {
    page_cap(bytes) * WASM_PAGE_BYTES
}
