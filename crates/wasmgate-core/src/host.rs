// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The `wasmgate` host-function surface.
//!
//! Every call validates its guest pointer ranges before touching linear
//! memory and returns the documented failure value on malformed input; host
//! functions never trap the guest themselves.

use std::sync::Arc;

use wasmtime::{Caller, Extern, Linker, StoreLimits};
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::ai::AiClient;
use crate::bridge::{JobSink, ObjectStore, SqlBridge, UnconfiguredSink, UnconfiguredSql, UnconfiguredStore};
use crate::context::InvocationContext;
use crate::error::SandboxError;
use crate::kv::KvStore;

pub const HOST_MODULE: &str = "wasmgate";

/// `host_kv_get` miss sentinel.
pub const KV_NOT_FOUND: u64 = u64::MAX;

/// Host-side collaborators shared by every sandbox in the process.
pub struct HostServices {
    pub kv: KvStore,
    pub sql: Arc<dyn SqlBridge>,
    pub objects: Arc<dyn ObjectStore>,
    pub jobs: Arc<dyn JobSink>,
    pub ai: Option<AiClient>,
}

impl HostServices {
    /// Everything unconfigured; for tests and bare deployments.
    pub fn detached() -> Arc<Self> {
        Arc::new(Self {
            kv: KvStore::new(),
            sql: Arc::new(UnconfiguredSql),
            objects: Arc::new(UnconfiguredStore),
            jobs: Arc::new(UnconfiguredSink),
            ai: None,
        })
    }
}

pub(crate) struct HostState {
    pub(crate) services: Arc<HostServices>,
    pub(crate) context: InvocationContext,
}

pub(crate) struct StoreData {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limits: StoreLimits,
    pub(crate) host: HostState,
}

fn memory(caller: &mut Caller<'_, StoreData>) -> Option<wasmtime::Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(mem)) => Some(mem),
        _ => None,
    }
}

fn read_guest(caller: &mut Caller<'_, StoreData>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    if ptr < 0 || len < 0 {
        return None;
    }
    let (ptr, len) = (ptr as usize, len as usize);
    let end = ptr.checked_add(len)?;
    let mem = memory(caller)?;
    if end > mem.data_size(&mut *caller) {
        return None;
    }
    let mut buf = vec![0u8; len];
    mem.read(&mut *caller, ptr, &mut buf).ok()?;
    Some(buf)
}

/// Writes `data` truncated to `max` bytes; returns the written length.
fn write_guest(caller: &mut Caller<'_, StoreData>, ptr: i32, max: i32, data: &[u8]) -> Option<u32> {
    if ptr < 0 || max < 0 {
        return None;
    }
    let n = data.len().min(max as usize);
    let ptr = ptr as usize;
    let end = ptr.checked_add(n)?;
    let mem = memory(caller)?;
    if end > mem.data_size(&mut *caller) {
        return None;
    }
    mem.write(&mut *caller, ptr, &data[..n]).ok()?;
    Some(n as u32)
}

fn read_guest_str(caller: &mut Caller<'_, StoreData>, ptr: i32, len: i32) -> Option<String> {
    read_guest(caller, ptr, len).map(|b| String::from_utf8_lossy(&b).into_owned())
}

pub(crate) fn add_to_linker(linker: &mut Linker<StoreData>) -> Result<(), SandboxError> {
    let wrap = |err: anyhow::Error| SandboxError::Setup(err.to_string());

    linker
        .func_wrap(
            HOST_MODULE,
            "host_log",
            |mut caller: Caller<'_, StoreData>, level: i32, ptr: i32, len: i32| {
                let Some(msg) = read_guest_str(&mut caller, ptr, len) else {
                    return;
                };
                let origin = caller.data().host.context.kind();
                match level {
                    3 => tracing::error!(target: "wasmgate::guest", origin, "{msg}"),
                    1 => tracing::warn!(target: "wasmgate::guest", origin, "{msg}"),
                    _ => tracing::info!(target: "wasmgate::guest", origin, "{msg}"),
                }
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "host_db_query",
            |mut caller: Caller<'_, StoreData>, q_ptr: i32, q_len: i32, out_ptr: i32, out_max: i32| -> i32 {
                let Some(query) = read_guest_str(&mut caller, q_ptr, q_len) else {
                    return 0;
                };
                let sql = caller.data().host.services.sql.clone();
                let rows = match sql.query_json(&query) {
                    Ok(rows) => rows,
                    Err(err) => {
                        match serde_json::to_vec(&serde_json::json!([{ "error": err.to_string() }])) {
                            Ok(body) => body,
                            Err(_) => return 0,
                        }
                    }
                };
                write_guest(&mut caller, out_ptr, out_max, &rows).map_or(0, |n| n as i32)
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "host_kv_set",
            |mut caller: Caller<'_, StoreData>, k_ptr: i32, k_len: i32, v_ptr: i32, v_len: i32| {
                let Some(key) = read_guest_str(&mut caller, k_ptr, k_len) else {
                    return;
                };
                let Some(value) = read_guest(&mut caller, v_ptr, v_len) else {
                    return;
                };
                caller.data().host.services.kv.set(&key, value);
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "host_kv_get",
            |mut caller: Caller<'_, StoreData>, k_ptr: i32, k_len: i32, out_ptr: i32, out_max: i32| -> i64 {
                let Some(key) = read_guest_str(&mut caller, k_ptr, k_len) else {
                    return 0;
                };
                let Some(value) = caller.data().host.services.kv.get(&key) else {
                    return KV_NOT_FOUND as i64;
                };
                write_guest(&mut caller, out_ptr, out_max, &value).map_or(0, |n| n as i64)
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "host_s3_put",
            |mut caller: Caller<'_, StoreData>, k_ptr: i32, k_len: i32, b_ptr: i32, b_len: i32| -> i32 {
                let Some(key) = read_guest_str(&mut caller, k_ptr, k_len) else {
                    return 1;
                };
                let Some(body) = read_guest(&mut caller, b_ptr, b_len) else {
                    return 1;
                };
                let objects = caller.data().host.services.objects.clone();
                match objects.put(&key, &body) {
                    Ok(()) => 0,
                    Err(err) => {
                        tracing::error!(target: "wasmgate::host", error = %err, "s3 put failed");
                        1
                    }
                }
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "host_s3_get",
            |mut caller: Caller<'_, StoreData>, k_ptr: i32, k_len: i32, out_ptr: i32, out_max: i32| -> i32 {
                let Some(key) = read_guest_str(&mut caller, k_ptr, k_len) else {
                    return 0;
                };
                let objects = caller.data().host.services.objects.clone();
                let body = match objects.get(&key) {
                    Ok(body) => body,
                    Err(err) => {
                        tracing::error!(target: "wasmgate::host", error = %err, "s3 get failed");
                        return 0;
                    }
                };
                write_guest(&mut caller, out_ptr, out_max, &body).map_or(0, |n| n as i32)
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "host_enqueue",
            |mut caller: Caller<'_, StoreData>, f_ptr: i32, f_len: i32, p_ptr: i32, p_len: i32| -> i32 {
                let Some(module_path) = read_guest_str(&mut caller, f_ptr, f_len) else {
                    return 1;
                };
                let Some(payload) = read_guest_str(&mut caller, p_ptr, p_len) else {
                    return 1;
                };
                let jobs = caller.data().host.services.jobs.clone();
                match jobs.enqueue(&module_path, &payload) {
                    Ok(()) => {
                        tracing::info!(target: "wasmgate::host", module = %module_path, "job enqueued in background");
                        0
                    }
                    Err(err) => {
                        tracing::error!(target: "wasmgate::host", error = %err, "enqueue failed");
                        1
                    }
                }
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "host_ask_ai",
            |mut caller: Caller<'_, StoreData>, p_ptr: i32, p_len: i32, out_ptr: i32, out_max: i32| -> i64 {
                let Some(prompt) = read_guest_str(&mut caller, p_ptr, p_len) else {
                    return 0;
                };
                let answer = match caller.data().host.services.ai.as_ref() {
                    Some(client) => match client.ask(&prompt) {
                        Ok(answer) => answer,
                        Err(err) => {
                            tracing::error!(target: "wasmgate::host", error = %err, "ai host function failed");
                            match serde_json::to_string(&serde_json::json!({ "error": err.to_string() })) {
                                Ok(body) => body,
                                Err(_) => return 0,
                            }
                        }
                    },
                    None => r#"{"error":"ai collaborator not configured"}"#.to_string(),
                };
                write_guest(&mut caller, out_ptr, out_max, answer.as_bytes()).map_or(0, |n| n as i64)
            },
        )
        .map_err(wrap)?;

    Ok(())
}
