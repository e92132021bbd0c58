// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use wasmtime::{Engine, Linker, Module, Store, StoreLimitsBuilder};
use wasmtime_wasi::p2::pipe::MemoryInputPipe;
use wasmtime_wasi::p2::WasiCtxBuilder;
use wasmtime_wasi::preview1;
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit};

use crate::cancel::{CancelHandle, CancelReason};
use crate::context::InvocationContext;
use crate::error::{SandboxError, SandboxFailure};
use crate::host::{self, HostServices, HostState, StoreData};
use crate::pipes::CappedPipe;
use crate::wasm_config::{page_aligned_bytes, sandbox_engine_config};

/// Hard per-invocation cap on captured stdout and stderr, each.
pub const MAX_OUTPUT_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub memory_limit_bytes: Option<u64>,
    pub fuel_limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Mount {
    pub host: PathBuf,
    pub guest: String,
}

/// One sandbox run: payload on stdin, captured stdout/stderr, a deadline.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub stdin: Vec<u8>,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub deadline: Duration,
    pub context: InvocationContext,
}

impl Invocation {
    pub fn background(payload: impl Into<Vec<u8>>, deadline: Duration) -> Self {
        let stdin = payload.into();
        let text = String::from_utf8_lossy(&stdin).into_owned();
        Self {
            stdin,
            argv: Vec::new(),
            env: BTreeMap::new(),
            mounts: Vec::new(),
            deadline,
            context: InvocationContext::Background { payload: text },
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvocationOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Compile-once, instantiate-many sandbox.
///
/// One engine per worker: the compiled module is immutable and shared by
/// every invocation that worker performs, and an epoch bump from a
/// cancellation handle only ever interrupts that worker's current guest.
pub struct SandboxEngine {
    engine: Engine,
    module: Module,
    linker: Linker<StoreData>,
    settings: EngineSettings,
    services: Arc<HostServices>,
}

impl SandboxEngine {
    pub fn new(
        verified_wasm: &[u8],
        settings: EngineSettings,
        services: Arc<HostServices>,
    ) -> Result<Self, SandboxError> {
        if verified_wasm.is_empty() {
            return Err(SandboxError::InvalidModule("wasm module is empty".to_string()));
        }
        let cfg = sandbox_engine_config(settings.fuel_limit.is_some());
        let engine =
            Engine::new(&cfg).map_err(|err| SandboxError::Setup(format!("engine init failed: {err}")))?;
        let module = Module::new(&engine, verified_wasm)
            .map_err(|err| SandboxError::InvalidModule(err.to_string()))?;

        let mut linker = Linker::<StoreData>::new(&engine);
        preview1::add_to_linker_sync(&mut linker, |data: &mut StoreData| &mut data.wasi)
            .map_err(|err| SandboxError::Setup(err.to_string()))?;
        host::add_to_linker(&mut linker)?;

        Ok(Self {
            engine,
            module,
            linker,
            settings,
            services,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Runs one invocation to completion on the calling thread.
    pub fn run(&self, invocation: Invocation) -> Result<InvocationOutput, SandboxFailure> {
        let cancel = CancelHandle::new(self.engine.clone());
        let stdout = CappedPipe::new(MAX_OUTPUT_BYTES, cancel.clone());
        let stderr = CappedPipe::new(MAX_OUTPUT_BYTES, cancel.clone());

        let result = self.run_inner(invocation, &cancel, stdout.clone(), stderr.clone());
        let output = InvocationOutput {
            stdout: stdout.contents(),
            stderr: stderr.contents(),
        };
        match result {
            Ok(()) => Ok(output),
            Err(error) => Err(SandboxFailure { error, output }),
        }
    }

    fn run_inner(
        &self,
        invocation: Invocation,
        cancel: &CancelHandle,
        stdout: CappedPipe,
        stderr: CappedPipe,
    ) -> Result<(), SandboxError> {
        let mut builder = WasiCtxBuilder::new();
        builder.stdin(MemoryInputPipe::new(invocation.stdin));
        builder.stdout(stdout);
        builder.stderr(stderr);
        builder.args(&invocation.argv);
        for (key, value) in &invocation.env {
            builder.env(key, value);
        }
        for mount in &invocation.mounts {
            builder
                .preopened_dir(&mount.host, &mount.guest, DirPerms::all(), FilePerms::all())
                .map_err(|err| {
                    SandboxError::Setup(format!("mount {} failed: {err}", mount.host.display()))
                })?;
        }
        let wasi = builder.build_p1();

        let mut limit_builder = StoreLimitsBuilder::new();
        if let Some(bytes) = self.settings.memory_limit_bytes {
            limit_builder = limit_builder.memory_size(page_aligned_bytes(bytes) as usize);
        }
        let limits = limit_builder.build();

        let mut store = Store::new(
            &self.engine,
            StoreData {
                wasi,
                limits,
                host: HostState {
                    services: self.services.clone(),
                    context: invocation.context,
                },
            },
        );
        store.limiter(|data| &mut data.limits);
        if let Some(fuel) = self.settings.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|err| SandboxError::Setup(err.to_string()))?;
        }
        store.set_epoch_deadline(1);

        let watchdog = cancel.arm(invocation.deadline);
        let outcome = self.instantiate_and_start(&mut store);
        drop(watchdog);

        match outcome {
            Ok(()) => {
                // A guest can overrun its quota in one final write and then
                // return before the epoch trap lands; a fired handle means
                // the invocation was cancelled regardless.
                match cancel.fired() {
                    Some(CancelReason::OutputQuota) => Err(SandboxError::OutputQuota),
                    Some(CancelReason::Deadline) => Err(SandboxError::DeadlineExceeded),
                    None => Ok(()),
                }
            }
            Err(err) => {
                if let Some(exit) = err.downcast_ref::<I32Exit>() {
                    if exit.0 == 0 {
                        // proc_exit(0) is a clean shutdown, but a fired
                        // quota still cancels the invocation.
                        return match cancel.fired() {
                            Some(CancelReason::OutputQuota) => Err(SandboxError::OutputQuota),
                            Some(CancelReason::Deadline) => Err(SandboxError::DeadlineExceeded),
                            None => Ok(()),
                        };
                    }
                }
                Err(classify(err, cancel))
            }
        }
    }

    fn instantiate_and_start(&self, store: &mut Store<StoreData>) -> Result<(), anyhow::Error> {
        let instance = self.linker.instantiate(&mut *store, &self.module)?;
        let start = instance.get_typed_func::<(), ()>(&mut *store, "_start")?;
        start.call(&mut *store, ())
    }
}

fn classify(err: anyhow::Error, cancel: &CancelHandle) -> SandboxError {
    if let Some(exit) = err.downcast_ref::<I32Exit>() {
        return SandboxError::GuestExit(exit.0);
    }
    match cancel.fired() {
        Some(CancelReason::OutputQuota) => return SandboxError::OutputQuota,
        Some(CancelReason::Deadline) => return SandboxError::DeadlineExceeded,
        None => {}
    }
    if let Some(trap) = err.downcast_ref::<wasmtime::Trap>() {
        return match trap {
            wasmtime::Trap::OutOfFuel => SandboxError::FuelExhausted,
            wasmtime::Trap::Interrupt => SandboxError::DeadlineExceeded,
            other => SandboxError::Trap(other.to_string()),
        };
    }
    SandboxError::Trap(format!("{:#}", err))
}
