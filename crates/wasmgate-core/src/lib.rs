// Copyright [2026] [Joseph Verdicchio]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! wasmgate-core
//!
//! The sandbox engine of the wasmgate platform:
//! - compile-once / instantiate-many wasm execution with per-invocation
//!   stdin, captured stdout/stderr, env, mounts, and a deadline
//! - a hard output quota whose overflow feeds the same cancellation path
//!   as the deadline (one kill switch for both budgets)
//! - the `wasmgate` host-function surface bridging guests to the host
//!   database, object store, key-value map, job queue, and AI collaborator

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod ai;
pub mod bridge;
pub mod cancel;
pub mod context;
pub mod error;
pub mod host;
pub mod kv;
pub mod pipes;
pub mod sandbox;
pub mod wasm_config;

pub use crate::ai::{AiClient, AiConfig};
pub use crate::bridge::{BridgeError, JobSink, MemoryObjectStore, ObjectStore, SqlBridge};
pub use crate::cancel::{CancelHandle, CancelReason};
pub use crate::context::{InvocationContext, RequestEnvelope, ResponseEnvelope};
pub use crate::error::{SandboxError, SandboxFailure};
pub use crate::host::HostServices;
pub use crate::kv::KvStore;
pub use crate::sandbox::{
    EngineSettings, Invocation, InvocationOutput, Mount, SandboxEngine, MAX_OUTPUT_BYTES,
};
