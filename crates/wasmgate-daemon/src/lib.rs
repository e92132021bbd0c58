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

//! wasmgate-daemon
//!
//! The multi-tenant serverless daemon: HTTP ingress that authenticates and
//! attributes requests to tenants, lazily provisioned per-tenant streams
//! and state buckets, and durable worker pools that run each queued job in
//! a fresh sandbox with bounded retries and crash-dump dead-lettering.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod audit;
pub mod config;
pub mod crash;
pub mod ingress;
pub mod jobs;
pub mod ratelimit;
pub mod scheduler;
pub mod snapshot;
pub mod telemetry;
pub mod tenant;
pub mod worker;

pub use crate::config::GateConfig;
pub use crate::ingress::{GateError, GateState};
