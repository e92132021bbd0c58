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

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use wasmgate_daemon::ingress::router;
use wasmgate_daemon::{scheduler, snapshot, GateConfig, GateState};

#[derive(Debug, Parser)]
#[command(name = "wasmgate-daemon")]
#[command(about = "Sovereign multi-tenant serverless execution daemon")]
struct Args {
    #[arg(long, default_value = "wasmgate.json")]
    config: PathBuf,

    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(args.log))
        .init();

    let cfg = GateConfig::load(&args.config)?;
    if let Some(applied) = snapshot::apply_pending_restore(&cfg.data_dir)? {
        tracing::info!(file = %applied.display(), "applied pending broker restore");
    }

    let addr: SocketAddr = args.listen.parse()?;
    let state = GateState::build(cfg)?;

    let _cron = scheduler::start(&state.cfg.cron, state.jobs.clone());

    tracing::info!(
        %addr,
        node_id = %state.node_id,
        artifact = %state.cfg.path.display(),
        pool_size = state.workers.pool_size(),
        policy = %state.cfg.security_policy,
        api_keys = state.cfg.api_keys.len(),
        "starting wasmgate daemon"
    );

    #[cfg(unix)]
    {
        let reload_state = state.clone();
        tokio::spawn(async move {
            let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            {
                Ok(sig) => sig,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to install SIGHUP handler");
                    return;
                }
            };
            while hup.recv().await.is_some() {
                tracing::info!("SIGHUP received; draining workers for hot reload");
                reload_state.workers.drain_all().await;
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown_state = state.clone();
    axum::serve(
        listener,
        router(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received; draining workers");
        shutdown_state.workers.drain_all().await;
    })
    .await?;

    Ok(())
}
