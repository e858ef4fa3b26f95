// Copyright 2024 Vaulted Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod assembler;
pub mod atomic_writer;
pub mod chunk_buffer;
pub mod gap_tracker;
pub mod lock_table;
pub mod ready_signal;
pub mod retention;
pub mod server;
pub mod session;
pub mod signals;
pub mod storage;
pub mod ttl_reaper;

use std::net::TcpListener;

use anyhow::Context;
use tracing::info;

use crate::config;

/// Loads configuration, binds the listener and runs the daemon until a
/// termination signal arrives.
pub fn run(config_path: &str, listen: &str) -> anyhow::Result<()> {
    let manager = config::Manager::load(config_path).context("loading configuration")?;
    let server = server::Server::new(manager).context("constructing server")?;

    let listener = TcpListener::bind(listen).with_context(|| format!("binding listen address {listen}"))?;
    info!(addr = %listen, "listening for connections");

    signals::Handler::new(server.chunk_buffer()).spawn().context("installing signal handler")?;

    server.serve(listener)
}
