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

use std::io;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod config;
pub mod config_watcher;
pub mod consts;
pub mod daemon;
pub mod errors;
pub mod names;
mod test_hooks;

pub use daemon::server::Server;

/// The command line arguments vaulted expects. These can be directly
/// parsed with clap or manually constructed to present some other user
/// interface.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(short, long, action, help = "a YAML file containing configuration")]
    pub config_file: String,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(
        short,
        long,
        action,
        default_value = "0.0.0.0:7420",
        help = "the address to listen for agent connections on"
    )]
    pub listen: String,

    #[clap(short, long, action, help = "write logs to this file instead of stderr")]
    pub log_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "print version")]
    Version,

    #[clap(about = "starts the backup reception daemon")]
    Daemon,
}

impl Args {
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Run vaulted with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };

    if let Some(log_file) = args.log_file.clone() {
        let file = std::fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let res = match args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Daemon => daemon::run(&args.config_file, &args.listen),
    };

    if let Err(err) = &res {
        error!("{:?}", err);
    }
    res.context("running vaulted daemon")
}
