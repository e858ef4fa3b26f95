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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use signal_hook::{consts::TERM_SIGNALS, flag, iterator::Signals};
use tracing::info;

use crate::daemon::chunk_buffer::ChunkBuffer;

const DRAIN_GRACE_PERIOD: Duration = Duration::from_secs(2);

pub struct Handler {
    chunk_buffer: Option<Arc<ChunkBuffer>>,
}

impl Handler {
    pub fn new(chunk_buffer: Option<Arc<ChunkBuffer>>) -> Self {
        Handler { chunk_buffer }
    }

    pub fn spawn(self) -> anyhow::Result<()> {
        info!("spawning signal handler thread");

        let term_now = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
            flag::register(*sig, Arc::clone(&term_now))?;
        }

        let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;
        thread::spawn(move || {
            #[allow(clippy::never_loop)]
            for signal in &mut signals {
                assert!(TERM_SIGNALS.contains(&signal));

                info!("received termination signal, shutting down");
                if let Some(buffer) = &self.chunk_buffer {
                    buffer.request_shutdown();
                    let deadline = Instant::now() + DRAIN_GRACE_PERIOD;
                    while Instant::now() < deadline && buffer.in_flight_bytes() > 0 {
                        thread::sleep(Duration::from_millis(20));
                    }
                }

                info!("exiting");
                std::process::exit(0);
            }
        });

        Ok(())
    }
}
