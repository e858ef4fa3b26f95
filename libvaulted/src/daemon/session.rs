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

//! The registry entry for one in-flight backup. A session is either a
//! single TCP stream writing straight through, or a parallel session
//! fanned across multiple joining streams and reassembled by an
//! [`crate::daemon::assembler::Assembler`].

use std::collections::HashMap;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use vaulted_protocol::SessionId;

use crate::daemon::assembler::Assembler;
use crate::daemon::gap_tracker::GapTracker;
use crate::daemon::lock_table::TripleGuard;
use crate::daemon::ready_signal::ReadySignal;
use crate::names::BackupTriple;

pub struct SingleStreamState {
    pub tmp_path: PathBuf,
    pub bytes_written: AtomicU64,
}

/// Tracking for one stream index's currently-joined connection. Replaced
/// wholesale on every re-join; `cancel` lets the outgoing receiver loop
/// notice it has been superseded.
pub struct StreamAttachment {
    pub conn: TcpStream,
    pub cancel: Arc<AtomicBool>,
    pub completed_bytes: u64,
    pub reconnect_count: u32,
    pub window_start: Instant,
    pub window_bytes: u64,
    pub last_rotation: Option<Instant>,
}

/// Counts stream indices that have attached at least once but have not
/// yet reported a clean end-of-stream. A re-join replaces the attachment
/// without touching the count: the new receiver inherits the obligation
/// to eventually call `mark_done`.
#[derive(Default)]
pub struct CompletionBarrier {
    outstanding: Mutex<usize>,
    cond: Condvar,
}

impl CompletionBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_first_attach(&self) {
        let mut outstanding = self.outstanding.lock().unwrap();
        *outstanding += 1;
    }

    pub fn mark_done(&self) {
        let mut outstanding = self.outstanding.lock().unwrap();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.cond.notify_all();
        }
    }

    pub fn wait_all(&self) {
        let mut outstanding = self.outstanding.lock().unwrap();
        while *outstanding > 0 {
            outstanding = self.cond.wait(outstanding).unwrap();
        }
    }

    /// Bounded variant so a stream that fails without ever reporting a
    /// clean end-of-stream can't pin the opener thread forever. Returns
    /// whether the barrier actually cleared.
    pub fn wait_all_timeout(&self, timeout: std::time::Duration) -> bool {
        let outstanding = self.outstanding.lock().unwrap();
        let (outstanding, result) =
            self.cond.wait_timeout_while(outstanding, timeout, |o| *o > 0).unwrap();
        let _ = outstanding;
        !result.timed_out()
    }
}

pub struct ParallelState {
    pub assembler: Arc<Assembler>,
    pub max_streams: u8,
    pub chunk_size: u32,
    /// Fires once any stream has delivered its first chunk, unblocking
    /// the opener's wait for the completion barrier.
    pub first_stream_ready: ReadySignal,
    /// Set once a stream reports the trailer; remaining streams observe
    /// this to stop accepting new chunks for this session.
    pub closing: AtomicBool,
    pub streams: Mutex<HashMap<u8, StreamAttachment>>,
    pub barrier: CompletionBarrier,
    pub gap_tracker: Option<Arc<GapTracker>>,
}

/// Per-session state, tagged by transport shape. Held behind `Arc` in the
/// session registry; the `_lock` guard ties the triple's single-writer
/// lock to the session's lifetime.
pub enum Session {
    Single { common: Common, state: SingleStreamState },
    Parallel { common: Common, state: ParallelState },
}

pub struct Common {
    pub session_id: SessionId,
    pub triple: BackupTriple,
    pub base_dir: PathBuf,
    pub created_at: Instant,
    pub last_activity: AtomicU64,
    _lock: TripleGuard,
}

impl Session {
    pub fn common(&self) -> &Common {
        match self {
            Session::Single { common, .. } => common,
            Session::Parallel { common, .. } => common,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.common().session_id
    }

    pub fn touch(&self, now: Instant) {
        self.common().touch(now);
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        self.common().idle_for(now)
    }
}

impl Common {
    pub fn new(session_id: SessionId, triple: BackupTriple, base_dir: PathBuf, lock: TripleGuard) -> Self {
        let now = Instant::now();
        Common { session_id, triple, base_dir, created_at: now, last_activity: AtomicU64::new(0), _lock: lock }
    }

    pub fn touch(&self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.created_at).as_millis() as u64;
        self.last_activity.store(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        let last_ms = self.last_activity.load(Ordering::Relaxed);
        let last = self.created_at + std::time::Duration::from_millis(last_ms);
        now.saturating_duration_since(last)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::daemon::lock_table::LockTable;

    fn triple() -> BackupTriple {
        BackupTriple::new("agent".into(), "storage".into(), "backup".into()).unwrap()
    }

    #[test]
    fn touch_resets_idle_duration() {
        let table = std::sync::Arc::new(LockTable::new());
        let guard = table.try_claim(triple()).unwrap();
        let common = Common::new(SessionId::ZERO, triple(), PathBuf::from("/tmp"), guard);

        let t0 = Instant::now();
        assert!(common.idle_for(t0) < std::time::Duration::from_secs(1));

        std::thread::sleep(std::time::Duration::from_millis(15));
        let t1 = Instant::now();
        assert!(common.idle_for(t1) >= std::time::Duration::from_millis(10));

        common.touch(t1);
        let t2 = Instant::now();
        assert!(common.idle_for(t2) < std::time::Duration::from_millis(10));
    }
}
