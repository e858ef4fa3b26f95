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

//! A process-wide bounded staging area that lets receiver threads hand
//! chunk bytes off to a drain thread instead of writing them inline,
//! smoothing bursty arrival across every assembler sharing the process.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, error};

use crate::consts::{BUFFER_FLUSH_TIMEOUT, BUFFER_PUSH_TIMEOUT, DRAIN_POLL_INTERVAL};
use crate::daemon::assembler::Assembler;
use crate::daemon::gap_tracker::GapTracker;
use crate::errors::CoreError;

struct Slot {
    global_seq: u32,
    bytes: Vec<u8>,
    assembler: Arc<Assembler>,
    gap_tracker: Option<Arc<GapTracker>>,
}

#[derive(Default)]
struct Counters {
    pushed: AtomicU64,
    drained: AtomicU64,
    fallbacks: AtomicU64,
    backpressure_events: AtomicU64,
}

/// Keys assemblers by pointer identity so the buffer can track in-flight
/// bytes per session without the assembler itself knowing about the
/// buffer.
pub struct ChunkBuffer {
    capacity_bytes: usize,
    drain_ratio: f64,
    in_flight_bytes: AtomicUsize,
    per_assembler: Mutex<HashMap<usize, Arc<AtomicUsize>>>,
    sender: crossbeam_channel::Sender<Slot>,
    receiver: crossbeam_channel::Receiver<Slot>,
    drain_signal_tx: crossbeam_channel::Sender<()>,
    drain_signal_rx: crossbeam_channel::Receiver<()>,
    shutting_down: AtomicBool,
    counters: Counters,
}

impl ChunkBuffer {
    pub fn new(capacity_bytes: usize, drain_ratio: f64, channel_slots: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(channel_slots.max(1));
        let (drain_signal_tx, drain_signal_rx) = crossbeam_channel::bounded(1);
        ChunkBuffer {
            capacity_bytes,
            drain_ratio,
            in_flight_bytes: AtomicUsize::new(0),
            per_assembler: Mutex::new(HashMap::new()),
            sender,
            receiver,
            drain_signal_tx,
            drain_signal_rx,
            shutting_down: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    fn assembler_key(assembler: &Arc<Assembler>) -> usize {
        Arc::as_ptr(assembler) as usize
    }

    fn counter_for(&self, assembler: &Arc<Assembler>) -> Arc<AtomicUsize> {
        let key = Self::assembler_key(assembler);
        let mut map = self.per_assembler.lock().unwrap();
        Arc::clone(map.entry(key).or_insert_with(|| Arc::new(AtomicUsize::new(0))))
    }

    /// Reserves capacity and enqueues the chunk for the drain thread. If
    /// capacity is exhausted, falls back to writing the chunk through
    /// directly on the calling thread so the receiver never blocks forever
    /// on a saturated buffer.
    pub fn push(
        &self,
        global_seq: u32,
        bytes: Vec<u8>,
        assembler: &Arc<Assembler>,
        gap_tracker: Option<Arc<GapTracker>>,
    ) -> Result<(), CoreError> {
        let len = bytes.len();
        loop {
            let in_flight = self.in_flight_bytes.load(Ordering::SeqCst);
            if len > self.capacity_bytes.saturating_sub(in_flight) {
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                assembler.write_chunk_bytes(global_seq, bytes)?;
                if let Some(gt) = gap_tracker {
                    gt.complete_chunk(global_seq);
                }
                return Ok(());
            }
            if self
                .in_flight_bytes
                .compare_exchange(in_flight, in_flight + len, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        let counter = self.counter_for(assembler);
        counter.fetch_add(len, Ordering::SeqCst);

        let slot = Slot { global_seq, bytes, assembler: Arc::clone(assembler), gap_tracker };
        match self.sender.send_timeout(slot, BUFFER_PUSH_TIMEOUT) {
            Ok(()) => {
                self.counters.pushed.fetch_add(1, Ordering::Relaxed);
                self.maybe_signal_drain();
                Ok(())
            }
            Err(_) => {
                self.in_flight_bytes.fetch_sub(len, Ordering::SeqCst);
                counter.fetch_sub(len, Ordering::SeqCst);
                self.counters.backpressure_events.fetch_add(1, Ordering::Relaxed);
                Err(CoreError::StorageIo(io::Error::new(io::ErrorKind::TimedOut, "chunk buffer push timed out")))
            }
        }
    }

    fn maybe_signal_drain(&self) {
        let should = if self.drain_ratio <= 0.0 {
            true
        } else {
            let in_flight = self.in_flight_bytes.load(Ordering::SeqCst) as f64;
            in_flight / self.capacity_bytes.max(1) as f64 >= self.drain_ratio
        };
        if should {
            let _ = self.drain_signal_tx.try_send(());
        }
    }

    fn drain_available(&self) {
        while let Ok(slot) = self.receiver.try_recv() {
            let len = slot.bytes.len();
            let key = Self::assembler_key(&slot.assembler);
            if let Err(e) = slot.assembler.write_chunk_bytes(slot.global_seq, slot.bytes) {
                error!(seq = slot.global_seq, error = ?e, "chunk buffer drain write failed");
            } else if let Some(gt) = &slot.gap_tracker {
                gt.complete_chunk(slot.global_seq);
            }
            self.in_flight_bytes.fetch_sub(len, Ordering::SeqCst);
            if let Some(counter) = self.per_assembler.lock().unwrap().get(&key) {
                counter.fetch_sub(len, Ordering::SeqCst);
            }
            self.counters.drained.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Runs until `request_shutdown` is called, draining on every signal
    /// and on a periodic poll tick. Intended to be the body of a single
    /// dedicated background thread.
    pub fn run_drain_loop(&self) {
        loop {
            crossbeam_channel::select! {
                recv(self.drain_signal_rx) -> _ => {}
                default(DRAIN_POLL_INTERVAL) => {}
            }
            self.drain_available();
            if self.shutting_down.load(Ordering::SeqCst) && self.receiver.is_empty() {
                debug!("chunk buffer drain loop exiting");
                return;
            }
        }
    }

    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.drain_signal_tx.try_send(());
    }

    /// Blocks until every chunk already pushed for this assembler has been
    /// written through, or the flush timeout elapses.
    pub fn flush(&self, assembler: &Arc<Assembler>) -> Result<(), CoreError> {
        let key = Self::assembler_key(assembler);
        let counter = {
            let map = self.per_assembler.lock().unwrap();
            map.get(&key).cloned()
        };
        let Some(counter) = counter else { return Ok(()) };

        let deadline = Instant::now() + BUFFER_FLUSH_TIMEOUT;
        loop {
            if counter.load(Ordering::SeqCst) == 0 {
                self.per_assembler.lock().unwrap().remove(&key);
                return Ok(());
            }
            let _ = self.drain_signal_tx.try_send(());
            if Instant::now() >= deadline {
                return Err(CoreError::StorageIo(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("flush timed out with {} bytes still in flight", counter.load(Ordering::SeqCst)),
                )));
            }
            std::thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }

    pub fn in_flight_bytes(&self) -> usize {
        self.in_flight_bytes.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::AssemblerMode;
    use crate::daemon::assembler::AssemblerConfig;

    fn new_assembler(dir: &std::path::Path) -> Arc<Assembler> {
        let cfg = AssemblerConfig { mode: AssemblerMode::Eager, pending_mem_limit: 1024, shard_levels: 1, fsync_staging: false };
        Arc::new(Assembler::new(dir.join("out.tmp"), dir.join("chunks"), cfg).unwrap())
    }

    #[test]
    fn push_and_drain_writes_through() {
        let tmp = tempfile::tempdir().unwrap();
        let asm = new_assembler(tmp.path());
        let buffer = ChunkBuffer::new(1024, 0.0, 16);

        buffer.push(0, b"A".to_vec(), &asm, None).unwrap();
        buffer.push(1, b"B".to_vec(), &asm, None).unwrap();
        buffer.drain_available();
        buffer.flush(&asm).unwrap();

        let (path, total, _) = asm.finalize().unwrap();
        assert_eq!(total, 2);
        assert_eq!(std::fs::read(&path).unwrap(), b"AB");
    }

    #[test]
    fn oversized_push_falls_back_to_direct_write() {
        let tmp = tempfile::tempdir().unwrap();
        let asm = new_assembler(tmp.path());
        let buffer = ChunkBuffer::new(4, 0.0, 16);

        buffer.push(0, b"too big for capacity".to_vec(), &asm, None).unwrap();
        let (_, total, _) = asm.finalize().unwrap();
        assert_eq!(total, "too big for capacity".len() as u64);
    }

    #[test]
    fn flush_is_a_no_op_for_unknown_assembler() {
        let tmp = tempfile::tempdir().unwrap();
        let asm = new_assembler(tmp.path());
        let buffer = ChunkBuffer::new(1024, 0.0, 16);
        buffer.flush(&asm).unwrap();
    }
}
