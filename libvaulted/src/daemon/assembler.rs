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

//! The per-session chunk assembler: consumes `(global_seq, bytes)` tuples
//! delivered in any order and produces one contiguous byte stream plus its
//! SHA-256, in either eager (write-through with bounded out-of-order
//! staging) or lazy (stage everything, assemble at finalize) mode.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::AssemblerMode;
use crate::consts::MAX_CHUNK_LEN;
use crate::daemon::storage;
use crate::errors::CoreError;

/// Either staged bytes in memory, or a path to a staged file on disk. A
/// chunk may transition in-memory -> on-disk (spill) but never back.
enum PendingChunk {
    InMemory(Vec<u8>),
    OnDisk { path: PathBuf },
}

impl PendingChunk {
    fn len(&self) -> usize {
        match self {
            PendingChunk::InMemory(b) => b.len(),
            PendingChunk::OnDisk { .. } => 0,
        }
    }
}

struct Inner {
    writer: BufWriter<File>,
    hasher: Sha256,
    pending: HashMap<u32, PendingChunk>,
    created_shards: HashSet<PathBuf>,
}

pub struct AssemblerConfig {
    pub mode: AssemblerMode,
    pub pending_mem_limit: usize,
    pub shard_levels: u8,
    pub fsync_staging: bool,
}

/// Reassembles one parallel session's chunks into `out_path`. Owns the
/// output file, the staging directory, and the pending-chunk map for the
/// session's lifetime.
pub struct Assembler {
    out_path: PathBuf,
    staging_root: PathBuf,
    mode: AssemblerMode,
    pending_mem_limit: usize,
    shard_levels: u8,
    fsync_staging: bool,

    inner: Mutex<Inner>,

    next_expected_seq: AtomicU32,
    pending_mem_bytes: AtomicUsize,
    pending_count: AtomicUsize,
    total_bytes: AtomicU64,
    finalized: AtomicBool,
    /// -1 means "no lazy chunk has arrived yet".
    lazy_max_seq: AtomicI64,
    assembling: AtomicBool,
    assembled_chunks: AtomicU64,
}

impl Assembler {
    pub fn new(out_path: PathBuf, staging_root: PathBuf, cfg: AssemblerConfig) -> io::Result<Self> {
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&out_path)?;
        Ok(Assembler {
            out_path,
            staging_root,
            mode: cfg.mode,
            pending_mem_limit: cfg.pending_mem_limit,
            shard_levels: cfg.shard_levels,
            fsync_staging: cfg.fsync_staging,
            inner: Mutex::new(Inner {
                writer: BufWriter::new(file),
                hasher: Sha256::new(),
                pending: HashMap::new(),
                created_shards: HashSet::new(),
            }),
            next_expected_seq: AtomicU32::new(0),
            pending_mem_bytes: AtomicUsize::new(0),
            pending_count: AtomicUsize::new(0),
            total_bytes: AtomicU64::new(0),
            finalized: AtomicBool::new(false),
            lazy_max_seq: AtomicI64::new(-1),
            assembling: AtomicBool::new(false),
            assembled_chunks: AtomicU64::new(0),
        })
    }

    pub fn out_path(&self) -> &Path {
        &self.out_path
    }

    /// Reads exactly `length` bytes from `reader` outside any lock, then
    /// delivers them. Network I/O must never block other streams sharing
    /// this assembler.
    pub fn write_chunk<R: Read>(&self, global_seq: u32, mut reader: R, length: u32) -> Result<(), CoreError> {
        if length == 0 || length > MAX_CHUNK_LEN {
            return Err(CoreError::Framing(format!("chunk length {length} out of bounds")));
        }
        let mut buf = vec![0u8; length as usize];
        reader.read_exact(&mut buf).map_err(CoreError::TransientIo)?;
        self.write_chunk_bytes(global_seq, buf)
    }

    /// Entry point used both by the direct receiver path and by the shared
    /// chunk buffer's drain loop / fallback path, which already hold the
    /// payload in memory.
    pub fn write_chunk_bytes(&self, global_seq: u32, bytes: Vec<u8>) -> Result<(), CoreError> {
        match self.mode {
            AssemblerMode::Lazy => self.write_chunk_lazy(global_seq, bytes),
            AssemblerMode::Eager => self.write_chunk_eager(global_seq, bytes),
        }
    }

    fn write_chunk_lazy(&self, seq: u32, bytes: Vec<u8>) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.contains_key(&seq) {
            debug!(seq, "duplicate lazy chunk, ignoring");
            return Ok(());
        }
        let path = self.chunk_path(&mut inner, seq);
        fs::write(&path, &bytes).map_err(CoreError::StorageIo)?;
        if self.fsync_staging {
            File::open(&path).and_then(|f| f.sync_all()).map_err(CoreError::StorageIo)?;
        }
        // The order here is load-bearing: insert into `pending` before
        // advancing `lazy_max_seq`, so finalize's linear scan never sees a
        // seq <= lazy_max_seq with no pending entry.
        inner.pending.insert(seq, PendingChunk::OnDisk { path });
        self.pending_count.fetch_add(1, Ordering::SeqCst);
        self.advance_lazy_max(seq);
        Ok(())
    }

    fn advance_lazy_max(&self, seq: u32) {
        let target = seq as i64;
        let mut cur = self.lazy_max_seq.load(Ordering::SeqCst);
        while cur < target {
            match self.lazy_max_seq.compare_exchange(cur, target, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    fn write_chunk_eager(&self, seq: u32, bytes: Vec<u8>) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().unwrap();
        let next = self.next_expected_seq.load(Ordering::SeqCst);
        match seq.cmp(&next) {
            std::cmp::Ordering::Equal => {
                self.write_through(&mut inner, &bytes)?;
                self.next_expected_seq.store(next + 1, Ordering::SeqCst);
                self.flush_pending(&mut inner)?;
                Ok(())
            }
            std::cmp::Ordering::Less => {
                debug!(seq, next_expected = next, "duplicate/late chunk, ignoring");
                Ok(())
            }
            std::cmp::Ordering::Greater => self.store_out_of_order(inner, seq, bytes),
        }
    }

    fn flush_pending(&self, inner: &mut Inner) -> Result<(), CoreError> {
        loop {
            let next = self.next_expected_seq.load(Ordering::SeqCst);
            let Some(chunk) = inner.pending.remove(&next) else { break };
            let mem_len = chunk.len();
            match chunk {
                PendingChunk::InMemory(bytes) => {
                    self.write_through(inner, &bytes)?;
                    self.pending_mem_bytes.fetch_sub(mem_len, Ordering::SeqCst);
                }
                PendingChunk::OnDisk { path } => {
                    let bytes = fs::read(&path).map_err(CoreError::StorageIo)?;
                    self.write_through(inner, &bytes)?;
                    let _ = fs::remove_file(&path);
                }
            }
            self.pending_count.fetch_sub(1, Ordering::SeqCst);
            self.next_expected_seq.store(next + 1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// The race-critical out-of-order path: either store in memory under
    /// the limit, or spill to disk via a three-step sequence that never
    /// holds the lock across disk I/O.
    fn store_out_of_order(
        &self,
        mut inner: std::sync::MutexGuard<'_, Inner>,
        seq: u32,
        bytes: Vec<u8>,
    ) -> Result<(), CoreError> {
        let length = bytes.len();
        let mem_bytes = self.pending_mem_bytes.load(Ordering::SeqCst);
        if mem_bytes + length <= self.pending_mem_limit {
            inner.pending.insert(seq, PendingChunk::InMemory(bytes));
            self.pending_mem_bytes.fetch_add(length, Ordering::SeqCst);
            self.pending_count.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        // Step 1: under the lock, choose (and create) the shard directory.
        let final_path = self.chunk_path(&mut inner, seq);
        drop(inner);

        // Step 2: write outside the lock.
        let tmp_path = final_path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp_path, &bytes).map_err(CoreError::StorageIo)?;
        if self.fsync_staging {
            File::open(&tmp_path).and_then(|f| f.sync_all()).map_err(CoreError::StorageIo)?;
        }

        // Step 3: reacquire and revalidate.
        let mut inner = self.inner.lock().unwrap();
        let next = self.next_expected_seq.load(Ordering::SeqCst);
        if inner.pending.contains_key(&seq) {
            let _ = fs::remove_file(&tmp_path);
            return Ok(());
        }
        if seq < next {
            let _ = fs::remove_file(&tmp_path);
            return Ok(());
        }
        if seq == next {
            let _ = fs::remove_file(&tmp_path);
            self.write_through(&mut inner, &bytes)?;
            self.next_expected_seq.store(next + 1, Ordering::SeqCst);
            self.flush_pending(&mut inner)?;
            return Ok(());
        }
        fs::rename(&tmp_path, &final_path).map_err(CoreError::StorageIo)?;
        inner.pending.insert(seq, PendingChunk::OnDisk { path: final_path });
        self.pending_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn chunk_path(&self, inner: &mut Inner, seq: u32) -> PathBuf {
        let path = storage::chunk_staging_path(&self.staging_root, seq, self.shard_levels);
        if let Some(dir) = path.parent() {
            if !inner.created_shards.contains(dir) {
                let _ = fs::create_dir_all(dir);
                inner.created_shards.insert(dir.to_path_buf());
            }
        }
        path
    }

    fn write_through(&self, inner: &mut Inner, bytes: &[u8]) -> Result<(), CoreError> {
        inner.writer.write_all(bytes).map_err(CoreError::StorageIo)?;
        inner.hasher.update(bytes);
        self.total_bytes.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Flushes the output, computes the final checksum, and returns
    /// `(out_path, total_bytes, checksum)`. In lazy mode, assembles the
    /// whole output from staged files first; a missing seq anywhere in
    /// `0..=lazy_max_seq` is a hard fault.
    pub fn finalize(&self) -> Result<(PathBuf, u64, [u8; 32]), CoreError> {
        let mut inner = self.inner.lock().unwrap();

        if self.mode == AssemblerMode::Lazy {
            self.assembling.store(true, Ordering::SeqCst);
            let lazy_max = self.lazy_max_seq.load(Ordering::SeqCst);
            if lazy_max >= 0 {
                for seq in 0..=(lazy_max as u32) {
                    let chunk = inner
                        .pending
                        .remove(&seq)
                        .ok_or(CoreError::MissingChunkAtFinalize(seq))?;
                    match chunk {
                        PendingChunk::OnDisk { path } => {
                            let bytes = fs::read(&path).map_err(CoreError::StorageIo)?;
                            inner.writer.write_all(&bytes).map_err(CoreError::StorageIo)?;
                            inner.hasher.update(&bytes);
                            self.total_bytes.fetch_add(bytes.len() as u64, Ordering::SeqCst);
                            let _ = fs::remove_file(&path);
                        }
                        PendingChunk::InMemory(bytes) => {
                            inner.writer.write_all(&bytes).map_err(CoreError::StorageIo)?;
                            inner.hasher.update(&bytes);
                            self.total_bytes.fetch_add(bytes.len() as u64, Ordering::SeqCst);
                        }
                    }
                    self.assembled_chunks.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.assembling.store(false, Ordering::SeqCst);
        }

        inner.writer.flush().map_err(CoreError::StorageIo)?;
        let checksum: [u8; 32] = inner.hasher.clone().finalize().into();
        self.finalized.store(true, Ordering::SeqCst);
        Ok((self.out_path.clone(), self.total_bytes.load(Ordering::SeqCst), checksum))
    }

    /// Best-effort teardown for a session that never finalized: removes
    /// the output file and the whole staging directory.
    pub fn cleanup(&self) {
        if !self.finalized.load(Ordering::SeqCst) {
            let _ = fs::remove_file(&self.out_path);
        }
        if self.staging_root.exists() {
            let _ = fs::remove_dir_all(&self.staging_root);
        }
    }

    // Lock-free stats, safe to read from an observability thread.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    pub fn next_expected_seq(&self) -> u32 {
        self.next_expected_seq.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count.load(Ordering::SeqCst)
    }

    pub fn pending_mem_bytes(&self) -> usize {
        self.pending_mem_bytes.load(Ordering::SeqCst)
    }
}
