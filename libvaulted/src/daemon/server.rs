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

//! The daemon core: accepts transport connections, dispatches them by
//! magic bytes, and drives the handshake / receive / commit lifecycle for
//! both single-stream and parallel sessions.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, instrument, span, warn, Level};
use vaulted_protocol::{
    Ack, AckStatus, ChunkSack, FinalStatus, HandshakeTail, HealthResponse, HealthStatus, Mode, Nack,
    ParallelAck, ParallelInitTail, ParallelJoin, ParallelStatus, ResumeAck, ResumeRequest, ResumeStatus,
    Sack, SessionId, Trailer, MAGIC_NBKP, MAGIC_PING, MAGIC_PJIN, MAGIC_RSME, PROTOCOL_VERSION,
};

use crate::config;
use crate::consts::{
    ACCEPT_BACKOFF_CAP, ACCEPT_BACKOFF_STEP, ACCEPT_BACKOFF_THRESHOLD, DEFAULT_PENDING_MEM_LIMIT,
    FIRST_STREAM_READY_TIMEOUT, GAP_CHECK_INTERVAL, GAP_TIMEOUT, IN_FLIGHT_STALL_TIMEOUT,
    PARALLEL_STREAM_READ_TIMEOUT, SACK_EVERY_BYTES, SESSION_TTL, SINGLE_STREAM_READ_TIMEOUT, TRAILER_LEN,
};
use crate::daemon::assembler::{Assembler, AssemblerConfig};
use crate::daemon::atomic_writer;
use crate::daemon::chunk_buffer::ChunkBuffer;
use crate::daemon::gap_tracker::GapTracker;
use crate::daemon::lock_table::LockTable;
use crate::daemon::retention;
use crate::daemon::session::{Common, ParallelState, Session, SingleStreamState, StreamAttachment};
use crate::daemon::storage;
use crate::daemon::ttl_reaper::{self, Registry};
use crate::errors::CoreError;
use crate::names::BackupTriple;

pub struct Server {
    registry: Arc<Registry>,
    lock_table: Arc<LockTable>,
    config: config::Manager,
    chunk_buffer: Option<Arc<ChunkBuffer>>,
}

impl Server {
    pub fn new(config: config::Manager) -> anyhow::Result<Arc<Self>> {
        let current = config.current();
        let chunk_buffer = if current.chunk_buffer.enabled() {
            let size = current.chunk_buffer.size.unwrap_or(0);
            let slots = current.chunk_buffer.channel_slots.unwrap_or_else(|| (size / (1024 * 1024)).max(2));
            let buffer = Arc::new(ChunkBuffer::new(size, current.chunk_buffer.drain_ratio(), slots));
            let drain_buffer = Arc::clone(&buffer);
            std::thread::spawn(move || drain_buffer.run_drain_loop());
            Some(buffer)
        } else {
            None
        };

        Ok(Arc::new(Server {
            registry: Arc::new(Mutex::new(HashMap::new())),
            lock_table: Arc::new(LockTable::new()),
            config,
            chunk_buffer,
        }))
    }

    pub fn chunk_buffer(&self) -> Option<Arc<ChunkBuffer>> {
        self.chunk_buffer.clone()
    }

    #[instrument(skip_all)]
    pub fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("accepting connections");

        let reaper_registry = Arc::clone(&self.registry);
        std::thread::spawn(move || ttl_reaper::run(reaper_registry));

        let mut consecutive_failures: u32 = 0;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    consecutive_failures = 0;
                    let server = Arc::clone(&self);
                    std::thread::spawn(move || {
                        if let Err(err) = server.handle_conn(stream) {
                            debug!(?peer, error = ?err, "connection handler exited with error");
                        }
                    });
                }
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(error = ?err, consecutive_failures, "accept failed");
                    if consecutive_failures > ACCEPT_BACKOFF_THRESHOLD {
                        let backoff = (ACCEPT_BACKOFF_STEP * consecutive_failures).min(ACCEPT_BACKOFF_CAP);
                        std::thread::sleep(backoff);
                    }
                }
            }
        }
    }

    #[instrument(skip_all)]
    fn handle_conn(self: Arc<Self>, mut stream: TcpStream) -> anyhow::Result<()> {
        let mut magic = [0u8; 4];
        stream.read_exact(&mut magic)?;
        match magic {
            MAGIC_PING => self.handle_ping(stream),
            MAGIC_NBKP => self.handle_new_backup(stream),
            MAGIC_RSME => self.handle_resume(stream),
            MAGIC_PJIN => self.handle_stream_join(stream),
            other => {
                debug!(magic = ?other, "unrecognized connection magic, closing");
                let _ = stream.shutdown(std::net::Shutdown::Both);
                Ok(())
            }
        }
    }

    fn handle_ping(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let response = HealthResponse { status: HealthStatus::Ready, free_bytes: free_bytes_hint() };
        response.write_to(&mut stream)?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn handle_new_backup(self: Arc<Self>, mut stream: TcpStream) -> anyhow::Result<()> {
        let ack = span!(Level::INFO, "1_handshake(new)").in_scope(|| self.try_handshake(&mut stream));
        let (ack, opened) = match ack {
            Ok(opened) => (Ack { status: AckStatus::Go, session_id: opened.session_id, message: String::new() }, Some(opened)),
            Err(err) => {
                let core_err = err.downcast_ref::<CoreError>();
                let status = core_err.map(|e| e.ack_status()).unwrap_or(AckStatus::Reject);
                (Ack { status, session_id: SessionId::ZERO, message: err.to_string() }, None)
            }
        };
        ack.write_to(&mut stream)?;

        let Some(opened) = opened else { return Ok(()) };

        match opened.mode {
            Mode::Single => self.run_single_stream(stream, opened.session),
            Mode::Parallel { .. } => self.run_parallel_opener(stream, opened.session),
        }
    }

    fn try_handshake(self: &Arc<Self>, stream: &mut TcpStream) -> anyhow::Result<OpenedSession> {
        let tail = HandshakeTail::read_from(stream)?;
        if tail.version != PROTOCOL_VERSION {
            return Err(CoreError::Framing(format!("unsupported protocol version {}", tail.version)).into());
        }

        let config = self.config.current();
        let storage = config
            .storage(&tail.storage_name)
            .ok_or_else(|| CoreError::StorageNotFound(tail.storage_name.clone()))?
            .clone();

        let triple = BackupTriple::new(tail.agent_name.clone(), tail.storage_name.clone(), tail.backup_name.clone())
            .ok_or(CoreError::NameValidation)?;

        let guard =
            span!(Level::INFO, "1_lock(triple)").in_scope(|| self.lock_table.try_claim(triple.clone()))
                .ok_or(CoreError::CapacityConflict)?;

        let mode = Mode::read_from(stream)?;
        let base_dir = PathBuf::from(&storage.base_dir);
        let backup_dir = storage::backup_dir(&base_dir, &triple.agent_name, &triple.backup_name);
        let session_id = SessionId(*uuid::Uuid::new_v4().as_bytes());
        let common = Common::new(session_id, triple, backup_dir, guard);

        let session = match mode {
            Mode::Single => {
                let (file, tmp_path) =
                    span!(Level::INFO, "2_open(tmp)").in_scope(|| {
                        atomic_writer::create_tmp(&common.base_dir, &storage::single_stream_tmp_name(&session_id.to_string()))
                    })?;
                drop(file);
                Arc::new(Session::Single {
                    common,
                    state: SingleStreamState { tmp_path, bytes_written: AtomicU64::new(0) },
                })
            }
            Mode::Parallel { max_streams } => {
                let init = ParallelInitTail::read_from(stream)?;
                let out_path = common.base_dir.join(storage::parallel_output_tmp_name(&session_id.to_string()));
                let staging_root = storage::staging_root(&common.base_dir, &session_id.to_string());
                let assembler = span!(Level::INFO, "2_open(assembler)").in_scope(|| {
                    Assembler::new(
                        out_path,
                        staging_root,
                        AssemblerConfig {
                            mode: storage.assembler_mode(),
                            pending_mem_limit: storage.assembler_pending_mem_limit.unwrap_or(DEFAULT_PENDING_MEM_LIMIT),
                            shard_levels: storage.chunk_shard_levels(),
                            fsync_staging: storage.chunk_fsync(),
                        },
                    )
                })?;
                let gap_tracker = if config.gap_detection.enabled() {
                    Some(Arc::new(GapTracker::new(
                        config.gap_detection.timeout_ms.map(Duration::from_millis).unwrap_or(GAP_TIMEOUT),
                        config
                            .gap_detection
                            .in_flight_timeout_ms
                            .map(Duration::from_millis)
                            .unwrap_or(IN_FLIGHT_STALL_TIMEOUT),
                        config.gap_detection.max_nacks_per_cycle.unwrap_or(16),
                    )))
                } else {
                    None
                };
                Arc::new(Session::Parallel {
                    common,
                    state: ParallelState {
                        assembler: Arc::new(assembler),
                        max_streams,
                        chunk_size: init.chunk_size,
                        first_stream_ready: crate::daemon::ready_signal::ReadySignal::new(),
                        closing: AtomicBool::new(false),
                        streams: Mutex::new(HashMap::new()),
                        barrier: crate::daemon::session::CompletionBarrier::new(),
                        gap_tracker,
                    },
                })
            }
        };

        self.registry.lock().unwrap().insert(session_id, Arc::clone(&session));

        if let Session::Parallel { state, .. } = &*session {
            if let Some(tracker) = state.gap_tracker.clone() {
                let check_interval = config
                    .gap_detection
                    .check_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(GAP_CHECK_INTERVAL);
                self.spawn_gap_checker(&session, tracker, check_interval);
            }
        }

        Ok(OpenedSession { session_id, mode, session })
    }

    fn spawn_gap_checker(self: &Arc<Self>, session: &Arc<Session>, tracker: Arc<GapTracker>, check_interval: Duration) {
        let weak: Weak<Session> = Arc::downgrade(session);
        std::thread::spawn(move || loop {
            std::thread::sleep(check_interval);
            let Some(session) = weak.upgrade() else { return };
            let Session::Parallel { state, .. } = &*session else { return };
            if state.closing.load(Ordering::SeqCst) {
                return;
            }
            for seq in tracker.check_gaps() {
                let max_streams = state.max_streams.max(1) as u32;
                let target_index = (seq % max_streams) as u8;
                let mut streams = state.streams.lock().unwrap();
                if let Some(att) = streams.get_mut(&target_index) {
                    if let Ok(mut writer) = att.conn.try_clone() {
                        if Nack { global_seq: seq }.write_to(&mut writer).is_ok() {
                            tracker.mark_notified(seq);
                        }
                    }
                }
            }
        });
    }

    #[instrument(skip_all)]
    fn run_single_stream(&self, mut stream: TcpStream, session: Arc<Session>) -> anyhow::Result<()> {
        let Session::Single { common, state } = &*session else { unreachable!() };
        stream.set_read_timeout(Some(SINGLE_STREAM_READ_TIMEOUT))?;

        let mut file = std::fs::OpenOptions::new().append(true).open(&state.tmp_path)?;
        let mut since_last_sack: u64 = 0;
        let mut buf = [0u8; 64 * 1024];

        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    file.write_all(&buf[..n])?;
                    let total = state.bytes_written.fetch_add(n as u64, Ordering::SeqCst) + n as u64;
                    common.touch(Instant::now());
                    since_last_sack += n as u64;
                    if since_last_sack >= SACK_EVERY_BYTES {
                        file.flush()?;
                        if Sack { offset: total }.write_to(&mut stream).is_err() {
                            warn!("writing sack failed, continuing");
                        }
                        since_last_sack = 0;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut => {
                    debug!(session_id = %common.session_id, "single-stream read timed out, awaiting resume");
                    return Ok(());
                }
                Err(err) => {
                    debug!(session_id = %common.session_id, error = ?err, "single-stream read error, awaiting resume");
                    return Ok(());
                }
            }
        }

        drop(file);
        let final_status = self.commit_single(common, state);
        let _ = FinalStatus::write_to(&final_status, &mut stream);
        self.registry.lock().unwrap().remove(&common.session_id);
        Ok(())
    }

    #[instrument(skip_all)]
    fn commit_single(&self, common: &Common, state: &SingleStreamState) -> FinalStatus {
        match self.try_commit_single(common, state) {
            Ok(()) => FinalStatus::Ok,
            Err(err) => {
                warn!(session_id = %common.session_id, error = ?err, "single-stream commit failed");
                let _ = std::fs::remove_file(&state.tmp_path);
                err.final_status()
            }
        }
    }

    fn try_commit_single(&self, common: &Common, state: &SingleStreamState) -> Result<(), CoreError> {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&state.tmp_path)
            .map_err(CoreError::StorageIo)?;
        let total_size = file.metadata().map_err(CoreError::StorageIo)?.len();
        if total_size < TRAILER_LEN {
            return Err(CoreError::Framing("temp file too small to contain a trailer".into()));
        }
        let content_size = total_size - TRAILER_LEN;

        file.seek(SeekFrom::Start(content_size)).map_err(CoreError::StorageIo)?;
        let trailer = Trailer::read_from(&mut file)
            .map_err(|e| CoreError::Framing(format!("reading embedded trailer: {e}")))?;

        file.set_len(content_size).map_err(CoreError::StorageIo)?;
        file.seek(SeekFrom::Start(0)).map_err(CoreError::StorageIo)?;

        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut remaining = content_size;
        while remaining > 0 {
            let to_read = remaining.min(buf.len() as u64) as usize;
            file.read_exact(&mut buf[..to_read]).map_err(CoreError::StorageIo)?;
            hasher.update(&buf[..to_read]);
            remaining -= to_read as u64;
        }
        let computed: [u8; 32] = hasher.finalize().into();
        drop(file);

        if computed != trailer.checksum || content_size != trailer.size {
            return Err(CoreError::ChecksumMismatch {
                expected: hex_string(&trailer.checksum),
                computed: hex_string(&computed),
            });
        }

        let config = self.config.current();
        let storage = config.storage(&common.triple.storage_name);
        let ext = storage.map(|s| s.extension()).unwrap_or("tar.gz");
        let max_backups = storage.map(|s| s.max_backups()).unwrap_or(crate::consts::DEFAULT_MAX_BACKUPS);

        atomic_writer::commit(&state.tmp_path, &common.base_dir, &storage::archive_name(ext)).map_err(CoreError::StorageIo)?;
        retention::rotate(&common.base_dir, max_backups);
        Ok(())
    }

    #[instrument(skip_all)]
    fn run_parallel_opener(&self, mut stream: TcpStream, session: Arc<Session>) -> anyhow::Result<()> {
        let Session::Parallel { common, state } = &*session else { unreachable!() };

        let ready = state.first_stream_ready.wait(FIRST_STREAM_READY_TIMEOUT);
        if !ready {
            let _ = FinalStatus::write_to(&FinalStatus::WriteError, &mut stream);
            self.abort_parallel(common, state);
            return Ok(());
        }

        if !state.barrier.wait_all_timeout(SESSION_TTL) {
            warn!(session_id = %common.session_id, "parallel streams never reached a clean end of stream");
            let _ = FinalStatus::write_to(&FinalStatus::WriteError, &mut stream);
            self.abort_parallel(common, state);
            self.registry.lock().unwrap().remove(&common.session_id);
            return Ok(());
        }
        state.closing.store(true, Ordering::SeqCst);

        let trailer = Trailer::read_from(&mut stream);
        let final_status = match trailer {
            Ok(trailer) => self.commit_parallel(common, state, &trailer),
            Err(err) => {
                warn!(session_id = %common.session_id, error = ?err, "failed reading parallel trailer");
                self.abort_parallel(common, state);
                FinalStatus::WriteError
            }
        };
        let _ = FinalStatus::write_to(&final_status, &mut stream);
        self.registry.lock().unwrap().remove(&common.session_id);
        Ok(())
    }

    fn abort_parallel(&self, common: &Common, state: &ParallelState) {
        state.assembler.cleanup();
        let _ = common;
    }

    #[instrument(skip_all)]
    fn commit_parallel(&self, common: &Common, state: &ParallelState, trailer: &Trailer) -> FinalStatus {
        if let Some(buffer) = &self.chunk_buffer {
            if let Err(err) = buffer.flush(&state.assembler) {
                error!(session_id = %common.session_id, error = ?err, "flushing chunk buffer before finalize");
                return FinalStatus::WriteError;
            }
        }

        let (out_path, total_bytes, checksum) = match state.assembler.finalize() {
            Ok(result) => result,
            Err(err) => {
                error!(session_id = %common.session_id, error = ?err, "finalizing assembler");
                state.assembler.cleanup();
                return err.final_status();
            }
        };

        if checksum != trailer.checksum || total_bytes != trailer.size {
            let _ = std::fs::remove_file(&out_path);
            return FinalStatus::ChecksumMismatch;
        }

        let config = self.config.current();
        let storage = config.storage(&common.triple.storage_name);
        let ext = storage.map(|s| s.extension()).unwrap_or("tar.gz");
        let max_backups = storage.map(|s| s.max_backups()).unwrap_or(crate::consts::DEFAULT_MAX_BACKUPS);

        match atomic_writer::commit(&out_path, &common.base_dir, &storage::archive_name(ext)) {
            Ok(_) => {
                retention::rotate(&common.base_dir, max_backups);
                FinalStatus::Ok
            }
            Err(err) => {
                error!(session_id = %common.session_id, error = ?err, "renaming assembled output into place");
                FinalStatus::WriteError
            }
        }
    }

    #[instrument(skip_all)]
    fn handle_resume(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let req = ResumeRequest::read_from(&mut stream)?;
        let session = self.registry.lock().unwrap().get(&req.session_id).cloned();

        let Some(session) = session else {
            ResumeAck { status: ResumeStatus::NotFound, last_offset: 0 }.write_to(&mut stream)?;
            return Ok(());
        };
        let Session::Single { common, state } = &*session else {
            ResumeAck { status: ResumeStatus::NotFound, last_offset: 0 }.write_to(&mut stream)?;
            return Ok(());
        };
        if common.triple.agent_name != req.agent_name || common.triple.storage_name != req.storage_name {
            ResumeAck { status: ResumeStatus::NotFound, last_offset: 0 }.write_to(&mut stream)?;
            return Ok(());
        }

        let last_offset = state.bytes_written.load(Ordering::SeqCst);
        ResumeAck { status: ResumeStatus::Ok, last_offset }.write_to(&mut stream)?;
        self.run_single_stream(stream, session)
    }

    #[instrument(skip_all)]
    fn handle_stream_join(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let join = ParallelJoin::read_from(&mut stream)?;

        let session = self.registry.lock().unwrap().get(&join.session_id).cloned();
        let Some(session) = session else {
            ParallelAck { status: ParallelStatus::NotFound, last_offset: 0 }.write_to(&mut stream)?;
            return Ok(());
        };
        let Session::Parallel { common, state } = &*session else {
            ParallelAck { status: ParallelStatus::NotFound, last_offset: 0 }.write_to(&mut stream)?;
            return Ok(());
        };
        if state.closing.load(Ordering::SeqCst) {
            ParallelAck { status: ParallelStatus::NotFound, last_offset: 0 }.write_to(&mut stream)?;
            return Ok(());
        }
        if join.stream_index as u32 >= state.max_streams as u32 {
            ParallelAck { status: ParallelStatus::Full, last_offset: 0 }.write_to(&mut stream)?;
            return Ok(());
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let (is_first_attach, completed_bytes) = {
            let mut streams = state.streams.lock().unwrap();
            let is_first_attach = !streams.contains_key(&join.stream_index);
            let completed_bytes = if let Some(existing) = streams.get(&join.stream_index) {
                existing.cancel.store(true, Ordering::SeqCst);
                let _ = existing.conn.shutdown(std::net::Shutdown::Both);
                existing.completed_bytes
            } else {
                0
            };
            let reconnect_count = streams.get(&join.stream_index).map(|a| a.reconnect_count + 1).unwrap_or(0);
            let conn_for_gap = stream.try_clone()?;
            streams.insert(
                join.stream_index,
                StreamAttachment {
                    conn: conn_for_gap,
                    cancel: Arc::clone(&cancel),
                    completed_bytes,
                    reconnect_count,
                    window_start: Instant::now(),
                    window_bytes: 0,
                    last_rotation: None,
                },
            );
            (is_first_attach, completed_bytes)
        };

        if is_first_attach {
            state.barrier.add_first_attach();
        }
        state.first_stream_ready.fire();
        common.touch(Instant::now());

        ParallelAck { status: ParallelStatus::Ok, last_offset: completed_bytes }.write_to(&mut stream)?;

        self.run_stream_receiver(Arc::clone(&session), join.stream_index, stream, cancel)
    }

    #[instrument(skip_all)]
    fn run_stream_receiver(
        &self,
        session: Arc<Session>,
        stream_index: u8,
        mut conn: TcpStream,
        cancel: Arc<AtomicBool>,
    ) -> anyhow::Result<()> {
        let Session::Parallel { common, state } = &*session else { return Ok(()) };
        conn.set_read_timeout(Some(PARALLEL_STREAM_READ_TIMEOUT))?;
        let flow_rotation = self.config.current().flow_rotation.clone();

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Ok(());
            }

            let header = match vaulted_protocol::ChunkHeader::read_from(&mut conn) {
                Ok(h) => h,
                Err(err) if is_eof(&err) => {
                    // A re-join shuts down the superseded connection to unblock
                    // its read; that shutdown surfaces here as UnexpectedEof
                    // too, but it is not a clean end-of-stream and must not
                    // release the completion barrier out from under the
                    // stream that replaced it.
                    if cancel.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    state.barrier.mark_done();
                    return Ok(());
                }
                Err(err) => {
                    debug!(stream_index, error = ?err, "stream receiver read error, awaiting re-join");
                    return Ok(());
                }
            };
            if let Err(err) = header.validate() {
                warn!(stream_index, error = ?err, "framing fault on parallel stream");
                return Ok(());
            }

            if let Some(tracker) = &state.gap_tracker {
                tracker.start_chunk(header.global_seq);
            }

            let mut payload = vec![0u8; header.length as usize];
            if let Err(err) = conn.read_exact(&mut payload) {
                debug!(stream_index, error = ?err, "payload read error, awaiting re-join");
                return Ok(());
            }
            if let Some(tracker) = &state.gap_tracker {
                tracker.advance_chunk(header.global_seq);
            }

            let write_result = if let Some(buffer) = &self.chunk_buffer {
                if let Some(tracker) = &state.gap_tracker {
                    tracker.mark_buffered(header.global_seq);
                }
                buffer.push(header.global_seq, payload, &state.assembler, state.gap_tracker.clone())
            } else {
                let result = state.assembler.write_chunk_bytes(header.global_seq, payload);
                if result.is_ok() {
                    if let Some(tracker) = &state.gap_tracker {
                        tracker.complete_chunk(header.global_seq);
                    }
                }
                result
            };
            if let Err(err) = write_result {
                error!(stream_index, error = ?err, "writing chunk");
                return Ok(());
            }

            let completed = {
                let mut streams = state.streams.lock().unwrap();
                let Some(att) = streams.get_mut(&stream_index) else { return Ok(()) };
                att.completed_bytes += header.length as u64;
                att.window_bytes += header.length as u64;
                att.completed_bytes
            };
            common.touch(Instant::now());

            let sack = ChunkSack { stream_index, local_seq: header.global_seq, completed_bytes: completed };
            if sack.write_to(&mut conn).is_err() {
                warn!(stream_index, "writing chunk sack failed, continuing");
            }

            if flow_rotation.enabled() {
                if self.check_flow_rotation(state, stream_index, &flow_rotation) {
                    let _ = conn.shutdown(std::net::Shutdown::Both);
                    return Ok(());
                }
            }
        }
    }

    fn check_flow_rotation(&self, state: &ParallelState, stream_index: u8, cfg: &config::FlowRotationConfig) -> bool {
        let eval_window = Duration::from_millis(cfg.eval_window_ms.unwrap_or(10_000));
        let cooldown = Duration::from_millis(cfg.cooldown_ms.unwrap_or(60_000));
        let min_mbps = cfg.min_mbps.unwrap_or(0.0);
        let now = Instant::now();

        let mut streams = state.streams.lock().unwrap();
        let Some(att) = streams.get_mut(&stream_index) else { return false };
        let elapsed = now.saturating_duration_since(att.window_start);
        if elapsed < eval_window {
            return false;
        }
        let mbps = (att.window_bytes as f64 * 8.0) / elapsed.as_secs_f64() / 1_000_000.0;
        att.window_start = now;
        att.window_bytes = 0;

        if mbps >= min_mbps {
            return false;
        }
        if let Some(last) = att.last_rotation {
            if now.saturating_duration_since(last) < cooldown {
                return false;
            }
        }
        att.last_rotation = Some(now);
        warn!(stream_index, mbps, "rotating slow parallel stream");
        true
    }
}

struct OpenedSession {
    session_id: SessionId,
    mode: Mode,
    session: Arc<Session>,
}

fn is_eof(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::UnexpectedEof
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn free_bytes_hint() -> u64 {
    use std::mem::MaybeUninit;
    unsafe {
        let path = std::ffi::CString::new(".").unwrap();
        let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
        if libc::statvfs(path.as_ptr(), stat.as_mut_ptr()) != 0 {
            return 0;
        }
        let stat = stat.assume_init();
        (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn free_bytes_hint_is_nonzero_on_a_real_filesystem() {
        assert!(free_bytes_hint() > 0);
    }
}
