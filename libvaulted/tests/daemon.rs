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

//! Drives a real `Server` over loopback TCP and exercises the wire
//! protocol end to end: single-stream and parallel ingestion, checksum
//! verification, and rejoin after an abnormal disconnect.

use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use vaulted_protocol::{
    Ack, AckStatus, ChunkSack, FinalStatus, HandshakeTail, Mode, ParallelAck, ParallelInitTail,
    ParallelJoin, ParallelStatus, SessionId, Trailer, MAGIC_NBKP, MAGIC_PJIN, PROTOCOL_VERSION,
};

use libvaulted::config;
use libvaulted::Server;

fn base_config(base_dir: &std::path::Path) -> config::Config {
    let mut storage = HashMap::new();
    storage.insert(
        "storage".to_string(),
        config::StorageConfig {
            base_dir: base_dir.to_string_lossy().into_owned(),
            max_backups: None,
            assembler_mode: None,
            assembler_pending_mem_limit: None,
            compression_mode: None,
            chunk_shard_levels: None,
            chunk_fsync: None,
        },
    );
    config::Config {
        storage,
        chunk_buffer: config::ChunkBufferConfig::default(),
        gap_detection: config::GapDetectionConfig::default(),
        flow_rotation: config::FlowRotationConfig::default(),
    }
}

fn start_server(cfg: config::Config) -> (Arc<Server>, SocketAddr) {
    let manager = config::Manager::static_config(cfg);
    let server = Server::new(manager).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server_clone = Arc::clone(&server);
    std::thread::spawn(move || {
        let _ = server_clone.serve(listener);
    });
    (server, addr)
}

fn handshake(
    addr: SocketAddr,
    agent: &str,
    backup: &str,
    mode: Mode,
    chunk_size: Option<u32>,
) -> (TcpStream, SessionId) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(&MAGIC_NBKP).unwrap();
    HandshakeTail {
        version: PROTOCOL_VERSION,
        agent_name: agent.to_string(),
        storage_name: "storage".to_string(),
        backup_name: backup.to_string(),
    }
    .write_to(&mut stream)
    .unwrap();
    let ack = Ack::read_from(&mut stream).unwrap();
    assert_eq!(ack.status, AckStatus::Go, "handshake rejected: {}", ack.message);
    mode.write_to(&mut stream).unwrap();
    if let Some(chunk_size) = chunk_size {
        ParallelInitTail { chunk_size }.write_to(&mut stream).unwrap();
    }
    (stream, ack.session_id)
}

fn join_stream(addr: SocketAddr, session_id: SessionId, stream_index: u8) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(&MAGIC_PJIN).unwrap();
    ParallelJoin { session_id, stream_index }.write_to(&mut stream).unwrap();
    let ack = ParallelAck::read_from(&mut stream).unwrap();
    assert_eq!(ack.status, ParallelStatus::Ok);
    stream
}

fn send_chunk(stream: &mut TcpStream, global_seq: u32, payload: &[u8]) {
    vaulted_protocol::ChunkHeader { global_seq, length: payload.len() as u32 }.write_to(stream).unwrap();
    stream.write_all(payload).unwrap();
    ChunkSack::read_from(stream).unwrap();
}

fn checksum_of(parts: &[&[u8]]) -> ([u8; 32], u64) {
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    for p in parts {
        hasher.update(p);
        size += p.len() as u64;
    }
    (hasher.finalize().into(), size)
}

fn read_committed_archive(base_dir: &std::path::Path, agent: &str, backup: &str) -> Vec<u8> {
    let dir = base_dir.join(agent).join(backup);
    let entry = std::fs::read_dir(&dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.path().extension().map(|ext| ext == "gz").unwrap_or(false))
        .expect("no committed archive found");
    std::fs::read(entry.path()).unwrap()
}

#[test]
fn single_stream_happy_path() {
    let tmp = tempfile::tempdir().unwrap();
    let (_server, addr) = start_server(base_config(tmp.path()));

    let (mut stream, _session_id) = handshake(addr, "agent-a", "backup-a", Mode::Single, None);

    let payload = b"hello vaulted".to_vec();
    stream.write_all(&payload).unwrap();
    let (checksum, size) = checksum_of(&[&payload]);
    Trailer { checksum, size }.write_to(&mut stream).unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();

    let final_status = FinalStatus::read_from(&mut stream).unwrap();
    assert_eq!(final_status, FinalStatus::Ok);
    assert_eq!(read_committed_archive(tmp.path(), "agent-a", "backup-a"), payload);
}

#[test]
fn single_stream_checksum_mismatch_is_rejected_and_nothing_is_committed() {
    let tmp = tempfile::tempdir().unwrap();
    let (_server, addr) = start_server(base_config(tmp.path()));

    let (mut stream, _session_id) = handshake(addr, "agent-b", "backup-b", Mode::Single, None);

    let payload = b"corrupted payload".to_vec();
    stream.write_all(&payload).unwrap();
    Trailer { checksum: [0xffu8; 32], size: payload.len() as u64 }.write_to(&mut stream).unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();

    let final_status = FinalStatus::read_from(&mut stream).unwrap();
    assert_eq!(final_status, FinalStatus::ChecksumMismatch);

    let dir = tmp.path().join("agent-b").join("backup-b");
    let remaining: Vec<_> = std::fs::read_dir(&dir).map(|it| it.filter_map(|e| e.ok()).collect()).unwrap_or_default();
    assert!(remaining.is_empty(), "commit left files behind after a checksum mismatch");
}

#[test]
fn parallel_round_robin_in_order_assembles_correctly() {
    let tmp = tempfile::tempdir().unwrap();
    let (_server, addr) = start_server(base_config(tmp.path()));

    let (mut ctrl, session_id) =
        handshake(addr, "agent-c", "backup-c", Mode::Parallel { max_streams: 2 }, Some(4));

    let mut stream0 = join_stream(addr, session_id, 0);
    let mut stream1 = join_stream(addr, session_id, 1);

    send_chunk(&mut stream0, 0, b"AAAA");
    send_chunk(&mut stream1, 1, b"BBBB");
    send_chunk(&mut stream0, 2, b"CCCC");
    send_chunk(&mut stream1, 3, b"DDDD");

    stream0.shutdown(std::net::Shutdown::Both).unwrap();
    stream1.shutdown(std::net::Shutdown::Both).unwrap();

    let expected = b"AAAABBBBCCCCDDDD".to_vec();
    let (checksum, size) = checksum_of(&[&expected]);
    Trailer { checksum, size }.write_to(&mut ctrl).unwrap();

    let final_status = FinalStatus::read_from(&mut ctrl).unwrap();
    assert_eq!(final_status, FinalStatus::Ok);
    assert_eq!(read_committed_archive(tmp.path(), "agent-c", "backup-c"), expected);
}

#[test]
fn parallel_single_stream_out_of_order_chunks_reassemble_in_sequence_order() {
    let tmp = tempfile::tempdir().unwrap();
    let (_server, addr) = start_server(base_config(tmp.path()));

    let (mut ctrl, session_id) =
        handshake(addr, "agent-d", "backup-d", Mode::Parallel { max_streams: 1 }, Some(4));

    let mut stream0 = join_stream(addr, session_id, 0);
    send_chunk(&mut stream0, 1, b"BBBB");
    send_chunk(&mut stream0, 0, b"AAAA");
    send_chunk(&mut stream0, 2, b"CCCC");
    stream0.shutdown(std::net::Shutdown::Both).unwrap();

    let expected = b"AAAABBBBCCCC".to_vec();
    let (checksum, size) = checksum_of(&[&expected]);
    Trailer { checksum, size }.write_to(&mut ctrl).unwrap();

    let final_status = FinalStatus::read_from(&mut ctrl).unwrap();
    assert_eq!(final_status, FinalStatus::Ok);
    assert_eq!(read_committed_archive(tmp.path(), "agent-d", "backup-d"), expected);
}

#[test]
fn rejoining_a_stream_index_preserves_already_completed_bytes() {
    let tmp = tempfile::tempdir().unwrap();
    let (_server, addr) = start_server(base_config(tmp.path()));

    let (mut ctrl, session_id) =
        handshake(addr, "agent-e", "backup-e", Mode::Parallel { max_streams: 1 }, Some(4));

    let mut first_conn = join_stream(addr, session_id, 0);
    send_chunk(&mut first_conn, 0, b"AAAA");
    // Force an abortive close (RST) rather than a graceful FIN, so the
    // receiver sees a connection error rather than a clean end-of-stream.
    first_conn.set_linger(Some(std::time::Duration::from_secs(0))).unwrap();
    drop(first_conn);

    let mut second_conn = join_stream(addr, session_id, 0);
    send_chunk(&mut second_conn, 1, b"BBBB");
    second_conn.shutdown(std::net::Shutdown::Both).unwrap();

    let expected = b"AAAABBBB".to_vec();
    let (checksum, size) = checksum_of(&[&expected]);
    Trailer { checksum, size }.write_to(&mut ctrl).unwrap();

    let final_status = FinalStatus::read_from(&mut ctrl).unwrap();
    assert_eq!(final_status, FinalStatus::Ok);
    assert_eq!(read_committed_archive(tmp.path(), "agent-e", "backup-e"), expected);
}

#[test]
fn rejoining_a_still_connected_stream_does_not_release_its_completion_obligation() {
    let tmp = tempfile::tempdir().unwrap();
    let (_server, addr) = start_server(base_config(tmp.path()));

    let (mut ctrl, session_id) =
        handshake(addr, "agent-f", "backup-f", Mode::Parallel { max_streams: 1 }, Some(4));

    // Left connected and blocked on its next read, never closed by this
    // test: the server itself tears it down when the rejoin below arrives.
    let mut first_conn = join_stream(addr, session_id, 0);
    send_chunk(&mut first_conn, 0, b"AAAA");

    let mut second_conn = join_stream(addr, session_id, 0);
    send_chunk(&mut second_conn, 1, b"BBBB");
    second_conn.shutdown(std::net::Shutdown::Both).unwrap();

    let expected = b"AAAABBBB".to_vec();
    let (checksum, size) = checksum_of(&[&expected]);
    Trailer { checksum, size }.write_to(&mut ctrl).unwrap();

    let final_status = FinalStatus::read_from(&mut ctrl).unwrap();
    assert_eq!(final_status, FinalStatus::Ok);
    assert_eq!(read_committed_archive(tmp.path(), "agent-f", "backup-f"), expected);
}
