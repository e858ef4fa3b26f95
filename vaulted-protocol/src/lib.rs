//! vaulted-protocol defines the wire framing used between backup agents
//! and the vaulted daemon.
//!
//! Every frame is written with explicit big-endian integers rather than a
//! general purpose serialization format, because the layouts are small,
//! fixed, and need to line up byte for byte with what agents in other
//! languages produce. See the `*Ext` traits below for the actual
//! read/write implementations.

use std::io::{self, Read, Write};

use anyhow::{anyhow, Context as _};
use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};

/// Connections open with one of these four bytes, which the dispatcher uses
/// to pick a handler. Any other value is logged and the connection is
/// closed.
pub const MAGIC_PING: [u8; 4] = *b"PING";
pub const MAGIC_NBKP: [u8; 4] = *b"NBKP";
pub const MAGIC_RSME: [u8; 4] = *b"RSME";
pub const MAGIC_PJIN: [u8; 4] = *b"PJIN";
/// Reserved for a future retention-rotation control channel. The
/// dispatcher does not wire this up yet; it falls through to the
/// "log and close" arm like any other unrecognized magic.
pub const MAGIC_CROT: [u8; 4] = *b"CROT";

/// Sub-frame magics, used inside the body of a connection that has
/// already been dispatched.
const MAGIC_SACK: u32 = 0x5341434b; // "SACK"
const MAGIC_CHUNK_SACK: u32 = 0x4353434b; // "CSCK"
const MAGIC_TRAILER: u32 = 0x54524c52; // "TRLR"
const MAGIC_NACK: u32 = 0x4e41434b; // "NACK"

/// The maximum length of a single chunk payload: twice the largest chunk
/// size an agent is allowed to configure.
pub const MAX_CHUNK_LEN: u32 = 32 * 1024 * 1024;

/// A 128-bit session identifier, assigned by the server at handshake time.
/// UUIDv4-shaped, but vaulted-protocol doesn't depend on the uuid crate so
/// that agents in other languages aren't forced to pull it in too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    pub const ZERO: SessionId = SessionId([0u8; 16]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; 16];
        r.read_exact(&mut buf)?;
        Ok(SessionId(buf))
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.0)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Statuses for the handshake ACK written in response to `NBKP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Go,
    Reject,
    Busy,
    StorageNotFound,
}

impl AckStatus {
    fn to_u8(self) -> u8 {
        match self {
            AckStatus::Go => 1,
            AckStatus::Reject => 2,
            AckStatus::Busy => 3,
            AckStatus::StorageNotFound => 4,
        }
    }

    fn from_u8(v: u8) -> anyhow::Result<Self> {
        Ok(match v {
            1 => AckStatus::Go,
            2 => AckStatus::Reject,
            3 => AckStatus::Busy,
            4 => AckStatus::StorageNotFound,
            other => return Err(anyhow!("unknown ack status byte: {}", other)),
        })
    }
}

/// The reply to a `NBKP` handshake.
#[derive(Debug, Clone)]
pub struct Ack {
    pub status: AckStatus,
    /// Zeroed if not applicable (e.g. on REJECT).
    pub session_id: SessionId,
    pub message: String,
}

impl Ack {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.status.to_u8())?;
        self.session_id.write_to(w)?;
        let msg_bytes = self.message.as_bytes();
        w.write_u16::<BigEndian>(msg_bytes.len() as u16)?;
        w.write_all(msg_bytes)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let status = AckStatus::from_u8(r.read_u8().context("reading ack status")?)?;
        let session_id = SessionId::read_from(r).context("reading ack session id")?;
        let msg_len = r.read_u16::<BigEndian>().context("reading ack message length")?;
        let mut msg_buf = vec![0u8; msg_len as usize];
        r.read_exact(&mut msg_buf).context("reading ack message")?;
        let message = String::from_utf8_lossy(&msg_buf).into_owned();
        Ok(Ack { status, session_id, message })
    }
}

/// The `{agent, storage, backup}` fields that follow the version byte in a
/// `NBKP` handshake. Each field is terminated with a single `\n`.
#[derive(Debug, Clone)]
pub struct HandshakeTail {
    pub version: u8,
    pub agent_name: String,
    pub storage_name: String,
    pub backup_name: String,
}

/// The protocol version this build of vaulted-protocol speaks. The server
/// rejects any handshake whose version byte doesn't match.
pub const PROTOCOL_VERSION: u8 = 1;

impl HandshakeTail {
    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let version = r.read_u8().context("reading handshake version")?;
        let agent_name = read_line(r).context("reading agent_name")?;
        let storage_name = read_line(r).context("reading storage_name")?;
        let backup_name = read_line(r).context("reading backup_name")?;
        Ok(HandshakeTail { version, agent_name, storage_name, backup_name })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.version)?;
        write_line(w, &self.agent_name)?;
        write_line(w, &self.storage_name)?;
        write_line(w, &self.backup_name)?;
        Ok(())
    }
}

/// The mode byte that follows a handshake: `0x00` for single-stream, or
/// `1..=255` to request parallel mode with that many streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Single,
    Parallel { max_streams: u8 },
}

impl Mode {
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let b = r.read_u8()?;
        Ok(if b == 0 { Mode::Single } else { Mode::Parallel { max_streams: b } })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Mode::Single => w.write_u8(0),
            Mode::Parallel { max_streams } => w.write_u8(*max_streams),
        }
    }
}

/// Follows the mode byte when entering parallel mode.
#[derive(Debug, Clone, Copy)]
pub struct ParallelInitTail {
    pub chunk_size: u32,
}

impl ParallelInitTail {
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(ParallelInitTail { chunk_size: r.read_u32::<BigEndian>()? })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BigEndian>(self.chunk_size)
    }
}

/// Precedes a chunk's payload on a parallel stream.
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    pub global_seq: u32,
    pub length: u32,
}

impl ChunkHeader {
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let global_seq = r.read_u32::<BigEndian>()?;
        let length = r.read_u32::<BigEndian>()?;
        Ok(ChunkHeader { global_seq, length })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BigEndian>(self.global_seq)?;
        w.write_u32::<BigEndian>(self.length)
    }

    /// `0 < length <= MAX_CHUNK_LEN`. Anything else is a framing fault.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.length == 0 || self.length > MAX_CHUNK_LEN {
            return Err(anyhow!(
                "chunk length {} out of bounds (0, {}]",
                self.length,
                MAX_CHUNK_LEN
            ));
        }
        Ok(())
    }
}

/// Single-stream cumulative-bytes acknowledgment.
#[derive(Debug, Clone, Copy)]
pub struct Sack {
    pub offset: u64,
}

impl Sack {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BigEndian>(MAGIC_SACK)?;
        w.write_u64::<BigEndian>(self.offset)
    }

    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let magic = r.read_u32::<BigEndian>().context("reading sack magic")?;
        if magic != MAGIC_SACK {
            return Err(anyhow!("bad sack magic: {:#x}", magic));
        }
        Ok(Sack { offset: r.read_u64::<BigEndian>().context("reading sack offset")? })
    }
}

/// Per-chunk acknowledgment sent on a parallel stream.
#[derive(Debug, Clone, Copy)]
pub struct ChunkSack {
    pub stream_index: u8,
    pub local_seq: u32,
    pub completed_bytes: u64,
}

impl ChunkSack {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BigEndian>(MAGIC_CHUNK_SACK)?;
        w.write_u8(self.stream_index)?;
        w.write_u32::<BigEndian>(self.local_seq)?;
        w.write_u64::<BigEndian>(self.completed_bytes)
    }

    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let magic = r.read_u32::<BigEndian>().context("reading chunk sack magic")?;
        if magic != MAGIC_CHUNK_SACK {
            return Err(anyhow!("bad chunk sack magic: {:#x}", magic));
        }
        Ok(ChunkSack {
            stream_index: r.read_u8().context("reading stream_index")?,
            local_seq: r.read_u32::<BigEndian>().context("reading local_seq")?,
            completed_bytes: r.read_u64::<BigEndian>().context("reading completed_bytes")?,
        })
    }
}

/// The end-of-transfer trailer: checksum plus total size.
#[derive(Debug, Clone)]
pub struct Trailer {
    pub checksum: [u8; 32],
    pub size: u64,
}

/// The serialized byte length of a `Trailer` frame, used by the
/// single-stream commit path to find the trailer at the tail of a temp
/// file: `magic(4) + checksum(32) + size(8)`.
pub const TRAILER_LEN: u64 = 4 + 32 + 8;

impl Trailer {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BigEndian>(MAGIC_TRAILER)?;
        w.write_all(&self.checksum)?;
        w.write_u64::<BigEndian>(self.size)
    }

    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let magic = r.read_u32::<BigEndian>().context("reading trailer magic")?;
        if magic != MAGIC_TRAILER {
            return Err(anyhow!("bad trailer magic: {:#x}", magic));
        }
        let mut checksum = [0u8; 32];
        r.read_exact(&mut checksum).context("reading trailer checksum")?;
        let size = r.read_u64::<BigEndian>().context("reading trailer size")?;
        Ok(Trailer { checksum, size })
    }
}

/// The terminal status of a commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    Ok,
    ChecksumMismatch,
    WriteError,
}

impl FinalStatus {
    fn to_u8(self) -> u8 {
        match self {
            FinalStatus::Ok => 1,
            FinalStatus::ChecksumMismatch => 2,
            FinalStatus::WriteError => 3,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.to_u8())
    }

    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        Ok(match r.read_u8().context("reading final status")? {
            1 => FinalStatus::Ok,
            2 => FinalStatus::ChecksumMismatch,
            3 => FinalStatus::WriteError,
            other => return Err(anyhow!("unknown final status byte: {}", other)),
        })
    }
}

/// Request body following `RSME`.
#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub session_id: SessionId,
    pub agent_name: String,
    pub storage_name: String,
}

impl ResumeRequest {
    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let session_id = SessionId::read_from(r).context("reading resume session id")?;
        let agent_name = read_line(r).context("reading resume agent_name")?;
        let storage_name = read_line(r).context("reading resume storage_name")?;
        Ok(ResumeRequest { session_id, agent_name, storage_name })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.session_id.write_to(w)?;
        write_line(w, &self.agent_name)?;
        write_line(w, &self.storage_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStatus {
    Ok,
    NotFound,
}

#[derive(Debug, Clone, Copy)]
pub struct ResumeAck {
    pub status: ResumeStatus,
    pub last_offset: u64,
}

impl ResumeAck {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let status = match self.status {
            ResumeStatus::Ok => 1u8,
            ResumeStatus::NotFound => 2u8,
        };
        w.write_u8(status)?;
        w.write_u64::<BigEndian>(self.last_offset)
    }

    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let status = match r.read_u8().context("reading resume ack status")? {
            1 => ResumeStatus::Ok,
            2 => ResumeStatus::NotFound,
            other => return Err(anyhow!("unknown resume status byte: {}", other)),
        };
        let last_offset = r.read_u64::<BigEndian>().context("reading resume last_offset")?;
        Ok(ResumeAck { status, last_offset })
    }
}

/// Request body following `PJIN`.
#[derive(Debug, Clone, Copy)]
pub struct ParallelJoin {
    pub session_id: SessionId,
    pub stream_index: u8,
}

impl ParallelJoin {
    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let session_id = SessionId::read_from(r).context("reading join session id")?;
        let stream_index = r.read_u8().context("reading join stream_index")?;
        Ok(ParallelJoin { session_id, stream_index })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.session_id.write_to(w)?;
        w.write_u8(self.stream_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelStatus {
    Ok,
    NotFound,
    Full,
}

#[derive(Debug, Clone, Copy)]
pub struct ParallelAck {
    pub status: ParallelStatus,
    pub last_offset: u64,
}

impl ParallelAck {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let status = match self.status {
            ParallelStatus::Ok => 1u8,
            ParallelStatus::NotFound => 2u8,
            ParallelStatus::Full => 3u8,
        };
        w.write_u8(status)?;
        w.write_u64::<BigEndian>(self.last_offset)
    }

    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let status = match r.read_u8().context("reading parallel ack status")? {
            1 => ParallelStatus::Ok,
            2 => ParallelStatus::NotFound,
            3 => ParallelStatus::Full,
            other => return Err(anyhow!("unknown parallel status byte: {}", other)),
        };
        let last_offset = r.read_u64::<BigEndian>().context("reading parallel last_offset")?;
        Ok(ParallelAck { status, last_offset })
    }
}

/// A server request to retransmit a specific `global_seq`.
#[derive(Debug, Clone, Copy)]
pub struct Nack {
    pub global_seq: u32,
}

impl Nack {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BigEndian>(MAGIC_NACK)?;
        w.write_u32::<BigEndian>(self.global_seq)
    }

    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let magic = r.read_u32::<BigEndian>().context("reading nack magic")?;
        if magic != MAGIC_NACK {
            return Err(anyhow!("bad nack magic: {:#x}", magic));
        }
        Ok(Nack { global_seq: r.read_u32::<BigEndian>().context("reading nack global_seq")? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ready,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub free_bytes: u64,
}

impl HealthResponse {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(1)?; // READY=1, the only status currently defined
        w.write_u64::<BigEndian>(self.free_bytes)
    }

    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let status = match r.read_u8().context("reading health status")? {
            1 => HealthStatus::Ready,
            other => return Err(anyhow!("unknown health status byte: {}", other)),
        };
        let free_bytes = r.read_u64::<BigEndian>().context("reading health free_bytes")?;
        Ok(HealthResponse { status, free_bytes })
    }
}

fn read_line<R: Read>(r: &mut R) -> anyhow::Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        r.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > 4096 {
            return Err(anyhow!("line exceeds 4096 bytes without a terminator"));
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn write_line<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_all(s.as_bytes())?;
    w.write_all(b"\n")
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn ack_round_trip() {
        let cases = vec![
            Ack { status: AckStatus::Go, session_id: SessionId([7u8; 16]), message: String::new() },
            Ack {
                status: AckStatus::Reject,
                session_id: SessionId::ZERO,
                message: String::from("bad agent name"),
            },
        ];
        for c in cases {
            let mut buf = Cursor::new(Vec::new());
            c.write_to(&mut buf).expect("write");
            buf.set_position(0);
            let got = Ack::read_from(&mut buf).expect("read");
            assert_eq!(got.status, c.status);
            assert_eq!(got.session_id, c.session_id);
            assert_eq!(got.message, c.message);
        }
    }

    #[test]
    fn handshake_tail_round_trip() {
        let tail = HandshakeTail {
            version: PROTOCOL_VERSION,
            agent_name: String::from("web-01"),
            storage_name: String::from("primary"),
            backup_name: String::from("nightly"),
        };
        let mut buf = Cursor::new(Vec::new());
        tail.write_to(&mut buf).expect("write");
        buf.set_position(0);
        let got = HandshakeTail::read_from(&mut buf).expect("read");
        assert_eq!(got.version, tail.version);
        assert_eq!(got.agent_name, tail.agent_name);
        assert_eq!(got.storage_name, tail.storage_name);
        assert_eq!(got.backup_name, tail.backup_name);
    }

    #[test]
    fn chunk_header_validates_length() {
        assert!(ChunkHeader { global_seq: 0, length: 0 }.validate().is_err());
        assert!(ChunkHeader { global_seq: 0, length: MAX_CHUNK_LEN + 1 }.validate().is_err());
        assert!(ChunkHeader { global_seq: 0, length: MAX_CHUNK_LEN }.validate().is_ok());
        assert!(ChunkHeader { global_seq: 0, length: 1 }.validate().is_ok());
    }

    #[test]
    fn mode_byte_round_trip() {
        for case in [Mode::Single, Mode::Parallel { max_streams: 1 }, Mode::Parallel { max_streams: 255 }]
        {
            let mut buf = Cursor::new(Vec::new());
            case.write_to(&mut buf).expect("write");
            buf.set_position(0);
            assert_eq!(Mode::read_from(&mut buf).expect("read"), case);
        }
    }

    #[test]
    fn trailer_round_trip() {
        let trailer = Trailer { checksum: [9u8; 32], size: 123456 };
        let mut buf = Cursor::new(Vec::new());
        trailer.write_to(&mut buf).expect("write");
        assert_eq!(buf.get_ref().len() as u64, TRAILER_LEN);
        buf.set_position(0);
        let got = Trailer::read_from(&mut buf).expect("read");
        assert_eq!(got.checksum, trailer.checksum);
        assert_eq!(got.size, trailer.size);
    }

    #[test]
    fn sack_rejects_bad_magic() {
        let mut buf = Cursor::new(vec![0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(Sack::read_from(&mut buf).is_err());
    }
}
