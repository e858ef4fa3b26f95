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

//! The closed error taxonomy a handshake/receive handler matches on to
//! pick an ACK status. Everything off that path (config loading,
//! retention, background tasks) uses `anyhow::Result` instead.

use vaulted_protocol::{AckStatus, FinalStatus};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("malformed frame: {0}")]
    Framing(String),

    #[error("invalid name component in backup triple")]
    NameValidation,

    #[error("backup triple already locked by another session")]
    CapacityConflict,

    #[error("unknown storage {0:?}")]
    StorageNotFound(String),

    #[error("transient network error: {0}")]
    TransientIo(#[source] std::io::Error),

    #[error("storage I/O failure: {0}")]
    StorageIo(#[source] std::io::Error),

    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("assembler invariant violated: missing chunk seq {0} at finalize")]
    MissingChunkAtFinalize(u32),
}

impl CoreError {
    /// The handshake-time ACK status this error maps to. Only meaningful
    /// for the subset of variants that can occur before `GO`.
    pub fn ack_status(&self) -> AckStatus {
        match self {
            CoreError::NameValidation => AckStatus::Reject,
            CoreError::CapacityConflict => AckStatus::Busy,
            CoreError::StorageNotFound(_) => AckStatus::StorageNotFound,
            _ => AckStatus::Reject,
        }
    }

    /// The final-ACK status this error maps to, for errors that surface at
    /// commit time.
    pub fn final_status(&self) -> FinalStatus {
        match self {
            CoreError::ChecksumMismatch { .. } => FinalStatus::ChecksumMismatch,
            CoreError::StorageIo(_) | CoreError::MissingChunkAtFinalize(_) => FinalStatus::WriteError,
            _ => FinalStatus::WriteError,
        }
    }
}
