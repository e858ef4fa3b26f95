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

use std::time::Duration;

pub const SINGLE_STREAM_READ_TIMEOUT: Duration = Duration::from_secs(90);
pub const PARALLEL_STREAM_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const SACK_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const FIRST_STREAM_READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const BUFFER_PUSH_TIMEOUT: Duration = Duration::from_secs(5);
pub const BUFFER_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60);
pub const TTL_REAPER_TICK: Duration = Duration::from_secs(5 * 60);
pub const GAP_TIMEOUT: Duration = Duration::from_secs(60);
pub const IN_FLIGHT_STALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const GAP_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub const SACK_EVERY_BYTES: u64 = 64 * 1024 * 1024;

pub const MAX_CHUNK_LEN: u32 = vaulted_protocol::MAX_CHUNK_LEN;

pub const DEFAULT_MAX_BACKUPS: usize = 5;
pub const DEFAULT_PENDING_MEM_LIMIT: usize = 8 * 1024 * 1024;
pub const DEFAULT_CHUNK_SHARD_LEVELS: u8 = 1;
pub const DEFAULT_DRAIN_RATIO: f64 = 0.5;
pub const SHARD_FANOUT: u32 = 256;

pub const TRAILER_LEN: u64 = vaulted_protocol::TRAILER_LEN;

/// Maximum length of a single backup-triple name component.
pub const MAX_NAME_LEN: usize = 255;

/// Accept-loop backoff ceiling; grows linearly by 100ms per consecutive
/// failure up to this cap.
pub const ACCEPT_BACKOFF_CAP: Duration = Duration::from_secs(5);
pub const ACCEPT_BACKOFF_STEP: Duration = Duration::from_millis(100);
pub const ACCEPT_BACKOFF_THRESHOLD: u32 = 5;
