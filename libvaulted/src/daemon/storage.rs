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

//! Path helpers for the persisted state layout described in the wire
//! protocol's external interfaces.

use std::path::{Path, PathBuf};

use chrono::Utc;

pub fn backup_dir(base_dir: &Path, agent_name: &str, backup_name: &str) -> PathBuf {
    base_dir.join(agent_name).join(backup_name)
}

/// `<YYYY-MM-DDTHH-MM-SS-mmm>.<ext>`, lexicographically ordered the same
/// as chronologically.
pub fn archive_name(ext: &str) -> String {
    format!("{}.{}", Utc::now().format("%Y-%m-%dT%H-%M-%S-%3f"), ext)
}

pub fn single_stream_tmp_name(session_id: &str) -> String {
    format!("backup-{session_id}.tmp")
}

pub fn parallel_output_tmp_name(session_id: &str) -> String {
    format!("assembled_{session_id}.tmp")
}

pub fn staging_root(backup_dir: &Path, session_id: &str) -> PathBuf {
    backup_dir.join(format!("chunks_{session_id}"))
}

/// Shard-addressed staging path for a chunk at `seq`, per the configured
/// fan-out level.
pub fn chunk_staging_path(staging_root: &Path, seq: u32, shard_levels: u8) -> PathBuf {
    use crate::consts::SHARD_FANOUT;

    let level0 = seq % SHARD_FANOUT;
    let mut path = staging_root.join(format!("{level0:02x}"));
    if shard_levels == 2 {
        let level1 = (seq / SHARD_FANOUT) % SHARD_FANOUT;
        path = path.join(format!("{level1:02x}"));
    }
    path.join(format!("chunk_{seq:010}.tmp"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shard_path_one_level() {
        let root = PathBuf::from("/tmp/chunks_abc");
        let p = chunk_staging_path(&root, 300, 1);
        assert_eq!(p, PathBuf::from("/tmp/chunks_abc/2c/chunk_0000000300.tmp"));
    }

    #[test]
    fn shard_path_two_levels() {
        let root = PathBuf::from("/tmp/chunks_abc");
        let p = chunk_staging_path(&root, 300, 2);
        assert_eq!(p, PathBuf::from("/tmp/chunks_abc/2c/00/chunk_0000000300.tmp"));
    }

    #[test]
    fn archive_name_has_extension() {
        let name = archive_name("tar.gz");
        assert!(name.ends_with(".tar.gz"));
    }
}
