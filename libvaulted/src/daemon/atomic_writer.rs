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

//! Temp file + rename-on-commit per backup slot. Both the single-stream
//! and parallel receive paths funnel their finished output through this
//! so the backup directory never observes a partially-written archive.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Opens (creating parent dirs as needed) a fresh temp file at
/// `backup_dir/tmp_name` for appending.
pub fn create_tmp(backup_dir: &Path, tmp_name: &str) -> io::Result<(File, PathBuf)> {
    fs::create_dir_all(backup_dir)?;
    let path = backup_dir.join(tmp_name);
    let file = File::create(&path)?;
    Ok((file, path))
}

/// Atomically moves `tmp_path` into `backup_dir` under `final_name`.
/// `backup_dir` is created if it does not already exist (parallel
/// sessions may finalize into a directory whose single-stream sibling
/// never wrote anything).
pub fn commit(tmp_path: &Path, backup_dir: &Path, final_name: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(backup_dir)?;
    let final_path = backup_dir.join(final_name);
    fs::rename(tmp_path, &final_path)?;
    Ok(final_path)
}

/// Discards a temp file and any staging directory. Errors are returned to
/// the caller to log, not panicked on — the session's cleanup path best-
/// effort-removes whatever it finds.
pub fn abort(tmp_path: &Path, staging_dir: Option<&Path>) -> io::Result<()> {
    if tmp_path.exists() {
        fs::remove_file(tmp_path)?;
    }
    if let Some(dir) = staging_dir {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn create_commit_round_trip() {
        let tmp_root = tempfile::tempdir().unwrap();
        let backup_dir = tmp_root.path().join("agent/backup");

        let (mut file, tmp_path) = create_tmp(&backup_dir, "backup-x.tmp").unwrap();
        file.write_all(b"hello").unwrap();
        drop(file);

        let final_path = commit(&tmp_path, &backup_dir, "2024-01-01T00-00-00-000.tar.gz").unwrap();
        assert!(final_path.exists());
        assert!(!tmp_path.exists());
        assert_eq!(fs::read(&final_path).unwrap(), b"hello");
    }

    #[test]
    fn abort_removes_tmp_and_staging() {
        let tmp_root = tempfile::tempdir().unwrap();
        let backup_dir = tmp_root.path().join("agent/backup");
        let (_, tmp_path) = create_tmp(&backup_dir, "backup-x.tmp").unwrap();
        let staging = backup_dir.join("chunks_x");
        fs::create_dir_all(&staging).unwrap();

        abort(&tmp_path, Some(&staging)).unwrap();
        assert!(!tmp_path.exists());
        assert!(!staging.exists());
    }
}
