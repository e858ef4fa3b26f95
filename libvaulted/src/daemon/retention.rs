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

//! Prunes the oldest archives past `max_backups` in a backup directory.
//! Rotation failure is logged, never fatal to the commit that triggered it.

use std::fs;
use std::path::Path;

use tracing::warn;

pub fn rotate(dir: &Path, max_backups: usize) {
    if let Err(err) = try_rotate(dir, max_backups) {
        warn!("retention rotation failed for {}: {:?}", dir.display(), err);
    }
}

fn try_rotate(dir: &Path, max_backups: usize) -> anyhow::Result<()> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| !name.ends_with(".tmp"))
        .collect();
    // Filename lexicographic order equals chronological order.
    names.sort();

    if names.len() <= max_backups {
        return Ok(());
    }
    let to_remove = names.len() - max_backups;
    for name in names.into_iter().take(to_remove) {
        fs::remove_file(dir.join(&name))?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::File;

    #[test]
    fn keeps_only_newest_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        let names =
            ["2024-01-01T00-00-00-000.tar.gz", "2024-01-02T00-00-00-000.tar.gz", "2024-01-03T00-00-00-000.tar.gz"];
        for name in names {
            File::create(tmp.path().join(name)).unwrap();
        }
        rotate(tmp.path(), 2);

        let remaining: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().into_string().unwrap())
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(!remaining.contains(&"2024-01-01T00-00-00-000.tar.gz".to_string()));
    }

    #[test]
    fn ignores_tmp_files() {
        let tmp = tempfile::tempdir().unwrap();
        File::create(tmp.path().join("backup-x.tmp")).unwrap();
        File::create(tmp.path().join("2024-01-01T00-00-00-000.tar.gz")).unwrap();
        rotate(tmp.path(), 0);

        let remaining: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().into_string().unwrap())
            .collect();
        assert_eq!(remaining, vec!["backup-x.tmp".to_string()]);
    }

    #[test]
    fn no_op_under_the_limit() {
        let tmp = tempfile::tempdir().unwrap();
        File::create(tmp.path().join("2024-01-01T00-00-00-000.tar.gz")).unwrap();
        rotate(tmp.path(), 5);
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);
    }
}
