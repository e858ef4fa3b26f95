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

//! Validation for the components of a backup-triple: `agent_name`,
//! `storage_name`, `backup_name`.

use crate::consts::MAX_NAME_LEN;

pub fn validate_component(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    if name == "." || name == ".." {
        return false;
    }
    if name.starts_with('.') {
        return false;
    }
    if name.contains('/') || name.contains('\\') {
        return false;
    }
    if name.contains('\0') {
        return false;
    }
    true
}

/// The `(agent_name, storage_name, backup_name)` identity of a logical
/// backup target. Doubles as the single-writer lock key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupTriple {
    pub agent_name: String,
    pub storage_name: String,
    pub backup_name: String,
}

impl BackupTriple {
    pub fn new(agent_name: String, storage_name: String, backup_name: String) -> Option<Self> {
        if !validate_component(&agent_name)
            || !validate_component(&storage_name)
            || !validate_component(&backup_name)
        {
            return None;
        }
        Some(BackupTriple { agent_name, storage_name, backup_name })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accepts_ordinary_names() {
        assert!(validate_component("web-01"));
        assert!(validate_component("nightly_backup"));
        assert!(validate_component("a"));
    }

    #[test]
    fn rejects_path_traversal() {
        assert!(!validate_component(".."));
        assert!(!validate_component("."));
        assert!(!validate_component("../etc"));
        assert!(!validate_component("foo/bar"));
        assert!(!validate_component("foo\\bar"));
    }

    #[test]
    fn rejects_leading_dot_and_nul() {
        assert!(!validate_component(".hidden"));
        assert!(!validate_component("foo\0bar"));
    }

    #[test]
    fn rejects_empty_and_overlong() {
        assert!(!validate_component(""));
        let long = "a".repeat(256);
        assert!(!validate_component(&long));
        let ok = "a".repeat(255);
        assert!(validate_component(&ok));
    }

    #[test]
    fn triple_construction_fails_closed() {
        assert!(BackupTriple::new("a".into(), "b".into(), "..".into()).is_none());
        assert!(BackupTriple::new("a".into(), "b".into(), "c".into()).is_some());
    }
}
