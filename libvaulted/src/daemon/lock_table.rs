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

//! The single-writer lock per backup triple. At most one active session
//! may hold a given triple at a time; held for the session's full
//! lifetime, released on commit, abort, or TTL reap.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::names::BackupTriple;

#[derive(Default)]
pub struct LockTable {
    held: Mutex<HashSet<BackupTriple>>,
}

/// RAII guard: dropping it releases the triple. Holds its own `Arc` to
/// the owning table so a session can carry the guard without borrowing
/// from the `Server` that created it.
pub struct TripleGuard {
    table: Arc<LockTable>,
    triple: BackupTriple,
}

impl Drop for TripleGuard {
    fn drop(&mut self) {
        self.table.held.lock().unwrap().remove(&self.triple);
    }
}

impl LockTable {
    pub fn new() -> Self {
        LockTable { held: Mutex::new(HashSet::new()) }
    }

    /// Attempt to claim `triple`. Returns `None` on contention.
    pub fn try_claim(self: &Arc<Self>, triple: BackupTriple) -> Option<TripleGuard> {
        let mut held = self.held.lock().unwrap();
        if held.contains(&triple) {
            return None;
        }
        held.insert(triple.clone());
        Some(TripleGuard { table: Arc::clone(self), triple })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn triple(n: &str) -> BackupTriple {
        BackupTriple::new("agent".into(), "storage".into(), n.into()).unwrap()
    }

    #[test]
    fn second_claim_fails_while_held() {
        let table = Arc::new(LockTable::new());
        let guard = table.try_claim(triple("b1")).unwrap();
        assert!(table.try_claim(triple("b1")).is_none());
        drop(guard);
        assert!(table.try_claim(triple("b1")).is_some());
    }

    #[test]
    fn distinct_triples_do_not_contend() {
        let table = Arc::new(LockTable::new());
        let _g1 = table.try_claim(triple("b1")).unwrap();
        assert!(table.try_claim(triple("b2")).is_some());
    }
}
