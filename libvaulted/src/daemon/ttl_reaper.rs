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

//! A background tick that reaps sessions that have gone idle past their
//! TTL: any stream that hasn't made progress in an hour is assumed dead
//! and its staging state is discarded so disk doesn't fill up with
//! abandoned partial transfers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::info;
use vaulted_protocol::SessionId;

use crate::consts::{SESSION_TTL, TTL_REAPER_TICK};
use crate::daemon::session::Session;

pub type Registry = Mutex<HashMap<SessionId, Arc<Session>>>;

pub fn run(registry: Arc<Registry>) {
    loop {
        std::thread::sleep(TTL_REAPER_TICK);
        reap_once(&registry, Instant::now());
    }
}

fn reap_once(registry: &Registry, now: Instant) {
    let expired: Vec<(SessionId, Arc<Session>)> = {
        let map = registry.lock().unwrap();
        map.iter()
            .filter(|(_, session)| session.idle_for(now) >= SESSION_TTL)
            .map(|(id, session)| (*id, Arc::clone(session)))
            .collect()
    };

    for (id, session) in expired {
        info!(session_id = %id, "reaping idle session past its TTL");
        registry.lock().unwrap().remove(&id);
        match &*session {
            Session::Single { state, .. } => {
                let _ = std::fs::remove_file(&state.tmp_path);
            }
            Session::Parallel { state, .. } => {
                state.assembler.cleanup();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::daemon::lock_table::LockTable;
    use crate::daemon::session::{Common, SingleStreamState};
    use crate::names::BackupTriple;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[test]
    fn reaps_only_sessions_past_ttl() {
        let table = Arc::new(LockTable::new());
        let triple_a = BackupTriple::new("a".into(), "s".into(), "b1".into()).unwrap();
        let triple_b = BackupTriple::new("a".into(), "s".into(), "b2".into()).unwrap();
        let guard_a = table.try_claim(triple_a.clone()).unwrap();
        let guard_b = table.try_claim(triple_b.clone()).unwrap();

        let fresh = Arc::new(Session::Single {
            common: Common::new(SessionId([1; 16]), triple_a, PathBuf::from("/tmp"), guard_a),
            state: SingleStreamState { tmp_path: PathBuf::from("/tmp/fresh.tmp"), bytes_written: AtomicU64::new(0) },
        });
        let stale_common = Common::new(SessionId([2; 16]), triple_b, PathBuf::from("/tmp"), guard_b);
        // force idle_for() past the TTL by touching far in the past relative to "now"
        let stale = Arc::new(Session::Single {
            common: stale_common,
            state: SingleStreamState { tmp_path: PathBuf::from("/tmp/stale.tmp"), bytes_written: AtomicU64::new(0) },
        });

        let far_future = Instant::now() + SESSION_TTL + Duration::from_secs(1);
        // simulate activity on `fresh` right up to the check time; `stale`
        // is left at its creation-time last_activity so it reads as idle.
        fresh.touch(far_future);

        let mut map = HashMap::new();
        map.insert(SessionId([1; 16]), fresh);
        map.insert(SessionId([2; 16]), stale);
        let registry: Registry = Mutex::new(map);

        reap_once(&registry, far_future);

        let remaining = registry.lock().unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains_key(&SessionId([1; 16])));
    }
}
