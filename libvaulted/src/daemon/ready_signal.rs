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

//! The "first-stream-ready" one-shot signal a parallel session's opener
//! waits on before it starts the stream-completion barrier.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug)]
pub struct ReadySignal {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        ReadySignal { fired: Mutex::new(false), cond: Condvar::new() }
    }

    /// Fire the signal. Idempotent: subsequent calls are no-ops.
    pub fn fire(&self) {
        let mut fired = self.fired.lock().unwrap();
        if !*fired {
            *fired = true;
            self.cond.notify_all();
        }
    }

    /// Block until fired or `timeout` elapses. Returns whether it fired.
    pub fn wait(&self, timeout: Duration) -> bool {
        let fired = self.fired.lock().unwrap();
        if *fired {
            return true;
        }
        let (fired, wait_res) = self.cond.wait_timeout_while(fired, timeout, |f| !*f).unwrap();
        !wait_res.timed_out() || *fired
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fires_before_wait() {
        let signal = ReadySignal::new();
        signal.fire();
        assert!(signal.wait(Duration::from_millis(10)));
    }

    #[test]
    fn times_out_without_fire() {
        let signal = ReadySignal::new();
        assert!(!signal.wait(Duration::from_millis(10)));
    }

    #[test]
    fn fires_from_another_thread() {
        let signal = Arc::new(ReadySignal::new());
        let signal2 = Arc::clone(&signal);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            signal2.fire();
        });
        assert!(signal.wait(Duration::from_secs(5)));
    }
}
