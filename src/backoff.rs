// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::config::Config;
use crate::{Error, Result};

use log::trace;

use std::time::{Duration, Instant};

const FIRST_ATTEMPT: u32 = 2;

/// Sleep schedule growing with the natural log of the attempt number.
///
/// The n-th wait is `ln(n + 1)` seconds, so a poller never sleeps for long
/// but still backs off from a shared filesystem over time.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    cap: Option<Duration>,
}

impl Backoff {
    pub fn new(cap: Option<Duration>) -> Self {
        Self {
            attempt: FIRST_ATTEMPT,
            cap,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_secs_f64(f64::from(self.attempt).ln());
        self.attempt = self.attempt.saturating_add(1);
        match self.cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

/// How barrier participants poll shared state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSettings {
    /// Upper bound for a single sleep.
    pub cap: Option<Duration>,
    /// Give up after this long. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl PollSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cap: config.backoff_cap,
            timeout: config.barrier_timeout,
        }
    }

    /// Calls `check` until it reports done, sleeping on the backoff schedule
    /// in between. `check` returns the observed count and whether the wait
    /// is over.
    pub fn poll_until<F>(&self, name: &str, expected: usize, mut check: F) -> Result<()>
    where
        F: FnMut() -> Result<(usize, bool)>,
    {
        let start = Instant::now();
        let mut backoff = Backoff::new(self.cap);
        loop {
            let (observed, done) = check()?;
            if done {
                return Ok(());
            }
            if let Some(timeout) = self.timeout {
                if start.elapsed() >= timeout {
                    return Err(Error::BarrierTimeout {
                        name: name.to_string(),
                        observed,
                        expected,
                    });
                }
            }
            let delay = backoff.next_delay();
            trace!(
                "{}: {} of {} after attempt {}, sleeping {:?}",
                name,
                observed,
                expected,
                backoff.attempt() - 1,
                delay
            );
            std::thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logarithmic_schedule() {
        let mut backoff = Backoff::new(None);
        let delays: Vec<Duration> = (0..5).map(|_| backoff.next_delay()).collect();
        let expected = [2f64, 3., 4., 5., 6.].map(|n| Duration::from_secs_f64(n.ln()));
        assert_eq!(delays, expected);
    }

    #[test]
    fn schedule_never_decreases() {
        let mut backoff = Backoff::new(None);
        let mut last = Duration::ZERO;
        for _ in 0..10_000 {
            let d = backoff.next_delay();
            assert!(d >= last);
            last = d;
        }
    }

    #[test]
    fn cap_bounds_each_sleep() {
        let mut backoff = Backoff::new(Some(Duration::from_millis(5)));
        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_millis(5));
        }
    }

    #[test]
    fn poll_stops_when_done() {
        let settings = PollSettings {
            cap: Some(Duration::from_millis(1)),
            timeout: None,
        };
        let mut calls = 0;
        settings
            .poll_until("test", 3, || {
                calls += 1;
                Ok((calls, calls == 3))
            })
            .unwrap();
        assert_eq!(calls, 3);
    }

    #[test]
    fn poll_times_out() {
        let settings = PollSettings {
            cap: Some(Duration::from_millis(1)),
            timeout: Some(Duration::from_millis(20)),
        };
        let err = settings
            .poll_until("stuck", 2, || Ok((1, false)))
            .unwrap_err();
        match err {
            Error::BarrierTimeout {
                name,
                observed,
                expected,
            } => {
                assert_eq!(name, "stuck");
                assert_eq!(observed, 1);
                assert_eq!(expected, 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn check_errors_propagate() {
        let settings = PollSettings::default();
        let err = settings
            .poll_until("broken", 1, || Err(std::io::Error::other("gone").into()))
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
