// src/master/throttle.rs

//! Leading-edge poke coalescing.
//!
//! The first poke of a window drains immediately. A target poked again
//! within the window is dropped (it was already forwarded); targets not yet
//! seen this window accumulate and are drained once at the window boundary.
//! Net effect: at most one forward per target per window, and every poke is
//! forwarded within at most one window.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// What the caller should do with a batch of poked targets.
#[derive(Debug, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Forward these targets right now.
    DrainNow(Vec<String>),
    /// Arrange one call to `take_scheduled` after this delay.
    Scheduled(Duration),
    /// Someone else already owns the pending batch.
    Coalesced,
}

#[derive(Debug, Default)]
struct ThrottleState {
    window_start: Option<Instant>,
    /// Targets already forwarded in the current window.
    sent: HashSet<String>,
    /// Targets waiting for the trailing drain.
    pending: HashSet<String>,
    drain_scheduled: bool,
}

#[derive(Debug)]
pub struct PokeThrottle {
    window: Duration,
    state: Mutex<ThrottleState>,
}

impl PokeThrottle {
    pub fn new(window: Duration) -> Self {
        Self { window, state: Mutex::new(ThrottleState::default()) }
    }

    pub fn submit<I>(&self, targets: I) -> ThrottleDecision
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        if let Some(window_start) = state.window_start {
            if now.duration_since(window_start) >= self.window && !state.drain_scheduled {
                state.window_start = None;
                state.sent.clear();
            }
        }

        for target in targets {
            if !state.sent.contains(&target) {
                state.pending.insert(target);
            }
        }
        if state.pending.is_empty() {
            return ThrottleDecision::Coalesced;
        }

        match state.window_start {
            None => {
                state.window_start = Some(now);
                let batch: Vec<String> = state.pending.drain().collect();
                state.sent.extend(batch.iter().cloned());
                ThrottleDecision::DrainNow(batch)
            }
            Some(window_start) => {
                if state.drain_scheduled {
                    ThrottleDecision::Coalesced
                } else {
                    state.drain_scheduled = true;
                    let elapsed = now.duration_since(window_start);
                    ThrottleDecision::Scheduled(self.window.saturating_sub(elapsed))
                }
            }
        }
    }

    /// Collect the trailing batch; opens a fresh window.
    pub fn take_scheduled(&self) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        state.drain_scheduled = false;
        state.window_start = Some(Instant::now());
        state.sent.clear();
        let batch: Vec<String> = state.pending.drain().collect();
        state.sent.extend(batch.iter().cloned());
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_poke_drains_immediately() {
        let throttle = PokeThrottle::new(Duration::from_millis(100));
        match throttle.submit(names(&["x"])) {
            ThrottleDecision::DrainNow(batch) => assert_eq!(batch, names(&["x"])),
            other => panic!("expected immediate drain, got {other:?}"),
        }
    }

    #[test]
    fn test_repeats_within_window_coalesce_to_one_forward() {
        let throttle = PokeThrottle::new(Duration::from_secs(60));
        assert!(matches!(throttle.submit(names(&["x"])), ThrottleDecision::DrainNow(_)));

        for _ in 0..10 {
            assert_eq!(
                throttle.submit(names(&["x"])),
                ThrottleDecision::Coalesced,
                "a target already forwarded this window must not forward again"
            );
        }
    }

    #[test]
    fn test_new_target_in_window_gets_trailing_drain() {
        let throttle = PokeThrottle::new(Duration::from_secs(60));
        assert!(matches!(throttle.submit(names(&["x"])), ThrottleDecision::DrainNow(_)));

        match throttle.submit(names(&["y"])) {
            ThrottleDecision::Scheduled(delay) => assert!(delay <= Duration::from_secs(60)),
            other => panic!("expected a scheduled drain, got {other:?}"),
        }
        // Further new targets ride along with the scheduled drain.
        assert_eq!(throttle.submit(names(&["z"])), ThrottleDecision::Coalesced);

        let mut batch = throttle.take_scheduled();
        batch.sort();
        assert_eq!(batch, names(&["y", "z"]));
    }

    #[test]
    fn test_window_expiry_resets_leading_edge() {
        let throttle = PokeThrottle::new(Duration::from_millis(20));
        assert!(matches!(throttle.submit(names(&["x"])), ThrottleDecision::DrainNow(_)));

        std::thread::sleep(Duration::from_millis(30));
        match throttle.submit(names(&["x"])) {
            ThrottleDecision::DrainNow(batch) => assert_eq!(batch, names(&["x"])),
            other => panic!("a new window should drain immediately, got {other:?}"),
        }
    }

    #[test]
    fn test_trailing_batch_opens_new_window() {
        let throttle = PokeThrottle::new(Duration::from_secs(60));
        assert!(matches!(throttle.submit(names(&["x"])), ThrottleDecision::DrainNow(_)));
        assert!(matches!(throttle.submit(names(&["y"])), ThrottleDecision::Scheduled(_)));

        assert_eq!(throttle.take_scheduled(), names(&["y"]));
        assert_eq!(
            throttle.submit(names(&["y"])),
            ThrottleDecision::Coalesced,
            "the trailing drain starts a window covering its targets"
        );
    }
}
