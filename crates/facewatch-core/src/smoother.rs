//! Majority-vote smoothing over the most recent recognitions.
//!
//! One window smooths the whole recognition stream, not one identity.
//! Unknown observations take part in the vote like any other claim.

use crate::types::{Claim, IdentityId, Observation};
use serde::Deserialize;
use std::collections::VecDeque;

pub const DEFAULT_WINDOW_CAPACITY: usize = 10;
pub const DEFAULT_MIN_OBSERVATIONS: usize = 5;
pub const DEFAULT_MAJORITY_SHARE: f32 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SmootherConfig {
    pub window_capacity: usize,
    /// Below this many buffered observations the latest one passes through.
    pub min_observations: usize,
    /// The mode must hold strictly more than this share of the window.
    pub majority_share: f32,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            min_observations: DEFAULT_MIN_OBSERVATIONS,
            majority_share: DEFAULT_MAJORITY_SHARE,
        }
    }
}

/// Fixed-capacity FIFO of observations; the oldest is evicted first.
#[derive(Debug, Clone)]
pub struct SmoothingWindow {
    capacity: usize,
    buf: VecDeque<Observation>,
}

impl SmoothingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buf: VecDeque::with_capacity(capacity),
        }
    }

    /// Append `obs`, returning the evicted observation if the window was full.
    pub fn push(&mut self, obs: Observation) -> Option<Observation> {
        let evicted = if self.buf.len() == self.capacity {
            self.buf.pop_front()
        } else {
            None
        };
        self.buf.push_back(obs);
        evicted
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.buf.iter()
    }

    pub fn latest(&self) -> Option<&Observation> {
        self.buf.back()
    }
}

/// Outcome of one smoothing step.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The window holds a clear majority: its claim with the mean of its confidences.
    Stable(Observation),
    /// Cold start or no clear majority: the latest raw observation.
    PassThrough(Observation),
}

impl Decision {
    pub fn observation(&self) -> &Observation {
        match self {
            Decision::Stable(obs) | Decision::PassThrough(obs) => obs,
        }
    }

    pub fn is_stable(&self) -> bool {
        matches!(self, Decision::Stable(_))
    }
}

#[derive(PartialEq, Eq)]
enum VoteKey {
    Known(IdentityId),
    Unknown,
}

impl VoteKey {
    fn of(claim: &Claim) -> Self {
        match claim {
            Claim::Known(identity) => VoteKey::Known(identity.id),
            Claim::Unknown => VoteKey::Unknown,
        }
    }
}

struct Tally<'a> {
    key: VoteKey,
    claim: &'a Claim,
    count: usize,
    confidence_sum: f64,
}

/// Decide what to emit for the current window contents.
///
/// Returns `None` only for an empty window. Among claims sharing the highest
/// count, the one whose first occurrence is oldest wins.
pub fn decide(window: &SmoothingWindow, config: &SmootherConfig) -> Option<Decision> {
    let latest = window.latest()?.clone();
    if window.len() < config.min_observations {
        return Some(Decision::PassThrough(latest));
    }

    // Tallies stay in first-occurrence order.
    let mut tallies: Vec<Tally<'_>> = Vec::new();
    for obs in window.iter() {
        let key = VoteKey::of(&obs.claim);
        match tallies.iter_mut().find(|t| t.key == key) {
            Some(t) => {
                t.count += 1;
                t.confidence_sum += obs.confidence as f64;
            }
            None => tallies.push(Tally {
                key,
                claim: &obs.claim,
                count: 1,
                confidence_sum: obs.confidence as f64,
            }),
        }
    }

    let mut mode: Option<&Tally<'_>> = None;
    for t in &tallies {
        if mode.map_or(true, |m| t.count > m.count) {
            mode = Some(t);
        }
    }
    let mode = mode?;

    let share = mode.count as f32 / window.len() as f32;
    if share > config.majority_share {
        let mean = mode.confidence_sum / mode.count as f64;
        Some(Decision::Stable(Observation {
            claim: mode.claim.clone(),
            confidence: mean as f32,
        }))
    } else {
        Some(Decision::PassThrough(latest))
    }
}

/// Owns one smoothing window and applies [`decide`] after every push.
#[derive(Debug, Clone)]
pub struct TemporalSmoother {
    config: SmootherConfig,
    window: SmoothingWindow,
}

impl Default for TemporalSmoother {
    fn default() -> Self {
        Self::new(SmootherConfig::default())
    }
}

impl TemporalSmoother {
    pub fn new(config: SmootherConfig) -> Self {
        Self {
            window: SmoothingWindow::new(config.window_capacity),
            config,
        }
    }

    pub fn observe(&mut self, obs: Observation) -> Decision {
        let fallback = obs.clone();
        self.window.push(obs);
        decide(&self.window, &self.config).unwrap_or(Decision::PassThrough(fallback))
    }

    pub fn window(&self) -> &SmoothingWindow {
        &self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identity;

    fn person(id: i64, name: &str) -> Identity {
        Identity { id: IdentityId(id), name: name.into() }
    }

    fn a(conf: f32) -> Observation {
        Observation::known(person(1, "A"), conf)
    }

    fn b(conf: f32) -> Observation {
        Observation::known(person(2, "B"), conf)
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut w = SmoothingWindow::new(3);
        assert!(w.push(a(1.0)).is_none());
        w.push(a(2.0));
        w.push(a(3.0));
        let evicted = w.push(a(4.0)).unwrap();
        assert_eq!(evicted.confidence, 1.0);
        assert_eq!(w.len(), 3);
        let kept: Vec<f32> = w.iter().map(|o| o.confidence).collect();
        assert_eq!(kept, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_cold_start_passes_through() {
        let mut s = TemporalSmoother::default();
        for (i, conf) in [70.0, 71.0, 72.0, 73.0].into_iter().enumerate() {
            let d = s.observe(a(conf));
            assert_eq!(d, Decision::PassThrough(a(conf)), "step {i}");
        }
        let fifth = s.observe(a(74.0));
        assert!(fifth.is_stable());
        assert!((fifth.observation().confidence - 72.0).abs() < 1e-4);
    }

    #[test]
    fn test_majority_mean() {
        let mut s = TemporalSmoother::default();
        let mut last = None;
        for obs in [a(90.0), a(80.0), b(70.0), a(85.0), a(95.0)] {
            last = Some(s.observe(obs));
        }
        let last = last.unwrap();
        assert!(last.is_stable());
        assert_eq!(last.observation().claim, Claim::Known(person(1, "A")));
        assert!((last.observation().confidence - 87.5).abs() < 1e-4);
    }

    #[test]
    fn test_no_majority_passes_latest() {
        let mut s = TemporalSmoother::default();
        let c = |conf| Observation::known(person(3, "C"), conf);
        let d = |conf| Observation::known(person(4, "D"), conf);
        for obs in [a(90.0), b(80.0), c(70.0), d(60.0)] {
            s.observe(obs);
        }
        // Each claim holds 1/5 or 2/5 of the window; 40% is not enough.
        let out = s.observe(a(50.0));
        assert_eq!(out, Decision::PassThrough(a(50.0)));
    }

    #[test]
    fn test_tie_prefers_first_seen() {
        let config = SmootherConfig { majority_share: 0.3, ..SmootherConfig::default() };
        let mut s = TemporalSmoother::new(config);
        for obs in [b(60.0), a(90.0), b(70.0), a(80.0), Observation::unknown(10.0), a(85.0), b(65.0)] {
            s.observe(obs);
        }
        // A and B both hold 3 of 8; B appeared first.
        let out = s.observe(Observation::unknown(20.0));
        assert!(out.is_stable());
        assert_eq!(out.observation().claim, Claim::Known(person(2, "B")));
        assert!((out.observation().confidence - 65.0).abs() < 1e-4);
    }

    #[test]
    fn test_unknown_majority_is_stable_unknown() {
        let mut s = TemporalSmoother::default();
        for conf in [10.0, 20.0, 30.0, 40.0] {
            s.observe(Observation::unknown(conf));
        }
        let out = s.observe(a(90.0));
        assert!(out.is_stable());
        assert_eq!(out.observation().claim, Claim::Unknown);
        assert!((out.observation().confidence - 25.0).abs() < 1e-4);
    }

    #[test]
    fn test_window_slides_past_old_majority() {
        let mut s = TemporalSmoother::default();
        for _ in 0..10 {
            s.observe(a(90.0));
        }
        for _ in 0..6 {
            s.observe(b(70.0));
        }
        // Window is now 4 x A, 6 x B.
        let out = s.observe(b(72.0));
        assert_eq!(s.window().len(), 10);
        assert!(out.is_stable());
        assert_eq!(out.observation().claim, Claim::Known(person(2, "B")));
    }

    #[test]
    fn test_same_id_is_one_claim() {
        let mut s = TemporalSmoother::default();
        let renamed = |conf| Observation::known(person(1, "A (renamed)"), conf);
        for obs in [a(80.0), renamed(80.0), a(80.0), renamed(80.0), b(80.0)] {
            s.observe(obs);
        }
        assert_eq!(s.window().len(), 5);
        let out = decide(s.window(), &SmootherConfig::default()).unwrap();
        assert!(out.is_stable());
        assert_eq!(out.observation().claim.identity().map(|i| i.id), Some(IdentityId(1)));
    }

    #[test]
    fn test_empty_window_has_no_decision() {
        let w = SmoothingWindow::new(10);
        assert!(decide(&w, &SmootherConfig::default()).is_none());
    }
}
