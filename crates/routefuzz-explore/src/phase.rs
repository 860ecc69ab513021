//! Phased route selection.
//!
//! ```text
//!   REPLAY ──seeds exhausted──▶ EXHAUSTIVE ──catalog exhausted──▶ RANDOM
//!     │                             │                               │
//!     └─ stop_after_replay          └─ stop_after_exhaustive        └─ never ends
//! ```
//!
//! Within every phase the current route is kept for as long as requests
//! against it make progress.

use crate::catalog::Catalog;
use crate::rng::FuzzRng;
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Seed examples, in recording order.
    Replay,
    /// Every catalog route once, in catalog order.
    Exhaustive,
    /// Uniformly random catalog routes.
    Random,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Replay => "REPLAY",
            Phase::Exhaustive => "EXHAUSTIVE",
            Phase::Random => "RANDOM",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct RouteScheduler {
    phase: Phase,
    seeds: Vec<usize>,
    route_count: usize,
    /// Position within `seeds` (replay) or the catalog (exhaustive).
    cursor: usize,
    current: Option<usize>,
    skip_current: bool,
    stop_after_replay: bool,
    stop_after_exhaustive: bool,
    finished: bool,
}

impl RouteScheduler {
    pub fn new(catalog: &Catalog, stop_after_replay: bool, stop_after_exhaustive: bool) -> Self {
        let phase = if catalog.seeds.is_empty() {
            Phase::Exhaustive
        } else {
            Phase::Replay
        };
        Self {
            phase,
            seeds: catalog.seeds.clone(),
            route_count: catalog.len(),
            cursor: 0,
            current: None,
            skip_current: false,
            stop_after_replay,
            stop_after_exhaustive,
            finished: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Leave the current route on the next call even if it made progress.
    pub fn force_next_route(&mut self) {
        self.skip_current = true;
    }

    /// Index of the route to request next, `None` once a configured stop
    /// point is reached.
    pub fn next_route(&mut self, progress: bool, rng: &mut FuzzRng) -> Option<usize> {
        if self.finished || self.route_count == 0 {
            return None;
        }
        let skip = std::mem::take(&mut self.skip_current);
        if let Some(current) = self.current {
            if progress && !skip {
                return Some(current);
            }
        }

        loop {
            match self.phase {
                Phase::Replay => {
                    if let Some(&idx) = self.seeds.get(self.cursor) {
                        self.cursor += 1;
                        return self.select(idx);
                    }
                    if self.stop_after_replay {
                        return self.finish();
                    }
                    self.enter(Phase::Exhaustive);
                }
                Phase::Exhaustive => {
                    if self.cursor < self.route_count {
                        let idx = self.cursor;
                        self.cursor += 1;
                        return self.select(idx);
                    }
                    if self.stop_after_exhaustive {
                        return self.finish();
                    }
                    self.enter(Phase::Random);
                }
                Phase::Random => {
                    let idx = rng.gen_range(0..self.route_count);
                    return self.select(idx);
                }
            }
        }
    }

    fn select(&mut self, idx: usize) -> Option<usize> {
        self.current = Some(idx);
        Some(idx)
    }

    fn enter(&mut self, phase: Phase) {
        info!("{} phase done, entering {}", self.phase, phase);
        self.phase = phase;
        self.cursor = 0;
    }

    fn finish(&mut self) -> Option<usize> {
        info!("{} phase done, stopping", self.phase);
        self.finished = true;
        self.current = None;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Route;

    fn posts_catalog() -> Catalog {
        Catalog::new(
            vec![Route::new("GET", "/posts"), Route::new("POST", "/posts")],
            Vec::new(),
            &[],
        )
    }

    fn seeded_catalog() -> Catalog {
        Catalog::new(
            vec![Route::new("GET", "/posts"), Route::new("POST", "/posts")],
            vec![Route::new("POST", "/posts")],
            &[],
        )
    }

    #[test]
    fn test_exhaustive_then_random_never_ends() {
        let mut rng = FuzzRng::from_seed(0);
        let mut sched = RouteScheduler::new(&posts_catalog(), false, false);
        assert_eq!(sched.phase(), Phase::Exhaustive);
        assert_eq!(sched.next_route(false, &mut rng), Some(0));
        assert_eq!(sched.next_route(false, &mut rng), Some(1));
        for _ in 0..200 {
            let idx = sched.next_route(false, &mut rng);
            assert!(matches!(idx, Some(0) | Some(1)));
            assert_eq!(sched.phase(), Phase::Random);
        }
    }

    #[test]
    fn test_replay_first_when_seeded() {
        let mut rng = FuzzRng::from_seed(0);
        let mut sched = RouteScheduler::new(&seeded_catalog(), false, false);
        assert_eq!(sched.phase(), Phase::Replay);
        assert_eq!(sched.next_route(false, &mut rng), Some(1));
        assert_eq!(sched.next_route(false, &mut rng), Some(0));
        assert_eq!(sched.phase(), Phase::Exhaustive);
        assert_eq!(sched.next_route(false, &mut rng), Some(1));
    }

    #[test]
    fn test_progress_keeps_route() {
        let mut rng = FuzzRng::from_seed(0);
        let mut sched = RouteScheduler::new(&posts_catalog(), false, false);
        assert_eq!(sched.next_route(false, &mut rng), Some(0));
        assert_eq!(sched.next_route(true, &mut rng), Some(0));
        assert_eq!(sched.next_route(true, &mut rng), Some(0));
        sched.force_next_route();
        assert_eq!(sched.next_route(true, &mut rng), Some(1));
    }

    #[test]
    fn test_stop_points() {
        let mut rng = FuzzRng::from_seed(0);
        let mut sched = RouteScheduler::new(&seeded_catalog(), true, false);
        assert_eq!(sched.next_route(false, &mut rng), Some(1));
        assert_eq!(sched.next_route(false, &mut rng), None);
        assert_eq!(sched.next_route(true, &mut rng), None);

        let mut sched = RouteScheduler::new(&posts_catalog(), false, true);
        assert_eq!(sched.next_route(false, &mut rng), Some(0));
        assert_eq!(sched.next_route(false, &mut rng), Some(1));
        assert_eq!(sched.next_route(false, &mut rng), None);
    }

    #[test]
    fn test_empty_catalog() {
        let mut rng = FuzzRng::from_seed(0);
        let mut sched = RouteScheduler::new(&Catalog::default(), false, false);
        assert_eq!(sched.next_route(false, &mut rng), None);
    }

    #[test]
    fn test_random_choice_is_seeded() {
        let picks = |seed| {
            let mut rng = FuzzRng::from_seed(seed);
            let mut sched = RouteScheduler::new(&posts_catalog(), false, false);
            (0..20)
                .map(|_| sched.next_route(false, &mut rng))
                .collect::<Vec<_>>()
        };
        assert_eq!(picks(7), picks(7));
    }
}
