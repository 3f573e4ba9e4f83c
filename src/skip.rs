//! Optimistic-ACK defense for the Data space
//!
//! Every so often a packet number is deliberately never sent. A peer acknowledging it cannot
//! have received what it claims to have received.

use std::ops::RangeInclusive;

use rand::Rng;

const INITIAL_MAX_SKIP: u64 = 256;
const MIN_SKIP_GAP: u64 = 64;
const MAX_SKIP_CAP: u64 = 131_072;

#[derive(Debug)]
pub(crate) struct SkipState {
    /// Next packet number that will not be sent
    skip: u64,
    max_skip: u64,
    /// Every number skipped so far, ascending
    ///
    /// Once the window reaches its cap this grows by one entry per ~65k packets sent, so the
    /// whole history is kept and late acknowledgements of old skips are still caught.
    skipped: Vec<u64>,
}

impl SkipState {
    pub(crate) fn new<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut this = Self {
            skip: 0,
            max_skip: INITIAL_MAX_SKIP,
            skipped: Vec::new(),
        };
        this.schedule(rng);
        this
    }

    /// Turn the next candidate packet number into the one actually used
    ///
    /// If `pn` is the scheduled skip, it is recorded and `pn + 1` is returned.
    pub(crate) fn next_packet_number<R: Rng + ?Sized>(&mut self, pn: u64, rng: &mut R) -> u64 {
        debug_assert!(pn <= self.skip, "packet numbers jumped past a scheduled skip");
        if pn != self.skip {
            return pn;
        }
        self.skipped.push(pn);
        self.schedule(rng);
        pn + 1
    }

    /// Whether an acknowledged range covers a number that was skipped
    pub(crate) fn covers_skipped(&self, range: &RangeInclusive<u64>) -> bool {
        let first = self.skipped.partition_point(|&pn| pn < *range.start());
        self.skipped.get(first).is_some_and(|&pn| pn <= *range.end())
    }

    fn schedule<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.skip += MIN_SKIP_GAP + rng.random_range(0..self.max_skip - MIN_SKIP_GAP);
        self.max_skip = (self.max_skip * 2).min(MAX_SKIP_CAP);
    }

    #[cfg(test)]
    pub(crate) fn upcoming(&self) -> u64 {
        self.skip
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn first_skip_in_initial_window() {
        for seed in 0..64 {
            let state = SkipState::new(&mut StdRng::seed_from_u64(seed));
            assert!((MIN_SKIP_GAP..INITIAL_MAX_SKIP).contains(&state.upcoming()));
            assert_eq!(state.max_skip, 2 * INITIAL_MAX_SKIP);
        }
    }

    #[test]
    fn every_window_contains_a_skip() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut state = SkipState::new(&mut rng);
        let mut sent = Vec::new();
        let mut skipped = Vec::new();
        let mut next = 0;
        while next < 1_000_000 {
            let pn = state.next_packet_number(next, &mut rng);
            if pn != next {
                skipped.push(next);
            }
            sent.push(pn);
            next = pn + 1;
        }
        assert!(sent.windows(2).all(|w| w[0] < w[1]));
        assert!(skipped.iter().all(|x| sent.binary_search(x).is_err()));

        // Consecutive skips are never further apart than the window in force
        let mut window = INITIAL_MAX_SKIP;
        let mut prev = 0;
        for &pn in &skipped {
            assert!(pn - prev >= MIN_SKIP_GAP);
            assert!(pn - prev < window, "gap {} exceeds {}", pn - prev, window);
            window = (window * 2).min(MAX_SKIP_CAP);
            prev = pn;
        }
        assert!(skipped.len() > 10);
    }

    #[test]
    fn skipped_numbers_are_detected() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut state = SkipState::new(&mut rng);
        let target = state.upcoming();
        assert_eq!(state.next_packet_number(target - 1, &mut rng), target - 1);
        assert_eq!(state.next_packet_number(target, &mut rng), target + 1);
        assert!(state.covers_skipped(&(target..=target)));
        assert!(state.covers_skipped(&(0..=target + 5)));
        assert!(!state.covers_skipped(&(target + 1..=target + 1)));
        assert!(!state.covers_skipped(&(0..=target - 1)));
    }

    #[test]
    fn old_skips_stay_detected() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut state = SkipState::new(&mut rng);
        let first = state.upcoming();
        for _ in 0..100 {
            let pn = state.upcoming();
            state.next_packet_number(pn, &mut rng);
        }
        assert_eq!(state.skipped.len(), 100);
        assert!(state.covers_skipped(&(first..=first)));
        assert!(!state.covers_skipped(&(first + 1..=first + MIN_SKIP_GAP - 1)));
        let last = *state.skipped.last().unwrap();
        assert!(state.covers_skipped(&(last - 1..=last + 1)));
        assert!(!state.covers_skipped(&(last + 1..=state.upcoming() - 1)));
    }
}
