// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Computes backoff as
///
/// ```text
/// backoff = base^attempt * unit + jitter
/// ```
///
/// The defaults are base=2, unit=50ms, jitter=50ms, min=0ms, max=5s. This gives
/// a backoff of 50ms, 100ms, 200ms, 400ms, 800ms, 1.6s, 3.2s, 5s, (not including jitter).
///
/// Used where a retry is caused by a random collision rather than by other
/// writers, e.g. picking a detached version that is already taken.
pub struct Backoff {
    base: u32,
    unit: u32,
    jitter: i32,
    min: u32,
    max: u32,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: 2,
            unit: 50,
            jitter: 50,
            min: 0,
            max: 5000,
            attempt: 0,
        }
    }
}

impl Backoff {
    pub fn with_base(self, base: u32) -> Self {
        Self { base, ..self }
    }

    pub fn with_unit(self, unit: u32) -> Self {
        Self { unit, ..self }
    }

    pub fn with_jitter(self, jitter: i32) -> Self {
        Self { jitter, ..self }
    }

    pub fn with_max(self, max: u32) -> Self {
        Self { max, ..self }
    }

    pub fn next_backoff(&mut self) -> Duration {
        let backoff = self
            .base
            .saturating_pow(self.attempt)
            .saturating_mul(self.unit);
        let jitter = rand::rng().random_range(-self.jitter..=self.jitter);
        let backoff = (backoff.saturating_add_signed(jitter)).clamp(self.min, self.max);
        self.attempt += 1;
        Duration::from_millis(backoff as u64)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// SlotBackoff is a backoff strategy for commit retries.
///
/// The cause of a failed commit is concurrency itself, and competing attempts
/// take about the same amount of time. Each round splits the waiting window into
/// slots of `unit` and picks one at random; since only one writer can win each
/// version, the number of slots doubles every round:
///
/// * Round 1: 0 - 3 units
/// * Round 2: 0 - 7 units
/// * Round 3: 0 - 15 units
///
/// The commit loop sets `unit` from the duration of its first attempt.
pub struct SlotBackoff {
    base: u32,
    unit: u32,
    starting_i: u32,
    attempt: u32,
    rng: rand::rngs::SmallRng,
}

impl Default for SlotBackoff {
    fn default() -> Self {
        Self {
            base: 2,
            unit: 50,
            starting_i: 2, // start with 4 slots
            attempt: 0,
            rng: rand::rngs::SmallRng::from_os_rng(),
        }
    }
}

impl SlotBackoff {
    pub fn with_unit(self, unit: u32) -> Self {
        Self { unit, ..self }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_backoff(&mut self) -> Duration {
        let num_slots = self.base.saturating_pow(self.attempt + self.starting_i);
        let slot_i = self.rng.random_range(0..num_slots);
        self.attempt += 1;
        Duration::from_millis(slot_i.saturating_mul(self.unit) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff() {
        let mut backoff = Backoff::default().with_jitter(0);
        let expected = [50, 100, 200, 400];
        for (i, millis) in expected.into_iter().enumerate() {
            assert_eq!(backoff.next_backoff().as_millis(), millis);
            assert_eq!(backoff.attempt(), i as u32 + 1);
        }

        let mut capped = Backoff::default()
            .with_base(10)
            .with_unit(100)
            .with_jitter(0)
            .with_max(1000);
        assert_eq!(capped.next_backoff().as_millis(), 100);
        assert_eq!(capped.next_backoff().as_millis(), 1000);
        assert_eq!(capped.next_backoff().as_millis(), 1000);
    }

    #[test]
    fn test_slot_backoff_window_doubles() {
        for _ in 0..10 {
            let mut backoff = SlotBackoff::default().with_unit(100);
            for round in 0..3u32 {
                let slots = 4u128 << round;
                let wait = backoff.next_backoff().as_millis();
                assert_eq!(wait % 100, 0);
                assert!(wait < slots * 100, "round {} waited {}ms", round, wait);
                assert_eq!(backoff.attempt(), round + 1);
            }
        }
    }
}
