use std::time::Duration;

use rand::Rng;

/// Retry schedule: exponential growth from `base_ms`, capped at `max_ms`,
/// with ±25% jitter applied at schedule time.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub base_ms: u64,
	pub max_ms: u64,
}

impl RetryPolicy {
	pub const fn new(max_attempts: u32, base_ms: u64, max_ms: u64) -> Self {
		Self { max_attempts, base_ms, max_ms }
	}

	/// Deterministic pre-jitter delay for a 1-based attempt number.
	pub fn delay_ms(&self, attempt: u32) -> u64 {
		let exp = attempt.max(1).saturating_sub(1).min(32);
		let raw = self.base_ms.saturating_mul(1_u64 << exp);

		raw.min(self.max_ms)
	}

	pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
		let base = self.delay_ms(attempt);
		let factor = rand::rng().random_range(0.75..=1.25_f64);

		Duration::from_millis((base as f64 * factor) as u64)
	}
}

/// Full-jitter delay for reconnect loops: uniform in `[0, cap]` where the
/// cap doubles per attempt up to `max_ms`.
pub fn full_jitter_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
	let cap = full_jitter_cap_ms(attempt, base_ms, max_ms);

	rand::rng().random_range(0..=cap)
}

fn full_jitter_cap_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
	let exp = attempt.max(1).saturating_sub(1).min(32);

	base_ms.saturating_mul(1_u64 << exp).min(max_ms)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn delay_doubles_until_the_cap() {
		let policy = RetryPolicy::new(5, 500, 30_000);

		assert_eq!(policy.delay_ms(1), 500);
		assert_eq!(policy.delay_ms(2), 1_000);
		assert_eq!(policy.delay_ms(3), 2_000);
		assert_eq!(policy.delay_ms(7), 30_000);
		assert_eq!(policy.delay_ms(0), 500);
	}

	#[test]
	fn jitter_stays_within_a_quarter() {
		let policy = RetryPolicy::new(5, 1_000, 60_000);

		for attempt in 1..=6 {
			let base = policy.delay_ms(attempt);
			let jittered = policy.delay_with_jitter(attempt).as_millis() as u64;

			assert!(jittered >= base * 3 / 4, "attempt {attempt}: {jittered} < 0.75 * {base}");
			assert!(jittered <= base * 5 / 4 + 1, "attempt {attempt}: {jittered} > 1.25 * {base}");
		}
	}

	#[test]
	fn full_jitter_is_bounded_by_the_doubling_cap() {
		assert_eq!(full_jitter_cap_ms(1, 1_000, 30_000), 1_000);
		assert_eq!(full_jitter_cap_ms(3, 1_000, 30_000), 4_000);
		assert_eq!(full_jitter_cap_ms(10, 1_000, 30_000), 30_000);

		for attempt in 1..=8 {
			let delay = full_jitter_ms(attempt, 1_000, 30_000);

			assert!(delay <= full_jitter_cap_ms(attempt, 1_000, 30_000));
		}
	}

	#[test]
	fn overflow_is_saturating() {
		let policy = RetryPolicy::new(100, u64::MAX / 2, u64::MAX);

		assert_eq!(policy.delay_ms(40), u64::MAX);
	}
}
