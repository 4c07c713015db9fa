//! Reactivation codes and the client-side challenge that reverses an
//! "away" status.
//!
//! The attempt budget is advisory state held by the client; nothing on the
//! store side enforces it. A hardened deployment should also count attempts
//! server-side.

use rand::Rng;

/// Number of digits in a reactivation code.
pub const CODE_LEN: usize = 4;

/// Failed submissions allowed before the challenge locks.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Exclusive upper bound of the numeric code space.
const CODE_SPACE: u16 = 10_000;

// ---------------------------------------------------------------------------
// Code generation
// ---------------------------------------------------------------------------

/// Generate a uniformly random 4-digit code different from `previous`.
pub fn generate_code(previous: Option<&str>) -> String {
    generate_code_with(&mut rand::rng(), previous)
}

/// [`generate_code`] with a caller-supplied RNG.
pub fn generate_code_with<R: Rng>(rng: &mut R, previous: Option<&str>) -> String {
    loop {
        let code = format!("{:0width$}", rng.random_range(0..CODE_SPACE), width = CODE_LEN);
        if previous != Some(code.as_str()) {
            return code;
        }
    }
}

/// Returns `true` if `code` is exactly four ASCII digits.
pub fn is_valid_code(code: &str) -> bool {
    code.len() == CODE_LEN && code.bytes().all(|b| b.is_ascii_digit())
}

// ---------------------------------------------------------------------------
// Challenge
// ---------------------------------------------------------------------------

/// Result of one submission against a [`ReactivationChallenge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Accepted,
    Rejected { remaining: u32 },
    /// The attempt budget is exhausted; the caller must re-authenticate.
    Locked,
}

/// One challenge instance, bound to a single generated code.
#[derive(Debug, Clone)]
pub struct ReactivationChallenge {
    code: String,
    failed_attempts: u32,
    max_attempts: u32,
}

impl ReactivationChallenge {
    pub fn new(code: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            code: code.into(),
            failed_attempts: 0,
            max_attempts,
        }
    }

    /// The code to display out-of-band.
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn is_locked(&self) -> bool {
        self.failed_attempts >= self.max_attempts
    }

    /// Check `input` against the code. Surrounding whitespace is ignored.
    pub fn submit(&mut self, input: &str) -> ChallengeOutcome {
        if self.is_locked() {
            return ChallengeOutcome::Locked;
        }
        if input.trim() == self.code {
            self.failed_attempts = 0;
            return ChallengeOutcome::Accepted;
        }

        self.failed_attempts += 1;
        if self.is_locked() {
            ChallengeOutcome::Locked
        } else {
            ChallengeOutcome::Rejected {
                remaining: self.max_attempts - self.failed_attempts,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn generated_codes_are_four_digits() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let code = generate_code_with(&mut rng, None);
            assert!(is_valid_code(&code), "bad code {code}");
        }
    }

    #[test]
    fn generated_code_differs_from_previous() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut previous = generate_code_with(&mut rng, None);
        for _ in 0..500 {
            let next = generate_code_with(&mut rng, Some(&previous));
            assert_ne!(next, previous);
            previous = next;
        }
    }

    #[test]
    fn code_validation() {
        assert!(is_valid_code("0042"));
        assert!(!is_valid_code("42"));
        assert!(!is_valid_code("12a4"));
        assert!(!is_valid_code("12345"));
    }

    #[test]
    fn correct_code_is_accepted_and_resets_counter() {
        let mut challenge = ReactivationChallenge::new("1234", DEFAULT_MAX_ATTEMPTS);
        assert_matches!(challenge.submit("0000"), ChallengeOutcome::Rejected { remaining: 2 });
        assert_eq!(challenge.failed_attempts(), 1);

        assert_matches!(challenge.submit(" 1234 "), ChallengeOutcome::Accepted);
        assert_eq!(challenge.failed_attempts(), 0);
    }

    #[test]
    fn three_failures_lock_the_challenge() {
        let mut challenge = ReactivationChallenge::new("1234", DEFAULT_MAX_ATTEMPTS);
        assert_matches!(challenge.submit("1111"), ChallengeOutcome::Rejected { remaining: 2 });
        assert_matches!(challenge.submit("2222"), ChallengeOutcome::Rejected { remaining: 1 });
        assert_matches!(challenge.submit("3333"), ChallengeOutcome::Locked);
        assert!(challenge.is_locked());

        // Even the right code is refused once locked.
        assert_matches!(challenge.submit("1234"), ChallengeOutcome::Locked);
        assert_eq!(challenge.failed_attempts(), 3);
    }
}
