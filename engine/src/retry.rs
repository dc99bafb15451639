//! Failure classification and retry/backoff decisions.

use std::time::Duration;

use rand::Rng;

use crate::consts::{MAX_RETRIES, RETRY_DELAY_MS};
use crate::error::ChainError;

/// What went wrong with a send, as far as retrying is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientNetwork,
    ConfirmationTimeout,
    /// Gas price below what the node accepts
    Underpriced,
    /// Nonce already used or ahead of the chain
    NonceConflict,
    InsufficientFunds,
    Malformed,
    SignatureFailure,
    Reverted,
    /// Dispatcher closed mid-send
    Cancelled,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetwork
                | ErrorKind::ConfirmationTimeout
                | ErrorKind::Underpriced
                | ErrorKind::NonceConflict
                | ErrorKind::Unknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::ConfirmationTimeout => "confirmation_timeout",
            ErrorKind::Underpriced => "underpriced",
            ErrorKind::NonceConflict => "nonce_conflict",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::Malformed => "malformed",
            ErrorKind::SignatureFailure => "signature_failure",
            ErrorKind::Reverted => "reverted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Node rejection messages, matched case-insensitively in order.
/// The bare "nonce" entry is a catch-all and must stay after the specific ones.
const ERROR_PATTERNS: &[(&str, ErrorKind)] = &[
    ("too cheap", ErrorKind::Underpriced),
    ("underpriced", ErrorKind::Underpriced),
    ("fee too low", ErrorKind::Underpriced),
    ("less than block base fee", ErrorKind::Underpriced),
    ("nonce too low", ErrorKind::NonceConflict),
    ("nonce too high", ErrorKind::NonceConflict),
    ("invalid nonce", ErrorKind::NonceConflict),
    ("insufficient funds", ErrorKind::InsufficientFunds),
    ("invalid sender", ErrorKind::SignatureFailure),
    ("invalid signature", ErrorKind::SignatureFailure),
    ("intrinsic gas too low", ErrorKind::Malformed),
    ("exceeds block gas limit", ErrorKind::Malformed),
    ("rlp", ErrorKind::Malformed),
    ("invalid transaction", ErrorKind::Malformed),
    ("execution reverted", ErrorKind::Reverted),
    ("timed out", ErrorKind::TransientNetwork),
    ("timeout", ErrorKind::TransientNetwork),
    ("too many requests", ErrorKind::TransientNetwork),
    ("rate limit", ErrorKind::TransientNetwork),
    ("header not found", ErrorKind::TransientNetwork),
    ("nonce", ErrorKind::NonceConflict),
];

/// Map a chain client failure onto the taxonomy
pub fn classify(error: &ChainError) -> ErrorKind {
    match error {
        ChainError::Network(_) => ErrorKind::TransientNetwork,
        ChainError::Timeout(_) => ErrorKind::ConfirmationTimeout,
        ChainError::Signing(_) => ErrorKind::SignatureFailure,
        ChainError::Reverted(_) => ErrorKind::Reverted,
        ChainError::Cancelled(_) => ErrorKind::Cancelled,
        ChainError::Parse(_) => ErrorKind::Unknown,
        ChainError::Rpc { message, .. } => classify_message(message),
    }
}

fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    ERROR_PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

/// The node already holds this exact transaction in its pool
pub fn is_already_known(error: &ChainError) -> bool {
    match error {
        ChainError::Rpc { message, .. } => {
            let lower = message.to_lowercase();
            lower.contains("already known") || lower.contains("known transaction")
        }
        _ => false,
    }
}

/// Delay schedule between attempts.
///
/// `retry` is 0 for the delay before the first retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Linear {
        initial: Duration,
        step: Duration,
    },
    Exponential {
        base: Duration,
        cap: Duration,
        /// Upper bound of the uniform random addition
        jitter: Duration,
    },
}

impl Backoff {
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear { initial, step } => initial.saturating_add(step.saturating_mul(retry)),
            Backoff::Exponential { base, cap, jitter } => {
                let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
                let delay = base.saturating_mul(factor).min(cap);
                let jitter_ms = jitter.as_millis() as u64;
                if jitter_ms == 0 {
                    delay
                } else {
                    let extra = rand::thread_rng().gen_range(0..=jitter_ms);
                    delay.saturating_add(Duration::from_millis(extra))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { kind: ErrorKind, delay: Duration },
    GiveUp { kind: ErrorKind },
}

impl RetryDecision {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetryDecision::Retry { kind, .. } | RetryDecision::GiveUp { kind } => *kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff: Backoff::Fixed(Duration::from_millis(RETRY_DELAY_MS)),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Funding transfers: 3s then +2s per retry
    pub fn funding() -> Self {
        Self::new(
            MAX_RETRIES,
            Backoff::Linear {
                initial: Duration::from_millis(3_000),
                step: Duration::from_millis(2_000),
            },
        )
    }

    /// Bulk blasts: doubling from 1s up to 10s, plus up to 1s of jitter
    pub fn blast() -> Self {
        Self::new(
            5,
            Backoff::Exponential {
                base: Duration::from_millis(1_000),
                cap: Duration::from_millis(10_000),
                jitter: Duration::from_millis(1_000),
            },
        )
    }

    pub fn next_delay(&self, retry: u32) -> Duration {
        self.backoff.delay(retry)
    }

    /// Decide what to do after a failure, given how many retries already ran
    pub fn decide(&self, error: &ChainError, retries: u32) -> RetryDecision {
        let kind = classify(error);
        if !kind.is_retryable() || retries >= self.max_retries {
            RetryDecision::GiveUp { kind }
        } else {
            RetryDecision::Retry {
                kind,
                delay: self.next_delay(retries),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rpc_messages() {
        let cases = [
            ("transaction underpriced", ErrorKind::Underpriced),
            ("Gas price too cheap", ErrorKind::Underpriced),
            ("replacement transaction underpriced", ErrorKind::Underpriced),
            ("max fee per gas less than block base fee", ErrorKind::Underpriced),
            ("nonce too low", ErrorKind::NonceConflict),
            ("Nonce too high", ErrorKind::NonceConflict),
            ("invalid nonce; got 3, expected 5", ErrorKind::NonceConflict),
            (
                "insufficient funds for gas * price + value",
                ErrorKind::InsufficientFunds,
            ),
            ("invalid sender", ErrorKind::SignatureFailure),
            ("rlp: expected input list", ErrorKind::Malformed),
            ("intrinsic gas too low", ErrorKind::Malformed),
            ("execution reverted", ErrorKind::Reverted),
            ("429 Too Many Requests", ErrorKind::TransientNetwork),
            ("something odd happened", ErrorKind::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(classify(&ChainError::rpc(message)), expected, "{}", message);
        }
    }

    #[test]
    fn test_classify_variants() {
        assert_eq!(
            classify(&ChainError::Network("connection reset".into())),
            ErrorKind::TransientNetwork
        );
        assert_eq!(
            classify(&ChainError::Timeout("0xabc".into())),
            ErrorKind::ConfirmationTimeout
        );
        assert_eq!(
            classify(&ChainError::Signing("bad key".into())),
            ErrorKind::SignatureFailure
        );
        assert_eq!(classify(&ChainError::Reverted("0x1".into())), ErrorKind::Reverted);
        assert_eq!(
            classify(&ChainError::Cancelled("limiter closed".into())),
            ErrorKind::Cancelled
        );
    }

    #[test]
    fn test_already_known_detection() {
        assert!(is_already_known(&ChainError::rpc("already known")));
        assert!(is_already_known(&ChainError::rpc("Known transaction: 0xabc")));
        assert!(!is_already_known(&ChainError::rpc("nonce too low")));
        assert!(!is_already_known(&ChainError::Network("already known".into())));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::TransientNetwork.is_retryable());
        assert!(ErrorKind::ConfirmationTimeout.is_retryable());
        assert!(ErrorKind::Underpriced.is_retryable());
        assert!(ErrorKind::NonceConflict.is_retryable());
        assert!(ErrorKind::Unknown.is_retryable());
        assert!(!ErrorKind::InsufficientFunds.is_retryable());
        assert!(!ErrorKind::Malformed.is_retryable());
        assert!(!ErrorKind::SignatureFailure.is_retryable());
        assert!(!ErrorKind::Reverted.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_decide_gives_up_after_max_retries() {
        let policy = RetryPolicy::default();
        let err = ChainError::rpc("transaction underpriced");
        for retries in 0..3 {
            assert_eq!(
                policy.decide(&err, retries),
                RetryDecision::Retry {
                    kind: ErrorKind::Underpriced,
                    delay: Duration::from_millis(1_000),
                }
            );
        }
        assert_eq!(
            policy.decide(&err, 3),
            RetryDecision::GiveUp {
                kind: ErrorKind::Underpriced
            }
        );
    }

    #[test]
    fn test_decide_terminal_kind_never_retries() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(&ChainError::rpc("insufficient funds"), 0);
        assert_eq!(
            decision,
            RetryDecision::GiveUp {
                kind: ErrorKind::InsufficientFunds
            }
        );
    }

    #[test]
    fn test_linear_backoff_matches_funding_schedule() {
        let policy = RetryPolicy::funding();
        assert_eq!(policy.next_delay(0), Duration::from_millis(3_000));
        assert_eq!(policy.next_delay(1), Duration::from_millis(5_000));
        assert_eq!(policy.next_delay(2), Duration::from_millis(7_000));
    }

    #[test]
    fn test_exponential_backoff_is_capped_and_jittered() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(10_000),
            jitter: Duration::from_millis(1_000),
        };
        for _ in 0..50 {
            let d0 = backoff.delay(0);
            assert!(d0 >= Duration::from_millis(1_000) && d0 <= Duration::from_millis(2_000));
            let d2 = backoff.delay(2);
            assert!(d2 >= Duration::from_millis(4_000) && d2 <= Duration::from_millis(5_000));
            let d10 = backoff.delay(10);
            assert!(d10 >= Duration::from_millis(10_000) && d10 <= Duration::from_millis(11_000));
        }
        // Huge exponents saturate instead of overflowing
        assert!(backoff.delay(64) <= Duration::from_millis(11_000));
    }
}
