//! # Error Taxonomy
//!
//! Purpose: One error type shared by the codec, the engines, and the caches so
//! wrappers see a small, fixed set of failures.
//!
//! ## Design Principles
//!
//! 1. **Resolve Locally**: Transport deaths are retried and mismatches are
//!    swallowed inside the engines; only terminal failures reach callers.
//! 2. **Fail Closed**: Decoding never yields partial data, only `Malformed`.
//! 3. **Stable Codes**: `code()` gives wrappers a numeric status to map onto
//!    legacy NSS-style return conventions.

use thiserror::Error;

/// Result alias used across the lookup core.
pub type LiResult<T> = Result<T, LiError>;

/// Errors surfaced by the lookup core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiError {
    /// No path to the directory service. Never retried.
    #[error("directory service unavailable")]
    TransportUnavailable,

    /// The service endpoint went away mid-call ("destination invalid").
    #[error("directory service died during the call")]
    TransportDied,

    /// Every attempt in the retry budget reported a server death.
    #[error("directory service unreachable after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// A reply arrived for a request that is not tracked (anymore).
    #[error("reply does not match any pending request")]
    ProtocolMismatch,

    /// A buffer violated the kvbuf wire format.
    #[error("malformed kvbuf: {0}")]
    Malformed(&'static str),

    /// The reply was not sent by a trusted responder.
    #[error("reply sent by untrusted responder (uid {uid})")]
    Untrusted { uid: u32 },

    /// An ILS record footer did not carry the magic cookie.
    #[error("ils record footer is corrupted")]
    Corruption,

    /// Async requests must fit inline.
    #[error("request of {len} bytes exceeds inline limit of {max} bytes")]
    RequestTooLarge { len: usize, max: usize },

    /// A buffer could not grow.
    #[error("allocation failed")]
    AllocationFailed,

    /// The service does not export the named procedure.
    #[error("unknown procedure '{0}'")]
    UnknownProcedure(String),

    /// An ILS format string and its values disagree.
    #[error("invalid ils format at field {index}: {reason}")]
    InvalidFormat { index: usize, reason: &'static str },

    /// Any other transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl LiError {
    /// Returns a stable numeric status for this error.
    ///
    /// Zero is reserved for success and never returned here.
    pub fn code(&self) -> u16 {
        match self {
            LiError::TransportUnavailable => 1,
            LiError::TransportDied => 2,
            LiError::RetriesExhausted { .. } => 3,
            LiError::ProtocolMismatch => 4,
            LiError::Malformed(_) => 5,
            LiError::Untrusted { .. } => 6,
            LiError::Corruption => 7,
            LiError::RequestTooLarge { .. } => 8,
            LiError::AllocationFailed => 9,
            LiError::UnknownProcedure(_) => 10,
            LiError::InvalidFormat { .. } => 11,
            LiError::Transport(_) => 12,
        }
    }

    /// True when the engines may transparently resend the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LiError::TransportDied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_nonzero_and_distinct() {
        let all = [
            LiError::TransportUnavailable,
            LiError::TransportDied,
            LiError::RetriesExhausted { attempts: 10 },
            LiError::ProtocolMismatch,
            LiError::Malformed("x"),
            LiError::Untrusted { uid: 501 },
            LiError::Corruption,
            LiError::RequestTooLarge { len: 2, max: 1 },
            LiError::AllocationFailed,
            LiError::UnknownProcedure("getfoo".into()),
            LiError::InvalidFormat { index: 0, reason: "x" },
            LiError::Transport("x".into()),
        ];
        let mut codes: Vec<u16> = all.iter().map(LiError::code).collect();
        assert!(codes.iter().all(|&c| c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn only_death_is_retryable() {
        assert!(LiError::TransportDied.is_retryable());
        assert!(!LiError::TransportUnavailable.is_retryable());
        assert!(!LiError::RetriesExhausted { attempts: 10 }.is_retryable());
    }
}
