//! SMTP-style delivery status.
//!
//! Every error surfaced by the engine carries a reply code, an enhanced
//! status triple (RFC 3463) and a human-readable reason, so the caller can
//! render a correct protocol reply or bounce line without re-parsing text.

use std::fmt::{self, Display};

use thiserror::Error;

/// An enhanced status code triple, e.g. `4.4.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedCode(pub u8, pub u8, pub u16);

impl EnhancedCode {
    /// A generic triple derived from the reply code's class: `4.0.0` for
    /// temporary replies, `5.0.0` for permanent ones.
    #[must_use]
    pub const fn for_code(code: u16) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self((code / 100) as u8, 0, 0)
    }
}

impl Display for EnhancedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// A terminal delivery status for one recipient or one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} {enhanced} {message}")]
pub struct Status {
    pub code: u16,
    pub enhanced: EnhancedCode,
    pub message: String,
}

impl Status {
    pub fn new(code: u16, enhanced: EnhancedCode, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced,
            message: message.into(),
        }
    }

    /// Retry later.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// Do not retry.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_code_class() {
        let temp = Status::new(451, EnhancedCode(4, 4, 1), "try later");
        assert!(temp.is_temporary());
        assert!(!temp.is_permanent());

        let perm = Status::new(550, EnhancedCode(5, 1, 2), "no such domain");
        assert!(perm.is_permanent());
        assert!(!perm.is_temporary());
    }

    #[test]
    fn renders_code_triple_and_message() {
        let status = Status::new(556, EnhancedCode(5, 1, 10), "domain accepts no mail");
        assert_eq!(status.to_string(), "556 5.1.10 domain accepts no mail");
    }

    #[test]
    fn generic_triple_matches_class() {
        assert_eq!(EnhancedCode::for_code(421), EnhancedCode(4, 0, 0));
        assert_eq!(EnhancedCode::for_code(554), EnhancedCode(5, 0, 0));
    }
}
