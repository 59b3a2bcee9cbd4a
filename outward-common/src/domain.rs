//! Destination-domain newtype.
//!
//! Delivery state (recipient buckets, pool keys, limiter keys) is keyed by
//! domain, so the string is normalized once at the boundary: lower-cased,
//! with a single trailing dot removed. Cheap to clone (`Arc<str>`).

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A normalized destination domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Domain(Arc<str>);

impl Domain {
    /// Creates a domain, lower-casing and stripping one trailing dot.
    #[must_use]
    pub fn new(s: &str) -> Self {
        let s = s.strip_suffix('.').unwrap_or(s);
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            Self(Arc::from(s.to_ascii_lowercase()))
        } else {
            Self(Arc::from(s))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` for the null domain (e.g. a bare `postmaster` recipient).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Arc<str> {
        self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_trailing_dot() {
        assert_eq!(Domain::new("Example.COM.").as_str(), "example.com");
        assert_eq!(Domain::new("example.com").as_str(), "example.com");
    }

    #[test]
    fn strips_only_one_trailing_dot() {
        assert_eq!(Domain::new("example.com..").as_str(), "example.com.");
    }

    #[test]
    fn equal_after_normalization() {
        assert_eq!(Domain::new("EXAMPLE.com"), Domain::new("example.com."));
    }

    #[test]
    fn usable_as_map_key() {
        let mut map = std::collections::HashMap::new();
        map.insert(Domain::new("Example.com"), 1);
        assert_eq!(map.get(&Domain::new("example.com")), Some(&1));
    }

    #[test]
    fn serde_is_transparent() {
        let domain = Domain::new("example.com");
        let text = ron::to_string(&domain).unwrap();
        assert_eq!(text, "\"example.com\"");
        assert_eq!(ron::from_str::<Domain>(&text).unwrap(), domain);
    }
}
