//! Resolution errors and their mapping onto delivery statuses.
//!
//! The engine's error currency is [`Status`]: every failure a recipient can
//! observe ends up as one. This module covers the step before any
//! connection exists, where resolution itself decides between "retry
//! later" and "this domain will never take mail".

use outward_common::{EnhancedCode, Status};
use thiserror::Error;

/// Why a destination domain could not be resolved to usable exchangers.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The domain's only MX record is "." (RFC 7505): it explicitly
    /// accepts no mail, ever. Terminal.
    #[error("domain {0} does not accept mail (null MX)")]
    NullMx(String),

    /// The domain has neither MX records nor any A/AAAA fallback.
    /// Terminal.
    #[error("no mail exchangers found for {0}")]
    NoServers(String),

    /// The DNS query itself failed. Permanent only when the resolver is
    /// certain the name does not exist.
    #[error("DNS lookup failed: {0}")]
    Lookup(#[from] hickory_resolver::ResolveError),

    /// The override table could not be read.
    #[error("override store error: {0}")]
    Store(#[from] crate::overrides::StoreError),
}

/// Why the delivery target could not be brought up.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("DNS resolver initialization failed: {0}")]
    Dns(#[from] ResolveError),

    #[error("direct-transfer client initialization failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<ResolveError> for Status {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NullMx(_) => Self::new(
                556,
                EnhancedCode(5, 1, 10),
                "Domain does not accept mail (null MX)",
            ),
            ResolveError::NoServers(domain) => Self::new(
                550,
                EnhancedCode(5, 1, 2),
                format!("No mail exchangers found for {domain}"),
            ),
            ResolveError::Lookup(cause) => {
                if cause.is_nx_domain() || cause.is_no_records_found() {
                    Self::new(
                        550,
                        EnhancedCode(5, 1, 2),
                        "Recipient domain does not exist",
                    )
                } else {
                    Self::new(451, EnhancedCode(4, 4, 3), format!("DNS error: {cause}"))
                }
            }
            ResolveError::Store(cause) => Self::new(
                451,
                EnhancedCode(4, 3, 0),
                format!("Internal error during resolution: {cause}"),
            ),
        }
    }
}
