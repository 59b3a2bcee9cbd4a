//! Envelope-address splitting.
//!
//! Only the shapes SMTP envelopes actually use are recognized: the null
//! sender `<>`, the bare `postmaster` mailbox, and `local@domain`. Anything
//! else is malformed and rejected before it reaches the wire.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("malformed address: {0:?}")]
    Malformed(String),
}

/// Splits an envelope address into `(local, domain)`.
///
/// The empty string (the null reverse-path) splits to `("", "")`, and the
/// reserved `postmaster` mailbox splits to `(local, "")` with its original
/// casing preserved. Every other address must contain exactly one non-empty
/// local part and one non-empty domain.
pub fn split(address: &str) -> Result<(&str, &str), AddressError> {
    if address.is_empty() {
        return Ok(("", ""));
    }

    match address.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok((local, domain)),
        Some(_) => Err(AddressError::Malformed(address.to_owned())),
        None if address.eq_ignore_ascii_case("postmaster") => Ok((address, "")),
        None => Err(AddressError::Malformed(address.to_owned())),
    }
}
