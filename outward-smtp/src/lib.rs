//! Outbound SMTP client used by the delivery engine.
//!
//! Covers exactly what an MTA needs to push mail to a remote exchanger:
//! plain and STARTTLS-upgraded sessions, multi-line reply parsing with
//! enhanced status codes, and transparent dot-stuffing of message payloads.
//! Reply codes are data here, not errors: a `554` comes back as a normal
//! [`Response`] for the caller to classify, while [`ClientError`] is
//! reserved for transport-level failures that poison the session.

pub mod client;
pub mod error;
pub mod response;

pub use client::SmtpClient;
pub use error::{ClientError, Result};
pub use response::Response;
