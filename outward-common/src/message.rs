//! Message payload and metadata shared between a message source and the
//! delivery engine.
//!
//! Header block and body are kept as raw bytes behind `Arc` so that one
//! message can be handed to many per-domain workers without copying, and so
//! the bytes put on the wire are exactly the bytes the source handed over.

use std::{net::IpAddr, sync::Arc};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed header block")]
    Header(#[from] mailparse::MailParseError),
}

/// A validated RFC 5322 header block, without the blank line that separates
/// it from the body.
#[derive(Debug, Clone)]
pub struct MessageHeader {
    raw: Arc<[u8]>,
}

impl MessageHeader {
    /// Validates and stores a header block. Trailing blank lines are
    /// stripped so [`Self::assemble`] can re-introduce exactly one
    /// separator; the header lines themselves are kept verbatim.
    pub fn new(raw: impl AsRef<[u8]>) -> Result<Self, MessageError> {
        let mut raw = raw.as_ref();
        while raw.ends_with(b"\r\n\r\n") {
            raw = &raw[..raw.len() - 2];
        }

        mailparse::parse_headers(raw)?;

        let mut bytes = raw.to_vec();
        if !bytes.is_empty() && !bytes.ends_with(b"\r\n") {
            bytes.extend_from_slice(b"\r\n");
        }

        Ok(Self {
            raw: Arc::from(bytes),
        })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Joins header block and body with the single separating blank line,
    /// producing the full message as it goes on the wire.
    #[must_use]
    pub fn assemble(&self, body: &MessageBody) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw.len() + 2 + body.len());
        out.extend_from_slice(&self.raw);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body.as_bytes());
        out
    }
}

/// An in-memory message body, cheaply cloneable so every domain worker can
/// read it independently.
#[derive(Debug, Clone)]
pub struct MessageBody(Arc<[u8]>);

impl MessageBody {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for MessageBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }
}

impl From<&[u8]> for MessageBody {
    fn from(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }
}

impl From<&str> for MessageBody {
    fn from(text: &str) -> Self {
        Self(Arc::from(text.as_bytes()))
    }
}

/// Per-message metadata carried from the source through the whole delivery.
#[derive(Debug, Clone, Default)]
pub struct MessageMeta {
    /// Queue-assigned message identifier, used in logs only.
    pub id: String,
    /// Address of the connection the message arrived over, if any. Keys the
    /// per-source rate limiter.
    pub source_ip: Option<IpAddr>,
    /// Quarantined messages are refused outright at `AddRcpt`.
    pub quarantine: bool,
    /// Set when the sender carried an explicit security-requirement
    /// override (e.g. `REQUIRETLS=NO`); honoring it is gated by
    /// configuration and always logged.
    pub security_override: bool,
}

impl MessageMeta {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}
