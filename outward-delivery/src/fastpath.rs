//! Opportunistic direct transfer to peer servers.
//!
//! Before opening an SMTP session, a domain worker may POST the message
//! to the destination's well-known delivery endpoint: encrypted with an
//! unverified certificate first, then plaintext. The envelope travels in
//! request headers, the message in the request body, and a 200 means the
//! peer accepted every listed recipient. Everything else is a fallback
//! signal logged at debug level, never a delivery failure.

use outward_common::message::{MessageBody, MessageHeader};
use reqwest::StatusCode;
use tracing::debug;

use crate::{config::FastPathConfig, resolver::split_host_port};

const DELIVERY_PATH: &str = "/mxdeliv";

/// What a direct-transfer attempt produced. Deliberately not a `Result`:
/// only [`FastPathOutcome::Delivered`] carries meaning for the delivery
/// outcome, the other two tell the caller to take the standard path.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPathOutcome {
    /// The peer accepted the message for every listed recipient.
    Delivered,
    /// No attempt was made (path disabled).
    Skipped,
    /// Attempted and did not complete; already logged.
    Fallback,
}

pub(crate) struct FastPath {
    client: reqwest::Client,
    enabled: bool,
    port: Option<u16>,
}

impl FastPath {
    pub fn new(config: &FastPathConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            enabled: config.enabled,
            port: config.port,
        })
    }

    /// Attempts the direct transfer against `target`, the resolved host
    /// for the destination domain.
    pub async fn attempt(
        &self,
        target: &str,
        mail_from: &str,
        rcpts: &[String],
        header: &MessageHeader,
        body: &MessageBody,
    ) -> FastPathOutcome {
        if !self.enabled {
            return FastPathOutcome::Skipped;
        }

        let (host, _) = split_host_port(target);
        let host = if host.contains(':') {
            // literal IPv6 must be bracketed inside a URL authority
            format!("[{host}]")
        } else {
            host
        };
        let authority = match self.port {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };

        let payload = header.assemble(body);

        for scheme in ["https", "http"] {
            let url = format!("{scheme}://{authority}{DELIVERY_PATH}");
            debug!(url, mail_from, rcpts = rcpts.len(), "attempting direct transfer");

            let mut request = self.client.post(&url).header("X-Mail-From", mail_from);
            for rcpt in rcpts {
                request = request.header("X-Mail-To", rcpt);
            }

            match request.body(payload.clone()).send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    debug!(url, "direct transfer accepted");
                    return FastPathOutcome::Delivered;
                }
                Ok(response) => {
                    debug!(url, status = %response.status(), "direct transfer refused");
                }
                Err(err) => {
                    debug!(url, error = %err, "direct transfer failed");
                }
            }
        }

        FastPathOutcome::Fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fastpath(enabled: bool) -> FastPath {
        FastPath::new(&FastPathConfig {
            enabled,
            ..FastPathConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn disabled_path_is_skipped_without_io() {
        let header = MessageHeader::new("Subject: hi\r\n\r\n").unwrap();
        let body = MessageBody::from("hello\r\n");

        let outcome = fastpath(false)
            .attempt(
                "example.invalid",
                "sender@example.org",
                &["rcpt@example.invalid".to_owned()],
                &header,
                &body,
            )
            .await;

        assert_eq!(outcome, FastPathOutcome::Skipped);
    }

    #[test]
    fn authority_building_brackets_ipv6() {
        // exercised through split_host_port, which attempt relies on
        assert_eq!(split_host_port("2001:db8::1").0, "2001:db8::1");
        assert_eq!(split_host_port("[2001:db8::1]:2525"), ("2001:db8::1".to_owned(), Some(2525)));
    }
}
