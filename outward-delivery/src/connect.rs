//! Establishing and grading sessions to mail exchangers.
//!
//! Candidates are tried in resolver order. Each attempt dials, reads the
//! greeting, introduces itself with EHLO (HELO for servers that reject
//! it), and walks the STARTTLS ladder the TLS policy allows: a rejected
//! `STARTTLS` command continues in plaintext on the same session, while a
//! failed handshake tears the session down and, under opportunistic TLS,
//! earns one fresh plaintext attempt. The negotiated [`SecurityLevel`] is
//! recorded on the connection for the policy chain to judge.

use std::{
    io,
    time::{Duration, Instant},
};

use outward_common::{EnhancedCode, Status};
use outward_smtp::{ClientError, SmtpClient};
use tracing::debug;

use crate::{
    config::{DeliveryConfig, TlsPolicy},
    limits::Slot,
    policy::{self, DeliveryPolicy, SecurityLevel},
    resolver::MxRecord,
};

/// One live session to one mail exchanger, owned by a single transaction
/// while checked out.
pub(crate) struct MxConn {
    /// Pool key: the normalized destination domain.
    pub domain: String,
    pub mx_host: String,
    pub client: SmtpClient,
    pub security: SecurityLevel,
    /// Set the moment any transport exchange on this session fails. An
    /// errored connection is never pooled and never sent QUIT.
    pub errored: bool,
    pub transactions: usize,
    pub last_use: Instant,
    /// Destination-domain limiter slot, surrendered before pooling.
    pub dest_slot: Option<Slot>,
}

impl MxConn {
    pub fn usable(&self, reuse_limit: usize) -> bool {
        !self.errored && self.transactions < reuse_limit
    }

    pub async fn quit_best_effort(mut self, command_timeout: Duration) {
        if !self.errored {
            let _ = with_timeout(command_timeout, self.client.quit()).await;
        }
    }
}

/// Bounds one protocol operation, surfacing expiry as a transport error
/// so it classifies as temporary.
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    operation: impl Future<Output = outward_smtp::Result<T>>,
) -> outward_smtp::Result<T> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "operation timed out",
        ))),
    }
}

enum ConnectFailure {
    /// The TLS handshake itself failed; the opportunistic ladder may retry
    /// in plaintext.
    Tls(Status),
    Other(Status),
}

impl ConnectFailure {
    fn into_status(self) -> Status {
        match self {
            Self::Tls(status) | Self::Other(status) => status,
        }
    }
}

/// Walks the candidate exchangers and returns the first session that
/// survives the handshake and the policy chain.
///
/// Exhausting every candidate surfaces the last failure, so a permanent
/// rejection by the only exchanger stays permanent.
pub(crate) async fn open_connection(
    config: &DeliveryConfig,
    chain: &[Box<dyn DeliveryPolicy>],
    domain: &str,
    records: &[MxRecord],
) -> Result<MxConn, Status> {
    let mut last_status = None;

    for record in records {
        debug!(domain, mx = %record.host, "attempting exchanger");

        match attempt_mx(config, domain, record).await {
            Ok(conn) => {
                if let Err(status) =
                    policy::check_connection(chain, domain, &record.host, conn.security).await
                {
                    conn.quit_best_effort(config.timeouts.command()).await;
                    return Err(status);
                }
                return Ok(conn);
            }
            Err(status) => {
                debug!(domain, mx = %record.host, %status, "exchanger attempt failed");
                last_status = Some(status);
            }
        }
    }

    Err(last_status.unwrap_or_else(|| {
        Status::new(
            451,
            EnhancedCode(4, 4, 1),
            "Could not establish a connection to any mail exchanger",
        )
    }))
}

async fn attempt_mx(
    config: &DeliveryConfig,
    domain: &str,
    record: &MxRecord,
) -> Result<MxConn, Status> {
    let attempt_tls = config.tls.policy != TlsPolicy::Disabled;

    match connect_once(config, domain, record, attempt_tls).await {
        Ok(conn) => Ok(conn),
        Err(ConnectFailure::Tls(status)) if config.tls.policy == TlsPolicy::Opportunistic => {
            debug!(
                domain,
                mx = %record.host,
                %status,
                "TLS negotiation failed, retrying in plaintext"
            );
            connect_once(config, domain, record, false)
                .await
                .map_err(ConnectFailure::into_status)
        }
        Err(failure) => Err(failure.into_status()),
    }
}

async fn connect_once(
    config: &DeliveryConfig,
    domain: &str,
    record: &MxRecord,
    attempt_tls: bool,
) -> Result<MxConn, ConnectFailure> {
    let timeouts = &config.timeouts;
    let address = record.address();

    let mut client = with_timeout(timeouts.connect(), SmtpClient::connect(&address, &record.host))
        .await
        .map_err(|err| ConnectFailure::Other(err.into()))?
        .accept_invalid_certs(config.tls.accept_invalid_certs);

    let greeting = with_timeout(timeouts.command(), client.read_greeting())
        .await
        .map_err(|err| ConnectFailure::Other(err.into()))?;
    if !greeting.is_success() {
        return Err(ConnectFailure::Other(greeting.to_status()));
    }

    let ehlo = with_timeout(timeouts.command(), client.ehlo(&config.hostname))
        .await
        .map_err(|err| ConnectFailure::Other(err.into()))?;
    if !ehlo.is_success() {
        let helo = with_timeout(timeouts.command(), client.helo(&config.hostname))
            .await
            .map_err(|err| ConnectFailure::Other(err.into()))?;
        if !helo.is_success() {
            return Err(ConnectFailure::Other(helo.to_status()));
        }
    }

    let mut security = SecurityLevel::Plaintext;
    if attempt_tls && client.has_capability("STARTTLS") {
        match with_timeout(timeouts.command(), client.starttls()).await {
            Ok(response) if response.is_success() => {
                security = if config.tls.accept_invalid_certs {
                    SecurityLevel::Encrypted
                } else {
                    SecurityLevel::Authenticated
                };

                // the protocol state reset with the upgrade
                let ehlo = with_timeout(timeouts.command(), client.ehlo(&config.hostname))
                    .await
                    .map_err(|err| ConnectFailure::Other(err.into()))?;
                if !ehlo.is_success() {
                    return Err(ConnectFailure::Other(ehlo.to_status()));
                }
            }
            Ok(rejection) => {
                debug!(
                    domain,
                    mx = %record.host,
                    code = rejection.code,
                    "STARTTLS rejected, continuing in plaintext"
                );
            }
            Err(err) => return Err(ConnectFailure::Tls(err.into())),
        }
    }

    Ok(MxConn {
        domain: domain.to_owned(),
        mx_host: record.host.clone(),
        client,
        security,
        errored: false,
        transactions: 0,
        last_use: Instant::now(),
        dest_slot: None,
    })
}
