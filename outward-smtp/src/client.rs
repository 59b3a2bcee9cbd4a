//! The SMTP client session: plain TCP, upgradeable to TLS via STARTTLS.

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};
use tracing::warn;

use crate::{
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the reply read buffer.
const BUFFER_SIZE: usize = 8192;

/// Upper bound on reply buffer growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum Stream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Stream {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn upgrade_to_tls(self, server_name: &str, accept_invalid_certs: bool) -> Result<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::Tls("session is already TLS".into()));
        };

        let mut root_store = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            root_store
                .add(cert)
                .map_err(|e| ClientError::Tls(format!("failed to add certificate: {e}")))?;
        }
        if !certs.errors.is_empty() {
            warn!(errors = ?certs.errors, "some system certificates could not be loaded");
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if accept_invalid_certs {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier));
        }

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| ClientError::Tls(format!("invalid server name: {e}")))?;

        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ClientError::Tls(e.to_string()))?;

        Ok(Self::Tls(Box::new(tls_stream)))
    }
}

/// A certificate verifier that accepts any certificate. Used for the
/// encrypted-but-unverified rungs of opportunistic TLS, never when a policy
/// demands an authenticated channel.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        CryptoProvider::get_default().map_or_else(Vec::new, |provider| {
            provider.signature_verification_algorithms.supported_schemes()
        })
    }
}

/// One SMTP session with a remote exchanger.
///
/// Replies are returned to the caller whatever their code; only transport
/// failures surface as errors. Timeouts are the caller's concern, applied
/// per operation.
pub struct SmtpClient {
    connection: Option<Stream>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_name: String,
    capabilities: Option<Response>,
    accept_invalid_certs: bool,
}

impl SmtpClient {
    /// Opens a TCP session to `addr`. `server_name` is the name later
    /// presented for TLS certificate verification.
    ///
    /// # Errors
    /// [`ClientError::Io`] if the connection cannot be established.
    pub async fn connect(addr: &str, server_name: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;

        Ok(Self {
            connection: Some(Stream::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_name: server_name.to_owned(),
            capabilities: None,
            accept_invalid_certs: false,
        })
    }

    /// Accept any TLS certificate during STARTTLS. Off by default.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Whether the session has been upgraded to TLS.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(self.connection, Some(Stream::Tls(_)))
    }

    /// The remote address of the underlying socket.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self.connection.as_ref()? {
            Stream::Plain(stream) => stream.peer_addr().ok(),
            Stream::Tls(stream) => stream.get_ref().0.peer_addr().ok(),
        }
    }

    /// Reads the server's `220` greeting.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Sends one command line and reads the reply.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        let data = format!("{command}\r\n");
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data.as_bytes())
            .await?;
        self.read_response().await
    }

    /// Sends EHLO, remembering the advertised capabilities on success.
    pub async fn ehlo(&mut self, hostname: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {hostname}")).await?;
        if response.is_success() {
            self.capabilities = Some(response.clone());
        }
        Ok(response)
    }

    /// Sends HELO, the fallback for servers that reject EHLO.
    pub async fn helo(&mut self, hostname: &str) -> Result<Response> {
        let response = self.command(&format!("HELO {hostname}")).await?;
        if response.is_success() {
            self.capabilities = None;
        }
        Ok(response)
    }

    /// Whether the last successful EHLO advertised `name`.
    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities
            .as_ref()
            .is_some_and(|response| response.has_capability(name))
    }

    pub async fn mail_from(&mut self, reverse_path: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{reverse_path}>")).await
    }

    pub async fn rcpt_to(&mut self, forward_path: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{forward_path}>")).await
    }

    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Transmits the message payload after an accepted DATA, dot-stuffed
    /// and terminated with the end-of-data marker, and reads the verdict.
    pub async fn send_payload(&mut self, payload: &[u8]) -> Result<Response> {
        let stuffed = dot_stuff(payload);
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;

        connection.send(&stuffed).await?;
        if !stuffed.ends_with(b"\r\n") {
            connection.send(b"\r\n").await?;
        }
        connection.send(b".\r\n").await?;

        self.read_response().await
    }

    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// Sends STARTTLS and, if the server accepts, upgrades the session.
    /// Previously learned capabilities are discarded; the caller must EHLO
    /// again on the encrypted channel.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            let connection = self
                .connection
                .take()
                .ok_or(ClientError::ConnectionClosed)?;
            self.connection = Some(
                connection
                    .upgrade_to_tls(&self.server_name, self.accept_invalid_certs)
                    .await?,
            );
            self.capabilities = None;
            self.buffer_pos = 0;
        }

        Ok(response)
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) = Response::parse(&self.buffer[..self.buffer_pos])? {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::Parse(format!(
                        "reply exceeds {MAX_BUFFER_SIZE} bytes"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

/// Doubles any dot that starts a line, per RFC 5321 §4.5.2.
fn dot_stuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    let mut at_line_start = true;
    for &byte in payload {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    out
}
