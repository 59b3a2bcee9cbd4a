//! Scriptable SMTP server for exercising delivery sessions end to end.
//!
//! Every accepted connection walks a canned dialogue: a configurable
//! greeting, per-command reply overrides, an optional per-connection RCPT
//! reply sequence, and failure injection (delayed replies, mid-session
//! drops). Commands and message payloads are recorded for assertions.
//!
//! # Example
//!
//! ```rust,no_run
//! use support::mock_server::MockSmtpServer;
//!
//! # async fn example() -> Result<(), std::io::Error> {
//! let server = MockSmtpServer::builder()
//!     .with_rcpt_to_response(550, "5.1.1 No such user")
//!     .build()
//!     .await?;
//!
//! // connect a client to server.addr() and drive the session
//! # Ok(())
//! # }
//! ```
#![allow(dead_code)] // shared by several test binaries, none uses everything

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// One command observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// EHLO with the client's hostname
    Ehlo(String),
    /// HELO with the client's hostname
    Helo(String),
    /// MAIL with its argument, e.g. `FROM:<sender@example.org>`
    MailFrom(String),
    /// RCPT with its argument, e.g. `TO:<user@example.org>`
    RcptTo(String),
    /// DATA command
    Data,
    /// Payload received after the DATA go-ahead, still dot-stuffed
    MessageContent(Vec<u8>),
    /// RSET command
    Rset,
    /// QUIT command
    Quit,
    /// STARTTLS command
    StartTls,
    /// Anything else
    Other(String),
}

/// One canned reply.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

/// The EHLO reply: first entry is the identification line, the rest are
/// capability lines.
#[derive(Clone)]
struct EhloResponse {
    code: u16,
    capabilities: Vec<String>,
}

impl EhloResponse {
    fn to_bytes(&self) -> Vec<u8> {
        let mut response = String::new();
        let count = self.capabilities.len();

        for (i, cap) in self.capabilities.iter().enumerate() {
            if i < count - 1 {
                let _ = write!(&mut response, "{}-{}\r\n", self.code, cap);
            } else {
                let _ = write!(&mut response, "{} {}\r\n", self.code, cap);
            }
        }

        response.into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    ehlo_response: EhloResponse,
    helo_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    /// Consumed in order per connection; the last entry repeats.
    rcpt_to_responses: Vec<SmtpResponse>,
    data_response: SmtpResponse,
    data_end_response: SmtpResponse,
    rset_response: SmtpResponse,
    quit_response: SmtpResponse,
    starttls_response: Option<SmtpResponse>,

    // Failure injection
    greeting_delay: Option<Duration>,
    response_delay: Option<Duration>,
    drop_after_commands: Option<usize>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "mock.test ESMTP ready"),
            ehlo_response: EhloResponse {
                code: 250,
                capabilities: vec!["mock.test".to_string(), "SIZE 10485760".to_string()],
            },
            helo_response: SmtpResponse::new(250, "mock.test"),
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_responses: vec![SmtpResponse::new(250, "OK")],
            data_response: SmtpResponse::new(354, "End data with <CRLF>.<CRLF>"),
            data_end_response: SmtpResponse::new(250, "OK: queued"),
            rset_response: SmtpResponse::new(250, "OK"),
            quit_response: SmtpResponse::new(221, "Bye"),
            starttls_response: None,
            greeting_delay: None,
            response_delay: None,
            drop_after_commands: None,
        }
    }
}

/// A mock SMTP server listening on a random loopback port.
pub struct MockSmtpServer {
    addr: SocketAddr,
    commands_received: Arc<RwLock<Vec<SmtpCommand>>>,
    shutdown: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
}

impl MockSmtpServer {
    /// Create a new builder for configuring the mock server.
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::new()
    }

    /// The address the server is listening on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// All commands received so far, across every connection.
    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands_received.read().await.clone()
    }

    /// How many connections have been accepted.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Drive one client connection through the canned dialogue.
    #[allow(clippy::too_many_lines)]
    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockServerConfig>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(delay) = config.greeting_delay {
            tokio::time::sleep(delay).await;
        }

        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut command_count = 0;
        let mut rcpt_index = 0;

        writer.write_all(&config.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            line.clear();

            if let Some(drop_after) = config.drop_after_commands
                && command_count >= drop_after
            {
                // Silently close the connection
                return Ok(());
            }

            let read_result = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await;
            if read_result.is_err() {
                // Client went quiet; give up on the session
                return Ok(());
            }

            let bytes_read = read_result??;
            if bytes_read == 0 {
                return Ok(());
            }

            command_count += 1;

            let cmd_line = line.trim();
            tracing::debug!("mock server received: {}", cmd_line);

            let parts: Vec<&str> = cmd_line.splitn(2, ' ').collect();
            let command = parts[0].to_uppercase();

            let (response, smtp_cmd) = match command.as_str() {
                "EHLO" => {
                    let hostname = parts.get(1).unwrap_or(&"").to_string();
                    (config.ehlo_response.to_bytes(), SmtpCommand::Ehlo(hostname))
                }
                "HELO" => {
                    let hostname = parts.get(1).unwrap_or(&"").to_string();
                    (config.helo_response.to_bytes(), SmtpCommand::Helo(hostname))
                }
                "MAIL" => {
                    let from = parts.get(1).unwrap_or(&"").to_string();
                    (
                        config.mail_from_response.to_bytes(),
                        SmtpCommand::MailFrom(from),
                    )
                }
                "RCPT" => {
                    let to = parts.get(1).unwrap_or(&"").to_string();
                    let index = rcpt_index.min(config.rcpt_to_responses.len() - 1);
                    rcpt_index += 1;
                    (
                        config.rcpt_to_responses[index].to_bytes(),
                        SmtpCommand::RcptTo(to),
                    )
                }
                "DATA" => (config.data_response.to_bytes(), SmtpCommand::Data),
                "RSET" => (config.rset_response.to_bytes(), SmtpCommand::Rset),
                "QUIT" => {
                    let resp = config.quit_response.to_bytes();
                    commands.write().await.push(SmtpCommand::Quit);
                    writer.write_all(&resp).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                "STARTTLS" => {
                    let resp = config.starttls_response.clone().unwrap_or_else(|| {
                        SmtpResponse::new(502, "Command not implemented")
                    });
                    commands.write().await.push(SmtpCommand::StartTls);
                    writer.write_all(&resp.to_bytes()).await?;
                    writer.flush().await?;
                    if (200..300).contains(&resp.code) {
                        // There is no TLS stack behind this dialogue, so a
                        // positive STARTTLS reply is followed by closing
                        // the stream; the client observes the disconnect
                        // as a failed negotiation.
                        return Ok(());
                    }
                    continue;
                }
                _ => (
                    SmtpResponse::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(cmd_line.to_string()),
                ),
            };

            commands.write().await.push(smtp_cmd.clone());

            // After the go-ahead, collect payload until <CRLF>.<CRLF>
            if matches!(smtp_cmd, SmtpCommand::Data) && config.data_response.code == 354 {
                writer.write_all(&response).await?;
                writer.flush().await?;

                let mut message_content = Vec::new();
                let mut data_line = String::new();

                loop {
                    data_line.clear();
                    let bytes_read = reader.read_line(&mut data_line).await?;
                    if bytes_read == 0 {
                        return Ok(());
                    }

                    if data_line.trim_end() == "." {
                        commands
                            .write()
                            .await
                            .push(SmtpCommand::MessageContent(message_content.clone()));

                        if let Some(delay) = config.response_delay {
                            tokio::time::sleep(delay).await;
                        }
                        writer
                            .write_all(&config.data_end_response.to_bytes())
                            .await?;
                        writer.flush().await?;
                        break;
                    }

                    message_content.extend_from_slice(data_line.as_bytes());
                }
                continue;
            }

            if let Some(delay) = config.response_delay {
                tokio::time::sleep(delay).await;
            }

            writer.write_all(&response).await?;
            writer.flush().await?;
        }
    }
}

/// Builder for configuring a [`MockSmtpServer`].
pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    fn new() -> Self {
        Self {
            config: MockServerConfig::default(),
        }
    }

    /// Set the greeting banner.
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    /// Set the EHLO reply. The first entry is the identification line; a
    /// non-2xx code turns the whole reply into a rejection.
    #[must_use]
    pub fn with_ehlo_response(mut self, code: u16, capabilities: Vec<String>) -> Self {
        self.config.ehlo_response = EhloResponse { code, capabilities };
        self
    }

    /// Set the HELO reply.
    #[must_use]
    pub fn with_helo_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.helo_response = SmtpResponse::new(code, message);
        self
    }

    /// Set the MAIL FROM reply.
    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from_response = SmtpResponse::new(code, message);
        self
    }

    /// Set one reply for every RCPT TO.
    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to_responses = vec![SmtpResponse::new(code, message)];
        self
    }

    /// Set a per-connection sequence of RCPT TO replies, consumed in
    /// order; the last entry repeats for any further recipients.
    #[must_use]
    pub fn with_rcpt_to_sequence(mut self, responses: &[(u16, &str)]) -> Self {
        self.config.rcpt_to_responses = responses
            .iter()
            .map(|(code, message)| SmtpResponse::new(*code, *message))
            .collect();
        self
    }

    /// Set the DATA command reply. Payload is only read after a 354.
    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_response = SmtpResponse::new(code, message);
        self
    }

    /// Set the reply sent after the end-of-data marker.
    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    /// Set the STARTTLS reply. A 2xx is followed by closing the stream,
    /// which the client observes as a failed TLS negotiation.
    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.starttls_response = Some(SmtpResponse::new(code, message));
        self
    }

    /// Delay the greeting banner, stalling clients at the first read.
    #[must_use]
    pub const fn with_greeting_delay(mut self, delay: Duration) -> Self {
        self.config.greeting_delay = Some(delay);
        self
    }

    /// Delay every command reply and the end-of-data reply.
    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.config.response_delay = Some(delay);
        self
    }

    /// Silently drop each connection after it has read N commands.
    #[must_use]
    pub const fn with_drop_after_commands(mut self, count: usize) -> Self {
        self.config.drop_after_commands = Some(count);
        self
    }

    /// Build and start the mock SMTP server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to a port.
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));

        let accept_config = Arc::clone(&config);
        let accept_commands = Arc::clone(&commands);
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_connections = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                if accept_shutdown.load(Ordering::Relaxed) {
                    break;
                }

                // Accept with a timeout so the shutdown flag gets polled
                let accepted = timeout(Duration::from_millis(100), listener.accept()).await;

                if let Ok(Ok((stream, _peer))) = accepted {
                    accept_connections.fetch_add(1, Ordering::Relaxed);
                    let config = Arc::clone(&accept_config);
                    let commands = Arc::clone(&accept_commands);

                    tokio::spawn(async move {
                        if let Err(e) =
                            MockSmtpServer::handle_client(stream, config, commands).await
                        {
                            tracing::debug!("mock server client error: {}", e);
                        }
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands_received: commands,
            shutdown,
            connections,
        })
    }
}
