use std::{
    fmt::{self, Display, Formatter},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use mxrelay_common::{
    Signal, envelope::Envelope, error::SessionError, handler::EnvelopeHandler, incoming,
    internal, outgoing,
    status::{Rejection, Status},
};
use serde::Deserialize;
use tokio::{
    io::{
        AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
        BufStream,
    },
    sync::broadcast::{self, error::RecvError},
    time::timeout,
};

use crate::command::{Command, HeloVariant};

/// 10 MiB
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Longest command line accepted, including the trailing CRLF.
const MAX_COMMAND_LINE: usize = 1000;

/// Upper bound on a single read while receiving message data.
const DATA_CHUNK: u64 = 64 * 1024;

/// Longest reply line sent, including the code and the trailing CRLF (RFC 5321 4.5.3.1.5).
const MAX_REPLY_LINE: usize = 512;

/// Cuts `text` to at most `max` bytes without splitting a character.
fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }

    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

const fn default_command_secs() -> u64 {
    300
}

const fn default_data_block_secs() -> u64 {
    180
}

/// Server side timeouts, following RFC 5321 section 4.5.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SessionTimeouts {
    /// Waiting for the next command
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,

    /// Waiting for each block of message data
    #[serde(default = "default_data_block_secs")]
    pub data_block_secs: u64,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            command_secs: default_command_secs(),
            data_block_secs: default_data_block_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    banner: Arc<str>,
    max_message_size: usize,
    timeouts: SessionTimeouts,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            banner: Arc::from("localhost"),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            timeouts: SessionTimeouts::default(),
        }
    }
}

impl SessionConfig {
    /// Host name used in the greeting and the EHLO reply
    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<Arc<str>>) -> Self {
        self.banner = banner.into();
        self
    }

    /// Maximum message size in bytes. A value of 0 disables the limit.
    #[must_use]
    pub const fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn banner(&self) -> &str {
        &self.banner
    }

    pub const fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

/// A single reply, possibly spanning multiple lines.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    status: Status,
    lines: Vec<String>,
}

impl Reply {
    fn new(status: Status, text: impl Into<String>) -> Self {
        Self {
            status,
            lines: vec![text.into()],
        }
    }
}

impl From<Rejection> for Reply {
    fn from(rejection: Rejection) -> Self {
        Self::new(
            rejection.status,
            format!("{} {}", rejection.enhanced, rejection.message),
        )
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);

        for (i, line) in self.lines.iter().enumerate() {
            let separator = if i == last { ' ' } else { '-' };
            // A reply line may never carry its own line breaks
            let line = line.replace(['\r', '\n'], " ");
            let line = truncate(&line, MAX_REPLY_LINE - "250-\r\n".len());
            write!(f, "{}{separator}{line}\r\n", self.status)?;
        }

        Ok(())
    }
}

#[derive(Debug)]
struct Transaction {
    sender: String,
    recipients: Vec<String>,
}

enum Input {
    Line,
    TooLong,
    Closed,
}

/// Reads one CRLF terminated line into `line`, never buffering more than `max` bytes.
///
/// Bytes read before a cancellation stay in `line`, so the read can be resumed.
async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max: usize,
) -> Result<Input, SessionError> {
    let limit = u64::try_from(max.saturating_sub(line.len())).unwrap_or(u64::MAX);
    (&mut *reader).take(limit).read_until(b'\n', line).await?;

    if line.ends_with(b"\n") {
        return Ok(Input::Line);
    }

    if line.len() < max {
        return Ok(Input::Closed);
    }

    // Discard the remainder of the oversized line
    let mut scratch = Vec::new();
    loop {
        scratch.clear();
        let chunk = u64::try_from(max).unwrap_or(u64::MAX);
        if (&mut *reader).take(chunk).read_until(b'\n', &mut scratch).await? == 0 {
            return Ok(Input::Closed);
        }
        if scratch.ends_with(b"\n") {
            return Ok(Input::TooLong);
        }
    }
}

/// One inbound conversation, accepting at most one recipient per transaction.
pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    peer: SocketAddr,
    stream: BufStream<Stream>,
    handler: Arc<dyn EnvelopeHandler>,
    config: SessionConfig,
    greeted: bool,
    transaction: Option<Transaction>,
    line: Vec<u8>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn new(
        stream: Stream,
        peer: SocketAddr,
        handler: Arc<dyn EnvelopeHandler>,
        config: SessionConfig,
    ) -> Self {
        Self {
            peer,
            stream: BufStream::new(stream),
            handler,
            config,
            greeted: false,
            transaction: None,
            line: Vec::with_capacity(MAX_COMMAND_LINE),
        }
    }

    /// Drives the conversation until the client quits or disconnects.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Timeout`] if the client goes idle,
    /// [`SessionError::Shutdown`] if a shutdown was signalled while waiting for
    /// a command, and [`SessionError::Connection`] for I/O failures. Both of the
    /// former are announced to the client with a `421` before closing.
    #[tracing::instrument(level = "debug", skip_all, fields(peer = %self.peer))]
    pub async fn run(mut self, mut signal: broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        internal!("Connected");

        let result = self.converse(&mut signal).await;

        let farewell = match &result {
            Err(SessionError::Timeout(_)) => Some(Reply::new(
                Status::Unavailable,
                format!("4.4.2 {} Error: timeout exceeded", self.config.banner),
            )),
            Err(SessionError::Shutdown) => Some(Reply::new(
                Status::Unavailable,
                format!("4.3.2 {} Service shutting down", self.config.banner),
            )),
            _ => None,
        };

        if let Some(farewell) = farewell
            && let Err(err) = self.write_reply(&farewell).await
        {
            internal!(level = DEBUG, "Unable to send closing reply: {err}");
        }

        if let Err(err) = self.stream.shutdown().await {
            internal!(level = DEBUG, "Error closing connection: {err}");
        }

        internal!("Disconnected");
        result
    }

    async fn converse(
        &mut self,
        signal: &mut broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let greeting = Reply::new(
            Status::ServiceReady,
            format!("{} ESMTP", self.config.banner),
        );
        self.write_reply(&greeting).await?;

        loop {
            let reply = match self.next_command(signal).await? {
                Input::Closed => {
                    internal!(level = DEBUG, "Client closed the connection");
                    return Ok(());
                }
                Input::TooLong => Reply::new(Status::SyntaxError, "5.5.2 Line too long"),
                Input::Line => {
                    let command = Command::try_from(self.line.as_slice()).unwrap_or_else(|e| e);
                    incoming!("{command}");

                    if command == Command::Quit {
                        self.write_reply(&Reply::new(Status::GoodBye, "2.0.0 Bye"))
                            .await?;
                        return Ok(());
                    }

                    self.dispatch(command).await?
                }
            };

            self.write_reply(&reply).await?;
        }
    }

    async fn next_command(
        &mut self,
        signal: &mut broadcast::Receiver<Signal>,
    ) -> Result<Input, SessionError> {
        let secs = self.config.timeouts.command_secs;
        let (stream, line) = (&mut self.stream, &mut self.line);
        line.clear();

        let read = async move {
            let mut listening = true;

            loop {
                tokio::select! {
                    sig = signal.recv(), if listening => match sig {
                        Ok(Signal::Shutdown) => return Err(SessionError::Shutdown),
                        Err(RecvError::Closed) => listening = false,
                        Err(RecvError::Lagged(_)) => {}
                    },
                    input = read_line(stream, line, MAX_COMMAND_LINE) => return input,
                }
            }
        };

        timeout(Duration::from_secs(secs), read)
            .await
            .map_err(|_| SessionError::Timeout(secs))?
    }

    async fn dispatch(&mut self, command: Command) -> Result<Reply, SessionError> {
        let banner = Arc::clone(&self.config.banner);

        let reply = match command {
            Command::Helo(HeloVariant::Ehlo(id)) => {
                self.greeted = true;
                self.transaction = None;

                let size = match self.config.max_message_size {
                    0 => String::from("SIZE"),
                    size => format!("SIZE {size}"),
                };
                Reply {
                    status: Status::Ok,
                    lines: vec![format!("{banner} greets {id}"), size],
                }
            }
            Command::Helo(HeloVariant::Helo(id)) => {
                self.greeted = true;
                self.transaction = None;
                Reply::new(Status::Ok, format!("{banner} greets {id}"))
            }
            Command::MailFrom(_, _) if !self.greeted => Reply::new(
                Status::InvalidCommandSequence,
                "5.5.1 Send HELO/EHLO first",
            ),
            Command::MailFrom(_, _) if self.transaction.is_some() => Reply::new(
                Status::InvalidCommandSequence,
                "5.5.1 Sender already specified",
            ),
            Command::MailFrom(_, Some(declared))
                if self.config.max_message_size > 0 && declared > self.config.max_message_size =>
            {
                Reply::new(
                    Status::ExceededStorage,
                    format!(
                        "5.3.4 Declared message size {declared} exceeds maximum of {} bytes",
                        self.config.max_message_size
                    ),
                )
            }
            Command::MailFrom(sender, _) => {
                self.transaction = Some(Transaction {
                    sender,
                    recipients: Vec::with_capacity(1),
                });
                Reply::new(Status::Ok, "2.1.0 Ok")
            }
            Command::RcptTo(recipient) => match self.transaction.as_mut() {
                None => Reply::new(Status::InvalidCommandSequence, "5.5.1 Need MAIL command"),
                Some(transaction) if !transaction.recipients.is_empty() => Reply::new(
                    Status::InsufficientStorage,
                    "4.5.3 Too many recipients",
                ),
                Some(transaction) => {
                    transaction.recipients.push(recipient);
                    Reply::new(Status::Ok, "2.1.5 Ok")
                }
            },
            Command::Data => {
                match self
                    .transaction
                    .take_if(|transaction| !transaction.recipients.is_empty())
                {
                    Some(transaction) => self.receive_message(transaction).await?,
                    None => {
                        Reply::new(Status::InvalidCommandSequence, "5.5.1 Need RCPT command")
                    }
                }
            }
            Command::Rset => {
                self.transaction = None;
                Reply::new(Status::Ok, "2.0.0 Ok")
            }
            Command::Noop => Reply::new(Status::Ok, "2.0.0 Ok"),
            Command::Quit => Reply::new(Status::GoodBye, "2.0.0 Bye"),
            Command::Invalid(reason) => {
                Reply::new(Status::ParameterSyntaxError, format!("5.5.4 {reason}"))
            }
            Command::Unrecognized(_) => {
                Reply::new(Status::NotImplemented, "5.5.2 Command not recognized")
            }
        };

        Ok(reply)
    }

    async fn receive_message(&mut self, transaction: Transaction) -> Result<Reply, SessionError> {
        self.write_reply(&Reply::new(
            Status::StartMailInput,
            "End data with <CR><LF>.<CR><LF>",
        ))
        .await?;

        let Some(data) = self.read_data().await? else {
            internal!(level = WARN, "Message exceeded the size limit, discarded");
            return Ok(Reply::new(
                Status::ExceededStorage,
                format!(
                    "5.3.4 Message exceeds maximum size of {} bytes",
                    self.config.max_message_size
                ),
            ));
        };

        internal!(level = DEBUG, "Received message of {} bytes", data.len());

        let envelope =
            match Envelope::from_recipients(transaction.sender, transaction.recipients, data) {
                Ok(envelope) => envelope,
                Err(err) => {
                    return Ok(Reply::new(Status::TransactionFailed, format!("5.5.1 {err}")));
                }
            };

        Ok(match self.handler.handle(envelope).await {
            Ok(text) => Reply::new(Status::Ok, format!("2.0.0 {text}")),
            Err(rejection) => {
                internal!(level = INFO, "Message rejected: {rejection}");
                Reply::from(rejection)
            }
        })
    }

    /// Reads message data up to the terminating `.` line, undoing dot-stuffing.
    ///
    /// Returns `None` once the data exceeded the size limit; the rest is still
    /// consumed so the conversation can continue.
    async fn read_data(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        let secs = self.config.timeouts.data_block_secs;
        let max = self.config.max_message_size;

        let mut message = Vec::new();
        let mut chunk = Vec::new();
        let mut oversized = false;
        let mut at_line_start = true;

        loop {
            chunk.clear();

            let read = timeout(
                Duration::from_secs(secs),
                (&mut self.stream).take(DATA_CHUNK).read_until(b'\n', &mut chunk),
            )
            .await
            .map_err(|_| SessionError::Timeout(secs))??;

            if read == 0 {
                return Err(SessionError::Protocol(String::from(
                    "Connection closed while receiving data",
                )));
            }

            if at_line_start && matches!(chunk.as_slice(), b".\r\n" | b".\n") {
                break;
            }

            let content = match chunk.as_slice() {
                [b'.', rest @ ..] if at_line_start => rest,
                all => all,
            };

            if !oversized {
                if max > 0 && message.len().saturating_add(content.len()) > max {
                    oversized = true;
                    message = Vec::new();
                } else {
                    message.extend_from_slice(content);
                }
            }

            at_line_start = chunk.ends_with(b"\n");
        }

        Ok((!oversized).then_some(message))
    }

    async fn write_reply(&mut self, reply: &Reply) -> Result<(), SessionError> {
        let text = reply.to_string();
        outgoing!("{}", text.trim_end());

        self.stream.write_all(text.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
