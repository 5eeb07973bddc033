use std::{net::SocketAddr, sync::Arc, time::Duration};

use mireka_common::{Signal, error::SessionError, incoming, internal, outgoing, tracing};
use mireka_smtp::connection::{Connection, Line};
use mireka_tracing::traced;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast::Receiver,
};

use crate::{
    Pop3User,
    command::Command,
    error::Pop3Error,
    maildrop::{MaildropRepository, MaildropTransaction},
};

/// RFC 2449 allows 255 octets per command line.
const MAX_COMMAND_LINE: usize = 255;

const CAPABILITIES: &[&str] = &[
    "TOP",
    "USER",
    "RESP-CODES",
    "AUTH-RESP-CODE",
    "PIPELINING",
    "UIDL",
    "IMPLEMENTATION Mireka",
];

#[derive(Debug)]
pub struct SessionConfig {
    pub server_name: Arc<str>,
    pub users: Vec<Pop3User>,
    pub repository: Arc<MaildropRepository>,
    pub command_timeout: Duration,
}

enum State {
    Authorization,
    PasswordExpected(String),
    Transaction(MaildropTransaction),
}

#[derive(PartialEq, Eq)]
enum Event {
    KeepAlive,
    Close,
}

/// Appends `content` as the body of a multi-line response: lines starting
/// with a dot get another one, and the terminating `.` line follows.
fn dot_stuff(out: &mut Vec<u8>, content: &[u8]) {
    let mut at_line_start = true;
    for &byte in content {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    if !at_line_start {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
}

/// The header section with its closing empty line, followed by at most
/// `lines` lines of the body.
fn top(content: &[u8], lines: usize) -> &[u8] {
    let mut in_header = true;
    let mut body_lines = 0;
    let mut end = 0;

    for line in content.split_inclusive(|&b| b == b'\n') {
        if in_header {
            in_header = !(line == b"\r\n" || line == b"\n");
        } else if body_lines < lines {
            body_lines += 1;
        } else {
            break;
        }
        end += line.len();
    }

    &content[..end]
}

/// One POP3 conversation (RFC 1939) with a connected client.
pub struct Session<Stream> {
    peer: SocketAddr,
    connection: Connection<Stream>,
    config: SessionConfig,
    state: State,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn create(stream: Stream, peer: SocketAddr, config: SessionConfig) -> Self {
        Self {
            peer,
            connection: Connection::new(stream),
            config,
            state: State::Authorization,
        }
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip_all, fields(peer = %self.peer), ret), timing(precision = "us"))]
    pub async fn run(mut self, mut signal: Receiver<Signal>) -> Result<(), SessionError> {
        internal!("Connected");

        let greeting = format!("+OK {} Mireka POP3 server ready", self.config.server_name);
        let result = match self.respond(&greeting).await {
            Ok(()) => self.serve(&mut signal).await,
            Err(err) => Err(err),
        };

        // Without QUIT the deletions are abandoned.
        self.state = State::Authorization;
        internal!("Connection closed");

        result
    }

    async fn serve(&mut self, signal: &mut Receiver<Signal>) -> Result<(), SessionError> {
        loop {
            let line = tokio::select! {
                _ = signal.recv() => {
                    self.respond("-ERR [SYS/TEMP] Server shutting down").await?;
                    return Ok(());
                }
                line = tokio::time::timeout(
                    self.config.command_timeout,
                    self.connection.read_line(MAX_COMMAND_LINE),
                ) => line,
            };

            let Ok(line) = line else {
                let secs = self.config.command_timeout.as_secs();
                tracing::warn!(peer = %self.peer, secs, "Client connection timed out");
                return Err(SessionError::Timeout(secs));
            };

            let event = match line? {
                None => return Ok(()),
                Some(Line::TooLong) => {
                    self.respond("-ERR Syntax error: line too long").await?;
                    Event::KeepAlive
                }
                Some(Line::Complete(line)) => {
                    let line = String::from_utf8_lossy(&line);
                    match Command::try_from(&*line) {
                        Ok(command) => {
                            incoming!("{command}");
                            self.handle_command(command).await?
                        }
                        Err(err) => {
                            incoming!("Unparsable command line");
                            self.respond(&err.response()).await?;
                            Event::KeepAlive
                        }
                    }
                }
            };

            if event == Event::Close {
                return Ok(());
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<Event, SessionError> {
        if command == Command::Quit {
            return self.quit().await;
        }

        match self.execute(command).await {
            Ok(response) => {
                self.connection.write(&response).await?;
            }
            Err(err) => {
                internal!(level = DEBUG, "Command failed: {err}");
                self.respond(&err.response()).await?;
            }
        }
        Ok(Event::KeepAlive)
    }

    /// The complete response to a successful command.
    async fn execute(&mut self, command: Command) -> Result<Vec<u8>, Pop3Error> {
        let mut out = Vec::new();

        match command {
            Command::Capa => {
                line(&mut out, "+OK Capability list follows");
                for capability in CAPABILITIES {
                    line(&mut out, capability);
                }
                line(&mut out, ".");
            }
            Command::User(user) => {
                if !matches!(self.state, State::Authorization) {
                    return Err(Pop3Error::IllegalState);
                }
                self.state = State::PasswordExpected(user);
                line(&mut out, "+OK Proceed to password");
            }
            Command::Pass(password) => {
                let State::PasswordExpected(user) = &self.state else {
                    return Err(Pop3Error::IllegalState);
                };
                let user = user.clone();
                self.state = State::Authorization;
                let transaction = self.login(&user, &password).await?;
                self.state = State::Transaction(transaction);
                line(&mut out, "+OK Maildrop locked and ready");
            }
            command => {
                let State::Transaction(transaction) = &self.state else {
                    return Err(Pop3Error::IllegalState);
                };
                Self::transaction_command(transaction, command, &mut out).await?;
            }
        }

        Ok(out)
    }

    async fn login(&self, username: &str, password: &str) -> Result<MaildropTransaction, Pop3Error> {
        let Some(user) = self
            .config
            .users
            .iter()
            .find(|user| user.username == username && user.password == password)
        else {
            internal!(level = INFO, "Unsuccessful login attempt for {username} from {}", self.peer);
            return Err(Pop3Error::Authentication);
        };

        let maildrop = self.config.repository.get(&user.maildrop);
        let transaction = maildrop.begin().await?;
        internal!(level = INFO, "{username} logged in to maildrop {}", maildrop.name());
        Ok(transaction)
    }

    async fn transaction_command(
        transaction: &MaildropTransaction,
        command: Command,
        out: &mut Vec<u8>,
    ) -> Result<(), Pop3Error> {
        match command {
            Command::Stat => {
                let (count, octets) = transaction.stat();
                line(out, &format!("+OK {count} {octets}"));
            }
            Command::List(None) => {
                let listings = transaction.scan_listings();
                let total: u64 = listings.iter().map(|listing| listing.octets).sum();
                line(out, &format!("+OK {} messages ({total})", listings.len()));
                for listing in listings {
                    line(out, &format!("{} {}", listing.number, listing.octets));
                }
                line(out, ".");
            }
            Command::List(Some(number)) => {
                let listing = transaction.scan_listing(number)?;
                line(out, &format!("+OK {} {}", listing.number, listing.octets));
            }
            Command::Uidl(None) => {
                line(out, "+OK");
                for listing in transaction.uid_listings() {
                    line(out, &format!("{} {}", listing.number, listing.uid));
                }
                line(out, ".");
            }
            Command::Uidl(Some(number)) => {
                let listing = transaction.uid_listing(number)?;
                line(out, &format!("+OK {} {}", listing.number, listing.uid));
            }
            Command::Retr(number) => {
                let content = transaction.read(number).await?;
                line(out, &format!("+OK {} octets", content.len()));
                dot_stuff(out, &content);
            }
            Command::Top { message, lines } => {
                let content = transaction.read(message).await?;
                line(out, "+OK");
                dot_stuff(out, top(&content, lines));
            }
            Command::Dele(number) => {
                transaction.delete(number)?;
                line(out, "+OK message deleted");
            }
            Command::Rset => {
                transaction.reset();
                let (count, octets) = transaction.stat();
                line(out, &format!("+OK maildrop has {count} messages ({octets} octets)"));
            }
            Command::Noop => line(out, "+OK"),
            Command::User(_) | Command::Pass(_) | Command::Quit | Command::Capa => {
                return Err(Pop3Error::IllegalState);
            }
        }
        Ok(())
    }

    /// Enters the UPDATE state when a transaction is open and ends the
    /// session.
    async fn quit(&mut self) -> Result<Event, SessionError> {
        let state = std::mem::replace(&mut self.state, State::Authorization);
        let committed = match state {
            State::Transaction(transaction) => transaction.commit().await,
            State::Authorization | State::PasswordExpected(_) => Ok(()),
        };

        match committed {
            Ok(()) => {
                let farewell = format!("+OK {} POP3 server signing off", self.config.server_name);
                self.respond(&farewell).await?;
            }
            Err(err) => self.respond(&err.response()).await?,
        }
        Ok(Event::Close)
    }

    async fn respond(&mut self, response: &str) -> Result<(), SessionError> {
        let mut out = Vec::with_capacity(response.len() + 2);
        line(&mut out, response);
        self.connection.write(&out).await.map_err(|err| {
            internal!(level = DEBUG, "Failed to send response: {err}");
            SessionError::Connection(err)
        })
    }
}

fn line(out: &mut Vec<u8>, text: &str) {
    outgoing!("{text}");
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(b"\r\n");
}
