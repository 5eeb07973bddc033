//! Scripted SMTP server standing in for backends and remote mail
//! exchangers.
//!
//! Every command is recorded. Replies are configured per command, and RCPT
//! replies additionally per recipient address.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    MessageContent(Vec<u8>),
    Rset,
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    message: String,
}

impl Reply {
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

#[derive(Debug, Clone)]
struct Script {
    greeting: Reply,
    ehlo: Reply,
    mail_from: Reply,
    rcpt_to: Reply,
    rcpt_to_per_address: HashMap<String, Reply>,
    data: Reply,
    data_end: Reply,
    drop_after_commands: Option<usize>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "mock.test ESMTP"),
            ehlo: Reply::new(250, "mock.test"),
            mail_from: Reply::new(250, "2.1.0 Ok"),
            rcpt_to: Reply::new(250, "2.1.5 Ok"),
            rcpt_to_per_address: HashMap::new(),
            data: Reply::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end: Reply::new(250, "2.0.0 Queued"),
            drop_after_commands: None,
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<SmtpCommand>>>,
    connections: Arc<Mutex<usize>>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: Script::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.lock().clone()
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        *self.connections.lock()
    }

    /// Bodies received, without the terminating dot.
    #[must_use]
    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.commands()
            .into_iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(content) => Some(content),
                _ => None,
            })
            .collect()
    }

    async fn handle_client(
        mut stream: TcpStream,
        script: Arc<Script>,
        commands: Arc<Mutex<Vec<SmtpCommand>>>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut count = 0;

        writer.write_all(&script.greeting.to_bytes()).await?;

        loop {
            if script.drop_after_commands.is_some_and(|limit| count >= limit) {
                return Ok(());
            }

            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            count += 1;

            let text = line.trim_end().to_string();
            let (verb, argument) = text.split_once(' ').unwrap_or((text.as_str(), ""));
            let (command, reply) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => (SmtpCommand::Ehlo(argument.to_string()), script.ehlo.clone()),
                "HELO" => (SmtpCommand::Helo(argument.to_string()), script.ehlo.clone()),
                "MAIL" => (
                    SmtpCommand::MailFrom(path(argument)),
                    script.mail_from.clone(),
                ),
                "RCPT" => {
                    let address = path(argument);
                    let reply = script
                        .rcpt_to_per_address
                        .get(&address.to_ascii_lowercase())
                        .unwrap_or(&script.rcpt_to)
                        .clone();
                    (SmtpCommand::RcptTo(address), reply)
                }
                "DATA" => (SmtpCommand::Data, script.data.clone()),
                "RSET" => (SmtpCommand::Rset, Reply::new(250, "2.0.0 Ok")),
                "QUIT" => {
                    commands.lock().push(SmtpCommand::Quit);
                    writer.write_all(b"221 2.0.0 Bye\r\n").await?;
                    return Ok(());
                }
                _ => (SmtpCommand::Other(text.clone()), Reply::new(500, "Unknown command")),
            };

            let reading_content = command == SmtpCommand::Data && reply.code == 354;
            commands.lock().push(command);
            writer.write_all(&reply.to_bytes()).await?;

            if reading_content {
                let mut content = Vec::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await? == 0 {
                        return Ok(());
                    }
                    if line == ".\r\n" || line == ".\n" {
                        break;
                    }
                    let unstuffed = line.strip_prefix('.').unwrap_or(&line);
                    content.extend_from_slice(unstuffed.as_bytes());
                }
                commands.lock().push(SmtpCommand::MessageContent(content));
                writer.write_all(&script.data_end.to_bytes()).await?;
            }
        }
    }
}

/// The address inside `FROM:<...>` or `TO:<...>`.
fn path(argument: &str) -> String {
    let start = argument.find('<').map_or(0, |i| i + 1);
    let end = argument.rfind('>').unwrap_or(argument.len());
    argument.get(start..end).unwrap_or_default().to_string()
}

pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.mail_from = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.rcpt_to = Reply::new(code, message);
        self
    }

    /// Reply for one particular recipient address.
    #[must_use]
    pub fn with_rcpt_to_response_for(
        mut self,
        address: &str,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.script
            .rcpt_to_per_address
            .insert(address.to_ascii_lowercase(), Reply::new(code, message));
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.data_end = Reply::new(code, message);
        self
    }

    /// Close the connection without a reply once `count` commands were read.
    #[must_use]
    pub const fn with_network_error_after_commands(mut self, count: usize) -> Self {
        self.script.drop_after_commands = Some(count);
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let commands = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0));

        let server = MockSmtpServer {
            addr,
            commands: Arc::clone(&commands),
            connections: Arc::clone(&connections),
        };

        // Runs until the test's runtime goes away.
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {

                *connections.lock() += 1;
                let script = Arc::clone(&script);
                let commands = Arc::clone(&commands);
                tokio::spawn(async move {
                    let _ = MockSmtpServer::handle_client(stream, script, commands).await;
                });
            }
        });

        Ok(server)
    }
}
