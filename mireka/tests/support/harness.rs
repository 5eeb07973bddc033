//! Runs a complete server in-process on free local ports.
//!
//! The mail system part of the configuration is given as RON, exactly as it
//! would appear in the configuration file. The listeners are added here,
//! since their ports are only known at runtime.

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use mireka::{Config, Mireka};
use mireka_common::{controller::Controller, listener::Listener};
use mireka_pop3::{Pop3Args, Pop3User};
use mireka_smtp::{
    SmtpArgs,
    client::{Response, SmtpClient},
};
use mireka_transmission::StaticResolver;
use tempfile::TempDir;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::oneshot,
    task::JoinHandle,
};

const TIMEOUT: Duration = Duration::from_secs(5);

pub struct Harness {
    smtp: SocketAddr,
    pop3: SocketAddr,
    queue: TempDir,
    maildrops: TempDir,
    stop: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<anyhow::Result<()>>>,
}

fn free_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

async fn wait_until_listening(address: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(address).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on {address}");
}

impl Harness {
    /// Start a server. Inside `mail_system`, `{queue}` stands for a fresh
    /// queue directory.
    pub async fn start(mail_system: &str, users: &[(&str, &str, &str)], resolver: StaticResolver) -> Self {
        let queue = tempfile::tempdir().unwrap();
        let maildrops = tempfile::tempdir().unwrap();

        let content = format!(
            "(maildrops: {:?}, {})",
            maildrops.path().display().to_string(),
            mail_system.replace("{queue}", &queue.path().display().to_string())
        );
        let mut config = Config::parse(&content).unwrap();

        let smtp = free_port();
        let pop3 = free_port();
        config.smtp = Controller::new(vec![Listener::new(
            smtp,
            SmtpArgs::builder().with_banner("mx.test"),
        )]);
        config.pop3 = Controller::new(vec![Listener::new(
            pop3,
            users.iter().fold(
                Pop3Args::builder().with_banner("pop.test"),
                |args, &(username, password, maildrop)| {
                    args.with_user(Pop3User {
                        username: username.to_string(),
                        password: password.to_string(),
                        maildrop: maildrop.to_string(),
                    })
                },
            ),
        )]);

        let (stop, stopped) = oneshot::channel();
        let server = tokio::spawn(Mireka::new(config).with_resolver(Arc::new(resolver)).serve(async {
            let _ = stopped.await;
        }));

        wait_until_listening(smtp).await;
        wait_until_listening(pop3).await;

        Self {
            smtp,
            pop3,
            queue,
            maildrops,
            stop: Some(stop),
            server: Some(server),
        }
    }

    pub fn queue_directory(&self) -> &Path {
        self.queue.path()
    }

    pub fn maildrop_directory(&self) -> &Path {
        self.maildrops.path()
    }

    /// Runs a transaction up to the end of the recipients, returning the
    /// reply to each `RCPT`. The client stays open so DATA can follow.
    pub async fn begin(&self, from: &str, recipients: &[&str]) -> (SmtpClient, Vec<Response>) {
        let mut client = SmtpClient::connect(self.smtp, TIMEOUT).await.unwrap();
        assert_eq!(client.read_greeting().await.unwrap().code, 220);
        assert_eq!(client.ehlo("client.test").await.unwrap().code, 250);
        assert_eq!(client.mail_from(from, None).await.unwrap().code, 250);

        let mut replies = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            replies.push(client.rcpt_to(recipient).await.unwrap());
        }
        (client, replies)
    }

    /// A full transaction. Returns the reply to the end of data.
    pub async fn send(&self, from: &str, recipients: &[&str], content: &str) -> Response {
        let (mut client, replies) = self.begin(from, recipients).await;
        assert!(replies.iter().any(Response::is_success), "no recipient accepted: {replies:?}");

        assert_eq!(client.data().await.unwrap().code, 354);
        let reply = client.send_data(content.as_bytes()).await.unwrap();
        let _ = client.quit(TIMEOUT).await;
        reply
    }

    pub async fn pop3(&self) -> Pop3Client {
        Pop3Client::connect(self.pop3).await
    }

    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(server) = self.server.take() {
            tokio::time::timeout(Duration::from_secs(30), server)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

pub struct Pop3Client {
    reader: BufReader<TcpStream>,
    pub greeting: String,
}

impl Pop3Client {
    async fn connect(address: SocketAddr) -> Self {
        let stream = TcpStream::connect(address).await.unwrap();
        let mut client = Self {
            reader: BufReader::new(stream),
            greeting: String::new(),
        };
        client.greeting = client.line().await;
        client
    }

    async fn line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(TIMEOUT, self.reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        line.trim_end_matches("\r\n").to_string()
    }

    /// Sends a command and returns the status line.
    pub async fn command(&mut self, command: &str) -> String {
        self.reader
            .get_mut()
            .write_all(format!("{command}\r\n").as_bytes())
            .await
            .unwrap();
        self.line().await
    }

    /// Sends a command answered by a multi-line response. Returns the status
    /// line and the body with dot-stuffing removed.
    pub async fn multiline(&mut self, command: &str) -> (String, String) {
        let status = self.command(command).await;
        let mut body = String::new();
        if status.starts_with("+OK") {
            loop {
                let line = self.line().await;
                if line == "." {
                    break;
                }
                body.push_str(line.strip_prefix('.').unwrap_or(&line));
                body.push_str("\r\n");
            }
        }
        (status, body)
    }

    pub async fn login(&mut self, username: &str, password: &str) {
        assert!(self.command(&format!("USER {username}")).await.starts_with("+OK"));
        let reply = self.command(&format!("PASS {password}")).await;
        assert!(reply.starts_with("+OK"), "login failed: {reply}");
    }
}
