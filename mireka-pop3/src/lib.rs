//! Maildrops for local users and the POP3 server giving access to them.

pub mod command;
pub mod destination;
pub mod error;
pub mod maildrop;
pub mod session;
pub mod uid;

use std::{collections::HashMap, fmt, net::SocketAddr, sync::Arc, time::Duration};

use ahash::AHashSet;
use mireka_common::{
    Signal,
    error::{ProtocolError, SessionError},
    traits::protocol::{Protocol, SessionHandler},
    tracing,
};
use mireka_tracing::traced;
use serde::Deserialize;
use tokio::{net::TcpStream, sync::broadcast::Receiver};

pub use crate::{
    destination::MaildropDestination,
    error::{MaildropError, Pop3Error},
    maildrop::{Maildrop, MaildropRepository, MaildropTransaction},
};
use crate::session::{Session, SessionConfig};

/// A login accepted by the POP3 server and the maildrop it opens.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Pop3User {
    pub username: String,
    pub password: String,
    pub maildrop: String,
}

impl fmt::Debug for Pop3User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pop3User")
            .field("username", &self.username)
            .field("maildrop", &self.maildrop)
            .finish_non_exhaustive()
    }
}

#[derive(Default, Deserialize)]
pub struct Pop3;

/// Listener arguments of a POP3 port.
#[derive(Clone, Deserialize)]
pub struct Pop3Args {
    /// Name announced in the greeting. Defaults to `$HOSTNAME`.
    #[serde(default)]
    banner: Option<String>,
    #[serde(default)]
    users: Vec<Pop3User>,
    /// Inactivity limit, RFC 1939 requires at least 10 minutes.
    #[serde(default = "defaults::command_timeout_secs")]
    command_timeout_secs: u64,
    #[serde(skip)]
    repository: Option<Arc<MaildropRepository>>,
}

mod defaults {
    pub const fn command_timeout_secs() -> u64 {
        600
    }
}

impl Default for Pop3Args {
    fn default() -> Self {
        Self {
            banner: None,
            users: Vec::new(),
            command_timeout_secs: defaults::command_timeout_secs(),
            repository: None,
        }
    }
}

impl fmt::Debug for Pop3Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pop3Args")
            .field("banner", &self.banner)
            .field("users", &self.users)
            .field("command_timeout_secs", &self.command_timeout_secs)
            .field("repository", &self.repository.as_ref().map(|r| r.root().to_path_buf()))
            .finish()
    }
}

impl Pop3Args {
    #[must_use]
    pub fn builder() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: Pop3User) -> Self {
        self.users.push(user);
        self
    }

    #[must_use]
    pub const fn with_command_timeout_secs(mut self, secs: u64) -> Self {
        self.command_timeout_secs = secs;
        self
    }

    /// Set the maildrops the users log in to
    #[must_use]
    pub fn with_repository(mut self, repository: Arc<MaildropRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    #[must_use]
    pub fn users(&self) -> &[Pop3User] {
        &self.users
    }
}

impl Protocol for Pop3 {
    type Session = Session<TcpStream>;
    type Args = Pop3Args;

    fn ty() -> &'static str {
        "POP3"
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip(self, stream, _context, args)), timing(precision = "ms"))]
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        _context: HashMap<String, String>,
        args: Self::Args,
    ) -> Self::Session {
        // `validate` guarantees a repository; without one no login can
        // succeed as there are no users either.
        let (repository, users) = match args.repository {
            Some(repository) => (repository, args.users),
            None => (Arc::new(MaildropRepository::new(std::env::temp_dir())), Vec::new()),
        };

        let server_name = args.banner.unwrap_or_else(|| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("localhost"))
        });

        Session::create(
            stream,
            peer,
            SessionConfig {
                server_name: Arc::from(server_name),
                users,
                repository,
                command_timeout: Duration::from_secs(args.command_timeout_secs),
            },
        )
    }

    #[traced(instrument(skip(self, args)), timing(precision = "ns"))]
    fn validate(&self, args: &Self::Args) -> Result<(), ProtocolError> {
        if args.repository.is_none() {
            return Err(ProtocolError::MissingField("repository"));
        }

        if args.command_timeout_secs == 0 {
            return Err(ProtocolError::InvalidConfiguration {
                field: String::from("command_timeout_secs"),
                reason: String::from("timeout must be greater than zero"),
            });
        }

        let mut seen = AHashSet::new();
        if let Some(user) = args.users.iter().find(|user| !seen.insert(&user.username)) {
            return Err(ProtocolError::InvalidConfiguration {
                field: String::from("users"),
                reason: format!("user {} is listed more than once", user.username),
            });
        }

        Ok(())
    }
}

impl SessionHandler for Session<TcpStream> {
    async fn run(self, signal: Receiver<Signal>) -> Result<(), SessionError> {
        Self::run(self, signal).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn args_from_config() {
        let args: Pop3Args = ron::from_str(
            r#"(
                banner: Some("pop.example.com"),
                users: [(username: "john", password: "secret", maildrop: "john")],
            )"#,
        )
        .unwrap();
        assert_eq!(args.banner.as_deref(), Some("pop.example.com"));
        assert_eq!(args.command_timeout_secs, 600);
        assert_eq!(args.users()[0].maildrop, "john");
        assert!(args.repository.is_none());
    }

    #[test]
    fn password_is_not_logged() {
        let user = Pop3User {
            username: String::from("john"),
            password: String::from("secret"),
            maildrop: String::from("john"),
        };
        assert!(!format!("{user:?}").contains("secret"));
    }

    #[test]
    fn validation() {
        assert!(matches!(
            Pop3.validate(&Pop3Args::builder()),
            Err(ProtocolError::MissingField("repository"))
        ));

        let user = Pop3User {
            username: String::from("john"),
            password: String::from("secret"),
            maildrop: String::from("john"),
        };
        let args = Pop3Args::builder()
            .with_repository(Arc::new(MaildropRepository::new("/var/lib/mireka/maildrops")))
            .with_user(user.clone());
        assert!(Pop3.validate(&args).is_ok());

        assert!(matches!(
            Pop3.validate(&args.clone().with_user(user)),
            Err(ProtocolError::InvalidConfiguration { .. })
        ));
        assert!(matches!(
            Pop3.validate(&args.with_command_timeout_secs(0)),
            Err(ProtocolError::InvalidConfiguration { .. })
        ));
    }
}
