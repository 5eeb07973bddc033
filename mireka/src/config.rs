//! The configuration file, written in RON.
//!
//! Listener sections are read straight into their protocol controllers; the
//! rest describes the mail system and is resolved into a
//! [`Context`](crate::context::Context) at startup.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use mireka_common::{
    address::{Recipient, ReversePath},
    controller::Controller,
    logging::LoggingConfig,
};
use mireka_filter::relay::BackendServer;
use mireka_list::ListConfig;
use mireka_pop3::Pop3;
use mireka_smtp::{Smtp, timeouts::ClientTimeouts};
use mireka_transmission::{DirectConfig, DnsConfig, DsnConfig, QueueConfig, RetryPolicy, Upstream};
use serde::Deserialize;

const CONFIG_ENV: &str = "MIREKA_CONFIG";
const DEFAULT_PATHS: [&str; 2] = ["./mireka.config.ron", "/etc/mireka/mireka.config.ron"];

#[derive(Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub smtp: Controller<Smtp>,

    #[serde(default)]
    pub pop3: Controller<Pop3>,

    /// Domains this server accepts mail for, used by `ProhibitRelaying`.
    #[serde(default)]
    pub local_domains: Vec<String>,

    /// Root of the POP3 maildrops, one directory per maildrop.
    #[serde(default = "defaults::maildrops")]
    pub maildrops: PathBuf,

    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationConfig>,

    /// Consulted in order, the first matching entry wins.
    #[serde(default)]
    pub mappings: Vec<MappingConfig>,

    /// The stages run for every transaction, in order. Handing the mail to
    /// the destinations always comes last and is not listed.
    #[serde(default = "defaults::filters")]
    pub filters: Vec<FilterConfig>,

    #[serde(default = "defaults::max_alias_hops")]
    pub max_alias_hops: usize,

    /// Outbound queue. Required by `Transmit` and `List` destinations.
    #[serde(default)]
    pub transmission: Option<TransmissionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub enum DestinationConfig {
    /// A maildrop by name, readable over POP3.
    Maildrop(String),
    /// Proxied to a backend server during the SMTP transaction.
    Relay(BackendServer),
    /// Queued for delivery to the recipient's mail exchanger.
    Transmit,
    /// A mailing list, sent on to its members through the queue.
    List(ListConfig),
    /// Looked up again as another address.
    Alias(Recipient),
    /// Accepted and discarded.
    Null,
}

#[derive(Debug, Clone, Deserialize)]
pub enum RecipientConfig {
    Exact(Recipient),
    Domain(String),
    LocalPart { pattern: String, domain: String },
    GlobalPostmaster,
    AnyPostmaster,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    pub recipient: RecipientConfig,
    /// Key into `destinations`.
    pub destination: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostmasterRedirect {
    pub sender: ReversePath,
    pub destination: String,
}

#[derive(Debug, Clone, Deserialize)]
pub enum FilterConfig {
    StopLoop {
        #[serde(default = "defaults::max_received_headers")]
        max_received_headers: usize,
    },
    RejectLargeMail {
        #[serde(default = "defaults::max_size")]
        max_size: usize,
    },
    AddReceivedHeader,
    ProhibitRelaying,
    RedirectPostmasterMail(Vec<PostmasterRedirect>),
    LookupDestination,
    RefuseUnknownRecipient,
    AcceptRecipient,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransmissionConfig {
    pub queue: QueueConfig,

    pub dsn: DsnConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub dns: DnsConfig,

    /// Name sent in EHLO. Defaults to the DSN reporting MTA.
    #[serde(default)]
    pub helo_name: Option<String>,

    /// Simultaneous connections to one remote host, 0 for no limit.
    #[serde(default = "defaults::max_connections_per_host")]
    pub max_connections_per_host: usize,

    #[serde(default)]
    pub direct: DirectConfig,

    /// When given, every mail goes to these hosts instead of the mail
    /// exchangers of the recipient domain.
    #[serde(default)]
    pub smarthosts: Vec<Upstream>,

    #[serde(default)]
    pub timeouts: ClientTimeouts,
}

mod defaults {
    use std::path::PathBuf;

    use super::FilterConfig;

    pub fn maildrops() -> PathBuf {
        PathBuf::from("/var/lib/mireka/maildrops")
    }

    pub fn filters() -> Vec<FilterConfig> {
        vec![
            FilterConfig::StopLoop {
                max_received_headers: max_received_headers(),
            },
            FilterConfig::AddReceivedHeader,
            FilterConfig::LookupDestination,
            FilterConfig::RefuseUnknownRecipient,
            FilterConfig::AcceptRecipient,
        ]
    }

    pub const fn max_alias_hops() -> usize {
        mireka_filter::mapper::DEFAULT_MAX_ALIAS_HOPS
    }

    pub const fn max_received_headers() -> usize {
        100
    }

    pub const fn max_size() -> usize {
        25_000_000
    }

    pub const fn max_connections_per_host() -> usize {
        3
    }
}

impl Config {
    /// # Errors
    /// If the file cannot be read or is not a valid configuration.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| anyhow::anyhow!("Failed to read config from {}: {err}", path.display()))?;
        Self::parse(&content)
            .map_err(|err| anyhow::anyhow!("Invalid configuration in {}: {err}", path.display()))
    }

    /// # Errors
    /// If `content` is not a valid configuration.
    pub fn parse(content: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(content)
    }
}

/// Find the configuration file using the following precedence:
/// 1. the `--config` argument
/// 2. `MIREKA_CONFIG` environment variable
/// 3. ./mireka.config.ron (current working directory)
/// 4. /etc/mireka/mireka.config.ron (system-wide config)
///
/// # Errors
/// If an explicitly given file does not exist, or none of the defaults do.
pub fn find_config_file(cli: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = cli {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!("--config points to non-existent file: {}", path.display());
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("{CONFIG_ENV} points to non-existent file: {}", path.display());
    }

    if let Some(path) = DEFAULT_PATHS.iter().map(PathBuf::from).find(|path| path.exists()) {
        return Ok(path);
    }

    let paths_tried = DEFAULT_PATHS
        .iter()
        .map(|path| format!("  - {path}"))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!("No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_configuration() {
        let config = Config::parse("()").unwrap();
        assert!(config.smtp.is_empty());
        assert!(config.transmission.is_none());
        assert_eq!(config.max_alias_hops, 10);
        assert_eq!(config.filters.len(), 5);
        assert!(config.logging.level.is_none());
    }

    #[test]
    fn logging_section() {
        let config = Config::parse(
            r#"(logging: (level: Some("warn"), targets: { "mireka_smtp": "debug" }, ansi: false))"#,
        )
        .unwrap();
        assert_eq!(config.logging.level.as_deref(), Some("warn"));
        assert_eq!(config.logging.targets["mireka_smtp"], "debug");
        assert!(!config.logging.ansi);
    }

    #[test]
    fn mail_system_sections() {
        let config = Config::parse(
            r#"(
                local_domains: ["example.com"],
                destinations: {
                    "john": Maildrop("john"),
                    "backend": Relay((host: "backend.example.com", port: 2525)),
                    "outbound": Transmit,
                    "sales": Alias("john@example.com"),
                    "games": List((
                        address: "games@example.com",
                        subject_prefix: Some("[GAMES]"),
                        dmarc_guard: false,
                        members: [(address: "john@example.com"), (address: "jane@example.org", no_delivery: true)],
                    )),
                },
                mappings: [
                    (recipient: Exact("John@Example.com"), destination: "john"),
                    (recipient: LocalPart(pattern: "sales-.*", domain: "example.com"), destination: "sales"),
                    (recipient: Domain("example.net"), destination: "backend"),
                    (recipient: GlobalPostmaster, destination: "john"),
                ],
                filters: [
                    StopLoop(max_received_headers: 30),
                    RejectLargeMail(max_size: 1000),
                    RedirectPostmasterMail([(sender: "fbl@isp.example", destination: "john")]),
                    LookupDestination,
                ],
                transmission: Some((
                    queue: (directory: "/var/spool/mireka/queue"),
                    dsn: (reporting_mta: "mx.example.com"),
                )),
            )"#,
        )
        .unwrap();

        assert_eq!(config.destinations.len(), 5);
        assert!(matches!(
            &config.destinations["games"],
            DestinationConfig::List(list) if list.members.len() == 2 && list.members_only && !list.dmarc_guard
        ));
        assert!(matches!(
            &config.destinations["backend"],
            DestinationConfig::Relay(server) if server.port == 2525
        ));
        assert!(matches!(
            config.mappings[1].recipient,
            RecipientConfig::LocalPart { .. }
        ));
        assert!(matches!(
            config.filters[0],
            FilterConfig::StopLoop { max_received_headers: 30 }
        ));
        assert!(matches!(
            config.filters[1],
            FilterConfig::RejectLargeMail { max_size: 1000 }
        ));

        let transmission = config.transmission.unwrap();
        assert_eq!(transmission.queue.workers, 4);
        assert_eq!(transmission.max_connections_per_host, 3);
        assert!(transmission.smarthosts.is_empty());
    }

    #[test]
    fn explicit_path_must_exist() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(find_config_file(Some(file.path())).unwrap(), file.path());
        assert!(find_config_file(Some(Path::new("/nonexistent/mireka.ron"))).is_err());
    }
}
