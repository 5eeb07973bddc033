use mireka_common::{error::RejectError, internal, tracing};
use mireka_smtp::{
    ClientTimeouts,
    client::{ClientError, Response, SmtpClient},
};
use mireka_tracing::traced;
use serde::Deserialize;

pub(super) const REJECTED_CONNECTION: &str = " - Backend rejected connection";
pub(super) const REJECTED_SENDER: &str = " - Backend rejected sender";
pub(super) const REJECTED_RECIPIENT: &str = " - Backend rejected recipient";
pub(super) const REJECTED_DATA: &str = " - Backend rejected DATA";
pub(super) const REJECTED_END_OF_DATA: &str = " - Backend server rejected at end of data";

/// A server that relayed mail is proxied to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendServer {
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// Name sent in EHLO. Defaults to the local host name.
    #[serde(default)]
    pub helo_name: Option<String>,
    #[serde(default)]
    pub timeouts: ClientTimeouts,
}

mod defaults {
    pub const fn port() -> u16 {
        25
    }
}

impl BackendServer {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            helo_name: None,
            timeouts: ClientTimeouts::default(),
        }
    }

    #[must_use]
    pub fn with_helo_name(mut self, name: impl Into<String>) -> Self {
        self.helo_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: ClientTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn helo_name(&self) -> String {
        self.helo_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| String::from("localhost"))
    }

    /// Opens a connection and completes the greeting and EHLO exchange.
    ///
    /// # Errors
    /// The rejection the inbound client should see: a 451 for transport
    /// failures, the backend's own reply if it refused the session.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(host = %self.host, port = self.port)), timing(precision = "ms"))]
    pub async fn connect(&self) -> Result<SmtpClient, RejectError> {
        let address = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|err| transport_failure(&ClientError::Io(err)))?
            .next()
            .ok_or_else(|| {
                RejectError::plain(451, format!("Cannot resolve backend host {}", self.host))
            })?;

        let mut client = SmtpClient::connect(address, self.timeouts.connect())
            .await
            .map_err(|err| transport_failure(&err))?
            .with_timeouts(self.timeouts.command(), self.timeouts.data());

        let greeting = client.read_greeting().await.map_err(|err| transport_failure(&err))?;
        if !greeting.is_success() {
            return Err(backend_rejection(&greeting, REJECTED_CONNECTION));
        }

        let name = self.helo_name();
        let mut hello = client.ehlo(&name).await.map_err(|err| transport_failure(&err))?;
        if !hello.is_success() {
            internal!(level = DEBUG, "Backend {} refused EHLO, trying HELO", self.host);
            hello = client.helo(&name).await.map_err(|err| transport_failure(&err))?;
        }
        if !hello.is_success() {
            return Err(backend_rejection(&hello, REJECTED_CONNECTION));
        }

        Ok(client)
    }
}

/// Transport failures are transient for the inbound client.
pub(super) fn transport_failure(error: &ClientError) -> RejectError {
    internal!(level = WARN, "Backend communication failed: {error}");
    RejectError::plain(451, error.to_string())
}

/// The backend's own reply, marked as coming from the backend.
pub(super) fn backend_rejection(response: &Response, suffix: &str) -> RejectError {
    let status = response.status();
    let message = format!("{}{suffix}", status.message);
    RejectError::from(status.with_message(message))
}
