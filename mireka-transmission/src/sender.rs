//! Handing a mail over to the next hop in a single attempt.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use async_trait::async_trait;
use mireka_common::{
    address::RemotePart,
    internal,
    mail::Mail,
    status::{EnhancedCode, EnhancedStatus},
    tracing,
};
use mireka_smtp::{
    client::{ClientError, Response, SmtpClient},
    timeouts::ClientTimeouts,
};
use mireka_tracing::traced;
use serde::Deserialize;

use crate::{
    dns::MailExchangerResolver,
    error::{Failure, RecipientRejection, RemoteMta, SendError},
    registry::OutgoingConnections,
};

/// One delivery attempt of a mail, without any retry logic.
#[async_trait]
pub trait ImmediateSender: Send + Sync {
    /// Whether every recipient of a mail passed to [`send`](Self::send) must
    /// share the same remote part.
    fn single_domain_only(&self) -> bool;

    /// # Errors
    /// Why the mail, or some of its recipients, did not reach the next hop.
    async fn send(&self, mail: &Mail) -> Result<(), SendError>;
}

/// The SMTP transaction with one host.
#[derive(Debug)]
pub struct MailToHost {
    registry: Arc<OutgoingConnections>,
    helo_name: String,
    timeouts: ClientTimeouts,
}

impl MailToHost {
    #[must_use]
    pub fn new(
        registry: Arc<OutgoingConnections>,
        helo_name: impl Into<String>,
        timeouts: ClientTimeouts,
    ) -> Self {
        Self {
            registry,
            helo_name: helo_name.into(),
            timeouts,
        }
    }

    /// Transmits `mail` to `remote_mta` listening on `address`.
    ///
    /// # Errors
    /// A recipient the host refused is reported in
    /// [`SendError::RecipientsRejected`] while the rest are delivered.
    /// Anything else fails the whole attempt.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self, mail), fields(remote = %remote_mta)), timing(precision = "ms"))]
    pub async fn transmit(
        &self,
        mail: &Mail,
        remote_mta: &RemoteMta,
        address: SocketAddr,
    ) -> Result<(), SendError> {
        let _permit = self.registry.open(remote_mta, address.ip())?;

        let mut client = SmtpClient::connect(address, self.timeouts.connect())
            .await
            .map_err(|err| connection_failure(&err, remote_mta))?
            .with_timeouts(self.timeouts.command(), self.timeouts.data());

        let result = self.transaction(&mut client, mail, remote_mta).await;

        if let Err(err) = client.quit(self.timeouts.quit()).await {
            internal!(level = DEBUG, "QUIT to {remote_mta} failed: {err}");
        }
        result
    }

    async fn transaction(
        &self,
        client: &mut SmtpClient,
        mail: &Mail,
        remote_mta: &RemoteMta,
    ) -> Result<(), SendError> {
        let broken = |err: ClientError| connection_failure(&err, remote_mta);
        let refused = |response: &Response| SendError::failed(Failure::remote(response, remote_mta.clone()));

        let greeting = client.read_greeting().await.map_err(broken)?;
        if greeting.code != 220 {
            return Err(refused(&greeting));
        }

        let ehlo = client.ehlo(&self.helo_name).await.map_err(broken)?;
        let supports_size = if ehlo.is_success() {
            ehlo.lines.iter().skip(1).any(|line| {
                line.split_ascii_whitespace()
                    .next()
                    .is_some_and(|keyword| keyword.eq_ignore_ascii_case("SIZE"))
            })
        } else {
            let helo = client.helo(&self.helo_name).await.map_err(broken)?;
            if !helo.is_success() {
                return Err(refused(&helo));
            }
            false
        };

        let size = supports_size.then(|| mail.data.len());
        let response = client
            .mail_from(&mail.from.to_string(), size)
            .await
            .map_err(broken)?;
        if !response.is_success() {
            return Err(refused(&response));
        }

        let mut rejections = Vec::new();
        for recipient in &mail.recipients {
            let response = client.rcpt_to(&recipient.to_string()).await.map_err(broken)?;
            if !response.is_success() {
                internal!(level = INFO, "{remote_mta} rejected recipient {recipient}: {}", response.message());
                rejections.push(RecipientRejection {
                    recipient: recipient.clone(),
                    failure: Failure::remote(&response, remote_mta.clone()),
                });
            }
        }
        if rejections.len() == mail.recipients.len() {
            return Err(SendError::RecipientsRejected { rejections });
        }

        let response = client.data().await.map_err(broken)?;
        if response.code != 354 {
            return Err(refused(&response));
        }

        let response = client.send_data(&mail.data).await.map_err(broken)?;
        if !response.is_success() {
            return Err(refused(&response));
        }

        internal!(
            level = INFO,
            "Transmitted mail to {remote_mta}: {}",
            response.message()
        );

        if rejections.is_empty() {
            Ok(())
        } else {
            Err(SendError::RecipientsRejected { rejections })
        }
    }
}

fn connection_failure(err: &ClientError, remote_mta: &RemoteMta) -> SendError {
    internal!(level = INFO, "Connection to {remote_mta} failed: {err}");
    let status = EnhancedStatus::new(
        450,
        EnhancedCode::new(4, 4, 0),
        "No answer from host or bad connection",
    );
    SendError::Transient(Failure::new(status).with_remote_mta(remote_mta.clone()))
}

/// Keeps the error most worth reporting while hosts are tried in turn.
#[derive(Debug, Default)]
struct Attempts {
    last_failure: Option<SendError>,
    postponed: Option<SendError>,
}

impl Attempts {
    /// Records `err`, or hands it back when no other host should be tried.
    fn record(&mut self, err: SendError) -> Result<(), SendError> {
        match err {
            SendError::Transient(_) => {
                self.last_failure = Some(err);
                Ok(())
            }
            SendError::Postpone { .. } => {
                self.postponed = Some(err);
                Ok(())
            }
            SendError::Permanent(_) | SendError::RecipientsRejected { .. } => Err(err),
        }
    }

    fn finish(self, fallback: impl FnOnce() -> SendError) -> SendError {
        self.last_failure.or(self.postponed).unwrap_or_else(fallback)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectConfig {
    #[serde(default = "defaults::smtp_port")]
    pub port: u16,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            port: defaults::smtp_port(),
        }
    }
}

/// Sends to the mail exchangers of the recipients' domain.
pub struct DirectSender {
    resolver: Arc<dyn MailExchangerResolver>,
    mail_to_host: MailToHost,
    port: u16,
}

impl DirectSender {
    #[must_use]
    pub fn new(resolver: Arc<dyn MailExchangerResolver>, mail_to_host: MailToHost, config: &DirectConfig) -> Self {
        Self {
            resolver,
            mail_to_host,
            port: config.port,
        }
    }

    async fn send_to_domain(&self, mail: &Mail, domain: &str) -> Result<(), SendError> {
        let hosts = self.resolver.mail_exchangers(domain).await.map_err(|err| {
            SendError::failed(Failure::new(err.status()))
        })?;

        let mut attempts = Attempts::default();
        let mut dns_failure = None;

        for host in hosts.iter() {
            let addresses = match self.resolver.addresses(host).await {
                Ok(addresses) => addresses,
                Err(err) => {
                    internal!(level = DEBUG, "Skipping mail exchanger {host}: {err}");
                    dns_failure = Some(SendError::failed(
                        Failure::new(err.status()).with_remote_mta(RemoteMta::new(host.as_str(), None)),
                    ));
                    continue;
                }
            };

            for address in addresses {
                let remote_mta = RemoteMta::new(host.as_str(), Some(address));
                match self
                    .mail_to_host
                    .transmit(mail, &remote_mta, SocketAddr::new(address, self.port))
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err(err) => attempts.record(err)?,
                }
            }
        }

        Err(attempts.finish(|| {
            dns_failure.unwrap_or_else(|| {
                SendError::Permanent(Failure::new(
                    EnhancedStatus::PERMANENT_UNABLE_TO_ROUTE
                        .with_message(format!("No usable mail exchanger for {domain}")),
                ))
            })
        }))
    }

    async fn send_to_literal(&self, mail: &Mail, address: IpAddr) -> Result<(), SendError> {
        let remote_mta = RemoteMta::new(address.to_string(), Some(address));
        self.mail_to_host
            .transmit(mail, &remote_mta, SocketAddr::new(address, self.port))
            .await
    }
}

#[async_trait]
impl ImmediateSender for DirectSender {
    fn single_domain_only(&self) -> bool {
        true
    }

    async fn send(&self, mail: &Mail) -> Result<(), SendError> {
        let mut remote_parts = mail.recipients.iter().map(|recipient| recipient.remote_part());
        let Some(Some(remote_part)) = remote_parts.next() else {
            return Err(SendError::Permanent(Failure::new(
                EnhancedStatus::PERMANENT_UNABLE_TO_ROUTE.with_message("Recipient has no domain"),
            )));
        };
        if remote_parts.any(|other| other != Some(remote_part)) {
            internal!(level = ERROR, "Mail with recipients in different domains passed to the direct sender");
            return Err(SendError::Permanent(Failure::new(
                EnhancedStatus::PERMANENT_INTERNAL_ERROR
                    .with_message("Recipients of a single attempt must share a domain"),
            )));
        }

        match remote_part {
            RemotePart::Domain(domain) => self.send_to_domain(mail, domain.as_str()).await,
            RemotePart::Literal(literal) => match literal.address() {
                Some(address) => self.send_to_literal(mail, address).await,
                None => Err(SendError::Permanent(Failure::new(
                    EnhancedStatus::BAD_DESTINATION_SYSTEM_ADDRESS
                        .with_message(format!("Unsupported address literal {literal}")),
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Upstream {
    pub host: String,
    #[serde(default = "defaults::smtp_port")]
    pub port: u16,
}

mod defaults {
    pub const fn smtp_port() -> u16 {
        25
    }
}

/// Sends everything to a fixed list of upstream servers, trying them in
/// order.
pub struct SmarthostSender {
    upstreams: Vec<Upstream>,
    mail_to_host: MailToHost,
}

impl SmarthostSender {
    #[must_use]
    pub const fn new(upstreams: Vec<Upstream>, mail_to_host: MailToHost) -> Self {
        Self {
            upstreams,
            mail_to_host,
        }
    }
}

#[async_trait]
impl ImmediateSender for SmarthostSender {
    fn single_domain_only(&self) -> bool {
        false
    }

    async fn send(&self, mail: &Mail) -> Result<(), SendError> {
        let mut attempts = Attempts::default();

        for upstream in &self.upstreams {
            let addresses = match tokio::net::lookup_host((upstream.host.as_str(), upstream.port)).await {
                Ok(addresses) => addresses.collect::<Vec<_>>(),
                Err(err) => {
                    internal!(level = WARN, "Cannot resolve upstream {}: {err}", upstream.host);
                    attempts.record(SendError::Transient(
                        Failure::new(EnhancedStatus::DIRECTORY_SERVER_FAILURE.with_message(format!(
                            "Cannot resolve upstream server {}",
                            upstream.host
                        )))
                        .with_remote_mta(RemoteMta::new(upstream.host.as_str(), None)),
                    ))?;
                    continue;
                }
            };

            for address in addresses {
                let remote_mta = RemoteMta::new(upstream.host.as_str(), Some(address.ip()));
                match self.mail_to_host.transmit(mail, &remote_mta, address).await {
                    Ok(()) => return Ok(()),
                    Err(err) => attempts.record(err)?,
                }
            }
        }

        Err(attempts.finish(|| {
            SendError::Transient(Failure::new(
                EnhancedStatus::TRANSIENT_LOCAL_ERROR.with_message("No upstream server is configured"),
            ))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> SendError {
        SendError::Transient(Failure::new(EnhancedStatus::DIRECTORY_SERVER_FAILURE))
    }

    fn postponed() -> SendError {
        SendError::Postpone {
            failure: Failure::new(EnhancedStatus::TRANSIENT_LOCAL_ERROR),
            delay: std::time::Duration::from_secs(5),
        }
    }

    #[test]
    fn failures_are_preferred_to_postponements() {
        let mut attempts = Attempts::default();
        attempts.record(transient()).unwrap();
        attempts.record(postponed()).unwrap();
        assert!(matches!(attempts.finish(transient), SendError::Transient(_)));

        let mut attempts = Attempts::default();
        attempts.record(postponed()).unwrap();
        assert!(matches!(attempts.finish(transient), SendError::Postpone { .. }));
    }

    #[test]
    fn permanent_failures_stop_the_search() {
        let mut attempts = Attempts::default();
        let permanent = SendError::Permanent(Failure::new(EnhancedStatus::BAD_DESTINATION_SYSTEM_ADDRESS));
        assert!(matches!(attempts.record(permanent), Err(SendError::Permanent(_))));
    }

    #[tokio::test]
    async fn recipients_from_different_domains_are_refused() {
        let resolver = Arc::new(crate::dns::StaticResolver::default());
        let sender = DirectSender::new(
            resolver,
            MailToHost::new(Arc::new(OutgoingConnections::new(0)), "mx.test", ClientTimeouts::default()),
            &DirectConfig::default(),
        );
        let mail = Mail::new(
            "jane@example.com".parse().unwrap(),
            vec!["a@example.org".parse().unwrap(), "b@example.net".parse().unwrap()],
            "Subject: x\r\n\r\n".into(),
        );

        let err = sender.send(&mail).await.unwrap_err();
        assert!(matches!(err, SendError::Permanent(_)));
    }

    #[tokio::test]
    async fn unknown_domain_is_permanent() {
        let resolver = Arc::new(crate::dns::StaticResolver::default());
        let sender = DirectSender::new(
            resolver,
            MailToHost::new(Arc::new(OutgoingConnections::new(0)), "mx.test", ClientTimeouts::default()),
            &DirectConfig::default(),
        );
        let mail = Mail::new(
            "jane@example.com".parse().unwrap(),
            vec!["a@example.invalid".parse().unwrap()],
            "Subject: x\r\n\r\n".into(),
        );

        let SendError::Permanent(failure) = sender.send(&mail).await.unwrap_err() else {
            panic!("expected a permanent failure");
        };
        assert_eq!(failure.status.code, EnhancedCode::new(5, 1, 2));
    }
}
