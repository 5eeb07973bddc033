//! Everything the configuration names, built once and shared by the
//! listeners and the queue.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use mireka_common::{address::RemotePart, internal, transmitter::Transmitter};
use mireka_filter::{
    Destination, DestinationMapper, DestinationProcessor, Filter, FilterChain,
    FilterChainHandlerFactory, MailDestination, Named, RecipientSpecification,
    builtin::{
        AcceptRecipient, AddReceivedHeader, LookupDestination, ProhibitRelaying,
        RedirectPostmasterMail, RefuseUnknownRecipient, RejectLargeMail, StopLoop,
    },
};
use mireka_list::{DnsPolicySource, ListDestination, ListError, PolicySource};
use mireka_pop3::{MaildropDestination, MaildropRepository, Pop3Args};
use mireka_smtp::SmtpArgs;
use mireka_transmission::{
    DeliveryProcessor, DirectSender, DnsConfig, DnsResolver, DsnComposer, ImmediateSender, MailExchangerResolver,
    MailToHost, OutgoingConnections, Queue, QueuingTransmitter, SmarthostSender,
};
use thiserror::Error;

use crate::config::{Config, DestinationConfig, FilterConfig, RecipientConfig, TransmissionConfig};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Destination {0} is used but not defined")]
    UnknownDestination(String),

    #[error("Invalid {field} {value:?}: {reason}")]
    Invalid {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Destination {0} transmits mail, but no transmission section is configured")]
    MissingTransmission(String),

    #[error("Cannot set up the DNS resolver: {0}")]
    Resolver(String),

    #[error("Invalid list {name}: {source}")]
    List { name: String, source: ListError },
}

fn remote_part(field: &'static str, value: &str) -> Result<RemotePart, ContextError> {
    value.parse().map_err(|err: mireka_common::address::AddressError| ContextError::Invalid {
        field,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

/// The resolved mail system.
pub struct Context {
    pub chain: Arc<FilterChain>,
    pub repository: Arc<MaildropRepository>,
    pub queue: Option<Arc<Queue>>,
}

impl Context {
    /// Resolves `config`. Mail exchangers are looked up in the DNS unless
    /// `resolver` is given.
    ///
    /// # Errors
    /// If the configuration refers to undefined destinations or contains
    /// invalid addresses or patterns.
    pub fn build(
        config: &Config,
        resolver: Option<Arc<dyn MailExchangerResolver>>,
    ) -> Result<Self, ContextError> {
        let repository = Arc::new(MaildropRepository::new(&config.maildrops));
        let queue = config
            .transmission
            .as_ref()
            .map(|transmission| build_queue(transmission, resolver))
            .transpose()?;
        let policies = policy_source(config)?;

        let destinations = config
            .destinations
            .iter()
            .map(|(name, destination)| {
                let destination =
                    build_destination(name, destination, &repository, queue.as_ref(), policies.as_ref())?;
                Ok((name.clone(), destination))
            })
            .collect::<Result<BTreeMap<_, _>, ContextError>>()?;
        let destination = |name: &str| {
            destinations
                .get(name)
                .cloned()
                .ok_or_else(|| ContextError::UnknownDestination(name.to_string()))
        };

        let mut mapper = DestinationMapper::new(config.max_alias_hops);
        for mapping in &config.mappings {
            mapper.push(specification(&mapping.recipient)?, destination(&mapping.destination)?);
        }
        let mapper = Arc::new(mapper);

        let mut filters: Vec<Arc<dyn Filter>> = Vec::with_capacity(config.filters.len() + 1);
        for filter in &config.filters {
            let filter: Arc<dyn Filter> = match filter {
                FilterConfig::StopLoop {
                    max_received_headers,
                } => Arc::new(StopLoop {
                    max_received_headers: *max_received_headers,
                }),
                FilterConfig::RejectLargeMail { max_size } => Arc::new(RejectLargeMail {
                    max_size: *max_size,
                }),
                FilterConfig::AddReceivedHeader => Arc::new(AddReceivedHeader),
                FilterConfig::ProhibitRelaying => Arc::new(ProhibitRelaying::new(
                    config
                        .local_domains
                        .iter()
                        .map(|domain| remote_part("local domain", domain))
                        .collect::<Result<_, _>>()?,
                )),
                FilterConfig::RedirectPostmasterMail(redirects) => Arc::new(RedirectPostmasterMail::new(
                    redirects
                        .iter()
                        .map(|redirect| Ok((redirect.sender.clone(), destination(&redirect.destination)?)))
                        .collect::<Result<_, ContextError>>()?,
                )),
                FilterConfig::LookupDestination => Arc::new(LookupDestination::new(Arc::clone(&mapper))),
                FilterConfig::RefuseUnknownRecipient => Arc::new(RefuseUnknownRecipient),
                FilterConfig::AcceptRecipient => Arc::new(AcceptRecipient),
            };
            filters.push(filter);
        }
        filters.push(Arc::new(DestinationProcessor));

        internal!(
            level = INFO,
            "Mail system configured with {} destination(s), {} mapping(s) and {} filter stage(s)",
            destinations.len(),
            config.mappings.len(),
            filters.len()
        );

        Ok(Self {
            chain: Arc::new(FilterChain::new(filters)),
            repository,
            queue,
        })
    }

    /// Prepares the on-disk state. Mails left in the queue by a previous
    /// run are scheduled again.
    ///
    /// # Errors
    /// If the queue directory cannot be read or created.
    pub async fn init(&self) -> anyhow::Result<()> {
        if let Some(queue) = &self.queue {
            queue.init().await?;
        }
        Ok(())
    }

    /// Connects an SMTP listener to the filter chain.
    #[must_use]
    pub fn smtp_args(&self, args: SmtpArgs) -> SmtpArgs {
        args.with_handler(Arc::new(FilterChainHandlerFactory::new(Arc::clone(&self.chain))))
    }

    /// Gives a POP3 listener access to the maildrops.
    #[must_use]
    pub fn pop3_args(&self, args: Pop3Args) -> Pop3Args {
        args.with_repository(Arc::clone(&self.repository))
    }
}

fn build_queue(
    config: &TransmissionConfig,
    resolver: Option<Arc<dyn MailExchangerResolver>>,
) -> Result<Arc<Queue>, ContextError> {
    let helo_name = config
        .helo_name
        .clone()
        .unwrap_or_else(|| config.dsn.reporting_mta.clone());
    let mail_to_host = MailToHost::new(
        Arc::new(OutgoingConnections::new(config.max_connections_per_host)),
        helo_name,
        config.timeouts.clone(),
    );

    let sender: Arc<dyn ImmediateSender> = if config.smarthosts.is_empty() {
        let resolver = match resolver {
            Some(resolver) => resolver,
            None => Arc::new(
                DnsResolver::new(&config.dns).map_err(|err| ContextError::Resolver(err.to_string()))?,
            ),
        };
        Arc::new(DirectSender::new(resolver, mail_to_host, &config.direct))
    } else {
        Arc::new(SmarthostSender::new(config.smarthosts.clone(), mail_to_host))
    };

    let processor = DeliveryProcessor::new(sender, config.retry.clone(), DsnComposer::new(&config.dsn));
    Ok(Arc::new(Queue::new(&config.queue, processor)))
}

/// One resolver answers the DMARC queries of every list which asks for them.
fn policy_source(config: &Config) -> Result<Option<Arc<dyn PolicySource>>, ContextError> {
    let guarded = config
        .destinations
        .values()
        .any(|destination| matches!(destination, DestinationConfig::List(list) if list.dmarc_guard));
    if !guarded {
        return Ok(None);
    }

    let timeout = config
        .transmission
        .as_ref()
        .map_or_else(|| DnsConfig::default().timeout_secs, |transmission| transmission.dns.timeout_secs);
    let source = DnsPolicySource::new(Duration::from_secs(timeout))
        .map_err(|err| ContextError::Resolver(err.to_string()))?;
    Ok(Some(Arc::new(source)))
}

fn build_destination(
    name: &str,
    config: &DestinationConfig,
    repository: &Arc<MaildropRepository>,
    queue: Option<&Arc<Queue>>,
    policies: Option<&Arc<dyn PolicySource>>,
) -> Result<Destination, ContextError> {
    Ok(match config {
        DestinationConfig::Maildrop(maildrop) => Destination::Mail(Named::new(
            name,
            Arc::new(MaildropDestination::new(repository.get(maildrop))) as Arc<dyn MailDestination>,
        )),
        DestinationConfig::Relay(server) => Destination::Relay(Arc::new(server.clone())),
        DestinationConfig::Transmit => {
            let queue = queue.ok_or_else(|| ContextError::MissingTransmission(name.to_string()))?;
            Destination::Transmit(Named::new(
                name,
                Arc::new(QueuingTransmitter::new(Arc::clone(queue))) as Arc<dyn Transmitter>,
            ))
        }
        DestinationConfig::List(list) => {
            let queue = queue.ok_or_else(|| ContextError::MissingTransmission(name.to_string()))?;
            let list = ListDestination::new(
                list,
                Arc::new(QueuingTransmitter::new(Arc::clone(queue))),
                policies.cloned(),
            )
            .map_err(|source| ContextError::List {
                name: name.to_string(),
                source,
            })?;
            Destination::Mail(Named::new(name, Arc::new(list) as Arc<dyn MailDestination>))
        }
        DestinationConfig::Alias(recipient) => Destination::Alias(recipient.clone()),
        DestinationConfig::Null => Destination::Null,
    })
}

fn specification(config: &RecipientConfig) -> Result<RecipientSpecification, ContextError> {
    Ok(match config {
        RecipientConfig::Exact(recipient) => RecipientSpecification::Exact(recipient.clone()),
        RecipientConfig::Domain(domain) => RecipientSpecification::Domain(remote_part("domain", domain)?),
        RecipientConfig::LocalPart { pattern, domain } => {
            RecipientSpecification::local_part_regex(pattern, remote_part("domain", domain)?).map_err(
                |err| ContextError::Invalid {
                    field: "local part pattern",
                    value: pattern.clone(),
                    reason: err.to_string(),
                },
            )?
        }
        RecipientConfig::GlobalPostmaster => RecipientSpecification::GlobalPostmaster,
        RecipientConfig::AnyPostmaster => RecipientSpecification::AnyPostmaster,
    })
}
