use mireka_common::{
    address::{Recipient, RemotePart},
    error::ConfigurationError,
    internal,
};
use regex::{Regex, RegexBuilder};

use crate::destination::Destination;

pub const DEFAULT_MAX_ALIAS_HOPS: usize = 10;

/// A predicate over recipients, used by the mapping table and by filters.
#[derive(Debug, Clone)]
pub enum RecipientSpecification {
    /// One address. Local part and domain compare ignoring case.
    Exact(Recipient),
    /// Every recipient of a domain or address literal.
    Domain(RemotePart),
    /// Local parts matching a pattern, within one domain.
    LocalPartRegex { pattern: Regex, remote_part: RemotePart },
    /// `<Postmaster>` without a domain.
    GlobalPostmaster,
    /// Any postmaster, with or without a domain.
    AnyPostmaster,
}

impl RecipientSpecification {
    /// The pattern must match the whole local part, ignoring case.
    ///
    /// # Errors
    /// If `pattern` is not a valid regular expression.
    pub fn local_part_regex(
        pattern: &str,
        remote_part: RemotePart,
    ) -> Result<Self, regex::Error> {
        let pattern = RegexBuilder::new(&format!("^(?:{pattern})$"))
            .case_insensitive(true)
            .build()?;
        Ok(Self::LocalPartRegex {
            pattern,
            remote_part,
        })
    }

    #[must_use]
    pub fn is_satisfied_by(&self, recipient: &Recipient) -> bool {
        match self {
            Self::Exact(expected) => expected == recipient,
            Self::Domain(remote_part) => recipient.remote_part() == Some(remote_part),
            Self::LocalPartRegex {
                pattern,
                remote_part,
            } => {
                recipient.remote_part() == Some(remote_part)
                    && pattern.is_match(recipient.local_part().as_str())
            }
            Self::GlobalPostmaster => recipient.is_global_postmaster(),
            Self::AnyPostmaster => recipient.is_postmaster(),
        }
    }
}

/// Ordered recipient to destination table. The first matching entry wins.
#[derive(Clone)]
pub struct DestinationMapper {
    mappings: Vec<(RecipientSpecification, Destination)>,
    max_alias_hops: usize,
}

impl Default for DestinationMapper {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ALIAS_HOPS)
    }
}

impl DestinationMapper {
    #[must_use]
    pub const fn new(max_alias_hops: usize) -> Self {
        Self {
            mappings: Vec::new(),
            max_alias_hops,
        }
    }

    #[must_use]
    pub fn with_mapping(mut self, specification: RecipientSpecification, destination: Destination) -> Self {
        self.push(specification, destination);
        self
    }

    pub fn push(&mut self, specification: RecipientSpecification, destination: Destination) {
        self.mappings.push((specification, destination));
    }

    /// The destination of the first matching entry, without following
    /// aliases.
    #[must_use]
    pub fn lookup(&self, recipient: &Recipient) -> Destination {
        self.mappings
            .iter()
            .find(|(specification, _)| specification.is_satisfied_by(recipient))
            .map_or(Destination::UnknownRecipient, |(_, destination)| destination.clone())
    }

    /// Looks up `recipient`, following alias destinations.
    ///
    /// # Errors
    /// If more than the configured number of aliases are followed, which
    /// usually means the aliases form a cycle.
    pub fn resolve(&self, recipient: &Recipient) -> Result<Destination, ConfigurationError> {
        let mut current = recipient.clone();

        for hop in 0..=self.max_alias_hops {
            match self.lookup(&current) {
                Destination::Alias(next) => current = next,
                destination => {
                    if hop > 0 {
                        internal!(level = DEBUG, "Final recipient of {recipient} is {current}");
                    }
                    return Ok(destination);
                }
            }
        }

        Err(ConfigurationError(format!(
            "Recipient aliases may have created a loop for {recipient}"
        )))
    }
}
