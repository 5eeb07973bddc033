use std::{fmt, sync::Arc};

use async_trait::async_trait;
use mailparse::{MailAddr, SingleInfo};
use mireka_common::{
    address::{Mailbox, Recipient, ReversePath},
    error::RejectError,
    internal,
    mail::{Mail, MailData},
    status::EnhancedCode,
    tracing,
    transmitter::Transmitter,
};
use mireka_filter::{FilterError, MailDestination};
use mireka_tracing::traced;
use regex::Regex;
use serde::Deserialize;

use crate::{
    dmarc::{Policy, PolicySource},
    error::ListError,
    headers::{Message, unstructured},
    subject::normalize_subject,
};

/// Fields of the incoming mail which describe another list.
const FOREIGN_LIST_FIELDS: [&str; 4] = ["List-Help", "List-Subscribe", "List-Unsubscribe", "List-Owner"];

#[derive(Debug, Clone, Deserialize)]
pub struct ListMember {
    pub address: Recipient,
    #[serde(default)]
    pub name: Option<String>,
    /// Receives nothing until enabled again.
    #[serde(default)]
    pub disabled: bool,
    /// Never receives mail, only posts.
    #[serde(default)]
    pub no_delivery: bool,
}

/// ```ron
/// "games": List((
///     address: "games@example.com",
///     subject_prefix: Some("[GAMES]"),
///     members: [(address: "john@example.com"), (address: "jane@example.org")],
/// )),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ListConfig {
    pub address: Recipient,

    /// Defaults to the address with `@` replaced by `.`.
    #[serde(default)]
    pub list_id: Option<String>,

    #[serde(default)]
    pub subject_prefix: Option<String>,

    #[serde(default = "defaults::enabled")]
    pub members_only: bool,

    #[serde(default = "defaults::enabled")]
    pub attachments_allowed: bool,

    /// Replies go to the list instead of the author.
    #[serde(default = "defaults::enabled")]
    pub reply_to_list: bool,

    /// Sender of the redistributed mail. Defaults to the postmaster of the
    /// list domain.
    #[serde(default)]
    pub reverse_path: Option<ReversePath>,

    #[serde(default = "defaults::members_only_message")]
    pub members_only_message: String,

    /// Mail from non-members is still accepted if its whole subject matches.
    #[serde(default)]
    pub non_member_subject: Option<String>,

    /// Rewrite `From` addresses whose domain publishes a DMARC reject policy.
    #[serde(default = "defaults::enabled")]
    pub dmarc_guard: bool,

    #[serde(default)]
    pub members: Vec<ListMember>,
}

mod defaults {
    pub const fn enabled() -> bool {
        true
    }

    pub fn members_only_message() -> String {
        String::from("Only members of the list are allowed to send a message to this list address.")
    }
}

/// Sends mail addressed to a list on to its members.
pub struct ListDestination {
    address: Mailbox,
    short_name: String,
    list_id: String,
    subject_prefix: Option<String>,
    members_only: bool,
    attachments_allowed: bool,
    reply_to_list: bool,
    reverse_path: ReversePath,
    members_only_message: String,
    non_member_subject: Option<Regex>,
    members: Vec<ListMember>,
    transmitter: Arc<dyn Transmitter>,
    policies: Option<Arc<dyn PolicySource>>,
}

impl fmt::Debug for ListDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListDestination")
            .field("address", &self.address.to_string())
            .field("list_id", &self.list_id)
            .field("members", &self.members.len())
            .field("dmarc_guard", &self.policies.is_some())
            .finish_non_exhaustive()
    }
}

impl ListDestination {
    /// `policies` is only consulted if the list has the DMARC guard enabled.
    pub fn new(
        config: &ListConfig,
        transmitter: Arc<dyn Transmitter>,
        policies: Option<Arc<dyn PolicySource>>,
    ) -> Result<Self, ListError> {
        let address = config
            .address
            .mailbox()
            .cloned()
            .ok_or_else(|| ListError::Address(config.address.to_string()))?;

        let reverse_path = match &config.reverse_path {
            Some(reverse_path) => reverse_path.clone(),
            None => format!("postmaster@{}", address.remote_part)
                .parse::<ReversePath>()
                .map_err(|err| ListError::ReversePath {
                    list: address.to_string(),
                    reason: err.to_string(),
                })?,
        };

        let non_member_subject = config
            .non_member_subject
            .as_ref()
            .map(|pattern| {
                Regex::new(&format!("^(?:{pattern})$")).map_err(|source| ListError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .transpose()?;

        Ok(Self {
            short_name: address.local_part.to_string(),
            list_id: config
                .list_id
                .clone()
                .unwrap_or_else(|| address.to_string().replace('@', ".")),
            address,
            subject_prefix: config.subject_prefix.clone(),
            members_only: config.members_only,
            attachments_allowed: config.attachments_allowed,
            reply_to_list: config.reply_to_list,
            reverse_path,
            members_only_message: config.members_only_message.clone(),
            non_member_subject,
            members: config.members.clone(),
            transmitter,
            policies: if config.dmarc_guard { policies } else { None },
        })
    }

    fn is_member(&self, sender: &ReversePath) -> bool {
        let sender = sender.to_string();
        self.members
            .iter()
            .any(|member| member.address.to_string().eq_ignore_ascii_case(&sender))
    }

    fn check_sender(&self, sender: &ReversePath, message: &Message) -> Result<(), RejectError> {
        if !self.members_only || self.is_member(sender) {
            return Ok(());
        }

        if let Some(pattern) = &self.non_member_subject {
            let subject = message.value("Subject").unwrap_or_default();
            if pattern.is_match(&subject) {
                internal!(level = DEBUG, "Accepting <{sender}>, subject matches {pattern}");
                return Ok(());
            }
        }

        internal!(level = INFO, "<{sender}> is not a member of list {}", self.address);
        Err(RejectError::new(
            550,
            EnhancedCode::new(5, 7, 2),
            self.members_only_message.clone(),
        ))
    }

    fn check_attachments(&self, message: &Message) -> Result<(), RejectError> {
        if self.attachments_allowed {
            return Ok(());
        }

        let content_type = message.value("Content-Type").unwrap_or_default();
        if mailparse::parse_content_type(&content_type)
            .mimetype
            .eq_ignore_ascii_case("multipart/mixed")
        {
            return Err(RejectError::new(
                550,
                EnhancedCode::new(5, 7, 0),
                "Attachments are not allowed on this mailing list",
            ));
        }
        Ok(())
    }

    fn list_mailbox(&self, display_name: String) -> SingleInfo {
        SingleInfo {
            display_name: Some(display_name),
            addr: self.address.to_string(),
        }
    }

    /// Replaces `mailbox` by the list address if its domain asks for mail
    /// failing DMARC to be rejected, returning the original.
    async fn guard_mailbox(
        &self,
        mailbox: &mut SingleInfo,
        policies: &dyn PolicySource,
    ) -> Result<Option<SingleInfo>, FilterError> {
        let Some((local_part, domain)) = mailbox.addr.rsplit_once('@') else {
            return Ok(None);
        };
        if domain.starts_with('[') {
            return Ok(None);
        }

        match policies.policy(domain).await {
            Ok(Some(Policy::Reject)) => {}
            Ok(_) => return Ok(None),
            Err(err) => {
                internal!(level = WARN, "{err}");
                return Err(RejectError::new(
                    451,
                    EnhancedCode::new(4, 4, 3),
                    "Unable to query for a DMARC record",
                )
                .into());
            }
        }

        let shown = match mailbox.display_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => local_part,
        };
        let replacement = self.list_mailbox(format!("{shown} via {}", self.short_name));
        internal!(level = DEBUG, "{domain} rejects mail failing DMARC, sending as {}", self.address);
        Ok(Some(std::mem::replace(mailbox, replacement)))
    }

    /// Authors whose domain would make members reject the mail are moved
    /// to `Cc`, or to `Reply-To` when replies do not go to the list.
    async fn guard_dmarc(&self, message: &mut Message, policies: &dyn PolicySource) -> Result<(), FilterError> {
        let mut from = message.addresses("From").map_err(|err| {
            internal!(level = DEBUG, "Cannot parse From: {err}");
            RejectError::new(554, EnhancedCode::new(5, 6, 0), "Invalid From header")
        })?;

        let mut replaced = Vec::new();
        for address in &mut from {
            match address {
                MailAddr::Single(mailbox) => replaced.extend(self.guard_mailbox(mailbox, policies).await?),
                MailAddr::Group(group) => {
                    for mailbox in &mut group.addrs {
                        replaced.extend(self.guard_mailbox(mailbox, policies).await?);
                    }
                }
            }
        }
        if replaced.is_empty() {
            return Ok(());
        }

        message.set_addresses("From", &from);
        let field = if self.reply_to_list { "Cc" } else { "Reply-To" };
        let mut addresses = message.addresses(field).unwrap_or_default();
        addresses.extend(replaced.into_iter().map(MailAddr::Single));
        message.set_addresses(field, &addresses);
        Ok(())
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip_all, fields(list = %self.address)), timing(precision = "ms"))]
    async fn redistribute(&self, mail: Mail) -> Result<(), FilterError> {
        internal!(level = DEBUG, "Mail from <{}> received for list {}", mail.from, self.address);

        let mut message = Message::parse(&mail.data);
        self.check_sender(&mail.from, &message)?;
        self.check_attachments(&message)?;
        if message.contains("List-Id") {
            return Err(RejectError::new(450, EnhancedCode::new(4, 4, 6), "Mail list loop detected").into());
        }

        message.remove("Return-Path");
        if let Some(prefix) = &self.subject_prefix {
            let subject = message.value("Subject").unwrap_or_default();
            message.set("Subject", &unstructured(&normalize_subject(&subject, prefix)));
        }
        if self.reply_to_list {
            message.set_addresses("Reply-To", &[MailAddr::Single(self.list_mailbox(self.short_name.clone()))]);
        }
        message.set("List-Id", &format!("<{}>", self.list_id));
        message.set("List-Post", &format!("<mailto:{}>", self.address));
        for name in FOREIGN_LIST_FIELDS {
            message.remove(name);
        }
        if let Some(policies) = &self.policies {
            self.guard_dmarc(&mut message, policies.as_ref()).await?;
        }

        self.send(&mail, message.into_data()).await
    }

    async fn send(&self, source: &Mail, data: MailData) -> Result<(), FilterError> {
        let recipients: Vec<Recipient> = self
            .members
            .iter()
            .filter(|member| !member.disabled && !member.no_delivery)
            .map(|member| member.address.clone())
            .collect();
        if recipients.is_empty() {
            internal!(level = DEBUG, "List {} has no member receiving mail, dropping it", self.address);
            return Ok(());
        }

        let count = recipients.len();
        let mut mail = Mail::new(self.reverse_path.clone(), recipients, data);
        // Keeps the order of the list's mails.
        mail.arrival = source.arrival;
        mail.scheduled = source.arrival;
        self.transmitter.transmit(mail).await?;

        internal!(
            level = INFO,
            "Mail from <{}> sent to {count} member(s) of list {}",
            source.from,
            self.address
        );
        Ok(())
    }
}

#[async_trait]
impl MailDestination for ListDestination {
    async fn data(&self, mail: Mail) -> Result<(), FilterError> {
        self.redistribute(mail).await
    }
}
