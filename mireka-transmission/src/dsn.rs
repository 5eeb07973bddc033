//! Delivery status notifications (RFC 3464).

use std::fmt::{self, Display, Formatter, Write as _};

use chrono::{DateTime, Utc};
use mireka_common::{
    address::{Recipient, ReversePath},
    internal,
    mail::{Mail, MailData},
};
use serde::Deserialize;
use ulid::Ulid;

use crate::error::Failure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Failed,
    Delayed,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        })
    }
}

/// The problem of one recipient.
#[derive(Debug, Clone)]
pub struct RecipientReport {
    pub recipient: Recipient,
    pub action: Action,
    pub failure: Failure,
    /// For delayed recipients, when retrying stops.
    pub will_retry_until: Option<DateTime<Utc>>,
}

impl RecipientReport {
    #[must_use]
    pub const fn failed(recipient: Recipient, failure: Failure) -> Self {
        Self {
            recipient,
            action: Action::Failed,
            failure,
            will_retry_until: None,
        }
    }

    #[must_use]
    pub const fn delayed(recipient: Recipient, failure: Failure, until: DateTime<Utc>) -> Self {
        Self {
            recipient,
            action: Action::Delayed,
            failure,
            will_retry_until: Some(until),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DsnConfig {
    /// Name of this MTA in the `Reporting-MTA` field and the message id.
    pub reporting_mta: String,
    /// Value of the `From:` header. Defaults to the mailer daemon of the
    /// reporting MTA.
    #[serde(default)]
    pub from: Option<String>,
}

/// Builds the notification mail sent back to the originator.
#[derive(Debug, Clone)]
pub struct DsnComposer {
    reporting_mta: String,
    from: String,
}

impl DsnComposer {
    #[must_use]
    pub fn new(config: &DsnConfig) -> Self {
        let from = config.from.clone().unwrap_or_else(|| {
            format!("Mail Delivery Subsystem <mailer-daemon@{}>", config.reporting_mta)
        });
        Self {
            reporting_mta: config.reporting_mta.clone(),
            from,
        }
    }

    /// The notification for `reports`, or `None` when the mail has no
    /// reverse path to notify.
    #[must_use]
    pub fn compose(&self, mail: &Mail, reports: &[RecipientReport]) -> Option<Mail> {
        let ReversePath::Mailbox(sender) = &mail.from else {
            internal!(level = DEBUG, "No notification for a mail with null reverse path");
            return None;
        };
        if reports.is_empty() {
            return None;
        }

        let recipient: Recipient = match sender.to_string().parse() {
            Ok(recipient) => recipient,
            Err(err) => {
                internal!(level = WARN, "Cannot notify sender {sender}: {err}");
                return None;
            }
        };

        let boundary = format!("{}/{}", Ulid::new(), self.reporting_mta);
        let mut content = String::with_capacity(2048);
        self.headers(&mut content, mail, &boundary);

        content.push_str("This is a MIME-encapsulated message.\r\n\r\n");
        let _ = write!(content, "--{boundary}\r\n");
        content.push_str("Content-Type: text/plain; charset=us-ascii\r\n\r\n");
        human_readable(&mut content, mail, reports);

        let _ = write!(content, "\r\n--{boundary}\r\n");
        content.push_str("Content-Type: message/delivery-status\r\n\r\n");
        self.delivery_status(&mut content, mail, reports);

        let _ = write!(content, "\r\n--{boundary}\r\n");
        content.push_str("Content-Type: message/rfc822\r\n\r\n");

        let mut bytes = content.into_bytes();
        bytes.extend_from_slice(&mail.data);
        if !mail.data.ends_with(b"\r\n") {
            bytes.extend_from_slice(b"\r\n");
        }
        bytes.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        Some(Mail::new(
            ReversePath::Null,
            vec![recipient],
            MailData::from(bytes),
        ))
    }

    fn headers(&self, out: &mut String, mail: &Mail, boundary: &str) {
        let _ = write!(
            out,
            "MIME-Version: 1.0\r\n\
             Date: {}\r\n\
             Message-ID: <{}@{}>\r\n\
             Subject: Delivery Status Notification\r\n\
             From: {}\r\n\
             To: {}\r\n\
             Content-Type: multipart/report; report-type=delivery-status;\r\n\
             \tboundary=\"{boundary}\"\r\n\r\n",
            Utc::now().to_rfc2822(),
            Ulid::new(),
            self.reporting_mta,
            self.from,
            mail.from.smtp_text(),
        );
    }

    fn delivery_status(&self, out: &mut String, mail: &Mail, reports: &[RecipientReport]) {
        let _ = write!(out, "Reporting-MTA: dns; {}\r\n", self.reporting_mta);
        if let Some(received_from) = &mail.received_from {
            let name = received_from
                .helo
                .clone()
                .unwrap_or_else(|| received_from.address.to_string());
            let _ = write!(
                out,
                "Received-From-MTA: dns; {name} (unknown [{}])\r\n",
                received_from.address
            );
        }
        let _ = write!(out, "Arrival-Date: {}\r\n", mail.arrival.to_rfc2822());

        for report in reports {
            let failure = &report.failure;
            out.push_str("\r\n");
            let _ = write!(out, "Final-Recipient: rfc822; {}\r\n", report.recipient);
            let _ = write!(out, "Action: {}\r\n", report.action);
            let _ = write!(
                out,
                "Status: {} ({})\r\n",
                failure.status.code,
                single_line(&failure.status.message)
            );
            if let Some(remote_mta) = &failure.remote_mta {
                let _ = write!(out, "Remote-MTA: dns; {}\r\n", remote_mta.dns_name);
            }
            if let Some(reply) = &failure.remote_reply {
                let _ = write!(out, "Diagnostic-Code: smtp; {}\r\n", reply.replace('\n', "\r\n "));
            }
            let _ = write!(out, "Last-Attempt-Date: {}\r\n", failure.date.to_rfc2822());
            let _ = write!(out, "Final-Log-ID: {}\r\n", failure.log_id);
            if let Some(until) = report.will_retry_until {
                let _ = write!(out, "Will-Retry-Until: {}\r\n", until.to_rfc2822());
            }
        }
    }
}

fn human_readable(out: &mut String, mail: &Mail, reports: &[RecipientReport]) {
    out.push_str("This is an automatically generated Delivery Status Notification.\r\n\r\n");
    let _ = write!(
        out,
        "The original message was received at {}\r\nfrom {}\r\n",
        mail.arrival.to_rfc2822(),
        mail.from.smtp_text()
    );

    for (action, title) in [
        (Action::Failed, "The following addresses had permanent fatal errors"),
        (Action::Delayed, "The following addresses had transient non-fatal errors"),
    ] {
        let mut section = reports.iter().filter(|r| r.action == action).peekable();
        if section.peek().is_none() {
            continue;
        }

        let _ = write!(out, "\r\n    ----- {title} -----\r\n");
        for report in section {
            let _ = write!(out, "<{}>  ({action})\r\n", report.recipient);
            let failure = &report.failure;
            match &failure.remote_mta {
                Some(remote_mta) => {
                    let _ = write!(
                        out,
                        "    {} said: {}\r\n",
                        remote_mta,
                        single_line(&failure.status.to_string())
                    );
                }
                None => {
                    let _ = write!(out, "    {}\r\n", single_line(&failure.status.to_string()));
                }
            }
        }
    }
}

fn single_line(text: &str) -> String {
    text.lines().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use mailparse::{MailHeaderMap, parse_mail};
    use mireka_common::{mail::ReceivedFrom, status::EnhancedStatus};
    use mireka_smtp::client::Response;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::RemoteMta;

    fn composer() -> DsnComposer {
        DsnComposer::new(&DsnConfig {
            reporting_mta: String::from("mx.example.com"),
            from: None,
        })
    }

    fn original() -> Mail {
        Mail::new(
            "jane@example.com".parse().unwrap(),
            vec!["john@example.org".parse().unwrap()],
            MailData::from("Subject: hello\r\n\r\nHello World!\r\n"),
        )
        .with_received_from(Some(ReceivedFrom {
            helo: Some(String::from("client.example.com")),
            address: "192.0.2.7".parse().unwrap(),
        }))
    }

    fn rejected() -> RecipientReport {
        let response = Response::new(550, vec![String::from("5.1.1 No such user")]);
        let failure = Failure::remote(
            &response,
            RemoteMta::new("mx.example.org", Some("192.0.2.25".parse().unwrap())),
        );
        RecipientReport::failed("john@example.org".parse().unwrap(), failure)
    }

    #[test]
    fn notification_envelope() {
        let dsn = composer().compose(&original(), &[rejected()]).unwrap();
        assert!(dsn.from.is_null());
        assert_eq!(dsn.recipients.len(), 1);
        assert_eq!(dsn.recipients[0].to_string(), "jane@example.com");
    }

    #[test]
    fn notification_structure() {
        let mail = original();
        let report = rejected();
        let log_id = report.failure.log_id;
        let dsn = composer().compose(&mail, &[report]).unwrap();

        let parsed = parse_mail(&dsn.data).unwrap();
        assert_eq!(parsed.ctype.mimetype, "multipart/report");
        assert_eq!(
            parsed.ctype.params.get("report-type").map(String::as_str),
            Some("delivery-status")
        );
        assert_eq!(
            parsed.headers.get_first_value("Subject").as_deref(),
            Some("Delivery Status Notification")
        );
        assert_eq!(
            parsed.headers.get_first_value("To").as_deref(),
            Some("<jane@example.com>")
        );
        assert_eq!(
            parsed.headers.get_first_value("From").as_deref(),
            Some("Mail Delivery Subsystem <mailer-daemon@mx.example.com>")
        );

        assert_eq!(parsed.subparts.len(), 3);
        let text = parsed.subparts[0].get_body().unwrap();
        assert!(text.starts_with("This is an automatically generated Delivery Status Notification."));
        assert!(text.contains("<john@example.org>  (failed)"));
        assert!(text.contains("mx.example.org [192.0.2.25] said: 550 5.1.1 No such user"));

        assert_eq!(parsed.subparts[1].ctype.mimetype, "message/delivery-status");
        let status = parsed.subparts[1].get_body().unwrap();
        assert!(status.starts_with("Reporting-MTA: dns; mx.example.com\r\n"));
        assert!(status.contains("Received-From-MTA: dns; client.example.com (unknown [192.0.2.7])\r\n"));
        assert!(status.contains("Final-Recipient: rfc822; john@example.org\r\n"));
        assert!(status.contains("Action: failed\r\n"));
        assert!(status.contains("Status: 5.1.1 (No such user)\r\n"));
        assert!(status.contains("Remote-MTA: dns; mx.example.org\r\n"));
        assert!(status.contains("Diagnostic-Code: smtp; 550 5.1.1 No such user\r\n"));
        assert!(status.contains(&format!("Final-Log-ID: {log_id}\r\n")));

        assert_eq!(parsed.subparts[2].ctype.mimetype, "message/rfc822");
        let attached = parsed.subparts[2].get_body_raw().unwrap();
        assert!(attached.starts_with(b"Subject: hello\r\n\r\nHello World!"));
    }

    #[test]
    fn local_failures_have_no_remote_fields() {
        let report = RecipientReport::delayed(
            "john@example.org".parse().unwrap(),
            Failure::new(EnhancedStatus::DIRECTORY_SERVER_FAILURE),
            Utc::now(),
        );
        let dsn = composer().compose(&original(), &[report]).unwrap();
        let text = String::from_utf8_lossy(&dsn.data);

        assert!(text.contains("transient non-fatal errors"));
        assert!(text.contains("Action: delayed\r\n"));
        assert!(text.contains("Status: 4.4.3 (Directory server failure)\r\n"));
        assert!(text.contains("Will-Retry-Until: "));
        assert!(!text.contains("Remote-MTA"));
        assert!(!text.contains("Diagnostic-Code"));
    }

    #[test]
    fn bounces_are_never_bounced() {
        let mut mail = original();
        mail.from = ReversePath::Null;
        assert!(composer().compose(&mail, &[rejected()]).is_none());
    }
}
