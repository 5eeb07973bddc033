//! One delivery attempt of a queued mail and its consequences.

use std::sync::Arc;

use chrono::Utc;
use mireka_common::{internal, mail::Mail};

use crate::{
    dsn::DsnComposer,
    error::SendError,
    retry::{Plan, RetryPolicy},
    sender::ImmediateSender,
};

/// What the queue has to do after an attempt.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Queued again for the recipients worth another attempt.
    pub retry: Option<Mail>,
    /// Delivery status notification for the sender.
    pub dsn: Option<Mail>,
    /// The attempted mail failed for good and is kept for inspection.
    pub gave_up: bool,
}

pub struct DeliveryProcessor {
    sender: Arc<dyn ImmediateSender>,
    policy: RetryPolicy,
    dsn: DsnComposer,
}

impl DeliveryProcessor {
    #[must_use]
    pub fn new(sender: Arc<dyn ImmediateSender>, policy: RetryPolicy, dsn: DsnComposer) -> Self {
        Self { sender, policy, dsn }
    }

    #[must_use]
    pub fn single_domain_only(&self) -> bool {
        self.sender.single_domain_only()
    }

    pub async fn process(&self, mail: &Mail) -> Outcome {
        let Err(err) = self.sender.send(mail).await else {
            internal!(level = INFO, "Delivered mail from <{}> to {} recipient(s)", mail.from, mail.recipients.len());
            return Outcome::default();
        };

        internal!(level = INFO, "Delivery attempt failed: {err}");
        let now = Utc::now();
        let plan = match err {
            SendError::Postpone { failure, delay } => self.policy.on_postpone(mail, failure, delay, now),
            SendError::RecipientsRejected { rejections } => {
                let failures = rejections
                    .into_iter()
                    .map(|rejection| (rejection.recipient, rejection.failure))
                    .collect();
                self.policy.on_failure(mail, failures, now)
            }
            SendError::Permanent(failure) | SendError::Transient(failure) => {
                let failures = mail
                    .recipients
                    .iter()
                    .map(|recipient| (recipient.clone(), failure.clone()))
                    .collect();
                self.policy.on_failure(mail, failures, now)
            }
        };

        self.outcome(mail, plan)
    }

    fn outcome(&self, mail: &Mail, plan: Plan) -> Outcome {
        let dsn = if plan.reports.is_empty() {
            None
        } else {
            let dsn = self.dsn.compose(mail, &plan.reports);
            if dsn.is_none() {
                internal!(level = INFO, "No notification is sent for a mail with a null reverse path");
            }
            dsn
        };

        Outcome {
            retry: plan.retry,
            dsn,
            gave_up: plan.gave_up,
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use mireka_common::{address::ReversePath, status::EnhancedStatus};
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        dsn::DsnConfig,
        error::{Failure, RecipientRejection},
    };

    struct Scripted(Mutex<Option<SendError>>);

    #[async_trait]
    impl ImmediateSender for Scripted {
        fn single_domain_only(&self) -> bool {
            true
        }

        async fn send(&self, _mail: &Mail) -> Result<(), SendError> {
            self.0.lock().take().map_or(Ok(()), Err)
        }
    }

    fn processor(result: Option<SendError>) -> DeliveryProcessor {
        DeliveryProcessor::new(
            Arc::new(Scripted(Mutex::new(result))),
            RetryPolicy::default(),
            DsnComposer::new(&DsnConfig {
                reporting_mta: String::from("mx.test"),
                from: None,
            }),
        )
    }

    fn mail() -> Mail {
        Mail::new(
            "jane@example.com".parse().unwrap(),
            vec!["a@example.org".parse().unwrap(), "b@example.org".parse().unwrap()],
            "Subject: x\r\n\r\nHello\r\n".into(),
        )
    }

    #[tokio::test]
    async fn success_leaves_nothing_to_do() {
        let outcome = processor(None).process(&mail()).await;
        assert!(outcome.retry.is_none());
        assert!(outcome.dsn.is_none());
        assert!(!outcome.gave_up);
    }

    #[tokio::test]
    async fn permanent_failure_bounces() {
        let err = SendError::Permanent(Failure::new(EnhancedStatus::BAD_DESTINATION_SYSTEM_ADDRESS));
        let outcome = processor(Some(err)).process(&mail()).await;

        assert!(outcome.retry.is_none());
        assert!(outcome.gave_up);
        let dsn = outcome.dsn.unwrap();
        assert_eq!(dsn.from, ReversePath::Null);
        assert_eq!(dsn.recipients, vec!["jane@example.com".parse().unwrap()]);
    }

    #[tokio::test]
    async fn rejected_recipients_only_are_retried() {
        let mail = mail();
        let err = SendError::RecipientsRejected {
            rejections: vec![RecipientRejection {
                recipient: mail.recipients[1].clone(),
                failure: Failure::new(EnhancedStatus::DIRECTORY_SERVER_FAILURE),
            }],
        };
        let outcome = processor(Some(err)).process(&mail).await;

        let retry = outcome.retry.unwrap();
        assert_eq!(retry.recipients, vec![mail.recipients[1].clone()]);
        assert_eq!(retry.delivery_attempts, 1);
        assert!(outcome.dsn.is_none());
        assert!(!outcome.gave_up);
    }

    #[tokio::test]
    async fn postponement_is_not_an_attempt() {
        let err = SendError::Postpone {
            failure: Failure::new(EnhancedStatus::TRANSIENT_LOCAL_ERROR),
            delay: std::time::Duration::from_secs(7),
        };
        let outcome = processor(Some(err)).process(&mail()).await;

        let retry = outcome.retry.unwrap();
        assert_eq!(retry.delivery_attempts, 0);
        assert_eq!(retry.postpones, 1);
        assert_eq!(retry.recipients.len(), 2);
    }
}
