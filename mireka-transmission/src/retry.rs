//! What happens to a mail after a failed delivery attempt.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use mireka_common::{address::Recipient, internal, mail::Mail};
use serde::{Deserialize, Serialize};

use crate::{dsn::RecipientReport, error::Failure};

/// When and how often delivery is retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Waiting time before each retry, in seconds. The number of entries is
    /// the number of retries.
    #[serde(default = "defaults::retry_periods_secs")]
    pub retry_periods_secs: Vec<u64>,

    /// Attempt counts after which the sender is told that delivery is
    /// delayed.
    #[serde(default)]
    pub delay_report_points: Vec<u32>,

    /// Postponed attempts tolerated before a postponement counts as a
    /// failure.
    #[serde(default = "defaults::max_postpones")]
    pub max_postpones: u32,

    /// Mails older than this are not retried any more. `None` relies on the
    /// retry periods alone.
    #[serde(default = "defaults::max_retry_age_secs")]
    pub max_retry_age_secs: Option<u64>,
}

mod defaults {
    pub fn retry_periods_secs() -> Vec<u64> {
        let mut periods = vec![3 * 60, 27 * 60, 30 * 60];
        periods.extend([2 * 60 * 60; 10]);
        periods.push(3 * 60 * 60);
        periods
    }

    pub const fn max_postpones() -> u32 {
        3
    }

    #[allow(clippy::unnecessary_wraps)]
    pub const fn max_retry_age_secs() -> Option<u64> {
        Some(5 * 24 * 60 * 60)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_periods_secs: defaults::retry_periods_secs(),
            delay_report_points: Vec::new(),
            max_postpones: defaults::max_postpones(),
            max_retry_age_secs: defaults::max_retry_age_secs(),
        }
    }
}

/// The consequences of an attempt.
#[derive(Debug, Default)]
pub struct Plan {
    /// The mail to queue again, restricted to the recipients still worth
    /// trying.
    pub retry: Option<Mail>,
    /// What the sender should be told.
    pub reports: Vec<RecipientReport>,
    /// Nothing is left to try and some recipient failed for good.
    pub gave_up: bool,
}

impl RetryPolicy {
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.retry_periods_secs.len()).unwrap_or(u32::MAX)
    }

    /// Delay before the retry following attempt number `attempts`.
    fn retry_delay(&self, attempts: u32) -> TimeDelta {
        let index = usize::try_from(attempts.saturating_sub(1)).unwrap_or(usize::MAX);
        let secs = self
            .retry_periods_secs
            .get(index)
            .or_else(|| self.retry_periods_secs.last())
            .copied()
            .unwrap_or(0);
        seconds(secs)
    }

    fn is_too_old(&self, mail: &Mail, now: DateTime<Utc>) -> bool {
        self.max_retry_age_secs
            .is_some_and(|age| now - mail.arrival > seconds(age))
    }

    /// The last moment a retry of `mail` may happen.
    fn retry_deadline(&self, mail: &Mail, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let remaining = (attempts..=self.max_attempts())
            .map(|attempt| self.retry_delay(attempt))
            .fold(TimeDelta::zero(), |sum, delay| sum.checked_add(&delay).unwrap_or(TimeDelta::MAX));
        let by_periods = later(now, remaining);

        self.max_retry_age_secs
            .map(|age| later(mail.arrival, seconds(age)))
            .map_or(by_periods, |by_age| by_age.min(by_periods))
    }

    /// Splits `failures` into those retried later and those given up, and
    /// counts the attempt.
    #[must_use]
    pub fn on_failure(
        &self,
        mail: &Mail,
        failures: Vec<(Recipient, Failure)>,
        now: DateTime<Utc>,
    ) -> Plan {
        let attempts = mail.delivery_attempts + 1;
        let exhausted = attempts > self.max_attempts() || self.is_too_old(mail, now);
        if exhausted {
            internal!(
                level = INFO,
                "Giving up on transient failures after {attempts} attempt(s) since {}",
                mail.arrival
            );
        }

        let (transient, permanent): (Vec<_>, Vec<_>) = failures
            .into_iter()
            .partition(|(_, failure)| failure.status.should_retry() && !exhausted);

        let mut plan = Plan {
            gave_up: transient.is_empty() && !permanent.is_empty(),
            reports: permanent
                .into_iter()
                .map(|(recipient, failure)| RecipientReport::failed(recipient, failure))
                .collect(),
            retry: None,
        };

        if transient.is_empty() {
            return plan;
        }

        if self.delay_report_points.contains(&attempts) {
            let until = self.retry_deadline(mail, attempts, now);
            plan.reports.extend(transient.iter().map(|(recipient, failure)| {
                RecipientReport::delayed(recipient.clone(), failure.clone(), until)
            }));
        }

        let mut retry = mail.for_recipients(transient.into_iter().map(|(r, _)| r).collect());
        retry.delivery_attempts = attempts;
        retry.postpones = 0;
        retry.scheduled = later(now, self.retry_delay(attempts));
        plan.retry = Some(retry);
        plan
    }

    /// Reschedules a postponed attempt shortly, or counts it as a failed
    /// attempt once it was postponed too often.
    #[must_use]
    pub fn on_postpone(
        &self,
        mail: &Mail,
        failure: Failure,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Plan {
        let postpones = mail.postpones + 1;
        if postpones <= self.max_postpones {
            let mut retry = mail.clone();
            retry.postpones = postpones;
            retry.scheduled = later(now, TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX));
            return Plan {
                retry: Some(retry),
                ..Plan::default()
            };
        }

        internal!(level = INFO, "Delivery was postponed {postpones} times, counting as a failure");
        let failure = Failure {
            status: failure.status.with_message(format!(
                "Too many postponements of delivery attempt, the last one: {}",
                failure.status.message
            )),
            ..failure
        };
        let failures = mail
            .recipients
            .iter()
            .map(|recipient| (recipient.clone(), failure.clone()))
            .collect();
        self.on_failure(mail, failures, now)
    }
}

fn seconds(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

fn later(at: DateTime<Utc>, delay: TimeDelta) -> DateTime<Utc> {
    at.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use mireka_common::{mail::MailData, status::EnhancedStatus};

    use super::*;

    fn mail(recipients: &[&str]) -> Mail {
        Mail::new(
            "jane@example.com".parse().unwrap(),
            recipients.iter().map(|r| r.parse().unwrap()).collect(),
            MailData::from("Subject: x\r\n\r\n"),
        )
    }

    fn transient() -> Failure {
        Failure::new(EnhancedStatus::DIRECTORY_SERVER_FAILURE)
    }

    fn permanent() -> Failure {
        Failure::new(EnhancedStatus::BAD_DESTINATION_SYSTEM_ADDRESS)
    }

    fn every(mail: &Mail, failure: &Failure) -> Vec<(Recipient, Failure)> {
        mail.recipients.iter().map(|r| (r.clone(), failure.clone())).collect()
    }

    #[test]
    fn default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 14);
        assert_eq!(policy.retry_delay(1), TimeDelta::minutes(3));
        assert_eq!(policy.retry_delay(2), TimeDelta::minutes(27));
        assert_eq!(policy.retry_delay(4), TimeDelta::hours(2));
        assert_eq!(policy.retry_delay(14), TimeDelta::hours(3));
    }

    #[test]
    fn transient_failure_is_retried() {
        let policy = RetryPolicy::default();
        let mut mail = mail(&["a@example.org"]);
        mail.postpones = 2;
        let now = Utc::now();

        let plan = policy.on_failure(&mail, every(&mail, &transient()), now);
        let retry = plan.retry.unwrap();
        assert_eq!(retry.delivery_attempts, 1);
        assert_eq!(retry.postpones, 0);
        assert_eq!(retry.scheduled, now + TimeDelta::minutes(3));
        assert!(plan.reports.is_empty());
        assert!(!plan.gave_up);
    }

    #[test]
    fn mixed_outcome_splits_recipients() {
        let policy = RetryPolicy::default();
        let mail = mail(&["a@example.org", "b@example.org"]);
        let failures = vec![
            (mail.recipients[0].clone(), transient()),
            (mail.recipients[1].clone(), permanent()),
        ];

        let plan = policy.on_failure(&mail, failures, Utc::now());
        assert_eq!(plan.retry.unwrap().recipients, vec![mail.recipients[0].clone()]);
        assert_eq!(plan.reports.len(), 1);
        assert_eq!(plan.reports[0].recipient, mail.recipients[1]);
        assert!(!plan.gave_up);
    }

    #[test]
    fn last_attempt_turns_transient_into_permanent() {
        let policy = RetryPolicy::default();
        let mut mail = mail(&["a@example.org"]);
        mail.delivery_attempts = policy.max_attempts();

        let plan = policy.on_failure(&mail, every(&mail, &transient()), Utc::now());
        assert!(plan.retry.is_none());
        assert!(plan.gave_up);
        assert_eq!(plan.reports.len(), 1);
        assert_eq!(plan.reports[0].failure.status, EnhancedStatus::DIRECTORY_SERVER_FAILURE);
    }

    #[test]
    fn old_mail_expires() {
        let policy = RetryPolicy {
            max_retry_age_secs: Some(60),
            ..RetryPolicy::default()
        };
        let mail = mail(&["a@example.org"]);

        let plan = policy.on_failure(&mail, every(&mail, &transient()), mail.arrival + TimeDelta::minutes(2));
        assert!(plan.retry.is_none());
        assert!(plan.gave_up);
    }

    #[test]
    fn delay_report_at_configured_attempt() {
        let policy = RetryPolicy {
            delay_report_points: vec![2],
            ..RetryPolicy::default()
        };
        let mut mail = mail(&["a@example.org"]);

        let plan = policy.on_failure(&mail, every(&mail, &transient()), Utc::now());
        assert!(plan.reports.is_empty());

        mail.delivery_attempts = 1;
        let plan = policy.on_failure(&mail, every(&mail, &transient()), Utc::now());
        assert_eq!(plan.reports.len(), 1);
        assert!(plan.reports[0].will_retry_until.is_some());
        assert!(plan.retry.is_some());
    }

    #[test]
    fn postpones_do_not_count_until_too_many() {
        let policy = RetryPolicy::default();
        let mut mail = mail(&["a@example.org"]);
        let now = Utc::now();

        let plan = policy.on_postpone(&mail, transient(), Duration::from_secs(10), now);
        let retry = plan.retry.unwrap();
        assert_eq!(retry.postpones, 1);
        assert_eq!(retry.delivery_attempts, 0);
        assert_eq!(retry.scheduled, now + TimeDelta::seconds(10));

        mail.postpones = 3;
        let plan = policy.on_postpone(&mail, transient(), Duration::from_secs(10), now);
        let retry = plan.retry.unwrap();
        assert_eq!(retry.postpones, 0);
        assert_eq!(retry.delivery_attempts, 1);
        assert_eq!(retry.scheduled, now + TimeDelta::minutes(3));
    }

    #[test]
    fn configuration() {
        let policy: RetryPolicy =
            ron::from_str("(retry_periods_secs: [60, 120], delay_report_points: [1])").unwrap();
        assert_eq!(policy.max_attempts(), 2);
        assert_eq!(policy.max_postpones, 3);
        assert_eq!(policy.max_retry_age_secs, Some(432_000));
    }
}
