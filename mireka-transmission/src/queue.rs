//! The outbound queue: durable storage plus a scheduler dispatching due
//! mails to a bounded set of delivery workers.

use std::{collections::BTreeSet, path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use mireka_common::{Signal, internal, mail::Mail, tracing};
use mireka_tracing::traced;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{Notify, Semaphore, broadcast};

use crate::{
    delivery::{DeliveryProcessor, Outcome},
    error::QueueError,
    name::MailName,
    store::QueueStore,
};

/// Waiting time before a mail is tried again after a local failure.
const LOCAL_RETRY_DELAY: TimeDelta = TimeDelta::minutes(5);

/// Local failures are retried for this long before the mail is set aside.
const LOCAL_RETRY_LIMIT: TimeDelta = TimeDelta::days(1);

/// How long shutdown waits for in-flight deliveries.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Wakes the scheduler even when nothing is due.
const IDLE_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub directory: PathBuf,

    /// Mails the queue holds at most; further mails are refused.
    #[serde(default = "defaults::capacity")]
    pub capacity: usize,

    /// Deliveries running at the same time.
    #[serde(default = "defaults::workers")]
    pub workers: usize,
}

mod defaults {
    pub const fn capacity() -> usize {
        2000
    }

    pub const fn workers() -> usize {
        4
    }
}

impl QueueConfig {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            capacity: defaults::capacity(),
            workers: defaults::workers(),
        }
    }
}

pub struct Queue {
    store: QueueStore,
    processor: DeliveryProcessor,
    /// Mails by the time of their next attempt.
    schedule: Mutex<BTreeSet<(DateTime<Utc>, MailName)>>,
    /// First local failure of mails which could not be processed.
    local_failures: DashMap<MailName, DateTime<Utc>>,
    /// What is left to queue of attempts that failed to settle. The next
    /// run of such a mail finishes the attempt instead of sending again.
    unsettled: DashMap<MailName, Outcome>,
    wakeup: Notify,
    workers: Arc<Semaphore>,
    worker_count: usize,
}

impl Queue {
    #[must_use]
    pub fn new(config: &QueueConfig, processor: DeliveryProcessor) -> Self {
        let worker_count = config.workers.max(1);
        Self {
            store: QueueStore::new(&config.directory, config.capacity),
            processor,
            schedule: Mutex::new(BTreeSet::new()),
            local_failures: DashMap::new(),
            unsettled: DashMap::new(),
            wakeup: Notify::new(),
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &QueueStore {
        &self.store
    }

    /// Whether the mails of this queue are split by remote part before
    /// they are stored.
    #[must_use]
    pub fn single_domain_only(&self) -> bool {
        self.processor.single_domain_only()
    }

    /// Loads the mails left in the queue directory.
    ///
    /// # Errors
    /// If the directory cannot be created or listed.
    pub async fn init(&self) -> Result<(), QueueError> {
        let names = self.store.init().await?;
        self.schedule
            .lock()
            .extend(names.into_iter().map(|name| (name.scheduled(), name)));
        self.wakeup.notify_one();
        Ok(())
    }

    /// Stores `mail` and schedules it.
    ///
    /// # Errors
    /// If the queue is full or the mail cannot be written.
    pub async fn add(&self, mail: &Mail) -> Result<MailName, QueueError> {
        let name = self.store.save(mail).await?;
        internal!(level = DEBUG, "Queued {name} for {} recipient(s)", mail.recipients.len());
        self.schedule_at(name, name.scheduled());
        Ok(name)
    }

    /// Mails waiting for their next attempt.
    #[must_use]
    pub fn scheduled(&self) -> usize {
        self.schedule.lock().len()
    }

    /// Takes the earliest mail if it is due, otherwise tells how long to
    /// wait for it.
    fn next_due(&self, now: DateTime<Utc>) -> Result<MailName, Duration> {
        let mut schedule = self.schedule.lock();
        match schedule.first().copied() {
            Some((at, name)) if at <= now => {
                schedule.pop_first();
                Ok(name)
            }
            Some((at, _)) => Err((at - now).to_std().unwrap_or(Duration::ZERO).min(IDLE_WAIT)),
            None => Err(IDLE_WAIT),
        }
    }

    /// Dispatches due mails until shutdown.
    ///
    /// On shutdown no further mail is started and running deliveries get a
    /// grace period. Mails still in flight afterwards stay in the queue
    /// directory and are retried after a restart.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all))]
    pub async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        internal!(
            level = INFO,
            "Queue {} serving with {} worker(s)",
            self.store.directory().display(),
            self.worker_count
        );

        loop {
            match self.next_due(Utc::now()) {
                Ok(name) => {
                    let permit = tokio::select! {
                        permit = Arc::clone(&self.workers).acquire_owned() => permit,
                        _ = shutdown.recv() => break,
                    };
                    let Ok(permit) = permit else {
                        break;
                    };

                    let queue = Arc::clone(&self);
                    tokio::spawn(async move {
                        queue.deliver(name).await;
                        drop(permit);
                    });
                }
                Err(wait) => {
                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        () = self.wakeup.notified() => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }

        internal!("Queue {} received shutdown signal", self.store.directory().display());
        let workers = u32::try_from(self.worker_count).unwrap_or(u32::MAX);
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.workers.acquire_many(workers)).await {
            Ok(_) => internal!(level = INFO, "Queue {} stopped", self.store.directory().display()),
            Err(_) => internal!(
                level = WARN,
                "Shutdown timeout exceeded, in-flight deliveries will be retried on restart"
            ),
        }
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(name = %name)), timing(precision = "ms"))]
    async fn deliver(&self, name: MailName) {
        let mut outcome = if let Some((_, outcome)) = self.unsettled.remove(&name) {
            internal!(level = DEBUG, "Finishing the previous attempt of {name}");
            outcome
        } else {
            match self.store.read(&name).await {
                Ok(mail) => self.processor.process(&mail).await,
                Err(err) => {
                    self.local_failure(name, &err).await;
                    return;
                }
            }
        };

        match self.settle(name, &mut outcome).await {
            Ok(()) => {
                self.local_failures.remove(&name);
            }
            Err(err) => {
                self.unsettled.insert(name, outcome);
                self.local_failure(name, &err).await;
            }
        }
    }

    /// Queues what the attempt produced, then retires the attempted mail.
    ///
    /// Each part is taken out of `outcome` once it is queued.
    async fn settle(&self, name: MailName, outcome: &mut Outcome) -> Result<(), QueueError> {
        if let Some(dsn) = &outcome.dsn {
            self.add(dsn).await?;
            outcome.dsn = None;
        }
        if let Some(retry) = &outcome.retry {
            self.add(retry).await?;
            outcome.retry = None;
        }

        if outcome.gave_up {
            self.store.move_to_error(&name).await
        } else {
            self.store.delete(&name).await
        }
    }

    /// The mail is retried a while later, or set aside when it keeps
    /// failing locally.
    async fn local_failure(&self, name: MailName, err: &QueueError) {
        let now = Utc::now();
        let first = *self.local_failures.entry(name).or_insert(now);

        if now - first < LOCAL_RETRY_LIMIT {
            internal!(level = ERROR, "Processing {name} failed, retrying in {LOCAL_RETRY_DELAY}: {err}");
            self.schedule_at(name, now + LOCAL_RETRY_DELAY);
            return;
        }

        internal!(level = ERROR, "Processing {name} keeps failing since {first}, moving it aside: {err}");
        self.local_failures.remove(&name);
        if let Some((_, rest)) = self.unsettled.remove(&name)
            && rest.dsn.is_some()
        {
            internal!(level = ERROR, "The notification for {name} was never queued");
        }
        if let Err(err) = self.store.move_to_error(&name).await {
            internal!(level = ERROR, "Cannot move {name} to the error directory: {err}");
        }
    }

    fn schedule_at(&self, name: MailName, at: DateTime<Utc>) {
        self.schedule.lock().insert((at, name));
        self.wakeup.notify_one();
    }
}
