#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{net::IpAddr, sync::Arc, time::Duration};

use mailparse::{MailHeaderMap, parse_mail};
use mireka_common::{Signal, address::ReversePath, mail::Mail, transmitter::Transmitter};
use mireka_smtp::timeouts::ClientTimeouts;
use mireka_test_support::{MockSmtpServer, SmtpCommand};
use mireka_transmission::{
    DeliveryProcessor, DirectConfig, DirectSender, DsnComposer, DsnConfig, MailToHost,
    OutgoingConnections, Queue, QueueConfig, QueuingTransmitter, RetryPolicy, StaticResolver,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

struct Harness {
    queue: Arc<Queue>,
    shutdown: broadcast::Sender<Signal>,
    directory: TempDir,
}

impl Harness {
    async fn new(resolver: StaticResolver, port: u16) -> Self {
        Self::with_policy(resolver, port, RetryPolicy::default()).await
    }

    async fn with_policy(resolver: StaticResolver, port: u16, policy: RetryPolicy) -> Self {
        let directory = tempfile::tempdir().unwrap();
        let sender = DirectSender::new(
            Arc::new(resolver),
            MailToHost::new(
                Arc::new(OutgoingConnections::new(0)),
                "mx.test",
                ClientTimeouts::default(),
            ),
            &DirectConfig { port },
        );
        let processor = DeliveryProcessor::new(
            Arc::new(sender),
            policy,
            DsnComposer::new(&DsnConfig {
                reporting_mta: String::from("mx.test"),
                from: None,
            }),
        );
        let queue = Arc::new(Queue::new(&QueueConfig::new(directory.path()), processor));
        queue.init().await.unwrap();

        let (shutdown, _) = broadcast::channel(4);
        tokio::spawn(Arc::clone(&queue).serve(shutdown.subscribe()));

        Self {
            queue,
            shutdown,
            directory,
        }
    }

    fn error_files(&self) -> Vec<String> {
        let mut files: Vec<String> = std::fs::read_dir(self.directory.path().join("error"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        files
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(Signal::Shutdown);
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn mail(recipients: &[&str]) -> Mail {
    Mail::new(
        "jane@sender.test".parse().unwrap(),
        recipients.iter().map(|r| r.parse().unwrap()).collect(),
        "Subject: Queued\r\n\r\nHello World!\r\n".into(),
    )
}

#[tokio::test]
async fn unreachable_mail_exchanger_falls_through_to_the_next() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let resolver = StaticResolver::default()
        .with_exchangers("example.test", &["mx1.example.test", "mx2.example.test"])
        .with_address("mx1.example.test", "127.0.0.2".parse().unwrap())
        .with_address("mx2.example.test", localhost());
    let harness = Harness::new(resolver, server.addr().port()).await;

    harness.queue.add(&mail(&["john@example.test"])).await.unwrap();

    wait_for(|| harness.queue.store().is_empty()).await;
    let messages = server.messages();
    assert_eq!(messages.len(), 1);
    assert!(String::from_utf8_lossy(&messages[0]).contains("Hello World!"));
    assert!(
        server
            .commands()
            .contains(&SmtpCommand::RcptTo(String::from("john@example.test")))
    );
    assert!(harness.error_files().is_empty());
}

#[tokio::test]
async fn permanent_rejection_bounces_to_the_sender() {
    let destination = MockSmtpServer::builder()
        .with_rcpt_to_response(550, "5.1.1 No such user here")
        .build()
        .await
        .unwrap();
    let resolver = StaticResolver::default()
        .with_address("example.test", localhost())
        .with_address("sender.test", localhost());
    let harness = Harness::new(resolver, destination.addr().port()).await;

    harness.queue.add(&mail(&["nobody@example.test"])).await.unwrap();

    // The notification goes back through the same server, which refuses
    // it as well; a bounce is never bounced.
    wait_for(|| harness.error_files().len() == 4 && harness.queue.store().is_empty()).await;

    let rcpts: Vec<SmtpCommand> = destination
        .commands()
        .into_iter()
        .filter(|command| matches!(command, SmtpCommand::RcptTo(_)))
        .collect();
    assert_eq!(
        rcpts,
        vec![
            SmtpCommand::RcptTo(String::from("nobody@example.test")),
            SmtpCommand::RcptTo(String::from("jane@sender.test")),
        ]
    );
    assert!(
        destination
            .commands()
            .contains(&SmtpCommand::MailFrom(String::new()))
    );

    let error_files = harness.error_files();
    assert_eq!(error_files.iter().filter(|f| f.ends_with(".eml")).count(), 2);
    assert_eq!(error_files.iter().filter(|f| f.ends_with(".properties")).count(), 2);
}

#[tokio::test]
async fn notification_reaches_the_sender() {
    let server = MockSmtpServer::builder()
        .with_rcpt_to_response_for("nobody@example.test", 550, "5.1.1 No such user here")
        .build()
        .await
        .unwrap();
    let resolver = StaticResolver::default()
        .with_address("example.test", localhost())
        .with_address("sender.test", localhost());
    let harness = Harness::new(resolver, server.addr().port()).await;

    harness.queue.add(&mail(&["nobody@example.test"])).await.unwrap();

    wait_for(|| !server.messages().is_empty() && harness.queue.store().is_empty()).await;
    let messages = server.messages();
    assert_eq!(messages.len(), 1);

    let dsn = parse_mail(&messages[0]).unwrap();
    assert_eq!(dsn.ctype.mimetype, "multipart/report");
    assert_eq!(
        dsn.headers.get_first_value("Subject").as_deref(),
        Some("Delivery Status Notification")
    );
    let status = dsn.subparts[1].get_body().unwrap();
    assert!(status.contains("Final-Recipient: rfc822; nobody@example.test"));
    assert!(status.contains("Action: failed"));
    assert!(status.contains("Status: 5.1.1"));
    assert!(status.contains("Diagnostic-Code: smtp; 550 5.1.1 No such user here"));

    // Only the original is kept for inspection.
    assert_eq!(harness.error_files().len(), 2);
}

#[tokio::test]
async fn transient_rejection_stays_queued() {
    let server = MockSmtpServer::builder()
        .with_rcpt_to_response(450, "4.2.1 Mailbox busy")
        .build()
        .await
        .unwrap();
    let resolver = StaticResolver::default().with_address("example.test", localhost());
    let harness = Harness::new(resolver, server.addr().port()).await;

    let first = harness.queue.add(&mail(&["john@example.test"])).await.unwrap();

    wait_for(|| {
        server.connections() == 1
            && harness.queue.scheduled() == 1
            && harness.queue.store().len() == 1
            && !harness
                .directory
                .path()
                .join(first.envelope_file_name())
                .exists()
    })
    .await;

    assert!(server.messages().is_empty());
    assert!(harness.error_files().is_empty());
}

#[tokio::test]
async fn expired_mail_bounces_instead_of_retrying() {
    let server = MockSmtpServer::builder()
        .with_rcpt_to_response_for("john@example.test", 450, "4.2.1 Mailbox busy")
        .build()
        .await
        .unwrap();
    let resolver = StaticResolver::default()
        .with_address("example.test", localhost())
        .with_address("sender.test", localhost());
    let policy = RetryPolicy {
        max_retry_age_secs: Some(60 * 60),
        ..RetryPolicy::default()
    };
    let harness = Harness::with_policy(resolver, server.addr().port(), policy).await;

    let mut old = mail(&["john@example.test"]);
    old.arrival -= chrono::TimeDelta::days(2);
    harness.queue.add(&old).await.unwrap();

    wait_for(|| {
        server.messages().len() == 1
            && harness.queue.store().is_empty()
            && harness.error_files().len() == 2
    })
    .await;

    assert_eq!(server.connections(), 2);
    let messages = server.messages();
    let dsn = parse_mail(&messages[0]).unwrap();
    let status = dsn.subparts[1].get_body().unwrap();
    assert!(status.contains("Final-Recipient: rfc822; john@example.test"));
    assert!(status.contains("Action: failed"));
    assert!(status.contains("Status: 4.2.1"));
    assert_eq!(harness.queue.scheduled(), 0);
}

#[tokio::test]
async fn mails_survive_a_restart() {
    let directory = tempfile::tempdir().unwrap();
    let name = {
        let processor = DeliveryProcessor::new(
            Arc::new(DirectSender::new(
                Arc::new(StaticResolver::default()),
                MailToHost::new(
                    Arc::new(OutgoingConnections::new(0)),
                    "mx.test",
                    ClientTimeouts::default(),
                ),
                &DirectConfig::default(),
            )),
            RetryPolicy::default(),
            DsnComposer::new(&DsnConfig {
                reporting_mta: String::from("mx.test"),
                from: None,
            }),
        );
        let queue = Queue::new(&QueueConfig::new(directory.path()), processor);
        queue.init().await.unwrap();
        queue.add(&mail(&["john@example.test"])).await.unwrap()
    };

    let server = MockSmtpServer::builder().build().await.unwrap();
    let resolver = StaticResolver::default().with_address("example.test", localhost());
    let sender = DirectSender::new(
        Arc::new(resolver),
        MailToHost::new(
            Arc::new(OutgoingConnections::new(0)),
            "mx.test",
            ClientTimeouts::default(),
        ),
        &DirectConfig {
            port: server.addr().port(),
        },
    );
    let processor = DeliveryProcessor::new(
        Arc::new(sender),
        RetryPolicy::default(),
        DsnComposer::new(&DsnConfig {
            reporting_mta: String::from("mx.test"),
            from: None,
        }),
    );
    let queue = Arc::new(Queue::new(&QueueConfig::new(directory.path()), processor));
    queue.init().await.unwrap();
    assert_eq!(queue.store().len(), 1);

    let (shutdown, _) = broadcast::channel(4);
    tokio::spawn(Arc::clone(&queue).serve(shutdown.subscribe()));

    wait_for(|| queue.store().is_empty()).await;
    assert_eq!(server.messages().len(), 1);
    assert!(!directory.path().join(name.envelope_file_name()).exists());
    shutdown.send(Signal::Shutdown).unwrap();
}

#[tokio::test]
async fn transmitter_splits_by_domain() {
    let harness = Harness::new(StaticResolver::default(), 25).await;
    // Stop the scheduler so the stored copies can be counted.
    harness.shutdown.send(Signal::Shutdown).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let transmitter = QueuingTransmitter::new(Arc::clone(&harness.queue));
    transmitter
        .transmit(mail(&["a@example.org", "b@example.net", "c@example.org"]))
        .await
        .unwrap();
    assert_eq!(harness.queue.store().len(), 2);

    let err = transmitter
        .transmit(Mail::new(
            ReversePath::Null,
            vec!["postmaster".parse().unwrap()],
            "Subject: x\r\n\r\n".into(),
        ))
        .await
        .unwrap_err();
    assert!(err.is_permanent());
    assert_eq!(harness.queue.store().len(), 2);
}
