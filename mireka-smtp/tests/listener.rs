#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use mireka_common::{Signal, listener::Listener, mail::MailData, status::Reply};
use mireka_smtp::{
    SessionInfo, Smtp, SmtpArgs, TransactionHandler, TransactionHandlerFactory,
    client::SmtpClient, command::MailParameters,
};
use parking_lot::Mutex;

#[derive(Default)]
struct Inbox {
    messages: Arc<Mutex<Vec<(Option<String>, Vec<u8>)>>>,
}

struct Collect {
    helo: Option<String>,
    messages: Arc<Mutex<Vec<(Option<String>, Vec<u8>)>>>,
}

#[async_trait]
impl TransactionHandler for Collect {
    async fn mail_from(&mut self, _: &str, _: &MailParameters) -> Result<(), Reply> {
        Ok(())
    }

    async fn rcpt_to(&mut self, _: &str) -> Result<(), Reply> {
        Ok(())
    }

    async fn data(&mut self, data: MailData) -> Result<(), Reply> {
        self.messages.lock().push((self.helo.clone(), data.to_vec()));
        Ok(())
    }

    async fn done(&mut self) {}
}

impl TransactionHandlerFactory for Inbox {
    fn create(&self, session: &SessionInfo) -> Box<dyn TransactionHandler> {
        Box::new(Collect {
            helo: session.helo.clone(),
            messages: Arc::clone(&self.messages),
        })
    }
}

#[tokio::test]
async fn listener_serves_sessions_until_shutdown() {
    let inbox = Arc::new(Inbox::default());
    let messages = Arc::clone(&inbox.messages);

    let listener = Listener::<Smtp>::new(
        "127.0.0.1:0".parse().unwrap(),
        SmtpArgs::builder()
            .with_banner("mx.test")
            .with_handler(inbox),
    );
    listener.init().expect("valid arguments");

    let socket = listener.bind().await.unwrap();
    let address = socket.local_addr().unwrap();
    let (shutdown, rx) = tokio::sync::broadcast::channel(4);
    let server = tokio::spawn(async move { listener.serve_on(socket, rx).await });

    let mut client = SmtpClient::connect(address, Duration::from_secs(5))
        .await
        .unwrap();
    let greeting = client.read_greeting().await.unwrap();
    assert_eq!(greeting.message(), "mx.test ESMTP mireka");

    assert!(client.ehlo("sender.test").await.unwrap().is_success());
    assert!(client.mail_from("a@sender.test", Some(20)).await.unwrap().is_success());
    assert!(client.rcpt_to("b@mx.test").await.unwrap().is_success());
    assert_eq!(client.data().await.unwrap().code, 354);
    let accepted = client.send_data(b"Subject: x\r\n\r\nbody").await.unwrap();
    assert_eq!(accepted.status().to_string(), "250 2.6.0 Message accepted");
    assert_eq!(client.quit(Duration::from_secs(1)).await.unwrap().code, 221);

    assert_eq!(
        messages.lock().clone(),
        vec![(
            Some(String::from("sender.test")),
            b"Subject: x\r\n\r\nbody\r\n".to_vec()
        )]
    );

    shutdown.send(Signal::Shutdown).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("listener stops")
        .unwrap()
        .unwrap();
}
