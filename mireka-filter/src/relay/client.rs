use std::sync::Arc;

use mireka_common::{
    address::{Recipient, ReversePath},
    error::RejectError,
    internal,
    mail::MailData,
};
use mireka_smtp::client::SmtpClient;

use super::backend::{
    BackendServer, REJECTED_DATA, REJECTED_END_OF_DATA, REJECTED_RECIPIENT, REJECTED_SENDER,
    backend_rejection, transport_failure,
};

/// The backend is closing the channel; nothing more can be sent on it.
const SERVICE_CLOSING: u16 = 421;

/// One connection to a backend server, replaying the inbound transaction.
///
/// Once the connection is broken, or the backend refused the session or
/// the sender, the failure is kept and every later call returns it without
/// touching the network. A refused recipient only affects that recipient,
/// unless the refusal is a 421.
pub struct BackendClient {
    server: Arc<BackendServer>,
    connection: Option<SmtpClient>,
    fault: Option<RejectError>,
    accepted_recipients: usize,
}

impl BackendClient {
    #[must_use]
    pub const fn new(server: Arc<BackendServer>) -> Self {
        Self {
            server,
            connection: None,
            fault: None,
            accepted_recipients: 0,
        }
    }

    #[must_use]
    pub fn server(&self) -> &BackendServer {
        &self.server
    }

    #[must_use]
    pub const fn fault(&self) -> Option<&RejectError> {
        self.fault.as_ref()
    }

    #[must_use]
    pub const fn has_accepted_recipient(&self) -> bool {
        self.accepted_recipients > 0
    }

    pub async fn connect(&mut self) -> Result<(), RejectError> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }

        match self.server.connect().await {
            Ok(connection) => {
                self.connection = Some(connection);
                Ok(())
            }
            Err(reject) => Err(self.memorize(reject)),
        }
    }

    pub async fn from(&mut self, reverse_path: &ReversePath) -> Result<(), RejectError> {
        let result = self.live()?.mail_from(&reverse_path.to_string(), None).await;
        match result {
            Ok(response) if response.is_success() => Ok(()),
            Ok(response) => Err(self.memorize(backend_rejection(&response, REJECTED_SENDER))),
            Err(err) => Err(self.memorize(transport_failure(&err))),
        }
    }

    pub async fn recipient(&mut self, recipient: &Recipient) -> Result<(), RejectError> {
        let result = self.live()?.rcpt_to(&recipient.to_string()).await;
        match result {
            Ok(response) if response.is_success() => {
                self.accepted_recipients += 1;
                Ok(())
            }
            Ok(response) if response.code == SERVICE_CLOSING => {
                self.connection = None;
                Err(self.memorize(backend_rejection(&response, REJECTED_RECIPIENT)))
            }
            Ok(response) => Err(backend_rejection(&response, REJECTED_RECIPIENT)),
            Err(err) => Err(self.memorize(transport_failure(&err))),
        }
    }

    pub async fn data(&mut self, data: &MailData) -> Result<(), RejectError> {
        let result = self.live()?.data().await;
        match result {
            Ok(response) if response.code == 354 => {}
            Ok(response) => return Err(self.memorize(backend_rejection(&response, REJECTED_DATA))),
            Err(err) => return Err(self.memorize(transport_failure(&err))),
        }

        let result = self.live()?.send_data(data).await;
        match result {
            Ok(response) if response.is_success() => Ok(()),
            Ok(response) => Err(self.memorize(backend_rejection(&response, REJECTED_END_OF_DATA))),
            Err(err) => Err(self.memorize(transport_failure(&err))),
        }
    }

    /// Closes the connection if one was opened. Failures are only logged.
    pub async fn quit(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };

        if let Err(err) = connection.quit(self.server.timeouts.quit()).await {
            internal!(
                level = DEBUG,
                "QUIT to backend {} failed: {err}",
                self.server.host
            );
        }
    }

    fn live(&mut self) -> Result<&mut SmtpClient, RejectError> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        self.connection
            .as_mut()
            .ok_or_else(|| RejectError::plain(451, "Backend connection is not open"))
    }

    fn memorize(&mut self, reject: RejectError) -> RejectError {
        internal!(
            level = DEBUG,
            "Backend {}:{} is failing for the rest of the transaction: {reject}",
            self.server.host,
            self.server.port
        );
        self.fault = Some(reject.clone());
        reject
    }
}
