use mireka_common::{
    error::{SessionError, internal_error_reply},
    incoming, internal,
    status::{EnhancedCode, Reply, Status},
    traits::fsm::FiniteStateMachine,
};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Event, Session, io::Received};
use crate::{
    State,
    command::{Command, HeloVariant, MailParameters},
};

const HELP: &str = "Supported commands:\nHELO EHLO MAIL RCPT DATA\nRSET NOOP HELP QUIT";

fn ok(subject: u16, detail: u16, message: &'static str) -> Reply {
    Reply::enhanced(Status::Ok, EnhancedCode::new(2, subject, detail), message)
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    /// Applies one command and answers it.
    pub(super) async fn handle_command(&mut self, command: Command) -> Result<Event, SessionError> {
        incoming!("{command}");

        let previous = self.state.clone();
        let next = previous.clone().transition(command.clone(), &mut self.info);

        if let State::Invalid { reason } = next {
            internal!("{command} rejected in state {previous}");
            self.send(&Reply::enhanced(
                Status::InvalidCommandSequence,
                EnhancedCode::new(5, 5, 1),
                reason,
            ))
            .await?;
            return Ok(Event::ConnectionKeepAlive);
        }

        self.state = next;

        let reply = match command {
            Command::Helo(variant) => {
                self.end_transaction().await;
                self.greet(&variant)
            }
            Command::MailFrom(path, params) => self.mail_from(&path, &params, previous).await,
            Command::RcptTo(path) => self.rcpt_to(&path, previous).await,
            Command::Data => return self.data().await,
            Command::Rset => {
                self.end_transaction().await;
                ok(0, 0, "Ok")
            }
            Command::Noop => ok(0, 0, "Ok"),
            Command::Help => Reply::new(Status::HelpMessage, HELP),
            Command::Quit => {
                self.end_transaction().await;
                self.send(&Reply::enhanced(
                    Status::GoodBye,
                    EnhancedCode::new(2, 0, 0),
                    "Bye",
                ))
                .await?;
                return Ok(Event::ConnectionClose);
            }
            Command::Unsupported(_) => Reply::enhanced(
                Status::NotImplemented,
                EnhancedCode::new(5, 5, 1),
                "Command not implemented",
            ),
            Command::BadArguments(reason) => Reply::enhanced(
                Status::ParameterSyntaxError,
                EnhancedCode::new(5, 5, 4),
                reason,
            ),
            Command::Invalid(_) => Reply::enhanced(
                Status::SyntaxError,
                EnhancedCode::new(5, 5, 2),
                "Syntax error, command unrecognized",
            ),
        };

        self.send(&reply).await?;
        Ok(Event::ConnectionKeepAlive)
    }

    fn greet(&self, variant: &HeloVariant) -> Reply {
        let server = &self.info.server_name;

        match variant {
            HeloVariant::Helo(id) => {
                Reply::new(Status::Ok, format!("{server} says hello to {id}"))
            }
            HeloVariant::Ehlo(id) => {
                let size = if self.max_message_size > 0 {
                    format!("SIZE {}", self.max_message_size)
                } else {
                    String::from("SIZE")
                };
                Reply::new(
                    Status::Ok,
                    format!("{server} greets {id}\n8BITMIME\n{size}\nPIPELINING\nENHANCEDSTATUSCODES"),
                )
            }
        }
    }

    fn size_exceeded() -> Reply {
        Reply::enhanced(
            Status::ExceededStorage,
            EnhancedCode::new(5, 3, 4),
            "Message size exceeds fixed maximum message size",
        )
    }

    async fn mail_from(&mut self, path: &str, params: &MailParameters, mut previous: State) -> Reply {
        if previous.in_transaction() {
            internal!(level = DEBUG, "MAIL inside a transaction, resetting it");
            self.end_transaction().await;
            previous = State::Greeted;
        }

        if self.max_message_size > 0
            && params.size().is_some_and(|size| size > self.max_message_size)
        {
            self.state = previous;
            return Self::size_exceeded();
        }

        let handler = self.begin_transaction();
        match handler.mail_from(path, params).await {
            Ok(()) => ok(1, 0, "Ok"),
            Err(reply) => {
                self.end_transaction().await;
                self.state = previous;
                reply
            }
        }
    }

    async fn rcpt_to(&mut self, path: &str, previous: State) -> Reply {
        let Some(handler) = self.transaction.as_mut() else {
            self.state = previous;
            return Reply::enhanced(
                Status::InvalidCommandSequence,
                EnhancedCode::new(5, 5, 1),
                "Error: need MAIL command",
            );
        };

        match handler.rcpt_to(path).await {
            Ok(()) => ok(1, 5, "Ok"),
            Err(reply) => {
                self.state = previous;
                reply
            }
        }
    }

    async fn data(&mut self) -> Result<Event, SessionError> {
        self.send(&Reply::new(
            Status::StartMailInput,
            "End data with <CR><LF>.<CR><LF>",
        ))
        .await?;

        let Some(content) = self.receive_data().await? else {
            return Ok(Event::ConnectionClose);
        };

        let reply = match content {
            Received::TooLarge => Self::size_exceeded(),
            Received::Content(data) => match self.transaction.as_mut() {
                Some(handler) => match handler.data(data.into()).await {
                    Ok(()) => ok(6, 0, "Message accepted"),
                    Err(reply) => reply,
                },
                None => internal_error_reply(),
            },
        };

        self.end_transaction().await;
        self.state = State::Greeted;
        self.send(&reply).await?;
        Ok(Event::ConnectionKeepAlive)
    }
}
