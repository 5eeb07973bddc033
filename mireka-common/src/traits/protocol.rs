use std::{collections::HashMap, fmt::Debug, net::SocketAddr};

use serde::Deserialize;
use tokio::{net::TcpStream, sync::broadcast::Receiver};

use crate::{
    Signal,
    error::{ProtocolError, SessionError},
};

pub trait SessionHandler {
    fn run(
        self,
        signal: Receiver<Signal>,
    ) -> impl std::future::Future<Output = Result<(), SessionError>> + Send;
}

/// A line protocol served by a [`Listener`](crate::listener::Listener).
pub trait Protocol: Default + Send + Sync {
    type Session: SessionHandler + Send + 'static;
    /// Per-listener arguments. Runtime collaborators that cannot be read from
    /// configuration are injected with `Controller::map_args`.
    type Args: Default + Clone + Debug + Send + Sync + for<'a> Deserialize<'a>;

    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        context: HashMap<String, String>,
        args: Self::Args,
    ) -> Self::Session;

    ///
    /// Validate the arguments being provided to the protocol
    ///
    /// # Errors
    /// If a required collaborator is missing or a value is out of range
    ///
    fn validate(&self, args: &Self::Args) -> Result<(), ProtocolError>;

    fn ty() -> &'static str;
}
