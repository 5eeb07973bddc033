use futures_util::future::join_all;
use mireka_tracing::traced;
use serde::Deserialize;
use tokio::sync::broadcast::Receiver;

use crate::{Signal, error::ListenerError, internal, listener::Listener, traits::Protocol};

/// All listeners of one protocol.
#[derive(Default, Deserialize)]
#[serde(transparent)]
pub struct Controller<Proto: Protocol> {
    listeners: Vec<Listener<Proto>>,
}

impl<Proto: Protocol> Controller<Proto> {
    #[must_use]
    pub const fn new(listeners: Vec<Listener<Proto>>) -> Self {
        Self { listeners }
    }

    /// Map over the args of all listeners, allowing modification before initialization
    ///
    /// This is how shared runtime collaborators, which cannot be deserialized,
    /// reach the sessions.
    pub fn map_args<F>(&mut self, f: F)
    where
        F: Fn(Proto::Args) -> Proto::Args,
    {
        for listener in &mut self.listeners {
            listener.map_args(&f);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    ///
    /// Initialise this controller
    ///
    /// # Errors
    /// If any listener's arguments are invalid
    ///
    pub fn init(&self) -> Result<(), ListenerError> {
        internal!("Initialising Controller for {}", Proto::ty());

        self.listeners.iter().try_for_each(Listener::init)
    }

    ///
    /// # Errors
    /// If any of the listeners have a failure
    ///
    #[traced(instrument(level = tracing::Level::TRACE, skip(self, signal)), timing(precision = "s"))]
    pub async fn control(self, signal: Receiver<Signal>) -> Result<(), ListenerError> {
        join_all(
            self.listeners
                .iter()
                .map(|listener| listener.serve(signal.resubscribe())),
        )
        .await
        .into_iter()
        .collect()
    }
}
