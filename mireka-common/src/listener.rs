use std::{collections::HashMap, net::SocketAddr};

use futures_util::future::join_all;
use mireka_tracing::traced;
use serde::Deserialize;
use tokio::{net::TcpListener, sync::broadcast::Receiver};

use crate::{
    Signal,
    error::ListenerError,
    internal,
    traits::protocol::{Protocol, SessionHandler},
};

#[derive(Deserialize)]
pub struct Listener<Proto: Protocol> {
    #[serde(skip)]
    handler: Proto,
    socket: SocketAddr,
    #[serde(default, flatten)]
    args: Proto::Args,
    #[serde(default)]
    context: HashMap<String, String>,
}

impl<Proto: Protocol> Listener<Proto> {
    #[must_use]
    pub fn new(socket: SocketAddr, args: Proto::Args) -> Self {
        Self {
            handler: Proto::default(),
            socket,
            args,
            context: HashMap::default(),
        }
    }

    pub fn map_args<F>(&mut self, f: F)
    where
        F: FnOnce(Proto::Args) -> Proto::Args,
    {
        self.args = f(std::mem::take(&mut self.args));
    }

    #[must_use]
    pub const fn socket(&self) -> SocketAddr {
        self.socket
    }

    #[traced(instrument(skip(self)), timing(precision = "ns"))]
    pub fn init(&self) -> Result<(), ListenerError> {
        Ok(self.handler.validate(&self.args)?)
    }

    /// Binds the socket. Split from [`Self::serve`] so callers can learn the
    /// bound port before accepting connections.
    pub async fn bind(&self) -> Result<TcpListener, ListenerError> {
        TcpListener::bind(self.socket)
            .await
            .map_err(|source| ListenerError::BindFailed {
                address: self.socket.to_string(),
                source,
            })
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip(self, shutdown)), timing(precision = "s"))]
    pub async fn serve(&self, shutdown: Receiver<Signal>) -> Result<(), ListenerError> {
        let listener = self.bind().await?;
        self.serve_on(listener, shutdown).await
    }

    pub async fn serve_on(
        &self,
        listener: TcpListener,
        mut shutdown: Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        internal!(
            level = INFO,
            "{} listening on {:?}",
            Proto::ty(),
            listener.local_addr().unwrap_or(self.socket)
        );

        let mut sessions = Vec::default();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    internal!(level = INFO, "{} listener {} shutting down, finishing sessions ...", Proto::ty(), self.socket);
                    join_all(sessions).await;
                    return Ok(());
                }

                connection = listener.accept() => {
                    let (stream, peer) = connection?;
                    tracing::debug!("{} connection from {peer} on {}", Proto::ty(), self.socket);

                    let session = self.handler.handle(stream, peer, self.context.clone(), self.args.clone());
                    let signal = shutdown.resubscribe();

                    sessions.retain(|handle: &tokio::task::JoinHandle<()>| !handle.is_finished());
                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = session.run(signal).await {
                            if err.is_client_error() {
                                internal!(level = DEBUG, "Session with {peer} ended: {err}");
                            } else if !err.is_shutdown() {
                                internal!(level = ERROR, "Session with {peer} failed: {err}");
                            }
                        }
                    }));
                }
            }
        }
    }
}
