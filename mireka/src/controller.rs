use std::{future::Future, sync::Arc};

use mireka_common::{Signal, internal, logging, tracing};
use mireka_tracing::traced;
use mireka_transmission::MailExchangerResolver;
use tokio::{signal::unix, sync::broadcast};

use crate::{config::Config, context::Context};

/// The whole server: listeners for both protocols and the outbound queue.
pub struct Mireka {
    config: Config,
    resolver: Option<Arc<dyn MailExchangerResolver>>,
}

#[traced(instrument(level = tracing::Level::TRACE, skip_all))]
async fn shutdown(mut terminate: unix::Signal) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };
}

impl Mireka {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self {
            config,
            resolver: None,
        }
    }

    /// Look up mail exchangers with `resolver` instead of the DNS.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn MailExchangerResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Run until interrupted or terminated.
    ///
    /// # Errors
    /// If the configuration cannot be resolved, the log levels are invalid,
    /// a listener fails, or the signal handlers cannot be installed.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init(&self.config.logging)?;

        let terminate = unix::signal(unix::SignalKind::terminate())?;
        self.serve(shutdown(terminate)).await
    }

    /// Serve until `stop` completes.
    ///
    /// Listeners are stopped first, so no new mail enters the queue while
    /// it is being shut down. Once every session has finished, the queue
    /// gets its grace period for in-flight deliveries.
    ///
    /// # Errors
    /// If the configuration cannot be resolved, the queue directory cannot
    /// be read, or a listener fails.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn serve(self, stop: impl Future<Output = ()>) -> anyhow::Result<()> {
        let Self { mut config, resolver } = self;

        let context = Context::build(&config, resolver)?;
        context.init().await?;

        config.smtp.map_args(|args| context.smtp_args(args));
        config.pop3.map_args(|args| context.pop3_args(args));
        config.smtp.init()?;
        config.pop3.init()?;

        internal!("Controller running");

        let (listener_signal, _) = broadcast::channel(64);
        let (queue_signal, _) = broadcast::channel(4);

        let queue = context
            .queue
            .as_ref()
            .map(|queue| tokio::spawn(Arc::clone(queue).serve(queue_signal.subscribe())));

        let smtp = config.smtp;
        let pop3 = config.pop3;
        let listeners = async {
            tokio::try_join!(
                smtp.control(listener_signal.subscribe()),
                pop3.control(listener_signal.subscribe())
            )
        };
        tokio::pin!(listeners, stop);

        let result = tokio::select! {
            result = &mut listeners => {
                // Listeners only return on their own when they fail, or when
                // none are configured.
                if result.is_ok() {
                    stop.await;
                }
                result
            }
            () = &mut stop => {
                internal!(level = INFO, "Stopping listeners ...");
                let _ = listener_signal.send(Signal::Shutdown);
                listeners.await
            }
        };

        if let Some(queue) = queue {
            internal!(level = INFO, "Stopping queue ...");
            let _ = queue_signal.send(Signal::Shutdown);
            if let Err(err) = queue.await {
                internal!(level = ERROR, "Queue task failed: {err}");
            }
        }

        internal!(level = INFO, "Shutting down...");

        result.map(|((), ())| ()).map_err(Into::into)
    }
}
