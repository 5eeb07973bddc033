use std::io;

use mireka_common::{
    error::{
        ConfigurationError, LocalMailSystemError, RejectError, configuration_reply,
        internal_error_reply,
    },
    internal,
    status::Reply,
};
use thiserror::Error;

/// Everything a filter stage or destination may fail with.
#[derive(Debug, Error)]
pub enum FilterError {
    /// A deliberate refusal, shown to the client as is.
    #[error(transparent)]
    Reject(#[from] RejectError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Local(#[from] LocalMailSystemError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FilterError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        match self {
            Self::Reject(reject) => reject.is_temporary(),
            Self::Local(local) => local.is_temporary(),
            Self::Configuration(_) | Self::Io(_) => false,
        }
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        match self {
            Self::Reject(reject) => reject.status.is_permanent(),
            Self::Local(local) => local.is_permanent(),
            Self::Configuration(_) | Self::Io(_) => true,
        }
    }

    /// The reply the SMTP client receives for this failure.
    ///
    /// Anything that is not a deliberate rejection is logged here, as the
    /// client only gets a generic text.
    #[must_use]
    pub fn reply(&self) -> Reply {
        match self {
            Self::Reject(reject) => reject.reply(),
            Self::Configuration(err) => {
                internal!(level = ERROR, "{err}");
                configuration_reply()
            }
            Self::Local(err) => {
                internal!(level = ERROR, "Local mail system failure: {err}");
                err.reply()
            }
            Self::Io(err) => {
                internal!(level = ERROR, "Unexpected I/O failure: {err}");
                internal_error_reply()
            }
        }
    }
}
