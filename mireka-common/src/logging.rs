//! Log events and the subscriber printing them.
//!
//! Every event carries a `direction`: `incoming` and `outgoing` for protocol
//! traffic, `internal` for everything else. Which events are printed is
//! decided per crate from the `logging` section of the configuration.

use std::{collections::BTreeMap, str::FromStr};

use serde::Deserialize;
use thiserror::Error;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::Targets, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Target prefix shared by every crate of the project.
const PROJECT_TARGET: &str = "mireka";

/// Environment variable overriding the configured project level.
pub const LEVEL_VARIABLE: &str = "LOG_LEVEL";

#[doc(hidden)]
#[macro_export]
macro_rules! directed {
    ($direction:literal, $level:ident, $($msg:tt)+) => {
        $crate::tracing::event!(
            $crate::tracing::Level::$level,
            direction = $direction,
            $($msg)+
        )
    };
}

/// Something sent to a peer.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)+) => {
        $crate::directed!("outgoing", $level, $($msg)+)
    };
    ($($msg:tt)+) => {
        $crate::directed!("outgoing", TRACE, $($msg)+)
    };
}

/// Something received from a peer.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:tt)+) => {
        $crate::directed!("incoming", $level, $($msg)+)
    };
    ($($msg:tt)+) => {
        $crate::directed!("incoming", TRACE, $($msg)+)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)+) => {
        $crate::directed!("internal", $level, $($msg)+)
    };
    ($($msg:tt)+) => {
        $crate::directed!("internal", TRACE, $($msg)+)
    };
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log level {level:?} for {target}")]
    Level { target: String, level: String },

    #[error("A global subscriber is already installed: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// ```ron
/// logging: (
///     level: Some("info"),
///     targets: { "mireka_smtp": "trace", "mireka_transmission::dns": "warn" },
/// ),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Level of every crate of the project. Defaults to `debug` in debug
    /// builds and `info` otherwise.
    #[serde(default)]
    pub level: Option<String>,

    /// Levels by target prefix, more specific than `level`.
    #[serde(default)]
    pub targets: BTreeMap<String, String>,

    #[serde(default = "defaults::ansi")]
    pub ansi: bool,
}

mod defaults {
    pub const fn ansi() -> bool {
        true
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            targets: BTreeMap::new(),
            ansi: defaults::ansi(),
        }
    }
}

fn parse_level(target: &str, level: &str) -> Result<LevelFilter, LoggingError> {
    LevelFilter::from_str(level).map_err(|_| LoggingError::Level {
        target: target.to_string(),
        level: level.to_string(),
    })
}

impl LoggingConfig {
    /// The events printed: this project's crates at `level`, unless
    /// `override_level` is given, refined by `targets`. Nothing from other
    /// crates is printed.
    pub fn filter(&self, override_level: Option<&str>) -> Result<Targets, LoggingError> {
        let project = match override_level.or(self.level.as_deref()) {
            Some(level) => parse_level(PROJECT_TARGET, level)?,
            None if cfg!(debug_assertions) => LevelFilter::DEBUG,
            None => LevelFilter::INFO,
        };

        self.targets.iter().try_fold(
            Targets::new().with_target(PROJECT_TARGET, project),
            |filter, (target, level)| Ok(filter.with_target(target, parse_level(target, level)?)),
        )
    }
}

/// Installs the global subscriber for `config`. `LOG_LEVEL` replaces the
/// configured project level.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let level = std::env::var(LEVEL_VARIABLE).ok();
    let filter = config.filter(level.as_deref())?;

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(false)
                .with_line_number(false)
                .with_ansi(config.ansi)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(filter),
        )
        .try_init()?;
    Ok(())
}
