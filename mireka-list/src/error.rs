use thiserror::Error;

#[derive(Debug, Error)]
pub enum ListError {
    #[error("List address {0} is not a mailbox")]
    Address(String),

    #[error("Invalid non-member subject pattern {pattern:?}: {source}")]
    Pattern { pattern: String, source: regex::Error },

    #[error("Invalid reverse path for list {list}: {reason}")]
    ReversePath { list: String, reason: String },
}
