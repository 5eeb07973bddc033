use async_trait::async_trait;
use chrono::Utc;
use mireka_common::{error::RejectError, internal, status::EnhancedCode};
use serde::Deserialize;

use crate::{
    error::FilterError,
    filter::{Filter, FilterSession},
    transaction::MailTransaction,
};

/// Rejects mail larger than a limit, independently of the SIZE announced by
/// the client.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RejectLargeMail {
    #[serde(default = "defaults::max_size")]
    pub max_size: usize,
}

/// Rejects mail that already passed through too many servers.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StopLoop {
    #[serde(default = "defaults::max_received_headers")]
    pub max_received_headers: usize,
}

mod defaults {
    pub const fn max_size() -> usize {
        25_000_000
    }

    pub const fn max_received_headers() -> usize {
        100
    }
}

impl Default for RejectLargeMail {
    fn default() -> Self {
        Self {
            max_size: defaults::max_size(),
        }
    }
}

impl Default for StopLoop {
    fn default() -> Self {
        Self {
            max_received_headers: defaults::max_received_headers(),
        }
    }
}

#[async_trait]
impl FilterSession for RejectLargeMail {
    async fn data(&mut self, tx: &mut MailTransaction) -> Result<(), FilterError> {
        let size = tx.data.as_ref().map_or(0, |data| data.len());
        if size > self.max_size {
            return Err(RejectError::new(552, EnhancedCode::new(5, 3, 4), "Message too large").into());
        }
        Ok(())
    }
}

impl Filter for RejectLargeMail {
    fn instance(&self) -> Box<dyn FilterSession> {
        Box::new(*self)
    }
}

#[async_trait]
impl FilterSession for StopLoop {
    async fn data(&mut self, tx: &mut MailTransaction) -> Result<(), FilterError> {
        let Some(data) = tx.data.as_ref() else {
            return Ok(());
        };

        let received = match mailparse::parse_headers(data) {
            Ok((headers, _)) => headers
                .iter()
                .filter(|header| header.get_key_ref().eq_ignore_ascii_case("Received"))
                .count(),
            Err(err) => {
                internal!(level = DEBUG, "Cannot count Received headers: {err}");
                return Err(RejectError::new(
                    554,
                    EnhancedCode::new(5, 6, 0),
                    "Invalid message content",
                )
                .into());
            }
        };

        if received > self.max_received_headers {
            internal!(
                level = INFO,
                "Mail {} has {received} Received headers, rejecting",
                tx.log_id
            );
            return Err(
                RejectError::new(554, EnhancedCode::new(5, 4, 6), "Routing loop detected").into(),
            );
        }
        Ok(())
    }
}

impl Filter for StopLoop {
    fn instance(&self) -> Box<dyn FilterSession> {
        Box::new(*self)
    }
}

/// Prepends the `Received:` trace field of this hop.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddReceivedHeader;

impl AddReceivedHeader {
    fn field(tx: &MailTransaction) -> String {
        format!(
            "Received: from {} (unknown [{}])\r\n\tby {} with ESMTP id {};\r\n\t{}",
            tx.session.helo.as_deref().unwrap_or("unknown"),
            tx.session.peer.ip(),
            tx.session.server_name,
            tx.log_id,
            Utc::now().to_rfc2822()
        )
    }
}

#[async_trait]
impl FilterSession for AddReceivedHeader {
    async fn data(&mut self, tx: &mut MailTransaction) -> Result<(), FilterError> {
        if let Some(data) = &tx.data {
            let field = Self::field(tx);
            tx.data = Some(data.with_prepended_header(&field));
        }
        Ok(())
    }
}

impl Filter for AddReceivedHeader {
    fn instance(&self) -> Box<dyn FilterSession> {
        Box::new(*self)
    }
}
