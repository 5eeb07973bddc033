//! Limits the number of simultaneous connections to a single host.

use std::{net::IpAddr, sync::Arc, time::Duration};

use dashmap::DashMap;
use mireka_common::{
    internal,
    status::{EnhancedCode, EnhancedStatus},
};
use rand::Rng;

use crate::error::{Failure, RemoteMta, SendError};

#[derive(Debug)]
pub struct OutgoingConnections {
    /// `0` means no limit.
    max_per_host: usize,
    open: DashMap<IpAddr, usize>,
}

/// An open slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct ConnectionPermit {
    registry: Arc<OutgoingConnections>,
    address: IpAddr,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.registry.release(self.address);
    }
}

impl OutgoingConnections {
    #[must_use]
    pub fn new(max_per_host: usize) -> Self {
        Self {
            max_per_host,
            open: DashMap::new(),
        }
    }

    /// Open connections to `address`.
    #[must_use]
    pub fn count(&self, address: IpAddr) -> usize {
        self.open.get(&address).map_or(0, |count| *count)
    }

    /// Takes a slot for a connection to `remote_mta`.
    ///
    /// # Errors
    /// A postponement when the host already has as many connections as
    /// allowed.
    pub fn open(
        self: &Arc<Self>,
        remote_mta: &RemoteMta,
        address: IpAddr,
    ) -> Result<ConnectionPermit, SendError> {
        let mut count = self.open.entry(address).or_insert(0);
        if self.max_per_host != 0 && *count >= self.max_per_host {
            drop(count);
            let delay = Duration::from_secs(5 + rand::rng().random_range(0..=10));
            internal!(
                level = DEBUG,
                "Connection limit of {} reached for {remote_mta}, postponing by {delay:?}",
                self.max_per_host
            );
            let failure = Failure::new(EnhancedStatus::new(
                451,
                EnhancedCode::new(4, 4, 5),
                "Too many connections to the destination system",
            ))
            .with_remote_mta(remote_mta.clone());
            return Err(SendError::Postpone { failure, delay });
        }

        *count += 1;
        Ok(ConnectionPermit {
            registry: Arc::clone(self),
            address,
        })
    }

    fn release(&self, address: IpAddr) {
        let balanced = match self.open.get_mut(&address) {
            Some(mut count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        };
        self.open.remove_if(&address, |_, count| *count == 0);

        if !balanced {
            internal!(
                level = ERROR,
                "Released a connection to {address} which was never opened, connection accounting is broken"
            );
        }
        debug_assert!(balanced, "released a connection to {address} which was never opened");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mta() -> RemoteMta {
        RemoteMta::new("mx.example.com", Some("192.0.2.1".parse().unwrap()))
    }

    #[test]
    fn slots_are_limited_and_released() {
        let registry = Arc::new(OutgoingConnections::new(2));
        let address = "192.0.2.1".parse().unwrap();

        let first = registry.open(&mta(), address).unwrap();
        let second = registry.open(&mta(), address).unwrap();
        assert_eq!(registry.count(address), 2);

        let err = registry.open(&mta(), address).unwrap_err();
        let SendError::Postpone { failure, delay } = err else {
            panic!("expected a postponement, got {err:?}");
        };
        assert_eq!(failure.status.to_string(), "451 4.4.5 Too many connections to the destination system");
        assert!((5..=15).contains(&delay.as_secs()));
        assert_eq!(failure.remote_mta, Some(mta()));

        drop(first);
        assert_eq!(registry.count(address), 1);
        let third = registry.open(&mta(), address).unwrap();
        drop(second);
        drop(third);
        assert_eq!(registry.count(address), 0);
    }

    #[test]
    fn hosts_are_counted_separately() {
        let registry = Arc::new(OutgoingConnections::new(1));
        let _a = registry.open(&mta(), "192.0.2.1".parse().unwrap()).unwrap();
        let _b = registry.open(&mta(), "192.0.2.2".parse().unwrap()).unwrap();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "never opened")]
    fn unbalanced_release_panics_in_debug() {
        let registry = Arc::new(OutgoingConnections::new(1));
        let address = "192.0.2.1".parse().unwrap();
        drop(registry.open(&mta(), address).unwrap());
        registry.release(address);
    }

    #[test]
    fn zero_means_unlimited() {
        let registry = Arc::new(OutgoingConnections::new(0));
        let address = "192.0.2.1".parse().unwrap();
        let permits: Vec<_> = (0..50).map(|_| registry.open(&mta(), address).unwrap()).collect();
        assert_eq!(registry.count(address), 50);
        drop(permits);
        assert_eq!(registry.count(address), 0);
    }
}
