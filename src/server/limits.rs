//! Connection limits
//!
//! A global cap and a per-address cap, checked when a connection is accepted.
//! The slot is held by a [`ConnectionPermit`] and released when the session
//! drops it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::LimitError;

type AddressCounts = Arc<Mutex<HashMap<IpAddr, usize>>>;

#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    total: Arc<Semaphore>,
    max_total: usize,
    per_ip: AddressCounts,
    max_per_ip: usize,
}

/// One occupied connection slot.
#[derive(Debug)]
pub struct ConnectionPermit {
    _total: OwnedSemaphorePermit,
    ip: IpAddr,
    per_ip: AddressCounts,
}

impl ConnectionLimits {
    pub fn new(max_total: usize, max_per_ip: usize) -> Self {
        Self {
            total: Arc::new(Semaphore::new(max_total)),
            max_total,
            per_ip: Arc::new(Mutex::new(HashMap::new())),
            max_per_ip,
        }
    }

    /// Claim a slot for a connection from `ip`, or say why there is none.
    pub fn try_acquire(&self, ip: IpAddr) -> Result<ConnectionPermit, LimitError> {
        let total = Arc::clone(&self.total)
            .try_acquire_owned()
            .map_err(|_| LimitError::TooManyConnections(self.max_total))?;

        let mut counts = lock(&self.per_ip);
        let count = counts.entry(ip).or_insert(0);
        if *count >= self.max_per_ip {
            return Err(LimitError::TooManyFromAddress(ip, self.max_per_ip));
        }
        *count += 1;

        Ok(ConnectionPermit {
            _total: total,
            ip,
            per_ip: Arc::clone(&self.per_ip),
        })
    }

    /// Open sessions from `ip`
    pub fn active_from(&self, ip: IpAddr) -> usize {
        lock(&self.per_ip).get(&ip).copied().unwrap_or(0)
    }

    pub fn active(&self) -> usize {
        self.max_total - self.total.available_permits()
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let mut counts = lock(&self.per_ip);
        if let Some(count) = counts.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.ip);
            }
        }
    }
}

// The map only holds counters, so a poisoned lock still has usable data.
fn lock(counts: &AddressCounts) -> MutexGuard<'_, HashMap<IpAddr, usize>> {
    counts.lock().unwrap_or_else(PoisonError::into_inner)
}
