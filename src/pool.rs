//! Connection Pool (§4.M): a fixed-size array of identically-configured
//! facades, scheduled round-robin. Mirrors the teacher's `client_pool`
//! worker-pool shape — connect-all-or-fail up front, then hand out the next
//! client with an atomically-advanced index rather than a lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::try_join_all;

use crate::client::RouterClient;
use crate::config::Config;
use crate::error::Result;

/// A round-robin pool of `size` facades, all connected from the same
/// [`Config`].
pub struct ConnectionPool {
    clients: Vec<RouterClient>,
    next: AtomicUsize,
}

impl ConnectionPool {
    /// Connect every client concurrently; the whole pool fails if any one
    /// connection does (§4.M "requires all to succeed").
    pub async fn connect(config: Config, size: usize) -> Result<Self> {
        let connects = (0..size).map(|_| RouterClient::connect(config.clone()));
        let clients = try_join_all(connects).await?;
        Ok(Self { clients, next: AtomicUsize::new(0) })
    }

    /// The next facade in round-robin order, advancing the shared cursor
    /// atomically so concurrent callers see fair rotation under contention.
    pub fn scheduled_client(&self) -> &RouterClient {
        let len = self.clients.len();
        let i = self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some((n + 1) % len))
            .expect("update closure always returns Some");
        &self.clients[i]
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clients(&self) -> &[RouterClient] {
        &self.clients
    }

    pub async fn close_all(&self) {
        for client in &self.clients {
            client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    fn test_pool(size: usize) -> ConnectionPool {
        let clients = (0..size).map(|_| crate::client::test_client(Protocol::Rest)).collect();
        ConnectionPool { clients, next: AtomicUsize::new(0) }
    }

    #[test]
    fn scheduled_client_rotates_through_every_client_before_repeating() {
        let pool = test_pool(3);
        let seen: Vec<usize> = (0..6)
            .map(|_| {
                let scheduled = pool.scheduled_client();
                pool.clients.iter().position(|c| std::ptr::eq(c, scheduled)).unwrap()
            })
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn empty_pool_reports_empty() {
        let pool = test_pool(0);
        assert!(pool.is_empty());
    }
}
