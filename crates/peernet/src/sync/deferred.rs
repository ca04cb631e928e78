//! Single-assignment future.

use std::sync::Arc;

use protocol::error::{ProtocolError, Result};
use tokio::sync::watch;

type Settled<T> = Option<std::result::Result<T, String>>;

/// A value settled exactly once by `resolve` or `reject`; any number of
/// tasks can `wait` for it. Later settlements are ignored.
pub struct Deferred<T> {
    slot: Arc<watch::Sender<Settled<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { slot: Arc::new(tx) }
    }

    /// Settles with a value. Returns false if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settles with an error. Returns false if already settled.
    pub fn reject(&self, reason: impl Into<String>) -> bool {
        self.settle(Err(reason.into()))
    }

    pub fn is_settled(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Waits for the settlement.
    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.slot.subscribe();
        let settled = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ProtocolError::Rejected("deferred dropped".to_string()))?;

        match &*settled {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(reason)) => Err(ProtocolError::Rejected(reason.clone())),
            None => Err(ProtocolError::Rejected("deferred unsettled".to_string())),
        }
    }

    fn settle(&self, outcome: std::result::Result<T, String>) -> bool {
        self.slot.send_if_modified(move |slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_then_wait() {
        let deferred = Deferred::new();
        assert!(deferred.resolve(42));
        assert_eq!(deferred.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_wait_before_resolve() {
        let deferred: Deferred<String> = Deferred::new();
        let waiter = {
            let deferred = deferred.clone();
            tokio::spawn(async move { deferred.wait().await })
        };

        tokio::task::yield_now().await;
        deferred.resolve("done".to_string());
        assert_eq!(waiter.await.unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let deferred = Deferred::new();
        assert!(deferred.reject("boom"));
        assert!(!deferred.resolve(1));
        assert!(!deferred.reject("again"));

        let err = deferred.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "rejected: boom");
        assert!(deferred.is_settled());
    }

    #[tokio::test]
    async fn test_many_waiters_see_same_value() {
        let deferred = Deferred::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let deferred = deferred.clone();
                tokio::spawn(async move { deferred.wait().await.unwrap() })
            })
            .collect();

        deferred.resolve(7u8);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), 7);
        }
    }
}
