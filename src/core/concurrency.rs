//! Concurrency admission control
//!
//! Two independent counting semaphores: one bounds how many items download at
//! once, the other bounds how many sub-items download at once across all
//! items. Permits are RAII guards, so a permit is released exactly once when it
//! is dropped or passed to `release`.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OwnedSemaphorePermit, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::models::{AppError, AppResult};

/// Counting semaphore with a fixed capacity
#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Arc<tokio::sync::Semaphore>,
    capacity: usize,
}

/// A granted unit of capacity; released on drop
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl Permit {
    pub fn release(self) {}
}

impl Semaphore {
    /// A size of zero is raised to one
    pub fn new(size: usize) -> Self {
        let capacity = size.max(1);
        Self {
            inner: Arc::new(tokio::sync::Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a permit, giving up with `AppError::Cancelled` once `token` fires
    pub async fn acquire(&self, token: &CancellationToken) -> AppResult<Permit> {
        if token.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(AppError::Cancelled),
            permit = Arc::clone(&self.inner).acquire_owned() => permit
                .map(|p| Permit { _permit: p })
                .map_err(|_| AppError::Cancelled),
        }
    }

    pub fn try_acquire(&self) -> Option<Permit> {
        match Arc::clone(&self.inner).try_acquire_owned() {
            Ok(permit) => Some(Permit { _permit: permit }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    pub fn used(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Utilisation of both admission tiers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyStats {
    pub item_used: usize,
    pub item_available: usize,
    pub item_total: usize,
    pub sub_item_used: usize,
    pub sub_item_available: usize,
    pub sub_item_total: usize,
}

#[derive(Debug)]
struct Limits {
    item: Semaphore,
    sub_item: Semaphore,
}

/// Admission controller for item and sub-item downloads
#[derive(Debug)]
pub struct ConcurrencyController {
    limits: RwLock<Limits>,
    /// item id -> number of in-flight sub-item units
    item_trackers: DashMap<u64, watch::Sender<usize>>,
}

impl ConcurrencyController {
    pub fn new(max_items: usize, max_sub_items: usize) -> Self {
        Self {
            limits: RwLock::new(Limits {
                item: Semaphore::new(max_items),
                sub_item: Semaphore::new(max_sub_items),
            }),
            item_trackers: DashMap::new(),
        }
    }

    fn item_semaphore(&self) -> Semaphore {
        self.limits.read().item.clone()
    }

    fn sub_item_semaphore(&self) -> Semaphore {
        self.limits.read().sub_item.clone()
    }

    pub async fn acquire_item(&self, token: &CancellationToken) -> AppResult<Permit> {
        self.item_semaphore().acquire(token).await
    }

    pub async fn acquire_sub_item(&self, token: &CancellationToken) -> AppResult<Permit> {
        self.sub_item_semaphore().acquire(token).await
    }

    pub fn try_acquire_item(&self) -> Option<Permit> {
        self.limits.read().item.try_acquire()
    }

    pub fn try_acquire_sub_item(&self) -> Option<Permit> {
        self.limits.read().sub_item.try_acquire()
    }

    pub fn release_item(&self, permit: Permit) {
        permit.release();
    }

    pub fn release_sub_item(&self, permit: Permit) {
        permit.release();
    }

    /// Advisory only: the answer may be stale by the time it is acted on
    pub fn can_start_item(&self) -> bool {
        self.limits.read().item.available() > 0
    }

    /// Advisory only: the answer may be stale by the time it is acted on
    pub fn can_start_sub_item(&self) -> bool {
        self.limits.read().sub_item.available() > 0
    }

    pub fn stats(&self) -> ConcurrencyStats {
        let limits = self.limits.read();
        ConcurrencyStats {
            item_used: limits.item.used(),
            item_available: limits.item.available(),
            item_total: limits.item.capacity(),
            sub_item_used: limits.sub_item.used(),
            sub_item_available: limits.sub_item.available(),
            sub_item_total: limits.sub_item.capacity(),
        }
    }

    /// Replace both semaphores with fresh ones of the given sizes.
    ///
    /// Permits granted by the old semaphores stay valid and return to the old
    /// semaphore when dropped; the new ones start with full capacity. Until
    /// those old permits drain, the effective ceiling is old usage plus the
    /// new limit.
    pub fn update_limits(&self, max_items: usize, max_sub_items: usize) {
        let mut limits = self.limits.write();
        let outstanding = limits.item.used() + limits.sub_item.used();
        *limits = Limits {
            item: Semaphore::new(max_items),
            sub_item: Semaphore::new(max_sub_items),
        };
        info!(
            max_items = limits.item.capacity(),
            max_sub_items = limits.sub_item.capacity(),
            outstanding,
            "Concurrency limits replaced"
        );
    }

    /// Register one in-flight unit of work for `item_id`
    pub fn track_item(&self, item_id: u64) {
        self.item_trackers
            .entry(item_id)
            .and_modify(|tx| {
                tx.send_modify(|count| *count += 1);
            })
            .or_insert_with(|| watch::channel(1).0);
    }

    /// Finish one unit of work registered with `track_item`
    pub fn untrack_item(&self, item_id: u64) {
        if let Some(tx) = self.item_trackers.get(&item_id) {
            tx.send_modify(|count| *count = count.saturating_sub(1));
        }
        self.item_trackers
            .remove_if(&item_id, |_, tx| *tx.borrow() == 0);
    }

    /// Wait until every unit tracked for `item_id` has finished. Returns
    /// immediately if nothing is tracked.
    pub async fn wait_item(&self, item_id: u64) {
        let mut rx = match self.item_trackers.get(&item_id) {
            Some(tx) => tx.subscribe(),
            None => return,
        };
        // A closed channel means the entry was dropped at zero
        let _ = rx.wait_for(|count| *count == 0).await;
        self.item_trackers
            .remove_if(&item_id, |_, tx| *tx.borrow() == 0);
        debug!(item_id, "All tracked work for item finished");
    }

    pub fn is_item_processing(&self, item_id: u64) -> bool {
        self.item_trackers.contains_key(&item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_semaphore_accounting() {
        let sem = Semaphore::new(2);
        let token = CancellationToken::new();
        assert_eq!(sem.available(), 2);

        let a = sem.acquire(&token).await.unwrap();
        assert_eq!(sem.available(), 1);
        let b = sem.acquire(&token).await.unwrap();
        assert_eq!(sem.available(), 0);
        assert_eq!(sem.used(), 2);

        assert!(sem.try_acquire().is_none());

        a.release();
        assert_eq!(sem.available(), 1);
        let c = sem.try_acquire();
        assert!(c.is_some());

        drop(b);
        drop(c);
        assert_eq!(sem.used(), 0);
    }

    #[test]
    fn test_zero_size_raised_to_one() {
        let sem = Semaphore::new(0);
        assert_eq!(sem.capacity(), 1);
    }

    #[tokio::test]
    async fn test_acquire_cancelled_by_token() {
        let sem = Semaphore::new(1);
        let holder = sem.try_acquire().unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = timeout(Duration::from_secs(2), sem.acquire(&token))
            .await
            .expect("acquire must return once the token fires");
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert_eq!(sem.used(), 1);
        drop(holder);
    }

    #[test]
    fn test_acquire_pends_until_release() {
        let sem = Semaphore::new(1);
        let token = CancellationToken::new();
        let held = sem.try_acquire().unwrap();

        let mut waiter = tokio_test::task::spawn(sem.acquire(&token));
        tokio_test::assert_pending!(waiter.poll());

        held.release();
        assert!(waiter.is_woken());
        let permit = tokio_test::assert_ready_ok!(waiter.poll());
        assert_eq!(sem.used(), 1);
        permit.release();
        assert_eq!(sem.used(), 0);
    }

    #[tokio::test]
    async fn test_acquire_with_already_cancelled_token() {
        let sem = Semaphore::new(1);
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(sem.acquire(&token).await, Err(AppError::Cancelled)));
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn test_controller_tiers_are_independent() {
        let cc = ConcurrencyController::new(2, 4);
        let token = CancellationToken::new();
        assert!(cc.can_start_item());
        assert!(cc.can_start_sub_item());

        let a = cc.acquire_item(&token).await.unwrap();
        let b = cc.acquire_item(&token).await.unwrap();
        assert!(!cc.can_start_item());
        assert!(cc.can_start_sub_item());

        let stats = cc.stats();
        assert_eq!(stats.item_used, 2);
        assert_eq!(stats.item_available, 0);
        assert_eq!(stats.item_total, 2);
        assert_eq!(stats.sub_item_total, 4);

        cc.release_item(a);
        assert!(cc.can_start_item());
        cc.release_item(b);
    }

    #[tokio::test]
    async fn test_used_never_exceeds_capacity() {
        let cc = Arc::new(ConcurrencyController::new(3, 3));
        let token = CancellationToken::new();
        let mut handles = Vec::new();
        for _ in 0..20 {
            let cc = Arc::clone(&cc);
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                let permit = cc.acquire_item(&token).await.unwrap();
                let stats = cc.stats();
                assert!(stats.item_used <= stats.item_total);
                sleep(Duration::from_millis(5)).await;
                cc.release_item(permit);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cc.stats().item_used, 0);
    }

    #[tokio::test]
    async fn test_update_limits_replaces_semaphores() {
        let cc = ConcurrencyController::new(1, 1);
        let old = cc.try_acquire_item().unwrap();
        assert!(!cc.can_start_item());

        cc.update_limits(3, 5);
        let stats = cc.stats();
        assert_eq!(stats.item_total, 3);
        assert_eq!(stats.item_available, 3);
        assert_eq!(stats.sub_item_total, 5);

        // Releasing a permit from the old semaphore leaves the new one untouched
        cc.release_item(old);
        assert_eq!(cc.stats().item_available, 3);
    }

    #[tokio::test]
    async fn test_item_join_waits_for_all_tracked_work() {
        let cc = Arc::new(ConcurrencyController::new(1, 2));
        cc.track_item(7);
        cc.track_item(7);
        assert!(cc.is_item_processing(7));

        let waiter = {
            let cc = Arc::clone(&cc);
            tokio::spawn(async move { cc.wait_item(7).await })
        };

        cc.untrack_item(7);
        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        cc.untrack_item(7);
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter finishes")
            .unwrap();
        assert!(!cc.is_item_processing(7));
    }

    #[tokio::test]
    async fn test_wait_untracked_item_returns_immediately() {
        let cc = ConcurrencyController::new(1, 1);
        timeout(Duration::from_millis(100), cc.wait_item(42))
            .await
            .expect("no tracked work");
        cc.untrack_item(42);
        assert!(!cc.is_item_processing(42));
    }
}
