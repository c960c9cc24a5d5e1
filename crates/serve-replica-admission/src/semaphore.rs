//! Counting semaphore with a dynamically read capacity.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Reads the current admission ceiling.
///
/// The capacity is consulted on every acquire and release, so changing the
/// value it returns takes effect without reconstructing the semaphore.
pub type CapacityFn = Arc<dyn Fn() -> usize + Send + Sync>;

struct Inner {
    holders: usize,
    waiters: VecDeque<oneshot::Sender<AdmissionPermit>>,
}

struct Shared {
    capacity: CapacityFn,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Poisoning can only occur if a holder panicked inside this module,
        // which contains no panicking code paths.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Hands freed slots to queued waiters in arrival order.
    fn wake_waiters(shared: &Arc<Shared>) {
        let mut inner = shared.lock();
        while inner.holders < (shared.capacity)() {
            let Some(waiter) = inner.waiters.pop_front() else {
                break;
            };
            inner.holders += 1;
            let permit = AdmissionPermit {
                shared: Arc::clone(shared),
                armed: true,
            };
            if let Err(mut unsent) = waiter.send(permit) {
                // The waiter gave up while queued. Reclaim the slot here
                // rather than through Drop, which would re-lock the mutex.
                unsent.armed = false;
                inner.holders -= 1;
            }
        }
    }

    fn release(shared: &Arc<Shared>) {
        {
            let mut inner = shared.lock();
            inner.holders -= 1;
        }
        Shared::wake_waiters(shared);
    }
}

/// A counting gate bounding the number of concurrently admitted requests.
///
/// The ceiling is read through a [`CapacityFn`] accessor so reconfiguration
/// can change it on the fly. Reducing the capacity below the current number
/// of holders is permitted: no holder is evicted, and new acquires block
/// until releases drain the surplus. Waiters are served in FIFO order.
#[derive(Clone)]
pub struct AdmissionSemaphore {
    shared: Arc<Shared>,
}

impl AdmissionSemaphore {
    /// Creates a semaphore whose capacity is read through `capacity`.
    pub fn new(capacity: CapacityFn) -> Self {
        Self {
            shared: Arc::new(Shared {
                capacity,
                inner: Mutex::new(Inner {
                    holders: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Creates a semaphore with a fixed capacity.
    pub fn with_fixed_capacity(capacity: usize) -> Self {
        Self::new(Arc::new(move || capacity))
    }

    /// Acquires a permit, suspending until one is available.
    ///
    /// Dropping the returned future while queued removes the waiter without
    /// consuming a slot.
    pub async fn acquire(&self) -> AdmissionPermit {
        let receiver = {
            let mut inner = self.shared.lock();
            if inner.waiters.is_empty() && inner.holders < (self.shared.capacity)() {
                inner.holders += 1;
                return AdmissionPermit {
                    shared: Arc::clone(&self.shared),
                    armed: true,
                };
            }
            let (sender, receiver) = oneshot::channel();
            inner.waiters.push_back(sender);
            receiver
        };

        match receiver.await {
            Ok(permit) => permit,
            // The sender half lives in the semaphore's waiter queue, which
            // cannot be dropped while `&self` is borrowed here.
            Err(_) => unreachable!("admission semaphore dropped with waiters queued"),
        }
    }

    /// Acquires a permit without suspending, or returns `None` if the
    /// semaphore is at capacity or has queued waiters.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        let mut inner = self.shared.lock();
        if inner.waiters.is_empty() && inner.holders < (self.shared.capacity)() {
            inner.holders += 1;
            Some(AdmissionPermit {
                shared: Arc::clone(&self.shared),
                armed: true,
            })
        } else {
            None
        }
    }

    /// True iff the number of outstanding holders has reached the current
    /// capacity.
    pub fn locked(&self) -> bool {
        let inner = self.shared.lock();
        inner.holders >= (self.shared.capacity)()
    }

    /// Number of permits currently held.
    pub fn num_holders(&self) -> usize {
        self.shared.lock().holders
    }

    /// Number of acquires currently queued.
    pub fn num_waiters(&self) -> usize {
        self.shared.lock().waiters.len()
    }

    /// Re-evaluates the capacity and admits queued waiters that now fit.
    ///
    /// Must be called after the value returned by the capacity accessor is
    /// raised; releases alone only wake waiters one slot at a time.
    pub fn notify_capacity_changed(&self) {
        Shared::wake_waiters(&self.shared);
    }
}

/// RAII permit for one admitted request. Releasing is dropping.
pub struct AdmissionPermit {
    shared: Arc<Shared>,
    armed: bool,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.armed {
            Shared::release(&self.shared);
        }
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn dynamic(capacity: Arc<AtomicUsize>) -> AdmissionSemaphore {
        AdmissionSemaphore::new(Arc::new(move || capacity.load(Ordering::SeqCst)))
    }

    #[tokio::test]
    async fn try_acquire_respects_capacity() {
        let semaphore = AdmissionSemaphore::with_fixed_capacity(2);
        let p1 = semaphore.try_acquire();
        let p2 = semaphore.try_acquire();
        assert!(p1.is_some());
        assert!(p2.is_some());
        assert!(semaphore.try_acquire().is_none());
        assert!(semaphore.locked());

        drop(p1);
        assert!(!semaphore.locked());
        assert!(semaphore.try_acquire().is_some());
        drop(p2);
    }

    #[tokio::test]
    async fn waiters_served_in_fifo_order() {
        let semaphore = AdmissionSemaphore::with_fixed_capacity(1);
        let first = semaphore.acquire().await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let semaphore = semaphore.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                order.lock().unwrap().push(i);
            }));
            // Give each waiter time to join the queue so arrival order is
            // deterministic.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn lowering_capacity_keeps_holders() {
        let capacity = Arc::new(AtomicUsize::new(2));
        let semaphore = dynamic(Arc::clone(&capacity));

        let p1 = semaphore.acquire().await;
        let p2 = semaphore.acquire().await;

        capacity.store(1, Ordering::SeqCst);
        assert_eq!(semaphore.num_holders(), 2);
        assert!(semaphore.locked());
        assert!(semaphore.try_acquire().is_none());

        // One release is not enough to get back under the new ceiling.
        drop(p1);
        assert!(semaphore.locked());
        assert!(semaphore.try_acquire().is_none());

        drop(p2);
        assert!(!semaphore.locked());
        let _p3 = semaphore.acquire().await;
        assert!(semaphore.locked());
    }

    #[tokio::test]
    async fn raising_capacity_admits_queued_waiters() {
        let capacity = Arc::new(AtomicUsize::new(1));
        let semaphore = dynamic(Arc::clone(&capacity));

        let _held = semaphore.acquire().await;
        let waiter = {
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(semaphore.num_waiters(), 1);

        capacity.store(2, Ordering::SeqCst);
        semaphore.notify_capacity_changed();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_slot() {
        let semaphore = AdmissionSemaphore::with_fixed_capacity(1);
        let held = semaphore.acquire().await;

        let waiter = {
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(held);
        // The abandoned waiter must not hold the freed slot.
        assert_eq!(semaphore.num_holders(), 0);
        assert!(semaphore.try_acquire().is_some());
    }

    #[tokio::test]
    async fn holders_never_exceed_capacity() {
        let semaphore = AdmissionSemaphore::with_fixed_capacity(3);
        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let semaphore = semaphore.clone();
            let current = Arc::clone(&current);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert_eq!(semaphore.num_holders(), 0);
    }
}
