//! Property tests for the admission semaphore.
//!
//! Invariants tested:
//! - Concurrent holders never exceed the configured capacity
//! - All acquisitions eventually complete (no deadlocks)
//! - Every permit is returned: holders drain to zero

use proptest::prelude::*;
use serve_replica_admission::AdmissionSemaphore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn holders_never_exceed_capacity(
        capacity in 1usize..8,
        tasks in 1usize..32,
        work_ms in 0u64..5,
    ) {
        let rt = Runtime::new().expect("runtime");
        rt.block_on(async move {
            let semaphore = AdmissionSemaphore::with_fixed_capacity(capacity);
            let current = Arc::new(AtomicUsize::new(0));
            let max_seen = Arc::new(AtomicUsize::new(0));

            let mut handles = Vec::new();
            for _ in 0..tasks {
                let semaphore = semaphore.clone();
                let current = Arc::clone(&current);
                let max_seen = Arc::clone(&max_seen);
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await;
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(work_ms)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                }));
            }
            for handle in handles {
                handle.await.expect("task completes");
            }

            assert!(max_seen.load(Ordering::SeqCst) <= capacity);
            assert_eq!(current.load(Ordering::SeqCst), 0);
            assert_eq!(semaphore.num_holders(), 0);
            assert!(!semaphore.locked() || capacity == 0);
        });
    }

    #[test]
    fn capacity_changes_preserve_accounting(
        initial in 1usize..6,
        updated in 1usize..6,
        tasks in 1usize..24,
    ) {
        let rt = Runtime::new().expect("runtime");
        rt.block_on(async move {
            let capacity = Arc::new(AtomicUsize::new(initial));
            let accessor = Arc::clone(&capacity);
            let semaphore =
                AdmissionSemaphore::new(Arc::new(move || accessor.load(Ordering::SeqCst)));

            let mut handles = Vec::new();
            for i in 0..tasks {
                let semaphore = semaphore.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await;
                    tokio::time::sleep(Duration::from_millis(1 + (i % 3) as u64)).await;
                }));
            }

            // Change the ceiling while acquisitions are racing.
            tokio::time::sleep(Duration::from_millis(2)).await;
            capacity.store(updated, Ordering::SeqCst);
            semaphore.notify_capacity_changed();

            for handle in handles {
                handle.await.expect("task completes");
            }
            assert_eq!(semaphore.num_holders(), 0);
            assert_eq!(semaphore.num_waiters(), 0);
        });
    }
}
