//! Admission gate for the replica execution core.
//!
//! Each in-flight request holds one permit from an [`AdmissionSemaphore`].
//! The semaphore's ceiling is read through an accessor on every operation, so
//! a reconfigure can change `max_ongoing_requests` without reconstructing the
//! primitive or disturbing requests already admitted.
//!
//! # Example
//!
//! ```rust
//! use serve_replica_admission::AdmissionSemaphore;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! # async fn example() {
//! let ceiling = Arc::new(AtomicUsize::new(8));
//! let accessor = Arc::clone(&ceiling);
//! let semaphore = AdmissionSemaphore::new(Arc::new(move || accessor.load(Ordering::SeqCst)));
//!
//! let permit = semaphore.acquire().await;
//! assert_eq!(semaphore.num_holders(), 1);
//!
//! // Raising the ceiling takes effect immediately.
//! ceiling.store(16, Ordering::SeqCst);
//! semaphore.notify_capacity_changed();
//!
//! drop(permit);
//! # }
//! ```

pub mod semaphore;

pub use semaphore::{AdmissionPermit, AdmissionSemaphore, CapacityFn};
