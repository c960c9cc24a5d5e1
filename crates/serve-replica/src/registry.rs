//! Per-request registry of child requests, used for recursive cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;

/// A child request that has already been assigned to a downstream replica.
///
/// Implemented by handle-side result objects so cancelling a parent request
/// can cancel its in-flight children.
pub trait InFlightRequest: Send + Sync + 'static {
    fn cancel(&self);
}

#[derive(Default)]
struct ChildRequests {
    pending_assignment: HashMap<u64, AbortHandle>,
    in_flight: HashMap<u64, Arc<dyn InFlightRequest>>,
}

/// Tracks the child requests spawned under each in-flight request, keyed by
/// the parent's `internal_request_id`.
///
/// Two taxonomies are tracked: *pending-assignment* tasks (admission waiters
/// on downstream replicas) and *in-flight* handles (remote call results).
/// Cancelling a request enumerates and cancels both, which makes
/// cancellation recursive across dependent calls.
#[derive(Default)]
pub struct RequestRegistry {
    next_id: AtomicU64,
    children: Mutex<HashMap<String, ChildRequests>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers an admission task for a child request. Returns an id to
    /// deregister with once the child is assigned.
    pub fn register_pending_assignment(
        &self,
        parent_internal_request_id: &str,
        handle: AbortHandle,
    ) -> u64 {
        let id = self.next_id();
        lock(&self.children)
            .entry(parent_internal_request_id.to_string())
            .or_default()
            .pending_assignment
            .insert(id, handle);
        id
    }

    pub fn remove_pending_assignment(&self, parent_internal_request_id: &str, id: u64) {
        if let Some(children) = lock(&self.children).get_mut(parent_internal_request_id) {
            children.pending_assignment.remove(&id);
        }
    }

    /// Registers an assigned child request. Returns an id to deregister with
    /// once the child completes.
    pub fn register_in_flight(
        &self,
        parent_internal_request_id: &str,
        request: Arc<dyn InFlightRequest>,
    ) -> u64 {
        let id = self.next_id();
        lock(&self.children)
            .entry(parent_internal_request_id.to_string())
            .or_default()
            .in_flight
            .insert(id, request);
        id
    }

    pub fn remove_in_flight(&self, parent_internal_request_id: &str, id: u64) {
        if let Some(children) = lock(&self.children).get_mut(parent_internal_request_id) {
            children.in_flight.remove(&id);
        }
    }

    /// Cancels every child of the given request: pending-assignment tasks
    /// are aborted, in-flight results are cancelled.
    pub fn cancel_children(&self, parent_internal_request_id: &str) {
        let Some(children) = lock(&self.children).remove(parent_internal_request_id) else {
            return;
        };
        for handle in children.pending_assignment.values() {
            handle.abort();
        }
        for request in children.in_flight.values() {
            request.cancel();
        }
    }

    /// Drops the bookkeeping for a finished request without cancelling
    /// anything.
    pub fn clear(&self, parent_internal_request_id: &str) {
        lock(&self.children).remove(parent_internal_request_id);
    }

    pub fn num_children(&self, parent_internal_request_id: &str) -> usize {
        lock(&self.children)
            .get(parent_internal_request_id)
            .map(|c| c.pending_assignment.len() + c.in_flight.len())
            .unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
