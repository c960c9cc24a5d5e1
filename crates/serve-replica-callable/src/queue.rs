//! Thread-safe FIFO hand-off between user code and the response plane.

use futures::Stream;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

struct QueueInner<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

/// FIFO queue carrying streaming results from user code to the plane loop.
///
/// Producers call [`put_nowait`](MessageQueue::put_nowait); this is safe from
/// any thread, so results produced on the user loop or on a worker thread are
/// handed off without extra scheduling. The consumer drains the queue in
/// micro-batches via
/// [`fetch_messages_from_queue`](MessageQueue::fetch_messages_from_queue).
/// Intended for exactly one producer and one consumer per queue; FIFO order
/// is preserved.
pub struct MessageQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                items: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Appends an item without suspending. Thread-safe.
    pub fn put_nowait(&self, item: T) {
        lock(&self.inner.items).push_back(item);
        self.inner.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner.items).is_empty()
    }

    /// Consumes the queue as a stream of micro-batches.
    ///
    /// Each wake-up yields every item buffered at that moment. The stream
    /// ends once `completion` has resolved and the queue is drained; a
    /// failed completion is yielded as the final item. Dropping the stream
    /// drops `completion`, which is how producer tasks get cancelled.
    pub fn fetch_messages_from_queue<F, E>(
        &self,
        completion: F,
    ) -> impl Stream<Item = Result<Vec<T>, E>> + Send
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        async_stream::stream! {
            let mut completion = std::pin::pin!(completion);
            let mut completion_result: Option<Result<(), E>> = None;
            loop {
                // Register for notifications before checking the queue so an
                // enqueue between the drain and the await is not lost.
                let notified = inner.notify.notified();

                let batch: Vec<T> = {
                    let mut items = lock(&inner.items);
                    items.drain(..).collect()
                };
                if !batch.is_empty() {
                    yield Ok(batch);
                    continue;
                }

                if let Some(result) = completion_result.take() {
                    if let Err(error) = result {
                        yield Err(error);
                    }
                    break;
                }

                tokio::select! {
                    result = &mut completion => {
                        completion_result = Some(result);
                    }
                    _ = notified => {}
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
