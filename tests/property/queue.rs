//! Property tests for the streaming message queue.
//!
//! Invariants tested:
//! - Items arrive in the exact order they were enqueued, for any schedule
//! - The stream terminates once the producer is done and the queue drained

use futures::StreamExt;
use proptest::prelude::*;
use serve_replica_callable::MessageQueue;
use std::time::Duration;
use tokio::runtime::Runtime;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn fifo_order_for_any_producer_schedule(
        items in 0usize..200,
        pauses in proptest::collection::vec(0u64..3, 0..16),
    ) {
        let rt = Runtime::new().expect("runtime");
        rt.block_on(async move {
            let queue = MessageQueue::new();
            let producer = {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for i in 0..items {
                        queue.put_nowait(i);
                        if let Some(pause) = pauses.get(i % pauses.len().max(1)) {
                            if *pause > 0 {
                                tokio::time::sleep(Duration::from_millis(*pause)).await;
                            }
                        }
                    }
                    Ok::<(), ()>(())
                })
            };

            let completion = async move {
                match producer.await {
                    Ok(result) => result,
                    Err(_) => Err(()),
                }
            };
            let received: Vec<usize> = queue
                .fetch_messages_from_queue(completion)
                .map(|batch| futures::stream::iter(batch.unwrap_or_default()))
                .flatten()
                .collect()
                .await;

            assert_eq!(received, (0..items).collect::<Vec<_>>());
            assert!(queue.is_empty());
        });
    }
}
