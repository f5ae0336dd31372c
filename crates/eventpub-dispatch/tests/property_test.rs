//! Property tests for the poll batch bound and per-aggregate ordering.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use eventpub_core::{EventRecord, PendingEventRef, TestClock};
use eventpub_dispatch::{
    storage::mock::{MockConnector, MockPublishStorage},
    Connection, DispatchConfig, Dispatcher, EventProcessor, Registry, RunMode, MAX_BATCH_SIZE,
};
use proptest::prelude::*;

/// Pending versions per aggregate, each aggregate holding versions `1..=n`.
fn queue_strategy() -> impl Strategy<Value = HashMap<String, i32>> {
    prop::collection::hash_map("[a-z]{1,8}", 1i32..60, 1..8)
}

async fn drain(
    queue: &HashMap<String, i32>,
    batch_size: usize,
) -> (Vec<PendingEventRef>, Vec<Vec<PendingEventRef>>, usize) {
    let storage = MockPublishStorage::new();
    for (aggregate, versions) in queue {
        for version in 1..=*versions {
            storage.append(EventRecord::new(aggregate.clone(), version, "Changed", Vec::new()));
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let mut registry = Registry::new();
    registry
        .register(
            "recorder",
            EventProcessor::new().on_initialize(|_| async { Ok(()) }).on_process(
                move |_, event| {
                    let recorder = recorder.clone();
                    async move {
                        recorder.lock().unwrap().push(event.key());
                        Ok(())
                    }
                },
            ),
        )
        .unwrap();

    let clock = TestClock::new();
    let config = DispatchConfig { batch_size, ..DispatchConfig::default() };
    let dispatcher = Dispatcher::new(registry, config, Arc::new(clock.clone()));
    let connection = Connection::establish(
        Arc::new(MockConnector::new(storage.clone())),
        1,
        Duration::from_secs(1),
        Arc::new(clock),
    )
    .await
    .unwrap();
    dispatcher.set_connection(connection).await;

    let mut passes = 0;
    while !storage.pending().is_empty() {
        dispatcher.process_events(RunMode::SinglePass).await.unwrap();
        passes += 1;
    }

    let seen = seen.lock().unwrap().clone();
    (seen, storage.poll_history(), passes)
}

proptest! {
    /// No poll locks more rows than the configured batch, itself capped at 100.
    #[test]
    fn polls_never_exceed_batch_bound(
        queue in queue_strategy(),
        batch_size in 0usize..300,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (_, polls, _) = drain(&queue, batch_size).await;
            let bound = batch_size.clamp(1, MAX_BATCH_SIZE);

            for batch in &polls {
                prop_assert!(batch.len() <= bound, "batch of {} over bound {}", batch.len(), bound);
            }

            Ok(())
        })?;
    }

    /// Each aggregate's events reach processors in version order, once each.
    #[test]
    fn aggregates_dispatch_in_version_order(
        queue in queue_strategy(),
        batch_size in 1usize..=MAX_BATCH_SIZE,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (seen, _, passes) = drain(&queue, batch_size).await;

            let total: i32 = queue.values().sum();
            prop_assert_eq!(seen.len(), usize::try_from(total).unwrap());
            prop_assert_eq!(passes, seen.len().div_ceil(batch_size));

            let unique: BTreeSet<&PendingEventRef> = seen.iter().collect();
            prop_assert_eq!(unique.len(), seen.len());

            let mut last: HashMap<&str, i32> = HashMap::new();
            for key in &seen {
                let previous = last.insert(key.aggregate_id.as_str(), key.version);
                if let Some(previous) = previous {
                    prop_assert!(previous <= key.version, "{} went {} -> {}", key.aggregate_id, previous, key.version);
                }
            }

            Ok(())
        })?;
    }
}
