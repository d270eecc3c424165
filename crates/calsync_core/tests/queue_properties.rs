//! Property tests for queue ordering.

use calsync_core::{
    Clock, EntityId, Fields, ManualClock, MutationKind, Replica, Sequence,
};
use calsync_storage::InMemoryBackend;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Enqueue { entity: usize },
    Drain { ack: bool, limit: usize },
    Advance { millis: u64 },
    Restart,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..4).prop_map(|entity| Op::Enqueue { entity }),
        3 => (any::<bool>(), 1usize..4).prop_map(|(ack, limit)| Op::Drain { ack, limit }),
        1 => (0u64..5_000).prop_map(|millis| Op::Advance { millis }),
        1 => Just(Op::Restart),
    ]
}

fn payload(n: u64) -> Fields {
    [("n".to_string(), json!(n))].into_iter().collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn per_entity_order_survives_retries_and_restarts(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let ids: Vec<EntityId> = (0..4u8).map(|i| EntityId::from_bytes([i + 1; 16])).collect();
        let backend = InMemoryBackend::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let open = |clock: &Arc<ManualClock>| {
            Replica::open_with(
                Box::new(backend.reopen()),
                Default::default(),
                Arc::clone(clock) as Arc<dyn Clock>,
            )
            .unwrap()
        };
        let mut replica = open(&clock);

        let mut last_enqueued: Option<Sequence> = None;
        let mut last_acked: HashMap<EntityId, Sequence> = HashMap::new();
        let mut latest_value: HashMap<EntityId, u64> = HashMap::new();
        let mut counter = 0u64;

        for op in ops {
            match op {
                Op::Enqueue { entity } => {
                    counter += 1;
                    let id = ids[entity];
                    let kind = if latest_value.contains_key(&id) {
                        MutationKind::UpdateEvent
                    } else {
                        MutationKind::CreateEvent
                    };
                    let seq = replica.submit(kind, id, payload(counter)).unwrap();
                    if let Some(prev) = last_enqueued {
                        prop_assert!(seq > prev);
                    }
                    last_enqueued = Some(seq);
                    latest_value.insert(id, counter);
                }
                Op::Drain { ack, limit } => {
                    let queue = replica.queue();
                    let claimed = queue.claim_ready(clock.now(), limit);
                    prop_assert!(claimed.len() <= limit);
                    for m in claimed {
                        let earliest = queue
                            .pending()
                            .into_iter()
                            .find(|p| p.entity_id == m.entity_id)
                            .map(|p| p.sequence);
                        prop_assert_eq!(earliest, Some(m.sequence));

                        if ack {
                            if let Some(prev) = last_acked.get(&m.entity_id) {
                                prop_assert!(m.sequence > *prev);
                            }
                            queue.ack(m.sequence).unwrap();
                            last_acked.insert(m.entity_id, m.sequence);
                        } else {
                            queue
                                .reschedule(m.sequence, Duration::from_millis(500))
                                .unwrap();
                        }
                    }
                }
                Op::Advance { millis } => clock.advance(Duration::from_millis(millis)),
                Op::Restart => {
                    drop(replica);
                    replica = open(&clock);
                }
            }

            let ready = replica.queue().peek_ready(clock.now());
            let mut seen = std::collections::HashSet::new();
            for m in &ready {
                prop_assert!(seen.insert(m.entity_id), "two mutations for one entity");
            }
            prop_assert!(ready.windows(2).all(|w| w[0].sequence < w[1].sequence));
        }

        // Drain everything; each entity ends at its last written value.
        clock.advance(Duration::from_secs(3_600));
        loop {
            let queue = replica.queue();
            let claimed = queue.claim_ready(clock.now(), usize::MAX);
            if claimed.is_empty() {
                break;
            }
            for m in claimed {
                queue.ack(m.sequence).unwrap();
            }
        }
        prop_assert!(replica.queue().is_empty());
        for (id, value) in latest_value {
            let entity = replica.get(id).unwrap();
            prop_assert_eq!(entity.field("n"), Some(&json!(value)));
        }
    }
}
