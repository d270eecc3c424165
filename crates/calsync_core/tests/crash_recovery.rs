//! Crash recovery: a crash while writing any record must leave the replica
//! either fully before or fully after the operation that wrote it.

use calsync_core::{
    Config, EntityId, EntityKind, Fields, ManualClock, MutationKind, Replica, Sequence, SyncStatus,
};
use calsync_storage::InMemoryBackend;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn fields(title: &str) -> Fields {
    [("title".to_string(), json!(title))].into_iter().collect()
}

fn open(bytes: Vec<u8>) -> Replica {
    Replica::open_with(
        Box::new(InMemoryBackend::with_data(bytes)),
        Config::default(),
        Arc::new(ManualClock::new(0)),
    )
    .unwrap()
}

/// Runs `setup`, snapshots the log, runs `op`, then reopens from every
/// prefix of the bytes `op` appended.
fn every_cut(
    setup: impl Fn(&Replica),
    op: impl Fn(&Replica),
    check: impl Fn(&Replica, bool),
) {
    let backend = InMemoryBackend::new();
    let replica = Replica::open_with(
        Box::new(backend.reopen()),
        Config::default(),
        Arc::new(ManualClock::new(0)),
    )
    .unwrap();
    setup(&replica);
    let before = backend.data();
    op(&replica);
    let after = backend.data();
    drop(replica);
    assert!(after.len() > before.len());

    for cut in before.len()..after.len() {
        let recovered = open(after[..cut].to_vec());
        check(&recovered, false);
    }
    check(&open(after), true);
}

#[test]
fn torn_enqueue_is_all_or_nothing() {
    let id = EntityId::from_bytes([7; 16]);
    every_cut(
        |_| {},
        |r| {
            r.submit(MutationKind::CreateEvent, id, fields("Standup")).unwrap();
        },
        |r, applied| {
            if applied {
                assert_eq!(r.queue().len(), 1);
                assert_eq!(r.get(id).unwrap().field("title"), Some(&json!("Standup")));
                assert_eq!(r.status(id), Some(SyncStatus::Pending { count: 1 }));
            } else {
                assert!(r.queue().is_empty());
                assert_eq!(r.get(id), None);
                assert_eq!(r.status(id), None);
            }
        },
    );
}

#[test]
fn torn_ack_keeps_mutation_pending() {
    let id = EntityId::from_bytes([8; 16]);
    every_cut(
        |r| {
            r.submit(MutationKind::CreateCalendar, id, fields("Home")).unwrap();
        },
        |r| {
            assert!(r.queue().ack(Sequence::new(1)).unwrap());
        },
        |r, applied| {
            assert_eq!(r.get(id).unwrap().field("title"), Some(&json!("Home")));
            if applied {
                assert!(r.queue().is_empty());
                assert_eq!(r.status(id), Some(SyncStatus::Synced));
            } else {
                assert_eq!(r.queue().len(), 1);
                assert_eq!(r.status(id), Some(SyncStatus::Pending { count: 1 }));
            }
        },
    );
}

#[test]
fn torn_reschedule_never_loses_the_mutation() {
    let id = EntityId::from_bytes([9; 16]);
    every_cut(
        |r| {
            r.submit(MutationKind::CreateEvent, id, fields("Retro")).unwrap();
        },
        |r| {
            r.queue()
                .reschedule(Sequence::new(1), Duration::from_secs(30))
                .unwrap();
        },
        |r, applied| {
            let pending = r.queue().pending();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].attempt_count, u32::from(applied));
        },
    );
}

#[test]
fn sequence_numbers_are_not_reused_after_recovery() {
    let backend = InMemoryBackend::new();
    {
        let replica = Replica::open(Box::new(backend.reopen()), Config::default()).unwrap();
        let (_, first) = replica.create(EntityKind::Calendar, fields("a")).unwrap();
        replica.queue().ack(first).unwrap();
        replica.create(EntityKind::Calendar, fields("b")).unwrap();
    }

    let replica = Replica::open(Box::new(backend.reopen()), Config::default()).unwrap();
    let (_, third) = replica.create(EntityKind::Calendar, fields("c")).unwrap();
    assert_eq!(third, Sequence::new(3));
}

#[test]
fn every_recovered_projection_matches_its_fold() {
    let backend = InMemoryBackend::new();
    let replica = Replica::open(Box::new(backend.reopen()), Config::default()).unwrap();
    let (a, s1) = replica.create(EntityKind::Event, fields("a")).unwrap();
    replica.update(a, fields("a2")).unwrap();
    let (b, _) = replica.create(EntityKind::Calendar, fields("b")).unwrap();
    replica.queue().ack(s1).unwrap();
    replica.delete(b).unwrap();
    let full = backend.data();
    drop(replica);

    for cut in 0..full.len() {
        let recovered = open(full[..cut].to_vec());
        for id in recovered.cache().ids() {
            let entry = recovered.cache().entry(id).unwrap();
            assert!(entry.is_consistent().unwrap(), "cut {cut}, entity {id}");
        }
    }
}
