//! Integration tests for loading and saving aggregates through the repository.

mod common;

use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use pretty_assertions::assert_eq;
use uuid::Uuid;

use evently::{
    Aggregate, AggregateRoot, DomainEvent, Error, EventMetadata, EventStore, Result, RetryPolicy,
    async_trait,
    repository::{GenericRepository, Repository, RepositoryConfig},
    snapshot::{AggregateSnapshot, SnapshotStore},
    store::{in_memory::InMemoryEventStore, in_memory_snapshot::InMemorySnapshotStore},
};

use common::{
    Tally, TallyEvent, Unencodable, User, UserEvent, UserUpdated, created, email_changed, tallied,
};

type UserRepository =
    GenericRepository<User, InMemoryEventStore<User>, InMemorySnapshotStore<User>>;

fn user_repository() -> (UserRepository, Arc<InMemoryEventStore<User>>) {
    let store = Arc::new(InMemoryEventStore::<User>::new().unwrap());
    (GenericRepository::new(store.clone(), None), store)
}

/// Counts writes and forwards everything to an in-memory store.
struct CountingStore<A: Aggregate> {
    inner: InMemoryEventStore<A>,
    writes: AtomicUsize,
}

#[async_trait]
impl<A: Aggregate> EventStore<A> for CountingStore<A> {
    async fn save_events(
        &self,
        id: &A::Id,
        events: &[DomainEvent<A::Event>],
        expected_version: i64,
    ) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.save_events(id, events, expected_version).await
    }

    async fn load_events_from_version(
        &self,
        id: &A::Id,
        from_version: i64,
    ) -> Result<Vec<DomainEvent<A::Event>>> {
        self.inner.load_events_from_version(id, from_version).await
    }

    async fn get_aggregate_version(&self, id: &A::Id) -> Result<i64> {
        self.inner.get_aggregate_version(id).await
    }

    async fn events_by_type(
        &self,
        event_type: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DomainEvent<A::Event>>> {
        self.inner.events_by_type(event_type, limit, offset).await
    }
}

/// A store whose writes never complete.
struct StalledStore;

#[async_trait]
impl EventStore<User> for StalledStore {
    async fn save_events(
        &self,
        _id: &Uuid,
        _events: &[DomainEvent<UserEvent>],
        _expected_version: i64,
    ) -> Result<()> {
        futures::future::pending().await
    }

    async fn load_events_from_version(
        &self,
        _id: &Uuid,
        _from_version: i64,
    ) -> Result<Vec<DomainEvent<UserEvent>>> {
        Ok(Vec::new())
    }

    async fn get_aggregate_version(&self, _id: &Uuid) -> Result<i64> {
        Ok(0)
    }

    async fn events_by_type(
        &self,
        _event_type: &str,
        _limit: usize,
        _offset: usize,
    ) -> Result<Vec<DomainEvent<UserEvent>>> {
        Ok(Vec::new())
    }
}

// -- Tests ---------------------------------------------------------------

#[test_log::test]
fn user_lifecycle_round_trips_through_the_store() {
    let (repo, store) = user_repository();
    let id = Uuid::new_v4();

    let mut user = AggregateRoot::<User>::new(id);
    user.raise_event(created("a@x.com", "A")).unwrap();
    user.raise_event(email_changed("b@x.com")).unwrap();
    user.raise_event(UserEvent::UserDeactivated).unwrap();

    let expected = User {
        email: "b@x.com".into(),
        name: "A".into(),
        active: false,
        registered: true,
    };
    assert_eq!(user.state(), &expected);
    assert_eq!(user.version(), 3);

    futures::executor::block_on(repo.save(&mut user)).expect("save events");
    assert!(!user.has_uncommitted_events());
    assert_eq!(user.version(), 3);

    let loaded = futures::executor::block_on(repo.load(&id)).expect("load");
    assert_eq!(loaded.state(), &expected);
    assert_eq!(loaded.version(), 3);

    // Replaying the stored log from a blank aggregate gives the same state.
    let history = futures::executor::block_on(store.load_events(&id)).unwrap();
    let mut replayed = AggregateRoot::<User>::new(id);
    replayed.load_from_history(history).unwrap();
    assert_eq!(replayed.state(), &expected);
    assert_eq!(replayed.version(), 3);
}

#[test]
fn version_tracks_every_raised_event() {
    let mut tally = AggregateRoot::<Tally>::new("t-1".to_owned());
    for n in 1..=25 {
        tally.raise_event(tallied(n)).unwrap();
    }

    assert_eq!(tally.version(), 25);
    for (i, event) in tally.uncommitted_events().iter().enumerate() {
        assert_eq!(event.event_version(), i as i64 + 1);
        assert_eq!(event.aggregate_type(), "Tally");
    }
}

#[test]
fn save_without_new_events_writes_nothing() {
    let store = Arc::new(CountingStore {
        inner: InMemoryEventStore::<User>::new().unwrap(),
        writes: AtomicUsize::new(0),
    });
    let repo = GenericRepository::new(store.clone(), None::<Arc<InMemorySnapshotStore<User>>>);
    let id = Uuid::new_v4();

    let mut fresh = AggregateRoot::<User>::new(id);
    futures::executor::block_on(repo.save(&mut fresh)).expect("no-op save");
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);

    fresh.raise_event(created("a@x.com", "A")).unwrap();
    futures::executor::block_on(repo.save(&mut fresh)).unwrap();
    assert_eq!(store.writes.load(Ordering::SeqCst), 1);

    let mut loaded = futures::executor::block_on(repo.load(&id)).unwrap();
    futures::executor::block_on(repo.save(&mut loaded)).expect("no-op save after load");
    futures::executor::block_on(repo.save(&mut fresh)).expect("no-op save after save");
    assert_eq!(store.writes.load(Ordering::SeqCst), 1);
}

#[test]
fn second_writer_from_the_same_version_gets_a_conflict() {
    let (repo, _) = user_repository();
    let id = Uuid::new_v4();

    let mut user = AggregateRoot::<User>::new(id);
    user.raise_event(created("a@x.com", "A")).unwrap();
    futures::executor::block_on(repo.save(&mut user)).unwrap();

    let mut first = futures::executor::block_on(repo.load(&id)).unwrap();
    let mut second = futures::executor::block_on(repo.load(&id)).unwrap();
    first.raise_event(email_changed("first@x.com")).unwrap();
    second.raise_event(email_changed("second@x.com")).unwrap();

    futures::executor::block_on(repo.save(&mut first)).expect("first writer wins");
    let err = futures::executor::block_on(repo.save(&mut second)).expect_err("second conflicts");
    assert_eq!(
        err,
        Error::AggregateVersionConflict {
            aggregate_id: id.to_string(),
            expected: 1,
            actual: Some(2),
        }
    );
    assert_eq!(err.retry_policy(), RetryPolicy::Reload);

    // The rejected events stay pending; nothing was merged.
    assert_eq!(second.uncommitted_events().len(), 1);
    let stored = futures::executor::block_on(repo.load(&id)).unwrap();
    assert_eq!(stored.state().email, "first@x.com");

    // Reload, re-run the domain logic and save again.
    let mut retry = futures::executor::block_on(repo.load(&id)).unwrap();
    retry.raise_event(email_changed("second@x.com")).unwrap();
    futures::executor::block_on(repo.save(&mut retry)).unwrap();
    assert_eq!(
        futures::executor::block_on(repo.current_version(&id)).unwrap(),
        3
    );
}

#[test]
fn concurrent_writers_have_exactly_one_winner() {
    const WRITERS: usize = 8;

    let (repo, _) = user_repository();
    let repo = Arc::new(repo);
    let id = Uuid::new_v4();

    let mut user = AggregateRoot::<User>::new(id);
    user.raise_event(created("a@x.com", "A")).unwrap();
    futures::executor::block_on(repo.save(&mut user)).unwrap();

    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles: Vec<_> = (0..WRITERS)
        .map(|n| {
            let repo = Arc::clone(&repo);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut copy = futures::executor::block_on(repo.load(&id)).unwrap();
                copy.raise_event(email_changed(&format!("{n}@x.com"))).unwrap();
                barrier.wait();
                futures::executor::block_on(repo.save(&mut copy))
            })
        })
        .collect();

    let results: Vec<Result<()>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(Error::AggregateVersionConflict { .. })))
        .count();

    assert_eq!(winners, 1);
    assert_eq!(conflicts, WRITERS - 1);
    assert_eq!(
        futures::executor::block_on(repo.current_version(&id)).unwrap(),
        2
    );
}

#[test]
fn failed_batch_persists_nothing() {
    let store = Arc::new(InMemoryEventStore::<Tally>::new().unwrap());
    let repo = GenericRepository::new(store.clone(), None::<Arc<InMemorySnapshotStore<Tally>>>);
    let id = "tally-atomic".to_owned();

    let mut tally = AggregateRoot::<Tally>::new(id.clone());
    tally.raise_event(tallied(1)).unwrap();
    tally
        .raise_event(TallyEvent::Unencodable(Unencodable::new()))
        .unwrap();
    tally.raise_event(tallied(2)).unwrap();

    let err = futures::executor::block_on(repo.save(&mut tally)).unwrap_err();
    assert!(
        matches!(&err, Error::EventSerializationFailed { event_type, .. } if event_type == "Unencodable")
    );
    assert_eq!(err.retry_policy(), RetryPolicy::Never);

    assert!(futures::executor::block_on(store.load_events(&id)).unwrap().is_empty());
    assert_eq!(tally.uncommitted_events().len(), 3);
    assert_eq!(tally.version(), 3);
}

#[test]
fn loading_an_unknown_aggregate_is_not_found() {
    let (repo, _) = user_repository();
    let id = Uuid::new_v4();

    let err = futures::executor::block_on(repo.load(&id)).unwrap_err();
    assert_eq!(err, Error::AggregateNotFound(id.to_string()));
}

#[test]
fn snapshot_plus_tail_matches_full_replay() {
    let store = Arc::new(InMemoryEventStore::<User>::new().unwrap());
    let snapshots = Arc::new(InMemorySnapshotStore::<User>::default());
    let repo = GenericRepository::new(store.clone(), Some(snapshots.clone()))
        .with_snapshot_frequency(Some(2));
    let id = Uuid::new_v4();

    let mut user = AggregateRoot::<User>::new(id);
    user.raise_event(created("a@x.com", "A")).unwrap();
    futures::executor::block_on(repo.save(&mut user)).unwrap();
    for n in 0..4 {
        user.raise_event(UserEvent::UserUpdated(UserUpdated {
            email: None,
            name: Some(format!("A{n}")),
        }))
        .unwrap();
        futures::executor::block_on(repo.save(&mut user)).unwrap();
    }

    let snapshot = futures::executor::block_on(snapshots.load_snapshot(&id))
        .unwrap()
        .expect("snapshot taken at a multiple of the frequency");
    assert_eq!(snapshot.version(), 4);

    let from_snapshot = futures::executor::block_on(repo.load(&id)).unwrap();
    let full_replay_repo =
        GenericRepository::new(store, None::<Arc<InMemorySnapshotStore<User>>>);
    let from_scratch = futures::executor::block_on(full_replay_repo.load(&id)).unwrap();

    assert_eq!(from_snapshot.state(), from_scratch.state());
    assert_eq!(from_snapshot.version(), 5);
    assert_eq!(from_scratch.version(), 5);
    assert_eq!(from_snapshot.state().name, "A3");
}

#[test]
fn snapshot_alone_is_enough_to_load() {
    let store = Arc::new(InMemoryEventStore::<User>::new().unwrap());
    let snapshots = Arc::new(InMemorySnapshotStore::<User>::default());
    let repo = GenericRepository::new(store, Some(snapshots.clone()));
    let id = Uuid::new_v4();

    let state = User {
        email: "s@x.com".into(),
        name: "S".into(),
        active: true,
        registered: true,
    };
    let snapshot = AggregateSnapshot::new(
        id.to_string(),
        "User",
        7,
        state.snapshot().unwrap(),
        Utc::now(),
    );
    futures::executor::block_on(snapshots.save_snapshot(&snapshot)).unwrap();

    let loaded = futures::executor::block_on(repo.load(&id)).unwrap();
    assert_eq!(loaded.version(), 7);
    assert_eq!(loaded.state(), &state);
}

#[test]
fn aggregates_without_snapshot_support_fall_back_to_replay() {
    let store = Arc::new(InMemoryEventStore::<Tally>::new().unwrap());
    let snapshots = Arc::new(InMemorySnapshotStore::<Tally>::default());
    let repo = GenericRepository::new(store, Some(snapshots.clone())).with_snapshot_frequency(Some(1));
    let id = "tally-1".to_owned();

    let mut tally = AggregateRoot::<Tally>::new(id.clone());
    tally.raise_event(tallied(4)).unwrap();
    tally.raise_event(tallied(6)).unwrap();
    futures::executor::block_on(repo.save(&mut tally)).expect("snapshot policy is skipped");
    assert!(
        futures::executor::block_on(snapshots.load_snapshot(&id))
            .unwrap()
            .is_none()
    );

    // A stray snapshot cannot be restored, so the full history is replayed.
    let stray = AggregateSnapshot::new(id.clone(), "Tally", 1, b"opaque".to_vec(), Utc::now());
    futures::executor::block_on(snapshots.save_snapshot(&stray)).unwrap();

    let loaded = futures::executor::block_on(repo.load(&id)).unwrap();
    assert_eq!(loaded.version(), 2);
    assert_eq!(loaded.state().total, 10);

    let err = futures::executor::block_on(repo.snapshot(&loaded)).unwrap_err();
    assert_eq!(err, Error::SnapshotNotSupported("Tally".into()));
}

#[test]
fn explicit_snapshot_refuses_unsaved_aggregates() {
    let store = Arc::new(InMemoryEventStore::<User>::new().unwrap());
    let snapshots = Arc::new(InMemorySnapshotStore::<User>::default());
    let repo = GenericRepository::new(store, Some(snapshots.clone()));
    let id = Uuid::new_v4();

    let mut user = AggregateRoot::<User>::new(id);
    user.raise_event(created("a@x.com", "A")).unwrap();
    let err = futures::executor::block_on(repo.snapshot(&user)).unwrap_err();
    assert!(matches!(err, Error::UncommittedEvents(_)));

    futures::executor::block_on(repo.save(&mut user)).unwrap();
    futures::executor::block_on(repo.snapshot(&user)).unwrap();
    let stored = futures::executor::block_on(snapshots.load_snapshot(&id))
        .unwrap()
        .unwrap();
    assert_eq!(stored.version(), 1);
    assert_eq!(stored.aggregate_type(), "User");
}

#[test]
fn load_into_replaces_whatever_the_aggregate_held() {
    let (repo, _) = user_repository();
    let id = Uuid::new_v4();

    let mut user = AggregateRoot::<User>::new(id);
    user.raise_event(created("a@x.com", "A")).unwrap();
    futures::executor::block_on(repo.save(&mut user)).unwrap();

    let mut target = AggregateRoot::<User>::new(Uuid::new_v4());
    target.raise_event(created("z@x.com", "Z")).unwrap();
    futures::executor::block_on(repo.load_into(&id, &mut target)).unwrap();

    assert_eq!(target.id(), &id);
    assert_eq!(target.version(), 1);
    assert_eq!(target.state().email, "a@x.com");
    assert!(!target.has_uncommitted_events());
}

#[test]
fn failed_load_leaves_the_target_untouched() {
    let (repo, store) = user_repository();
    let id = Uuid::new_v4();

    // A stored history the domain rejects on its third event.
    let history: Vec<DomainEvent<UserEvent>> = [
        created("a@x.com", "A"),
        UserEvent::UserDeactivated,
        email_changed("b@x.com"),
    ]
    .into_iter()
    .zip(1..)
    .map(|(payload, version)| {
        DomainEvent::new(id.to_string(), "User", version, payload, EventMetadata::default())
    })
    .collect();
    futures::executor::block_on(store.save_events(&id, &history, 0)).unwrap();

    let other = Uuid::new_v4();
    let mut target = AggregateRoot::<User>::new(other);
    target.raise_event(created("z@x.com", "Z")).unwrap();
    let before = target.clone();

    let err = futures::executor::block_on(repo.load_into(&id, &mut target)).unwrap_err();
    assert!(matches!(err, Error::Domain(_)));
    assert_eq!(target.id(), &other);
    assert_eq!(target.version(), before.version());
    assert_eq!(target.state(), before.state());
    assert_eq!(target.uncommitted_events(), before.uncommitted_events());
}

#[test]
fn metadata_survives_the_round_trip() {
    let (repo, store) = user_repository();
    let id = Uuid::new_v4();
    let correlation = Uuid::new_v4();
    let cause = Uuid::new_v4();

    let mut user = AggregateRoot::<User>::new(id);
    user.raise_event_with(
        created("a@x.com", "A"),
        EventMetadata::correlated(correlation).caused_by(cause),
    )
    .unwrap();
    futures::executor::block_on(repo.save(&mut user)).unwrap();

    let events = futures::executor::block_on(store.load_events(&id)).unwrap();
    assert_eq!(events[0].metadata().correlation_id, Some(correlation));
    assert_eq!(events[0].metadata().causation_id, Some(cause));
}

#[test]
fn config_enables_snapshots_and_deadlines() {
    let config: RepositoryConfig =
        serde_json::from_str(r#"{"snapshot_frequency": 1}"#).expect("valid config");
    assert_eq!(config.operation_timeout_ms, None);

    let store = Arc::new(InMemoryEventStore::<User>::new().unwrap());
    let snapshots = Arc::new(InMemorySnapshotStore::<User>::default());
    let repo = GenericRepository::new(store, Some(snapshots.clone())).with_config(config);
    let id = Uuid::new_v4();

    let mut user = AggregateRoot::<User>::new(id);
    user.raise_event(created("a@x.com", "A")).unwrap();
    futures::executor::block_on(repo.save(&mut user)).unwrap();

    assert!(
        futures::executor::block_on(snapshots.load_snapshot(&id))
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn stalled_store_call_times_out() {
    let repo = GenericRepository::new(
        Arc::new(StalledStore),
        None::<Arc<InMemorySnapshotStore<User>>>,
    )
    .with_operation_timeout(Some(Duration::from_millis(50)));

    let mut user = AggregateRoot::<User>::new(Uuid::new_v4());
    user.raise_event(created("a@x.com", "A")).unwrap();

    let err = repo.save(&mut user).await.unwrap_err();
    assert_eq!(err, Error::Timeout(Duration::from_millis(50)));
    assert_eq!(err.retry_policy(), RetryPolicy::Reload);
    assert!(user.has_uncommitted_events());
}
