//! Provides a generic repository for loading and saving aggregates.
use std::{future::Future, marker::PhantomData, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::{
    Aggregate, AggregateRoot, Error, EventStore, Result, snapshot::SnapshotStore,
};

/// Defines the standard interface for a repository.
#[async_trait]
pub trait Repository<A: Aggregate>: Send + Sync {
    /// Loads an aggregate instance from the store.
    async fn load(&self, id: &A::Id) -> Result<AggregateRoot<A>> {
        let mut aggregate = AggregateRoot::new(id.clone());
        self.load_into(id, &mut aggregate).await?;
        Ok(aggregate)
    }

    /// Rehydrates `aggregate` in place as the aggregate `id`, discarding
    /// whatever it held before. On error `aggregate` is left unchanged.
    async fn load_into(&self, id: &A::Id, aggregate: &mut AggregateRoot<A>) -> Result<()>;

    /// Persists the aggregate's uncommitted events and clears them.
    async fn save(&self, aggregate: &mut AggregateRoot<A>) -> Result<()>;
}

/// Repository settings that can be read from configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Take a snapshot every this many events.
    pub snapshot_frequency: Option<usize>,
    /// Upper bound, in milliseconds, for every store call.
    pub operation_timeout_ms: Option<u64>,
}

/// A generic, high-level repository for loading and saving aggregates.
///
/// This repository orchestrates the `EventStore` and an optional
/// `SnapshotStore`. It never retries: a version conflict goes back to the
/// caller, who must reload and re-run its domain logic.
pub struct GenericRepository<A, S, SS>
where
    A: Aggregate,
    S: EventStore<A>,
    SS: SnapshotStore<A>,
{
    store: Arc<S>,
    snapshot_store: Option<Arc<SS>>,
    snapshot_frequency: Option<usize>,
    operation_timeout: Option<Duration>,
    _phantom: PhantomData<A>,
}

impl<A, S, SS> GenericRepository<A, S, SS>
where
    A: Aggregate,
    S: EventStore<A>,
    SS: SnapshotStore<A>,
{
    /// Creates a new `GenericRepository`.
    pub fn new(store: Arc<S>, snapshot_store: Option<Arc<SS>>) -> Self {
        Self {
            store,
            snapshot_store,
            snapshot_frequency: None,
            operation_timeout: None,
            _phantom: PhantomData,
        }
    }

    /// Sets the frequency at which snapshots should be created.
    ///
    /// For example, a value of `Some(100)` means a snapshot will be created
    /// every 100 events.
    pub fn with_snapshot_frequency(mut self, frequency: Option<usize>) -> Self {
        self.snapshot_frequency = frequency.filter(|f| *f > 0);
        self
    }

    /// Bounds every store call by `timeout`.
    ///
    /// An elapsed call returns [`Error::Timeout`]. Its outcome is unknown, so
    /// the caller should re-read the aggregate version before retrying.
    /// Requires a Tokio runtime with the timer enabled.
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Applies every setting from `config`.
    pub fn with_config(self, config: RepositoryConfig) -> Self {
        self.with_snapshot_frequency(config.snapshot_frequency)
            .with_operation_timeout(config.operation_timeout_ms.map(Duration::from_millis))
    }

    /// Returns the durable version of `id` without loading its history.
    #[instrument(skip(self), fields(aggregate.id = %id))]
    pub async fn current_version(&self, id: &A::Id) -> Result<i64> {
        self.bounded(self.store.get_aggregate_version(id)).await
    }

    /// Snapshots a fully saved aggregate.
    ///
    /// Fails with [`Error::SnapshotNotSupported`] if the aggregate has no
    /// snapshot hook and with [`Error::UncommittedEvents`] if it has unsaved
    /// events.
    #[instrument(skip(self, aggregate), fields(aggregate.id = %aggregate.id(), version = aggregate.version()))]
    pub async fn snapshot(&self, aggregate: &AggregateRoot<A>) -> Result<()> {
        let Some(snapshot_store) = &self.snapshot_store else {
            return Err(Error::SnapshotNotSupported(A::TYPE.to_owned()));
        };
        let snapshot = aggregate.take_snapshot()?;
        self.bounded(snapshot_store.save_snapshot(&snapshot)).await
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        match self.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, operation)
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => operation.await,
        }
    }

    /// Takes a snapshot when the saved range crossed a multiple of the
    /// snapshot frequency.
    async fn snapshot_after_save(&self, aggregate: &AggregateRoot<A>, before: i64) -> Result<()> {
        let (Some(snapshot_store), Some(frequency)) =
            (&self.snapshot_store, self.snapshot_frequency)
        else {
            return Ok(());
        };
        let after = aggregate.version();
        let frequency = frequency as i64;
        if after / frequency <= before / frequency {
            return Ok(());
        }

        let snapshot = match aggregate.take_snapshot() {
            Ok(snapshot) => snapshot,
            Err(Error::SnapshotNotSupported(_)) => {
                debug!("aggregate type does not support snapshots");
                return Ok(());
            }
            Err(e) => {
                return Err(Error::SnapshotWrite {
                    version: after,
                    reason: e.to_string(),
                });
            }
        };
        self.bounded(snapshot_store.save_snapshot(&snapshot))
            .await
            .map_err(|e| Error::SnapshotWrite {
                version: after,
                reason: e.to_string(),
            })?;
        debug!(version = after, "snapshot taken");
        Ok(())
    }
}

#[async_trait]
impl<A, S, SS> Repository<A> for GenericRepository<A, S, SS>
where
    A: Aggregate,
    S: EventStore<A> + 'static,
    SS: SnapshotStore<A> + 'static,
{
    #[instrument(skip(self, aggregate), fields(aggregate.id = %id))]
    async fn load_into(&self, id: &A::Id, aggregate: &mut AggregateRoot<A>) -> Result<()> {
        // Rebuilt on the side so a failed load leaves `aggregate` untouched.
        let mut loaded = AggregateRoot::new(id.clone());

        // Attempt to hydrate the aggregate from a snapshot first so we can
        // replay only the delta of events that occurred afterwards.
        let snapshot = match &self.snapshot_store {
            Some(snapshot_store) => self.bounded(snapshot_store.load_snapshot(id)).await?,
            None => None,
        };
        let restored = match snapshot {
            Some(snapshot) => match AggregateRoot::from_snapshot(id.clone(), &snapshot) {
                Ok(from_snapshot) => {
                    loaded = from_snapshot;
                    true
                }
                Err(Error::SnapshotNotSupported(_)) => {
                    debug!("snapshot found but not restorable, replaying full history");
                    false
                }
                Err(e) => return Err(e),
            },
            None => false,
        };

        let events = if restored {
            self.bounded(self.store.load_events_from_version(id, loaded.version()))
                .await?
        } else {
            self.bounded(self.store.load_events(id)).await?
        };

        // Guard against loading a non-existing aggregate.
        if events.is_empty() && !restored {
            return Err(Error::AggregateNotFound(id.to_string()));
        }

        let replayed = events.len();
        loaded.load_from_history(events)?;
        debug!(
            version = loaded.version(),
            replayed, from_snapshot = restored, "aggregate loaded"
        );
        *aggregate = loaded;
        Ok(())
    }

    #[instrument(skip(self, aggregate), fields(aggregate.id = %aggregate.id()))]
    async fn save(&self, aggregate: &mut AggregateRoot<A>) -> Result<()> {
        let new_events = aggregate.uncommitted_events();
        if new_events.is_empty() {
            return Ok(());
        }

        let version_before_save = aggregate.version() - new_events.len() as i64;

        if let Err(e) = self
            .bounded(
                self.store
                    .save_events(aggregate.id(), &new_events, version_before_save),
            )
            .await
        {
            if matches!(e, Error::AggregateVersionConflict { .. }) {
                warn!(expected_version = version_before_save, "save rejected");
            }
            return Err(e);
        }

        aggregate.clear_uncommitted_events();
        debug!(
            version = aggregate.version(),
            saved = new_events.len(),
            "aggregate saved"
        );

        self.snapshot_after_save(aggregate, version_before_save).await
    }
}

#[async_trait]
impl<A, R> Repository<A> for Arc<R>
where
    A: Aggregate,
    R: Repository<A> + Send + Sync,
{
    async fn load_into(&self, id: &A::Id, aggregate: &mut AggregateRoot<A>) -> Result<()> {
        (**self).load_into(id, aggregate).await
    }

    async fn save(&self, aggregate: &mut AggregateRoot<A>) -> Result<()> {
        (**self).save(aggregate).await
    }
}
