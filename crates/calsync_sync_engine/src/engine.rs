//! The background sync engine.

use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::{RejectionReason, SyncError, SyncResult};
use crate::remote::{classify, Disposition, RemoteRequest, RemoteStore};
use calsync_core::{CoreError, Entity, EntityId, Mutation, MutationQueue, Sequence};
use futures::future::join_all;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Shortest pause between loop iterations.
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Capacity of the event channel; slow subscribers miss old events.
const EVENT_CAPACITY: usize = 256;

/// What the engine is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Waiting for work.
    Idle,
    /// Sending queued mutations.
    Draining,
    /// Connectivity is down or unknown; nothing is sent.
    Paused,
    /// The run loop has exited.
    Stopped,
}

impl EngineState {
    /// Returns true while mutations are being sent.
    pub fn is_active(&self) -> bool {
        matches!(self, EngineState::Draining)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Requests handed to the remote store.
    pub sends: u64,
    /// Mutations acknowledged by the server.
    pub acked: u64,
    /// Failed attempts that were rescheduled.
    pub retries: u64,
    /// Mutations dropped after a terminal rejection.
    pub rejected: u64,
    /// Conflicts merged automatically.
    pub conflicts_resolved: u64,
    /// Entities reconciled from pulls.
    pub pulled: u64,
    /// When the last drain or refresh finished without a storage failure.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Outcome counts of one [`SyncEngine::drain_once`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Mutations acknowledged.
    pub acked: usize,
    /// Mutations rescheduled after a retryable failure.
    pub rescheduled: usize,
    /// Mutations terminally rejected.
    pub rejected: usize,
    /// Mutations rebased after a conflict.
    pub rebased: usize,
    /// Claims released without sending because of cancellation.
    pub released: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Acked => self.acked += 1,
            Outcome::Rescheduled => self.rescheduled += 1,
            Outcome::Rejected => self.rejected += 1,
            Outcome::Rebased => self.rebased += 1,
            Outcome::Released => self.released += 1,
        }
    }

    fn merge(&mut self, other: &DrainReport) {
        self.acked += other.acked;
        self.rescheduled += other.rescheduled;
        self.rejected += other.rejected;
        self.rebased += other.rebased;
        self.released += other.released;
    }

    /// True if anything left the queue or became sendable again right away.
    fn made_progress(&self) -> bool {
        self.acked + self.rejected + self.rebased > 0
    }

    /// Total number of mutations the call dealt with.
    pub fn total(&self) -> usize {
        self.acked + self.rescheduled + self.rejected + self.rebased + self.released
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Acked,
    Rescheduled,
    Rejected,
    Rebased,
    Released,
}

/// Notifications about mutation outcomes, for status displays.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The server accepted a mutation.
    Acked {
        /// Sequence of the mutation.
        sequence: Sequence,
        /// Target entity.
        entity_id: EntityId,
    },
    /// A send failed and will be retried.
    Rescheduled {
        /// Sequence of the mutation.
        sequence: Sequence,
        /// Target entity.
        entity_id: EntityId,
        /// Failed attempts so far.
        attempt_count: u32,
        /// Wait before the next attempt.
        delay: Duration,
        /// Why the attempt failed.
        error: String,
    },
    /// The server refused a mutation; it was rolled back and dropped.
    Rejected {
        /// Sequence of the mutation.
        sequence: Sequence,
        /// Target entity.
        entity_id: EntityId,
        /// Why the server refused it.
        reason: RejectionReason,
    },
    /// A version conflict was merged and the mutation will be resent.
    ConflictResolved {
        /// Sequence of the mutation.
        sequence: Sequence,
        /// Target entity.
        entity_id: EntityId,
        /// Server version the mutation now builds on.
        server_version: Option<u64>,
    },
    /// Server changes were pulled into the local cache.
    Refreshed {
        /// Entities reconciled.
        changes: usize,
        /// New pull cursor.
        cursor: u64,
    },
}

/// Drives queued mutations to a [`RemoteStore`].
///
/// The engine shares the [`MutationQueue`] with the foreground path; it
/// never holds a queue lock across a network call, so enqueues are never
/// blocked by sends. Only storage failures are returned to the caller.
/// Everything the server says is turned into a queue outcome and a
/// [`SyncEvent`].
///
/// # Example
///
/// ```rust,no_run
/// use calsync_core::Replica;
/// use calsync_sync_engine::{connectivity, Connectivity, MockRemote, SyncConfig, SyncEngine};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() {
/// let replica = Replica::open_in_memory().unwrap();
/// let (_online, signal) = connectivity::channel(Connectivity::Online);
/// let engine = Arc::new(SyncEngine::new(
///     Arc::clone(replica.queue()),
///     Arc::new(MockRemote::new()),
///     signal,
///     SyncConfig::default(),
/// ));
///
/// let shutdown = CancellationToken::new();
/// let task = tokio::spawn({
///     let engine = Arc::clone(&engine);
///     let shutdown = shutdown.clone();
///     async move { engine.run(shutdown).await }
/// });
/// shutdown.cancel();
/// task.await.unwrap().unwrap();
/// # }
/// ```
pub struct SyncEngine<R: RemoteStore> {
    config: SyncConfig,
    queue: Arc<MutationQueue>,
    remote: Arc<R>,
    connectivity: watch::Receiver<Connectivity>,
    wake: Arc<Notify>,
    events: broadcast::Sender<SyncEvent>,
    state: RwLock<EngineState>,
    stats: RwLock<SyncStats>,
}

impl<R: RemoteStore> SyncEngine<R> {
    /// Creates an engine. It wakes whenever the queue gets a new mutation.
    pub fn new(
        queue: Arc<MutationQueue>,
        remote: Arc<R>,
        connectivity: watch::Receiver<Connectivity>,
        config: SyncConfig,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let listener = Arc::clone(&wake);
        queue.on_enqueue(move |_| listener.notify_one());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            config,
            queue,
            remote,
            connectivity,
            wake,
            events,
            state: RwLock::new(EngineState::Idle),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Returns the current engine state.
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Returns sync statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The queue being drained.
    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    /// The remote store.
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Subscribes to outcome events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Returns true if connectivity allows sending.
    pub fn is_online(&self) -> bool {
        self.connectivity.borrow().is_online()
    }

    /// Wakes the run loop early.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    fn set_state(&self, state: EngineState) {
        *self.state.write() = state;
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Sends every mutation that is due now, in rounds of up to
    /// `max_concurrent_sends` distinct entities.
    ///
    /// Returns without sending while offline. Stops early when cancelled; a
    /// send that has started is always allowed to finish and be recorded.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if an outcome could not be recorded. The affected
    /// mutation stays queued.
    pub async fn drain_once(&self, cancel: &CancellationToken) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        if !self.is_online() {
            self.set_state(EngineState::Paused);
            return Ok(report);
        }

        self.set_state(EngineState::Draining);
        let result = self.drain_rounds(cancel, &mut report).await;
        self.set_state(if self.is_online() {
            EngineState::Idle
        } else {
            EngineState::Paused
        });

        match result {
            Ok(()) => {
                if report.total() > 0 {
                    tracing::debug!(
                        acked = report.acked,
                        rescheduled = report.rescheduled,
                        rejected = report.rejected,
                        rebased = report.rebased,
                        "drain finished"
                    );
                }
                self.stats.write().last_sync_time = Some(Instant::now());
                Ok(report)
            }
            Err(err) => {
                self.stats.write().last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    async fn drain_rounds(
        &self,
        cancel: &CancellationToken,
        report: &mut DrainReport,
    ) -> SyncResult<()> {
        let limit = self.config.max_concurrent_sends.max(1);
        loop {
            if cancel.is_cancelled() || !self.is_online() {
                return Ok(());
            }
            let now = self.queue.clock().now();
            let claimed = self.queue.claim_ready(now, limit);
            if claimed.is_empty() {
                return Ok(());
            }

            // Claims are one per entity, so the round never sends twice for one entity.
            let results =
                join_all(claimed.into_iter().map(|mutation| self.deliver(mutation, cancel))).await;

            let mut round = DrainReport::default();
            let mut failure = None;
            for result in results {
                match result {
                    Ok(outcome) => round.record(outcome),
                    Err(err) => {
                        failure.get_or_insert(err);
                    }
                }
            }
            report.merge(&round);
            if let Some(err) = failure {
                return Err(err);
            }
            // Only retries left; they wait for their backoff.
            if !round.made_progress() {
                return Ok(());
            }
        }
    }

    /// Sends one claimed mutation and records the outcome.
    async fn deliver(&self, mutation: Mutation, cancel: &CancellationToken) -> SyncResult<Outcome> {
        if cancel.is_cancelled() {
            self.queue.release(mutation.sequence);
            return Ok(Outcome::Released);
        }

        let request = RemoteRequest::from_mutation(&mutation, self.queue.device_id());
        self.stats.write().sends += 1;
        tracing::trace!(sequence = %mutation.sequence, kind = %mutation.kind, "sending mutation");

        let response = tokio::time::timeout(self.config.request_timeout, self.remote.send(request));
        let outcome = match response.await {
            Ok(Ok(server_state)) => self.on_acked(&mutation, server_state),
            Ok(Err(error)) => self.on_failed(&mutation, classify(error)),
            Err(_elapsed) => self.on_failed(&mutation, Disposition::Retry(SyncError::Timeout)),
        };

        if let Err(err) = &outcome {
            tracing::error!(sequence = %mutation.sequence, %err, "failed to record send outcome");
            self.queue.release(mutation.sequence);
        }
        outcome
    }

    fn on_acked(&self, mutation: &Mutation, server_state: Option<Entity>) -> SyncResult<Outcome> {
        self.queue
            .ack_and_reconcile(mutation.sequence, server_state)?;
        self.stats.write().acked += 1;
        tracing::debug!(sequence = %mutation.sequence, entity_id = %mutation.entity_id, "mutation acked");
        self.emit(SyncEvent::Acked {
            sequence: mutation.sequence,
            entity_id: mutation.entity_id,
        });
        Ok(Outcome::Acked)
    }

    fn on_failed(&self, mutation: &Mutation, disposition: Disposition) -> SyncResult<Outcome> {
        match disposition {
            Disposition::Retry(error) => self.on_retryable(mutation, &error),
            Disposition::Reject(reason) => self.on_rejected(mutation, reason),
            Disposition::Rebase(server_state) => self.on_conflict(mutation, server_state),
        }
    }

    fn on_retryable(&self, mutation: &Mutation, error: &SyncError) -> SyncResult<Outcome> {
        let delay = self
            .config
            .retry
            .delay_with_hint(mutation.attempt_count, error.retry_after());
        let Some(updated) = self.queue.reschedule(mutation.sequence, delay)? else {
            return Ok(Outcome::Released);
        };

        {
            let mut stats = self.stats.write();
            stats.retries += 1;
            stats.last_error = Some(error.to_string());
        }
        tracing::warn!(
            sequence = %mutation.sequence,
            attempt = updated.attempt_count,
            delay_ms = delay.as_millis() as u64,
            %error,
            "send failed, will retry"
        );
        self.emit(SyncEvent::Rescheduled {
            sequence: mutation.sequence,
            entity_id: mutation.entity_id,
            attempt_count: updated.attempt_count,
            delay,
            error: error.to_string(),
        });
        Ok(Outcome::Rescheduled)
    }

    fn on_rejected(&self, mutation: &Mutation, reason: RejectionReason) -> SyncResult<Outcome> {
        let message = reason.to_string();
        if reason.is_not_found() {
            self.queue.reject_missing(mutation.sequence, &message)?;
        } else {
            self.queue.reject(mutation.sequence, &message)?;
        }

        {
            let mut stats = self.stats.write();
            stats.rejected += 1;
            stats.last_error = Some(SyncError::rejected(reason.clone()).to_string());
        }
        tracing::warn!(
            sequence = %mutation.sequence,
            entity_id = %mutation.entity_id,
            %reason,
            "mutation rejected"
        );
        self.emit(SyncEvent::Rejected {
            sequence: mutation.sequence,
            entity_id: mutation.entity_id,
            reason,
        });
        Ok(Outcome::Rejected)
    }

    fn on_conflict(&self, mutation: &Mutation, server_state: Entity) -> SyncResult<Outcome> {
        if mutation.conflicts >= self.config.max_conflict_retries {
            let reason = RejectionReason::UnresolvedConflict(format!(
                "still conflicting after {} rebases",
                mutation.conflicts
            ));
            return self.on_rejected(mutation, reason);
        }
        if server_state.id != mutation.entity_id
            || server_state.kind != mutation.kind.entity_kind()
        {
            let reason = RejectionReason::UnresolvedConflict(format!(
                "server holds a {} under this id",
                server_state.kind
            ));
            return self.on_rejected(mutation, reason);
        }

        let updated = match self.queue.rebase(mutation.sequence, server_state) {
            Ok(Some(updated)) => updated,
            Ok(None) => return Ok(Outcome::Released),
            Err(CoreError::MalformedPayload { message, .. }) => {
                return self.on_rejected(mutation, RejectionReason::UnresolvedConflict(message));
            }
            Err(err) => return Err(err.into()),
        };

        self.stats.write().conflicts_resolved += 1;
        tracing::info!(
            sequence = %mutation.sequence,
            entity_id = %mutation.entity_id,
            server_version = ?updated.base_version,
            "conflict resolved, resending on top of server state"
        );
        self.emit(SyncEvent::ConflictResolved {
            sequence: mutation.sequence,
            entity_id: mutation.entity_id,
            server_version: updated.base_version,
        });
        Ok(Outcome::Rebased)
    }

    /// Pulls server changes since the stored cursor into the local cache.
    ///
    /// Returns the number of entities reconciled.
    ///
    /// # Errors
    ///
    /// Returns the classified remote failure, or `Storage` if a change could
    /// not be recorded. The cursor only advances once every change is stored.
    pub async fn refresh(&self) -> SyncResult<usize> {
        let cursor = self.queue.cursor()?;
        let response = match tokio::time::timeout(
            self.config.request_timeout,
            self.remote.pull(cursor),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                return Err(match classify(error) {
                    Disposition::Retry(err) => err,
                    Disposition::Reject(reason) => SyncError::rejected(reason),
                    Disposition::Rebase(_) => SyncError::rejected(
                        RejectionReason::UnresolvedConflict("conflict reported on pull".into()),
                    ),
                })
            }
            Err(_elapsed) => return Err(SyncError::Timeout),
        };

        let mut applied = 0;
        for change in response.changes {
            match self
                .queue
                .reconcile(change.entity_id, change.kind, change.state)
            {
                Ok(_) => applied += 1,
                Err(err @ CoreError::MalformedPayload { .. }) => {
                    tracing::warn!(entity_id = %change.entity_id, %err, "skipping pulled change");
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.queue.set_cursor(response.cursor)?;

        {
            let mut stats = self.stats.write();
            stats.pulled += applied as u64;
            stats.last_sync_time = Some(Instant::now());
        }
        tracing::debug!(changes = applied, cursor = response.cursor, "refreshed from server");
        self.emit(SyncEvent::Refreshed {
            changes: applied,
            cursor: response.cursor,
        });
        Ok(applied)
    }

    /// Runs the sync loop until `shutdown` is cancelled.
    ///
    /// The loop drains the queue while online and sleeps otherwise. It wakes
    /// on a new enqueue, a connectivity change, the earliest retry time, the
    /// poll interval, or the refresh interval. Storage failures are logged and
    /// retried on the next wake-up; they do not stop the loop.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok` once cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> SyncResult<()> {
        tracing::info!(device_id = self.queue.device_id(), "sync engine started");
        let mut connectivity = self.connectivity.clone();
        let mut connectivity_open = true;
        let mut refresh = self.config.refresh_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let online = self.is_online();
            if online {
                if let Err(err) = self.drain_once(&shutdown).await {
                    tracing::error!(%err, "drain failed");
                }
            } else {
                self.set_state(EngineState::Paused);
            }
            let wait = self.next_wait(online);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                changed = connectivity.changed(), if connectivity_open => {
                    match changed {
                        Ok(()) => {
                            let now = *connectivity.borrow_and_update();
                            tracing::info!(connectivity = ?now, "connectivity changed");
                        }
                        Err(_) => connectivity_open = false,
                    }
                }
                _ = tokio::time::sleep(wait) => {}
                _ = next_tick(&mut refresh), if online => {
                    match self.refresh().await {
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(%err, "refresh failed");
                            self.stats.write().last_error = Some(err.to_string());
                        }
                    }
                }
            }
        }

        self.set_state(EngineState::Stopped);
        tracing::info!("sync engine stopped");
        Ok(())
    }

    /// Time until the loop should look at the queue again.
    fn next_wait(&self, online: bool) -> Duration {
        let poll = self.config.poll_interval;
        if !online {
            return poll;
        }
        match self.queue.next_due() {
            Some(due) => {
                let now = self.queue.clock().now();
                Duration::from_millis(due.saturating_sub(now))
                    .min(poll)
                    .max(MIN_WAIT)
            }
            None => poll,
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl<R: RemoteStore> std::fmt::Debug for SyncEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
