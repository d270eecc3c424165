//! In-memory remote store for tests and local development.

use crate::remote::{PullResponse, RemoteChange, RemoteError, RemoteRequest, RemoteStore};
use async_trait::async_trait;
use calsync_core::{Entity, EntityId, EntityKind, Operation};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Default)]
struct ServerState {
    entities: HashMap<EntityId, Entity>,
    /// Kind of every entity ever stored, kept after deletion.
    kinds: HashMap<EntityId, EntityKind>,
    /// Response per idempotency key, replayed for duplicate deliveries.
    responses: HashMap<String, Result<Option<Entity>, RemoteError>>,
    /// `(cursor, entity)` for every applied change.
    changes: Vec<(u64, EntityId)>,
    /// Errors returned by the next sends, in order.
    script: VecDeque<RemoteError>,
    requests: Vec<RemoteRequest>,
    next_version: u64,
}

impl ServerState {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn store(&mut self, entity: Entity) {
        self.kinds.insert(entity.id, entity.kind);
        self.entities.insert(entity.id, entity);
    }

    fn record_change(&mut self, id: EntityId) {
        let cursor = self.changes.last().map_or(0, |(c, _)| *c) + 1;
        self.changes.push((cursor, id));
    }

    fn apply(&mut self, request: &RemoteRequest) -> Result<Option<Entity>, RemoteError> {
        let kind = request.kind.entity_kind();
        let existing = self.entities.get(&request.entity_id).cloned();

        if let Some(current) = &existing {
            if current.kind != kind {
                return Err(RemoteError::status(422, "entity kind mismatch"));
            }
            if let Some(base) = request.base_version {
                if current.version.is_some_and(|v| v > base) {
                    return Err(RemoteError::Conflict {
                        server_state: current.clone(),
                    });
                }
            }
        }

        match (request.kind.operation(), existing) {
            // A create that has seen the current version replaces the fields.
            (Operation::Create, Some(current)) if request.base_version.is_some() => {
                let version = self.bump();
                let entity = Entity::new(current.id, kind, request.payload.clone())
                    .with_version(version);
                self.store(entity.clone());
                self.record_change(request.entity_id);
                Ok(Some(entity))
            }
            (Operation::Create, Some(current)) => Err(RemoteError::Conflict {
                server_state: current,
            }),
            (Operation::Create, None) => {
                let version = self.bump();
                let entity = Entity::new(request.entity_id, kind, request.payload.clone())
                    .with_version(version);
                self.store(entity.clone());
                self.record_change(request.entity_id);
                Ok(Some(entity))
            }
            (Operation::Update, Some(mut current)) => {
                for (name, value) in &request.payload {
                    if value.is_null() {
                        current.fields.remove(name);
                    } else {
                        current.fields.insert(name.clone(), value.clone());
                    }
                }
                current.version = Some(self.bump());
                self.store(current.clone());
                self.record_change(request.entity_id);
                Ok(Some(current))
            }
            (Operation::Delete, Some(_)) => {
                self.entities.remove(&request.entity_id);
                self.record_change(request.entity_id);
                Ok(None)
            }
            (Operation::Update | Operation::Delete, None) => {
                Err(RemoteError::status(404, "no such entity"))
            }
        }
    }
}

/// A well-behaved server kept in memory.
///
/// Sends are deduplicated by idempotency key and checked against the stored
/// version, so conflicts surface the way a real server reports them.
/// Failures can be scripted ahead of time, and the whole server can be taken
/// offline.
pub struct MockRemote {
    state: Mutex<ServerState>,
    connected: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MockRemote {
    /// Creates an empty, reachable server.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            connected: AtomicBool::new(true),
            latency: Mutex::new(None),
        }
    }

    /// Sets whether the server is reachable.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Makes the next send fail with `error`. Queued failures are used in order.
    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().script.push_back(error);
    }

    /// Stores an entity as if another device had written it. Returns the
    /// stored state with its new version.
    pub fn put_remote(&self, entity: Entity) -> Entity {
        let mut state = self.state.lock();
        let version = state.bump();
        let entity = entity.with_version(version);
        state.store(entity.clone());
        state.record_change(entity.id);
        entity
    }

    /// Deletes an entity as if another device had done it.
    pub fn delete_remote(&self, id: EntityId) {
        let mut state = self.state.lock();
        if state.entities.remove(&id).is_some() {
            state.record_change(id);
        }
    }

    /// Current server state of an entity.
    pub fn entity(&self, id: EntityId) -> Option<Entity> {
        self.state.lock().entities.get(&id).cloned()
    }

    /// Every request received while connected, in arrival order.
    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.state.lock().requests.clone()
    }

    /// Number of requests received while connected.
    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_connected(&self) -> Result<(), RemoteError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::network("server unreachable"))
        }
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn send(&self, request: RemoteRequest) -> Result<Option<Entity>, RemoteError> {
        self.check_connected()?;
        self.simulate_latency().await;

        let mut state = self.state.lock();
        state.requests.push(request.clone());
        if let Some(error) = state.script.pop_front() {
            return Err(error);
        }
        if let Some(previous) = state.responses.get(&request.idempotency_key) {
            return previous.clone();
        }

        let response = state.apply(&request);
        // Conflicts are not final; the client resends the same key after rebasing.
        if !matches!(response, Err(RemoteError::Conflict { .. })) {
            state
                .responses
                .insert(request.idempotency_key.clone(), response.clone());
        }
        response
    }

    async fn pull(&self, cursor: u64) -> Result<PullResponse, RemoteError> {
        self.check_connected()?;
        self.simulate_latency().await;

        let state = self.state.lock();
        let mut seen = Vec::new();
        for (_, id) in state.changes.iter().filter(|(c, _)| *c > cursor) {
            if !seen.contains(id) {
                seen.push(*id);
            }
        }
        let changes = seen
            .into_iter()
            .filter_map(|id| {
                Some(RemoteChange {
                    entity_id: id,
                    kind: *state.kinds.get(&id)?,
                    state: state.entities.get(&id).cloned(),
                })
            })
            .collect();
        let cursor = state.changes.last().map_or(cursor, |(c, _)| *c);
        Ok(PullResponse { changes, cursor })
    }
}

impl std::fmt::Debug for MockRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockRemote")
            .field("entities", &state.entities.len())
            .field("requests", &state.requests.len())
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
