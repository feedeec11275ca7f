mod collision;
mod error;
mod mutations;
mod queries;
mod validate;

pub use error::{EngineError, TimespanError};
pub use validate::validate_timespan;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-written bytes don't leak into
    // the next batch; callers of this batch are told it failed.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: reservation id → resource id
    pub(super) reservation_to_resource: DashMap<Ulid, Ulid>,
    /// Ceiling on a single reservation.
    pub(super) max_span: Ms,
    /// Collision pruning window; `max_span` unless replayed data holds
    /// something longer.
    pub(super) prune_window: Ms,
    /// Mutations hold this shared for their whole duration; compaction takes
    /// it exclusively so no append lands between snapshot and swap.
    /// Always acquired before any resource lock.
    pub(super) write_gate: RwLock<()>,
}

/// Apply an event to a ResourceState. The caller holds its lock.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationCreated {
            id,
            resource_id,
            name,
            contact,
            remarks,
            span,
            owner,
            credential,
            at,
        } => {
            rs.insert_reservation(Reservation {
                id: *id,
                resource_id: *resource_id,
                name: name.clone(),
                contact: contact.clone(),
                remarks: remarks.clone(),
                span: *span,
                owner: owner.clone(),
                credential: credential.clone(),
                created_at: *at,
                updated_at: *at,
            });
            index.insert(*id, *resource_id);
        }
        Event::ReservationUpdated {
            id,
            name,
            contact,
            remarks,
            span,
            at,
            ..
        } => {
            // Remove + reinsert keeps the sort order when the span moves.
            if let Some(mut r) = rs.remove_reservation(*id) {
                r.name = name.clone();
                r.contact = contact.clone();
                r.remarks = remarks.clone();
                r.span = *span;
                r.updated_at = *at;
                rs.insert_reservation(r);
            }
        }
        Event::ReservationDeleted { id, .. } => {
            rs.remove_reservation(*id);
            index.remove(id);
        }
        Event::ResourceUpdated {
            name, remarks, at, ..
        } => {
            rs.name = name.clone();
            rs.remarks = remarks.clone();
            rs.updated_at = *at;
        }
        // ResourceCreated/Deleted are handled at the DashMap level, not here
        Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, max_span: Ms) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut engine = Self {
            state: DashMap::new(),
            wal_tx,
            reservation_to_resource: DashMap::new(),
            max_span,
            prune_window: max_span,
            write_gate: RwLock::new(()),
        };

        // Replay: we are the sole owner of these Arcs, so try_write never
        // contends. Never block here; this may run inside an async context.
        for event in &events {
            match event {
                Event::ResourceCreated {
                    id,
                    name,
                    remarks,
                    owner,
                    at,
                } => {
                    let rs = ResourceState::new(*id, name.clone(), remarks.clone(), owner.clone(), *at);
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                }
                Event::ResourceDeleted { id } => {
                    if let Some((_, rs)) = engine.state.remove(id)
                        && let Ok(guard) = rs.try_read()
                    {
                        for r in &guard.reservations {
                            engine.reservation_to_resource.remove(&r.id);
                        }
                    }
                }
                other => {
                    if let Some(resource_id) = event_resource_id(other)
                        && let Some(entry) = engine.state.get(&resource_id)
                        && let Ok(mut guard) = entry.value().try_write()
                    {
                        apply_to_resource(&mut guard, other, &engine.reservation_to_resource);
                    }
                }
            }
        }

        let widest = engine
            .state
            .iter()
            .filter_map(|e| e.value().try_read().ok().map(|g| g.widest_span()))
            .max()
            .unwrap_or(0);
        if widest > max_span {
            tracing::warn!(
                "stored reservation spans {widest}ms, above the configured max of {max_span}ms; widening collision window"
            );
            engine.prune_window = widest;
        }
        if !events.is_empty() {
            info!(
                "replayed {} events: {} resources, {} reservations",
                events.len(),
                engine.state.len(),
                engine.reservation_to_resource.len()
            );
        }

        Ok(engine)
    }

    pub fn max_span(&self) -> Ms {
        self.max_span
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_resource
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.reservation_to_resource);
        Ok(())
    }

    /// Acquire the resource write lock. Re-checks membership after the lock
    /// is taken so a concurrent delete is seen as `NotFound`.
    pub(super) async fn lock_resource(
        &self,
        resource_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.write_owned().await;
        if !self.state.contains_key(&resource_id) {
            return Err(EngineError::NotFound(resource_id));
        }
        Ok(guard)
    }

    /// Lookup reservation → resource, acquire the resource write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let resource_id = self
            .get_resource_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let guard = self.lock_resource(resource_id).await?;
        if guard.get_reservation(reservation_id).is_none() {
            return Err(EngineError::NotFound(*reservation_id));
        }
        Ok(guard)
    }
}

/// Extract the resource_id from an event (for non-Create/Delete events).
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationCreated { resource_id, .. }
        | Event::ReservationUpdated { resource_id, .. }
        | Event::ReservationDeleted { resource_id, .. } => Some(*resource_id),
        Event::ResourceUpdated { id, .. } => Some(*id),
        Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => None,
    }
}

pub(crate) fn denied(what: &str, id: Ulid) -> EngineError {
    metrics::counter!(crate::observability::DENIALS_TOTAL).increment(1);
    tracing::debug!("denied {what} on {id}");
    EngineError::Forbidden
}
