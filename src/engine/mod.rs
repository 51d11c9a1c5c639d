mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{merge_overlapping, subtract_intervals};
pub use error::EngineError;
pub use mutations::{NewReservation, ResourcePatch};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};
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
    Shutdown {
        response: oneshot::Sender<io::Result<()>>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let keep_running = match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut follow_up = None;

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            follow_up = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                match follow_up {
                    Some(other) => handle_non_append(&mut wal, other),
                    None => true,
                }
            }
            other => handle_non_append(&mut wal, other),
        };
        if !keep_running {
            break;
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Returns false once the writer should stop.
fn handle_non_append(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
            true
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
            true
        }
        WalCommand::Shutdown { response } => {
            let _ = response.send(wal.flush_sync());
            false
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
            true
        }
    }
}

/// The reservation store: per-resource state behind async RwLocks, made
/// durable by the WAL writer task.
///
/// Reads (availability checks, listings) take a resource's read lock and run
/// concurrently. Every mutation takes the resource's write lock for the whole
/// validate → WAL append → apply sequence, so two writers on one resource are
/// serialized and a checked slot cannot be taken between check and insert.
pub struct Engine {
    pub(super) state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: reservation id → resource id
    pub(super) reservation_index: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared; compaction holds it exclusively so no
    /// event can land between the state snapshot and the WAL swap.
    /// Always taken before any resource lock.
    pub(super) commit_gate: RwLock<()>,
}

/// Apply an event directly to a ResourceState (no locking — caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationCreated {
            id,
            resource_id,
            span,
            customer_name,
            customer_email,
            created_at,
        } => {
            rs.insert_reservation(Reservation {
                id: *id,
                resource_id: *resource_id,
                span: *span,
                status: ReservationStatus::Pending,
                customer_name: customer_name.clone(),
                customer_email: customer_email.clone(),
                created_at: *created_at,
            });
            index.insert(*id, *resource_id);
        }
        Event::ReservationStatusChanged { id, status, .. } => {
            if let Some(r) = rs.reservation_mut(*id) {
                r.status = *status;
            }
        }
        Event::ResourceUpdated {
            name,
            category,
            buffer_after,
            ..
        } => {
            rs.name = name.clone();
            rs.category = category.clone();
            rs.buffer_after = *buffer_after;
        }
        // ResourceCreated/Deleted are handled at the DashMap level, not here
        Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => {}
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the writer task.
    ///
    /// Must be called inside a tokio runtime. Pair with [`Engine::shutdown`].
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            reservation_index: DashMap::new(),
            commit_gate: RwLock::new(()),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly. Never use blocking_write here because this
        // runs inside an async context.
        for event in &events {
            match event {
                Event::ResourceCreated {
                    id,
                    name,
                    category,
                    buffer_after,
                } => {
                    let rs = ResourceState::new(*id, name.clone(), category.clone(), *buffer_after);
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                }
                Event::ResourceDeleted { id } => {
                    engine.forget_resource(id);
                }
                other => {
                    if let Some(resource_id) = event_resource_id(other)
                        && let Some(entry) = engine.state.get(&resource_id)
                    {
                        let rs_arc = entry.clone();
                        drop(entry);
                        if let Ok(mut guard) = rs_arc.try_write() {
                            apply_to_resource(&mut guard, other, &engine.reservation_index);
                        }
                    }
                }
            }
        }

        info!(
            events = events.len(),
            resources = engine.state.len(),
            reservations = engine.reservation_index.len(),
            "engine opened from {}",
            wal_path.display()
        );
        Ok(engine)
    }

    /// Flush the WAL and stop the writer. Later mutations fail with
    /// [`EngineError::Storage`]; reads keep working on in-memory state.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Shutdown { response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer already stopped".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        info!("engine shut down");
        Ok(())
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.reservation_index);
        Ok(())
    }

    /// Lookup reservation → resource, get resource, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .get_resource_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.clone().write_owned().await;
        self.ensure_current(resource_id, &rs)?;
        Ok((resource_id, guard))
    }

    /// `NotFound` unless `rs` is still the live state for `id`. A writer that
    /// queued behind `delete_resource` holds a handle the map no longer
    /// knows, and must not log events against it.
    pub(super) fn ensure_current(&self, id: Ulid, rs: &SharedResourceState) -> Result<(), EngineError> {
        if self.state.get(&id).is_some_and(|e| Arc::ptr_eq(e.value(), rs)) {
            Ok(())
        } else {
            Err(EngineError::NotFound(id))
        }
    }

    /// Clone out the resource handles so no DashMap shard guard is held
    /// across an await.
    pub(super) fn resource_handles(&self) -> Vec<SharedResourceState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }

    /// Drop a resource and its reservation index entries.
    pub(super) fn forget_resource(&self, id: &Ulid) {
        if let Some((_, rs)) = self.state.remove(id)
            && let Ok(guard) = rs.try_read()
        {
            for r in &guard.reservations {
                self.reservation_index.remove(&r.id);
            }
        }
    }
}

/// Extract the resource_id from an event (for non-Create/Delete events).
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationCreated { resource_id, .. }
        | Event::ReservationStatusChanged { resource_id, .. } => Some(*resource_id),
        Event::ResourceUpdated { id, .. } => Some(*id),
        Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => None,
    }
}
