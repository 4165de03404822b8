mod capacity;
mod error;
mod grants;
mod lifecycle;
mod occupancy;
mod programs;
mod queries;

pub use error::{EngineError, ErrorKind};
pub use lifecycle::NewBooking;
pub use occupancy::{check_reservation, current_max_cap};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{error, warn};
use ulid::Ulid;

use crate::model::*;
use crate::outbox::Outbox;
use crate::wal::Wal;

pub type SharedProgram = Arc<RwLock<Program>>;
pub type SharedSlot = Arc<Mutex<SlotState>>;
pub type SharedBooking = Arc<RwLock<Booking>>;

/// Wall clock in unix milliseconds.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that arrive while a flush is pending share one fsync.
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
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // Every caller hears Err, so none of the batch may survive on disk.
    if let Err(e) = &result {
        warn!("WAL batch of {} failed, rolling back: {e}", batch.len());
        if let Err(rollback) = wal.rollback() {
            error!("WAL rollback failed: {rollback}");
        }
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Per-tenant knobs that are not part of the stored state.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Shared secret for the on-demand sweep. `None` disables it.
    pub admin_secret: Option<String>,
    /// Most grants deleted per WAL record during a sweep.
    pub sweep_batch_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            admin_secret: None,
            sweep_batch_size: 500,
        }
    }
}

/// One tenant's slot store, booking ledger and granted-access records.
///
/// Program metadata and slot capacity live in separate maps: a slot is its own
/// unit of concurrency control, so metadata edits never contend with bookings
/// on unrelated slots.
pub struct Engine {
    pub(super) programs: DashMap<ProgramKey, SharedProgram>,
    pub(super) slots: DashMap<SlotKey, SharedSlot>,
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    pub(super) grants: DashMap<GrantKey, Grant>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every mutation, exclusively by compaction.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes program creation and deletion.
    pub(super) catalog_lock: Mutex<()>,
    /// Serializes writes to granted-access records.
    pub(super) grant_lock: Mutex<()>,
    pub(super) options: EngineOptions,
    pub outbox: Outbox,
}

impl Engine {
    pub fn new(wal_path: PathBuf, outbox: Outbox, options: EngineOptions) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_bytes > 0 {
            warn!(
                path = %wal_path.display(),
                bytes = replay.discarded_bytes,
                "discarded torn WAL tail"
            );
        }
        let mut wal = Wal::open(&wal_path)?;
        if replay.discarded_bytes > 0 {
            wal.truncate_tail(replay.discarded_bytes)?;
        }
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            programs: DashMap::new(),
            slots: DashMap::new(),
            bookings: DashMap::new(),
            grants: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            catalog_lock: Mutex::new(()),
            grant_lock: Mutex::new(()),
            options,
            outbox,
        };

        // Nothing else holds these locks yet, so try_* always succeeds.
        // Blocking variants are off limits: this may run inside the runtime.
        for event in replay.events {
            engine.replay_event(event)?;
        }
        Ok(engine)
    }

    fn replay_event(&self, event: Event) -> io::Result<()> {
        let contended = || io::Error::other("replay: unexpected lock contention");
        match event {
            Event::ProgramCreated {
                key,
                mode,
                group_max,
                topology,
            } => {
                let program = Program {
                    key: key.clone(),
                    mode,
                    group_max,
                    topology: SlotTopology::empty(topology),
                };
                self.programs.insert(key, Arc::new(RwLock::new(program)));
            }
            Event::ProgramDeleted { key } => self.forget_program(&key),
            Event::ProgramUpdated { ref key, .. }
            | Event::SlotAdded { ref key, .. }
            | Event::PatternCellAdded { ref key, .. } => {
                if let Some(program) = self.program(key) {
                    let mut guard = program.try_write().map_err(|_| contended())?;
                    self.apply_to_program(&mut guard, &event);
                }
            }
            Event::SlotReserved { ref slot, .. }
            | Event::SlotReleased { ref slot, .. }
            | Event::SlotRestored { ref slot, .. } => {
                if let Some(shared) = self.slot(slot) {
                    let mut guard = shared.try_lock().map_err(|_| contended())?;
                    apply_to_slot(&mut guard, &event);
                }
            }
            Event::BatchReserved { ref entries } => {
                for (key, entry) in entries {
                    if let Some(shared) = self.slot(key) {
                        shared.try_lock().map_err(|_| contended())?.occupy(entry.clone());
                    }
                }
            }
            Event::BookingCreated { booking } => {
                self.bookings
                    .insert(booking.id, Arc::new(RwLock::new(*booking)));
            }
            Event::BookingTransitioned {
                id,
                to,
                on,
                reason,
                ..
            } => {
                if let Some(shared) = self.booking(&id) {
                    shared
                        .try_write()
                        .map_err(|_| contended())?
                        .apply_transition(to, on, reason);
                }
            }
            Event::GrantIssued { grant } => {
                self.grants.insert(grant.key.clone(), grant);
            }
            Event::GrantsRevoked { keys } => {
                for key in &keys {
                    self.grants.remove(key);
                }
            }
        }
        Ok(())
    }

    /// Structural program events. Caller holds the program write lock.
    pub(super) fn apply_to_program(&self, program: &mut Program, event: &Event) {
        match event {
            Event::ProgramUpdated {
                mode, group_max, ..
            } => {
                program.mode = *mode;
                program.group_max = *group_max;
            }
            Event::SlotAdded { key, slot } => {
                if let SlotTopology::Discrete(slots) = &mut program.topology {
                    slots.push(*slot);
                    let slot_key = SlotKey::new(key.clone(), SlotCoord::Dated(*slot));
                    self.slots.insert(
                        slot_key.clone(),
                        Arc::new(Mutex::new(SlotState::new(slot_key, None))),
                    );
                }
            }
            Event::PatternCellAdded { key, row, time } => {
                if let SlotTopology::Recurring(rows) = &mut program.topology {
                    let r = *row as usize;
                    if rows.len() <= r {
                        rows.resize_with(r + 1, Vec::new);
                    }
                    rows[r].push(*time);
                    let coord = SlotCoord::Cell {
                        row: *row,
                        time_index: (rows[r].len() - 1) as u32,
                    };
                    let slot_key = SlotKey::new(key.clone(), coord);
                    self.slots.insert(
                        slot_key.clone(),
                        Arc::new(Mutex::new(SlotState::new(slot_key, Some(*time)))),
                    );
                }
            }
            _ => {}
        }
    }

    /// Drop a program and every slot it owns from memory.
    pub(super) fn forget_program(&self, key: &ProgramKey) {
        self.programs.remove(key);
        self.slots.retain(|slot_key, _| &slot_key.program != key);
    }

    pub(super) fn program(&self, key: &ProgramKey) -> Option<SharedProgram> {
        self.programs.get(key).map(|e| e.value().clone())
    }

    pub(super) fn slot(&self, key: &SlotKey) -> Option<SharedSlot> {
        self.slots.get(key).map(|e| e.value().clone())
    }

    pub(super) fn booking(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    /// Durably append one event via the group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    /// WAL-append, then apply to the locked slot.
    pub(super) async fn persist_slot(
        &self,
        slot: &mut SlotState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_slot(slot, event);
        Ok(())
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.snapshot_events().await;

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let mut programs: Vec<SharedProgram> =
            self.programs.iter().map(|e| e.value().clone()).collect();
        let mut keyed = Vec::with_capacity(programs.len());
        for program in programs.drain(..) {
            let key = program.read().await.key.clone();
            keyed.push((key, program));
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, program) in keyed {
            let guard = program.read().await;
            events.push(Event::ProgramCreated {
                key: key.clone(),
                mode: guard.mode,
                group_max: guard.group_max,
                topology: guard.topology.kind(),
            });
            match &guard.topology {
                SlotTopology::Discrete(slots) => {
                    for slot in slots {
                        events.push(Event::SlotAdded {
                            key: key.clone(),
                            slot: *slot,
                        });
                    }
                }
                SlotTopology::Recurring(rows) => {
                    for (row, cells) in rows.iter().enumerate() {
                        for time in cells {
                            events.push(Event::PatternCellAdded {
                                key: key.clone(),
                                row: row as u32,
                                time: *time,
                            });
                        }
                    }
                }
            }
            for coord in guard.topology.coords() {
                let slot_key = SlotKey::new(key.clone(), coord);
                let Some(shared) = self.slot(&slot_key) else {
                    continue;
                };
                let slot = shared.lock().await;
                if slot.booked_count > 0 || !slot.audit.is_empty() {
                    events.push(Event::SlotRestored {
                        slot: slot_key,
                        booked_count: slot.booked_count,
                        locked_for: slot.locked_for,
                        audit: slot.audit.clone(),
                    });
                }
            }
        }

        let bookings: Vec<SharedBooking> =
            self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut ledger = Vec::with_capacity(bookings.len());
        for shared in bookings {
            ledger.push(shared.read().await.clone());
        }
        ledger.sort_by_key(|b| b.id);
        events.extend(ledger.into_iter().map(|b| Event::BookingCreated {
            booking: Box::new(b),
        }));

        let mut grants: Vec<Grant> = self.grants.iter().map(|e| e.value().clone()).collect();
        grants.sort_by(|a, b| a.key.cmp(&b.key));
        events.extend(grants.into_iter().map(|grant| Event::GrantIssued { grant }));

        events
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Capacity events. Caller holds the slot lock.
fn apply_to_slot(slot: &mut SlotState, event: &Event) {
    match event {
        Event::SlotReserved { entry, .. } => slot.occupy(entry.clone()),
        Event::SlotReleased {
            user_id, occupancy, ..
        } => {
            slot.vacate(user_id, *occupancy);
        }
        Event::SlotRestored {
            booked_count,
            locked_for,
            audit,
            ..
        } => {
            slot.booked_count = *booked_count;
            slot.locked_for = *locked_for;
            slot.audit = audit.clone();
        }
        _ => {}
    }
}
