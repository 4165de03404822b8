use std::collections::HashMap;

use tracing::{debug, warn};

use crate::limits::*;
use crate::model::*;
use crate::observability::{RELEASES_TOTAL, RESERVATIONS_TOTAL};

use super::occupancy::{check_coord, check_reservation, validate_request_id, validate_user_id};
use super::{Engine, EngineError, NewBooking, now_ms};

fn rejected(slot: &SlotKey, err: &EngineError) {
    debug!(%slot, "reservation rejected: {err}");
    metrics::counter!(RESERVATIONS_TOTAL, "outcome" => err.reason()).increment(1);
}

impl Engine {
    /// Take one seat on a slot, locking it to `occupancy` if it is empty.
    ///
    /// With a `request_id` already recorded on the slot for the same user and
    /// occupancy, nothing is booked and the current counters come back with
    /// `replayed` set. The same id under another user or occupancy is rejected.
    pub async fn reserve(
        &self,
        program_key: &ProgramKey,
        coord: SlotCoord,
        occupancy: OccupancyType,
        user_id: &str,
        request_id: Option<&str>,
    ) -> Result<ReserveOutcome, EngineError> {
        validate_user_id(user_id)?;
        validate_request_id(request_id)?;

        let _gate = self.commit_gate.read().await;
        let program = self
            .program(program_key)
            .ok_or_else(|| EngineError::ProgramNotFound(program_key.clone()))?;
        // Held until commit: the program cannot be deleted under a reservation.
        let meta = program.read().await;
        check_coord(&meta, &coord)?;

        let slot_key = SlotKey::new(program_key.clone(), coord);
        let shared = self
            .slot(&slot_key)
            .ok_or_else(|| EngineError::SlotNotFound(slot_key.clone()))?;
        let mut slot = shared.lock().await;

        if let Some(rid) = request_id
            && let Some(prev) = slot.find_request(rid)
        {
            if prev.user_id != user_id || prev.occupancy != occupancy {
                let err = EngineError::InvalidArgument(
                    "request id already used by another reservation".into(),
                );
                rejected(&slot_key, &err);
                return Err(err);
            }
            let locked_for = slot.locked_for.unwrap_or(prev.occupancy);
            debug!(slot = %slot_key, request_id = rid, "reservation replayed");
            metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "replayed").increment(1);
            return Ok(ReserveOutcome {
                booked_count: slot.booked_count,
                max_cap: locked_for
                    .capacity(meta.group_max)
                    .unwrap_or(slot.booked_count),
                locked_for,
                replayed: true,
            });
        }

        let max_cap = check_reservation(&slot, occupancy, meta.group_max)
            .inspect_err(|e| rejected(&slot_key, e))?;

        let event = Event::SlotReserved {
            slot: slot_key,
            entry: AuditEntry {
                user_id: user_id.to_string(),
                occupancy,
                at: now_ms(),
                request_id: request_id.map(str::to_string),
            },
        };
        self.persist_slot(&mut slot, &event).await?;
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "ok").increment(1);

        Ok(ReserveOutcome {
            booked_count: slot.booked_count,
            max_cap,
            locked_for: slot.locked_for.unwrap_or(occupancy),
            replayed: false,
        })
    }

    /// Reserve every slot in `coords` for one purchase, or none of them.
    ///
    /// Outcomes come back in the order of `coords`.
    pub async fn reserve_many(
        &self,
        program_key: &ProgramKey,
        coords: &[SlotCoord],
        occupancy: OccupancyType,
        user_id: &str,
    ) -> Result<Vec<ReserveOutcome>, EngineError> {
        validate_user_id(user_id)?;
        if coords.is_empty() {
            return Err(EngineError::InvalidArgument("no slots selected".into()));
        }
        if coords.len() > MAX_SLOTS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many slots in one booking"));
        }

        let _gate = self.commit_gate.read().await;
        let program = self
            .program(program_key)
            .ok_or_else(|| EngineError::ProgramNotFound(program_key.clone()))?;
        let meta = program.read().await;
        for coord in coords {
            check_coord(&meta, coord)?;
        }

        // Acquire slot locks in sorted order to prevent deadlocks.
        let mut sorted: Vec<SlotKey> = coords
            .iter()
            .map(|c| SlotKey::new(program_key.clone(), *c))
            .collect();
        sorted.sort();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(EngineError::InvalidArgument("slot selected twice".into()));
        }

        let mut guards = Vec::with_capacity(sorted.len());
        for key in &sorted {
            let shared = self
                .slot(key)
                .ok_or_else(|| EngineError::SlotNotFound(key.clone()))?;
            guards.push(shared.lock_owned().await);
        }

        // Phase 1: validate every slot before touching any.
        let mut caps = Vec::with_capacity(guards.len());
        for (key, guard) in sorted.iter().zip(&guards) {
            caps.push(
                check_reservation(guard, occupancy, meta.group_max)
                    .inspect_err(|e| rejected(key, e))?,
            );
        }

        // Phase 2: one WAL record, then apply to every held slot.
        let at = now_ms();
        let entries: Vec<(SlotKey, AuditEntry)> = sorted
            .iter()
            .map(|key| {
                let entry = AuditEntry {
                    user_id: user_id.to_string(),
                    occupancy,
                    at,
                    request_id: None,
                };
                (key.clone(), entry)
            })
            .collect();
        self.wal_append(&Event::BatchReserved {
            entries: entries.clone(),
        })
        .await?;

        let mut by_key = HashMap::with_capacity(entries.len());
        for ((key, entry), (guard, max_cap)) in entries.into_iter().zip(guards.iter_mut().zip(caps)) {
            guard.occupy(entry);
            by_key.insert(
                key,
                ReserveOutcome {
                    booked_count: guard.booked_count,
                    max_cap,
                    locked_for: guard.locked_for.unwrap_or(occupancy),
                    replayed: false,
                },
            );
        }
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "ok").increment(by_key.len() as u64);

        Ok(coords
            .iter()
            .filter_map(|c| by_key.get(&SlotKey::new(program_key.clone(), *c)).copied())
            .collect())
    }

    /// Give back one seat. Releasing an empty slot is a no-op.
    pub async fn release(
        &self,
        program_key: &ProgramKey,
        coord: SlotCoord,
        occupancy: OccupancyType,
        user_id: &str,
    ) -> Result<ReleaseOutcome, EngineError> {
        validate_user_id(user_id)?;

        let _gate = self.commit_gate.read().await;
        let program = self
            .program(program_key)
            .ok_or_else(|| EngineError::ProgramNotFound(program_key.clone()))?;
        let meta = program.read().await;
        check_coord(&meta, &coord)?;

        let slot_key = SlotKey::new(program_key.clone(), coord);
        let shared = self
            .slot(&slot_key)
            .ok_or_else(|| EngineError::SlotNotFound(slot_key.clone()))?;
        let mut slot = shared.lock().await;

        if slot.booked_count == 0 {
            debug!(slot = %slot_key, user_id, "release on empty slot");
            metrics::counter!(RELEASES_TOTAL, "outcome" => "noop").increment(1);
            return Ok(ReleaseOutcome {
                booked_count: 0,
                locked_for: None,
            });
        }

        if !slot
            .audit
            .iter()
            .any(|e| e.user_id == user_id && e.occupancy == occupancy)
        {
            warn!(slot = %slot_key, user_id, %occupancy, "release without a matching reservation");
        }

        let event = Event::SlotReleased {
            slot: slot_key,
            user_id: user_id.to_string(),
            occupancy,
        };
        self.persist_slot(&mut slot, &event).await?;
        metrics::counter!(RELEASES_TOTAL, "outcome" => "ok").increment(1);

        Ok(ReleaseOutcome {
            booked_count: slot.booked_count,
            locked_for: slot.locked_for,
        })
    }

    /// Reserve the booking's slots, then record it in the ledger.
    ///
    /// A ledger failure after the seats committed hands the seats back.
    pub async fn book_program(&self, req: NewBooking) -> Result<Booking, EngineError> {
        req.validate()?;
        self.reserve_many(&req.program, &req.slots, req.occupancy, &req.user_id)
            .await?;

        match self.create_booking(req.clone()).await {
            Ok(booking) => Ok(booking),
            Err(e) => {
                warn!(user_id = %req.user_id, program = %req.program, "booking failed after reservation, releasing seats: {e}");
                for coord in &req.slots {
                    if let Err(re) = self
                        .release(&req.program, *coord, req.occupancy, &req.user_id)
                        .await
                    {
                        warn!(slot = %coord, "compensating release failed: {re}");
                    }
                }
                Err(e)
            }
        }
    }
}
