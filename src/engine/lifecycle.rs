use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::LIFECYCLE_TRANSITIONS_TOTAL;
use crate::outbox::{Fact, REFUND_REASON_MIN_GROUP};

use super::occupancy::validate_user_id;
use super::{Engine, EngineError, now_ms};

/// A confirmed purchase, as handed over by the payment path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub user_id: String,
    pub program: ProgramKey,
    pub occupancy: OccupancyType,
    pub slots: Vec<SlotCoord>,
    /// Participants a group needs by `waiting_period_end` to go ahead.
    pub min_persons: Option<u32>,
    pub waiting_period_end: Option<NaiveDate>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub payment_ref: Option<String>,
    pub amount_cents: Option<i64>,
}

impl NewBooking {
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_user_id(&self.user_id)?;
        if self.slots.is_empty() {
            return Err(EngineError::InvalidArgument("no slots selected".into()));
        }
        if self.slots.len() > MAX_SLOTS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many slots in one booking"));
        }
        if self.end_date < self.start_date {
            return Err(EngineError::InvalidArgument(format!(
                "end date {} is before start date {}",
                self.end_date, self.start_date
            )));
        }
        if let Some(r) = &self.payment_ref
            && r.len() > MAX_PAYMENT_REF_LEN
        {
            return Err(EngineError::LimitExceeded("payment reference too long"));
        }
        if self.amount_cents.is_some_and(|a| a < 0) {
            return Err(EngineError::InvalidArgument("negative amount".into()));
        }
        match (self.min_persons, self.waiting_period_end) {
            (None, None) => Ok(()),
            (Some(_), _) if self.occupancy != OccupancyType::Group => Err(
                EngineError::InvalidArgument("minimum group size applies to group bookings only".into()),
            ),
            (Some(0), _) => Err(EngineError::InvalidArgument(
                "minimum group size must be at least 1".into(),
            )),
            (Some(n), _) if n > MAX_GROUP_SIZE => {
                Err(EngineError::LimitExceeded("minimum group size too large"))
            }
            (Some(_), None) => Err(EngineError::InvalidArgument(
                "minimum group size needs a waiting period end".into(),
            )),
            (None, Some(_)) => Err(EngineError::InvalidArgument(
                "waiting period end needs a minimum group size".into(),
            )),
            (Some(_), Some(_)) => Ok(()),
        }
    }

    /// Group bookings with a threshold wait; everything else starts active.
    fn initial_status(&self) -> BookingStatus {
        if self.min_persons.is_some() {
            BookingStatus::Waiting
        } else {
            BookingStatus::Active
        }
    }
}

impl Engine {
    /// Append a confirmed purchase to the ledger.
    pub async fn create_booking(&self, req: NewBooking) -> Result<Booking, EngineError> {
        req.validate()?;
        let _gate = self.commit_gate.read().await;
        let program = self
            .program(&req.program)
            .ok_or_else(|| EngineError::ProgramNotFound(req.program.clone()))?;
        let mode = program.read().await.mode;

        let status = req.initial_status();
        let booking = Booking {
            id: Ulid::new(),
            user_id: req.user_id,
            program: req.program,
            mode,
            occupancy: req.occupancy,
            selected_slots: req.slots,
            status,
            min_persons: req.min_persons,
            waiting_period_end: req.waiting_period_end,
            start_date: req.start_date,
            end_date: req.end_date,
            actual_start_date: None,
            refund_date: None,
            refund_reason: None,
            completed_date: None,
            payment_ref: req.payment_ref,
            amount_cents: req.amount_cents,
            created_at: now_ms(),
        };

        self.wal_append(&Event::BookingCreated {
            booking: Box::new(booking.clone()),
        })
        .await?;
        self.bookings
            .insert(booking.id, Arc::new(RwLock::new(booking.clone())));
        info!(booking = %booking.id, user_id = %booking.user_id, program = %booking.program, %status, "booking created");

        if status == BookingStatus::Active {
            self.outbox.publish(Fact::BookingConfirmed(booking.clone()));
        }
        Ok(booking)
    }

    /// Move a booking from `expected` to `next`, only if it is still in `expected`.
    ///
    /// Returns `false` when another writer already moved it on.
    pub async fn transition_booking(
        &self,
        id: Ulid,
        expected: BookingStatus,
        next: BookingStatus,
        on: NaiveDate,
        reason: Option<String>,
    ) -> Result<bool, EngineError> {
        Ok(self
            .try_transition(id, expected, next, on, reason)
            .await?
            .is_some())
    }

    async fn try_transition(
        &self,
        id: Ulid,
        expected: BookingStatus,
        next: BookingStatus,
        on: NaiveDate,
        reason: Option<String>,
    ) -> Result<Option<Booking>, EngineError> {
        if !expected.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                id,
                from: expected,
                to: next,
            });
        }
        let _gate = self.commit_gate.read().await;
        let shared = self.booking(&id).ok_or(EngineError::BookingNotFound(id))?;
        let mut booking = shared.write().await;
        if booking.status != expected {
            debug!(booking = %id, status = %booking.status, %expected, "transition skipped");
            return Ok(None);
        }

        let event = Event::BookingTransitioned {
            id,
            from: expected,
            to: next,
            on,
            reason: reason.clone(),
        };
        self.wal_append(&event).await?;
        booking.apply_transition(next, on, reason);
        metrics::counter!(LIFECYCLE_TRANSITIONS_TOTAL, "to" => next.as_str()).increment(1);
        Ok(Some(booking.clone()))
    }

    /// Decide every waiting booking whose waiting period ended on or before `as_of`.
    pub async fn process_waiting_periods(&self, as_of: NaiveDate) -> TickReport {
        let mut report = TickReport::default();
        let ledger = self.ledger_snapshot().await;

        let due = ledger.iter().filter(|b| {
            b.status == BookingStatus::Waiting
                && b.waiting_period_end.is_some_and(|end| end <= as_of)
        });
        for booking in due {
            let others = ledger
                .iter()
                .filter(|o| {
                    o.id != booking.id
                        && o.status.is_live()
                        && o.same_offering(booking)
                        && o.shares_slot_with(booking)
                })
                .count() as u32;
            let needed = booking.min_persons.unwrap_or(1);
            let (next, reason) = if 1 + others >= needed {
                (BookingStatus::Active, None)
            } else {
                (
                    BookingStatus::Refunded,
                    Some(REFUND_REASON_MIN_GROUP.to_string()),
                )
            };

            match self
                .try_transition(booking.id, BookingStatus::Waiting, next, as_of, reason)
                .await
            {
                Ok(Some(updated)) => {
                    info!(booking = %updated.id, participants = 1 + others, needed, status = %next, "waiting period resolved");
                    if next == BookingStatus::Active {
                        report.activated += 1;
                        self.outbox.publish(Fact::BookingActivated(updated));
                    } else {
                        report.refunded += 1;
                        self.outbox.publish(Fact::BookingRefunded(updated));
                    }
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(booking = %booking.id, "waiting period resolution failed: {e}");
                }
            }
        }
        report
    }

    /// Complete every active booking whose end date is before `as_of`.
    pub async fn cleanup_expired_bookings(&self, as_of: NaiveDate) -> TickReport {
        let mut report = TickReport::default();
        let ledger = self.ledger_snapshot().await;

        for booking in ledger
            .iter()
            .filter(|b| b.status == BookingStatus::Active && b.end_date < as_of)
        {
            match self
                .try_transition(
                    booking.id,
                    BookingStatus::Active,
                    BookingStatus::Completed,
                    as_of,
                    None,
                )
                .await
            {
                Ok(Some(updated)) => {
                    report.completed += 1;
                    self.outbox.publish(Fact::BookingCompleted(updated));
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(booking = %booking.id, "completion failed: {e}");
                }
            }
        }
        report
    }

    /// One scheduled lifecycle run: resolve waiting periods, then complete ended bookings.
    pub async fn process_lifecycle_tick(&self, as_of: NaiveDate) -> TickReport {
        let waiting = self.process_waiting_periods(as_of).await;
        let cleanup = self.cleanup_expired_bookings(as_of).await;
        let report = TickReport {
            activated: waiting.activated,
            refunded: waiting.refunded,
            completed: cleanup.completed,
            skipped: waiting.skipped + cleanup.skipped,
            failed: waiting.failed + cleanup.failed,
        };
        if report != TickReport::default() {
            info!(
                %as_of,
                activated = report.activated,
                refunded = report.refunded,
                completed = report.completed,
                skipped = report.skipped,
                failed = report.failed,
                "lifecycle tick"
            );
        }
        report
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let shared = self.booking(&id).ok_or(EngineError::BookingNotFound(id))?;
        let booking = shared.read().await;
        Ok(booking.clone())
    }

    /// Bookings in creation order, optionally narrowed by user and status.
    pub async fn list_bookings(
        &self,
        user_id: Option<&str>,
        status: Option<BookingStatus>,
    ) -> Vec<Booking> {
        self.ledger_snapshot()
            .await
            .into_iter()
            .filter(|b| user_id.is_none_or(|u| b.user_id == u))
            .filter(|b| status.is_none_or(|s| b.status == s))
            .collect()
    }

    /// Point-in-time copy of the ledger, ordered by booking id.
    async fn ledger_snapshot(&self) -> Vec<Booking> {
        let shared: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut ledger = Vec::with_capacity(shared.len());
        for booking in shared {
            ledger.push(booking.read().await.clone());
        }
        ledger.sort_by_key(|b| b.id);
        ledger
    }
}
