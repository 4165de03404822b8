use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::adapters::{Adapters, CalendarEvent, Channel, Notification, RefundRequest};
use crate::model::Booking;

pub const REFUND_REASON_MIN_GROUP: &str = "minimum group size not reached";

/// A committed ledger decision, handed to collaborators by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fact {
    /// Created straight into `active` (no waiting period).
    BookingConfirmed(Booking),
    BookingActivated(Booking),
    BookingRefunded(Booking),
    BookingCompleted(Booking),
}

impl Fact {
    fn booking(&self) -> &Booking {
        match self {
            Fact::BookingConfirmed(b)
            | Fact::BookingActivated(b)
            | Fact::BookingRefunded(b)
            | Fact::BookingCompleted(b) => b,
        }
    }

    fn template(&self) -> &'static str {
        match self {
            Fact::BookingConfirmed(_) => "booking_confirmed",
            Fact::BookingActivated(_) => "booking_activated",
            Fact::BookingRefunded(_) => "booking_refunded",
            Fact::BookingCompleted(_) => "booking_completed",
        }
    }
}

/// Post-commit queue. Publishing never waits on a collaborator.
pub struct Outbox {
    tx: mpsc::UnboundedSender<Fact>,
}

impl Outbox {
    /// Start the dispatcher task for `adapters`.
    pub fn spawn(adapters: Adapters) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatcher(rx, adapters));
        Self { tx }
    }

    pub fn publish(&self, fact: Fact) {
        if self.tx.send(fact).is_err() {
            warn!("outbox dispatcher stopped; dropping fact");
        }
    }
}

async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<Fact>, adapters: Adapters) {
    while let Some(fact) = rx.recv().await {
        dispatch(&adapters, &fact).await;
    }
}

fn adapter_failed(adapter: &'static str, booking: &Booking, err: &dyn std::fmt::Display) {
    warn!(booking = %booking.id, adapter, "collaborator call failed: {err}");
    metrics::counter!(crate::observability::ADAPTER_FAILURES_TOTAL, "adapter" => adapter)
        .increment(1);
}

/// Fan one fact out to every collaborator it concerns. Failures are logged only.
pub async fn dispatch(adapters: &Adapters, fact: &Fact) {
    let booking = fact.booking();

    let mut variables = BTreeMap::new();
    variables.insert("program", booking.program.title.clone());
    variables.insert("occupancy", booking.occupancy.to_string());
    variables.insert("start_date", booking.start_date.to_string());
    variables.insert("end_date", booking.end_date.to_string());
    if let Some(reason) = &booking.refund_reason {
        variables.insert("reason", reason.clone());
    }

    for channel in [Channel::Email, Channel::WhatsApp] {
        let notification = Notification {
            channel,
            recipient: booking.user_id.clone(),
            template: fact.template(),
            variables: variables.clone(),
        };
        match adapters.notifications.send(&notification).await {
            Ok(status) => debug!(booking = %booking.id, ?status, channel = channel.as_str(), "notified"),
            Err(e) => adapter_failed("notification", booking, &e),
        }
    }

    match fact {
        Fact::BookingRefunded(_) => match (&booking.payment_ref, booking.amount_cents) {
            (Some(payment_ref), Some(amount_cents)) => {
                let request = RefundRequest {
                    payment_ref: payment_ref.clone(),
                    amount_cents,
                };
                if let Err(e) = adapters.payments.refund(&request).await {
                    adapter_failed("payment", booking, &e);
                }
            }
            _ => warn!(booking = %booking.id, "refunded booking has no payment reference"),
        },
        Fact::BookingConfirmed(_) | Fact::BookingActivated(_) => {
            for slot in &booking.selected_slots {
                let event = CalendarEvent {
                    program: booking.program.clone(),
                    slot: *slot,
                    mode: booking.mode,
                    attendee: booking.user_id.clone(),
                };
                if let Err(e) = adapters.calendar.create_event(&event).await {
                    adapter_failed("calendar", booking, &e);
                }
            }
        }
        Fact::BookingCompleted(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    use super::*;
    use crate::adapters::testing::RecordingAdapter;
    use crate::model::*;

    fn booking(status: BookingStatus) -> Booking {
        let d = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let t = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap();
        Booking {
            id: Ulid::new(),
            user_id: "user-a".into(),
            program: ProgramKey::new(Catalog::Live, "Sunrise Yoga"),
            mode: Mode::Online,
            occupancy: OccupancyType::Group,
            selected_slots: vec![
                SlotCoord::Dated(SlotRef::new(d, t(7), t(8))),
                SlotCoord::Dated(SlotRef::new(d, t(9), t(10))),
            ],
            status,
            min_persons: Some(3),
            waiting_period_end: Some(d),
            start_date: d,
            end_date: d,
            actual_start_date: None,
            refund_date: None,
            refund_reason: None,
            completed_date: None,
            payment_ref: Some("pay_123".into()),
            amount_cents: Some(4_500),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn refund_notifies_both_channels_and_requests_refund() {
        let rec = Arc::new(RecordingAdapter::default());
        let mut b = booking(BookingStatus::Refunded);
        b.refund_reason = Some(REFUND_REASON_MIN_GROUP.into());
        dispatch(&RecordingAdapter::adapters(&rec), &Fact::BookingRefunded(b)).await;

        assert_eq!(rec.templates(), vec!["booking_refunded", "booking_refunded"]);
        let refunds = rec.refunds.lock().unwrap().clone();
        assert_eq!(
            refunds,
            vec![RefundRequest {
                payment_ref: "pay_123".into(),
                amount_cents: 4_500
            }]
        );
        let notes = rec.notifications.lock().unwrap();
        assert_eq!(notes[0].channel, Channel::Email);
        assert_eq!(notes[1].channel, Channel::WhatsApp);
        assert_eq!(notes[0].variables["reason"], REFUND_REASON_MIN_GROUP);
    }

    #[tokio::test]
    async fn activation_creates_one_calendar_event_per_slot() {
        let rec = Arc::new(RecordingAdapter::default());
        dispatch(
            &RecordingAdapter::adapters(&rec),
            &Fact::BookingActivated(booking(BookingStatus::Active)),
        )
        .await;
        assert_eq!(rec.events.lock().unwrap().len(), 2);
        assert!(rec.refunds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let rec = Arc::new(RecordingAdapter::failing());
        dispatch(
            &RecordingAdapter::adapters(&rec),
            &Fact::BookingRefunded(booking(BookingStatus::Refunded)),
        )
        .await;
        // Every collaborator was still attempted.
        assert_eq!(rec.notifications.lock().unwrap().len(), 2);
        assert_eq!(rec.refunds.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn published_facts_reach_the_dispatcher() {
        let rec = Arc::new(RecordingAdapter::default());
        let outbox = Outbox::spawn(RecordingAdapter::adapters(&rec));
        outbox.publish(Fact::BookingCompleted(booking(BookingStatus::Completed)));
        assert!(rec.wait_until(|r| r.templates().len() == 2).await);
        assert_eq!(rec.templates()[0], "booking_completed");
    }
}
