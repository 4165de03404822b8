use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Decide whether one more `requested` occupant fits in `slot`.
///
/// Counter, lock and capacity are all read from the same locked state, so the
/// answer holds until the caller releases the slot. Returns the capacity the
/// slot will have once this reservation commits.
pub fn check_reservation(
    slot: &SlotState,
    requested: OccupancyType,
    group_max: u32,
) -> Result<u32, EngineError> {
    let max_cap = requested
        .capacity(group_max)
        .ok_or_else(|| EngineError::CapacityUnconfigured(slot.key.program.clone()))?;

    if slot.booked_count > 0
        && let Some(locked_for) = slot.locked_for
        && locked_for != requested
    {
        return Err(EngineError::LockConflict {
            locked_for,
            requested,
        });
    }

    if slot.booked_count >= max_cap {
        return Err(EngineError::SlotFull {
            booked_count: slot.booked_count,
            max_cap,
        });
    }
    Ok(max_cap)
}

/// Capacity under the slot's current lock. `None` when unlocked.
pub fn current_max_cap(slot: &SlotState, group_max: u32) -> Option<u32> {
    slot.locked_for.and_then(|t| t.capacity(group_max))
}

pub(crate) fn validate_user_id(user_id: &str) -> Result<(), EngineError> {
    if user_id.trim().is_empty() {
        return Err(EngineError::InvalidArgument("user id is required".into()));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    Ok(())
}

pub(crate) fn validate_request_id(request_id: Option<&str>) -> Result<(), EngineError> {
    match request_id {
        Some(r) if r.is_empty() => Err(EngineError::InvalidArgument("empty request id".into())),
        Some(r) if r.len() > MAX_REQUEST_ID_LEN => {
            Err(EngineError::LimitExceeded("request id too long"))
        }
        _ => Ok(()),
    }
}

/// Reject a selector whose shape or position does not fit the program's layout.
pub(crate) fn check_coord(program: &Program, coord: &SlotCoord) -> Result<(), EngineError> {
    match program.topology.contains(coord) {
        Some(true) => Ok(()),
        Some(false) => Err(EngineError::SlotNotFound(SlotKey::new(
            program.key.clone(),
            *coord,
        ))),
        None => Err(EngineError::InvalidArgument(format!(
            "selector {coord} does not address a {} program",
            program.topology.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime};

    use super::*;

    fn slot_with(entries: &[(&str, OccupancyType)]) -> SlotState {
        let d = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let start = NaiveTime::from_hms_opt(7, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(8, 0, 0).unwrap();
        let key = SlotKey::new(
            ProgramKey::new(Catalog::Live, "Sunrise Yoga"),
            SlotCoord::Dated(SlotRef::new(d, start, end)),
        );
        let mut slot = SlotState::new(key, None);
        for (i, (user, occupancy)) in entries.iter().enumerate() {
            slot.occupy(AuditEntry {
                user_id: user.to_string(),
                occupancy: *occupancy,
                at: i as Ms,
                request_id: None,
            });
        }
        slot
    }

    #[test]
    fn empty_slot_accepts_any_type() {
        let slot = slot_with(&[]);
        assert_eq!(check_reservation(&slot, OccupancyType::Individual, 0).unwrap(), 1);
        assert_eq!(check_reservation(&slot, OccupancyType::Couple, 0).unwrap(), 2);
        assert_eq!(check_reservation(&slot, OccupancyType::Group, 8).unwrap(), 8);
    }

    #[test]
    fn locked_slot_rejects_other_type() {
        let slot = slot_with(&[("a", OccupancyType::Couple)]);
        let err = check_reservation(&slot, OccupancyType::Individual, 0).unwrap_err();
        assert!(matches!(
            err,
            EngineError::LockConflict {
                locked_for: OccupancyType::Couple,
                requested: OccupancyType::Individual
            }
        ));
    }

    #[test]
    fn full_slot_reports_counts() {
        let slot = slot_with(&[("a", OccupancyType::Couple), ("b", OccupancyType::Couple)]);
        let err = check_reservation(&slot, OccupancyType::Couple, 0).unwrap_err();
        assert!(matches!(
            err,
            EngineError::SlotFull {
                booked_count: 2,
                max_cap: 2
            }
        ));
    }

    #[test]
    fn group_without_size_is_unconfigured() {
        let slot = slot_with(&[]);
        let err = check_reservation(&slot, OccupancyType::Group, 0).unwrap_err();
        assert!(matches!(err, EngineError::CapacityUnconfigured(_)));
    }

    #[test]
    fn capacity_check_precedes_lock_check() {
        let slot = slot_with(&[("a", OccupancyType::Individual)]);
        let err = check_reservation(&slot, OccupancyType::Group, 0).unwrap_err();
        assert!(matches!(err, EngineError::CapacityUnconfigured(_)));
    }

    #[test]
    fn shrunken_group_size_reads_as_full() {
        let slot = slot_with(&[
            ("a", OccupancyType::Group),
            ("b", OccupancyType::Group),
            ("c", OccupancyType::Group),
        ]);
        assert!(matches!(
            check_reservation(&slot, OccupancyType::Group, 2),
            Err(EngineError::SlotFull { booked_count: 3, max_cap: 2 })
        ));
        assert_eq!(current_max_cap(&slot, 2), Some(2));
        assert_eq!(current_max_cap(&slot_with(&[]), 2), None);
    }

    #[test]
    fn user_and_request_ids_are_validated() {
        assert!(validate_user_id("u1").is_ok());
        assert!(matches!(validate_user_id("  "), Err(EngineError::InvalidArgument(_))));
        assert!(matches!(
            validate_user_id(&"x".repeat(MAX_USER_ID_LEN + 1)),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(validate_request_id(None).is_ok());
        assert!(validate_request_id(Some("r1")).is_ok());
        assert!(validate_request_id(Some("")).is_err());
    }
}
