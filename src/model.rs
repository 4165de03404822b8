use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Instants only; calendar coordinates use chrono types.
pub type Ms = i64;

/// A lowercase label that did not name any known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLabelError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseLabelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ParseLabelError {}

macro_rules! label_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ParseLabelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($label => Ok($name::$variant),)+
                    _ => Err(ParseLabelError { kind: $kind, value: s.to_string() }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Which catalog a program is listed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Catalog {
    /// One-off live sessions.
    Live,
    /// Recurring guide availability.
    Guide,
}

label_enum!(Catalog, "catalog", { Live => "live", Guide => "guide" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Online,
    Offline,
}

label_enum!(Mode, "mode", { Online => "online", Offline => "offline" });

/// Capacity class of a reservation. A slot is locked to the class of its first occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OccupancyType {
    Individual,
    Couple,
    Twin,
    Group,
}

label_enum!(OccupancyType, "occupancy type", {
    Individual => "individual",
    Couple => "couple",
    Twin => "twin",
    Group => "group",
});

impl OccupancyType {
    /// Seats a slot offers once locked for this type.
    /// `None` for a group slot whose program has no group size configured.
    pub fn capacity(self, group_max: u32) -> Option<u32> {
        match self {
            OccupancyType::Individual => Some(1),
            OccupancyType::Couple | OccupancyType::Twin => Some(2),
            OccupancyType::Group => (group_max > 0).then_some(group_max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopologyKind {
    Discrete,
    Recurring,
}

label_enum!(TopologyKind, "topology", { Discrete => "discrete", Recurring => "recurring" });

/// Programs are unique by title within a catalog.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProgramKey {
    pub catalog: Catalog,
    pub title: String,
}

impl ProgramKey {
    pub fn new(catalog: Catalog, title: impl Into<String>) -> Self {
        Self {
            catalog,
            title: title.into(),
        }
    }
}

impl fmt::Display for ProgramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.catalog, self.title)
    }
}

/// A calendar slot: exact `(date, start, end)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotRef {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SlotRef {
    pub fn new(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Self {
        Self { date, start, end }
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}-{}",
            self.date,
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

/// Addresses one slot within a program, whichever topology it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SlotCoord {
    /// A discrete calendar slot.
    Dated(SlotRef),
    /// A cell of the weekly pattern: `row` is the grid row, `time_index` the cell within it.
    Cell { row: u32, time_index: u32 },
}

impl fmt::Display for SlotCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotCoord::Dated(slot) => slot.fmt(f),
            SlotCoord::Cell { row, time_index } => write!(f, "row {row} cell {time_index}"),
        }
    }
}

/// Stable key of one entry in the slot-capacity arena.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub program: ProgramKey,
    pub coord: SlotCoord,
}

impl SlotKey {
    pub fn new(program: ProgramKey, coord: SlotCoord) -> Self {
        Self { program, coord }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.program, self.coord)
    }
}

/// Who booked a slot, kept in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub user_id: String,
    pub occupancy: OccupancyType,
    pub at: Ms,
    /// Caller-supplied idempotency token, if any.
    pub request_id: Option<String>,
}

/// Capacity bookkeeping for one slot. Lives apart from program metadata.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub key: SlotKey,
    /// Wall-clock time of a pattern cell. `None` for dated slots.
    pub time: Option<NaiveTime>,
    pub booked_count: u32,
    pub locked_for: Option<OccupancyType>,
    pub audit: Vec<AuditEntry>,
}

impl SlotState {
    pub fn new(key: SlotKey, time: Option<NaiveTime>) -> Self {
        Self {
            key,
            time,
            booked_count: 0,
            locked_for: None,
            audit: Vec::new(),
        }
    }

    pub fn find_request(&self, request_id: &str) -> Option<&AuditEntry> {
        self.audit
            .iter()
            .find(|e| e.request_id.as_deref() == Some(request_id))
    }

    /// Count one more occupant and lock the slot if this is the first.
    pub fn occupy(&mut self, entry: AuditEntry) {
        self.booked_count += 1;
        if self.locked_for.is_none() {
            self.locked_for = Some(entry.occupancy);
        }
        self.audit.push(entry);
    }

    /// Drop one occupant. The lock clears exactly when the count reaches zero.
    /// Removes the oldest audit entry matching `user_id` and `occupancy`, if any.
    pub fn vacate(&mut self, user_id: &str, occupancy: OccupancyType) -> Option<AuditEntry> {
        self.booked_count = self.booked_count.saturating_sub(1);
        if self.booked_count == 0 {
            self.locked_for = None;
        }
        let pos = self
            .audit
            .iter()
            .position(|e| e.user_id == user_id && e.occupancy == occupancy)?;
        Some(self.audit.remove(pos))
    }
}

/// Slot layout of a program. Counters are not stored here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotTopology {
    /// Ordered list of calendar slots.
    Discrete(Vec<SlotRef>),
    /// Weekly grid: each row lists its cell times.
    Recurring(Vec<Vec<NaiveTime>>),
}

impl SlotTopology {
    pub fn empty(kind: TopologyKind) -> Self {
        match kind {
            TopologyKind::Discrete => SlotTopology::Discrete(Vec::new()),
            TopologyKind::Recurring => SlotTopology::Recurring(Vec::new()),
        }
    }

    pub fn kind(&self) -> TopologyKind {
        match self {
            SlotTopology::Discrete(_) => TopologyKind::Discrete,
            SlotTopology::Recurring(_) => TopologyKind::Recurring,
        }
    }

    pub fn slot_count(&self) -> usize {
        match self {
            SlotTopology::Discrete(slots) => slots.len(),
            SlotTopology::Recurring(rows) => rows.iter().map(Vec::len).sum(),
        }
    }

    /// `None` when the coordinate has the wrong shape for this topology.
    pub fn contains(&self, coord: &SlotCoord) -> Option<bool> {
        match (self, coord) {
            (SlotTopology::Discrete(slots), SlotCoord::Dated(slot)) => Some(slots.contains(slot)),
            (SlotTopology::Recurring(rows), SlotCoord::Cell { row, time_index }) => Some(
                rows.get(*row as usize)
                    .is_some_and(|cells| (*time_index as usize) < cells.len()),
            ),
            _ => None,
        }
    }

    /// All coordinates in layout order.
    pub fn coords(&self) -> Vec<SlotCoord> {
        match self {
            SlotTopology::Discrete(slots) => slots.iter().copied().map(SlotCoord::Dated).collect(),
            SlotTopology::Recurring(rows) => rows
                .iter()
                .enumerate()
                .flat_map(|(r, cells)| {
                    (0..cells.len()).map(move |t| SlotCoord::Cell {
                        row: r as u32,
                        time_index: t as u32,
                    })
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Program {
    pub key: ProgramKey,
    pub mode: Mode,
    /// Seats in a group slot. Zero means group booking is not configured.
    pub group_max: u32,
    pub topology: SlotTopology,
}

// ── Booking ledger ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Waiting,
    Active,
    Refunded,
    Completed,
}

label_enum!(BookingStatus, "booking status", {
    Waiting => "waiting",
    Active => "active",
    Refunded => "refunded",
    Completed => "completed",
});

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Refunded | BookingStatus::Completed)
    }

    /// Counts toward a group's participant total.
    pub fn is_live(self) -> bool {
        matches!(self, BookingStatus::Waiting | BookingStatus::Active)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Waiting, BookingStatus::Active)
                | (BookingStatus::Waiting, BookingStatus::Refunded)
                | (BookingStatus::Active, BookingStatus::Completed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: String,
    pub program: ProgramKey,
    pub mode: Mode,
    pub occupancy: OccupancyType,
    pub selected_slots: Vec<SlotCoord>,
    pub status: BookingStatus,
    pub min_persons: Option<u32>,
    pub waiting_period_end: Option<NaiveDate>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub actual_start_date: Option<NaiveDate>,
    pub refund_date: Option<NaiveDate>,
    pub refund_reason: Option<String>,
    pub completed_date: Option<NaiveDate>,
    pub payment_ref: Option<String>,
    pub amount_cents: Option<i64>,
    pub created_at: Ms,
}

impl Booking {
    /// Same program, mode and occupancy type: candidates for one shared group.
    pub fn same_offering(&self, other: &Booking) -> bool {
        self.program == other.program
            && self.mode == other.mode
            && self.occupancy == other.occupancy
    }

    /// At least one selected slot in common, by exact coordinate.
    pub fn shares_slot_with(&self, other: &Booking) -> bool {
        self.selected_slots
            .iter()
            .any(|s| other.selected_slots.contains(s))
    }

    /// Stamp the date field belonging to `status`.
    pub fn apply_transition(&mut self, status: BookingStatus, on: NaiveDate, reason: Option<String>) {
        self.status = status;
        match status {
            BookingStatus::Active => self.actual_start_date = Some(on),
            BookingStatus::Refunded => {
                self.refund_date = Some(on);
                self.refund_reason = reason;
            }
            BookingStatus::Completed => self.completed_date = Some(on),
            BookingStatus::Waiting => {}
        }
    }
}

// ── Granted access ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GrantKey {
    pub user_id: String,
    pub program_id: String,
}

impl GrantKey {
    pub fn new(user_id: impl Into<String>, program_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            program_id: program_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub key: GrantKey,
    pub granted_at: Ms,
    pub expires_at: Option<Ms>,
}

impl Grant {
    /// Strictly past the expiry instant.
    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }
}

/// The WAL record format: one variant per committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProgramCreated {
        key: ProgramKey,
        mode: Mode,
        group_max: u32,
        topology: TopologyKind,
    },
    ProgramUpdated {
        key: ProgramKey,
        mode: Mode,
        group_max: u32,
    },
    ProgramDeleted {
        key: ProgramKey,
    },
    SlotAdded {
        key: ProgramKey,
        slot: SlotRef,
    },
    PatternCellAdded {
        key: ProgramKey,
        row: u32,
        time: NaiveTime,
    },
    SlotReserved {
        slot: SlotKey,
        entry: AuditEntry,
    },
    SlotReleased {
        slot: SlotKey,
        user_id: String,
        occupancy: OccupancyType,
    },
    /// One reservation across several slots, committed as a single record.
    BatchReserved {
        entries: Vec<(SlotKey, AuditEntry)>,
    },
    /// Full counter state of a slot. Written only by compaction.
    SlotRestored {
        slot: SlotKey,
        booked_count: u32,
        locked_for: Option<OccupancyType>,
        audit: Vec<AuditEntry>,
    },
    BookingCreated {
        booking: Box<Booking>,
    },
    BookingTransitioned {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
        on: NaiveDate,
        reason: Option<String>,
    },
    GrantIssued {
        grant: Grant,
    },
    GrantsRevoked {
        keys: Vec<GrantKey>,
    },
}

// ── Operation results ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveOutcome {
    pub booked_count: u32,
    pub max_cap: u32,
    pub locked_for: OccupancyType,
    /// True when a retried request id matched an earlier reservation.
    pub replayed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub booked_count: u32,
    pub locked_for: Option<OccupancyType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub coord: SlotCoord,
    pub time: Option<NaiveTime>,
    pub booked_count: u32,
    pub locked_for: Option<OccupancyType>,
    /// Capacity under the current lock, if locked and configured.
    pub max_cap: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInfo {
    pub key: ProgramKey,
    pub mode: Mode,
    pub group_max: u32,
    pub topology: TopologyKind,
    pub slot_count: usize,
}

/// Counts from one lifecycle tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub activated: u32,
    pub refunded: u32,
    pub completed: u32,
    /// Already moved on by a concurrent or earlier tick.
    pub skipped: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: u32,
    pub batches: u32,
    pub failed_batches: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantStatus {
    pub active: Vec<String>,
    pub expired: Vec<String>,
}
