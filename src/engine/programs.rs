use std::sync::Arc;

use chrono::NaiveTime;
use tokio::sync::RwLock;
use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn validate_key(key: &ProgramKey) -> Result<(), EngineError> {
    if key.title.trim().is_empty() {
        return Err(EngineError::InvalidArgument("program title is required".into()));
    }
    if key.title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("program title too long"));
    }
    Ok(())
}

fn validate_group_max(group_max: u32) -> Result<(), EngineError> {
    if group_max > MAX_GROUP_SIZE {
        return Err(EngineError::LimitExceeded("group size too large"));
    }
    Ok(())
}

impl Engine {
    /// Add an empty program. `group_max = 0` leaves group booking unconfigured.
    pub async fn create_program(
        &self,
        key: ProgramKey,
        mode: Mode,
        group_max: u32,
        topology: TopologyKind,
    ) -> Result<(), EngineError> {
        validate_key(&key)?;
        validate_group_max(group_max)?;

        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if self.programs.len() >= MAX_PROGRAMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many programs"));
        }
        if self.programs.contains_key(&key) {
            return Err(EngineError::ProgramExists(key));
        }

        let event = Event::ProgramCreated {
            key: key.clone(),
            mode,
            group_max,
            topology,
        };
        self.wal_append(&event).await?;
        let program = Program {
            key: key.clone(),
            mode,
            group_max,
            topology: SlotTopology::empty(topology),
        };
        self.programs.insert(key.clone(), Arc::new(RwLock::new(program)));
        info!(program = %key, %mode, group_max, %topology, "program created");
        Ok(())
    }

    /// Change mode or group size. Existing counters are untouched.
    pub async fn update_program(
        &self,
        key: &ProgramKey,
        mode: Mode,
        group_max: u32,
    ) -> Result<(), EngineError> {
        validate_group_max(group_max)?;
        let _gate = self.commit_gate.read().await;
        let program = self
            .program(key)
            .ok_or_else(|| EngineError::ProgramNotFound(key.clone()))?;
        let mut guard = program.write().await;
        let event = Event::ProgramUpdated {
            key: key.clone(),
            mode,
            group_max,
        };
        self.wal_append(&event).await?;
        self.apply_to_program(&mut guard, &event);
        Ok(())
    }

    /// Remove a program and its slots. Refused while any slot is booked.
    pub async fn delete_program(&self, key: &ProgramKey) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        let program = self
            .program(key)
            .ok_or_else(|| EngineError::ProgramNotFound(key.clone()))?;
        let guard = program.write().await;

        for coord in guard.topology.coords() {
            if let Some(slot) = self.slot(&SlotKey::new(key.clone(), coord))
                && slot.lock().await.booked_count > 0
            {
                return Err(EngineError::ProgramOccupied(key.clone()));
            }
        }

        self.wal_append(&Event::ProgramDeleted { key: key.clone() })
            .await?;
        self.forget_program(key);
        drop(guard);
        info!(program = %key, "program deleted");
        Ok(())
    }

    /// Append calendar slots to a discrete program. Returns how many were added.
    pub async fn add_slots(&self, key: &ProgramKey, slots: &[SlotRef]) -> Result<usize, EngineError> {
        for slot in slots {
            if slot.end <= slot.start {
                return Err(EngineError::InvalidArgument(format!(
                    "slot {slot} ends before it starts"
                )));
            }
        }

        let _gate = self.commit_gate.read().await;
        let program = self
            .program(key)
            .ok_or_else(|| EngineError::ProgramNotFound(key.clone()))?;
        let mut guard = program.write().await;
        let SlotTopology::Discrete(existing) = &guard.topology else {
            return Err(EngineError::InvalidArgument(format!(
                "{key} uses a recurring pattern; add pattern cells instead"
            )));
        };
        if existing.len() + slots.len() > MAX_SLOTS_PER_PROGRAM {
            return Err(EngineError::LimitExceeded("too many slots on program"));
        }
        for (i, slot) in slots.iter().enumerate() {
            if existing.contains(slot) || slots[..i].contains(slot) {
                return Err(EngineError::SlotExists(SlotKey::new(
                    key.clone(),
                    SlotCoord::Dated(*slot),
                )));
            }
        }

        for slot in slots {
            let event = Event::SlotAdded {
                key: key.clone(),
                slot: *slot,
            };
            self.wal_append(&event).await?;
            self.apply_to_program(&mut guard, &event);
        }
        Ok(slots.len())
    }

    /// Append one cell to a row of a recurring program and return its coordinate.
    pub async fn add_pattern_cell(
        &self,
        key: &ProgramKey,
        row: u32,
        time: NaiveTime,
    ) -> Result<SlotCoord, EngineError> {
        if row >= MAX_PATTERN_ROWS {
            return Err(EngineError::InvalidArgument(format!(
                "row index {row} out of range (max {})",
                MAX_PATTERN_ROWS - 1
            )));
        }

        let _gate = self.commit_gate.read().await;
        let program = self
            .program(key)
            .ok_or_else(|| EngineError::ProgramNotFound(key.clone()))?;
        let mut guard = program.write().await;
        let SlotTopology::Recurring(rows) = &guard.topology else {
            return Err(EngineError::InvalidArgument(format!(
                "{key} uses discrete slots; add slots instead"
            )));
        };
        let cells = rows.get(row as usize).map(Vec::as_slice).unwrap_or_default();
        if cells.len() >= MAX_CELLS_PER_ROW {
            return Err(EngineError::LimitExceeded("too many cells in pattern row"));
        }
        if let Some(existing) = cells.iter().position(|t| *t == time) {
            return Err(EngineError::SlotExists(SlotKey::new(
                key.clone(),
                SlotCoord::Cell {
                    row,
                    time_index: existing as u32,
                },
            )));
        }
        let coord = SlotCoord::Cell {
            row,
            time_index: cells.len() as u32,
        };

        let event = Event::PatternCellAdded {
            key: key.clone(),
            row,
            time,
        };
        self.wal_append(&event).await?;
        self.apply_to_program(&mut guard, &event);
        Ok(coord)
    }
}
