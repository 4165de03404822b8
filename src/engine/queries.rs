use crate::model::*;

use super::occupancy::{check_coord, current_max_cap};
use super::{Engine, EngineError};

impl Engine {
    pub async fn list_programs(&self) -> Vec<ProgramInfo> {
        let shared: Vec<_> = self.programs.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(shared.len());
        for program in shared {
            let p = program.read().await;
            infos.push(ProgramInfo {
                key: p.key.clone(),
                mode: p.mode,
                group_max: p.group_max,
                topology: p.topology.kind(),
                slot_count: p.topology.slot_count(),
            });
        }
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Counters of every slot in the program, in layout order.
    pub async fn program_slots(&self, key: &ProgramKey) -> Result<Vec<SlotInfo>, EngineError> {
        let program = self
            .program(key)
            .ok_or_else(|| EngineError::ProgramNotFound(key.clone()))?;
        let meta = program.read().await;
        let mut out = Vec::with_capacity(meta.topology.slot_count());
        for coord in meta.topology.coords() {
            let slot_key = SlotKey::new(key.clone(), coord);
            let shared = self
                .slot(&slot_key)
                .ok_or(EngineError::SlotNotFound(slot_key))?;
            let slot = shared.lock().await;
            out.push(slot_info(&slot, meta.group_max));
        }
        Ok(out)
    }

    pub async fn slot_status(
        &self,
        key: &ProgramKey,
        coord: SlotCoord,
    ) -> Result<SlotInfo, EngineError> {
        let program = self
            .program(key)
            .ok_or_else(|| EngineError::ProgramNotFound(key.clone()))?;
        let meta = program.read().await;
        check_coord(&meta, &coord)?;
        let slot_key = SlotKey::new(key.clone(), coord);
        let shared = self
            .slot(&slot_key)
            .ok_or(EngineError::SlotNotFound(slot_key))?;
        let slot = shared.lock().await;
        Ok(slot_info(&slot, meta.group_max))
    }

    /// Audit trail of one slot, oldest first.
    pub async fn slot_audit(
        &self,
        key: &ProgramKey,
        coord: SlotCoord,
    ) -> Result<Vec<AuditEntry>, EngineError> {
        let slot_key = SlotKey::new(key.clone(), coord);
        let shared = self
            .slot(&slot_key)
            .ok_or(EngineError::SlotNotFound(slot_key))?;
        let slot = shared.lock().await;
        Ok(slot.audit.clone())
    }
}

fn slot_info(slot: &SlotState, group_max: u32) -> SlotInfo {
    SlotInfo {
        coord: slot.key.coord,
        time: slot.time,
        booked_count: slot.booked_count,
        locked_for: slot.locked_for,
        max_cap: current_max_cap(slot, group_max),
    }
}
