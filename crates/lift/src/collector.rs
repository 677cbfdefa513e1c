use relume_hir::scope::{ScopeArena, ScopeCell, INVALID_ID};

/// Per-slot collection state.
///
/// `active` is the scope currently open for the slot at the walk position;
/// `stack` holds outer scopes that were open when an inner one was begun.
/// `min_scope_begin` is the earliest instruction id a write may claim and
/// still close the active scope: jump edges crossing the region push it
/// leftward, and a write above it means the value merges around a branch,
/// so the scope has to stay open.
#[derive(Debug, Default, Clone)]
pub struct SlotInfo {
    pub active: Option<ScopeCell>,
    pub stack: Vec<ScopeCell>,
    pub min_scope_begin: u32,
}

/// Slots captured as upvalues by an FNEW at `id`.
#[derive(Debug, Clone)]
pub struct UpvalueInfo {
    pub id: u32,
    pub slots: Vec<u8>,
}

/// Transient per-function bookkeeping for the slot-scope collection pass.
///
/// The collector is fed jump and loop edges while the earlier passes fold
/// the instruction stream, then drives the reverse scope-collection walk.
/// Every scope it opens must be closed again before the function completes.
#[derive(Debug)]
pub struct SlotScopeCollector {
    pub slot_infos: Vec<SlotInfo>,
    pub upvalue_infos: Vec<UpvalueInfo>,
    upvalue_closes: Vec<(u32, u32, u8)>,
    /// Lazily begun scopes for captured slots when debug info is absent:
    /// (end id, slot, begun).
    pending_upvalue_scopes: Vec<(u32, u8, bool)>,
    /// All registered jump and loop edges, for region validity queries.
    edges: Vec<(u32, u32)>,
    pub previous_id: u32,
}

impl SlotScopeCollector {
    pub fn new(frame_size: u8, instruction_count: u32) -> Self {
        SlotScopeCollector {
            slot_infos: vec![
                SlotInfo {
                    active: None,
                    stack: Vec::new(),
                    min_scope_begin: INVALID_ID,
                };
                frame_size as usize
            ],
            upvalue_infos: Vec::new(),
            upvalue_closes: Vec::new(),
            pending_upvalue_scopes: Vec::new(),
            edges: Vec::new(),
            previous_id: instruction_count,
        }
    }

    pub fn add_jump(&mut self, source: u32, target: u32) {
        self.edges.push((source, target));
    }

    pub fn add_loop(&mut self, begin: u32, end: u32) {
        self.edges.push((end, begin));
    }

    pub fn add_upvalues(&mut self, id: u32, slots: Vec<u8>) {
        self.upvalue_infos.push(UpvalueInfo { id, slots });
    }

    pub fn add_upvalue_close(&mut self, id: u32, target: u32, base_slot: u8) {
        self.upvalue_closes.push((id, target, base_slot));
    }

    /// A half-open range `[begin, end)` is a valid single-entry block when
    /// no recorded control edge crosses its boundary. The trailing jump of
    /// a candidate region sits at `end` and is deliberately not counted.
    pub fn is_valid_block_range(&self, begin: u32, end: u32) -> bool {
        if begin == INVALID_ID || end == INVALID_ID {
            return false;
        }
        !self.edges.iter().any(|&(source, target)| {
            let source_inside = source >= begin && source < end;
            let target_inside = target >= begin && target < end;
            source_inside != target_inside
        })
    }

    /// Open a new scope for `slot` ending at `end_id`, stacking whatever
    /// scope was active.
    pub fn begin_scope(&mut self, scopes: &mut ScopeArena, slot: u8, end_id: u32) -> ScopeCell {
        let scope = scopes.new_scope(INVALID_ID, end_id);
        let cell = scopes.new_cell(scope);
        let info = &mut self.slot_infos[slot as usize];
        if let Some(previous) = info.active.take() {
            info.stack.push(previous);
        }
        info.active = Some(cell);
        cell
    }

    /// Record the defining write of the active scope at `begin_id` and
    /// close it — unless a crossing jump constrains the scope to begin
    /// earlier, in which case the write merely shares the still-open scope.
    pub fn complete_scope(
        &mut self,
        scopes: &mut ScopeArena,
        slot: u8,
        begin_id: u32,
    ) -> ScopeCell {
        let cell = match self.slot_infos[slot as usize].active {
            Some(cell) => cell,
            None => self.begin_scope(scopes, slot, begin_id),
        };
        let info = &mut self.slot_infos[slot as usize];

        if info.min_scope_begin != INVALID_ID && begin_id > info.min_scope_begin {
            let scope = scopes.get_mut(cell);
            if scope.scope_begin == INVALID_ID || scope.scope_begin > begin_id {
                scope.scope_begin = begin_id;
            }
            return cell;
        }

        let scope = scopes.get_mut(cell);
        if scope.scope_begin == INVALID_ID || scope.scope_begin > begin_id {
            scope.scope_begin = begin_id;
        }
        info.active = info.stack.pop();
        info.min_scope_begin = INVALID_ID;
        cell
    }

    /// Record a read of `slot` at `id`; opens a scope ending at `id` when
    /// none is active.
    pub fn add_to_scope(&mut self, scopes: &mut ScopeArena, slot: u8, id: u32) -> ScopeCell {
        let cell = match self.slot_infos[slot as usize].active {
            Some(cell) => cell,
            None => self.begin_scope(scopes, slot, id),
        };
        let scope = scopes.get_mut(cell);
        scope.usages += 1;
        if scope.scope_begin != INVALID_ID && scope.scope_begin > id {
            scope.scope_begin = id;
        }
        cell
    }

    /// Constrain every active scope to begin no later than `id`.
    pub fn extend_scopes(&mut self, id: u32) {
        for info in &mut self.slot_infos {
            if info.active.is_some()
                && (info.min_scope_begin == INVALID_ID || id < info.min_scope_begin)
            {
                info.min_scope_begin = id;
            }
        }
    }

    /// Widen active scopes across the boundary `id` and fold stacked
    /// scopes the widening swallowed into the survivor.
    pub fn merge_scopes(&mut self, scopes: &mut ScopeArena, id: u32) {
        for info in &mut self.slot_infos {
            let Some(active) = info.active else { continue };
            if scopes.get(active).scope_end < id {
                scopes.get_mut(active).scope_end = id;
            }
            while let Some(&top) = info.stack.last() {
                if scopes.get(top).scope_end > scopes.get(active).scope_end {
                    break;
                }
                let absorbed = scopes.get(top).clone();
                let survivor = scopes.get_mut(active);
                survivor.usages += absorbed.usages;
                if absorbed.scope_begin != INVALID_ID
                    && (survivor.scope_begin == INVALID_ID
                        || absorbed.scope_begin < survivor.scope_begin)
                {
                    survivor.scope_begin = absorbed.scope_begin;
                }
                let survivor_id = scopes.id_of(active);
                scopes.redirect(top, survivor_id);
                info.stack.pop();
            }
        }
    }

    /// Drop a scope collapsed by slot elimination: the definition and its
    /// read site both disappeared. The arena keeps the orphaned record;
    /// nothing references it afterwards.
    pub fn remove_scope(&mut self, _scopes: &mut ScopeArena, _slot: u8, _cell: ScopeCell) {}

    /// Without debug info there are no declarations to anchor captured
    /// slots, so every slot captured by any FNEW gets exactly one scope
    /// spanning all of its capture sites, begun lazily during the walk.
    pub fn build_upvalue_scopes(&mut self) {
        let mut per_slot: Vec<(u8, u32)> = Vec::new();
        for info in &self.upvalue_infos {
            for &slot in &info.slots {
                let mut end = info.id;
                for &(close_id, _, base) in &self.upvalue_closes {
                    if base <= slot && close_id > end {
                        end = close_id;
                    }
                }
                match per_slot.iter_mut().find(|(s, _)| *s == slot) {
                    Some((_, e)) => *e = (*e).max(end),
                    None => per_slot.push((slot, end)),
                }
            }
        }
        self.pending_upvalue_scopes = per_slot
            .into_iter()
            .map(|(slot, end)| (end, slot, false))
            .collect();
    }

    /// Open pending captured-slot scopes once the reverse walk reaches
    /// their end position.
    pub fn begin_upvalue_scopes(&mut self, scopes: &mut ScopeArena, id: u32) {
        for i in 0..self.pending_upvalue_scopes.len() {
            let (end, slot, begun) = self.pending_upvalue_scopes[i];
            if begun || id > end {
                continue;
            }
            if self.slot_infos[slot as usize].active.is_none() {
                self.begin_scope(scopes, slot, end);
            }
            self.pending_upvalue_scopes[i].2 = true;
        }
    }

    /// Postcondition of the collection pass: every opened scope was closed.
    pub fn assert_scopes_closed(&self) -> bool {
        self.slot_infos
            .iter()
            .all(|info| info.active.is_none() && info.stack.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_then_write_closes_scope() {
        let mut scopes = ScopeArena::new();
        let mut collector = SlotScopeCollector::new(4, 10);

        // Reverse walk: read at 7, write at 3.
        let read = collector.add_to_scope(&mut scopes, 2, 7);
        let write = collector.complete_scope(&mut scopes, 2, 3);
        assert_eq!(read, write);
        assert_eq!(scopes.get(read).usages, 1);
        assert_eq!(scopes.get(read).scope_begin, 3);
        assert_eq!(scopes.get(read).scope_end, 7);
        assert!(collector.assert_scopes_closed());
    }

    #[test]
    fn test_constrained_write_keeps_scope_open() {
        let mut scopes = ScopeArena::new();
        let mut collector = SlotScopeCollector::new(4, 10);

        let read = collector.add_to_scope(&mut scopes, 0, 8);
        // A jump crossing below id 2 forces the scope to begin at or
        // before 2; the write at 5 cannot close it.
        collector.extend_scopes(2);
        let blocked = collector.complete_scope(&mut scopes, 0, 5);
        assert_eq!(read, blocked);
        assert!(!collector.assert_scopes_closed());

        // The dominating write at 2 closes it.
        collector.complete_scope(&mut scopes, 0, 2);
        assert!(collector.assert_scopes_closed());
        assert_eq!(scopes.get(read).scope_begin, 2);
    }

    #[test]
    fn test_block_range_validity() {
        let mut collector = SlotScopeCollector::new(1, 20);
        collector.add_jump(5, 12);
        assert!(collector.is_valid_block_range(4, 13));
        assert!(!collector.is_valid_block_range(6, 13));
        assert!(collector.is_valid_block_range(13, 18));
        // The jump at the range end is not counted.
        assert!(collector.is_valid_block_range(6, 5));
        assert!(!collector.is_valid_block_range(5, 12));
    }
}
