use rustc_hash::FxHashMap;

use crate::scope::{ScopeCell, INVALID_ID};
use crate::stmt::StmtId;

/// Opaque function identifier. Index into the chunk's function list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub u32);

/// A jump target and the sorted ids of the jumps pointing at it.
#[derive(Debug, Clone)]
pub struct Label {
    pub target: u32,
    pub jump_ids: Vec<u32>,
}

/// One or more debug variables declared together at the same instruction
/// boundary.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    pub base_slot: u8,
    pub scope_begin: u32,
    pub scope_end: u32,
    pub names: Vec<String>,
    /// The group is an ephemeral introduced by a compile-time optimization;
    /// local-scope nesting must not emit a block for it.
    pub exclude_block: bool,
}

/// An upvalue binding of a (possibly nested) function. `local` bindings
/// refer to a parent-frame slot and are tied to its slot scope.
#[derive(Debug, Clone, Default)]
pub struct UpvalueBinding {
    pub slot: u8,
    pub local: bool,
    pub cell: Option<ScopeCell>,
}

/// A function node: the per-function AST state threaded through the lifter
/// passes.
#[derive(Debug)]
pub struct FuncNode {
    /// Index of the backing prototype in the module.
    pub prototype: usize,
    /// Nesting depth; the chunk is level 0.
    pub level: u32,
    /// Post-order id assigned while lifting.
    pub id: u32,
    /// The function body. One statement per instruction after import;
    /// restructured in place by the passes.
    pub block: Vec<StmtId>,
    pub child_functions: Vec<FuncId>,
    pub upvalues: Vec<UpvalueBinding>,
    /// Local groups digested from debug info.
    pub locals: Vec<LocalGroup>,
    /// Jump-target index: labels by id, with a target lookup table.
    pub labels: Vec<Label>,
    label_by_target: FxHashMap<u32, u32>,
    /// Globals touched by this function, kept for diagnostics.
    pub used_globals: Vec<String>,
    pub parameter_names: Vec<String>,
    /// Scope handles closed at function entry, one per parameter slot.
    pub parameter_scopes: Vec<Option<ScopeCell>>,
    pub has_debug_info: bool,
    /// An FNEW captures the very slot its closure is assigned to.
    pub assignment_slot_is_upvalue: bool,
}

impl FuncNode {
    pub fn new(prototype: usize, level: u32) -> Self {
        FuncNode {
            prototype,
            level,
            id: 0,
            block: Vec::new(),
            child_functions: Vec::new(),
            upvalues: Vec::new(),
            locals: Vec::new(),
            labels: Vec::new(),
            label_by_target: FxHashMap::default(),
            used_globals: Vec::new(),
            parameter_names: Vec::new(),
            parameter_scopes: Vec::new(),
            has_debug_info: false,
            assignment_slot_is_upvalue: false,
        }
    }

    /// Register a jump edge `source -> target`, creating the target's label
    /// on first use. Sources are kept sorted.
    pub fn add_jump(&mut self, source: u32, target: u32) {
        let label = match self.label_by_target.get(&target) {
            Some(&label) => label,
            None => {
                let label = self.labels.len() as u32;
                self.labels.push(Label {
                    target,
                    jump_ids: Vec::new(),
                });
                self.label_by_target.insert(target, label);
                label
            }
        };
        let jump_ids = &mut self.labels[label as usize].jump_ids;
        if let Err(pos) = jump_ids.binary_search(&source) {
            jump_ids.insert(pos, source);
        }
    }

    /// Remove a previously registered jump edge. Removing the last edge of
    /// a label leaves an empty label behind; `is_valid_label` treats it as
    /// gone.
    pub fn remove_jump(&mut self, source: u32, target: u32) {
        if let Some(&label) = self.label_by_target.get(&target) {
            let jump_ids = &mut self.labels[label as usize].jump_ids;
            if let Ok(pos) = jump_ids.binary_search(&source) {
                jump_ids.remove(pos);
            }
        }
    }

    /// The label whose target is `id`, or INVALID_ID.
    pub fn label_at(&self, id: u32) -> u32 {
        self.label_by_target.get(&id).copied().unwrap_or(INVALID_ID)
    }

    pub fn is_valid_label(&self, label: u32) -> bool {
        label != INVALID_ID
            && (label as usize) < self.labels.len()
            && !self.labels[label as usize].jump_ids.is_empty()
    }

    pub fn label(&self, label: u32) -> &Label {
        &self.labels[label as usize]
    }

    /// Furthest jump source of a label: the scope of a value read at the
    /// label must survive to the last jump that can reach it.
    pub fn scope_end_from_label(&self, label: u32) -> u32 {
        let label = &self.labels[label as usize];
        label
            .jump_ids
            .last()
            .copied()
            .unwrap_or(label.target)
            .max(label.target)
    }

    /// Earliest begin a scope crossing this label may claim: just before
    /// the first jump source that lies before `end`.
    pub fn scope_begin_from_label(&self, label: u32, end: u32) -> u32 {
        let label = &self.labels[label as usize];
        label
            .jump_ids
            .iter()
            .copied()
            .filter(|&id| id < end)
            .min()
            .map(|id| id.saturating_sub(1))
            .unwrap_or(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jump_bookkeeping() {
        let mut func = FuncNode::new(0, 0);
        func.add_jump(10, 4);
        func.add_jump(2, 4);
        func.add_jump(7, 4);
        let label = func.label_at(4);
        assert!(func.is_valid_label(label));
        assert_eq!(func.label(label).jump_ids, vec![2, 7, 10]);

        assert_eq!(func.scope_end_from_label(label), 10);
        assert_eq!(func.scope_begin_from_label(label, 8), 1);

        func.remove_jump(2, 4);
        func.remove_jump(7, 4);
        func.remove_jump(10, 4);
        assert!(!func.is_valid_label(label));
        assert_eq!(func.label_at(99), INVALID_ID);
    }
}
