/// Sentinel for "no id": instruction ids, label ids and statement ids all
/// use this in place of an `Option` because they participate in ordering
/// comparisons throughout the lifter.
pub const INVALID_ID: u32 = u32::MAX;

/// Opaque identifier of a slot-scope record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// An indirect handle to a slot scope.
///
/// Every AST node that refers to a scope holds a cell, not a `ScopeId`.
/// Cells can be shared (copied) and can be *redirected*: pointing a cell at
/// another scope makes the merge visible to every holder of that cell at
/// once. This is the arena form of the original's pointer-to-pointer
/// sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeCell(pub u32);

/// The maximal instruction-id range over which one stack slot holds a
/// single logical value, plus the number of read sites referring to it.
#[derive(Debug, Clone)]
pub struct SlotScope {
    pub scope_begin: u32,
    pub scope_end: u32,
    pub usages: u32,
}

/// Arena of slot scopes and the cell table indirecting into it.
#[derive(Debug, Default)]
pub struct ScopeArena {
    scopes: Vec<SlotScope>,
    cells: Vec<ScopeId>,
}

impl ScopeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_scope(&mut self, scope_begin: u32, scope_end: u32) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(SlotScope {
            scope_begin,
            scope_end,
            usages: 0,
        });
        id
    }

    /// Allocate a fresh cell pointing at `scope`.
    pub fn new_cell(&mut self, scope: ScopeId) -> ScopeCell {
        let cell = ScopeCell(self.cells.len() as u32);
        self.cells.push(scope);
        cell
    }

    /// The scope a cell currently points at.
    pub fn id_of(&self, cell: ScopeCell) -> ScopeId {
        self.cells[cell.0 as usize]
    }

    pub fn get(&self, cell: ScopeCell) -> &SlotScope {
        &self.scopes[self.id_of(cell).0 as usize]
    }

    pub fn get_mut(&mut self, cell: ScopeCell) -> &mut SlotScope {
        let id = self.id_of(cell);
        &mut self.scopes[id.0 as usize]
    }

    pub fn scope(&self, id: ScopeId) -> &SlotScope {
        &self.scopes[id.0 as usize]
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> &mut SlotScope {
        &mut self.scopes[id.0 as usize]
    }

    /// Point `cell` at `scope`. Only this cell is rebound; other cells that
    /// already resolve to `scope` are unaffected.
    pub fn redirect(&mut self, cell: ScopeCell, scope: ScopeId) {
        self.cells[cell.0 as usize] = scope;
    }

    /// Whether two cells currently resolve to the same scope record.
    pub fn same_scope(&self, a: ScopeCell, b: ScopeCell) -> bool {
        self.id_of(a) == self.id_of(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_redirect_is_shared() {
        let mut arena = ScopeArena::new();
        let a = arena.new_scope(0, 10);
        let b = arena.new_scope(5, 20);
        let cell = arena.new_cell(a);
        let alias = cell;

        arena.redirect(cell, b);
        assert_eq!(arena.id_of(alias), b);
        assert!(arena.same_scope(cell, alias));
    }
}
