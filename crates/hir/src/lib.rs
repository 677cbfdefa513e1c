pub mod expr;
pub mod func;
pub mod scope;
pub mod stmt;

use expr::ExprArena;
use func::{FuncId, FuncNode};
use scope::ScopeArena;
use stmt::StmtArena;

/// The lifted module: all arenas plus the function tree, rooted at the
/// top-level chunk function.
#[derive(Debug, Default)]
pub struct Chunk {
    pub exprs: ExprArena,
    pub stmts: StmtArena,
    pub scopes: ScopeArena,
    pub funcs: Vec<FuncNode>,
    pub root: Option<FuncId>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_func(&mut self, prototype: usize, level: u32) -> FuncId {
        let id = FuncId(self.funcs.len() as u32);
        self.funcs.push(FuncNode::new(prototype, level));
        id
    }

    pub fn func(&self, id: FuncId) -> &FuncNode {
        &self.funcs[id.0 as usize]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut FuncNode {
        &mut self.funcs[id.0 as usize]
    }
}
