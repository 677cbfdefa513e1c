use relume_bytecode::opcode::Opcode;
use relume_hir::expr::{BinaryOp, Expr, ExprId, UnaryOp};
use relume_hir::scope::INVALID_ID;
use rustc_hash::FxHashMap;

use crate::Lifter;

/// What a condition node's jump means for the short-circuit expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,
    CmpEq,
    CmpNe,
    /// Jump (carrying the operand as a value) when the operand is truthy.
    TruthyTest,
    /// Jump (carrying the operand as a value) when the operand is falsy.
    FalsyTest,
}

impl NodeKind {
    /// The node kind for a folded compare/test statement. `swapped`
    /// operand order mirrors the comparison.
    pub fn from_opcode(op: Opcode, swapped: bool) -> NodeKind {
        match op {
            Opcode::IsLt => {
                if swapped {
                    NodeKind::CmpGt
                } else {
                    NodeKind::CmpLt
                }
            }
            Opcode::IsGe => {
                if swapped {
                    NodeKind::CmpLe
                } else {
                    NodeKind::CmpGe
                }
            }
            Opcode::IsLe => {
                if swapped {
                    NodeKind::CmpGe
                } else {
                    NodeKind::CmpLe
                }
            }
            Opcode::IsGt => {
                if swapped {
                    NodeKind::CmpLt
                } else {
                    NodeKind::CmpGt
                }
            }
            Opcode::IsEqV | Opcode::IsEqS | Opcode::IsEqN | Opcode::IsEqP => NodeKind::CmpEq,
            Opcode::IsNeV | Opcode::IsNeS | Opcode::IsNeN | Opcode::IsNeP => NodeKind::CmpNe,
            Opcode::IsT | Opcode::IsTC => NodeKind::TruthyTest,
            _ => NodeKind::FalsyTest,
        }
    }

    fn compare_op(self) -> Option<BinaryOp> {
        Some(match self {
            NodeKind::CmpLt => BinaryOp::LessThan,
            NodeKind::CmpLe => BinaryOp::LessEqual,
            NodeKind::CmpGt => BinaryOp::GreaterThan,
            NodeKind::CmpGe => BinaryOp::GreaterEqual,
            NodeKind::CmpEq => BinaryOp::Equal,
            NodeKind::CmpNe => BinaryOp::NotEqual,
            _ => return None,
        })
    }

    fn inverted_compare_op(self) -> Option<BinaryOp> {
        Some(match self {
            NodeKind::CmpLt => BinaryOp::GreaterEqual,
            NodeKind::CmpLe => BinaryOp::GreaterThan,
            NodeKind::CmpGt => BinaryOp::LessEqual,
            NodeKind::CmpGe => BinaryOp::LessThan,
            NodeKind::CmpEq => BinaryOp::NotEqual,
            NodeKind::CmpNe => BinaryOp::Equal,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConditionMode {
    /// Merging chained conditions that guard one body.
    Statement,
    /// Collapsing a multi-block short-circuit expression into an
    /// assignment's right-hand side.
    Assignment,
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    attached_label: u32,
    exit_label: u32,
    operands: Vec<ExprId>,
}

/// Partial expression during the right-to-left merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Partial {
    /// Fallthrough: the body executes / the final value stands.
    Neutral,
    /// The materialized-boolean terminal: only an or-chain can end here.
    False,
    Built(ExprId),
}

/// Rebuilds a single boolean expression from a sequence of short-circuit
/// condition nodes and their exit labels.
///
/// Nodes are added top-to-bottom; the merge runs bottom-up. A node whose
/// exit is the false sink contributes `not P and rest`; the true or value
/// sink contributes `P or rest` (with test nodes carrying their operand as
/// the value); an exit into another node's attached label folds as a
/// nested grouping, provided the partial expression built so far ends in
/// that node's own partial.
pub(crate) struct ConditionBuilder {
    mode: ConditionMode,
    sink_label: u32,
    true_label: u32,
    false_label: u32,
    nodes: Vec<Node>,
}

impl ConditionBuilder {
    pub fn new(mode: ConditionMode, sink_label: u32, true_label: u32, false_label: u32) -> Self {
        ConditionBuilder {
            mode,
            sink_label,
            true_label,
            false_label,
            nodes: Vec::new(),
        }
    }

    pub fn add_node(
        &mut self,
        kind: NodeKind,
        attached_label: u32,
        exit_label: u32,
        operands: Vec<ExprId>,
    ) {
        self.nodes.push(Node {
            kind,
            attached_label,
            exit_label,
            operands,
        });
    }

    pub fn build_condition(&self, lifter: &mut Lifter<'_>) -> Option<ExprId> {
        if self.nodes.is_empty() {
            return None;
        }

        // Bool constructs terminate in the false assignment; everything
        // else falls through into the body or final value.
        let has_bool_labels = self.true_label != INVALID_ID || self.false_label != INVALID_ID;
        let terminal = if self.mode == ConditionMode::Assignment
            && has_bool_labels
            && self.last_node_is_compare()
        {
            Partial::False
        } else {
            Partial::Neutral
        };

        let mut by_label: FxHashMap<u32, Partial> = FxHashMap::default();
        let mut current = terminal;

        for node in self.nodes.iter().rev() {
            current = self.merge_node(lifter, node, current, &by_label)?;
            if node.attached_label != INVALID_ID {
                by_label.insert(node.attached_label, current);
            }
        }

        match current {
            Partial::Built(expr) => Some(expr),
            _ => None,
        }
    }

    fn last_node_is_compare(&self) -> bool {
        self.nodes
            .last()
            .is_some_and(|n| n.kind.compare_op().is_some())
    }

    fn merge_node(
        &self,
        lifter: &mut Lifter<'_>,
        node: &Node,
        next: Partial,
        by_label: &FxHashMap<u32, Partial>,
    ) -> Option<Partial> {
        let exit = node.exit_label;

        if exit == self.false_label && self.false_label != INVALID_ID {
            // Jump means false / body skipped: the chain continues only
            // when the inverted predicate holds.
            let inverted = self.atom(lifter, node, true)?;
            return self.and(lifter, inverted, next);
        }
        if exit == self.true_label && self.true_label != INVALID_ID {
            // Jump means true: the predicate short-circuits the chain.
            let predicate = self.atom(lifter, node, false)?;
            return self.or(lifter, predicate, next);
        }
        if exit == self.sink_label || exit == INVALID_ID {
            return match (self.mode, node.kind) {
                // A falsy-carrying exit yields its operand as the value:
                // `x and rest`.
                (ConditionMode::Assignment, NodeKind::FalsyTest) => {
                    let value = self.atom(lifter, node, true)?;
                    self.and(lifter, value, next)
                }
                // Truthy exits carry the operand (or the comparison) as
                // the short-circuit value: `x or rest`.
                _ => {
                    let value = self.atom(lifter, node, false)?;
                    self.or(lifter, value, next)
                }
            };
        }

        // Exit into a later node of the chain: nested grouping.
        let target = *by_label.get(&exit)?;
        let Partial::Built(target_id) = target else {
            // Jumping to a node that reduced to a sentinel adds nothing.
            return Some(next);
        };
        match next {
            Partial::Built(next_id) if next_id == target_id => Some(target),
            Partial::Built(next_id) => {
                let (op, lhs, rhs) = match lifter.chunk.exprs.get(next_id) {
                    Expr::Binary { op, lhs, rhs } => (*op, *lhs, *rhs),
                    _ => return None,
                };
                if rhs != target_id {
                    return None;
                }
                match op {
                    BinaryOp::And => {
                        let value = self.atom(lifter, node, false)?;
                        let grouped = self.or(lifter, value, Partial::Built(lhs))?;
                        match grouped {
                            Partial::Built(grouped) => self.and_built(lifter, grouped, target_id),
                            _ => None,
                        }
                    }
                    BinaryOp::Or => {
                        let inverted = self.atom(lifter, node, true)?;
                        let grouped = self.and(lifter, inverted, Partial::Built(lhs))?;
                        match grouped {
                            Partial::Built(grouped) => self.or_built(lifter, grouped, target_id),
                            _ => None,
                        }
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// The node's predicate as an expression; `inverted` flips compares
    /// and wraps tests in `not`.
    fn atom(&self, lifter: &mut Lifter<'_>, node: &Node, inverted: bool) -> Option<ExprId> {
        match node.kind {
            NodeKind::TruthyTest | NodeKind::FalsyTest => {
                let operand = *node.operands.last()?;
                let positive = node.kind == NodeKind::TruthyTest;
                if positive != inverted {
                    Some(operand)
                } else {
                    Some(lifter.chunk.exprs.alloc(Expr::Unary {
                        op: UnaryOp::Not,
                        operand,
                    }))
                }
            }
            _ => {
                if node.operands.len() != 2 {
                    return None;
                }
                let op = if inverted {
                    node.kind.inverted_compare_op()?
                } else {
                    node.kind.compare_op()?
                };
                Some(lifter.chunk.exprs.alloc(Expr::Binary {
                    op,
                    lhs: node.operands[0],
                    rhs: node.operands[1],
                }))
            }
        }
    }

    fn and(&self, lifter: &mut Lifter<'_>, lhs: ExprId, next: Partial) -> Option<Partial> {
        match next {
            Partial::Neutral => Some(Partial::Built(lhs)),
            Partial::False => None,
            Partial::Built(rhs) => self.and_built(lifter, lhs, rhs),
        }
    }

    fn or(&self, lifter: &mut Lifter<'_>, lhs: ExprId, next: Partial) -> Option<Partial> {
        match next {
            Partial::Neutral | Partial::False => Some(Partial::Built(lhs)),
            Partial::Built(rhs) => self.or_built(lifter, lhs, rhs),
        }
    }

    fn and_built(&self, lifter: &mut Lifter<'_>, lhs: ExprId, rhs: ExprId) -> Option<Partial> {
        Some(Partial::Built(lifter.chunk.exprs.alloc(Expr::Binary {
            op: BinaryOp::And,
            lhs,
            rhs,
        })))
    }

    fn or_built(&self, lifter: &mut Lifter<'_>, lhs: ExprId, rhs: ExprId) -> Option<Partial> {
        Some(Partial::Built(lifter.chunk.exprs.alloc(Expr::Binary {
            op: BinaryOp::Or,
            lhs,
            rhs,
        })))
    }
}
