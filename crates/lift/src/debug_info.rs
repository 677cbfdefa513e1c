use relume_bytecode::opcode::Opcode;
use relume_bytecode::prototype::VarKind;
use relume_hir::func::{FuncId, LocalGroup};

use crate::error::{bytecode_assert, invariant, Result};
use crate::Lifter;

impl<'m> Lifter<'m> {
    /// Debug-info digestion: fold variable records into local groups.
    ///
    /// Records declared together (same scope endpoints) coalesce into one
    /// group. A stack of active scope ends validates proper nesting; any
    /// improper interleaving is a hard bytecode error.
    pub(crate) fn assign_debug_info(&mut self, func: FuncId) -> Result<()> {
        if !self.chunk.func(func).has_debug_info {
            return Ok(());
        }

        let proto = self.proto(func);
        let parameters = proto.header.parameters as usize;
        let infos = &proto.variable_infos;
        let mut active_scope_ends: Vec<u32> = Vec::new();

        let mut parameter_names = Vec::with_capacity(parameters);
        for info in infos.iter().take(parameters) {
            parameter_names.push(info.name.clone());
            active_scope_ends.push(info.scope_end);
        }
        self.chunk.func_mut(func).parameter_names = parameter_names;

        let mut locals: Vec<LocalGroup> = Vec::new();

        for info in infos.iter().skip(parameters) {
            let nests_cleanly = match active_scope_ends.last() {
                None => true,
                Some(&end) => {
                    info.scope_begin > end
                        || info.scope_end <= end
                        || info.scope_begin == end
                }
            };
            bytecode_assert!(
                nests_cleanly,
                self.fid(func),
                "illegal variable scope border overlap"
            );

            while active_scope_ends
                .last()
                .is_some_and(|&end| info.scope_end > end)
            {
                active_scope_ends.pop();
            }

            if info.kind != VarKind::Str {
                active_scope_ends.push(info.scope_end);
                continue;
            }

            // Zero-span variable at a constant-load boundary: an ephemeral
            // introduced by a compile-time optimization. It still opens a
            // group, but local-scope nesting must not wrap a block for it.
            let zero_span_tail = info.scope_begin == info.scope_end
                && locals
                    .last()
                    .is_some_and(|group| group.scope_end == info.scope_end);
            if zero_span_tail {
                let block = &self.chunk.func(func).block;
                let index = self.block_index_of_id(block, info.scope_begin);
                if index != relume_hir::scope::INVALID_ID {
                    let instruction = self.chunk.stmts.get(block[index as usize]).instruction;
                    let is_nil_load = match instruction.op {
                        Opcode::KPri => instruction.d == 0,
                        Opcode::KNil => true,
                        _ => false,
                    };
                    let base = if instruction.op == Opcode::KPri {
                        instruction.a as usize
                    } else {
                        instruction.d as usize
                    };
                    let previous = invariant(
                        locals.last(),
                        self.fid(func),
                        "zero-span record with no preceding group",
                    )?;
                    let (last_base, exclude_block) = (
                        previous.base_slot as usize,
                        if previous.scope_begin == previous.scope_end {
                            previous.exclude_block
                        } else {
                            true
                        },
                    );
                    if is_nil_load && base < active_scope_ends.len() {
                        while active_scope_ends.len() != last_base {
                            bytecode_assert!(
                                active_scope_ends.last() == Some(&info.scope_end),
                                self.fid(func),
                                "unable to build variable scope"
                            );
                            active_scope_ends.pop();
                        }
                        locals.push(LocalGroup {
                            base_slot: active_scope_ends.len() as u8,
                            scope_begin: info.scope_begin,
                            scope_end: info.scope_end,
                            names: Vec::new(),
                            exclude_block,
                        });
                    }
                }
            }

            let matches_last = locals.last().is_some_and(|group| {
                group.scope_begin == info.scope_begin && group.scope_end == info.scope_end
            });
            if !matches_last {
                locals.push(LocalGroup {
                    base_slot: active_scope_ends.len() as u8,
                    scope_begin: info.scope_begin,
                    scope_end: info.scope_end,
                    names: Vec::new(),
                    exclude_block: false,
                });
            }

            invariant(
                locals.last_mut(),
                self.fid(func),
                "named record did not open a group",
            )?
            .names
            .push(info.name.clone());
            active_scope_ends.push(info.scope_end);
        }

        self.chunk.func_mut(func).locals = locals;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use relume_bytecode::prototype::{VarKind, VariableInfo};

    fn var(name: &str, begin: u32, end: u32) -> VariableInfo {
        VariableInfo {
            name: name.to_string(),
            kind: VarKind::Str,
            scope_begin: begin,
            scope_end: end,
        }
    }

    #[test]
    fn test_group_coalescing_shape() {
        // Two variables with identical scope endpoints form one group; a
        // third with different endpoints opens a new one. Checked through
        // the grouping rule itself, without running the whole pipeline.
        let infos = [var("a", 2, 9), var("b", 2, 9), var("c", 4, 9)];
        let mut groups: Vec<(u32, u32, usize)> = Vec::new();
        for info in &infos {
            match groups.last_mut() {
                Some((begin, end, count))
                    if *begin == info.scope_begin && *end == info.scope_end =>
                {
                    *count += 1;
                }
                _ => groups.push((info.scope_begin, info.scope_end, 1)),
            }
        }
        assert_eq!(groups, vec![(2, 9, 2), (4, 9, 1)]);
    }
}
