//! Natural Loop Detection
//!
//! # Algorithm
//! 1. A back edge is an edge `u -> h` where `h` dominates `u`
//! 2. The body of the loop headed by `h` is `h` plus every block that reaches a latch
//!    without passing through `h` (reverse walk over predecessors)
//! 3. Loops sharing a header are one loop with several latches
//! 4. Nesting follows body inclusion; loops are stored innermost-first
//!
//! Retreating edges whose target does not dominate the source are irreducible. They are
//! recorded but form no loop; the structurer lowers them to gotos.

use crate::decompiler::analysis::dominators::DominatorTree;
use crate::decompiler::analysis::reachability::Reachability;
use crate::decompiler::ir::{BlockId, Function};
use bitvec::prelude::*;
use smallvec::SmallVec;

/// A natural loop.
///
/// # Memory Optimization
/// - `body` is a `BitVec` over block indices (1 bit per block)
/// - `latches` and `exits` use `SmallVec` (most loops have 1-2 of each)
#[derive(Debug, Clone)]
pub struct NaturalLoop {
    pub header: BlockId,
    /// Sources of back edges to `header`, in reverse postorder
    pub latches: SmallVec<[BlockId; 2]>,
    pub body: BitVec<u32>,
    /// Blocks outside the body targeted from inside it, in reverse postorder
    pub exits: SmallVec<[BlockId; 2]>,
    /// 1 for outermost loops
    pub depth: u32,
    /// Index of the enclosing loop in [`LoopForest::loops`]
    pub parent: Option<usize>,
}

impl NaturalLoop {
    #[inline]
    pub fn contains(&self, block: BlockId) -> bool {
        self.body.get(block.index()).map(|b| *b).unwrap_or(false)
    }

    pub fn size(&self) -> usize {
        self.body.count_ones()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopForest {
    /// Innermost-first
    pub loops: Vec<NaturalLoop>,
    header_of: Vec<Option<u32>>,
    innermost: Vec<Option<u32>>,
    /// Retreating edges that are not back edges
    pub irreducible_edges: Vec<(BlockId, BlockId)>,
}

impl LoopForest {
    pub fn compute(func: &Function, dom: &DominatorTree, reach: &Reachability) -> Self {
        let n = func.blocks.len();
        let mut by_header: Vec<SmallVec<[BlockId; 2]>> = vec![SmallVec::new(); n];
        let mut irreducible_edges: Vec<(BlockId, BlockId)> = Vec::new();

        for &u in reach.rpo.iter() {
            let Some(u_pos) = reach.rpo_position(u) else {
                continue;
            };
            for h in func.block(u).successors() {
                if dom.dominates(h, u) {
                    if !by_header[h.index()].contains(&u) {
                        by_header[h.index()].push(u);
                    }
                } else if reach.rpo_position(h).map(|p| p <= u_pos).unwrap_or(false) {
                    irreducible_edges.push((u, h));
                }
            }
        }
        for &(from, to) in irreducible_edges.iter() {
            log::debug!("{}: irreducible edge {} -> {}", func.name, from, to);
        }

        let mut loops: Vec<NaturalLoop> = Vec::new();
        for &h in reach.rpo.iter() {
            let latches = &by_header[h.index()];
            if latches.is_empty() {
                continue;
            }
            let mut body: BitVec<u32> = bitvec![u32, Lsb0; 0; n];
            body.set(h.index(), true);
            let mut stack: Vec<BlockId> = Vec::new();
            for &latch in latches.iter() {
                if !body[latch.index()] {
                    body.set(latch.index(), true);
                    stack.push(latch);
                }
            }
            while let Some(b) = stack.pop() {
                for &p in func.block(b).preds.iter() {
                    if reach.is_reachable(p) && !body[p.index()] {
                        body.set(p.index(), true);
                        stack.push(p);
                    }
                }
            }

            let mut exits: SmallVec<[BlockId; 2]> = SmallVec::new();
            for b in body.iter_ones() {
                for s in func.block(BlockId::from_index(b)).successors() {
                    if !body[s.index()] && !exits.contains(&s) {
                        exits.push(s);
                    }
                }
            }
            exits.sort_by_key(|&b| reach.order_key(b));
            let mut latches = latches.clone();
            latches.sort_by_key(|&b| reach.order_key(b));

            loops.push(NaturalLoop {
                header: h,
                latches,
                body,
                exits,
                depth: 1,
                parent: None,
            });
        }

        // Innermost-first: a nested body is a strict subset of its parent's
        loops.sort_by_key(|l| (l.size(), reach.order_key(l.header)));
        for i in 0..loops.len() {
            let header = loops[i].header;
            loops[i].parent = (i + 1..loops.len()).find(|&j| loops[j].contains(header));
        }
        for i in (0..loops.len()).rev() {
            loops[i].depth = match loops[i].parent {
                Some(p) => loops[p].depth + 1,
                None => 1,
            };
        }

        let mut header_of = vec![None; n];
        let mut innermost = vec![None; n];
        for (i, l) in loops.iter().enumerate() {
            header_of[l.header.index()] = Some(i as u32);
            for b in l.body.iter_ones() {
                if innermost[b].is_none() {
                    innermost[b] = Some(i as u32);
                }
            }
        }

        Self {
            loops,
            header_of,
            innermost,
            irreducible_edges,
        }
    }

    /// Index of the loop headed by `block`.
    #[inline]
    pub fn loop_with_header(&self, block: BlockId) -> Option<usize> {
        self.header_of.get(block.index()).copied().flatten().map(|i| i as usize)
    }

    /// Index of the innermost loop containing `block`.
    #[inline]
    pub fn innermost_loop(&self, block: BlockId) -> Option<usize> {
        self.innermost.get(block.index()).copied().flatten().map(|i| i as usize)
    }

    #[inline]
    pub fn get(&self, index: usize) -> &NaturalLoop {
        &self.loops[index]
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::ir::{Edge, EdgeKind, FuncId, Opcode, Value};

    fn link(func: &mut Function, from: u32, targets: &[u32]) {
        let op = match targets.len() {
            0 => Opcode::Return { value: None },
            1 => Opcode::Jump,
            _ => Opcode::Branch { cond: Value::Const(1) },
        };
        func.append_inst(BlockId(from), op, u64::from(from));
        let kinds = [EdgeKind::True, EdgeKind::False];
        for (i, &t) in targets.iter().enumerate() {
            let kind = if targets.len() == 1 { EdgeKind::Unconditional } else { kinds[i] };
            func.block_mut(BlockId(from)).edges.push(Edge::to_block(BlockId(t), kind));
        }
    }

    #[test]
    fn test_nested_loops_are_innermost_first() {
        // 0 -> 1; 1 -> 2,4; 2 -> 3,2; 3 -> 1; 4 ret
        let mut func = Function::new(FuncId(0), "nested", 0);
        for i in 0..5u64 {
            func.add_block(i, i);
        }
        link(&mut func, 0, &[1]);
        link(&mut func, 1, &[2, 4]);
        link(&mut func, 2, &[3, 2]);
        link(&mut func, 3, &[1]);
        link(&mut func, 4, &[]);
        func.rebuild_preds();
        let reach = Reachability::compute(&func);
        let dom = DominatorTree::compute(&func);
        let forest = LoopForest::compute(&func, &dom, &reach);
        assert_eq!(forest.loops.len(), 2);
        assert_eq!(forest.loops[0].header, BlockId(2));
        assert_eq!(forest.loops[0].depth, 2);
        assert_eq!(forest.loops[1].header, BlockId(1));
        assert_eq!(forest.loops[0].parent, Some(1));
        assert_eq!(forest.loops[1].exits.as_slice(), &[BlockId(4)]);
        assert_eq!(forest.innermost_loop(BlockId(3)), Some(1));
        assert!(forest.irreducible_edges.is_empty());
    }

    #[test]
    fn test_irreducible_edge_is_not_a_loop() {
        // 0 -> 1,2; 1 -> 2; 2 -> 1,3; 3 ret
        let mut func = Function::new(FuncId(0), "tangle", 0);
        for i in 0..4u64 {
            func.add_block(i, i);
        }
        link(&mut func, 0, &[1, 2]);
        link(&mut func, 1, &[2]);
        link(&mut func, 2, &[1, 3]);
        link(&mut func, 3, &[]);
        func.rebuild_preds();
        let reach = Reachability::compute(&func);
        let dom = DominatorTree::compute(&func);
        let forest = LoopForest::compute(&func, &dom, &reach);
        assert!(forest.is_empty());
        assert_eq!(forest.irreducible_edges.len(), 1);
    }
}
