//! Reachability and traversal orders.

use crate::decompiler::ir::{BlockId, Function};
use bitvec::prelude::*;

/// Depth-first orders from the entry block.
///
/// Successors are visited in edge order, so the orders are deterministic for a given CFG.
#[derive(Debug, Clone)]
pub struct Reachability {
    /// Reachable blocks in postorder
    pub postorder: Vec<BlockId>,
    /// Reachable blocks in reverse postorder (entry first)
    pub rpo: Vec<BlockId>,
    /// Position of each block in `rpo` (`u32::MAX` for unreachable blocks)
    rpo_index: Vec<u32>,
    pub reachable: BitVec<u32>,
}

impl Reachability {
    pub fn compute(func: &Function) -> Self {
        let n = func.blocks.len();
        let mut reachable: BitVec<u32> = bitvec![u32, Lsb0; 0; n];
        let mut postorder: Vec<BlockId> = Vec::with_capacity(n);

        if func.entry.index() < n {
            // Iterative DFS: (block, next successor position)
            let mut stack: Vec<(BlockId, usize)> = vec![(func.entry, 0)];
            reachable.set(func.entry.index(), true);
            while let Some(top) = stack.last_mut() {
                let (block, pos) = *top;
                top.1 += 1;
                match func.block(block).successors().nth(pos) {
                    Some(succ) => {
                        if !reachable[succ.index()] {
                            reachable.set(succ.index(), true);
                            stack.push((succ, 0));
                        }
                    }
                    None => {
                        postorder.push(block);
                        stack.pop();
                    }
                }
            }
        }

        let rpo: Vec<BlockId> = postorder.iter().rev().copied().collect();
        let mut rpo_index = vec![u32::MAX; n];
        for (i, b) in rpo.iter().enumerate() {
            rpo_index[b.index()] = i as u32;
        }
        Self {
            postorder,
            rpo,
            rpo_index,
            reachable,
        }
    }

    #[inline]
    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.reachable.get(block.index()).map(|b| *b).unwrap_or(false)
    }

    /// Position in reverse postorder, `None` for unreachable blocks.
    #[inline]
    pub fn rpo_position(&self, block: BlockId) -> Option<usize> {
        match self.rpo_index.get(block.index()) {
            Some(&i) if i != u32::MAX => Some(i as usize),
            _ => None,
        }
    }

    /// Sort key that puts reachable blocks in reverse postorder and unreachable blocks last.
    #[inline]
    pub fn order_key(&self, block: BlockId) -> (u32, u32) {
        (
            self.rpo_index.get(block.index()).copied().unwrap_or(u32::MAX),
            block.0,
        )
    }
}
