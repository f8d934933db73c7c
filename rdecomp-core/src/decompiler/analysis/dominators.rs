//! Dominator and Post-Dominator Trees
//!
//! # Algorithm
//! Cooper, Harvey and Kennedy's iterative scheme: process nodes in reverse postorder,
//! intersecting the current idom candidates of processed predecessors by walking up the
//! partially built tree, until nothing changes. After the idoms are fixed, a DFS over the
//! tree assigns pre/post numbers so that `dominates` is two integer comparisons.
//!
//! Post-dominators run the same algorithm on the reversed graph rooted at a virtual exit.
//! The exit is connected to every block that returns or leaves through an unknown edge;
//! regions that never reach an exit (infinite loops) are attached at their deepest block
//! so every reachable block gets an immediate post-dominator.

use crate::decompiler::analysis::reachability::Reachability;
use crate::decompiler::ir::{BlockId, EdgeTarget, Function};
use bitvec::prelude::*;
use smallvec::SmallVec;

const NONE: u32 = u32::MAX;

/// Immediate-dominator tree over graph nodes `0..n`.
#[derive(Debug, Clone)]
struct DomTree {
    idom: Vec<u32>,
    pre: Vec<u32>,
    post: Vec<u32>,
}

impl DomTree {
    fn build(n: usize, root: usize, succs: &[SmallVec<[u32; 2]>]) -> Self {
        // Postorder by iterative DFS
        let mut order: Vec<u32> = Vec::with_capacity(n);
        let mut seen: BitVec<u32> = bitvec![u32, Lsb0; 0; n];
        let mut stack: Vec<(u32, usize)> = vec![(root as u32, 0)];
        seen.set(root, true);
        while let Some(top) = stack.last_mut() {
            let (node, pos) = *top;
            top.1 += 1;
            match succs[node as usize].get(pos) {
                Some(&s) => {
                    if !seen[s as usize] {
                        seen.set(s as usize, true);
                        stack.push((s, 0));
                    }
                }
                None => {
                    order.push(node);
                    stack.pop();
                }
            }
        }
        order.reverse();

        let mut rpo_num = vec![NONE; n];
        for (i, &node) in order.iter().enumerate() {
            rpo_num[node as usize] = i as u32;
        }
        let mut preds: Vec<SmallVec<[u32; 2]>> = vec![SmallVec::new(); n];
        for &node in order.iter() {
            for &s in succs[node as usize].iter() {
                preds[s as usize].push(node);
            }
        }

        let mut idom = vec![NONE; n];
        idom[root] = root as u32;
        let mut changed = true;
        while changed {
            changed = false;
            for &node in order.iter().skip(1) {
                let mut new_idom = NONE;
                for &p in preds[node as usize].iter() {
                    if idom[p as usize] == NONE {
                        continue;
                    }
                    new_idom = if new_idom == NONE {
                        p
                    } else {
                        Self::intersect(&idom, &rpo_num, p, new_idom)
                    };
                }
                if new_idom != NONE && idom[node as usize] != new_idom {
                    idom[node as usize] = new_idom;
                    changed = true;
                }
            }
        }
        idom[root] = NONE;

        // Tree numbering; children visited in reverse postorder
        let mut children: Vec<SmallVec<[u32; 4]>> = vec![SmallVec::new(); n];
        for &node in order.iter().skip(1) {
            let parent = idom[node as usize];
            if parent != NONE {
                children[parent as usize].push(node);
            }
        }
        let mut pre = vec![NONE; n];
        let mut post = vec![NONE; n];
        let mut counter = 0u32;
        let mut stack: Vec<(u32, usize)> = vec![(root as u32, 0)];
        pre[root] = counter;
        counter += 1;
        while let Some(top) = stack.last_mut() {
            let (node, pos) = *top;
            top.1 += 1;
            match children[node as usize].get(pos) {
                Some(&child) => {
                    pre[child as usize] = counter;
                    counter += 1;
                    stack.push((child, 0));
                }
                None => {
                    post[node as usize] = counter;
                    counter += 1;
                    stack.pop();
                }
            }
        }

        Self { idom, pre, post }
    }

    #[inline]
    fn intersect(idom: &[u32], rpo_num: &[u32], mut a: u32, mut b: u32) -> u32 {
        while a != b {
            while rpo_num[a as usize] > rpo_num[b as usize] {
                a = idom[a as usize];
            }
            while rpo_num[b as usize] > rpo_num[a as usize] {
                b = idom[b as usize];
            }
        }
        a
    }

    #[inline]
    fn contains(&self, node: usize) -> bool {
        self.pre.get(node).map(|&p| p != NONE).unwrap_or(false)
    }

    #[inline] // Hot path
    fn dominates(&self, a: usize, b: usize) -> bool {
        self.contains(a) && self.contains(b) && self.pre[a] <= self.pre[b] && self.post[b] <= self.post[a]
    }

    #[inline]
    fn parent(&self, node: usize) -> Option<u32> {
        match self.idom.get(node) {
            Some(&p) if p != NONE => Some(p),
            _ => None,
        }
    }
}

/// Dominator tree of a function's reachable blocks.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    tree: DomTree,
}

impl DominatorTree {
    pub fn compute(func: &Function) -> Self {
        let succs: Vec<SmallVec<[u32; 2]>> = func
            .blocks
            .iter()
            .map(|b| b.successors().map(|s| s.0).collect())
            .collect();
        let n = func.blocks.len();
        if n == 0 {
            return Self {
                tree: DomTree {
                    idom: Vec::new(),
                    pre: Vec::new(),
                    post: Vec::new(),
                },
            };
        }
        Self {
            tree: DomTree::build(n, func.entry.index(), &succs),
        }
    }

    /// Immediate dominator; `None` for the entry and for unreachable blocks.
    #[inline]
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.tree.parent(block.index()).map(BlockId)
    }

    /// `a` dominates `b` (reflexive). False when either block is unreachable.
    #[inline]
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.tree.dominates(a.index(), b.index())
    }

    #[inline]
    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Nearest block dominating both `a` and `b`.
    pub fn nearest_common_dominator(&self, a: BlockId, b: BlockId) -> Option<BlockId> {
        let mut candidate = Some(a);
        while let Some(c) = candidate {
            if self.dominates(c, b) {
                return Some(c);
            }
            candidate = self.idom(c);
        }
        None
    }
}

/// Post-dominator tree rooted at a virtual exit node.
#[derive(Debug, Clone)]
pub struct PostDominatorTree {
    tree: DomTree,
    exit: usize,
}

impl PostDominatorTree {
    pub fn compute(func: &Function, reach: &Reachability) -> Self {
        let n = func.blocks.len();
        let exit = n;
        // Reversed graph: node -> its predecessors, exit -> exiting blocks
        let mut rsuccs: Vec<SmallVec<[u32; 2]>> = vec![SmallVec::new(); n + 1];
        for &b in reach.rpo.iter() {
            let block = func.block(b);
            let mut exits = block.edges.is_empty();
            for edge in block.edges.iter() {
                match edge.target {
                    EdgeTarget::Block(s) => {
                        if !rsuccs[s.index()].contains(&b.0) {
                            rsuccs[s.index()].push(b.0);
                        }
                    }
                    EdgeTarget::Unknown(_) => exits = true,
                }
            }
            if exits {
                rsuccs[exit].push(b.0);
            }
        }

        // Attach blocks that never reach an exit, deepest first
        let mut reached: BitVec<u32> = bitvec![u32, Lsb0; 0; n + 1];
        Self::mark_from(exit, &rsuccs, &mut reached);
        for &b in reach.postorder.iter() {
            if !reached[b.index()] {
                rsuccs[exit].push(b.0);
                Self::mark_from(b.index(), &rsuccs, &mut reached);
            }
        }

        Self {
            tree: DomTree::build(n + 1, exit, &rsuccs),
            exit,
        }
    }

    fn mark_from(start: usize, succs: &[SmallVec<[u32; 2]>], reached: &mut BitVec<u32>) {
        let mut stack = vec![start];
        reached.set(start, true);
        while let Some(node) = stack.pop() {
            for &s in succs[node].iter() {
                if !reached[s as usize] {
                    reached.set(s as usize, true);
                    stack.push(s as usize);
                }
            }
        }
    }

    /// Immediate post-dominator; `None` when it is the virtual exit.
    #[inline]
    pub fn ipdom(&self, block: BlockId) -> Option<BlockId> {
        match self.tree.parent(block.index()) {
            Some(p) if p as usize != self.exit => Some(BlockId(p)),
            _ => None,
        }
    }

    /// `a` post-dominates `b` (reflexive).
    #[inline]
    pub fn post_dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.tree.dominates(a.index(), b.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::ir::{Edge, EdgeKind, FuncId, Opcode, Value};

    /// bb0 -> bb1, bb2; bb1 -> bb3; bb2 -> bb3; bb3 returns
    fn diamond() -> Function {
        let mut func = Function::new(FuncId(0), "diamond", 0);
        for i in 0..4u64 {
            func.add_block(i * 4, i * 4);
        }
        func.append_inst(BlockId(0), Opcode::Branch { cond: Value::Const(1) }, 0);
        func.block_mut(BlockId(0)).edges.push(Edge::to_block(BlockId(1), EdgeKind::True));
        func.block_mut(BlockId(0)).edges.push(Edge::to_block(BlockId(2), EdgeKind::False));
        for b in [1u32, 2] {
            func.append_inst(BlockId(b), Opcode::Jump, 0);
            func.block_mut(BlockId(b)).edges.push(Edge::to_block(BlockId(3), EdgeKind::Unconditional));
        }
        func.append_inst(BlockId(3), Opcode::Return { value: None }, 0);
        func.rebuild_preds();
        func
    }

    #[test]
    fn test_diamond_dominators() {
        let func = diamond();
        let dom = DominatorTree::compute(&func);
        assert_eq!(dom.idom(BlockId(3)), Some(BlockId(0)));
        assert!(dom.dominates(BlockId(0), BlockId(2)));
        assert!(!dom.dominates(BlockId(1), BlockId(3)));
        assert_eq!(dom.nearest_common_dominator(BlockId(1), BlockId(2)), Some(BlockId(0)));
    }

    #[test]
    fn test_diamond_post_dominators() {
        let func = diamond();
        let reach = Reachability::compute(&func);
        let pdom = PostDominatorTree::compute(&func, &reach);
        assert_eq!(pdom.ipdom(BlockId(0)), Some(BlockId(3)));
        assert_eq!(pdom.ipdom(BlockId(1)), Some(BlockId(3)));
        assert_eq!(pdom.ipdom(BlockId(3)), None);
    }

    #[test]
    fn test_infinite_loop_still_has_post_dominators() {
        // bb0 -> bb1; bb1 -> bb1
        let mut func = Function::new(FuncId(0), "spin", 0);
        func.add_block(0, 0);
        func.add_block(4, 4);
        func.append_inst(BlockId(0), Opcode::Jump, 0);
        func.block_mut(BlockId(0)).edges.push(Edge::to_block(BlockId(1), EdgeKind::Unconditional));
        func.append_inst(BlockId(1), Opcode::Jump, 4);
        func.block_mut(BlockId(1)).edges.push(Edge::to_block(BlockId(1), EdgeKind::Unconditional));
        func.rebuild_preds();
        let reach = Reachability::compute(&func);
        let pdom = PostDominatorTree::compute(&func, &reach);
        assert_eq!(pdom.ipdom(BlockId(0)), Some(BlockId(1)));
    }
}
