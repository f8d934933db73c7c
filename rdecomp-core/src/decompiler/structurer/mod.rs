//! Control-Flow Structuring
//!
//! Converts a function's CFG into a [`Region`] tree that covers every block exactly once.
//!
//! # Algorithm
//! A single walk from the entry builds sequences block by block:
//! 1. **Placement**: a block is placed inline when the current scope's root dominates
//!    it and it has not been placed yet. Anything else becomes a transfer: `continue`
//!    (loop header), `break` (loop follow), or a `goto` to a labelled block.
//! 2. **Loops**: reaching the header of a natural loop classifies it. `While` when the
//!    header is a pure exit test, `DoWhile` when the single latch holds the exit test,
//!    otherwise an endless `Loop`. The follow is the exit the test leads to, or the
//!    first exit (lowest reverse postorder) inside the enclosing loop.
//! 3. **Branches**: arms are the subgraphs the branch block dominates, ending at the
//!    immediate post-dominator (the join). An arm that never reaches the join turns into
//!    a guard clause and the other arm continues inline.
//! 4. **Switches**: jump-table targets are grouped by block; cases end at the join.
//! 5. **Leftovers**: blocks reached only through gotos (irreducible flow, multi-level
//!    exits) are appended in reverse postorder, then unreachable blocks by id.
//!
//! Every choice follows edge order and reverse postorder, so the tree is deterministic.
//! Flow that fits no construct becomes `Goto`/`GotoUnknown`; structuring itself never
//! fails on a verified function.

pub mod region;

pub use region::{Condition, Region, SwitchCase};

use crate::decompiler::analysis::{
    AnalysisCache, DominatorTree, LoopForest, PostDominatorTree, Reachability,
};
use crate::decompiler::error::DecompileError;
use crate::decompiler::ir::{BlockId, EdgeKind, EdgeTarget, Function, InstId, Opcode, Value};
use bitvec::prelude::*;

/// Loop the current scope is inside.
#[derive(Debug, Clone, Copy)]
struct LoopScope {
    index: usize,
    header: BlockId,
    follow: Option<BlockId>,
}

/// Where a sequence is being built.
#[derive(Debug, Clone, Copy)]
struct Scope {
    /// Blocks dominated by the root may be placed in this scope
    root: BlockId,
    /// Reaching this block ends the sequence without a statement
    follow: Option<BlockId>,
    looping: Option<LoopScope>,
    /// Inside a switch case, where `break` leaves the switch
    in_switch: bool,
}

/// Exit test of a loop block: condition to stay in the loop, successor inside, exit.
type ExitTest = (Condition, BlockId, BlockId);

/// Items of a sequence and whether control falls off its end into the scope's follow.
type Built = (Vec<Region>, bool);

pub struct Structurer<'a> {
    func: &'a Function,
    reach: &'a Reachability,
    dom: &'a DominatorTree,
    pdom: &'a PostDominatorTree,
    loops: &'a LoopForest,
    placed: BitVec<u32>,
    /// Size of each block's dominator subtree
    subtree: Vec<u32>,
    /// Instructions read exactly once, by an instruction of their own block
    local_single_use: BitVec<u32>,
}

impl<'a> Structurer<'a> {
    /// Structure `func` with the analyses cached in `analyses`.
    ///
    /// # Errors
    /// `InvariantViolation` when one of the four CFG analyses has not been computed.
    pub fn structure(func: &Function, analyses: &AnalysisCache) -> Result<Region, DecompileError> {
        let mut structurer = Structurer::new(
            func,
            analyses.reachability()?,
            analyses.dominators()?,
            analyses.post_dominators()?,
            analyses.loops()?,
        );
        Ok(structurer.run())
    }

    /// Structure `func`, computing the analyses it needs.
    pub fn structure_function(func: &Function) -> Region {
        let analyses = AnalysisCache::for_function(func);
        Self::structure(func, &analyses).unwrap_or_else(|_| Region::Sequence(Vec::new()))
    }

    fn new(
        func: &'a Function,
        reach: &'a Reachability,
        dom: &'a DominatorTree,
        pdom: &'a PostDominatorTree,
        loops: &'a LoopForest,
    ) -> Self {
        let n = func.blocks.len();
        let mut subtree = vec![1u32; n];
        for &b in reach.postorder.iter() {
            if let Some(parent) = dom.idom(b) {
                subtree[parent.index()] += subtree[b.index()];
            }
        }

        let locations = func.inst_locations();
        let mut uses = vec![0u32; func.insts.len()];
        let mut outside: BitVec<u32> = bitvec![u32, Lsb0; 0; func.insts.len()];
        for (block, inst) in func.placed_insts() {
            func.inst(inst).op.for_each_operand(|v| {
                if let Value::Inst(def) = v {
                    uses[def.index()] += 1;
                    if locations[def.index()].map(|(b, _)| b) != Some(block) {
                        outside.set(def.index(), true);
                    }
                }
            });
        }
        let local_single_use: BitVec<u32> = uses
            .iter()
            .enumerate()
            .map(|(i, &count)| count == 1 && !outside[i])
            .collect();

        Self {
            func,
            reach,
            dom,
            pdom,
            loops,
            placed: bitvec![u32, Lsb0; 0; n],
            subtree,
            local_single_use,
        }
    }

    fn run(&mut self) -> Region {
        if self.func.blocks.is_empty() {
            return Region::Sequence(Vec::new());
        }
        let entry = self.func.entry;
        let top = Scope {
            root: entry,
            follow: None,
            looping: None,
            in_switch: false,
        };
        let (mut items, _) = self.sequence(entry, top, false);

        let leftovers: Vec<BlockId> = self
            .reach
            .rpo
            .iter()
            .copied()
            .chain(self.func.block_ids().filter(|&b| !self.reach.is_reachable(b)))
            .collect();
        for b in leftovers {
            if !self.placed[b.index()] {
                let (more, _) = self.sequence(b, Scope { root: b, ..top }, false);
                items.extend(more);
            }
        }
        Region::sequence(items)
    }

    /// Build the sequence starting at `start`.
    ///
    /// With `entering_header`, `start` is the header of the scope's own loop and is
    /// placed without being treated as a `continue`.
    fn sequence(&mut self, start: BlockId, scope: Scope, entering_header: bool) -> Built {
        let mut items: Vec<Region> = Vec::new();
        let mut cur = start;
        let mut first = true;
        loop {
            let b = cur;
            if !(first && entering_header) {
                if Some(b) == scope.follow {
                    return (items, true);
                }
                if let Some(jump) = self.loop_jump(b, &scope) {
                    items.push(jump);
                    return (items, false);
                }
                if !self.can_place(b, &scope) {
                    items.push(Region::Goto(b));
                    return (items, false);
                }
                if let Some(index) = self.loops.loop_with_header(b) {
                    let (region, follow) = self.structure_loop(index);
                    items.push(region);
                    match follow {
                        Some(f) => {
                            cur = f;
                            first = false;
                            continue;
                        }
                        None => return (items, false),
                    }
                }
            }
            first = false;
            self.place(b, &mut items);
            match self.after_block(b, &scope, &mut items) {
                Some(next) => cur = next,
                None => return (items, false),
            }
        }
    }

    #[inline]
    fn place(&mut self, block: BlockId, items: &mut Vec<Region>) {
        self.placed.set(block.index(), true);
        items.push(Region::Leaf(block));
    }

    /// `continue` or `break` for transfers to the enclosing loop's header or follow.
    fn loop_jump(&self, target: BlockId, scope: &Scope) -> Option<Region> {
        let l = scope.looping?;
        if target == l.header {
            Some(Region::Continue)
        } else if Some(target) == l.follow {
            // `break` inside a switch would only leave the switch
            Some(if scope.in_switch {
                Region::Goto(target)
            } else {
                Region::Break
            })
        } else {
            None
        }
    }

    fn can_place(&self, block: BlockId, scope: &Scope) -> bool {
        if self.placed[block.index()] {
            return false;
        }
        if block != scope.root && !self.dom.dominates(scope.root, block) {
            return false;
        }
        match scope.looping {
            Some(l) => self.loops.get(l.index).contains(block) || self.is_exit_tail(block),
            None => true,
        }
    }

    /// A chain of single-predecessor blocks ending in a return.
    fn is_exit_tail(&self, block: BlockId) -> bool {
        let mut cur = block;
        for _ in 0..self.func.blocks.len() {
            if self.func.block(cur).preds.len() > 1 {
                return false;
            }
            let Some(term) = self.func.terminator(cur) else {
                return false;
            };
            match &self.func.inst(term).op {
                Opcode::Return { .. } => return true,
                Opcode::Jump => match self.func.block(cur).edges.first().map(|e| e.target) {
                    Some(EdgeTarget::Block(next)) => cur = next,
                    _ => return false,
                },
                _ => return false,
            }
        }
        false
    }

    /// Handle the terminator of a just-placed block. Returns where the sequence goes on.
    fn after_block(&mut self, block: BlockId, scope: &Scope, items: &mut Vec<Region>) -> Option<BlockId> {
        let term = self.func.terminator(block)?;
        match &self.func.inst(term).op {
            Opcode::Jump => {
                let target = self.func.block(block).edges.first()?.target;
                self.follow_edge(target, items)
            }
            Opcode::Branch { .. } => self.structure_branch(block, term, scope, items),
            Opcode::Switch { .. } => self.structure_switch(block, scope, items),
            _ => None,
        }
    }

    fn follow_edge(&self, target: EdgeTarget, items: &mut Vec<Region>) -> Option<BlockId> {
        match target {
            EdgeTarget::Block(next) => Some(next),
            EdgeTarget::Unknown(addr) => {
                items.push(Region::GotoUnknown(addr));
                None
            }
        }
    }

    /// Immediate post-dominator, if the current scope can continue there.
    fn join_of(&self, block: BlockId, scope: &Scope) -> Option<BlockId> {
        let join = self.pdom.ipdom(block)?;
        match scope.looping {
            Some(l) if !self.loops.get(l.index).contains(join) && Some(join) != l.follow => None,
            _ => Some(join),
        }
    }

    /// Region for one arm of a branch or switch at `owner`, ending at `follow`.
    fn arm(&mut self, owner: BlockId, target: EdgeTarget, follow: Option<BlockId>, scope: &Scope) -> Built {
        match target {
            EdgeTarget::Unknown(addr) => (vec![Region::GotoUnknown(addr)], false),
            EdgeTarget::Block(x) if Some(x) == follow => (Vec::new(), true),
            EdgeTarget::Block(x) if x != owner && self.dom.dominates(owner, x) => {
                let arm_scope = Scope {
                    root: x,
                    follow,
                    ..*scope
                };
                self.sequence(x, arm_scope, false)
            }
            EdgeTarget::Block(x) => {
                let jump = self.loop_jump(x, scope).unwrap_or(Region::Goto(x));
                (vec![jump], false)
            }
        }
    }

    fn structure_branch(
        &mut self,
        block: BlockId,
        branch: InstId,
        scope: &Scope,
        items: &mut Vec<Region>,
    ) -> Option<BlockId> {
        let bb = self.func.block(block);
        let t = bb.edge(EdgeKind::True)?.target;
        let f = bb.edge(EdgeKind::False)?.target;
        if t == f {
            return self.follow_edge(t, items);
        }

        let join = self.join_of(block, scope);
        let follow = join.or(scope.follow);
        let cond = Condition {
            block,
            branch,
            negated: false,
        };
        let (then_items, then_falls) = self.arm(block, t, follow, scope);
        let (else_items, else_falls) = self.arm(block, f, follow, scope);
        let next = join.or(if then_falls || else_falls { scope.follow } else { None });

        if then_falls && else_falls {
            push_if(cond, then_items, else_items, items);
            return next;
        }

        // Guard clause: the arm that never reaches the join goes first
        let then_is_guard = match (then_falls, else_falls) {
            (false, true) => true,
            (true, false) => false,
            _ => self.arm_weight(block, t) <= self.arm_weight(block, f),
        };
        if then_is_guard {
            push_if(cond, then_items, Vec::new(), items);
            items.extend(else_items);
        } else {
            push_if(cond.negate(), else_items, Vec::new(), items);
            items.extend(then_items);
        }
        next
    }

    /// Number of blocks an arm owns.
    fn arm_weight(&self, owner: BlockId, target: EdgeTarget) -> u32 {
        match target {
            EdgeTarget::Block(x) if x != owner && self.dom.dominates(owner, x) => self.subtree[x.index()],
            _ => 0,
        }
    }

    fn structure_switch(&mut self, block: BlockId, scope: &Scope, items: &mut Vec<Region>) -> Option<BlockId> {
        let join = self.join_of(block, scope);
        let follow = join.or(scope.follow);

        let mut groups: Vec<(EdgeTarget, Vec<u32>)> = Vec::new();
        for edge in self.func.block(block).edges.iter() {
            let EdgeKind::SwitchCase(value) = edge.kind else {
                continue;
            };
            match groups.iter_mut().find(|(target, _)| *target == edge.target) {
                Some((_, values)) => values.push(value),
                None => groups.push((edge.target, vec![value])),
            }
        }

        let case_scope = Scope {
            in_switch: true,
            ..*scope
        };
        let mut cases: Vec<SwitchCase> = Vec::with_capacity(groups.len());
        let mut any_falls = false;
        for (target, values) in groups {
            let (body, falls) = self.arm(block, target, follow, &case_scope);
            any_falls |= falls;
            cases.push(SwitchCase {
                values,
                body: Region::sequence(body),
            });
        }
        items.push(Region::Switch { block, cases });
        join.or(if any_falls { scope.follow } else { None })
    }

    /// Structure the loop at `index`. Returns the loop region and its follow.
    fn structure_loop(&mut self, index: usize) -> (Region, Option<BlockId>) {
        let l = self.loops.get(index);
        let header = l.header;

        if let Some((cond, inside, exit)) = self.exit_test(header, index).filter(|_| self.is_pure_test(header)) {
            let looping = LoopScope {
                index,
                header,
                follow: Some(exit),
            };
            self.placed.set(header.index(), true);
            let mut body = if inside == header {
                Vec::new()
            } else {
                let scope = Scope {
                    root: header,
                    follow: None,
                    looping: Some(looping),
                    in_switch: false,
                };
                self.sequence(inside, scope, false).0
            };
            trim_trailing_continue(&mut body);
            let region = Region::While {
                cond,
                header: Box::new(Region::Leaf(header)),
                body: Box::new(Region::sequence(body)),
            };
            return (region, Some(exit));
        }

        if let [latch] = l.latches.as_slice() {
            let latch = *latch;
            if let Some((cond, inside, exit)) = self.exit_test(latch, index) {
                if inside == header {
                    let looping = LoopScope {
                        index,
                        header,
                        follow: Some(exit),
                    };
                    let mut body: Vec<Region> = Vec::new();
                    if latch != header {
                        let scope = Scope {
                            root: header,
                            follow: Some(latch),
                            looping: Some(looping),
                            in_switch: false,
                        };
                        body = self.sequence(header, scope, true).0;
                    }
                    if self.placed[latch.index()] {
                        body.push(Region::Goto(latch));
                    } else {
                        self.place(latch, &mut body);
                    }
                    let region = Region::DoWhile {
                        body: Box::new(Region::sequence(body)),
                        cond,
                    };
                    return (region, Some(exit));
                }
            }
        }

        let follow = self.choose_follow(index);
        let scope = Scope {
            root: header,
            follow: None,
            looping: Some(LoopScope {
                index,
                header,
                follow,
            }),
            in_switch: false,
        };
        let (mut body, _) = self.sequence(header, scope, true);
        trim_trailing_continue(&mut body);
        let region = Region::Loop {
            body: Box::new(Region::sequence(body)),
        };
        (region, follow)
    }

    /// `block` ends in a branch with exactly one successor inside loop `index`.
    fn exit_test(&self, block: BlockId, index: usize) -> Option<ExitTest> {
        let l = self.loops.get(index);
        let term = self.func.terminator(block)?;
        if !matches!(self.func.inst(term).op, Opcode::Branch { .. }) {
            return None;
        }
        let bb = self.func.block(block);
        let t = bb.edge(EdgeKind::True)?.target.block()?;
        let f = bb.edge(EdgeKind::False)?.target.block()?;
        let cond = Condition {
            block,
            branch: term,
            negated: false,
        };
        match (l.contains(t), l.contains(f)) {
            (true, false) => Some((cond, t, f)),
            (false, true) => Some((cond.negate(), f, t)),
            _ => None,
        }
    }

    /// The block only computes its branch condition, so it can live inside `while (...)`.
    fn is_pure_test(&self, block: BlockId) -> bool {
        let insts = &self.func.block(block).insts;
        let Some((_, body)) = insts.split_last() else {
            return false;
        };
        body.iter().all(|&i| self.func.inst(i).op.is_pure() && self.local_single_use[i.index()])
    }

    /// First exit that is not a return tail, preferring exits inside the enclosing loop.
    fn choose_follow(&self, index: usize) -> Option<BlockId> {
        let l = self.loops.get(index);
        let parent = l.parent.map(|p| self.loops.get(p));
        let candidates: Vec<BlockId> = l
            .exits
            .iter()
            .copied()
            .filter(|&e| !self.is_exit_tail(e))
            .collect();
        candidates
            .iter()
            .copied()
            .find(|&e| parent.map_or(true, |p| p.contains(e)))
            .or_else(|| candidates.first().copied())
    }
}

/// Push an if for `cond`, moving a lone else arm into the then position.
fn push_if(cond: Condition, then_items: Vec<Region>, else_items: Vec<Region>, items: &mut Vec<Region>) {
    match (then_items.is_empty(), else_items.is_empty()) {
        (true, true) => {}
        (false, true) => items.push(Region::IfThenElse {
            cond,
            then_region: Box::new(Region::sequence(then_items)),
            else_region: None,
        }),
        (true, false) => items.push(Region::IfThenElse {
            cond: cond.negate(),
            then_region: Box::new(Region::sequence(else_items)),
            else_region: None,
        }),
        (false, false) => items.push(Region::IfThenElse {
            cond,
            then_region: Box::new(Region::sequence(then_items)),
            else_region: Some(Box::new(Region::sequence(else_items))),
        }),
    }
}

/// Drop a `continue` that ends a loop body, including at the end of a final if's arms.
fn trim_trailing_continue(items: &mut Vec<Region>) {
    let Some(last) = items.last_mut() else {
        return;
    };
    match last {
        Region::Continue => {
            items.pop();
        }
        Region::IfThenElse { cond, then_region, else_region } => {
            trim_region(then_region);
            if let Some(e) = else_region.as_mut() {
                trim_region(e);
            }
            let else_empty = else_region.as_deref().map_or(true, is_empty_sequence);
            if else_empty {
                *else_region = None;
            }
            if is_empty_sequence(then_region) {
                match else_region.take() {
                    Some(e) => {
                        *then_region = e;
                        *cond = cond.negate();
                    }
                    None => {
                        items.pop();
                    }
                }
            }
        }
        _ => {}
    }
}

fn trim_region(region: &mut Region) {
    if let Region::Sequence(items) = region {
        trim_trailing_continue(items);
    }
}

fn is_empty_sequence(region: &Region) -> bool {
    matches!(region, Region::Sequence(items) if items.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::ir::{CmpOp, Edge, FuncId, StorageClass};

    /// Function with `n` blocks; `edges[i]` lists block `i`'s successors. One successor
    /// is a jump, two a branch on `ecx == 0` (true first), none a return.
    fn graph(n: usize, edges: &[&[u32]]) -> Function {
        let mut func = Function::new(FuncId(0), "g", 0);
        let ecx = func.add_var("ecx", StorageClass::Register("ecx".into()), 4);
        for i in 0..n as u64 {
            func.add_block(i * 0x10, i * 0x10 + 4);
        }
        for (i, succs) in edges.iter().enumerate() {
            let b = BlockId(i as u32);
            let at = i as u64 * 0x10;
            match succs {
                [] => {
                    func.append_inst(b, Opcode::Return { value: None }, at);
                }
                [s] => {
                    func.append_inst(b, Opcode::Jump, at);
                    func.block_mut(b).edges.push(Edge::to_block(BlockId(*s), EdgeKind::Unconditional));
                }
                [t, f] => {
                    let cmp = func.append_inst(
                        b,
                        Opcode::Compare { op: CmpOp::Eq, lhs: Value::Var(ecx), rhs: Value::Const(0) },
                        at,
                    );
                    func.append_inst(b, Opcode::Branch { cond: Value::Inst(cmp) }, at + 4);
                    func.block_mut(b).edges.push(Edge::to_block(BlockId(*t), EdgeKind::True));
                    func.block_mut(b).edges.push(Edge::to_block(BlockId(*f), EdgeKind::False));
                }
                _ => panic!("use a switch for more than two successors"),
            }
        }
        func.rebuild_preds();
        func.mark_unreachable();
        func
    }

    fn assert_covers(func: &Function, region: &Region) {
        let mut leaves = region.leaves();
        leaves.sort();
        let all: Vec<BlockId> = func.block_ids().collect();
        assert_eq!(leaves, all, "every block must be a leaf exactly once");
    }

    #[test]
    fn test_diamond_is_if_then_else() {
        let func = graph(4, &[&[1, 2], &[3], &[3], &[]]);
        let region = Structurer::structure_function(&func);
        assert_covers(&func, &region);
        let Region::Sequence(items) = &region else {
            panic!("top level must be a sequence");
        };
        assert_eq!(items.len(), 3);
        match &items[1] {
            Region::IfThenElse { cond, then_region, else_region: Some(else_region) } => {
                assert_eq!(cond.block, BlockId(0));
                assert!(!cond.negated);
                assert_eq!(then_region.leaves(), vec![BlockId(1)]);
                assert_eq!(else_region.leaves(), vec![BlockId(2)]);
            }
            other => panic!("expected if-then-else, got {:?}", other),
        }
        assert_eq!(items[2], Region::Leaf(BlockId(3)));
        assert_eq!(region.goto_count(), 0);
    }

    #[test]
    fn test_pure_header_test_is_while() {
        // bb0 -> bb1 (header: test) -> bb2 (body) -> bb1; bb1 -> bb3 exit
        let func = graph(4, &[&[1], &[2, 3], &[1], &[]]);
        let region = Structurer::structure_function(&func);
        assert_covers(&func, &region);
        let Region::Sequence(items) = &region else {
            panic!("top level must be a sequence");
        };
        match &items[1] {
            Region::While { cond, header, body } => {
                assert_eq!(cond.block, BlockId(1));
                assert_eq!(cond.branch, func.terminator(BlockId(1)).expect("branch"));
                assert!(!cond.negated);
                assert_eq!(**header, Region::Leaf(BlockId(1)));
                assert_eq!(body.leaves(), vec![BlockId(2)]);
            }
            other => panic!("expected while, got {:?}", other),
        }
        assert_eq!(region.goto_count(), 0);
    }

    #[test]
    fn test_self_loop_structures() {
        // bb1 branches to itself or to bb2
        let func = graph(3, &[&[1], &[1, 2], &[]]);
        let region = Structurer::structure_function(&func);
        assert_covers(&func, &region);
        assert_eq!(region.goto_count(), 0);
    }

    #[test]
    fn test_irreducible_diamond_uses_goto() {
        // bb0 -> bb1 | bb2, bb1 <-> bb2, both may leave to bb3
        let func = graph(4, &[&[1, 2], &[2, 3], &[1, 3], &[]]);
        let region = Structurer::structure_function(&func);
        assert_covers(&func, &region);
        assert!(region.goto_count() >= 1, "irreducible flow needs a goto: {:?}", region);
    }

    #[test]
    fn test_early_return_becomes_guard_clause() {
        // bb0: if (c) return (bb1) else bb2 -> bb3 return
        let func = graph(4, &[&[1, 2], &[], &[3], &[]]);
        let region = Structurer::structure_function(&func);
        assert_covers(&func, &region);
        let Region::Sequence(items) = &region else {
            panic!("top level must be a sequence");
        };
        assert!(
            matches!(&items[1], Region::IfThenElse { else_region: None, .. }),
            "guard clause without else: {:?}",
            items
        );
        assert_eq!(&items[2..], &[Region::Leaf(BlockId(2)), Region::Leaf(BlockId(3))]);
    }

    #[test]
    fn test_unreachable_block_is_still_covered() {
        let func = graph(3, &[&[], &[2], &[]]);
        let region = Structurer::structure_function(&func);
        assert_covers(&func, &region);
    }
}
