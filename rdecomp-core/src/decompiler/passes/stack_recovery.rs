//! Stack Frame Recovery
//!
//! Turns stack-pointer arithmetic and stack memory accesses into variables.
//!
//! # Algorithm
//! 1. **Track the frame**: forward data flow over reachable blocks computing the stack
//!    and frame pointers as offsets from the entry stack pointer (`Unknown` when paths
//!    disagree or the value is not a constant offset)
//! 2. **Recover call arguments**: stores to `sp`, `sp + word`, ... between two calls
//!    become the arguments of the second call
//! 3. **Collect slots**: every load and store whose address is a known offset
//! 4. **Drop callee saves**: slots that only spill and restore a callee-saved register
//! 5. **Create variables**: offsets at or above one word are parameters `argN`, negative
//!    offsets are locals `local_X`; loads become variable reads, stores become assignments
//! 6. **Remove the frame idiom**: once nothing reads a stack-relative value any more, the
//!    stack/frame pointer assignments and the arithmetic feeding them are deleted
//!
//! Slots whose address escapes (stored, passed, compared or indexed), slots that overlap
//! another slot, and slots read after being overwritten are left as memory accesses.

use crate::decompiler::analysis::{AnalysisKind, Reachability};
use crate::decompiler::config::Abi;
use crate::decompiler::error::DecompileError;
use crate::decompiler::ir::{
    BinaryOp, BlockId, Function, InstId, Opcode, StorageClass, Value, VarId,
};
use crate::decompiler::passes::{Pass, PassContext, PassDescriptor, PassOutcome, PassScope};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const DESCRIPTOR: PassDescriptor = PassDescriptor {
    id: "stack-recovery",
    scope: PassScope::Function,
    idempotent: true,
    description: "Recover parameters, locals and call arguments from stack accesses",
    options: &[],
};

pub struct StackRecovery;

impl Pass for StackRecovery {
    fn name(&self) -> &'static str {
        DESCRIPTOR.id
    }

    fn required_analyses(&self) -> &'static [AnalysisKind] {
        &[AnalysisKind::Reachability]
    }

    fn run_on_function(&self, func: &mut Function, ctx: &PassContext<'_>) -> Result<PassOutcome, DecompileError> {
        let reach = ctx.analyses.reachability()?;
        let frame = Frame::compute(func, ctx.abi, reach);
        if frame.sp.is_none() {
            return Ok(PassOutcome::UNCHANGED);
        }

        let mut changed = recover_call_args(func, &frame, ctx.abi);
        let removed_saves = remove_callee_saves(func, &frame, ctx.abi);
        changed |= removed_saves > 0;
        changed |= convert_slots(func, &frame, ctx.abi);
        changed |= remove_frame_idiom(func, &frame);
        changed |= fill_parameter_gaps(func, ctx.abi);

        if changed {
            log::debug!(
                "{}: stack recovered ({} params, {} callee saves removed)",
                func.name,
                func.params().len(),
                removed_saves
            );
        }
        Ok(PassOutcome::from_changed(changed))
    }
}

/// Abstract value of a pointer register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Track {
    Unset,
    Known(i64),
    Unknown,
}

impl Track {
    #[inline]
    fn meet(self, other: Track) -> Track {
        match (self, other) {
            (Track::Unset, x) | (x, Track::Unset) => x,
            (Track::Known(a), Track::Known(b)) if a == b => Track::Known(a),
            _ => Track::Unknown,
        }
    }

    #[inline]
    fn known(self) -> Option<i64> {
        match self {
            Track::Known(off) => Some(off),
            _ => None,
        }
    }

    fn from_offset(off: Option<i64>) -> Track {
        off.map(Track::Known).unwrap_or(Track::Unknown)
    }
}

/// Stack and frame pointer offsets (from the entry stack pointer) at every instruction.
struct Frame {
    sp: Option<VarId>,
    fp: Option<VarId>,
    /// State before each instruction, indexed by `InstId`
    before: Vec<(Track, Track)>,
    /// Stack offset computed by each instruction, indexed by `InstId`
    inst_off: Vec<Option<i64>>,
}

impl Frame {
    fn compute(func: &Function, abi: &Abi, reach: &Reachability) -> Self {
        let register = |name: &str| {
            func.find_var(&StorageClass::Register(name.to_string()))
        };
        let mut frame = Frame {
            sp: register(&abi.stack_pointer),
            fp: register(&abi.frame_pointer),
            before: vec![(Track::Unknown, Track::Unknown); func.insts.len()],
            inst_off: vec![None; func.insts.len()],
        };
        if frame.sp.is_none() {
            return frame;
        }

        let mut entry_state = vec![(Track::Unset, Track::Unset); func.blocks.len()];
        if let Some(slot) = entry_state.get_mut(func.entry.index()) {
            *slot = (Track::Known(0), Track::Unknown);
        }
        let mut changed = true;
        while changed {
            changed = false;
            for &b in reach.rpo.iter() {
                let exit = frame.transfer(func, b, entry_state[b.index()]);
                for s in func.block(b).successors() {
                    let old = entry_state[s.index()];
                    let new = (old.0.meet(exit.0), old.1.meet(exit.1));
                    if new != old {
                        entry_state[s.index()] = new;
                        changed = true;
                    }
                }
            }
        }
        frame
    }

    /// Run one block from `state`, recording per-instruction facts. Returns the exit state.
    fn transfer(&mut self, func: &Function, block: BlockId, mut state: (Track, Track)) -> (Track, Track) {
        for &inst in func.block(block).insts.iter() {
            self.before[inst.index()] = state;
            match &func.inst(inst).op {
                Opcode::Binary { op, lhs, rhs } => {
                    let l = self.offset_with(state, *lhs);
                    let r = self.offset_with(state, *rhs);
                    self.inst_off[inst.index()] = match (op, l, r, lhs, rhs) {
                        (BinaryOp::Add, Some(o), None, _, Value::Const(c)) => Some(o.wrapping_add(*c)),
                        (BinaryOp::Add, None, Some(o), Value::Const(c), _) => Some(o.wrapping_add(*c)),
                        (BinaryOp::Sub, Some(o), None, _, Value::Const(c)) => Some(o.wrapping_sub(*c)),
                        _ => None,
                    };
                }
                Opcode::Assign { dst, src } => {
                    let off = self.offset_with(state, *src);
                    if Some(*dst) == self.sp {
                        state.0 = Track::from_offset(off);
                    } else if Some(*dst) == self.fp {
                        state.1 = Track::from_offset(off);
                    }
                }
                Opcode::Merge { dst, .. } => {
                    if Some(*dst) == self.sp {
                        state.0 = Track::Unknown;
                    } else if Some(*dst) == self.fp {
                        state.1 = Track::Unknown;
                    }
                }
                _ => {}
            }
        }
        state
    }

    #[inline]
    fn offset_with(&self, state: (Track, Track), value: Value) -> Option<i64> {
        match value {
            Value::Var(v) if Some(v) == self.sp => state.0.known(),
            Value::Var(v) if Some(v) == self.fp => state.1.known(),
            Value::Inst(i) => self.inst_off.get(i.index()).copied().flatten(),
            _ => None,
        }
    }

    /// Stack offset of `value` read by `inst`.
    #[inline] // Hot path
    fn offset(&self, inst: InstId, value: Value) -> Option<i64> {
        self.offset_with(self.before[inst.index()], value)
    }

    /// Instructions that only maintain the stack or frame pointer.
    fn is_tracking(&self, func: &Function, inst: InstId) -> bool {
        match &func.inst(inst).op {
            Opcode::Binary { .. } => self.inst_off[inst.index()].is_some(),
            Opcode::Assign { dst, src } => {
                (Some(*dst) == self.sp || Some(*dst) == self.fp) && self.offset(inst, *src).is_some()
            }
            _ => false,
        }
    }
}

/// Instructions reading each instruction's result, indexed by `InstId`.
fn users(func: &Function) -> Vec<SmallVec<[InstId; 2]>> {
    let mut users: Vec<SmallVec<[InstId; 2]>> = vec![SmallVec::new(); func.insts.len()];
    for (_, inst) in func.placed_insts() {
        func.inst(inst).op.for_each_operand(|v| {
            if let Value::Inst(def) = v {
                users[def.index()].push(inst);
            }
        });
    }
    users
}

fn recover_call_args(func: &mut Function, frame: &Frame, abi: &Abi) -> bool {
    let word = i64::from(abi.word_size);
    let mut loaded: BTreeSet<i64> = BTreeSet::new();
    for (_, inst) in func.placed_insts() {
        if let Opcode::Load { addr, .. } = func.inst(inst).op {
            if let Some(off) = frame.offset(inst, addr) {
                loaded.insert(off);
            }
        }
    }

    let mut recovered: Vec<(InstId, Vec<InstId>)> = Vec::new();
    for block in func.blocks.iter().filter(|b| !b.unreachable) {
        let mut pending: BTreeMap<i64, InstId> = BTreeMap::new();
        for &inst in block.insts.iter() {
            match &func.inst(inst).op {
                Opcode::Store { addr, .. } => {
                    if let Some(off) = frame.offset(inst, *addr) {
                        pending.insert(off, inst);
                    }
                }
                Opcode::Load { addr, .. } => {
                    if let Some(off) = frame.offset(inst, *addr) {
                        pending.remove(&off);
                    }
                }
                Opcode::Call { args, .. } => {
                    if args.is_empty() {
                        if let Some(sp) = frame.before[inst.index()].0.known() {
                            let mut stores = Vec::new();
                            let mut off = sp;
                            while let Some(&store) = pending.get(&off) {
                                if loaded.contains(&off) {
                                    break;
                                }
                                stores.push(store);
                                off += word;
                            }
                            if !stores.is_empty() {
                                recovered.push((inst, stores));
                            }
                        }
                    }
                    pending.clear();
                }
                _ => {}
            }
        }
    }

    let changed = !recovered.is_empty();
    let locations = func.inst_locations();
    for (call, stores) in recovered {
        let mut values = Vec::with_capacity(stores.len());
        for store in stores {
            if let Opcode::Store { value, .. } = func.inst(store).op {
                values.push(value);
            }
            if let Some((block, _)) = locations[store.index()] {
                func.remove_inst(block, store);
            }
        }
        if let Opcode::Call { args, .. } = &mut func.inst_mut(call).op {
            *args = values;
        }
    }
    changed
}

#[derive(Debug, Default)]
struct Slot {
    size: u8,
    loads: Vec<InstId>,
    stores: Vec<InstId>,
    /// The slot's own address escapes, or it overlaps another slot
    escaped: bool,
    /// Some local's address escapes, so any local may be reached through a pointer
    frame_escaped: bool,
}

impl Slot {
    fn convertible(&self) -> bool {
        !self.escaped && !self.frame_escaped
    }
}

fn collect_slots(func: &Function, frame: &Frame) -> BTreeMap<i64, Slot> {
    let mut slots: BTreeMap<i64, Slot> = BTreeMap::new();
    let mut escaped: BTreeSet<i64> = BTreeSet::new();
    let mut locals_escaped = false;

    for (_, inst) in func.placed_insts() {
        let op = &func.inst(inst).op;
        match op {
            Opcode::Load { addr, size } => {
                if let Some(off) = frame.offset(inst, *addr) {
                    let slot = slots.entry(off).or_default();
                    slot.size = slot.size.max(*size);
                    slot.loads.push(inst);
                }
            }
            Opcode::Store { addr, value, size } => {
                if let Some(off) = frame.offset(inst, *addr) {
                    let slot = slots.entry(off).or_default();
                    slot.size = slot.size.max(*size);
                    slot.stores.push(inst);
                }
                if let Some(off) = frame.offset(inst, *value) {
                    escaped.insert(off);
                }
            }
            _ if frame.is_tracking(func, inst) => {}
            _ => op.for_each_operand(|v| {
                if let Some(off) = frame.offset(inst, *v) {
                    escaped.insert(off);
                }
            }),
        }
    }
    for off in escaped {
        if off < 0 {
            locals_escaped = true;
        } else if let Some(slot) = slots.get_mut(&off) {
            slot.escaped = true;
        }
    }
    if locals_escaped {
        for (_, slot) in slots.range_mut(..0) {
            slot.frame_escaped = true;
        }
    }

    // Overlapping accesses alias; keep them in memory
    let offsets: Vec<(i64, u8)> = slots.iter().map(|(&o, s)| (o, s.size)).collect();
    for pair in offsets.windows(2) {
        let ((a, size), (b, _)) = (pair[0], pair[1]);
        if a + i64::from(size) > b {
            for off in [a, b] {
                if let Some(slot) = slots.get_mut(&off) {
                    slot.escaped = true;
                }
            }
        }
    }
    slots
}

fn remove_callee_saves(func: &mut Function, frame: &Frame, abi: &Abi) -> usize {
    let slots = collect_slots(func, frame);
    let users = users(func);
    let locations = func.inst_locations();
    let mut doomed: Vec<InstId> = Vec::new();
    let mut count = 0usize;

    for (&off, slot) in slots.range(..0) {
        if slot.escaped || slot.stores.is_empty() {
            continue;
        }
        let mut saved: Option<VarId> = None;
        let all_saves = slot.stores.iter().all(|&st| match func.inst(st).op {
            Opcode::Store { value: Value::Var(r), .. } => {
                let callee_saved = matches!(&func.var(r).storage,
                    StorageClass::Register(name) if abi.callee_saved.iter().any(|c| c == name));
                let same = *saved.get_or_insert(r) == r;
                callee_saved && same
            }
            _ => false,
        });
        let Some(reg) = saved.filter(|_| all_saves) else {
            continue;
        };
        let all_restores = slot.loads.iter().all(|&ld| {
            matches!(users[ld.index()].as_slice(), [u]
                if matches!(func.inst(*u).op, Opcode::Assign { dst, src: Value::Inst(s) } if dst == reg && s == ld))
        });
        if !all_restores {
            continue;
        }
        log::debug!("{}: slot {} saves {}", func.name, off, func.var(reg).name);
        doomed.extend(slot.stores.iter().copied());
        for &ld in slot.loads.iter() {
            doomed.push(ld);
            doomed.extend(users[ld.index()].iter().copied());
        }
        count += 1;
    }

    for inst in doomed {
        if let Some((block, _)) = locations[inst.index()] {
            func.remove_inst(block, inst);
        }
    }
    count
}

fn slot_storage(off: i64, word: i64) -> Option<(StorageClass, String)> {
    if off < 0 {
        Some((StorageClass::Stack { offset: off }, format!("local_{:x}", -off)))
    } else if off >= word {
        let index = ((off - word) / word + 1) as u32;
        let name = if (off - word) % word == 0 {
            format!("arg{}", index)
        } else {
            format!("arg_{:x}", off)
        };
        Some((StorageClass::Param { index, offset: off }, name))
    } else {
        // Return address
        None
    }
}

fn convert_slots(func: &mut Function, frame: &Frame, abi: &Abi) -> bool {
    let word = i64::from(abi.word_size);
    let slots = collect_slots(func, frame);
    let users = users(func);
    let locations = func.inst_locations();
    let position = |inst: InstId| locations[inst.index()];

    let mut subst: HashMap<InstId, Value> = HashMap::new();
    let mut changed = false;

    for (&off, slot) in slots.iter() {
        if !slot.convertible() {
            continue;
        }
        let Some((storage, name)) = slot_storage(off, word) else {
            continue;
        };

        // Each load's users must read the slot before any later store to it
        let ordered = slot.loads.iter().all(|&ld| {
            let Some((block, load_pos)) = position(ld) else {
                return false;
            };
            let mut last_use = load_pos;
            for &u in users[ld.index()].iter() {
                match position(u) {
                    Some((b, p)) if b == block && p > load_pos => last_use = last_use.max(p),
                    _ => return false,
                }
            }
            !slot.stores.iter().any(|&st| {
                matches!(position(st), Some((b, p)) if b == block && p > load_pos && p < last_use)
            })
        });
        if !ordered {
            continue;
        }

        let var = match func.find_var(&storage) {
            Some(v) => v,
            None => func.add_var(name, storage, slot.size),
        };
        for &ld in slot.loads.iter() {
            subst.insert(ld, Value::Var(var));
        }
        for &st in slot.stores.iter() {
            if let Opcode::Store { value, .. } = func.inst(st).op {
                func.inst_mut(st).op = Opcode::Assign { dst: var, src: value };
            }
        }
        changed = true;
    }

    if subst.is_empty() {
        return changed;
    }
    for block in func.blocks.iter() {
        for &inst in block.insts.iter() {
            func.insts[inst.index()].op.for_each_operand_mut(|v| {
                if let Value::Inst(def) = v {
                    if let Some(&to) = subst.get(def) {
                        *v = to;
                    }
                }
            });
        }
    }
    let mut loads: Vec<InstId> = subst.keys().copied().collect();
    loads.sort();
    for ld in loads {
        if let Some((block, _)) = locations[ld.index()] {
            func.remove_inst(block, ld);
        }
    }
    true
}

/// Delete stack/frame pointer maintenance once no other instruction reads the frame.
fn remove_frame_idiom(func: &mut Function, frame: &Frame) -> bool {
    let mut tracking: Vec<(BlockId, InstId)> = Vec::new();
    let mut reads_frame = false;
    for (block, inst) in func.placed_insts() {
        if frame.is_tracking(func, inst) {
            tracking.push((block, inst));
            continue;
        }
        func.inst(inst).op.for_each_operand(|v| {
            if frame.offset(inst, *v).is_some() || matches!(v, Value::Var(r) if Some(*r) == frame.sp) {
                reads_frame = true;
            }
        });
        if reads_frame {
            break;
        }
    }
    if reads_frame {
        return prune_pure(func);
    }

    let mut changed = false;
    for &(block, inst) in tracking.iter() {
        if matches!(func.inst(inst).op, Opcode::Assign { .. }) {
            func.remove_inst(block, inst);
            changed = true;
        }
    }
    prune_pure(func) || changed
}

/// Remove side-effect free instructions whose results are unused.
fn prune_pure(func: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let counts = func.inst_use_counts();
        let dead: Vec<(BlockId, InstId)> = func
            .placed_insts()
            .filter(|&(_, i)| func.inst(i).op.is_pure() && counts[i.index()] == 0)
            .collect();
        if dead.is_empty() {
            return changed;
        }
        for (block, inst) in dead {
            func.remove_inst(block, inst);
        }
        changed = true;
    }
}

/// Create unused parameters for missing stack positions below the highest parameter.
fn fill_parameter_gaps(func: &mut Function, abi: &Abi) -> bool {
    let word = i64::from(abi.word_size);
    let present: BTreeSet<u32> = func
        .vars
        .iter()
        .filter_map(|v| match v.storage {
            StorageClass::Param { index, offset } if (offset - word) % word == 0 => Some(index),
            _ => None,
        })
        .collect();
    let Some(&max) = present.iter().next_back() else {
        return false;
    };
    let mut changed = false;
    for index in 1..max {
        if !present.contains(&index) {
            let offset = word * i64::from(index);
            func.add_var(format!("arg{}", index), StorageClass::Param { index, offset }, abi.word_size);
            changed = true;
        }
    }
    changed
}
