//! Call Target Resolution
//!
//! Direct calls whose target is the entry of another function of the module are bound
//! to that function, so they render by name. Calls to addresses outside the module
//! keep their address and render as `sub_<addr>`.
//!
//! Results of calls to functions that return nothing are dropped: `eax = sub_x()`
//! loses the copy and `return sub_x()` becomes `return`. A caller left with only void
//! returns becomes void itself, so this repeats until no function changes.

use crate::decompiler::error::DecompileError;
use crate::decompiler::ir::{BlockId, CallTarget, Function, InstId, Module, Opcode, Value};
use crate::decompiler::passes::{Pass, PassDescriptor, PassOutcome, PassScope};
use bitvec::prelude::*;
use std::collections::{HashMap, HashSet};

pub const DESCRIPTOR: PassDescriptor = PassDescriptor {
    id: "resolve-calls",
    scope: PassScope::Module,
    idempotent: true,
    description: "Bind direct calls to the functions of the module",
    options: &[],
};

pub struct ResolveCalls;

impl Pass for ResolveCalls {
    fn name(&self) -> &'static str {
        DESCRIPTOR.id
    }

    fn scope(&self) -> PassScope {
        PassScope::Module
    }

    fn run_on_module(&self, module: &mut Module) -> Result<PassOutcome, DecompileError> {
        let entries: HashMap<u64, String> = module
            .functions
            .iter()
            .map(|f| (f.entry_address, f.name.clone()))
            .collect();

        let mut resolved = 0usize;
        for func in module.functions.iter_mut() {
            for block in func.blocks.iter() {
                for &inst in block.insts.iter() {
                    let op = &mut func.insts[inst.index()].op;
                    if let Opcode::Call { target, .. } = op {
                        if let CallTarget::Direct(addr) = *target {
                            if let Some(name) = entries.get(&addr) {
                                *target = CallTarget::Function {
                                    name: name.clone(),
                                    entry: addr,
                                };
                                resolved += 1;
                            }
                        }
                    }
                }
            }
        }

        let mut dropped = 0usize;
        loop {
            let void_entries: HashSet<u64> = module
                .functions
                .iter()
                .filter(|f| f.return_type.is_none())
                .map(|f| f.entry_address)
                .collect();
            let round: usize = module
                .functions
                .iter_mut()
                .map(|f| drop_void_results(f, &void_entries))
                .sum();
            if round == 0 {
                break;
            }
            dropped += round;
        }

        if resolved > 0 || dropped > 0 {
            log::debug!("resolved {} direct calls, dropped {} void call results", resolved, dropped);
        }
        Ok(PassOutcome::from_changed(resolved > 0 || dropped > 0))
    }
}

/// Remove every use of a void call's result that only copies or returns it.
fn drop_void_results(func: &mut Function, void_entries: &HashSet<u64>) -> usize {
    let mut void_calls: BitVec<u32> = bitvec![u32, Lsb0; 0; func.insts.len()];
    let mut any = false;
    for (_, inst) in func.placed_insts() {
        if let Opcode::Call { target: CallTarget::Function { entry, .. }, .. } = &func.inst(inst).op {
            if void_entries.contains(entry) {
                void_calls.set(inst.index(), true);
                any = true;
            }
        }
    }
    if !any {
        return 0;
    }

    let placed: Vec<(BlockId, InstId)> = func.placed_insts().collect();
    let mut count = 0usize;
    for (block, inst) in placed {
        let (is_copy, is_return) = match &func.inst(inst).op {
            Opcode::Assign { src: Value::Inst(call), .. } => (void_calls[call.index()], false),
            Opcode::Return { value: Some(Value::Inst(call)) } => (false, void_calls[call.index()]),
            _ => (false, false),
        };
        if is_copy {
            func.remove_inst(block, inst);
            count += 1;
        } else if is_return {
            func.inst_mut(inst).op = Opcode::Return { value: None };
            count += 1;
        }
    }

    if count > 0 && func.return_type.is_some() {
        let all_void = func
            .placed_insts()
            .all(|(_, i)| !matches!(func.inst(i).op, Opcode::Return { value: Some(_) }));
        if all_void {
            func.return_type = None;
            log::debug!("{}: returns void after dropping void call results", func.name);
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::config::Abi;
    use crate::decompiler::ir::{FuncId, Function, Value};

    #[test]
    fn test_calls_to_module_functions_are_named() {
        let mut module = Module::new(Abi::default());
        let mut caller = Function::new(FuncId(0), "sub_1000", 0x1000);
        let b = caller.add_block(0x1000, 0x1008);
        caller.append_inst(b, Opcode::Call { target: CallTarget::Direct(0x2000), args: vec![] }, 0x1000);
        caller.append_inst(b, Opcode::Call { target: CallTarget::Direct(0x3000), args: vec![] }, 0x1004);
        caller.append_inst(b, Opcode::Return { value: Some(Value::Const(0)) }, 0x1008);
        let mut callee = Function::new(FuncId(1), "sub_2000", 0x2000);
        let cb = callee.add_block(0x2000, 0x2000);
        callee.append_inst(cb, Opcode::Return { value: None }, 0x2000);
        module.functions.push(caller);
        module.functions.push(callee);

        let outcome = ResolveCalls.run_on_module(&mut module).expect("resolve-calls");
        assert!(outcome.changed);
        let caller = &module.functions[0];
        assert_eq!(
            caller.insts[0].op,
            Opcode::Call {
                target: CallTarget::Function { name: "sub_2000".into(), entry: 0x2000 },
                args: vec![]
            }
        );
        assert_eq!(caller.insts[1].op, Opcode::Call { target: CallTarget::Direct(0x3000), args: vec![] });
        assert!(!ResolveCalls.run_on_module(&mut module).expect("second run").changed);
    }

    #[test]
    fn test_void_callee_results_are_dropped_up_the_call_chain() {
        use crate::decompiler::ir::StorageClass;

        // sub_1000: eax = sub_2000(); return eax    sub_2000: return sub_3000()
        // sub_3000: return (void)
        let mut module = Module::new(Abi::default());
        let mut outer = Function::new(FuncId(0), "sub_1000", 0x1000);
        let eax = outer.add_var("eax", StorageClass::Register("eax".into()), 4);
        let b = outer.add_block(0x1000, 0x1005);
        let call = outer.append_inst(b, Opcode::Call { target: CallTarget::Direct(0x2000), args: vec![] }, 0x1000);
        let copy = outer.append_inst(b, Opcode::Assign { dst: eax, src: Value::Inst(call) }, 0x1000);
        outer.append_inst(b, Opcode::Return { value: Some(Value::Var(eax)) }, 0x1005);

        let mut middle = Function::new(FuncId(1), "sub_2000", 0x2000);
        let mb = middle.add_block(0x2000, 0x2005);
        let inner_call = middle.append_inst(mb, Opcode::Call { target: CallTarget::Direct(0x3000), args: vec![] }, 0x2000);
        let middle_ret = middle.append_inst(mb, Opcode::Return { value: Some(Value::Inst(inner_call)) }, 0x2005);

        let mut inner = Function::new(FuncId(2), "sub_3000", 0x3000);
        let ib = inner.add_block(0x3000, 0x3000);
        inner.append_inst(ib, Opcode::Return { value: None }, 0x3000);
        inner.return_type = None;

        module.functions.push(outer);
        module.functions.push(middle);
        module.functions.push(inner);

        assert!(ResolveCalls.run_on_module(&mut module).expect("resolve-calls").changed);
        let middle = &module.functions[1];
        assert_eq!(middle.inst(middle_ret).op, Opcode::Return { value: None });
        assert_eq!(middle.return_type, None, "a caller of a void function returning its result is void");
        let outer = &module.functions[0];
        assert!(!outer.block(b).insts.contains(&copy), "the copy of the void result is gone");
        assert!(outer.block(b).insts.contains(&call), "the call itself stays");
        assert!(outer.return_type.is_some(), "eax is still returned");
        assert!(!ResolveCalls.run_on_module(&mut module).expect("second run").changed);
    }
}
