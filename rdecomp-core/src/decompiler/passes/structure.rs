//! Structuring as a pass: recovers the function's region tree from its final CFG.

use crate::decompiler::analysis::AnalysisKind;
use crate::decompiler::error::DecompileError;
use crate::decompiler::ir::Function;
use crate::decompiler::passes::{Pass, PassContext, PassDescriptor, PassOutcome, PassScope};
use crate::decompiler::structurer::Structurer;

pub const DESCRIPTOR: PassDescriptor = PassDescriptor {
    id: "structure",
    scope: PassScope::Function,
    idempotent: true,
    description: "Recover structured control flow (ifs, loops, switches) from the CFG",
    options: &[],
};

pub struct Structure;

impl Pass for Structure {
    fn name(&self) -> &'static str {
        DESCRIPTOR.id
    }

    fn required_analyses(&self) -> &'static [AnalysisKind] {
        AnalysisKind::ALL
    }

    fn run_on_function(&self, func: &mut Function, ctx: &PassContext<'_>) -> Result<PassOutcome, DecompileError> {
        let region = Structurer::structure(func, ctx.analyses)?;
        if func.region.as_ref() == Some(&region) {
            return Ok(PassOutcome::UNCHANGED);
        }
        log::debug!("{}: structured with {} gotos", func.name, region.goto_count());
        func.region = Some(region);
        Ok(PassOutcome::CHANGED)
    }
}
