//! IR Transformation Passes
//!
//! This module defines the pass interface and the registry the pipeline resolves pass
//! identifiers against.
//!
//! # Built-in Passes
//!
//! | Identifier | Scope | Options |
//! |---|---|---|
//! | `stack-recovery` | function | |
//! | `merge-returns` | function | |
//! | `type-inference` | function | `widen-small-ints: bool` |
//! | `dead-code` | function | `remove-unreachable: bool` |
//! | `coalesce-variables` | function | |
//! | `resolve-calls` | module | |
//! | `structure` | function | |
//!
//! Every built-in pass is idempotent: running it twice in a row reports no change the
//! second time.
//!
//! # API Reference
//!
//! ```rust,no_run
//! use rdecomp_core::decompiler::passes::PassRegistry;
//! use rdecomp_core::decompiler::config::PassSpec;
//!
//! let registry = PassRegistry::with_builtin_passes();
//! let pass = registry.create(&PassSpec::new("dead-code"))?;
//! assert_eq!(pass.name(), "dead-code");
//! # Ok::<(), rdecomp_core::decompiler::error::DecompileError>(())
//! ```

pub mod coalesce;
pub mod dead_code;
pub mod merge_returns;
pub mod resolve_calls;
pub mod stack_recovery;
pub mod structure;
pub mod type_inference;

use crate::decompiler::analysis::{AnalysisCache, AnalysisKind};
use crate::decompiler::config::{Abi, OptionKind, PassOptions, PassSpec};
use crate::decompiler::error::DecompileError;
use crate::decompiler::ir::{Function, Module};
use serde::Serialize;

/// Whether a pass sees one function at a time or the whole module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PassScope {
    Module = 0,
    Function = 1,
}

/// What a pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOutcome {
    pub changed: bool,
    /// Blocks or edges changed; cached analyses are stale
    pub cfg_changed: bool,
}

impl PassOutcome {
    pub const UNCHANGED: PassOutcome = PassOutcome {
        changed: false,
        cfg_changed: false,
    };

    /// Instructions or variables changed, control flow did not.
    pub const CHANGED: PassOutcome = PassOutcome {
        changed: true,
        cfg_changed: false,
    };

    pub const CFG_CHANGED: PassOutcome = PassOutcome {
        changed: true,
        cfg_changed: true,
    };

    pub fn from_changed(changed: bool) -> Self {
        if changed {
            Self::CHANGED
        } else {
            Self::UNCHANGED
        }
    }

    #[inline]
    pub fn merge(self, other: PassOutcome) -> PassOutcome {
        PassOutcome {
            changed: self.changed || other.changed,
            cfg_changed: self.cfg_changed || other.cfg_changed,
        }
    }
}

/// What a function pass may read besides the function itself.
pub struct PassContext<'a> {
    /// Holds at least the analyses the pass declared
    pub analyses: &'a AnalysisCache,
    pub abi: &'a Abi,
}

/// A named IR transformation.
///
/// Function passes implement [`Pass::run_on_function`]; module passes set
/// [`Pass::scope`] to `Module` and implement [`Pass::run_on_module`].
pub trait Pass: Send + Sync {
    fn name(&self) -> &'static str;

    fn scope(&self) -> PassScope {
        PassScope::Function
    }

    fn idempotent(&self) -> bool {
        true
    }

    /// Analyses the pipeline must compute before [`Pass::run_on_function`].
    fn required_analyses(&self) -> &'static [AnalysisKind] {
        &[]
    }

    fn run_on_function(
        &self,
        _func: &mut Function,
        _ctx: &PassContext<'_>,
    ) -> Result<PassOutcome, DecompileError> {
        Ok(PassOutcome::UNCHANGED)
    }

    fn run_on_module(&self, _module: &mut Module) -> Result<PassOutcome, DecompileError> {
        Ok(PassOutcome::UNCHANGED)
    }
}

/// Schema of one pass option.
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub description: &'static str,
}

/// Static facts about a registered pass.
#[derive(Debug, Clone, Copy)]
pub struct PassDescriptor {
    pub id: &'static str,
    pub scope: PassScope,
    pub idempotent: bool,
    pub description: &'static str,
    pub options: &'static [OptionSpec],
}

/// Builds a pass instance from its options.
pub type PassFactory = fn(&PassOptions) -> Box<dyn Pass>;

/// Known passes, constructed once per pipeline invocation.
pub struct PassRegistry {
    entries: Vec<(PassDescriptor, PassFactory)>,
}

impl Default for PassRegistry {
    fn default() -> Self {
        Self::with_builtin_passes()
    }
}

impl PassRegistry {
    /// Registry with no passes.
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn with_builtin_passes() -> Self {
        let mut registry = Self::empty();
        registry.register(stack_recovery::DESCRIPTOR, |_| Box::new(stack_recovery::StackRecovery));
        registry.register(merge_returns::DESCRIPTOR, |_| Box::new(merge_returns::MergeReturns));
        registry.register(type_inference::DESCRIPTOR, |options| {
            Box::new(type_inference::TypeInference::from_options(options))
        });
        registry.register(dead_code::DESCRIPTOR, |options| {
            Box::new(dead_code::DeadCode::from_options(options))
        });
        registry.register(coalesce::DESCRIPTOR, |_| Box::new(coalesce::CoalesceVariables));
        registry.register(resolve_calls::DESCRIPTOR, |_| Box::new(resolve_calls::ResolveCalls));
        registry.register(structure::DESCRIPTOR, |_| Box::new(structure::Structure));
        registry
    }

    /// Add a pass, replacing any pass with the same identifier.
    pub fn register(&mut self, descriptor: PassDescriptor, factory: PassFactory) {
        if let Some(entry) = self.entries.iter_mut().find(|(d, _)| d.id == descriptor.id) {
            *entry = (descriptor, factory);
        } else {
            self.entries.push((descriptor, factory));
        }
    }

    pub fn descriptor(&self, id: &str) -> Option<&PassDescriptor> {
        self.entries.iter().find(|(d, _)| d.id == id).map(|(d, _)| d)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &PassDescriptor> {
        self.entries.iter().map(|(d, _)| d)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(d, _)| d.id).collect()
    }

    /// Instantiate the pass named by `spec`.
    ///
    /// # Errors
    /// `UnknownPass` when no pass with that identifier is registered.
    pub fn create(&self, spec: &PassSpec) -> Result<Box<dyn Pass>, DecompileError> {
        match self.entries.iter().find(|(d, _)| d.id == spec.name) {
            Some((_, factory)) => Ok(factory(&spec.options)),
            None => Err(DecompileError::unknown_pass(&spec.name, &self.names())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_knows_default_passes() {
        let registry = PassRegistry::with_builtin_passes();
        for name in crate::decompiler::config::DEFAULT_PASSES {
            let pass = registry.create(&PassSpec::new(name)).expect("built-in pass");
            assert_eq!(pass.name(), *name);
            assert!(pass.idempotent());
        }
        assert_eq!(
            registry.descriptor("resolve-calls").map(|d| d.scope),
            Some(PassScope::Module)
        );
    }

    #[test]
    fn test_unknown_pass_lists_known_names() {
        let registry = PassRegistry::with_builtin_passes();
        match registry.create(&PassSpec::new("inline-everything")) {
            Err(DecompileError::UnknownPass { name, suggestion }) => {
                assert_eq!(name, "inline-everything");
                assert!(suggestion.contains("stack-recovery"));
            }
            Err(other) => panic!("expected UnknownPass, got {:?}", other),
            Ok(_) => panic!("expected UnknownPass"),
        }
    }
}
