//! Shared Analyses
//!
//! Read-only facts about a function's CFG, computed lazily and cached per function.
//!
//! # Analysis Dependencies
//! - **Reachability**: none
//! - **Dominators**: none (walks from the entry itself)
//! - **PostDominators**: Reachability
//! - **Loops**: Reachability, Dominators
//!
//! Liveness ([`data_flow::Liveness`]) depends on instructions, not only on the CFG, so it
//! is never cached; passes compute it on demand.

pub mod data_flow;
pub mod dominators;
pub mod loops;
pub mod reachability;

pub use data_flow::Liveness;
pub use dominators::{DominatorTree, PostDominatorTree};
pub use loops::{LoopForest, NaturalLoop};
pub use reachability::Reachability;

use crate::decompiler::error::{DecompileError, ErrorContext};
use crate::decompiler::ir::Function;

/// CFG analyses a pass can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum AnalysisKind {
    Reachability = 0,
    Dominators = 1,
    PostDominators = 2,
    Loops = 3,
}

impl AnalysisKind {
    pub const ALL: &'static [AnalysisKind] = &[
        AnalysisKind::Reachability,
        AnalysisKind::Dominators,
        AnalysisKind::PostDominators,
        AnalysisKind::Loops,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AnalysisKind::Reachability => "reachability",
            AnalysisKind::Dominators => "dominators",
            AnalysisKind::PostDominators => "post-dominators",
            AnalysisKind::Loops => "loops",
        }
    }
}

/// Per-function analysis cache.
///
/// Each analysis is computed at most once until [`AnalysisCache::invalidate`] is called.
#[derive(Debug, Clone, Default)]
pub struct AnalysisCache {
    reachability: Option<Reachability>,
    dominators: Option<DominatorTree>,
    post_dominators: Option<PostDominatorTree>,
    loops: Option<LoopForest>,
    computations: u32,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache with every analysis computed for `func`.
    pub fn for_function(func: &Function) -> Self {
        let mut cache = Self::new();
        cache.ensure(AnalysisKind::ALL, func);
        cache
    }

    /// Compute every requested analysis (and its dependencies) that is not cached yet.
    pub fn ensure(&mut self, kinds: &[AnalysisKind], func: &Function) {
        for &kind in kinds {
            match kind {
                AnalysisKind::Reachability => self.ensure_reachability(func),
                AnalysisKind::Dominators => self.ensure_dominators(func),
                AnalysisKind::PostDominators => {
                    self.ensure_reachability(func);
                    if self.post_dominators.is_none() {
                        if let Some(reach) = &self.reachability {
                            self.post_dominators = Some(PostDominatorTree::compute(func, reach));
                            self.computations += 1;
                        }
                    }
                }
                AnalysisKind::Loops => {
                    self.ensure_reachability(func);
                    self.ensure_dominators(func);
                    if self.loops.is_none() {
                        if let (Some(reach), Some(dom)) = (&self.reachability, &self.dominators) {
                            self.loops = Some(LoopForest::compute(func, dom, reach));
                            self.computations += 1;
                        }
                    }
                }
            }
        }
    }

    fn ensure_reachability(&mut self, func: &Function) {
        if self.reachability.is_none() {
            self.reachability = Some(Reachability::compute(func));
            self.computations += 1;
        }
    }

    fn ensure_dominators(&mut self, func: &Function) {
        if self.dominators.is_none() {
            self.dominators = Some(DominatorTree::compute(func));
            self.computations += 1;
        }
    }

    /// Drop every cached analysis. Called after a control-flow change.
    pub fn invalidate(&mut self) {
        self.reachability = None;
        self.dominators = None;
        self.post_dominators = None;
        self.loops = None;
    }

    /// Number of analyses computed over the cache's lifetime.
    pub fn computations(&self) -> u32 {
        self.computations
    }

    pub fn is_cached(&self, kind: AnalysisKind) -> bool {
        match kind {
            AnalysisKind::Reachability => self.reachability.is_some(),
            AnalysisKind::Dominators => self.dominators.is_some(),
            AnalysisKind::PostDominators => self.post_dominators.is_some(),
            AnalysisKind::Loops => self.loops.is_some(),
        }
    }

    pub fn reachability(&self) -> Result<&Reachability, DecompileError> {
        self.reachability.as_ref().ok_or_else(|| missing(AnalysisKind::Reachability))
    }

    pub fn dominators(&self) -> Result<&DominatorTree, DecompileError> {
        self.dominators.as_ref().ok_or_else(|| missing(AnalysisKind::Dominators))
    }

    pub fn post_dominators(&self) -> Result<&PostDominatorTree, DecompileError> {
        self.post_dominators.as_ref().ok_or_else(|| missing(AnalysisKind::PostDominators))
    }

    pub fn loops(&self) -> Result<&LoopForest, DecompileError> {
        self.loops.as_ref().ok_or_else(|| missing(AnalysisKind::Loops))
    }
}

#[cold]
fn missing(kind: AnalysisKind) -> DecompileError {
    DecompileError::invariant(
        format!("analysis `{}` was requested but not declared", kind.name()),
        ErrorContext::new(),
    )
}
