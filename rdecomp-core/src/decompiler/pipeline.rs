//! Decompilation Pipeline
//!
//! This module runs the configured passes over a module and drives the complete
//! decompilation from decoded records to pseudocode.
//!
//! # Pipeline Stages
//! 1. **CFG Construction**: group records into functions, split blocks, lift, verify
//! 2. **Passes**: run every configured pass in order; function passes are dispatched to
//!    each function in module order, optionally on worker threads
//! 3. **Verification**: the structural verifier runs after every pass that reports a change
//! 4. **Type Table**: variable and return types are interned in module order
//! 5. **Emission**: every function is rendered as pseudocode
//!
//! # Analysis Caching
//! Each function owns an [`AnalysisCache`]. A pass gets the analyses it declares,
//! computed at most once until a pass reports a control-flow change for that function;
//! that also discards the function's region tree.
//!
//! # Failure
//! When a pass fails or breaks an invariant, the run stops and hands back the module as
//! it was before that pass together with the reports collected so far.

use crate::decompiler::analysis::{AnalysisCache, AnalysisKind};
use crate::decompiler::cfg::CfgBuilder;
use crate::decompiler::config::{Abi, ConfigError, DecompilerConfig, PipelineConfig};
use crate::decompiler::decoder::DecodedRecord;
use crate::decompiler::emitter::Emitter;
use crate::decompiler::error::{DecompileError, ErrorContext};
use crate::decompiler::ir::{Function, Module};
use crate::decompiler::passes::{Pass, PassContext, PassOutcome, PassRegistry, PassScope};
use crate::decompiler::structurer::Region;
use crate::decompiler::validator::CfgVerifier;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

/// What one pass did over the whole module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub name: String,
    pub changed: bool,
    pub duration: Duration,
    pub functions_changed: usize,
}

/// Receives pass progress. Called on the thread that runs the pipeline.
pub trait PassObserver {
    fn pass_started(&self, _name: &str, _index: usize, _total: usize) {}

    fn pass_finished(&self, report: &PassReport);
}

/// Result of a successful pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub module: Module,
    pub reports: Vec<PassReport>,
}

/// A failed run.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct PipelineFailure {
    pub error: DecompileError,
    /// Module before the failing pass; `None` when no pass ran
    pub last_good: Option<Box<Module>>,
    pub reports: Vec<PassReport>,
}

impl PipelineFailure {
    /// Failure before any pass ran.
    #[cold]
    pub fn before_passes(error: DecompileError) -> Self {
        Self {
            error,
            last_good: None,
            reports: Vec::new(),
        }
    }

    /// Name of the pass that failed, when the error carries one.
    pub fn pass(&self) -> Option<&str> {
        self.error.context().and_then(|c| c.pass.as_deref())
    }
}

/// Ordered list of instantiated passes.
pub struct PassPipeline {
    passes: Vec<Box<dyn Pass>>,
    threads: usize,
}

impl PassPipeline {
    /// Instantiate every configured pass.
    ///
    /// # Errors
    /// `UnknownPass` for the first identifier the registry does not know. Nothing has
    /// run at that point.
    pub fn new(registry: &PassRegistry, config: &PipelineConfig) -> Result<Self, DecompileError> {
        let passes = config
            .passes
            .iter()
            .map(|spec| registry.create(spec))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { passes, threads: 1 })
    }

    /// Run per-function work on up to `threads` workers.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run every pass over `module`.
    ///
    /// # Errors
    /// The first pass error or invariant violation, with the module as it was before
    /// that pass.
    pub fn run(&self, mut module: Module, observer: Option<&dyn PassObserver>) -> Result<PipelineOutput, PipelineFailure> {
        let abi = module.abi.clone();
        let mut caches: Vec<AnalysisCache> = vec![AnalysisCache::new(); module.functions.len()];
        let mut reports: Vec<PassReport> = Vec::with_capacity(self.passes.len());
        let total = self.passes.len();

        for (index, pass) in self.passes.iter().enumerate() {
            let name = pass.name();
            if let Some(observer) = observer {
                observer.pass_started(name, index, total);
            }
            log::debug!("pass {}/{}: {}", index + 1, total, name);

            let snapshot = module.clone();
            let start = Instant::now();
            let result = match pass.scope() {
                PassScope::Module => run_module_pass(pass.as_ref(), &mut module, &mut caches, &snapshot),
                PassScope::Function => self.run_function_pass(pass.as_ref(), &mut module, &mut caches, &abi),
            };
            let verified = result.and_then(|functions_changed| {
                if functions_changed > 0 {
                    CfgVerifier::verify_module(&module)?;
                }
                Ok(functions_changed)
            });
            let functions_changed = match verified {
                Ok(count) => count,
                Err(error) => {
                    let error = error.in_pass(name);
                    log::error!("pass `{}` failed: {}", name, error);
                    return Err(PipelineFailure {
                        error,
                        last_good: Some(Box::new(snapshot)),
                        reports,
                    });
                }
            };

            let report = PassReport {
                name: name.to_string(),
                changed: functions_changed > 0,
                duration: start.elapsed(),
                functions_changed,
            };
            log::debug!(
                "pass {} changed {} functions in {:?}",
                name,
                report.functions_changed,
                report.duration
            );
            if let Some(observer) = observer {
                observer.pass_finished(&report);
            }
            reports.push(report);
        }

        module.absorb_types();
        Ok(PipelineOutput { module, reports })
    }

    /// Dispatch a function pass. Returns the number of functions it changed.
    fn run_function_pass(
        &self,
        pass: &dyn Pass,
        module: &mut Module,
        caches: &mut [AnalysisCache],
        abi: &Abi,
    ) -> Result<usize, DecompileError> {
        let required = pass.required_analyses();
        let n = module.functions.len();
        let outcomes: Vec<Result<PassOutcome, DecompileError>> = if self.threads <= 1 || n < 2 {
            module
                .functions
                .iter_mut()
                .zip(caches.iter_mut())
                .map(|(func, cache)| run_on_function(pass, func, cache, required, abi))
                .collect()
        } else {
            // Contiguous chunks keep results in module order
            let chunk = (n + self.threads - 1) / self.threads;
            std::thread::scope(|scope| {
                let workers: Vec<_> = module
                    .functions
                    .chunks_mut(chunk)
                    .zip(caches.chunks_mut(chunk))
                    .map(|(funcs, caches)| {
                        scope.spawn(move || {
                            funcs
                                .iter_mut()
                                .zip(caches.iter_mut())
                                .map(|(func, cache)| run_on_function(pass, func, cache, required, abi))
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();
                workers
                    .into_iter()
                    .flat_map(|worker| match worker.join() {
                        Ok(outcomes) => outcomes,
                        Err(_) => vec![Err(DecompileError::invariant(
                            "worker thread panicked",
                            ErrorContext::new().with_pass(pass.name()),
                        ))],
                    })
                    .collect()
            })
        };

        let mut changed = 0usize;
        for (i, outcome) in outcomes.into_iter().enumerate() {
            let outcome = outcome?;
            if outcome.changed {
                changed += 1;
            }
            if outcome.cfg_changed {
                invalidate(&mut module.functions[i], &mut caches[i]);
            }
        }
        Ok(changed)
    }
}

fn run_on_function(
    pass: &dyn Pass,
    func: &mut Function,
    cache: &mut AnalysisCache,
    required: &[AnalysisKind],
    abi: &Abi,
) -> Result<PassOutcome, DecompileError> {
    cache.ensure(required, func);
    let ctx = PassContext { analyses: cache, abi };
    let outcome = pass.run_on_function(func, &ctx)?;
    if outcome.changed {
        log::debug!("{}: changed by {}", func.name, pass.name());
    }
    Ok(outcome)
}

/// Run a module pass. Functions count as changed when their blocks or instructions differ.
fn run_module_pass(
    pass: &dyn Pass,
    module: &mut Module,
    caches: &mut Vec<AnalysisCache>,
    before: &Module,
) -> Result<usize, DecompileError> {
    let outcome = pass.run_on_module(module)?;
    if caches.len() != module.functions.len() {
        *caches = vec![AnalysisCache::new(); module.functions.len()];
    }
    if !outcome.changed {
        return Ok(0);
    }

    let mut changed = 0usize;
    for (i, func) in module.functions.iter_mut().enumerate() {
        let differs = before
            .functions
            .get(i)
            .map_or(true, |old| old.blocks != func.blocks || old.insts != func.insts);
        if differs {
            changed += 1;
        }
        if outcome.cfg_changed {
            invalidate(func, &mut caches[i]);
        }
    }
    // A module pass may report a change that touched no function body
    Ok(changed.max(1))
}

#[inline]
fn invalidate(func: &mut Function, cache: &mut AnalysisCache) {
    cache.invalidate();
    func.region = None;
}

/// Totals over a decompiled module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub functions: usize,
    pub blocks: usize,
    pub instructions: usize,
    pub warnings: usize,
    pub gotos: usize,
}

impl PipelineStats {
    pub fn collect(module: &Module) -> Self {
        Self {
            functions: module.functions.len(),
            blocks: module.block_count(),
            instructions: module.instruction_count(),
            warnings: module.warnings().count(),
            gotos: module
                .functions
                .iter()
                .filter_map(|f| f.region.as_ref())
                .map(Region::goto_count)
                .sum(),
        }
    }
}

/// Everything a decompilation produces.
#[derive(Debug, Clone)]
pub struct Decompilation {
    pub module: Module,
    pub reports: Vec<PassReport>,
    pub stats: PipelineStats,
    /// Pseudocode for every function, in module order
    pub text: String,
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    stats: &'a PipelineStats,
    passes: &'a [PassReport],
    module: &'a Module,
}

impl Decompilation {
    /// Region trees, variables, types, warnings and statistics as JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&JsonOutput {
            stats: &self.stats,
            passes: &self.reports,
            module: &self.module,
        })
    }
}

/// Decompiler front door: configuration plus pass registry.
///
/// # Examples
/// ```rust,ignore
/// let decompiler = Decompiler::new(DecompilerConfig::default())?;
/// let records = load_records(Path::new("main.json"))?;
/// let result = decompiler.decompile(&records, None)?;
/// println!("{}", result.text);
/// ```
pub struct Decompiler {
    config: DecompilerConfig,
    registry: PassRegistry,
}

impl Decompiler {
    /// Decompiler with the built-in passes.
    ///
    /// # Errors
    /// `ConfigError` when a pass option is unknown or has the wrong type.
    pub fn new(config: DecompilerConfig) -> Result<Self, ConfigError> {
        Self::with_registry(config, PassRegistry::with_builtin_passes())
    }

    pub fn with_registry(config: DecompilerConfig, registry: PassRegistry) -> Result<Self, ConfigError> {
        config.validate(&registry)?;
        Ok(Self { config, registry })
    }

    pub fn config(&self) -> &DecompilerConfig {
        &self.config
    }

    pub fn registry(&self) -> &PassRegistry {
        &self.registry
    }

    /// Short pipeline: build and verify the CFGs without running any pass.
    pub fn disassemble(&self, records: &[DecodedRecord]) -> Result<Module, DecompileError> {
        log::info!("Step 1: Building control flow graphs from {} records...", records.len());
        CfgBuilder::build(records, &self.config.abi)
    }

    /// Full pipeline: CFGs, passes, pseudocode.
    ///
    /// # Errors
    /// `UnknownPass` and `MalformedInput` before anything ran; otherwise the failing
    /// pass with the last good module.
    pub fn decompile(
        &self,
        records: &[DecodedRecord],
        observer: Option<&dyn PassObserver>,
    ) -> Result<Decompilation, PipelineFailure> {
        let pipeline = PassPipeline::new(&self.registry, &self.config.pipeline)
            .map_err(PipelineFailure::before_passes)?
            .with_threads(self.config.threads);

        let module = self.disassemble(records).map_err(PipelineFailure::before_passes)?;

        log::info!(
            "Step 2: Running {} passes over {} functions...",
            pipeline.len(),
            module.functions.len()
        );
        let PipelineOutput { module, reports } = pipeline.run(module, observer)?;

        log::info!("Step 3: Emitting pseudocode...");
        let text = Emitter::emit_module(&module, &self.config.emitter);
        let stats = PipelineStats::collect(&module);
        log::info!(
            "Decompiled {} functions ({} blocks, {} warnings, {} gotos)",
            stats.functions,
            stats.blocks,
            stats.warnings,
            stats.gotos
        );
        Ok(Decompilation {
            module,
            reports,
            stats,
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::config::PassSpec;
    use crate::decompiler::ir::{BlockId, FuncId, Opcode, StorageClass, Value};
    use crate::decompiler::passes::{PassDescriptor, PassScope};

    fn tiny_module() -> Module {
        let mut module = Module::new(Abi::default());
        for (i, entry) in [0x1000u64, 0x2000].into_iter().enumerate() {
            let mut func = Function::new(FuncId(i as u32), format!("sub_{:x}", entry), entry);
            let eax = func.add_var("eax", StorageClass::Register("eax".into()), 4);
            let b = func.add_block(entry, entry);
            func.append_inst(b, Opcode::Assign { dst: eax, src: Value::Const(1) }, entry);
            func.append_inst(b, Opcode::Return { value: Some(Value::Var(eax)) }, entry);
            module.functions.push(func);
        }
        module
    }

    const BREAKER: PassDescriptor = PassDescriptor {
        id: "breaker",
        scope: PassScope::Function,
        idempotent: false,
        description: "Deletes every terminator",
        options: &[],
    };

    struct Breaker;

    impl Pass for Breaker {
        fn name(&self) -> &'static str {
            BREAKER.id
        }

        fn run_on_function(&self, func: &mut Function, _ctx: &PassContext<'_>) -> Result<PassOutcome, DecompileError> {
            if let Some(term) = func.terminator(BlockId(0)) {
                func.remove_inst(BlockId(0), term);
            }
            Ok(PassOutcome::CHANGED)
        }
    }

    #[test]
    fn test_unknown_pass_is_rejected_before_running() {
        let registry = PassRegistry::with_builtin_passes();
        let config = PipelineConfig::from_names(&["dead-code", "no-such-pass"]);
        match PassPipeline::new(&registry, &config) {
            Err(DecompileError::UnknownPass { name, .. }) => assert_eq!(name, "no-such-pass"),
            other => panic!("expected UnknownPass, got {:?}", other.map(|p| p.names())),
        }
    }

    #[test]
    fn test_invariant_violation_returns_last_good_module() {
        let mut registry = PassRegistry::with_builtin_passes();
        registry.register(BREAKER, |_| Box::new(Breaker));
        let config = PipelineConfig {
            passes: vec![PassSpec::new("dead-code"), PassSpec::new("breaker")],
        };
        let pipeline = PassPipeline::new(&registry, &config).expect("pipeline");
        let failure = pipeline.run(tiny_module(), None).expect_err("breaker must fail");

        assert!(matches!(failure.error, DecompileError::InvariantViolation { .. }));
        assert_eq!(failure.pass(), Some("breaker"));
        assert_eq!(failure.reports.len(), 1, "dead-code finished before the failure");
        let last_good = failure.last_good.expect("last good module");
        CfgVerifier::verify_module(&last_good).expect("last good module verifies");
    }

    #[test]
    fn test_threads_do_not_change_results() {
        let registry = PassRegistry::with_builtin_passes();
        let config = PipelineConfig::default();
        let single = PassPipeline::new(&registry, &config).expect("pipeline");
        let multi = PassPipeline::new(&registry, &config).expect("pipeline").with_threads(4);

        let a = single.run(tiny_module(), None).expect("single-threaded run");
        let b = multi.run(tiny_module(), None).expect("multi-threaded run");
        let emitter = crate::decompiler::config::EmitterConfig::default();
        assert_eq!(Emitter::emit_module(&a.module, &emitter), Emitter::emit_module(&b.module, &emitter));
        let changed = |reports: &[PassReport]| reports.iter().map(|r| r.changed).collect::<Vec<_>>();
        assert_eq!(changed(&a.reports), changed(&b.reports));
    }
}
