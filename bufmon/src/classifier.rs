//! Buffer and access classifier.
//!
//! Walks every eligible function of a module once, in program order, and asks the
//! [`Rewriter`] to insert runtime calls wherever a buffer is created or accessed:
//!
//! - stack arrays and variable-length allocations ([`alloc`]);
//! - heap allocation primitives, with `realloc` flagged for eviction ([`alloc`]);
//! - indexing expressions and memory intrinsics ([`access`]);
//! - initialized global arrays, registered once per process ([`globals`]).
//!
//! Identifiers come from an [`IdCounters`] that the caller loads from, and writes back
//! to, the identifier checkpoint.

mod access;
mod alloc;
mod globals;

use crate::checkpoint::IdCounters;
use crate::config::ClassifierConfig;
use crate::ir::{Function, Instruction, InstKind, Module};
use crate::plan::{InsertPoint, InstLoc, InstrumentCall, Rewriter};
use anyhow::{Context, Result};
use smallvec::SmallVec;
use tracing::{debug, info};

pub use access::MemIntrinsic;
pub use alloc::HeapAllocator;

/// Name of the guarded helper that registers globals when the module has no entry point.
pub const REGISTER_GLOBALS_HELPER: &str = "__bufmon_register_globals";

/// Module-local flag guarding [`REGISTER_GLOBALS_HELPER`].
pub const REGISTER_GLOBALS_FLAG: &str = "__bufmon_globals_registered";

/// Calls the classifier wants inserted after one instruction.
type Calls = SmallVec<[InstrumentCall; 2]>;

/// What one classifier run requested.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ModuleSummary {
    /// `store_buffer` requests, globals included
    pub buffers: usize,
    /// `update_buffer` requests
    pub access_sites: usize,
    /// `store_buffer_pointer` requests
    pub aliases: usize,
    pub globals: usize,
    /// Functions that were analyzed
    pub functions: usize,
}

impl ModuleSummary {
    fn count(&mut self, call: &InstrumentCall) {
        match call {
            InstrumentCall::StoreBuffer { .. } => self.buffers += 1,
            InstrumentCall::UpdateBuffer { .. } => self.access_sites += 1,
            InstrumentCall::StoreBufferPointer { .. } => self.aliases += 1,
            InstrumentCall::RegisterGlobals { .. } => {}
        }
    }
}

pub struct Classifier<'a> {
    config: &'a ClassifierConfig,
    counters: &'a mut IdCounters,
    summary: ModuleSummary,
}

impl<'a> Classifier<'a> {
    pub fn new(config: &'a ClassifierConfig, counters: &'a mut IdCounters) -> Self {
        Self {
            config,
            counters,
            summary: ModuleSummary::default(),
        }
    }

    /// Classifies `module` and sends the resulting requests to `rewriter`.
    ///
    /// # Arguments
    /// * `module` - The compilation unit to analyze
    /// * `rewriter` - Receives the call-insertion requests in program order
    ///
    /// # Returns
    /// * `Ok(ModuleSummary)` - Counts of the requests that were made
    /// * `Err(anyhow::Error)` - If the rewriter fails
    pub fn run(mut self, module: &Module, rewriter: &mut dyn Rewriter) -> Result<ModuleSummary> {
        info!("Classifying module `{}`", module.name);

        let registrations = self.register_globals(module);
        let has_globals = !registrations.is_empty();
        let guarded = has_globals && !self.has_entry_point(module);
        if guarded {
            self.synthesize_registration(registrations, rewriter)?;
        } else if has_globals {
            let point = InsertPoint::FunctionEntry(self.config.entry_point.clone());
            for call in registrations {
                rewriter.insert_call(point.clone(), call)?;
            }
        }

        for function in &module.functions {
            if !is_eligible(function) {
                continue;
            }
            if guarded {
                rewriter.insert_call(
                    InsertPoint::FunctionEntry(function.name.clone()),
                    InstrumentCall::RegisterGlobals {
                        helper: REGISTER_GLOBALS_HELPER.to_string(),
                    },
                )?;
            }
            self.process_function(function, rewriter)
                .with_context(|| format!("Failed to classify function `{}`", function.name))?;
        }

        info!(
            "Module `{}`: {} buffers, {} access sites, {} aliases, {} globals",
            module.name,
            self.summary.buffers,
            self.summary.access_sites,
            self.summary.aliases,
            self.summary.globals
        );
        Ok(self.summary)
    }

    fn has_entry_point(&self, module: &Module) -> bool {
        module
            .function(&self.config.entry_point)
            .is_some_and(|f| !f.is_declaration())
    }

    fn process_function(&mut self, function: &Function, rewriter: &mut dyn Rewriter) -> Result<()> {
        debug!("Processing function `{}`", function.name);
        self.summary.functions += 1;

        for (index, inst) in function.instructions.iter().enumerate() {
            if inst.has_metadata(&self.config.skip_marker) {
                continue;
            }
            let calls = self.classify_instruction(inst);
            if calls.is_empty() {
                continue;
            }
            let point = InsertPoint::After(InstLoc {
                function: function.name.clone(),
                index,
            });
            for call in calls {
                self.summary.count(&call);
                rewriter.insert_call(point.clone(), call)?;
            }
        }
        Ok(())
    }

    fn classify_instruction(&mut self, inst: &Instruction) -> Calls {
        match &inst.kind {
            InstKind::Alloca { allocated, count } => {
                self.classify_alloca(inst, allocated, count).into_iter().collect()
            }
            InstKind::Call {
                callee: Some(callee),
                args,
            } => {
                let mut calls = Calls::new();
                calls.extend(self.classify_heap_call(inst, callee, args));
                calls.extend(self.classify_memory_call(callee, args));
                calls
            }
            InstKind::Gep {
                source,
                base,
                indices,
            } => self.classify_gep(inst, source, base, indices),
            InstKind::Call { callee: None, .. } | InstKind::Other { .. } => Calls::new(),
        }
    }
}

/// Functions with a body, excluding sanitizer runtime code and our own helper.
pub fn is_eligible(function: &Function) -> bool {
    !function.is_declaration()
        && function.name != REGISTER_GLOBALS_HELPER
        && !function.name.contains("asan")
}
