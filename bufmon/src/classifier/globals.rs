//! Global arrays.
//!
//! Globals live for the whole process, so each module registers its arrays once. With
//! an entry point the registrations run at its start. Otherwise any function of the
//! module may run first, so each of them calls a helper that registers on first use.

use super::{REGISTER_GLOBALS_FLAG, REGISTER_GLOBALS_HELPER};
use crate::ir::{Global, Module, Operand};
use crate::plan::{Expr, GuardedRegistration, InstrumentCall, Rewriter};
use anyhow::Result;
use bufmon_rt::UNKNOWN_SIZE;
use tracing::debug;

/// Returns true for initialized arrays that are not toolchain metadata.
pub fn is_global_buffer(global: &Global) -> bool {
    global.ty.is_array() && global.has_initializer && !global.name.starts_with("llvm.")
}

impl super::Classifier<'_> {
    /// Assigns identifiers to the module's global arrays, in declaration order.
    pub(super) fn register_globals(&mut self, module: &Module) -> Vec<InstrumentCall> {
        let calls: Vec<_> = module
            .globals
            .iter()
            .filter(|global| is_global_buffer(global))
            .map(|global| {
                let id = self.counters.next_buffer_id();
                debug!("Global buffer {} for `{}`", id, global.name);
                InstrumentCall::StoreBuffer {
                    id,
                    address: Operand::Global(global.name.clone()),
                    size: Expr::Const(global.ty.size().unwrap_or(UNKNOWN_SIZE)),
                    is_realloc: false,
                }
            })
            .collect();
        self.summary.globals += calls.len();
        self.summary.buffers += calls.len();
        calls
    }

    pub(super) fn synthesize_registration(
        &self,
        calls: Vec<InstrumentCall>,
        rewriter: &mut dyn Rewriter,
    ) -> Result<()> {
        debug!(
            "No `{}` in module, registering {} globals lazily",
            self.config.entry_point,
            calls.len()
        );
        rewriter.synthesize_guarded_registration(GuardedRegistration {
            helper: REGISTER_GLOBALS_HELPER.to_string(),
            flag: REGISTER_GLOBALS_FLAG.to_string(),
            calls,
            exempt_marker: self.config.sanitizer_exempt_marker.clone(),
        })
    }
}
