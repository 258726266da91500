//! BufMon Classifier Library
//!
//! Decides which program points of a compilation unit create or access a buffer, and
//! asks the code-transformation facility to insert calls into the `bufmon-rt` runtime
//! there. Identifiers stay unique across separately compiled units through a shared
//! checkpoint file.
//!
//! The facility hands over a [`Module`] and receives the insertion requests through
//! the [`Rewriter`] trait.

pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod ir;
pub mod plan;
pub mod ty;

pub use checkpoint::{CheckpointLease, IdCounters};
pub use classifier::{Classifier, ModuleSummary};
pub use config::ClassifierConfig;
pub use ir::Module;
pub use plan::{RecordingRewriter, Rewriter};

use anyhow::Result;
use tracing::error;

/// Instruments one compilation unit.
///
/// Holds the identifier checkpoint for the whole run, so concurrent compilations get
/// disjoint identifier ranges. The counters are written back even when the run fails
/// part way, since the rewriter may already hold requests carrying the identifiers
/// handed out so far.
///
/// # Arguments
/// * `module` - The compilation unit to analyze
/// * `config` - Classifier configuration
/// * `rewriter` - Receives the call-insertion requests
///
/// # Returns
/// * `Ok(ModuleSummary)` - Counts of the requests that were made
/// * `Err(anyhow::Error)` - If the rewriter failed
pub fn instrument_module(
    module: &Module,
    config: &ClassifierConfig,
    rewriter: &mut dyn Rewriter,
) -> Result<ModuleSummary> {
    let mut lease = CheckpointLease::acquire(&config.id_file);
    let summary = Classifier::new(config, &mut lease.counters).run(module, rewriter);
    if let Err(e) = lease.commit() {
        // Only uniqueness across units is at stake.
        error!("{:#}", e);
    }
    summary
}
