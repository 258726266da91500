//! Common test utilities and macros

#![allow(dead_code)]

use bufmon::checkpoint::IdCounters;
use bufmon::ir::{Function, Instruction, Module, Operand};
use bufmon::plan::{Expr, InsertPoint, InstLoc, InstrumentCall, RecordingRewriter};
use bufmon::{Classifier, ClassifierConfig, ModuleSummary};
use bufmon_rt::{AccessSiteId, BufferId};

/// Configuration with every optional behavior off.
pub fn config() -> ClassifierConfig {
    ClassifierConfig {
        track_buffer_pointers: false,
        ..ClassifierConfig::default()
    }
}

/// Classifies `module` with counters starting at 1.
pub fn classify(
    module: &Module,
    config: &ClassifierConfig,
) -> anyhow::Result<(RecordingRewriter, ModuleSummary)> {
    let mut counters = IdCounters::default();
    let mut rewriter = RecordingRewriter::new();
    let summary = Classifier::new(config, &mut counters).run(module, &mut rewriter)?;
    Ok((rewriter, summary))
}

/// Module with a single `main` made of `instructions`.
pub fn main_module(instructions: Vec<Instruction>) -> Module {
    Module::new("test").with_function(Function::new("main", instructions))
}

pub fn after(function: &str, index: usize) -> InsertPoint {
    InsertPoint::After(InstLoc {
        function: function.to_string(),
        index,
    })
}

pub fn entry(function: &str) -> InsertPoint {
    InsertPoint::FunctionEntry(function.to_string())
}

pub fn value(id: u32) -> Operand {
    Operand::Value(id)
}

pub fn store(id: u32, address: Operand, size: Expr) -> InstrumentCall {
    InstrumentCall::StoreBuffer {
        id: BufferId::new(id),
        address,
        size,
        is_realloc: false,
    }
}

pub fn update(site: u64, address: Operand, offset: Expr) -> InstrumentCall {
    InstrumentCall::UpdateBuffer {
        site: AccessSiteId::new(site),
        address,
        offset,
    }
}

/// Checks that an error message matches `pattern`.
pub fn assert_error_matches(error: &anyhow::Error, pattern: &str) {
    let message = format!("{:#}", error);
    assert!(
        regex::Regex::new(pattern).unwrap().is_match(&message),
        "`{}` does not match `{}`",
        message,
        pattern
    );
}

#[macro_export]
macro_rules! check_plan {
    ($test_name:ident, module = $module:expr, expected = [$(($point:expr, $call:expr)),* $(,)?]) => {
        #[test]
        fn $test_name() {
            let module = $module;
            let (rewriter, _) = crate::common::classify(&module, &crate::common::config()).unwrap();
            let actual: Vec<_> = rewriter
                .requests
                .into_iter()
                .map(|request| (request.point, request.call))
                .collect();
            let expected: Vec<(bufmon::plan::InsertPoint, bufmon::plan::InstrumentCall)> =
                vec![$(($point, $call)),*];
            assert_eq!(actual, expected);
        }
    };
}
