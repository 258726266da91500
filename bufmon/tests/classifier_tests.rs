#[macro_use]
mod common;

use bufmon::checkpoint::IdCounters;
use bufmon::classifier::{REGISTER_GLOBALS_FLAG, REGISTER_GLOBALS_HELPER};
use bufmon::ir::{Function, Global, Instruction, InstKind, Module, Operand};
use bufmon::plan::{Expr, InstrumentCall, RecordingRewriter};
use bufmon::ty::Type;
use bufmon::{Classifier, ClassifierConfig};
use bufmon_rt::{BufferId, UNKNOWN_SIZE};
use common::{after, classify, config, entry, main_module, store, update, value};
use proptest::prelude::*;

fn i32_array(len: u64) -> Type {
    Type::array(Type::Int(32), len)
}

fn mul(lhs: Expr, rhs: Expr) -> Expr {
    Expr::Mul(Box::new(lhs), Box::new(rhs))
}

fn sub(lhs: Expr, rhs: Expr) -> Expr {
    Expr::Sub(Box::new(lhs), Box::new(rhs))
}

// Stack allocations

check_plan!(
    test_static_array,
    module = main_module(vec![Instruction::alloca(0, i32_array(100), Operand::Const(1))]),
    expected = [(after("main", 0), store(1, value(0), Expr::Const(400)))]
);

check_plan!(
    test_single_scalar_is_not_a_buffer,
    module = main_module(vec![Instruction::alloca(0, Type::Int(64), Operand::Const(1))]),
    expected = []
);

check_plan!(
    test_scalar_with_constant_count,
    module = main_module(vec![Instruction::alloca(0, Type::Int(32), Operand::Const(4))]),
    expected = [(after("main", 0), store(1, value(0), Expr::Const(16)))]
);

check_plan!(
    test_zero_length_array_is_known_empty,
    module = main_module(vec![Instruction::alloca(0, i32_array(0), Operand::Const(1))]),
    expected = [(after("main", 0), store(1, value(0), Expr::Const(0)))]
);

check_plan!(
    test_variable_length_array,
    module = main_module(vec![
        Instruction::other("load"),
        Instruction::alloca(1, Type::Int(32), value(0)),
    ]),
    expected = [(
        after("main", 1),
        store(1, value(1), mul(Expr::Operand(value(0)), Expr::Const(4)))
    )]
);

check_plan!(
    test_variable_length_array_of_unsized,
    module = main_module(vec![Instruction::alloca(1, Type::OpaqueStruct, value(0))]),
    expected = [(after("main", 0), store(1, value(1), Expr::Const(UNKNOWN_SIZE)))]
);

// Heap allocations

check_plan!(
    test_malloc,
    module = main_module(vec![Instruction::call(Some(1), "malloc", vec![value(0)])]),
    expected = [(after("main", 0), store(1, value(1), Expr::Operand(value(0))))]
);

check_plan!(
    test_calloc_multiplies,
    module = main_module(vec![
        Instruction::call(Some(0), "calloc", vec![Operand::Const(10), Operand::Const(4)]),
        Instruction::call(Some(3), "calloc", vec![value(1), value(2)]),
    ]),
    expected = [
        (after("main", 0), store(1, value(0), Expr::Const(40))),
        (
            after("main", 1),
            store(2, value(3), mul(Expr::Operand(value(1)), Expr::Operand(value(2))))
        ),
    ]
);

check_plan!(
    test_operator_new,
    module = main_module(vec![
        Instruction::call(Some(0), "_Znwm", vec![Operand::Const(24)]),
        Instruction::call(Some(1), "_Znam", vec![Operand::Const(80)]),
    ]),
    expected = [
        (after("main", 0), store(1, value(0), Expr::Const(24))),
        (after("main", 1), store(2, value(1), Expr::Const(80))),
    ]
);

check_plan!(
    test_realloc_is_flagged,
    module = main_module(vec![
        Instruction::call(Some(0), "malloc", vec![Operand::Const(64)]),
        Instruction::call(Some(1), "realloc", vec![value(0), Operand::Const(128)]),
    ]),
    expected = [
        (after("main", 0), store(1, value(0), Expr::Const(64))),
        (
            after("main", 1),
            InstrumentCall::StoreBuffer {
                id: BufferId::new(2),
                address: value(1),
                size: Expr::Const(128),
                is_realloc: true,
            }
        ),
    ]
);

check_plan!(
    test_allocation_without_result,
    module = main_module(vec![Instruction::call(None, "malloc", vec![Operand::Const(8)])]),
    expected = []
);

check_plan!(
    test_indirect_call,
    module = main_module(vec![Instruction::new(
        Some(1),
        InstKind::Call {
            callee: None,
            args: vec![Operand::Const(8)],
        }
    )]),
    expected = []
);

check_plan!(
    test_lookalike_calls_are_not_intrinsics,
    module = main_module(vec![
        Instruction::alloca(0, i32_array(4), Operand::Const(1)),
        Instruction::call(None, "log_memcpy_stats", vec![]),
        Instruction::call(Some(1), "strcpy_checked", vec![value(0)]),
        Instruction::call(Some(2), "calloc", vec![Operand::Const(1)]),
        Instruction::gep(3, Type::Int(8), value(0), vec![Operand::Const(2)]),
    ]),
    expected = [
        (after("main", 0), store(1, value(0), Expr::Const(16))),
        (after("main", 4), update(1, value(0), Expr::Const(2))),
    ]
);

// Memory intrinsics

check_plan!(
    test_memcpy_touches_both_buffers,
    module = main_module(vec![Instruction::call(
        None,
        "llvm.memcpy.p0.p0.i64",
        vec![value(0), value(1), value(2), Operand::Const(0)]
    )]),
    expected = [
        (after("main", 0), update(1, value(0), sub(Expr::Operand(value(2)), Expr::Const(1)))),
        (after("main", 0), update(2, value(1), sub(Expr::Operand(value(2)), Expr::Const(1)))),
    ]
);

check_plan!(
    test_memmove,
    module = main_module(vec![Instruction::call(
        Some(3),
        "memmove",
        vec![value(0), value(1), Operand::Const(32)]
    )]),
    expected = [
        (after("main", 0), update(1, value(0), Expr::Const(31))),
        (after("main", 0), update(2, value(1), Expr::Const(31))),
    ]
);

check_plan!(
    test_memset_touches_destination,
    module = main_module(vec![Instruction::call(
        None,
        "memset",
        vec![value(0), Operand::Const(0), Operand::Const(16)]
    )]),
    expected = [(after("main", 0), update(1, value(0), Expr::Const(15)))]
);

check_plan!(
    test_zero_length_copy,
    module = main_module(vec![Instruction::call(
        None,
        "memcpy",
        vec![value(0), value(1), Operand::Const(0)]
    )]),
    expected = []
);

check_plan!(
    test_strcpy_measures_source_length,
    module = main_module(vec![Instruction::call(Some(2), "strcpy", vec![value(0), value(1)])]),
    expected = [(
        after("main", 0),
        update(1, value(0), sub(Expr::Strlen(value(1)), Expr::Const(1)))
    )]
);

// Indexing

check_plan!(
    test_array_index,
    module = main_module(vec![Instruction::gep(
        5,
        i32_array(10),
        value(0),
        vec![Operand::Const(0), value(4)]
    )]),
    expected = [(after("main", 0), update(1, value(0), mul(Expr::Operand(value(4)), Expr::Const(4))))]
);

check_plan!(
    test_each_index_gets_a_site,
    module = main_module(vec![Instruction::gep(
        5,
        Type::array(Type::Int(64), 4),
        value(0),
        vec![Operand::Const(1), Operand::Const(3)]
    )]),
    expected = [
        (after("main", 0), update(1, value(0), Expr::Const(8))),
        (after("main", 0), update(2, value(0), Expr::Const(24))),
    ]
);

check_plan!(
    test_pointer_index,
    module = main_module(vec![Instruction::gep(2, Type::Int(16), value(0), vec![value(1)])]),
    expected = [(after("main", 0), update(1, value(0), mul(Expr::Operand(value(1)), Expr::Const(2))))]
);

check_plan!(
    test_unsized_element_falls_back_to_bytes,
    module = main_module(vec![Instruction::gep(2, Type::Void, value(0), vec![Operand::Const(7)])]),
    expected = [(after("main", 0), update(1, value(0), Expr::Const(7)))]
);

check_plan!(
    test_all_zero_indices,
    module = main_module(vec![Instruction::gep(
        2,
        i32_array(10),
        value(0),
        vec![Operand::Const(0), Operand::Const(0)]
    )]),
    expected = []
);

check_plan!(
    test_struct_field_access,
    module = main_module(vec![
        Instruction::gep(
            2,
            Type::Struct(vec![Type::Int(32), i32_array(4)]),
            value(0),
            vec![Operand::Const(0), Operand::Const(1)]
        ),
        Instruction::gep(3, Type::OpaqueStruct, value(0), vec![value(1)]),
    ]),
    expected = []
);

// Filtering

check_plan!(
    test_skip_marker,
    module = main_module(vec![
        Instruction::gep(2, Type::Int(8), value(0), vec![value(1)]).with_metadata("bufmon.skip"),
        Instruction::call(Some(3), "malloc", vec![Operand::Const(8)]).with_metadata("bufmon.skip"),
        Instruction::gep(4, Type::Int(8), value(0), vec![value(1)]).with_metadata("dbg"),
    ]),
    expected = [(after("main", 2), update(1, value(0), Expr::Operand(value(1))))]
);

#[test]
fn test_sanitizer_functions_and_declarations_are_skipped() {
    let body = || vec![Instruction::alloca(0, i32_array(4), Operand::Const(1))];
    let module = Module::new("test")
        .with_function(Function::declaration("malloc"))
        .with_function(Function::new("__asan_report", body()))
        .with_function(Function::new("asan.module_ctor", body()))
        .with_function(Function::new("work", body()));

    let (rewriter, summary) = classify(&module, &config()).unwrap();
    assert_eq!(summary.functions, 1);
    assert_eq!(
        rewriter.requests.iter().map(|r| r.point.clone()).collect::<Vec<_>>(),
        vec![after("work", 0)]
    );
}

// Globals

fn globals() -> Vec<Global> {
    vec![
        Global::new("table", Type::array(Type::Int(8), 16), true),
        Global::new("llvm.used", Type::array(Type::Ptr, 1), true),
        Global::new("counter", Type::Int(32), true),
        Global::new("external", Type::array(Type::Int(8), 16), false),
        Global::new("matrix", Type::array(i32_array(3), 2), true),
    ]
}

fn with_globals(mut module: Module) -> Module {
    module.globals = globals();
    module
}

check_plan!(
    test_globals_registered_in_entry_point,
    module = with_globals(main_module(vec![Instruction::alloca(0, i32_array(2), Operand::Const(1))])),
    expected = [
        (entry("main"), store(1, Operand::Global("table".to_string()), Expr::Const(16))),
        (entry("main"), store(2, Operand::Global("matrix".to_string()), Expr::Const(24))),
        (after("main", 0), store(3, value(0), Expr::Const(8))),
    ]
);

#[test]
fn test_globals_guarded_without_entry_point() {
    let body = || vec![Instruction::other("ret")];
    let module = with_globals(
        Module::new("lib")
            .with_function(Function::declaration("main"))
            .with_function(Function::new("first", body()))
            .with_function(Function::new("__asan_init", body()))
            .with_function(Function::new("second", body())),
    );

    let (rewriter, summary) = classify(&module, &config()).unwrap();
    assert_eq!(summary.globals, 2);
    assert_eq!(summary.buffers, 2);

    assert_eq!(rewriter.registrations.len(), 1);
    let registration = &rewriter.registrations[0];
    assert_eq!(registration.helper, REGISTER_GLOBALS_HELPER);
    assert_eq!(registration.flag, REGISTER_GLOBALS_FLAG);
    assert_eq!(registration.exempt_marker, "nosanitize");
    assert_eq!(
        registration.calls,
        vec![
            store(1, Operand::Global("table".to_string()), Expr::Const(16)),
            store(2, Operand::Global("matrix".to_string()), Expr::Const(24)),
        ]
    );

    let register = InstrumentCall::RegisterGlobals {
        helper: REGISTER_GLOBALS_HELPER.to_string(),
    };
    let points: Vec<_> = rewriter
        .requests
        .iter()
        .inspect(|r| assert_eq!(r.call, register))
        .map(|r| r.point.clone())
        .collect();
    assert_eq!(points, vec![entry("first"), entry("second")]);
}

#[test]
fn test_no_globals_no_registration() {
    let module = Module::new("lib").with_function(Function::new("f", vec![Instruction::other("ret")]));
    let (rewriter, _) = classify(&module, &config()).unwrap();
    assert!(rewriter.registrations.is_empty());
    assert!(rewriter.requests.is_empty());
}

#[test]
fn test_existing_helper_is_not_instrumented() {
    let module = with_globals(Module::new("lib").with_function(Function::new(
        REGISTER_GLOBALS_HELPER,
        vec![Instruction::alloca(0, i32_array(4), Operand::Const(1))],
    )));
    let (rewriter, summary) = classify(&module, &config()).unwrap();
    assert_eq!(summary.functions, 0);
    assert!(rewriter.requests.is_empty());
}

// Pointer tracking

#[test]
fn test_track_pointers() {
    let config = ClassifierConfig {
        track_buffer_pointers: true,
        ..config()
    };
    let module = main_module(vec![
        Instruction::alloca(0, i32_array(10), Operand::Const(1)),
        Instruction::gep(2, i32_array(10), value(0), vec![Operand::Const(0), value(1)]),
    ]);

    let (rewriter, summary) = classify(&module, &config).unwrap();
    assert_eq!(summary.aliases, 1);
    let offset = mul(Expr::Operand(value(1)), Expr::Const(4));
    let calls: Vec<_> = rewriter.calls_at(&after("main", 1)).cloned().collect();
    assert_eq!(
        calls,
        vec![
            update(1, value(0), offset.clone()),
            InstrumentCall::StoreBufferPointer {
                id: BufferId::new(2),
                base: value(0),
                pointer: value(2),
                offset,
            },
        ]
    );
}

// Identifiers

#[test]
fn test_identifiers_continue_from_counters() {
    let module = main_module(vec![
        Instruction::call(Some(0), "malloc", vec![Operand::Const(8)]),
        Instruction::gep(1, Type::Int(8), value(0), vec![Operand::Const(3)]),
    ]);
    let config = config();
    let mut counters = IdCounters::new(40, 900);
    let mut rewriter = RecordingRewriter::new();
    Classifier::new(&config, &mut counters)
        .run(&module, &mut rewriter)
        .unwrap();

    assert_eq!(
        rewriter.calls().cloned().collect::<Vec<_>>(),
        vec![
            store(40, value(0), Expr::Const(8)),
            update(900, value(0), Expr::Const(3)),
        ]
    );
    assert_eq!(counters, IdCounters::new(41, 901));
}

#[test]
fn test_summary() {
    let module = main_module(vec![
        Instruction::alloca(0, i32_array(4), Operand::Const(1)),
        Instruction::call(Some(1), "malloc", vec![Operand::Const(8)]),
        Instruction::call(None, "memcpy", vec![value(0), value(1), Operand::Const(8)]),
        Instruction::gep(2, Type::Int(8), value(1), vec![Operand::Const(1)]),
    ]);
    let (_, summary) = classify(&module, &config()).unwrap();
    assert_eq!(summary.buffers, 2);
    assert_eq!(summary.access_sites, 3);
    assert_eq!(summary.aliases, 0);
    assert_eq!(summary.functions, 1);
}

proptest! {
    #[test]
    fn every_nonzero_index_gets_a_fresh_site(indices in prop::collection::vec(-4i64..4, 1..6)) {
        let operands: Vec<_> = indices.iter().copied().map(Operand::Const).collect();
        let module = main_module(vec![Instruction::gep(9, Type::Int(32), value(0), operands)]);
        let (rewriter, _) = classify(&module, &config()).unwrap();

        let expected: Vec<_> = indices
            .iter()
            .filter(|index| **index != 0)
            .enumerate()
            .map(|(n, index)| update(n as u64 + 1, value(0), Expr::Const((*index * 4) as u64)))
            .collect();
        prop_assert_eq!(rewriter.calls().cloned().collect::<Vec<_>>(), expected);
    }
}
