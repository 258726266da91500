//! Buffer creation: stack allocations and heap allocation primitives.

use crate::ir::{Instruction, Operand};
use crate::plan::{Expr, InstrumentCall};
use crate::ty::Type;
use bufmon_rt::UNKNOWN_SIZE;
use tracing::{debug, warn};

/// Heap allocation primitives the classifier recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapAllocator {
    /// `malloc(size)`
    Malloc,
    /// `calloc(count, size)`
    Calloc,
    /// `realloc(ptr, size)`
    Realloc,
    /// `operator new(size)` and `operator new[](size)`
    New,
}

impl HeapAllocator {
    pub fn from_symbol(name: &str) -> Option<Self> {
        match name {
            "malloc" => Some(HeapAllocator::Malloc),
            "calloc" => Some(HeapAllocator::Calloc),
            "realloc" => Some(HeapAllocator::Realloc),
            _ if name.starts_with("_Znwm") || name.starts_with("_Znam") => Some(HeapAllocator::New),
            _ => None,
        }
    }

    fn arity(&self) -> usize {
        match self {
            HeapAllocator::Malloc | HeapAllocator::New => 1,
            HeapAllocator::Calloc | HeapAllocator::Realloc => 2,
        }
    }

    /// Size in bytes of the allocation made with `args`.
    fn size(&self, args: &[Operand]) -> Expr {
        match self {
            HeapAllocator::Malloc | HeapAllocator::New => Expr::operand(&args[0]),
            HeapAllocator::Calloc => Expr::mul(Expr::operand(&args[0]), Expr::operand(&args[1])),
            HeapAllocator::Realloc => Expr::operand(&args[1]),
        }
    }
}

impl super::Classifier<'_> {
    /// Registers stack arrays and variable-length allocations.
    ///
    /// A single scalar is not a buffer and is left alone.
    pub(super) fn classify_alloca(
        &mut self,
        inst: &Instruction,
        allocated: &Type,
        count: &Operand,
    ) -> Option<InstrumentCall> {
        let address = inst.result_operand()?;
        let size = match count.as_const() {
            Some(count) => {
                let Ok(count) = u64::try_from(count) else {
                    debug!("Ignoring allocation with negative count {}", count);
                    return None;
                };
                if count == 1 && !allocated.is_array() {
                    return None;
                }
                let size = allocated
                    .size()
                    .and_then(|size| size.checked_mul(count))
                    .unwrap_or(UNKNOWN_SIZE);
                Expr::Const(size)
            }
            None => match allocated.size() {
                Some(size) => Expr::mul(Expr::operand(count), Expr::Const(size)),
                None => Expr::Const(UNKNOWN_SIZE),
            },
        };

        let id = self.counters.next_buffer_id();
        debug!("Stack buffer {} of size {:?}", id, size);
        Some(InstrumentCall::StoreBuffer {
            id,
            address,
            size,
            is_realloc: false,
        })
    }

    /// Registers the buffer returned by a heap allocation primitive.
    ///
    /// Calls whose arguments do not fit the matched primitive are left alone.
    pub(super) fn classify_heap_call(
        &mut self,
        inst: &Instruction,
        callee: &str,
        args: &[Operand],
    ) -> Option<InstrumentCall> {
        let allocator = HeapAllocator::from_symbol(callee)?;
        if args.len() < allocator.arity() {
            warn!(
                "Ignoring call to `{}` with {} arguments, expected {}",
                callee,
                args.len(),
                allocator.arity()
            );
            return None;
        }
        let Some(address) = inst.result_operand() else {
            debug!("Ignoring `{}` call without a result", callee);
            return None;
        };

        // Reallocations get a fresh identifier too: the runtime evicts the old record.
        let id = self.counters.next_buffer_id();
        debug!("Heap buffer {} from `{}`", id, callee);
        Some(InstrumentCall::StoreBuffer {
            id,
            address,
            size: allocator.size(args),
            is_realloc: allocator == HeapAllocator::Realloc,
        })
    }
}
