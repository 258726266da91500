//! Buffer accesses: indexing expressions and memory intrinsics.

use super::Calls;
use crate::ir::{Instruction, Operand};
use crate::plan::{Expr, InstrumentCall};
use crate::ty::Type;
use tracing::{debug, warn};

/// Library calls that touch a range of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemIntrinsic {
    /// `memcpy(dst, src, len)` and `memmove(dst, src, len)`
    Copy,
    /// `memset(dst, value, len)`
    Set,
    /// `strcpy(dst, src)`
    StrCopy,
}

impl MemIntrinsic {
    /// Matches library functions as well as compiler intrinsics such as
    /// `llvm.memcpy.p0.p0.i64`.
    pub fn from_symbol(name: &str) -> Option<Self> {
        if name.contains("memcpy") || name.contains("memmove") {
            Some(MemIntrinsic::Copy)
        } else if name.contains("memset") {
            Some(MemIntrinsic::Set)
        } else if name.contains("strcpy") {
            Some(MemIntrinsic::StrCopy)
        } else {
            None
        }
    }

    fn arity(&self) -> usize {
        match self {
            MemIntrinsic::Copy | MemIntrinsic::Set => 3,
            MemIntrinsic::StrCopy => 2,
        }
    }
}

impl super::Classifier<'_> {
    /// Records the last byte touched by a memory intrinsic.
    ///
    /// Names are matched loosely, so a call that does not take the intrinsic's
    /// arguments is some other function and is left alone.
    pub(super) fn classify_memory_call(&mut self, callee: &str, args: &[Operand]) -> Calls {
        let mut calls = Calls::new();
        let Some(intrinsic) = MemIntrinsic::from_symbol(callee) else {
            return calls;
        };
        if args.len() < intrinsic.arity() {
            warn!(
                "Ignoring call to `{}` with {} arguments, expected {}",
                callee,
                args.len(),
                intrinsic.arity()
            );
            return calls;
        }

        match intrinsic {
            MemIntrinsic::Copy | MemIntrinsic::Set => {
                if args[2].is_zero() {
                    debug!("Ignoring zero-length `{}`", callee);
                    return calls;
                }
                let last_byte = Expr::sub(Expr::operand(&args[2]), Expr::Const(1));
                calls.push(self.access(&args[0], last_byte.clone()));
                if intrinsic == MemIntrinsic::Copy {
                    calls.push(self.access(&args[1], last_byte));
                }
            }
            MemIntrinsic::StrCopy => {
                let last_byte = Expr::sub(Expr::strlen(&args[1]), Expr::Const(1));
                calls.push(self.access(&args[0], last_byte));
            }
        }
        calls
    }

    /// Records one access per non-zero index of an indexing expression.
    ///
    /// Field accesses into structs are not buffer accesses and are skipped entirely.
    pub(super) fn classify_gep(
        &mut self,
        inst: &Instruction,
        source: &Type,
        base: &Operand,
        indices: &[Operand],
    ) -> Calls {
        let mut calls = Calls::new();
        if source.is_struct() || indices.iter().all(Operand::is_zero) {
            return calls;
        }

        let element_size = match source {
            Type::Array(element, _) => element.size(),
            other => other.size(),
        }
        .filter(|size| *size != 0)
        .unwrap_or(1);

        let pointer = inst
            .result_operand()
            .filter(|_| self.config.track_buffer_pointers);
        for index in indices.iter().filter(|index| !index.is_zero()) {
            let offset = Expr::mul(Expr::operand(index), Expr::Const(element_size));
            calls.push(self.access(base, offset.clone()));
            if let Some(pointer) = &pointer {
                let id = self.counters.next_buffer_id();
                calls.push(InstrumentCall::StoreBufferPointer {
                    id,
                    base: base.clone(),
                    pointer: pointer.clone(),
                    offset,
                });
            }
        }
        calls
    }

    fn access(&mut self, address: &Operand, offset: Expr) -> InstrumentCall {
        let site = self.counters.next_site_id();
        debug!("Access site {} on {:?}", site, address);
        InstrumentCall::UpdateBuffer {
            site,
            address: address.clone(),
            offset,
        }
    }
}
