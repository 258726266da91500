//! Instrumentation requests produced by the classifier.
//!
//! The classifier never edits code itself. It describes which runtime call goes where,
//! with operand expressions the [`Rewriter`] materializes as instructions. Rewriters
//! must tag every instruction they insert with the classifier's skip marker so that a
//! later run over the same code does not instrument the instrumentation.

use crate::ir::Operand;
use anyhow::Result;
use bufmon_rt::{AccessSiteId, BufferId};

/// Runtime symbols targeted by the requests.
pub const STORE_BUFFER: &str = "store_buffer";
pub const UPDATE_BUFFER: &str = "update_buffer";
pub const STORE_BUFFER_POINTER: &str = "store_buffer_pointer";
/// `strlen` call inserted for string copies.
pub const STRLEN: &str = "strlen";

/// 64-bit value computed at the insertion point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Const(u64),
    Operand(Operand),
    /// Wrapping multiplication
    Mul(Box<Expr>, Box<Expr>),
    /// Wrapping subtraction
    Sub(Box<Expr>, Box<Expr>),
    /// Call to `strlen` on the operand
    Strlen(Operand),
}

impl Expr {
    /// Wraps an operand, turning constants into [`Expr::Const`].
    pub fn operand(operand: &Operand) -> Self {
        match operand {
            Operand::Const(value) => Expr::Const(*value as u64),
            other => Expr::Operand(other.clone()),
        }
    }

    pub fn mul(lhs: Expr, rhs: Expr) -> Self {
        match (lhs, rhs) {
            (Expr::Const(l), Expr::Const(r)) => Expr::Const(l.wrapping_mul(r)),
            (lhs, Expr::Const(1)) => lhs,
            (lhs, rhs) => Expr::Mul(Box::new(lhs), Box::new(rhs)),
        }
    }

    pub fn sub(lhs: Expr, rhs: Expr) -> Self {
        match (lhs, rhs) {
            (Expr::Const(l), Expr::Const(r)) => Expr::Const(l.wrapping_sub(r)),
            (lhs, rhs) => Expr::Sub(Box::new(lhs), Box::new(rhs)),
        }
    }

    pub fn strlen(operand: &Operand) -> Self {
        Expr::Strlen(operand.clone())
    }

    pub fn as_const(&self) -> Option<u64> {
        match self {
            Expr::Const(value) => Some(*value),
            _ => None,
        }
    }

    /// Evaluates the expression given values for non-constant operands.
    ///
    /// `strlen` is the length of the string that `resolve` returns for its operand;
    /// the callback models it as a plain integer.
    pub fn eval(&self, resolve: &impl Fn(&Operand) -> Option<u64>) -> Option<u64> {
        match self {
            Expr::Const(value) => Some(*value),
            Expr::Operand(operand) | Expr::Strlen(operand) => resolve(operand),
            Expr::Mul(lhs, rhs) => Some(lhs.eval(resolve)?.wrapping_mul(rhs.eval(resolve)?)),
            Expr::Sub(lhs, rhs) => Some(lhs.eval(resolve)?.wrapping_sub(rhs.eval(resolve)?)),
        }
    }
}

/// Call to a runtime entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentCall {
    StoreBuffer {
        id: BufferId,
        address: Operand,
        size: Expr,
        is_realloc: bool,
    },
    UpdateBuffer {
        site: AccessSiteId,
        address: Operand,
        offset: Expr,
    },
    StoreBufferPointer {
        id: BufferId,
        base: Operand,
        pointer: Operand,
        offset: Expr,
    },
    /// Call to the module's guarded global registration helper.
    RegisterGlobals { helper: String },
}

impl InstrumentCall {
    /// Name of the function the call targets.
    pub fn symbol(&self) -> &str {
        match self {
            InstrumentCall::StoreBuffer { .. } => STORE_BUFFER,
            InstrumentCall::UpdateBuffer { .. } => UPDATE_BUFFER,
            InstrumentCall::StoreBufferPointer { .. } => STORE_BUFFER_POINTER,
            InstrumentCall::RegisterGlobals { helper } => helper,
        }
    }
}

/// Position of an instruction in the original instruction stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstLoc {
    pub function: String,
    pub index: usize,
}

/// Where a call is inserted.
///
/// Several requests for the same point are inserted in the order they were made.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InsertPoint {
    /// Immediately after the instruction.
    After(InstLoc),
    /// Before the first instruction of the function.
    FunctionEntry(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub point: InsertPoint,
    pub call: InstrumentCall,
}

/// Registration of a module's global buffers when the module has no entry point.
///
/// The rewriter synthesizes an internal function `helper` that runs `calls` only while
/// the module-local boolean `flag` is false, then sets it. Both the load and the store of
/// `flag` carry `exempt_marker` so memory-safety instrumentation ignores them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedRegistration {
    pub helper: String,
    pub flag: String,
    pub calls: Vec<InstrumentCall>,
    pub exempt_marker: String,
}

/// Seam to the code-transformation facility.
pub trait Rewriter {
    /// Inserts `call` at `point`.
    fn insert_call(&mut self, point: InsertPoint, call: InstrumentCall) -> Result<()>;

    /// Creates the guarded registration helper and its flag.
    fn synthesize_guarded_registration(&mut self, registration: GuardedRegistration)
    -> Result<()>;
}

/// Rewriter that only records what it was asked to do.
#[derive(Debug, Default, Clone)]
pub struct RecordingRewriter {
    pub requests: Vec<Request>,
    pub registrations: Vec<GuardedRegistration>,
}

impl RecordingRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls inserted at `point`, in insertion order.
    pub fn calls_at<'a>(
        &'a self,
        point: &'a InsertPoint,
    ) -> impl Iterator<Item = &'a InstrumentCall> + 'a {
        self.requests
            .iter()
            .filter(move |request| &request.point == point)
            .map(|request| &request.call)
    }

    pub fn calls(&self) -> impl Iterator<Item = &InstrumentCall> {
        self.requests.iter().map(|request| &request.call)
    }
}

impl Rewriter for RecordingRewriter {
    fn insert_call(&mut self, point: InsertPoint, call: InstrumentCall) -> Result<()> {
        self.requests.push(Request { point, call });
        Ok(())
    }

    fn synthesize_guarded_registration(
        &mut self,
        registration: GuardedRegistration,
    ) -> Result<()> {
        self.registrations.push(registration);
        Ok(())
    }
}
