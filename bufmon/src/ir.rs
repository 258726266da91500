//! Intermediate representation consumed by the classifier.
//!
//! This is the narrow view of a compilation unit that the code-transformation facility
//! hands over: globals, and per function a flat instruction stream in program order.
//! Only the constructs the classifier cares about have dedicated kinds.

use crate::ty::Type;
use smallvec::SmallVec;

/// Identifier of an SSA value within a function.
pub type ValueId = u32;

/// Operand of an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Integer constant
    Const(i64),
    /// Result of another instruction or a function argument
    Value(ValueId),
    /// Address of a global
    Global(String),
}

impl Operand {
    pub fn as_const(&self) -> Option<i64> {
        match self {
            Operand::Const(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns true if the operand is statically known to be zero.
    pub fn is_zero(&self) -> bool {
        self.as_const() == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    /// Stack allocation of `count` elements of `allocated`.
    Alloca { allocated: Type, count: Operand },
    /// Direct call when `callee` is known, indirect otherwise.
    Call {
        callee: Option<String>,
        args: Vec<Operand>,
    },
    /// Address computation `base[indices...]` where `base` points to `source`.
    Gep {
        source: Type,
        base: Operand,
        indices: Vec<Operand>,
    },
    /// Anything else.
    Other { opcode: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub result: Option<ValueId>,
    pub kind: InstKind,
    /// Metadata tags attached to the instruction
    pub metadata: SmallVec<[String; 1]>,
}

impl Instruction {
    pub fn new(result: Option<ValueId>, kind: InstKind) -> Self {
        Self {
            result,
            kind,
            metadata: SmallVec::new(),
        }
    }

    pub fn alloca(result: ValueId, allocated: Type, count: Operand) -> Self {
        Self::new(Some(result), InstKind::Alloca { allocated, count })
    }

    pub fn call(result: Option<ValueId>, callee: &str, args: Vec<Operand>) -> Self {
        Self::new(
            result,
            InstKind::Call {
                callee: Some(callee.to_string()),
                args,
            },
        )
    }

    pub fn gep(result: ValueId, source: Type, base: Operand, indices: Vec<Operand>) -> Self {
        Self::new(
            Some(result),
            InstKind::Gep {
                source,
                base,
                indices,
            },
        )
    }

    pub fn other(opcode: &str) -> Self {
        Self::new(
            None,
            InstKind::Other {
                opcode: opcode.to_string(),
            },
        )
    }

    pub fn with_metadata(mut self, tag: &str) -> Self {
        self.metadata.push(tag.to_string());
        self
    }

    pub fn has_metadata(&self, tag: &str) -> bool {
        self.metadata.iter().any(|m| m == tag)
    }

    /// The instruction's result as an operand.
    pub fn result_operand(&self) -> Option<Operand> {
        self.result.map(Operand::Value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    /// Empty for declarations
    pub instructions: Vec<Instruction>,
}

impl Function {
    pub fn new(name: &str, instructions: Vec<Instruction>) -> Self {
        Self {
            name: name.to_string(),
            instructions,
        }
    }

    pub fn declaration(name: &str) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn is_declaration(&self) -> bool {
        self.instructions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub name: String,
    pub ty: Type,
    pub has_initializer: bool,
}

impl Global {
    pub fn new(name: &str, ty: Type, has_initializer: bool) -> Self {
        Self {
            name: name.to_string(),
            ty,
            has_initializer,
        }
    }
}

/// One compilation unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    /// Globals in declaration order
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_global(mut self, global: Global) -> Self {
        self.globals.push(global);
        self
    }

    pub fn with_function(mut self, function: Function) -> Self {
        self.functions.push(function);
        self
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}
