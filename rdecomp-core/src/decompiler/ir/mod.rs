//! Intermediate Representation
//!
//! Functions own arena vectors of blocks, instructions and variables; everything else
//! refers to them through the `u32`-backed ids defined here. Ids are stable for the
//! lifetime of a function except across [`Function::retain_blocks`], which renumbers blocks.

pub mod builder;
pub mod function;
pub mod instruction;
pub mod types;

pub use function::{
    BasicBlock, Edge, EdgeKind, EdgeTarget, Function, Module, StorageClass, Variable,
};
pub use instruction::{BinaryOp, CallTarget, CmpOp, Instruction, Opcode, UnaryOp, Value};
pub use types::{Type, TypeId, TypeTable};

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name(pub u32);

        impl $name {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }

            #[inline]
            pub fn from_index(index: usize) -> Self {
                Self(index as u32)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

arena_id!(
    /// Basic block index within its function.
    BlockId,
    "bb"
);
arena_id!(
    /// Instruction index within its function's arena.
    InstId,
    "i"
);
arena_id!(
    /// Variable index within its function.
    VarId,
    "v"
);
arena_id!(
    /// Function index within its module.
    FuncId,
    "f"
);
