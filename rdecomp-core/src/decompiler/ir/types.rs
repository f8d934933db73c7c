//! Type Lattice
//!
//! Types recovered by the type-inference pass form a small lattice, ordered from least to
//! most constrained:
//!
//! ```text
//! Unknown  ⊐  Int(N)  ⊐  Ptr(T)  ⊐  Conflict
//! ```
//!
//! # Merge Rule
//! `meet` only ever moves a type downwards:
//! - `Unknown` is the identity
//! - equal types stay equal
//! - `Ptr(a) ⊓ Ptr(b) = Ptr(a ⊓ b)` unless the pointees conflict
//! - every other disagreement, including pointer against integer, is `Conflict`
//!
//! `Conflict` is absorbing and always renders as a plain integer of the storage width, so
//! emission never fails on it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Recovered type of a variable or instruction result.
///
/// # Memory Optimization
/// Uses `#[repr(u8)]`; pointees are boxed to keep the enum small.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Type {
    /// Nothing is known yet (lattice top)
    Unknown = 0,
    /// Integer of `bytes` width
    Int { bytes: u8 } = 1,
    /// Pointer to another type
    Ptr(Box<Type>) = 2,
    /// Incompatible evidence was merged (lattice bottom)
    Conflict = 3,
}

impl Default for Type {
    fn default() -> Self {
        Type::Unknown
    }
}

impl Type {
    pub fn int(bytes: u8) -> Self {
        Type::Int { bytes }
    }

    pub fn ptr_to(pointee: Type) -> Self {
        Type::Ptr(Box::new(pointee))
    }

    /// Height in the lattice: 0 for `Unknown` up to 3 for `Conflict`.
    #[inline]
    pub fn height(&self) -> u8 {
        match self {
            Type::Unknown => 0,
            Type::Int { .. } => 1,
            Type::Ptr(_) => 2,
            Type::Conflict => 3,
        }
    }

    #[inline]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Type::Unknown)
    }

    #[inline]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Type::Conflict)
    }

    /// Greatest lower bound of two types.
    #[inline] // Hot path - called for every constraint during propagation
    pub fn meet(&self, other: &Type) -> Type {
        match (self, other) {
            (Type::Unknown, t) | (t, Type::Unknown) => t.clone(),
            (Type::Conflict, _) | (_, Type::Conflict) => Type::Conflict,
            (Type::Int { bytes: a }, Type::Int { bytes: b }) if a == b => Type::Int { bytes: *a },
            (Type::Ptr(a), Type::Ptr(b)) => match a.meet(b) {
                Type::Conflict => Type::Conflict,
                pointee => Type::Ptr(Box::new(pointee)),
            },
            _ => Type::Conflict,
        }
    }

    /// `true` when `self` is at or below `other` in the lattice.
    pub fn refines(&self, other: &Type) -> bool {
        self.meet(other) == *self
    }

    /// Widen 1- and 2-byte integers to 4 bytes.
    pub fn widened(&self) -> Type {
        match self {
            Type::Int { bytes } if *bytes < 4 => Type::Int { bytes: 4 },
            Type::Ptr(inner) => Type::Ptr(Box::new(inner.widened())),
            other => other.clone(),
        }
    }

    /// C spelling of the type for storage of `width` bytes.
    ///
    /// `Unknown` becomes `undefinedN`; `Conflict` falls back to a signed integer of the
    /// storage width (`int32_t` when the width is unknown).
    pub fn c_name(&self, width: u8) -> String {
        match self {
            Type::Unknown => format!("undefined{}", width.max(1)),
            Type::Int { bytes } => int_name(*bytes),
            Type::Ptr(inner) => {
                let pointee = match inner.as_ref() {
                    Type::Unknown => "void".to_string(),
                    other => other.c_name(width),
                };
                if pointee.ends_with('*') {
                    format!("{}*", pointee)
                } else {
                    format!("{} *", pointee)
                }
            }
            Type::Conflict => int_name(if width == 0 { 4 } else { width }),
        }
    }
}

fn int_name(bytes: u8) -> String {
    format!("int{}_t", u32::from(bytes) * 8)
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Unknown => f.write_str("unknown"),
            Type::Int { bytes } => write!(f, "int{}", u32::from(*bytes) * 8),
            Type::Ptr(inner) => write!(f, "ptr<{}>", inner),
            Type::Conflict => f.write_str("conflict"),
        }
    }
}

/// Index into the module's [`TypeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TypeId(pub u32);

/// Global, append-only table of the types used by a module.
///
/// Functions never touch the table while passes run; the pipeline merges each function's
/// types in module order once the run completes, so ids do not depend on thread count.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeTable {
    entries: Vec<Type>,
    #[serde(skip)]
    index: HashMap<Type, TypeId>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id of `ty`, appending it if it is new.
    pub fn intern(&mut self, ty: &Type) -> TypeId {
        if let Some(&id) = self.index.get(ty) {
            return id;
        }
        let id = TypeId(self.entries.len() as u32);
        self.entries.push(ty.clone());
        self.index.insert(ty.clone(), id);
        id
    }

    pub fn get(&self, id: TypeId) -> Option<&Type> {
        self.entries.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &Type)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, ty)| (TypeId(i as u32), ty))
    }
}
