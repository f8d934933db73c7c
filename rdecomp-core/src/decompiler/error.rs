//! Error Handling
//!
//! This module provides the error taxonomy of the decompiler using `thiserror`.
//!
//! # Error Categories
//! - **Fatal**: `MalformedInput` (decoder stream violates the CFG contract),
//!   `UnknownPass` (bad pipeline configuration), `InvariantViolation` (a pass broke a
//!   structural invariant). These stop the pipeline.
//! - **Warnings**: `TypeConflict` and `UnresolvedControlTransfer`. These degrade output
//!   quality but never stop the pipeline; they are collected per function.

use crate::decompiler::ir::BlockId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Where a failure happened.
///
/// Every field is optional: the CFG builder knows the function and address but no pass,
/// the pipeline knows the pass and function, and the verifier knows the block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub pass: Option<String>,
    pub function: Option<String>,
    pub block: Option<BlockId>,
    pub address: Option<u64>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pass(mut self, pass: impl Into<String>) -> Self {
        self.pass = Some(pass.into());
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_block(mut self, block: BlockId) -> Self {
        self.block = Some(block);
        self
    }

    pub fn with_address(mut self, address: u64) -> Self {
        self.address = Some(address);
        self
    }

    pub fn format(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(4);
        if let Some(pass) = &self.pass {
            parts.push(format!("pass `{}`", pass));
        }
        if let Some(function) = &self.function {
            parts.push(format!("function {}", function));
        }
        if let Some(block) = self.block {
            parts.push(format!("block {}", block));
        }
        if let Some(address) = self.address {
            parts.push(format!("0x{:08X}", address));
        }
        if parts.is_empty() {
            "<module>".to_string()
        } else {
            parts.join(", ")
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

/// Fatal decompiler errors.
#[derive(Error, Debug, Clone)]
pub enum DecompileError {
    /// The decoded-instruction stream violates the CFG-building contract.
    ///
    /// Raised before any pass runs.
    #[error("Malformed input at {context}: {message}\nSuggestion: {suggestion}")]
    MalformedInput {
        message: String,
        context: ErrorContext,
        suggestion: String,
    },

    /// The pipeline configuration names a pass the registry does not know.
    #[error("Unknown pass `{name}`\nSuggestion: {suggestion}")]
    UnknownPass { name: String, suggestion: String },

    /// A pass left the IR in a structurally invalid state.
    #[error("Invariant violation at {context}: {message}")]
    InvariantViolation {
        message: String,
        context: ErrorContext,
    },
}

impl DecompileError {
    /// Create a malformed-input error for a decoded record.
    pub fn malformed(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::MalformedInput {
            message: message.into(),
            context,
            suggestion: "Check that the decoder groups records by function entry and only crosses functions through call edges.".to_string(),
        }
    }

    /// Create an unknown-pass error, listing what the registry does know.
    pub fn unknown_pass(name: impl Into<String>, known: &[&str]) -> Self {
        Self::UnknownPass {
            name: name.into(),
            suggestion: format!("Known passes: {}", known.join(", ")),
        }
    }

    /// Create an invariant violation.
    pub fn invariant(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::InvariantViolation {
            message: message.into(),
            context,
        }
    }

    /// Attach a pass name to the error context if it has none yet.
    #[cold]
    pub fn in_pass(self, pass: &str) -> Self {
        match self {
            Self::InvariantViolation { message, context } if context.pass.is_none() => {
                Self::InvariantViolation {
                    message,
                    context: context.with_pass(pass),
                }
            }
            other => other,
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::MalformedInput { context, .. } | Self::InvariantViolation { context, .. } => {
                Some(context)
            }
            Self::UnknownPass { .. } => None,
        }
    }
}

/// Non-fatal diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WarningKind {
    /// Two concrete types met at a merge point; resolved to a generic integer.
    TypeConflict = 0,
    /// A control transfer whose target could not be resolved to a block.
    UnresolvedControlTransfer = 1,
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeConflict => f.write_str("type conflict"),
            Self::UnresolvedControlTransfer => f.write_str("unresolved control transfer"),
        }
    }
}

/// A recorded warning. Warnings are kept on the function that raised them, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub function: String,
    pub block: Option<BlockId>,
    pub address: Option<u64>,
    pub message: String,
}

impl Warning {
    pub fn type_conflict(function: &str, message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::TypeConflict,
            function: function.to_string(),
            block: None,
            address: None,
            message: message.into(),
        }
    }

    pub fn unresolved(function: &str, block: BlockId, address: Option<u64>) -> Self {
        let message = match address {
            Some(addr) => format!("jump to 0x{:08X} does not resolve to a block", addr),
            None => "indirect jump with no known targets".to_string(),
        };
        Self {
            kind: WarningKind::UnresolvedControlTransfer,
            function: function.to_string(),
            block: Some(block),
            address,
            message,
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.kind, self.function)?;
        if let Some(block) = self.block {
            write!(f, " ({})", block)?;
        }
        write!(f, ": {}", self.message)
    }
}
