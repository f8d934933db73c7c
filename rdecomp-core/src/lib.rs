//! rdecomp: a decompiler backend.
//!
//! Decoded machine instructions go in, C-like pseudocode comes out:
//! [`decompiler::cfg`] builds control-flow graphs, [`decompiler::pipeline`] runs the
//! configured IR passes, [`decompiler::structurer`] recovers structured control flow and
//! [`decompiler::emitter`] renders it.

pub mod decompiler;
