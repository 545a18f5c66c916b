//! fwdiff - Forward-mode automatic differentiation over a typed instruction graph.
//!
//! Given a function marked differentiable, fwdiff emits a derivative function
//! next to it in the same module. The derivative takes (primal, differential)
//! pairs for every differentiable parameter and returns one for a
//! differentiable result. Generic functions are handled by differentiating the
//! whole generic scope, with differentiability supplied through witness tables.
//!
//! # Primary Usage
//!
//! ```ignore
//! use fwdiff::core::{DiagnosticSink, TranscribeOptions};
//! use fwdiff::ir::parse_module;
//!
//! let mut parsed = parse_module(source)?;
//! let func = parsed.get("square").unwrap();
//! let mut sink = DiagnosticSink::new();
//! let (primal, derivative) =
//!     fwdiff::differentiate(&mut parsed.module, func, &TranscribeOptions::default(), &mut sink)?;
//! println!("{}", parsed.module);
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - Instruction arena, builder, textual parser and printer
//! - [`autodiff`] - Transcriber, forward rules, type engine, conformance
//! - [`core`] - Errors, diagnostics and options shared by the passes

pub mod autodiff;
pub mod core;
pub mod ir;

pub use autodiff::{differentiate, InstPair, Transcriber, TranscriptionState};
pub use core::{
    Diagnostic, DiagnosticKind, DiagnosticSink, TranscribeError, TranscribeOptions, TranscribeResult,
};
pub use ir::{parse_module, Builder, InsertLoc, InstId, Module, Opcode, ParsedModule};
