// This module implements forward-mode automatic differentiation over the instruction graph.
// A Transcriber walks an original function (or generic function) and emits, next to it,
// a derivative function whose parameters and result carry (primal, differential) pairs for
// every differentiable type. Each original instruction is transcribed at most once into a
// primal counterpart and an optional differential counterpart; the two memo tables record
// that correspondence. Differentiability is decided by the conformance context, which reads
// witness tables for the value and pointer capability interfaces, and differential types are
// derived structurally from the primal types.

//! Forward-mode differentiation.
//!
//! # Key Components
//!
//! ## Transcriber (`transcriber`)
//! - Per-instruction state machine, on-demand operand transcription
//! - Function, block, generic, parameter, witness lookup and return handlers
//!
//! ## Rules (`rules`)
//! - Forward rules for arithmetic, aggregates, memory, calls and branches
//!
//! ## Types (`types`, `zero`)
//! - Differential types, pair types, derivative signatures and zero values
//!
//! ## Conformance (`conformance`)
//! - Differentiability witnesses per (type, capability)
//!
//! ## Bookkeeping (`mapping`, `tagging`, `skip`)
//! - Primal/differential memo tables, role tags, skip set for generic bodies

pub mod conformance;
pub mod mapping;
pub mod rules;
pub mod skip;
pub mod tagging;
pub mod transcriber;
pub mod types;
pub mod zero;

pub use conformance::{Capability, ConformanceContext};
pub use mapping::{InstMapping, MapOutcome};
pub use transcriber::{InstPair, Transcriber, TranscriptionState};

use crate::core::{DiagnosticSink, TranscribeOptions, TranscribeResult};
use crate::ir::{InstId, Module};

/// Differentiate `func` in place, returning its primal and derivative.
///
/// Recoverable problems are reported to `sink`; the module is still extended
/// with whatever could be produced.
pub fn differentiate(
    module: &mut Module,
    func: InstId,
    options: &TranscribeOptions,
    sink: &mut DiagnosticSink,
) -> TranscribeResult<(InstId, Option<InstId>)> {
    let mut transcriber = Transcriber::with_options(module, sink, options.clone());
    transcriber.transcribe_function(func)
}
