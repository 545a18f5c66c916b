// This module defines the fatal error types of the transcriber using the thiserror crate.
// TranscribeError covers the failures after which a differentiation pass cannot
// meaningfully continue: a differential re-registration that disagrees with the cached
// value, a pair type or zero value requested for a type without a differentiability
// witness, reentry into an instruction that is still being transcribed, and states that
// should be unreachable (such as meeting an associated type). Each variant carries the
// instruction handles involved. Recoverable problems are not errors; they go to the
// DiagnosticSink. TranscribeResult<T> is the convenience alias used throughout.

//! Error types for the transcriber.
//!
//! Using thiserror for more idiomatic error handling.

use crate::ir::InstId;
use thiserror::Error;

/// Internal-consistency violations that abort a differentiation pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranscribeError {
    #[error("differential of {inst} already mapped to {existing:?}, refusing {new:?}")]
    InconsistentDifferential {
        inst: InstId,
        existing: Option<InstId>,
        new: Option<InstId>,
    },

    #[error("type {ty} has no differentiability witness")]
    MissingWitness { ty: InstId },

    #[error("{inst} was requested again while still being transcribed")]
    Reentrant { inst: InstId },

    #[error("unexpected state at {inst}: {reason}")]
    Unexpected { inst: InstId, reason: String },
}

/// Result type alias for transcription operations.
pub type TranscribeResult<T> = Result<T, TranscribeError>;
