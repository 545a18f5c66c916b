// This module holds the infrastructure shared by every pass in the crate: the fatal
// error type used to abort a pass (TranscribeError, built with thiserror), the
// recoverable diagnostic sink that accumulates user-facing errors and internal-compiler
// errors while a pass keeps producing partial output, and the options that configure
// naming of generated artifacts.

//! Core infrastructure.
//!
//! # Key Components
//!
//! ## Errors (`error`)
//! - Fatal internal-consistency violations, propagated with `?`
//!
//! ## Diagnostics (`diagnostics`)
//! - Recoverable errors, accumulated and logged
//!
//! ## Options (`options`)
//! - Name prefixes for generated derivative artifacts

pub mod diagnostics;
pub mod error;
pub mod options;

pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
pub use error::{TranscribeError, TranscribeResult};
pub use options::TranscribeOptions;
