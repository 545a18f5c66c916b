//! Recoverable diagnostics.
//!
//! The sink accumulates user-facing errors and internal-compiler-errors that
//! do not stop the pass. Every diagnostic is also forwarded to `log`.

use crate::ir::SourceLoc;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// An instruction has no differentiation rule.
    CannotDifferentiate,
    /// Inconsistent bookkeeping that the pass can recover from.
    InternalError,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::CannotDifferentiate => f.write_str("error"),
            DiagnosticKind::InternalError => f.write_str("internal compiler error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub loc: SourceLoc,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.loc, self.kind, self.message)
    }
}

#[derive(Debug, Default)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnose(&mut self, loc: SourceLoc, kind: DiagnosticKind, message: impl Into<String>) {
        let diagnostic = Diagnostic {
            loc,
            kind,
            message: message.into(),
        };
        log::warn!("{diagnostic}");
        self.diagnostics.push(diagnostic);
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.diagnostics.iter().filter(|d| d.kind == kind).count()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_location_and_kind() {
        let mut sink = DiagnosticSink::new();
        sink.diagnose(
            SourceLoc { line: 3, column: 7 },
            DiagnosticKind::CannotDifferentiate,
            "instruction cannot be differentiated",
        );
        assert_eq!(sink.count(DiagnosticKind::CannotDifferentiate), 1);
        assert_eq!(sink.count(DiagnosticKind::InternalError), 0);
        assert_eq!(
            sink.diagnostics()[0].to_string(),
            "3:7: error: instruction cannot be differentiated"
        );
    }
}
