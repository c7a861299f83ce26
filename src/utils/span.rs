//! Source location tracking

use std::fmt;

use serde::{Deserialize, Serialize};

/// Location of a node in the source text, as reported by the parser.
///
/// The front end only records line numbers, which is all the diagnostics
/// of this core need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    /// 1-based source line (0 when unknown)
    pub line: u32,
}

impl Span {
    /// Create a span for a source line
    pub fn new(line: u32) -> Self {
        Self { line }
    }

    /// Create a dummy span (for testing and synthesized nodes)
    pub fn dummy() -> Self {
        Self { line: 0 }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.line)
    }
}
