//! Error handling for the og compiler core

use crate::utils::Span;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Compiler error
///
/// The first error raised by a pass aborts the whole compilation unit.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // ==================== User Errors ====================

    #[error("{message}")]
    Type { message: String, span: Span },

    #[error("{message}")]
    Flow { message: String, span: Span },

    // ==================== Input Errors ====================

    #[error("malformed syntax tree: {0}")]
    Ast(String),

    // ==================== Compiler Bugs ====================

    /// Frame calculator and postfix writer disagree, or a node reached
    /// code generation in a state the checkers should have rejected.
    #[error("ICE: {0}")]
    Internal(String),
}

impl Error {
    pub fn type_error(span: Span, message: impl Into<String>) -> Self {
        Self::Type { message: message.into(), span }
    }

    pub fn flow_error(span: Span, message: impl Into<String>) -> Self {
        Self::Flow { message: message.into(), span }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Get the span associated with this error
    pub fn span(&self) -> Option<Span> {
        match self {
            Self::Type { span, .. } | Self::Flow { span, .. } => Some(*span),
            Self::Ast(_) | Self::Internal(_) => None,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// Render as a `<line>: <message>` diagnostic
    pub fn diagnostic(&self) -> String {
        match self.span() {
            Some(span) => format!("{}: {}", span, self),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_carries_line() {
        let err = Error::type_error(Span::new(12), "undeclared variable 'x'");
        assert_eq!(err.diagnostic(), "12: undeclared variable 'x'");
        assert_eq!(err.span(), Some(Span::new(12)));
    }

    #[test]
    fn test_internal_has_no_span() {
        let err = Error::internal("no temporary for node 3");
        assert!(err.is_internal());
        assert_eq!(err.span(), None);
        assert_eq!(err.diagnostic(), "ICE: no temporary for node 3");
    }
}
