//! Parse errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Error)]
pub enum ParseError {
    /// The datagram violates the RFC 5424 grammar.
    #[error("{message} (at offset {offset})")]
    Syntax { offset: usize, message: String },

    /// The host registry could not resolve the sender.
    #[error("Failed to resolve host: {0}")]
    Host(#[from] logreceiver_core::Error),
}

impl ParseError {
    pub(crate) fn syntax(offset: usize, message: impl Into<String>) -> Self {
        ParseError::Syntax {
            offset,
            message: message.into(),
        }
    }

    /// Byte offset of the failing token, if this is a grammar error.
    pub fn offset(&self) -> Option<usize> {
        match self {
            ParseError::Syntax { offset, .. } => Some(*offset),
            ParseError::Host(_) => None,
        }
    }
}
