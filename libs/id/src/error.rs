//! Error types for token parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The id string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The token has the wrong number of characters.
    #[error("invalid token length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The token contains a symbol outside the token alphabet.
    #[error("invalid token character {character:?} at position {position}")]
    InvalidCharacter { character: char, position: usize },

    /// A numeric id could not be parsed.
    #[error("invalid numeric id: {0}")]
    InvalidNumber(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if the input had the right shape but a bad symbol.
    pub fn is_character_error(&self) -> bool {
        matches!(self, IdError::InvalidCharacter { .. })
    }
}
