//! Error types for the ISF crate.

use thiserror::Error;

/// ISF loading and lookup errors.
///
/// The first group (`FileNotFound` through `DuplicateType`) are load errors:
/// the definition source itself is unusable. `UnknownType` and
/// `UnknownSymbol` are lookup errors against a successfully loaded profile.
#[derive(Debug, Error)]
pub enum IsfError {
    #[error("ISF file not found: {0}")]
    FileNotFound(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("XZ/LZMA decompression error: {0}")]
    Decompression(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Type {name} referenced by {referenced_by} is not defined")]
    UndefinedType { name: String, referenced_by: String },

    #[error("Invalid definition for {name}: {msg}")]
    InvalidDefinition { name: String, msg: String },

    #[error("Type name defined more than once: {0}")]
    DuplicateType(String),

    #[error("Type not found: {0}")]
    UnknownType(String),

    #[error("Symbol not found: {0}")]
    UnknownSymbol(String),
}

impl IsfError {
    /// True when the error means the definition source could not be loaded.
    pub fn is_load_error(&self) -> bool {
        !matches!(self, IsfError::UnknownType(_) | IsfError::UnknownSymbol(_))
    }

    pub(crate) fn invalid(name: impl Into<String>, msg: impl Into<String>) -> Self {
        IsfError::InvalidDefinition {
            name: name.into(),
            msg: msg.into(),
        }
    }
}

pub type IsfResult<T> = Result<T, IsfError>;
