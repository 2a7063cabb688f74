//! Error types for typed object access.

use isf::IsfError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Type '{type_name}' has no field '{field}'")]
    UnknownField { type_name: String, field: String },

    #[error("Index {index} out of range for array of {count}")]
    IndexOutOfRange { index: u64, count: u64 },

    #[error("'{0}' is not a struct")]
    NotAStruct(String),

    #[error("'{0}' is not an array")]
    NotAnArray(String),

    #[error("'{0}' is not a pointer")]
    NotAPointer(String),

    #[error("'{0}' has no scalar value")]
    NotAScalar(String),

    #[error("'{0}' has no known element count")]
    UnboundedArray(String),

    /// Only raised when the address space uses the fault fill policy.
    #[error("Read of {length} bytes at {offset:#x} faulted ({faulted} bytes unmapped)")]
    Fault {
        offset: u64,
        length: usize,
        faulted: u64,
    },

    #[error("Profile error: {0}")]
    Profile(IsfError),
}

impl From<IsfError> for ObjectError {
    fn from(err: IsfError) -> Self {
        match err {
            IsfError::UnknownType(name) => ObjectError::UnknownType(name),
            other => ObjectError::Profile(other),
        }
    }
}

pub type ObjectResult<T> = Result<T, ObjectError>;
