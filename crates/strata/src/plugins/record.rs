//! Plugin output records.

use crate::memory::MemoryError;
use crate::object::{ObjectError, TypedObject};
use serde::Serialize;
use thiserror::Error;

/// Failure to produce one record. The stream continues after it.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct RecordError {
    /// Where the failing record would have been.
    pub offset: Option<u64>,
    pub message: String,
}

impl RecordError {
    pub fn new(message: impl Into<String>) -> Self {
        RecordError {
            offset: None,
            message: message.into(),
        }
    }

    pub fn at(offset: u64, message: impl Into<String>) -> Self {
        RecordError {
            offset: Some(offset),
            message: message.into(),
        }
    }
}

impl From<ObjectError> for RecordError {
    fn from(e: ObjectError) -> Self {
        let offset = match &e {
            ObjectError::Fault { offset, .. } => Some(*offset),
            _ => None,
        };
        RecordError {
            offset,
            message: e.to_string(),
        }
    }
}

impl From<MemoryError> for RecordError {
    fn from(e: MemoryError) -> Self {
        RecordError::new(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum Cell {
    /// Rendered as `{type, offset, value}`.
    Object(TypedObject),
    Value(serde_json::Value),
    /// A derived field that could not be computed.
    Error(String),
}

impl Cell {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Cell::Object(obj) => obj.to_json(1),
            Cell::Value(v) => v.clone(),
            Cell::Error(msg) => serde_json::json!({ "error": msg }),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Cell::Error(_))
    }
}

/// Ordered named cells.
#[derive(Debug, Clone, Default)]
pub struct Record {
    fields: Vec<(String, Cell)>,
    /// Set only by [`Record::from_error`].
    failed: bool,
}

impl Record {
    pub fn builder() -> RecordBuilder {
        RecordBuilder::default()
    }

    /// The record standing in for a failed one.
    pub fn from_error(error: RecordError) -> Self {
        let mut builder = Record::builder();
        if let Some(offset) = error.offset {
            builder = builder.value("offset", offset);
        }
        let mut record = builder.error("error", error.message).build();
        record.failed = true;
        record
    }

    pub fn fields(&self) -> &[(String, Cell)] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&Cell> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    /// Shorthand for a `Value` cell.
    pub fn value(&self, name: &str) -> Option<&serde_json::Value> {
        match self.get(name) {
            Some(Cell::Value(v)) => Some(v),
            _ => None,
        }
    }

    /// True for records produced by [`Record::from_error`].
    pub fn is_error(&self) -> bool {
        self.failed
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(name, cell)| (name.clone(), cell.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

#[derive(Debug, Default)]
pub struct RecordBuilder {
    fields: Vec<(String, Cell)>,
}

impl RecordBuilder {
    pub fn cell(mut self, name: impl Into<String>, cell: Cell) -> Self {
        self.fields.push((name.into(), cell));
        self
    }

    pub fn value(self, name: impl Into<String>, value: impl Serialize) -> Self {
        let cell = match serde_json::to_value(value) {
            Ok(v) => Cell::Value(v),
            Err(e) => Cell::Error(e.to_string()),
        };
        self.cell(name, cell)
    }

    pub fn object(self, name: impl Into<String>, object: TypedObject) -> Self {
        self.cell(name, Cell::Object(object))
    }

    pub fn error(self, name: impl Into<String>, message: impl Into<String>) -> Self {
        self.cell(name, Cell::Error(message.into()))
    }

    /// Add a derived value; a failure is recorded in the cell instead of
    /// failing the record.
    pub fn try_field<T, E, F>(self, name: impl Into<String>, f: F) -> Self
    where
        T: Serialize,
        E: std::fmt::Display,
        F: FnOnce() -> Result<T, E>,
    {
        match f() {
            Ok(v) => self.value(name, v),
            Err(e) => self.error(name, e.to_string()),
        }
    }

    pub fn build(self) -> Record {
        Record {
            fields: self.fields,
            failed: false,
        }
    }
}

/// JSON form of each record, in order.
pub fn records_to_json<I>(records: I) -> Vec<serde_json::Value>
where
    I: IntoIterator<Item = Record>,
{
    records.into_iter().map(|r| r.to_json()).collect()
}
