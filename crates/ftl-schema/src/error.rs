//! Schema errors.
//!
//! Parsing stops at the first error; validation collects every error it
//! finds and returns them sorted and de-duplicated.

use std::fmt;

use ftl_core::{Code, ErrorCode};
use thiserror::Error;

use crate::model::Position;

/// A single positioned schema error.
#[derive(Debug, Clone, Error)]
pub struct SchemaError {
    pub pos: Position,
    pub message: String,
}

impl SchemaError {
    pub fn new(pos: &Position, message: impl Into<String>) -> Self {
        Self {
            pos: pos.clone(),
            message: message.into(),
        }
    }

    /// An error without a source position.
    pub fn global(message: impl Into<String>) -> Self {
        Self {
            pos: Position::default(),
            message: message.into(),
        }
    }

    fn sort_key(&self) -> (usize, usize, &str) {
        (self.pos.line, self.pos.column, &self.message)
    }
}

impl PartialEq for SchemaError {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for SchemaError {}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pos.is_set() {
            write!(f, "{}: {}", self.pos, self.message)
        } else {
            f.write_str(&self.message)
        }
    }
}

/// A sorted, de-duplicated list of schema errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct SchemaErrors(Vec<SchemaError>);

impl SchemaErrors {
    /// Sort by (line, column, message) and drop duplicates.
    pub fn new(mut errors: Vec<SchemaError>) -> Self {
        errors.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        errors.dedup();
        Self(errors)
    }

    pub fn errors(&self) -> &[SchemaError] {
        &self.0
    }

    pub fn messages(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }
}

impl From<SchemaError> for SchemaErrors {
    fn from(err: SchemaError) -> Self {
        Self(vec![err])
    }
}

impl fmt::Display for SchemaErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl ErrorCode for SchemaErrors {
    fn code(&self) -> Code {
        Code::InvalidArgument
    }
}

pub type SchemaResult<T> = Result<T, SchemaErrors>;
