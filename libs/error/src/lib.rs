// Copyright 2026 Loam Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The error type shared by the fiber runtime and the tuple update engine.
//!
//! Every fiber carries exactly one diagnostic slot holding at most one
//! [`Error`]. Fallible operations set the slot and return the error; joining
//! a failed fiber moves the slot into the joiner.

use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Arena exhaustion, pool allocation failure.
    #[error("memory allocation failed")]
    OutOfMemory,

    /// Thread creation and other OS-level failures.
    #[error("system error: {0}")]
    System(String),

    /// Cancellation observed at a suspension point.
    #[error("fiber is cancelled")]
    FiberIsCancelled,

    /// A timed wait expired before being signalled.
    #[error("timed out")]
    TimedOut,

    /// Malformed operation batch, bad opcode, bad JSON path.
    #[error("illegal parameters: {0}")]
    IllegalParams(String),

    /// A selector addressed a position the record does not have.
    #[error("field {0} was not found in the tuple")]
    NoSuchField(String),

    /// An operation argument or source field has the wrong type.
    #[error("argument type in operation '{op}' on field {field}: expected {expected}")]
    UpdateFieldType {
        op: char,
        field: String,
        expected: &'static str,
    },

    #[error("integer overflow in operation '{op}' on field {field}")]
    IntegerOverflow { op: char, field: String },

    #[error("decimal overflow in operation '{op}' on field {field}")]
    DecimalOverflow { op: char, field: String },

    /// Splice bounds fell outside the source string.
    #[error("splice bounds in operation on field {field}: {msg}")]
    Splice { field: String, msg: String },

    /// Intersected JSON paths, wildcard paths and friends.
    #[error("unsupported update operation: {0}")]
    UnsupportedUpdate(String),

    /// The same field or key was addressed twice in one batch.
    #[error("duplicate: {0}")]
    Duplicate(String),
}

impl Error {
    /// Whether this error came from applying an operation to a concrete
    /// record, as opposed to decoding the batch itself. Upsert mode
    /// downgrades apply-time errors to log entries.
    pub fn is_apply_time(&self) -> bool {
        matches!(
            self,
            Error::NoSuchField(_)
                | Error::UpdateFieldType { .. }
                | Error::IntegerOverflow { .. }
                | Error::DecimalOverflow { .. }
                | Error::Splice { .. }
                | Error::UnsupportedUpdate(_)
                | Error::Duplicate(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_terse() {
        assert_eq!(Error::OutOfMemory.to_string(), "memory allocation failed");
        assert_eq!(
            Error::NoSuchField("3".into()).to_string(),
            "field 3 was not found in the tuple"
        );
    }

    #[test]
    fn apply_time_classification() {
        assert!(Error::Duplicate("field 2".into()).is_apply_time());
        assert!(!Error::IllegalParams("bad opcode".into()).is_apply_time());
        assert!(!Error::OutOfMemory.is_apply_time());
    }
}
