// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout stratumd.

use std::convert;

use aal::AsicError;
use common::bytestring::ByteStringError;

pub type StratumResult<T> = Result<T, StratumError>;

/// The kind of a failure, independent of its message.  This is what a
/// P4Runtime or gNMI front end would turn into a status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotInitialized,
    InvalidParam,
    NotFound,
    EntryNotFound,
    Unimplemented,
    OperNotSupported,
    OperTimeout,
    AtLeastOneOperFailed,
    RebootRequired,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StratumError {
    #[error("Not initialized: {0}")]
    NotInitialized(String),
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Entry not found: {0}")]
    EntryNotFound(String),
    #[error("Unimplemented: {0}")]
    Unimplemented(String),
    #[error("Operation not supported: {0}")]
    OperNotSupported(String),
    #[error("Operation timed out: {0}")]
    OperTimeout(String),
    #[error("{0}")]
    AtLeastOneOperFailed(String),
    #[error("Reboot required: {0}")]
    RebootRequired(String),
    #[error("Internal error: {0}")]
    Internal(String),
    /// A call into the SDE failed in a way that doesn't map onto any of the
    /// kinds above.  `ctx` names the failing call.
    #[error("'{ctx}' failed: {err}")]
    Asic { ctx: String, err: AsicError },
}

impl StratumError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StratumError::NotInitialized(_) => ErrorCode::NotInitialized,
            StratumError::InvalidParam(_) => ErrorCode::InvalidParam,
            StratumError::NotFound(_) => ErrorCode::NotFound,
            StratumError::EntryNotFound(_) => ErrorCode::EntryNotFound,
            StratumError::Unimplemented(_) => ErrorCode::Unimplemented,
            StratumError::OperNotSupported(_) => ErrorCode::OperNotSupported,
            StratumError::OperTimeout(_) => ErrorCode::OperTimeout,
            StratumError::AtLeastOneOperFailed(_) => {
                ErrorCode::AtLeastOneOperFailed
            }
            StratumError::RebootRequired(_) => ErrorCode::RebootRequired,
            StratumError::Internal(_) | StratumError::Asic { .. } => {
                ErrorCode::Internal
            }
        }
    }

    /// Rebuild an error of the same kind with a different message.
    fn with_message(&self, msg: String) -> StratumError {
        match self.code() {
            ErrorCode::NotInitialized => StratumError::NotInitialized(msg),
            ErrorCode::InvalidParam => StratumError::InvalidParam(msg),
            ErrorCode::NotFound => StratumError::NotFound(msg),
            ErrorCode::EntryNotFound => StratumError::EntryNotFound(msg),
            ErrorCode::Unimplemented => StratumError::Unimplemented(msg),
            ErrorCode::OperNotSupported => StratumError::OperNotSupported(msg),
            ErrorCode::OperTimeout => StratumError::OperTimeout(msg),
            ErrorCode::AtLeastOneOperFailed => {
                StratumError::AtLeastOneOperFailed(msg)
            }
            ErrorCode::RebootRequired => StratumError::RebootRequired(msg),
            ErrorCode::Internal => StratumError::Internal(msg),
        }
    }
}

/// Convert a failed SDE call into the closest error kind, keeping the text
/// of the call that failed.
pub fn from_sde(ctx: &str, err: AsicError) -> StratumError {
    match err {
        AsicError::InvalidArg(m) => {
            StratumError::InvalidParam(format!("{ctx}: {m}"))
        }
        AsicError::Missing(m) => {
            StratumError::EntryNotFound(format!("{ctx}: {m}"))
        }
        AsicError::Timeout(m) => {
            StratumError::OperTimeout(format!("{ctx}: {m}"))
        }
        AsicError::OperationUnsupported => {
            StratumError::OperNotSupported(ctx.to_string())
        }
        err => StratumError::Asic {
            ctx: ctx.to_string(),
            err,
        },
    }
}

/// Evaluate an SDE call, converting any failure into a `StratumError` that
/// names the call.
macro_rules! sde_call {
    ($call:expr) => {
        $call.map_err(|e| $crate::types::from_sde(stringify!($call), e))
    };
}
pub(crate) use sde_call;

impl convert::From<AsicError> for StratumError {
    fn from(err: AsicError) -> Self {
        from_sde("sde", err)
    }
}

impl convert::From<ByteStringError> for StratumError {
    fn from(err: ByteStringError) -> Self {
        StratumError::InvalidParam(err.to_string())
    }
}

impl convert::From<std::io::Error> for StratumError {
    fn from(err: std::io::Error) -> Self {
        StratumError::Internal(format!("I/O error: {err}"))
    }
}

/// Collects the failures of a multi-step operation that keeps going after
/// an individual step fails.
#[derive(Debug, Default)]
pub struct ErrorAccumulator {
    errors: Vec<StratumError>,
}

impl ErrorAccumulator {
    pub fn new() -> Self {
        ErrorAccumulator::default()
    }

    /// Record the outcome of one step.
    pub fn push<T>(&mut self, result: StratumResult<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// The combined outcome.  The first failure decides the error kind; the
    /// messages of all failures are kept.
    pub fn into_result(self) -> StratumResult<()> {
        let mut errors = self.errors.into_iter();
        let Some(first) = errors.next() else {
            return Ok(());
        };
        let rest: Vec<String> = errors.map(|e| e.to_string()).collect();
        if rest.is_empty() {
            return Err(first);
        }
        Err(first.with_message(format!("{first} {}", rest.join(" "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails(err: AsicError) -> Result<(), AsicError> {
        Err(err)
    }

    #[test]
    fn test_sde_error_mapping() {
        let e = sde_call!(fails(AsicError::InvalidArg("bad".into())))
            .unwrap_err();
        assert_eq!(e.code(), ErrorCode::InvalidParam);
        assert!(e.to_string().contains("fails"));

        let e = sde_call!(fails(AsicError::Missing("gone".into())))
            .unwrap_err();
        assert_eq!(e.code(), ErrorCode::EntryNotFound);

        let e = sde_call!(fails(AsicError::OperationUnsupported)).unwrap_err();
        assert_eq!(e.code(), ErrorCode::OperNotSupported);

        let e = sde_call!(fails(AsicError::Exists)).unwrap_err();
        assert_eq!(e.code(), ErrorCode::Internal);
        assert!(matches!(e, StratumError::Asic { .. }));
    }

    #[test]
    fn test_accumulator() {
        let mut acc = ErrorAccumulator::new();
        assert_eq!(acc.push(Ok::<_, StratumError>(3)), Some(3));
        assert!(acc.is_empty());
        acc.push::<()>(Err(StratumError::InvalidParam("one".into())));
        acc.push::<()>(Err(StratumError::Internal("two".into())));
        let err = acc.into_result().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParam);
        assert!(err.to_string().contains("one"));
        assert!(err.to_string().contains("two"));

        assert!(ErrorAccumulator::new().into_result().is_ok());
    }
}
