// Runtime abort codes shared between the runtime helpers and emitted C code.
// The numeric values are part of the emitted-code contract: generated range
// checks emit `_soX_abort0(0)`, null checks `_soX_abort0(2)`, failed
// downcasts `_soX_abort0(3)` and disallowed ecalls `_soX_abort0(6)`.

use std::fmt;
use thiserror::Error;

/// Unrecoverable domain abort reasons (spec'd subset of `_soX_abort0` codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(i32)]
pub enum AbortCode {
    #[error("RANGECHECK")]
    RangeCheck = 0,
    #[error("OUT_OF_MEMORY")]
    OutOfMemory = 1,
    #[error("NULLDEREFERENCE")]
    NullDereference = 2,
    #[error("INVALIDCAST")]
    InvalidCast = 3,
    #[error("TYPE_INITIALIZATION_ERROR")]
    TypeInitialization = 4,
    #[error("DIVISION_BY_ZERO")]
    DivisionByZero = 5,
    #[error("DISALLOWED_CALL")]
    DisallowedCall = 6,
    #[error("MISSING_SYMBOL")]
    MissingSymbol = 7,
    #[error("REMOTING_ERROR")]
    Remoting = 8,
    #[error("VALUE_MISMATCH")]
    ValueMismatch = 9,
    #[error("ASSERT_FAILED")]
    AssertFailed = 10,
    #[error("STACK_OVERFLOW")]
    StackOverflow = 11,
}

impl AbortCode {
    pub fn from_i32(code: i32) -> Option<AbortCode> {
        use AbortCode::*;
        Some(match code {
            0 => RangeCheck,
            1 => OutOfMemory,
            2 => NullDereference,
            3 => InvalidCast,
            4 => TypeInitialization,
            5 => DivisionByZero,
            6 => DisallowedCall,
            7 => MissingSymbol,
            8 => Remoting,
            9 => ValueMismatch,
            10 => AssertFailed,
            11 => StackOverflow,
            _ => return None,
        })
    }
}

/// The payload carried by a domain abort as it unwinds to the domain's
/// entry-point frame.
#[derive(Debug, Clone)]
pub struct DomainAbort {
    pub code: Option<AbortCode>,
    pub message: String,
}

impl DomainAbort {
    pub fn from_code(code: AbortCode) -> Self {
        Self {
            code: Some(code),
            message: code.to_string(),
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for DomainAbort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "domain aborted: {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitted_code_contract() {
        // These values appear verbatim in generated C; they must not drift.
        assert_eq!(AbortCode::RangeCheck as i32, 0);
        assert_eq!(AbortCode::NullDereference as i32, 2);
        assert_eq!(AbortCode::InvalidCast as i32, 3);
        assert_eq!(AbortCode::DisallowedCall as i32, 6);
    }

    #[test]
    fn test_round_trip() {
        for code in 0..=11 {
            let parsed = AbortCode::from_i32(code).unwrap();
            assert_eq!(parsed as i32, code);
        }
        assert!(AbortCode::from_i32(99).is_none());
    }
}
