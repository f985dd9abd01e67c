//! Business status taxonomy carried by every call.
//!
//! A [`Status`] is what handlers return and what callers receive. It is
//! independent of the wire representation; see [`crate::grpc::error`] for the
//! translation to and from `tonic::Status`.

use std::fmt;

use prost_types::Any;

/// Application-level status codes.
///
/// The numeric values are part of the wire contract: outbound errors carry the
/// decimal code as the wire message, so legacy consumers that only read that
/// message keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusinessCode {
    Ok,
    RequestErr,
    Unauthorized,
    AccessDenied,
    NothingFound,
    MethodNotAllowed,
    Canceled,
    ServerErr,
    ServiceUnavailable,
    Deadline,
    LimitExceed,
    /// Any application-defined code outside the closed set.
    Other(i32),
}

impl BusinessCode {
    /// Numeric value of the code.
    pub fn code(self) -> i32 {
        match self {
            BusinessCode::Ok => 0,
            BusinessCode::RequestErr => -400,
            BusinessCode::Unauthorized => -401,
            BusinessCode::AccessDenied => -403,
            BusinessCode::NothingFound => -404,
            BusinessCode::MethodNotAllowed => -405,
            BusinessCode::Canceled => -498,
            BusinessCode::ServerErr => -500,
            BusinessCode::ServiceUnavailable => -503,
            BusinessCode::Deadline => -504,
            BusinessCode::LimitExceed => -509,
            BusinessCode::Other(code) => code,
        }
    }

    /// Decode a numeric value, mapping known values onto the closed set.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => BusinessCode::Ok,
            -400 => BusinessCode::RequestErr,
            -401 => BusinessCode::Unauthorized,
            -403 => BusinessCode::AccessDenied,
            -404 => BusinessCode::NothingFound,
            -405 => BusinessCode::MethodNotAllowed,
            -498 => BusinessCode::Canceled,
            -500 => BusinessCode::ServerErr,
            -503 => BusinessCode::ServiceUnavailable,
            -504 => BusinessCode::Deadline,
            -509 => BusinessCode::LimitExceed,
            other => BusinessCode::Other(other),
        }
    }

    /// Parse a literal decimal integer, e.g. `"-404"`.
    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse::<i32>().ok().map(Self::from_code)
    }
}

impl fmt::Display for BusinessCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl From<i32> for BusinessCode {
    fn from(code: i32) -> Self {
        Self::from_code(code)
    }
}

/// A business status: code, human readable message and typed details.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Status {
    code: BusinessCode,
    message: String,
    details: Vec<Any>,
}

impl Status {
    /// Status with the decimal code as its message.
    pub fn new(code: BusinessCode) -> Self {
        Self {
            code,
            message: code.to_string(),
            details: Vec::new(),
        }
    }

    pub fn with_message(code: BusinessCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Attach an encoded detail payload.
    pub fn with_detail(mut self, detail: Any) -> Self {
        self.details.push(detail);
        self
    }

    /// Attach a typed protobuf message as a detail.
    pub fn with_message_detail<M: prost::Name>(self, message: &M) -> Result<Self, prost::EncodeError> {
        Ok(self.with_detail(Any::from_msg(message)?))
    }

    pub fn code(&self) -> BusinessCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &[Any] {
        &self.details
    }

    pub(crate) fn from_parts(code: BusinessCode, message: String, details: Vec<Any>) -> Self {
        Self {
            code,
            message,
            details,
        }
    }
}

impl From<BusinessCode> for Status {
    fn from(code: BusinessCode) -> Self {
        Status::new(code)
    }
}
