//! Translation between the business [`Status`] and `tonic::Status`.
//!
//! Reverse table used for statuses without an embedded business payload:
//!
//! | wire code | business code |
//! |-----------|---------------|
//! | `OK` | `Ok` |
//! | `INVALID_ARGUMENT` | `RequestErr` |
//! | `NOT_FOUND` | `NothingFound` |
//! | `UNAUTHENTICATED` | `Unauthorized` |
//! | `PERMISSION_DENIED` | `AccessDenied` |
//! | `RESOURCE_EXHAUSTED` | `LimitExceed` |
//! | `UNIMPLEMENTED` | `MethodNotAllowed` |
//! | `DEADLINE_EXCEEDED` | `Deadline` |
//! | `UNAVAILABLE` | `ServiceUnavailable` |
//! | `UNKNOWN` | decimal message, else `ServerErr` |
//! | anything else | `ServerErr` |
//!
//! Outbound statuses always use `UNKNOWN` with the decimal business code as
//! message; the full status travels in the details payload.

use bytes::Bytes;
use prost::Message;
use prost_types::Any;
use tonic::Code;

use super::proto::{BUSINESS_STATUS_TYPE_URL, BusinessStatus, RpcStatus};
use super::status::{BusinessCode, Status};

/// Error flowing through the interceptor chain.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// A business status produced by a handler or an interceptor.
    #[error(transparent)]
    Status(#[from] Status),

    /// Raw failure reported by the transport, not yet translated.
    #[error("transport error: {0}")]
    Transport(tonic::Status),

    /// The caller's cancellation token fired before the call completed.
    #[error("call canceled")]
    Canceled,

    /// The call deadline elapsed locally.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl CallError {
    /// Business code this error resolves to.
    pub fn code(&self) -> BusinessCode {
        match self {
            CallError::Status(status) => status.code(),
            CallError::Transport(status) => from_wire(status).code(),
            CallError::Canceled => BusinessCode::Canceled,
            CallError::DeadlineExceeded => BusinessCode::Deadline,
        }
    }
}

impl From<tonic::Status> for CallError {
    fn from(status: tonic::Status) -> Self {
        CallError::Transport(status)
    }
}

/// Extension trait for converting types into `tonic::Status`.
pub trait IntoStatus {
    /// Convert into a `tonic::Status`.
    fn into_status(self) -> tonic::Status;
}

impl IntoStatus for Status {
    fn into_status(self) -> tonic::Status {
        to_wire(&self)
    }
}

impl IntoStatus for CallError {
    fn into_status(self) -> tonic::Status {
        from_error(self)
    }
}

impl From<Status> for tonic::Status {
    fn from(status: Status) -> Self {
        status.into_status()
    }
}

impl From<tonic::Status> for Status {
    fn from(status: tonic::Status) -> Self {
        from_wire(&status)
    }
}

/// Natural wire code of a business code.
///
/// Only used for the reverse direction and for diagnostics: outbound statuses
/// are always sent as `UNKNOWN`.
pub fn wire_code_of(code: BusinessCode) -> Code {
    match code {
        BusinessCode::Ok => Code::Ok,
        BusinessCode::RequestErr => Code::InvalidArgument,
        BusinessCode::NothingFound => Code::NotFound,
        BusinessCode::Unauthorized => Code::Unauthenticated,
        BusinessCode::AccessDenied => Code::PermissionDenied,
        BusinessCode::LimitExceed => Code::ResourceExhausted,
        BusinessCode::MethodNotAllowed => Code::Unimplemented,
        BusinessCode::Deadline => Code::DeadlineExceeded,
        BusinessCode::ServiceUnavailable => Code::Unavailable,
        _ => Code::Unknown,
    }
}

/// Table lookup for a wire status that carries no business payload.
pub fn business_code_of(status: &tonic::Status) -> BusinessCode {
    match status.code() {
        Code::Ok => BusinessCode::Ok,
        Code::InvalidArgument => BusinessCode::RequestErr,
        Code::NotFound => BusinessCode::NothingFound,
        Code::Unauthenticated => BusinessCode::Unauthorized,
        Code::PermissionDenied => BusinessCode::AccessDenied,
        Code::ResourceExhausted => BusinessCode::LimitExceed,
        Code::Unimplemented => BusinessCode::MethodNotAllowed,
        Code::DeadlineExceeded => BusinessCode::Deadline,
        Code::Unavailable => BusinessCode::ServiceUnavailable,
        Code::Unknown => BusinessCode::parse(status.message()).unwrap_or(BusinessCode::ServerErr),
        _ => BusinessCode::ServerErr,
    }
}

/// Encode a business status for the wire.
pub fn to_wire(status: &Status) -> tonic::Status {
    let code = status.code();
    let embedded = BusinessStatus {
        code: code.code(),
        message: status.message().to_string(),
        details: status.details().to_vec(),
    };
    let envelope = RpcStatus {
        code: Code::Unknown as i32,
        message: code.to_string(),
        details: vec![Any {
            type_url: BUSINESS_STATUS_TYPE_URL.to_string(),
            value: embedded.encode_to_vec(),
        }],
    };
    tonic::Status::with_details(
        Code::Unknown,
        code.to_string(),
        Bytes::from(envelope.encode_to_vec()),
    )
}

/// Decode a wire status into a business status.
///
/// The embedded payload wins when present and well formed; otherwise the
/// reverse table applies and the wire message is kept.
pub fn from_wire(status: &tonic::Status) -> Status {
    if let Some(embedded) = decode_embedded(status.details()) {
        return Status::from_parts(
            BusinessCode::from_code(embedded.code),
            embedded.message,
            embedded.details,
        );
    }
    Status::with_message(business_code_of(status), status.message())
}

fn decode_embedded(details: &[u8]) -> Option<BusinessStatus> {
    if details.is_empty() {
        return None;
    }
    let envelope = match RpcStatus::decode(details) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::debug!(error = %err, "Malformed status details, using wire code");
            return None;
        }
    };
    envelope
        .details
        .iter()
        .filter(|any| any.type_url == BUSINESS_STATUS_TYPE_URL)
        .find_map(|any| BusinessStatus::decode(any.value.as_slice()).ok())
}

/// Resolve any chain error into a business status.
pub fn from_call_error(err: CallError) -> Status {
    match err {
        CallError::Status(status) => status,
        CallError::Transport(status) => from_wire(&status),
        CallError::Canceled => Status::new(BusinessCode::Canceled),
        CallError::DeadlineExceeded => Status::new(BusinessCode::Deadline),
    }
}

/// Convert a chain error into the status a server replies with.
///
/// Local cancellation and deadline signals map to their dedicated business
/// codes without consulting the wire table.
pub fn from_error(err: CallError) -> tonic::Status {
    to_wire(&from_call_error(err))
}
