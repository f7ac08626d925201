//! Error taxonomy and response-status-code mapping
//!
//! Every Dispatcher entry point returns a typed [`Error`]. At the request
//! boundary an [`Error`] is turned into a numeric [`ResponseStatusCode`] (the
//! oneM2M `rsc`) via [`ErrorResponse`], mirroring how `cdk_common::error`
//! turns an `Error` into an `ErrorResponse { code, detail }`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// oneM2M response status code domain (TS-0004 style grouping: success,
/// client error, server error, access-control).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ResponseStatusCode {
    /// Generic success (RETRIEVE, UPDATE without a more specific code)
    Ok = 2000,
    /// CREATE succeeded
    Created = 2001,
    /// DELETE succeeded
    Deleted = 2002,
    /// UPDATE succeeded
    Updated = 2004,
    /// Malformed or semantically invalid request
    BadRequest = 4000,
    /// Target resource does not exist
    NotFound = 4004,
    /// Operation is not allowed on this resource in its current state
    OperationNotAllowed = 4005,
    /// Attribute values violate the type's attribute policy
    ContentsUnacceptable = 4102,
    /// Originator lacks the required permission
    OriginatorHasNoPrivilege = 4103,
    /// A `<request>` in FORWARDED state cannot be recalled
    UnableToRecallRequest = 4107,
    /// A resource with this name/id already exists
    AlreadyExists = 4105,
    /// CREATE targets a type not allowed under the parent
    InvalidChildResourceType = 4108,
    /// State conflict other than a naming collision
    Conflict = 4109,
    /// A new notification target failed its verification handshake
    SubscriptionVerificationInitiationFailed = 4300,
    /// Outbound request to a target timed out or connection failed
    TargetNotReachable = 5103,
    /// Outbound request to a remote CSE/AE timed out or connection failed
    RemoteEntityNotReachable = 5106,
    /// The remote entity explicitly rejected the operation
    OperationDeniedByRemoteEntity = 5105,
    /// Unclassified internal failure
    InternalServerError = 5000,
    /// The Store and the Identifier table disagree about a resource
    DatabaseInconsistency = 5001,
}

impl ResponseStatusCode {
    /// Numeric code as carried on the wire in `rsc`.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether this code represents a successful operation.
    pub fn is_success(self) -> bool {
        self.code() < 4000
    }
}

impl std::fmt::Display for ResponseStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Response envelope error payload, analogous to `cdk_common::error::ErrorResponse`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Numeric response status code
    pub rsc: ResponseStatusCode,
    /// Human-readable detail for logs/diagnostics; never sent verbatim to
    /// untrusted originators beyond what the transport layer chooses to relay
    pub detail: String,
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.rsc, self.detail)
    }
}

impl From<Error> for ErrorResponse {
    fn from(err: Error) -> Self {
        let rsc = err.response_status_code();
        ErrorResponse {
            rsc,
            detail: err.to_string(),
        }
    }
}

/// CSE-wide error type. Propagated as a value from every fallible operation;
/// the core never panics on request-shaped input.
#[derive(Debug, Error)]
pub enum Error {
    /// Target resource could not be resolved
    #[error("resource not found: {0}")]
    NotFound(String),
    /// A resource with this `rn`/`srn` already exists under the parent
    #[error("resource already exists: {0}")]
    AlreadyExists(String),
    /// Originator lacks the permission requested
    #[error("originator `{0}` has no privilege for this operation")]
    OriginatorHasNoPrivilege(String),
    /// A newly referenced notification target failed verification
    #[error("subscription verification failed for target `{0}`")]
    SubscriptionVerificationInitiationFailed(String),
    /// Malformed request payload or parameters
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Attribute policy violation
    #[error("contents unacceptable: {0}")]
    ContentsUnacceptable(String),
    /// CREATE targets a type the parent does not allow as a child
    #[error("invalid child resource type: {0:?} not allowed under {1:?}")]
    InvalidChildResourceType(String, String),
    /// Operation refused given the resource's current state
    #[error("operation not allowed: {0}")]
    OperationNotAllowed(String),
    /// `<request>` in FORWARDED state cannot be deleted
    #[error("request `{0}` cannot be recalled while FORWARDED")]
    UnableToRecallRequest(String),
    /// Generic state conflict
    #[error("conflict: {0}")]
    Conflict(String),
    /// An outbound call to a target timed out or failed to connect
    #[error("target not reachable: {0}")]
    TargetNotReachable(String),
    /// An outbound call to a remote CSE/AE timed out or failed to connect
    #[error("remote entity not reachable: {0}")]
    RemoteEntityNotReachable(String),
    /// The remote entity rejected the operation explicitly
    #[error("operation denied by remote entity: {0}")]
    OperationDeniedByRemoteEntity(String),
    /// The Store reported an error that the caller cannot recover from
    #[error("internal storage error: {0}")]
    Storage(String),
    /// The Resource and Identifier tables disagree
    #[error("database inconsistency: {0}")]
    DatabaseInconsistency(String),
    /// Anything else unclassified
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to the numeric response status code carried on the wire.
    pub fn response_status_code(&self) -> ResponseStatusCode {
        use Error::*;
        match self {
            NotFound(_) => ResponseStatusCode::NotFound,
            AlreadyExists(_) => ResponseStatusCode::AlreadyExists,
            OriginatorHasNoPrivilege(_) => ResponseStatusCode::OriginatorHasNoPrivilege,
            SubscriptionVerificationInitiationFailed(_) => {
                ResponseStatusCode::SubscriptionVerificationInitiationFailed
            }
            BadRequest(_) => ResponseStatusCode::BadRequest,
            ContentsUnacceptable(_) => ResponseStatusCode::ContentsUnacceptable,
            InvalidChildResourceType(_, _) => ResponseStatusCode::InvalidChildResourceType,
            OperationNotAllowed(_) => ResponseStatusCode::OperationNotAllowed,
            UnableToRecallRequest(_) => ResponseStatusCode::UnableToRecallRequest,
            Conflict(_) => ResponseStatusCode::Conflict,
            TargetNotReachable(_) => ResponseStatusCode::TargetNotReachable,
            RemoteEntityNotReachable(_) => ResponseStatusCode::RemoteEntityNotReachable,
            OperationDeniedByRemoteEntity(_) => ResponseStatusCode::OperationDeniedByRemoteEntity,
            DatabaseInconsistency(_) => ResponseStatusCode::DatabaseInconsistency,
            Storage(_) | Internal(_) => ResponseStatusCode::InternalServerError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_maps_to_2001_literally() {
        assert_eq!(ResponseStatusCode::Created.code(), 2001);
    }

    #[test]
    fn no_privilege_maps_to_4103_literally() {
        assert_eq!(ResponseStatusCode::OriginatorHasNoPrivilege.code(), 4103);
        let err = Error::OriginatorHasNoPrivilege("CotherAE".into());
        assert_eq!(
            err.response_status_code(),
            ResponseStatusCode::OriginatorHasNoPrivilege
        );
    }

    #[test]
    fn error_response_carries_detail() {
        let resp: ErrorResponse = Error::NotFound("/cse-in/ae1".into()).into();
        assert_eq!(resp.rsc, ResponseStatusCode::NotFound);
        assert!(resp.detail.contains("/cse-in/ae1"));
    }
}
