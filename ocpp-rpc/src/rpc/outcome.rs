//! Result taxonomy shared by every response
//!
//! Every response handed back to a caller carries exactly one [`Outcome`],
//! whatever went wrong on the way. [`ErrorCode`] is the OCPP RPC framework
//! error vocabulary used in CALLERROR frames.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use super::messages::{CallError, EnvelopeError};
use super::types::RequestId;
use crate::routing::RoutingError;
use crate::security::SignatureError;

/// OCPP RPC framework error codes
///
/// Known codes use the exact casing of the protocol; anything else a remote
/// sends is kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "FormatViolation" => ErrorCode::FormatViolation,
            "GenericError" => ErrorCode::GenericError,
            "InternalError" => ErrorCode::InternalError,
            "MessageTypeNotSupported" => ErrorCode::MessageTypeNotSupported,
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "OccurrenceConstraintViolation" => ErrorCode::OccurrenceConstraintViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "ProtocolError" => ErrorCode::ProtocolError,
            "RpcFrameworkError" => ErrorCode::RpcFrameworkError,
            "SecurityError" => ErrorCode::SecurityError,
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            other => ErrorCode::Other(other.to_string()),
        })
    }
}

impl From<&str> for ErrorCode {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(code) => code,
            Err(never) => match never {},
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ErrorCode::from(s.as_str()))
    }
}

/// Outcome of a request, as seen by the caller or produced by a handler
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    /// Malformed frame or payload
    FormationViolation { description: String },
    /// Signing or signature verification failed
    SignatureError { description: String },
    /// No response before the deadline, or the caller cancelled
    Timeout { after: Duration },
    /// Routing or transport failure, including connection loss
    NetworkError { description: String },
    /// No handler for the action
    NotImplemented { action: String },
    /// Handler fault; the description is already redacted
    InternalError { description: String },
    /// Error code reported by the remote end in a CALLERROR
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Stable name of the variant, used in logs and events
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success => "Success",
            Outcome::FormationViolation { .. } => "FormationViolation",
            Outcome::SignatureError { .. } => "SignatureError",
            Outcome::Timeout { .. } => "Timeout",
            Outcome::NetworkError { .. } => "NetworkError",
            Outcome::NotImplemented { .. } => "NotImplemented",
            Outcome::InternalError { .. } => "InternalError",
            Outcome::Remote { .. } => "RemoteError",
        }
    }

    /// CALLERROR code this outcome is reported with, `None` for success
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Outcome::Success => None,
            Outcome::FormationViolation { .. } => Some(ErrorCode::FormatViolation),
            Outcome::SignatureError { .. } => Some(ErrorCode::SecurityError),
            Outcome::Timeout { .. } | Outcome::NetworkError { .. } => Some(ErrorCode::GenericError),
            Outcome::NotImplemented { .. } => Some(ErrorCode::NotImplemented),
            Outcome::InternalError { .. } => Some(ErrorCode::InternalError),
            Outcome::Remote { code, .. } => Some(code.clone()),
        }
    }

    pub fn description(&self) -> String {
        match self {
            Outcome::Success => String::new(),
            Outcome::FormationViolation { description }
            | Outcome::SignatureError { description }
            | Outcome::NetworkError { description }
            | Outcome::InternalError { description }
            | Outcome::Remote { description, .. } => description.clone(),
            Outcome::Timeout { after } => format!("No response within {:?}", after),
            Outcome::NotImplemented { action } => format!("Unknown action: {}", action),
        }
    }

    pub fn details(&self) -> Value {
        match self {
            Outcome::Remote { details, .. } => details.clone(),
            Outcome::Success => Value::Null,
            other => json!({ "result": other.kind() }),
        }
    }

    /// CALLERROR answering `message_id`, `None` for success
    pub fn to_call_error(&self, message_id: RequestId) -> Option<CallError> {
        let code = self.error_code()?;
        Some(CallError {
            message_id,
            error_code: code,
            error_description: self.description(),
            error_details: self.details(),
        })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("Success"),
            Outcome::Remote {
                code, description, ..
            } => write!(f, "RemoteError({}): {}", code, description),
            other => write!(f, "{}: {}", other.kind(), other.description()),
        }
    }
}

impl From<&CallError> for Outcome {
    fn from(error: &CallError) -> Self {
        // A node on the way could not route or queue the call
        let relayed = error.error_details.get("result").and_then(Value::as_str);
        if error.error_code == ErrorCode::GenericError && relayed == Some("NetworkError") {
            return Outcome::NetworkError {
                description: error.error_description.clone(),
            };
        }

        Outcome::Remote {
            code: error.error_code.clone(),
            description: error.error_description.clone(),
            details: error.error_details.clone(),
        }
    }
}

impl From<EnvelopeError> for Outcome {
    fn from(e: EnvelopeError) -> Self {
        Outcome::FormationViolation {
            description: e.to_string(),
        }
    }
}

impl From<SignatureError> for Outcome {
    fn from(e: SignatureError) -> Self {
        Outcome::SignatureError {
            description: e.to_string(),
        }
    }
}

impl From<RoutingError> for Outcome {
    fn from(e: RoutingError) -> Self {
        Outcome::NetworkError {
            description: e.to_string(),
        }
    }
}

/// Typed response to an outgoing call
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub request_id: RequestId,
    pub outcome: Outcome,
    /// Present if and only if the outcome is `Success`
    pub message: Option<T>,
    pub runtime: Duration,
}

impl<T> Response<T> {
    pub fn success(request_id: RequestId, message: T, runtime: Duration) -> Self {
        Self {
            request_id,
            outcome: Outcome::Success,
            message: Some(message),
            runtime,
        }
    }

    pub fn failed(request_id: RequestId, outcome: Outcome, runtime: Duration) -> Self {
        debug_assert!(!outcome.is_success());
        Self {
            request_id,
            outcome,
            message: None,
            runtime,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Convert the message, downgrading a conversion failure to FormationViolation
    pub fn try_map<U, E, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> Result<U, E>,
        E: fmt::Display,
    {
        let Response {
            request_id,
            outcome,
            message,
            runtime,
        } = self;

        match message {
            Some(message) => match f(message) {
                Ok(converted) => Response::success(request_id, converted, runtime),
                Err(e) => Response::failed(
                    request_id,
                    Outcome::FormationViolation {
                        description: format!("Invalid response payload: {}", e),
                    },
                    runtime,
                ),
            },
            None => Response {
                request_id,
                outcome,
                message: None,
                runtime,
            },
        }
    }

    pub fn into_result(self) -> Result<T, Outcome> {
        match (self.outcome, self.message) {
            (Outcome::Success, Some(message)) => Ok(message),
            (Outcome::Success, None) => Err(Outcome::InternalError {
                description: "Successful response without a message".to_string(),
            }),
            (outcome, _) => Err(outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_casing_and_passthrough() {
        assert_eq!(ErrorCode::from("FormatViolation"), ErrorCode::FormatViolation);
        assert_eq!(ErrorCode::SecurityError.to_string(), "SecurityError");

        let custom = ErrorCode::from("VendorSpecific");
        assert_eq!(custom, ErrorCode::Other("VendorSpecific".to_string()));
        assert_eq!(
            serde_json::to_string(&custom).unwrap(),
            r#""VendorSpecific""#
        );

        let parsed: ErrorCode = serde_json::from_str(r#""NotImplemented""#).unwrap();
        assert_eq!(parsed, ErrorCode::NotImplemented);
    }

    #[test]
    fn test_outcome_error_codes() {
        let cases = [
            (
                Outcome::FormationViolation { description: "x".into() },
                ErrorCode::FormatViolation,
            ),
            (
                Outcome::SignatureError { description: "x".into() },
                ErrorCode::SecurityError,
            ),
            (
                Outcome::NotImplemented { action: "Foo".into() },
                ErrorCode::NotImplemented,
            ),
            (
                Outcome::InternalError { description: "x".into() },
                ErrorCode::InternalError,
            ),
            (
                Outcome::NetworkError { description: "x".into() },
                ErrorCode::GenericError,
            ),
        ];

        for (outcome, code) in cases {
            assert_eq!(outcome.error_code(), Some(code));
        }
        assert_eq!(Outcome::Success.error_code(), None);
    }

    #[test]
    fn test_call_error_from_outcome() {
        let outcome = Outcome::NotImplemented {
            action: "FooBar".into(),
        };
        let error = outcome.to_call_error(RequestId::new("msg-1")).unwrap();

        assert_eq!(error.message_id.as_str(), "msg-1");
        assert_eq!(error.error_code, ErrorCode::NotImplemented);
        assert_eq!(error.error_description, "Unknown action: FooBar");
        assert_eq!(error.error_details, json!({ "result": "NotImplemented" }));

        assert!(Outcome::Success.to_call_error(RequestId::new("msg-1")).is_none());
    }

    #[test]
    fn test_remote_outcome_is_verbatim() {
        let error = CallError {
            message_id: RequestId::new("msg-2"),
            error_code: ErrorCode::Other("Busy".into()),
            error_description: "try later".into(),
            error_details: json!({ "retryIn": 5 }),
        };
        let outcome = Outcome::from(&error);
        assert_eq!(outcome.to_string(), "RemoteError(Busy): try later");

        let echoed = outcome.to_call_error(RequestId::new("msg-2")).unwrap();
        assert_eq!(echoed, error);
    }

    #[test]
    fn test_relayed_network_error_is_restored() {
        let unreachable = Outcome::NetworkError {
            description: "Unreachable: no connection towards Z".into(),
        };
        let relayed = unreachable.to_call_error(RequestId::new("msg-3")).unwrap();
        assert_eq!(relayed.error_code, ErrorCode::GenericError);
        assert_eq!(Outcome::from(&relayed), unreachable);

        // Same code without the marker stays a remote error
        let generic = CallError {
            message_id: RequestId::new("msg-4"),
            error_code: ErrorCode::GenericError,
            error_description: "busy".into(),
            error_details: json!({}),
        };
        assert_eq!(Outcome::from(&generic).kind(), "RemoteError");
    }

    #[test]
    fn test_response_try_map() {
        let ok: Response<i32> = Response::success(RequestId::new("a"), 4, Duration::ZERO);
        let mapped = ok.try_map(|n| if n > 0 { Ok(n * 2) } else { Err("negative") });
        assert_eq!(mapped.into_result().unwrap(), 8);

        let bad: Response<i32> = Response::success(RequestId::new("b"), -1, Duration::ZERO);
        let mapped = bad.try_map(|n| if n > 0 { Ok(n) } else { Err("negative") });
        assert_eq!(mapped.outcome.kind(), "FormationViolation");
        assert!(mapped.message.is_none());
    }
}
