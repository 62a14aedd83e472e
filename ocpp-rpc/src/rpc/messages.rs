//! OCPP JSON-RPC message framing
//!
//! OCPP frames every message as a JSON array:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Decoding checks the full structure and never yields a partial message.

use serde_json::{json, Map, Value};
use thiserror::Error;

use super::outcome::ErrorCode;
use super::types::RequestId;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    /// Number of array elements for this message type
    pub fn arity(self) -> usize {
        match self {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Structural errors in an OCPP frame
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message is not a JSON array")]
    NotAnArray,

    #[error("Message type is missing or not an integer")]
    InvalidMessageType,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("{kind} needs {expected} elements, got {actual}")]
    Arity {
        kind: MessageType,
        expected: usize,
        actual: usize,
    },

    #[error("Message id must be a string of 1 to 36 characters")]
    InvalidMessageId,

    #[error("Action must be a non-empty string")]
    InvalidAction,

    #[error("{0} must be a JSON object")]
    NotAnObject(&'static str),

    #[error("Error code must be a string")]
    InvalidErrorCode,

    #[error("Error description must be a string")]
    InvalidErrorDescription,

    #[error("Invalid routing header: {0}")]
    InvalidRoutingHeader(String),
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: RequestId,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a CALL, rejecting an empty action or a non-object payload
    pub fn new(
        message_id: RequestId,
        action: impl Into<String>,
        payload: Value,
    ) -> Result<Self, EnvelopeError> {
        let action = action.into();
        if action.is_empty() {
            return Err(EnvelopeError::InvalidAction);
        }
        if !message_id.is_well_formed() {
            return Err(EnvelopeError::InvalidMessageId);
        }
        if !payload.is_object() {
            return Err(EnvelopeError::NotAnObject("Payload"));
        }

        Ok(Self {
            message_id,
            action,
            payload,
        })
    }

    /// Wire form: [2, messageId, action, payload]
    pub fn to_value(&self) -> Value {
        json!([
            MessageType::Call as i32,
            &self.message_id,
            &self.action,
            &self.payload
        ])
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: RequestId,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: RequestId, payload: Value) -> Result<Self, EnvelopeError> {
        if !payload.is_object() {
            return Err(EnvelopeError::NotAnObject("Payload"));
        }
        Ok(Self {
            message_id,
            payload,
        })
    }

    /// Wire form: [3, messageId, payload]
    pub fn to_value(&self) -> Value {
        json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ])
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: RequestId,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a CALLERROR with empty details
    pub fn new(
        message_id: RequestId,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }

    /// Wire form: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_value(&self) -> Value {
        json!([
            MessageType::CallError as i32,
            &self.message_id,
            self.error_code.as_str(),
            &self.error_description,
            &self.error_details
        ])
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Decode an already parsed JSON array
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let array = match value {
            Value::Array(array) => array,
            _ => return Err(EnvelopeError::NotAnArray),
        };

        let tag = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(EnvelopeError::InvalidMessageType)?;
        let kind = MessageType::from_tag(tag).ok_or(EnvelopeError::UnknownMessageType(tag))?;

        if array.len() != kind.arity() {
            return Err(EnvelopeError::Arity {
                kind,
                expected: kind.arity(),
                actual: array.len(),
            });
        }

        let mut fields = array.into_iter().skip(1);
        let message_id = message_id(fields.next())?;

        match kind {
            MessageType::Call => {
                let action = match fields.next() {
                    Some(Value::String(action)) if !action.is_empty() => action,
                    _ => return Err(EnvelopeError::InvalidAction),
                };
                let payload = object(fields.next(), "Payload")?;

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload,
                }))
            }
            MessageType::CallResult => {
                let payload = object(fields.next(), "Payload")?;

                Ok(OcppMessage::CallResult(CallResult {
                    message_id,
                    payload,
                }))
            }
            MessageType::CallError => {
                let error_code = match fields.next() {
                    Some(Value::String(code)) => ErrorCode::from(code.as_str()),
                    _ => return Err(EnvelopeError::InvalidErrorCode),
                };
                let error_description = match fields.next() {
                    Some(Value::String(description)) => description,
                    _ => return Err(EnvelopeError::InvalidErrorDescription),
                };
                let error_details = object(fields.next(), "Error details")?;

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details,
                }))
            }
        }
    }

    /// Message id of a CALL that failed full decoding, if it can still be read
    ///
    /// Lets the receiver answer a malformed CALL with a FormatViolation
    /// CALLERROR instead of leaving the sender waiting.
    pub fn recover_call_id(value: &Value) -> Option<RequestId> {
        let array = value.as_array()?;
        if array.first()?.as_i64()? != MessageType::Call as i64 {
            return None;
        }
        let id = RequestId::new(array.get(1)?.as_str()?);
        id.is_well_formed().then_some(id)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &RequestId {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            OcppMessage::Call(c) => c.to_value(),
            OcppMessage::CallResult(r) => r.to_value(),
            OcppMessage::CallError(e) => e.to_value(),
        }
    }

    /// Serialize to the compact JSON text sent on the wire
    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

impl From<Call> for OcppMessage {
    fn from(call: Call) -> Self {
        OcppMessage::Call(call)
    }
}

impl From<CallResult> for OcppMessage {
    fn from(result: CallResult) -> Self {
        OcppMessage::CallResult(result)
    }
}

impl From<CallError> for OcppMessage {
    fn from(error: CallError) -> Self {
        OcppMessage::CallError(error)
    }
}

fn message_id(value: Option<Value>) -> Result<RequestId, EnvelopeError> {
    match value {
        Some(Value::String(id)) => {
            let id = RequestId::new(id);
            if id.is_well_formed() {
                Ok(id)
            } else {
                Err(EnvelopeError::InvalidMessageId)
            }
        }
        _ => Err(EnvelopeError::InvalidMessageId),
    }
}

fn object(value: Option<Value>, what: &'static str) -> Result<Value, EnvelopeError> {
    match value {
        Some(value @ Value::Object(_)) => Ok(value),
        _ => Err(EnvelopeError::NotAnObject(what)),
    }
}
