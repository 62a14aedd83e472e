//! Incoming CALL dispatch
//!
//! Handlers are looked up by action name. Whatever a handler does, the
//! dispatcher answers with exactly one CALLRESULT or CALLERROR:
//!
//! | Handler behaviour | Reply |
//! |---|---|
//! | no handler for the action | CALLERROR `NotImplemented` |
//! | `Ok(payload)` | CALLRESULT |
//! | `HandlerError::InvalidPayload` | CALLERROR `FormatViolation` |
//! | `HandlerError::Rejected` | CALLERROR with the handler's code |
//! | `HandlerError::Internal` or panic | CALLERROR `InternalError`, redacted |

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::actions::OcppRequest;
use crate::rpc::messages::{Call, CallError, CallResult, OcppMessage};
use crate::rpc::outcome::{ErrorCode, Outcome};
use crate::rpc::types::{NetworkPath, NodeId, RequestId};

/// What a handler knows about the CALL it is answering
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub action: String,
    /// Original sender (first network path entry)
    pub from: NodeId,
    /// Hops the CALL traversed before reaching this node
    pub network_path: NetworkPath,
}

/// Handler failure
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid {action} payload: {reason}")]
    InvalidPayload { action: String, reason: String },

    #[error("Rejected with {code}: {description}")]
    Rejected {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("Handler failed: {0}")]
    Internal(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn rejected(code: ErrorCode, description: impl Into<String>) -> Self {
        HandlerError::Rejected {
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn internal(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        HandlerError::Internal(Box::new(e))
    }

    /// Outcome reported to the caller; internal detail is logged, not sent
    fn into_outcome(self, action: &str) -> Outcome {
        match self {
            HandlerError::InvalidPayload { action, reason } => Outcome::FormationViolation {
                description: format!("Invalid {} payload: {}", action, reason),
            },
            HandlerError::Rejected {
                code,
                description,
                details,
            } => Outcome::Remote {
                code,
                description,
                details,
            },
            HandlerError::Internal(e) => {
                error!("Handler for {} failed: {}", action, e);
                redacted(action)
            }
        }
    }
}

fn redacted(action: &str) -> Outcome {
    Outcome::InternalError {
        description: format!("Internal error while handling {}", action),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Handler for one action
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &RequestContext, payload: Value) -> Result<Value, HandlerError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RequestContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, ctx: &RequestContext, payload: Value) -> Result<Value, HandlerError> {
        (self.f)(ctx.clone(), payload).await
    }
}

/// Action name → handler table
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning the one it replaces
    pub fn register(
        &self,
        action: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Option<Arc<dyn Handler>> {
        let action = action.into();
        debug!("Registered handler for {}", action);
        self.handlers.write().insert(action, handler)
    }

    /// Register an async closure over raw payloads
    pub fn register_fn<F, Fut>(&self, action: impl Into<String>, f: F)
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(action, Arc::new(FnHandler { f }));
    }

    /// Register an async closure over the typed request of `R`
    ///
    /// Payloads that do not parse as `R` are answered with FormatViolation
    /// without calling `f`.
    pub fn register_typed<R, F, Fut>(&self, f: F)
    where
        R: OcppRequest + DeserializeOwned + 'static,
        R::Response: Serialize,
        F: Fn(RequestContext, R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Response, HandlerError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register_fn(R::ACTION, move |ctx, payload| {
            let f = Arc::clone(&f);
            async move {
                let request: R =
                    serde_json::from_value(payload).map_err(|e| HandlerError::InvalidPayload {
                        action: R::ACTION.to_string(),
                        reason: e.to_string(),
                    })?;
                let response = f(ctx, request).await?;
                serde_json::to_value(response).map_err(HandlerError::internal)
            }
        });
    }

    pub fn unregister(&self, action: &str) -> bool {
        self.handlers.write().remove(action).is_some()
    }

    pub fn handles(&self, action: &str) -> bool {
        self.handlers.read().contains_key(action)
    }

    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.read().keys().cloned().collect();
        actions.sort();
        actions
    }

    /// Run the handler for `ctx.action`
    ///
    /// Never panics and never returns an error outside the taxonomy.
    pub async fn dispatch(&self, ctx: &RequestContext, payload: Value) -> Result<Value, Outcome> {
        let handler = self.handlers.read().get(&ctx.action).cloned();
        let Some(handler) = handler else {
            warn!("No handler for {} ({})", ctx.action, ctx.request_id);
            return Err(Outcome::NotImplemented {
                action: ctx.action.clone(),
            });
        };

        match AssertUnwindSafe(handler.handle(ctx, payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(payload)) if payload.is_object() => Ok(payload),
            Ok(Ok(other)) => {
                error!("Handler for {} returned a non-object payload: {}", ctx.action, other);
                Err(redacted(&ctx.action))
            }
            Ok(Err(e)) => Err(e.into_outcome(&ctx.action)),
            Err(panic) => {
                error!(
                    "Handler for {} panicked: {}",
                    ctx.action,
                    panic_message(panic.as_ref())
                );
                Err(redacted(&ctx.action))
            }
        }
    }

    /// Answer a CALL with a CALLRESULT or CALLERROR carrying its id
    pub async fn dispatch_call(&self, ctx: &RequestContext, call: Call) -> OcppMessage {
        let id = call.message_id;
        let outcome = match self.dispatch(ctx, call.payload).await {
            Ok(payload) => match CallResult::new(id.clone(), payload) {
                Ok(result) => return result.into(),
                Err(e) => Outcome::from(e),
            },
            Err(outcome) => outcome,
        };

        outcome
            .to_call_error(id.clone())
            .unwrap_or_else(|| {
                CallError::new(id, ErrorCode::InternalError, "Handler produced no response")
            })
            .into()
    }
}
