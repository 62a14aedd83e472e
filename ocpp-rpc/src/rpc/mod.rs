//! OCPP RPC wire layer
//!
//! - `types`: node ids, correlation ids, source routing and network path
//! - `messages`: CALL / CALLRESULT / CALLERROR framing
//! - `frame`: routed frames carrying networking-node headers
//! - `outcome`: result taxonomy and typed responses

pub mod types;
pub mod messages;
pub mod frame;
pub mod outcome;

pub use types::*;
pub use messages::*;
pub use frame::{Frame, RoutingHeader};
pub use outcome::{ErrorCode, Outcome, Response};
