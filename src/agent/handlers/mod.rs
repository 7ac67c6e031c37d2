//! Request handlers, grouped by concern.

pub mod devices;
pub mod host;
pub mod migrate;
pub mod vm;

use crate::error::Error;
use hostagent_protocol::RequestKind;

/// Error for a request routed to the wrong handler.
fn unexpected(kind: RequestKind) -> Error {
    Error::invalid_request(format!("handler cannot process {} requests", kind))
}
