//! Collaborator traits the engine drives but does not implement.
//!
//! The core defines the contracts it needs from the outside world: a
//! [`Transport`] that exchanges a request descriptor for raw bytes, a
//! [`Mapper`] that turns raw bytes into a structured value, and a per-request
//! [`ResponseHandler`] that validates and postprocesses the mapped value.
//! Wire formats, parsing details, and authentication protocols live entirely
//! behind these traits.

use crate::error::{Error, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

/// Everything a transport needs to issue one call.
///
/// The descriptor is built from the request's session context and parameters
/// at execution time; it is the unit the response cache keys on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// Service endpoint URL.
    pub endpoint_url: String,
    /// Authentication token from the session context, if any.
    pub auth_token: Option<String>,
    /// Call parameters, canonically ordered.
    pub parameters: BTreeMap<String, String>,
}

impl RequestDescriptor {
    /// Cache key for this descriptor: endpoint plus canonically ordered
    /// parameters. The auth token is deliberately excluded so a token refresh
    /// does not invalidate cached responses.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut signature = self.endpoint_url.clone();
        signature.push('?');
        for (i, (key, value)) in self.parameters.iter().enumerate() {
            if i > 0 {
                signature.push('&');
            }
            signature.push_str(key);
            signature.push('=');
            signature.push_str(value);
        }
        signature
    }
}

/// Exchanges a request descriptor for raw response bytes.
///
/// Implementations decide how calls are actually made (HTTP, or an
/// in-memory mock). A transport call is the only blocking point in a
/// request's lifecycle;
/// timeouts are reported here as [`TransportError::Timeout`], never managed
/// by the queue.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one call and return the raw response body.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the connection is lost, the call
    /// times out, or the server answers with a non-success HTTP status.
    async fn send(&self, descriptor: &RequestDescriptor) -> Result<Vec<u8>, TransportError>;
}

/// Maps raw response bytes into a structured value.
pub trait Mapper: Send + Sync {
    /// Decode the raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedResponse`] when the bytes cannot be decoded.
    fn map(&self, raw: &[u8]) -> Result<Value, Error>;
}

/// Per-request-type validation and postprocessing.
///
/// The engine stays domain-agnostic: whether a structurally valid response is
/// an application-level rejection, and what domain value to extract from it,
/// is decided here. A handler may also elect to have a request re-enqueued
/// for another attempt after a recoverable rejection; that decision is
/// deliberate and bounded, never a generic retry loop.
pub trait ResponseHandler: Send + Sync {
    /// Check the mapped response for application-level rejection.
    ///
    /// # Errors
    ///
    /// Returns the error the request should fail with, typically
    /// [`Error::Application`] or [`Error::MalformedResponse`].
    fn validate(&self, mapped: &Value) -> Result<(), Error> {
        let _ = mapped;
        Ok(())
    }

    /// Produce the domain result from a validated response.
    fn process(&self, mapped: &Value) -> Value {
        mapped.clone()
    }

    /// Whether a validation error should send the request back to the queue
    /// for another attempt. `attempt` is the number of attempts already made.
    fn should_reenqueue(&self, error: &Error, attempt: u32) -> bool {
        let _ = (error, attempt);
        false
    }
}

/// Handler that accepts every mapped response unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ResponseHandler for AcceptAll {}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(params: &[(&str, &str)]) -> RequestDescriptor {
        RequestDescriptor {
            endpoint_url: "https://cases.example.com/api.asp".to_string(),
            auth_token: None,
            parameters: params
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    #[test]
    fn signature_orders_parameters_canonically() {
        let a = descriptor(&[("cmd", "search"), ("q", "open")]);
        let b = descriptor(&[("q", "open"), ("cmd", "search")]);
        assert_eq!(a.signature(), b.signature());
        assert_eq!(
            a.signature(),
            "https://cases.example.com/api.asp?cmd=search&q=open"
        );
    }

    #[test]
    fn signature_ignores_auth_token() {
        let mut a = descriptor(&[("cmd", "search")]);
        let b = descriptor(&[("cmd", "search")]);
        a.auth_token = Some("tok".to_string());
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn accept_all_passes_everything_through() {
        let handler = AcceptAll;
        let value = serde_json::json!({"cases": [1, 2, 3]});
        assert!(handler.validate(&value).is_ok());
        assert_eq!(handler.process(&value), value);
        assert!(!handler.should_reenqueue(&Error::Canceled, 0));
    }
}
