//! Error taxonomy for the request execution engine.
//!
//! Two layers are distinguished. [`TransportError`] covers everything that can
//! go wrong between the client and the server before a response body is
//! available. [`Error`] is the full taxonomy a
//! [`Request`](crate::request::Request) can terminate with. The misuse errors
//! `InvalidState` and `AlreadyQueued` are returned synchronously from the
//! violating call and never stored on a request.
//!
//! Application-level error codes (bad credentials, case changed since last
//! view, and so on) are carried opaquely in [`Error::Application`].
//! Interpreting the code space belongs to the per-request-type
//! [`ResponseHandler`](crate::collaborators::ResponseHandler), not the core.

use thiserror::Error;

/// Errors reported by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection was lost or could not be established.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The transport call exceeded its deadline.
    #[error("Connection timed out")]
    Timeout,

    /// The server answered with a non-success HTTP status.
    #[error("Server returned HTTP {status}")]
    ServerHttp {
        /// HTTP status code returned by the server.
        status: u16,
    },
}

/// Errors a request can end with, plus synchronous API-misuse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The transport failed before a response body was available.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The response body could not be mapped into a structured result.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The service rejected the call at the application level.
    ///
    /// The code space is service-specific and interpreted by the request
    /// type's response handler.
    #[error("Application error {code}: {message}")]
    Application {
        /// Service-specific error code.
        code: u32,
        /// Human-readable message reported by the service.
        message: String,
    },

    /// The request was canceled because a request it depends on was canceled
    /// or failed.
    #[error("Canceled because a dependency was canceled or failed")]
    DependencyCanceled,

    /// The request was canceled by the caller or by queue teardown.
    #[error("Canceled")]
    Canceled,

    /// An operation was invoked in a lifecycle state that does not permit it.
    ///
    /// Reported synchronously at the violating call, never through the async
    /// lifecycle.
    #[error("Invalid state: {reason}")]
    InvalidState {
        /// What was attempted and why the current state forbids it.
        reason: String,
    },

    /// The request was enqueued while it was already queued or running.
    ///
    /// Reported synchronously at the violating call.
    #[error("Request is already queued")]
    AlreadyQueued,
}

impl Error {
    /// Whether this error represents a cancellation rather than a failure.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::DependencyCanceled | Self::Canceled)
    }

    /// Convenience constructor for [`Error::InvalidState`].
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }
}
