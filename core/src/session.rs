//! Session context shared by requests against one service endpoint.

use serde::{Deserialize, Serialize};

/// Endpoint address and authentication state for one service session.
///
/// A `SessionContext` is immutable once attached to a request and is shared
/// by reference (`Arc`) across many requests; the engine never mutates it.
/// Acquiring or refreshing the token is the caller's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    endpoint_url: String,
    auth_token: Option<String>,
}

impl SessionContext {
    /// Create a context for an endpoint with no authentication token.
    #[must_use]
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            auth_token: None,
        }
    }

    /// Attach an authentication token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// The service endpoint URL.
    #[must_use]
    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// The authentication token, if one was attached.
    #[must_use]
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_holds_endpoint_and_token() {
        let ctx = SessionContext::new("https://cases.example.com/api.asp");
        assert_eq!(ctx.endpoint_url(), "https://cases.example.com/api.asp");
        assert_eq!(ctx.auth_token(), None);

        let ctx = ctx.with_auth_token("tok-123");
        assert_eq!(ctx.auth_token(), Some("tok-123"));
    }
}
