//! Production collaborators: HTTP transport and JSON mapper.
//!
//! The engine treats the transport and mapper as opaque; these are the
//! batteries-included implementations for services speaking form-encoded
//! requests and JSON responses. Anything else (XML bodies, custom auth
//! handshakes) is a matter of supplying different implementations of the
//! same traits.

use async_trait::async_trait;
use casewire_core::{Error, Mapper, RequestDescriptor, Transport, TransportError};
use serde_json::Value;

/// Transport that POSTs form-encoded parameters over HTTP.
///
/// The session's auth token, when present, is merged into the parameter set
/// as `token`, matching the procedural API's convention of carrying the
/// token as an ordinary parameter.
///
/// Deadlines are the client's concern: configure a
/// [`reqwest::Client`] with a timeout and pass it to
/// [`with_client`](Self::with_client); elapsed deadlines surface as
/// [`TransportError::Timeout`].
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with a default client (no timeout).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport backed by a preconfigured client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn map_reqwest_error(error: &reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::ConnectionLost(error.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, descriptor: &RequestDescriptor) -> Result<Vec<u8>, TransportError> {
        let mut form = descriptor.parameters.clone();
        if let Some(token) = &descriptor.auth_token {
            form.insert("token".to_string(), token.clone());
        }

        let response = self
            .client
            .post(&descriptor.endpoint_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::ServerHttp {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(&e))?;
        Ok(body.to_vec())
    }
}

/// Mapper that decodes raw bytes as a JSON value tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMapper;

impl Mapper for JsonMapper {
    fn map(&self, raw: &[u8]) -> Result<Value, Error> {
        serde_json::from_slice(raw).map_err(|e| Error::MalformedResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_mapper_decodes_valid_bodies() {
        let mapper = JsonMapper;
        let value = mapper.map(br#"{"cases": [{"id": 42}]}"#);
        assert_eq!(value, Ok(serde_json::json!({"cases": [{"id": 42}]})));
    }

    #[test]
    fn json_mapper_reports_malformed_bodies() {
        let mapper = JsonMapper;
        let result = mapper.map(b"<html>not json</html>");
        assert!(matches!(result, Err(Error::MalformedResponse(_))));
    }
}
