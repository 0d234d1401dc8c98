//! # Casewire Testing
//!
//! Testing utilities for the Casewire request execution engine:
//!
//! - [`mocks::MockTransport`]: scripted transport outcomes, recorded calls,
//!   optional gating for deterministic cancel-while-running tests
//! - [`mocks::FixedClock`]: deterministic lifecycle timestamps
//! - [`mocks::EnvelopeHandler`]: response handler for the service's
//!   `{"error": {code, message}}` rejection envelope, with optional one-shot
//!   reenqueue scripting
//!
//! ## Example
//!
//! ```ignore
//! use casewire_testing::mocks::MockTransport;
//! use casewire_runtime::{JsonMapper, RequestQueue};
//! use std::sync::Arc;
//!
//! #[tokio::test]
//! async fn completes_a_request() {
//!     let transport = Arc::new(MockTransport::new());
//!     transport.respond_with_json(&signature, &serde_json::json!({"ok": true}));
//!
//!     let queue = RequestQueue::new(transport, Arc::new(JsonMapper));
//!     queue.enqueue(&request).await.unwrap();
//!     queue.wait_idle().await;
//! }
//! ```

use casewire_core::{Request, SessionContext};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Mock implementations of the engine's collaborators.
pub mod mocks {
    use async_trait::async_trait;
    use casewire_core::collaborators::{RequestDescriptor, ResponseHandler, Transport};
    use casewire_core::environment::Clock;
    use casewire_core::error::{Error, TransportError};
    use casewire_core::{DateTime, Utc};
    use serde_json::Value;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One scripted transport outcome.
    #[derive(Debug, Clone)]
    pub enum MockOutcome {
        /// Return these raw bytes.
        Respond(Vec<u8>),
        /// Fail with this transport error.
        Fail(TransportError),
    }

    /// Transport with scripted per-signature outcomes.
    ///
    /// Outcomes are keyed by request signature. Scripting several outcomes
    /// for one signature plays them in order, and the last one repeats
    /// forever. Every call is recorded, so tests can assert a transport was
    /// or was not contacted.
    #[derive(Default)]
    pub struct MockTransport {
        outcomes: Mutex<HashMap<String, VecDeque<MockOutcome>>>,
        calls: Mutex<Vec<RequestDescriptor>>,
        delay: Mutex<Option<Duration>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl MockTransport {
        /// Create a transport with no scripted outcomes. Calls for unknown
        /// signatures fail with `ConnectionLost`.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a gated transport: every call blocks until a permit is
        /// granted via [`release`](Self::release). Makes
        /// cancel-while-running deterministic.
        #[must_use]
        pub fn gated() -> Self {
            Self {
                gate: Some(Arc::new(Semaphore::new(0))),
                ..Self::default()
            }
        }

        /// Allow `calls` gated transport calls to proceed.
        pub fn release(&self, calls: usize) {
            if let Some(gate) = &self.gate {
                gate.add_permits(calls);
            }
        }

        /// Script an outcome for a signature (appended to its sequence).
        pub fn script(&self, signature: &str, outcome: MockOutcome) {
            lock(&self.outcomes)
                .entry(signature.to_string())
                .or_default()
                .push_back(outcome);
        }

        /// Script a successful raw-bytes response.
        pub fn respond_with(&self, signature: &str, raw: Vec<u8>) {
            self.script(signature, MockOutcome::Respond(raw));
        }

        /// Script a successful JSON response.
        pub fn respond_with_json(&self, signature: &str, body: &Value) {
            self.respond_with(signature, body.to_string().into_bytes());
        }

        /// Script a transport failure.
        pub fn fail_with(&self, signature: &str, error: TransportError) {
            self.script(signature, MockOutcome::Fail(error));
        }

        /// Delay every call by `delay` before resolving.
        pub fn set_delay(&self, delay: Duration) {
            *lock(&self.delay) = Some(delay);
        }

        /// Every descriptor this transport was called with, in order.
        #[must_use]
        pub fn calls(&self) -> Vec<RequestDescriptor> {
            lock(&self.calls).clone()
        }

        /// Number of calls made so far.
        #[must_use]
        pub fn call_count(&self) -> usize {
            lock(&self.calls).len()
        }

        fn next_outcome(&self, signature: &str) -> MockOutcome {
            let mut outcomes = lock(&self.outcomes);
            match outcomes.get_mut(signature) {
                Some(sequence) if sequence.len() > 1 => {
                    // Sequence head; the last scripted outcome stays sticky.
                    sequence.pop_front().unwrap_or(MockOutcome::Fail(
                        TransportError::ConnectionLost("empty mock sequence".to_string()),
                    ))
                }
                Some(sequence) => sequence
                    .front()
                    .cloned()
                    .unwrap_or(MockOutcome::Fail(TransportError::ConnectionLost(
                        "empty mock sequence".to_string(),
                    ))),
                None => MockOutcome::Fail(TransportError::ConnectionLost(format!(
                    "no scripted response for {signature}"
                ))),
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, descriptor: &RequestDescriptor) -> Result<Vec<u8>, TransportError> {
            lock(&self.calls).push(descriptor.clone());
            if let Some(gate) = &self.gate {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|_| TransportError::ConnectionLost("gate closed".to_string()))?;
                permit.forget();
            }
            let delay = *lock(&self.delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match self.next_outcome(&descriptor.signature()) {
                MockOutcome::Respond(raw) => Ok(raw),
                MockOutcome::Fail(error) => Err(error),
            }
        }
    }

    /// Fixed clock for deterministic tests: always returns the same time.
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a fixed clock pinned to `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC).
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded timestamp fails to parse, which cannot happen
    /// in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Response handler for the service's rejection envelope.
    ///
    /// A mapped response of the form `{"error": {"code": N, "message": M}}`
    /// fails validation with `Error::Application`; everything else passes.
    /// Postprocessing extracts the `data` field when present, otherwise the
    /// whole response.
    ///
    /// A handler may additionally be scripted to reenqueue on one specific
    /// application code a bounded number of times, modeling
    /// "stale token, reacquire and retry once".
    #[derive(Debug, Clone, Default)]
    pub struct EnvelopeHandler {
        reenqueue_code: Option<u32>,
        max_attempts: u32,
    }

    impl EnvelopeHandler {
        /// Handler that rejects error envelopes and never reenqueues.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Reenqueue on application error `code` while fewer than
        /// `max_attempts` attempts have been made.
        #[must_use]
        pub const fn with_reenqueue_on(mut self, code: u32, max_attempts: u32) -> Self {
            self.reenqueue_code = Some(code);
            self.max_attempts = max_attempts;
            self
        }
    }

    impl ResponseHandler for EnvelopeHandler {
        fn validate(&self, mapped: &Value) -> Result<(), Error> {
            let Some(envelope) = mapped.get("error") else {
                return Ok(());
            };
            let code = envelope
                .get("code")
                .and_then(Value::as_u64)
                .and_then(|c| u32::try_from(c).ok())
                .unwrap_or(0);
            let message = envelope
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown application error")
                .to_string();
            Err(Error::Application { code, message })
        }

        fn process(&self, mapped: &Value) -> Value {
            mapped.get("data").cloned().unwrap_or_else(|| mapped.clone())
        }

        fn should_reenqueue(&self, error: &Error, attempt: u32) -> bool {
            match (error, self.reenqueue_code) {
                (Error::Application { code, .. }, Some(retry_code)) => {
                    *code == retry_code && attempt < self.max_attempts
                }
                _ => false,
            }
        }
    }
}

/// Session context against a placeholder test endpoint.
#[must_use]
pub fn test_context() -> Arc<SessionContext> {
    Arc::new(SessionContext::new("https://cases.test/api.asp").with_auth_token("test-token"))
}

/// Build a request against `context` with string parameters and a fixed
/// clock.
#[must_use]
pub fn make_request(context: &Arc<SessionContext>, parameters: &[(&str, &str)]) -> Request {
    let parameters: BTreeMap<String, String> = parameters
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    Request::with_clock(
        Arc::clone(context),
        parameters,
        Arc::new(mocks::test_clock()),
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::mocks::{EnvelopeHandler, MockTransport};
    use casewire_core::collaborators::{ResponseHandler, Transport};
    use casewire_core::error::{Error, TransportError};

    #[tokio::test]
    async fn mock_transport_plays_sequences_and_sticks_on_last() {
        let transport = MockTransport::new();
        let context = super::test_context();
        let request = super::make_request(&context, &[("cmd", "listCases")]);
        let descriptor = request.descriptor();
        let signature = descriptor.signature();

        transport.fail_with(&signature, TransportError::Timeout);
        transport.respond_with(&signature, b"ok".to_vec());

        assert_eq!(
            transport.send(&descriptor).await,
            Err(TransportError::Timeout)
        );
        assert_eq!(transport.send(&descriptor).await, Ok(b"ok".to_vec()));
        // Last outcome is sticky.
        assert_eq!(transport.send(&descriptor).await, Ok(b"ok".to_vec()));
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn mock_transport_rejects_unscripted_signatures() {
        let transport = MockTransport::new();
        let context = super::test_context();
        let request = super::make_request(&context, &[("cmd", "unknown")]);
        let result = transport.send(&request.descriptor()).await;
        assert!(matches!(result, Err(TransportError::ConnectionLost(_))));
    }

    #[test]
    fn envelope_handler_rejects_error_envelopes() {
        let handler = EnvelopeHandler::new();
        let rejection = serde_json::json!({
            "error": {"code": 9, "message": "case changed since last view"}
        });
        assert_eq!(
            handler.validate(&rejection),
            Err(Error::Application {
                code: 9,
                message: "case changed since last view".to_string()
            })
        );
        assert!(handler.validate(&serde_json::json!({"data": []})).is_ok());
    }

    #[test]
    fn envelope_handler_extracts_data_field() {
        let handler = EnvelopeHandler::new();
        let body = serde_json::json!({"data": {"cases": [1]}});
        assert_eq!(handler.process(&body), serde_json::json!({"cases": [1]}));
        let bare = serde_json::json!({"cases": [2]});
        assert_eq!(handler.process(&bare), bare);
    }

    #[test]
    fn envelope_handler_reenqueue_is_bounded() {
        let handler = EnvelopeHandler::new().with_reenqueue_on(3, 2);
        let stale_token = Error::Application {
            code: 3,
            message: "not logged on".to_string(),
        };
        assert!(handler.should_reenqueue(&stale_token, 1));
        assert!(!handler.should_reenqueue(&stale_token, 2));
        assert!(!handler.should_reenqueue(&Error::Canceled, 1));
    }
}
