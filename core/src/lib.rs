//! # Casewire Core
//!
//! Core types for the Casewire request execution engine: the [`Request`]
//! entity and its lifecycle state machine, the error taxonomy, the session
//! context, and the collaborator traits the engine drives.
//!
//! The engine itself (the executor and the queue) lives in
//! `casewire-runtime`. This crate is deliberately domain-agnostic: it knows
//! nothing about any specific API call's wire format, parameters, or
//! response shape. Those concerns arrive through [`collaborators::Transport`],
//! [`collaborators::Mapper`], and per-request-type
//! [`collaborators::ResponseHandler`] implementations.
//!
//! ## Lifecycle
//!
//! A request moves `Unqueued → Enqueued → Running → Completed | Failed`,
//! with `Reenqueued` looping back to `Running` for deliberate reattempts and
//! `Canceled` reachable from any non-terminal queued state. For every
//! request that leaves `Unqueued`, the `on_ended` hook fires exactly once
//! after exactly one of `on_success`, `on_failure`, or `on_cancel`.
//!
//! ## Example
//!
//! ```
//! use casewire_core::{Request, RequestState, SessionContext};
//! use std::sync::Arc;
//!
//! let context = Arc::new(
//!     SessionContext::new("https://cases.example.com/api.asp").with_auth_token("tok"),
//! );
//! let request = Request::new(
//!     context,
//!     [("cmd".to_string(), "listCases".to_string())].into_iter().collect(),
//! );
//! request.on_ended(|req| {
//!     println!("{} finished in state {}", req.id(), req.state());
//! });
//! assert_eq!(request.state(), RequestState::Unqueued);
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use serde_json::Value;

pub mod collaborators;
pub mod environment;
pub mod error;
pub mod request;
pub mod session;

pub use collaborators::{AcceptAll, Mapper, RequestDescriptor, ResponseHandler, Transport};
pub use environment::{Clock, SystemClock};
pub use error::{Error, TransportError};
pub use request::{Commit, Hook, Phase, Request, RequestId, RequestState};
pub use session::SessionContext;
