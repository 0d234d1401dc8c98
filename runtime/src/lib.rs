//! # Casewire Runtime
//!
//! The request execution engine: the [`RequestQueue`] that admits, orders,
//! pauses, caches, and cancels requests, and the executor that performs one
//! attempt per dispatch.
//!
//! ## Example
//!
//! ```ignore
//! use casewire_core::{Request, SessionContext};
//! use casewire_runtime::{HttpTransport, JsonMapper, RequestQueue};
//! use std::sync::Arc;
//!
//! let queue = RequestQueue::new(Arc::new(HttpTransport::new()), Arc::new(JsonMapper));
//!
//! let context = Arc::new(
//!     SessionContext::new("https://cases.example.com/api.asp").with_auth_token("tok"),
//! );
//! let request = Request::new(
//!     context,
//!     [("cmd".to_string(), "listCases".to_string())].into_iter().collect(),
//! );
//! request.on_ended(|req| println!("{} -> {}", req.id(), req.state()));
//!
//! queue.enqueue(&request).await?;
//! queue.wait_idle().await;
//! ```

/// One attempt at satisfying a request, plus hook dispatch indirection
pub mod executor;

/// Admission control, ordering, pausing, and the response cache
pub mod queue;

/// Production transport (HTTP) and mapper (JSON) collaborators
pub mod transport;

pub use executor::{HookDispatcher, InlineDispatcher};
pub use queue::{QueueConfig, RequestQueue, ResponseCache};
pub use transport::{HttpTransport, JsonMapper};
