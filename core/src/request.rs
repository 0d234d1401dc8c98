//! The request entity and its lifecycle state machine.
//!
//! A [`Request`] represents one logical call to the remote case-tracking
//! service. It is a cheap-to-clone handle; all clones observe the same
//! lifecycle. The engine (queue and executor) drives the state machine
//! through the queue-facing transition methods; callers only read fields,
//! register hooks, and recycle finished requests for reuse.
//!
//! # State machine
//!
//! ```text
//! Unqueued -> Enqueued -> Running -> Completed | Failed
//!                           |  ^
//!                           v  |
//!                        Reenqueued
//! Enqueued | Running | Reenqueued -> Canceled
//! ```
//!
//! `Completed`, `Failed` and `Canceled` are terminal. Recycling a terminal
//! request back to `Unqueued` is a distinct act, not a state-machine edge.

use crate::collaborators::{AcceptAll, RequestDescriptor, ResponseHandler};
use crate::environment::{Clock, SystemClock};
use crate::error::Error;
use crate::session::SessionContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lifecycle state of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// Created (or recycled) and not yet admitted to a queue.
    Unqueued,
    /// Admitted to a queue, waiting for dispatch.
    Enqueued,
    /// An executor is performing an attempt.
    Running,
    /// Put back by the executor for another attempt after a recoverable
    /// rejection.
    Reenqueued,
    /// Terminal: transport succeeded and validation passed.
    Completed,
    /// Terminal: transport, mapping, or validation failed.
    Failed,
    /// Terminal: canceled by the caller or by a dependency cancellation.
    Canceled,
}

impl RequestState {
    /// Whether no further transitions can leave this state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unqueued => "unqueued",
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Reenqueued => "reenqueued",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        write!(f, "{name}")
    }
}

/// Process-unique identity of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request-{}", self.0)
    }
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A completion hook invoked with the request it was registered on.
pub type Hook = Arc<dyn Fn(&Request) + Send + Sync>;

/// How a terminal commit resolved.
///
/// [`Request::complete`] and [`Request::fail`] observe cancellation intent
/// under the lifecycle lock, in the same critical section as the state
/// write. Intent set at any point before the commit therefore always wins,
/// and the caller learns which terminal state actually landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// The requested terminal state was committed.
    Landed,
    /// Cancellation intent was observed; the request was committed as
    /// `Canceled` instead.
    RoutedToCancel,
}

/// Lifecycle phases a hook can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Fired on the transition into `Enqueued`.
    Enqueued,
    /// Fired on each transition into `Running`, before the transport call.
    BeforeStart,
    /// Fired on the transition into `Completed`.
    Success,
    /// Fired on the transition into `Failed`.
    Failure,
    /// Fired on the transition into `Canceled`.
    Cancel,
    /// Fired exactly once after any terminal resolution.
    Ended,
}

#[derive(Default)]
struct Hooks {
    on_enqueued: Option<Hook>,
    on_before_start: Option<Hook>,
    on_success: Option<Hook>,
    on_failure: Option<Hook>,
    on_cancel: Option<Hook>,
    on_ended: Option<Hook>,
}

struct Lifecycle {
    state: RequestState,
    raw_result: Option<Vec<u8>>,
    mapped_result: Option<Value>,
    processed_result: Option<Value>,
    error: Option<Error>,
    cached_response_used: bool,
    cached_response_ever_used: bool,
    enqueued_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    ended_fired: bool,
    attempt: u32,
}

impl Lifecycle {
    const fn fresh() -> Self {
        Self {
            state: RequestState::Unqueued,
            raw_result: None,
            mapped_result: None,
            processed_result: None,
            error: None,
            cached_response_used: false,
            cached_response_ever_used: false,
            enqueued_at: None,
            started_at: None,
            ended_at: None,
            ended_fired: false,
            attempt: 0,
        }
    }
}

struct Inner {
    id: RequestId,
    context: Arc<SessionContext>,
    parameters: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    uses_cached_response: AtomicBool,
    cancel_requested: AtomicBool,
    handler: Mutex<Arc<dyn ResponseHandler>>,
    user_data: Mutex<Option<Value>>,
    dependencies: Mutex<SmallVec<[Request; 2]>>,
    lifecycle: Mutex<Lifecycle>,
    hooks: Mutex<Hooks>,
}

/// One logical call to the remote service, with its own lifecycle, results,
/// and completion hooks.
#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
}

// A poisoned lock means a hook panicked while holding it; the lifecycle data
// itself stays consistent, so recover the guard.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Request {
    /// Create a request in state `Unqueued` against the given session.
    #[must_use]
    pub fn new(context: Arc<SessionContext>, parameters: BTreeMap<String, String>) -> Self {
        Self::with_clock(context, parameters, Arc::new(SystemClock))
    }

    /// Create a request with an injected clock for deterministic timestamps.
    #[must_use]
    pub fn with_clock(
        context: Arc<SessionContext>,
        parameters: BTreeMap<String, String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let created_at = clock.now();
        Self {
            inner: Arc::new(Inner {
                id: RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)),
                context,
                parameters,
                created_at,
                clock,
                uses_cached_response: AtomicBool::new(false),
                cancel_requested: AtomicBool::new(false),
                handler: Mutex::new(Arc::new(AcceptAll)),
                user_data: Mutex::new(None),
                dependencies: Mutex::new(SmallVec::new()),
                lifecycle: Mutex::new(Lifecycle::fresh()),
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    /// Process-unique identity of this request.
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    /// The session context this request runs against.
    #[must_use]
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.inner.context
    }

    /// Call parameters, immutable after construction.
    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.inner.parameters
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RequestState {
        lock(&self.inner.lifecycle).state
    }

    /// Raw response bytes from the last fetch, if one completed.
    #[must_use]
    pub fn raw_result(&self) -> Option<Vec<u8>> {
        lock(&self.inner.lifecycle).raw_result.clone()
    }

    /// Structured result from the mapper, if mapping succeeded.
    #[must_use]
    pub fn mapped_result(&self) -> Option<Value> {
        lock(&self.inner.lifecycle).mapped_result.clone()
    }

    /// Domain result from postprocessing; present only on success.
    #[must_use]
    pub fn processed_result(&self) -> Option<Value> {
        lock(&self.inner.lifecycle).processed_result.clone()
    }

    /// Terminal error; present on failure and on cancellation.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        lock(&self.inner.lifecycle).error.clone()
    }

    /// Whether the last fetch was served from the response cache.
    #[must_use]
    pub fn cached_response_used(&self) -> bool {
        lock(&self.inner.lifecycle).cached_response_used
    }

    /// Whether any fetch in this request's lifetime was served from cache.
    #[must_use]
    pub fn cached_response_ever_used(&self) -> bool {
        lock(&self.inner.lifecycle).cached_response_ever_used
    }

    /// When the request was admitted to a queue.
    #[must_use]
    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.lifecycle).enqueued_at
    }

    /// When the first attempt began.
    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.lifecycle).started_at
    }

    /// When the request reached a terminal state.
    #[must_use]
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.lifecycle).ended_at
    }

    /// Number of attempts made so far.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        lock(&self.inner.lifecycle).attempt
    }

    /// Opt this request in or out of response caching.
    pub fn set_uses_cached_response(&self, uses_cache: bool) {
        self.inner
            .uses_cached_response
            .store(uses_cache, Ordering::Release);
    }

    /// Whether this request may be satisfied from the response cache.
    #[must_use]
    pub fn uses_cached_response(&self) -> bool {
        self.inner.uses_cached_response.load(Ordering::Acquire)
    }

    /// Opaque caller payload carried through hooks.
    #[must_use]
    pub fn user_data(&self) -> Option<Value> {
        lock(&self.inner.user_data).clone()
    }

    /// Attach an opaque caller payload.
    pub fn set_user_data(&self, data: Value) {
        *lock(&self.inner.user_data) = Some(data);
    }

    /// Install the per-request-type response handler.
    pub fn set_handler(&self, handler: Arc<dyn ResponseHandler>) {
        *lock(&self.inner.handler) = handler;
    }

    /// The per-request-type response handler.
    #[must_use]
    pub fn handler(&self) -> Arc<dyn ResponseHandler> {
        lock(&self.inner.handler).clone()
    }

    /// Order this request after `dependency`: it will not start until the
    /// dependency reaches a terminal state, and it is canceled if the
    /// dependency is canceled or fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the edge would create a cycle
    /// (including a self-dependency).
    pub fn depends_on(&self, dependency: &Request) -> Result<(), Error> {
        if dependency.id() == self.id() || dependency.transitively_depends_on(self.id()) {
            return Err(Error::invalid_state(format!(
                "dependency from {} on {} would create a cycle",
                self.id(),
                dependency.id()
            )));
        }
        lock(&self.inner.dependencies).push(dependency.clone());
        Ok(())
    }

    /// Snapshot of this request's direct dependencies.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Request> {
        lock(&self.inner.dependencies).to_vec()
    }

    fn transitively_depends_on(&self, id: RequestId) -> bool {
        // Snapshot before recursing; holding the guard across the recursive
        // call could deadlock two concurrent `depends_on` walks over a
        // diamond-shaped graph.
        let direct = self.dependencies();
        direct
            .iter()
            .any(|dep| dep.id() == id || dep.transitively_depends_on(id))
    }

    /// Mark cancellation intent. The executor observes the intent before the
    /// next state-transition commit; an in-flight transport call is not
    /// forcibly aborted.
    pub fn request_cancellation(&self) {
        self.inner.cancel_requested.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }

    /// Reset a finished (or never-queued) request so it can be enqueued
    /// again. Clears results, error, and timestamps; preserves parameters and
    /// `cached_response_ever_used`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] when the request is `Enqueued`,
    /// `Running`, or `Reenqueued`; the request is left unchanged.
    pub fn recycle(&self) -> Result<(), Error> {
        let mut lc = lock(&self.inner.lifecycle);
        match lc.state {
            RequestState::Unqueued
            | RequestState::Completed
            | RequestState::Failed
            | RequestState::Canceled => {
                let ever_used = lc.cached_response_ever_used;
                *lc = Lifecycle::fresh();
                lc.cached_response_ever_used = ever_used;
                self.inner.cancel_requested.store(false, Ordering::Release);
                Ok(())
            }
            state => Err(Error::invalid_state(format!(
                "cannot recycle a request in state {state}"
            ))),
        }
    }

    /// Build the transport descriptor for this request.
    #[must_use]
    pub fn descriptor(&self) -> RequestDescriptor {
        RequestDescriptor {
            endpoint_url: self.inner.context.endpoint_url().to_string(),
            auth_token: self.inner.context.auth_token().map(str::to_string),
            parameters: self.inner.parameters.clone(),
        }
    }

    /// Cache key for this request (endpoint plus parameters).
    #[must_use]
    pub fn signature(&self) -> String {
        self.descriptor().signature()
    }
}

/// Hook registration. Hooks are captured at the moment their phase fires;
/// registering one after the phase fired has no retroactive effect.
impl Request {
    /// Register the hook fired when the request is admitted to a queue.
    pub fn on_enqueued(&self, hook: impl Fn(&Request) + Send + Sync + 'static) {
        lock(&self.inner.hooks).on_enqueued = Some(Arc::new(hook));
    }

    /// Register the hook fired before each attempt starts.
    pub fn on_before_start(&self, hook: impl Fn(&Request) + Send + Sync + 'static) {
        lock(&self.inner.hooks).on_before_start = Some(Arc::new(hook));
    }

    /// Register the hook fired on successful completion.
    pub fn on_success(&self, hook: impl Fn(&Request) + Send + Sync + 'static) {
        lock(&self.inner.hooks).on_success = Some(Arc::new(hook));
    }

    /// Register the hook fired on failure.
    pub fn on_failure(&self, hook: impl Fn(&Request) + Send + Sync + 'static) {
        lock(&self.inner.hooks).on_failure = Some(Arc::new(hook));
    }

    /// Register the hook fired on cancellation.
    pub fn on_cancel(&self, hook: impl Fn(&Request) + Send + Sync + 'static) {
        lock(&self.inner.hooks).on_cancel = Some(Arc::new(hook));
    }

    /// Register the hook fired exactly once after any terminal resolution.
    /// This is the caller's sole reliable "this request is finished" signal.
    pub fn on_ended(&self, hook: impl Fn(&Request) + Send + Sync + 'static) {
        lock(&self.inner.hooks).on_ended = Some(Arc::new(hook));
    }

    /// Capture the hook for a phase at fire time.
    ///
    /// For [`Phase::Ended`] this also consumes the once-per-lifecycle budget:
    /// the first call after a terminal resolution captures the hook (or
    /// `None` if none is registered) and every later call returns `None`.
    #[must_use]
    pub fn capture_hook(&self, phase: Phase) -> Option<Hook> {
        if phase == Phase::Ended {
            let mut lc = lock(&self.inner.lifecycle);
            if lc.ended_fired {
                return None;
            }
            lc.ended_fired = true;
        }
        let hooks = lock(&self.inner.hooks);
        match phase {
            Phase::Enqueued => hooks.on_enqueued.clone(),
            Phase::BeforeStart => hooks.on_before_start.clone(),
            Phase::Success => hooks.on_success.clone(),
            Phase::Failure => hooks.on_failure.clone(),
            Phase::Cancel => hooks.on_cancel.clone(),
            Phase::Ended => hooks.on_ended.clone(),
        }
    }
}

/// Lifecycle transitions, driven by the queue and the executor. Each method
/// enforces the legal state-machine edges and the field invariants; illegal
/// transitions are reported synchronously and leave the request unchanged.
impl Request {
    /// `Unqueued -> Enqueued`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyQueued`] when the request is not `Unqueued`.
    pub fn begin_enqueued(&self) -> Result<(), Error> {
        let mut lc = lock(&self.inner.lifecycle);
        if lc.state != RequestState::Unqueued {
            return Err(Error::AlreadyQueued);
        }
        lc.state = RequestState::Enqueued;
        lc.enqueued_at = Some(self.inner.clock.now());
        Ok(())
    }

    /// `Enqueued | Reenqueued -> Running`. Increments the attempt counter;
    /// `started_at` is set on the first attempt only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] from any other state.
    pub fn begin_running(&self) -> Result<(), Error> {
        let mut lc = lock(&self.inner.lifecycle);
        match lc.state {
            RequestState::Enqueued | RequestState::Reenqueued => {
                lc.state = RequestState::Running;
                lc.attempt += 1;
                if lc.started_at.is_none() {
                    lc.started_at = Some(self.inner.clock.now());
                }
                Ok(())
            }
            state => Err(Error::invalid_state(format!(
                "cannot start a request in state {state}"
            ))),
        }
    }

    /// Record the raw bytes of a completed fetch while `Running`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] when the request is not `Running`.
    pub fn record_fetch(&self, raw: Vec<u8>, from_cache: bool) -> Result<(), Error> {
        let mut lc = lock(&self.inner.lifecycle);
        if lc.state != RequestState::Running {
            return Err(Error::invalid_state(format!(
                "cannot record a fetch in state {}",
                lc.state
            )));
        }
        lc.raw_result = Some(raw);
        lc.cached_response_used = from_cache;
        lc.cached_response_ever_used |= from_cache;
        Ok(())
    }

    /// Record the mapped result while `Running`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] when the request is not `Running`.
    pub fn record_mapped(&self, mapped: Value) -> Result<(), Error> {
        let mut lc = lock(&self.inner.lifecycle);
        if lc.state != RequestState::Running {
            return Err(Error::invalid_state(format!(
                "cannot record a mapped result in state {}",
                lc.state
            )));
        }
        lc.mapped_result = Some(mapped);
        Ok(())
    }

    /// `Running -> Completed` with the postprocessed domain result.
    ///
    /// Cancellation intent is re-checked under the lifecycle lock: if intent
    /// was set at any point before this commit, the request lands in
    /// `Canceled` (with [`Error::Canceled`]) instead and
    /// [`Commit::RoutedToCancel`] is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] when the request is not `Running`.
    pub fn complete(&self, processed: Value) -> Result<Commit, Error> {
        let mut lc = lock(&self.inner.lifecycle);
        if lc.state != RequestState::Running {
            return Err(Error::invalid_state(format!(
                "cannot complete a request in state {}",
                lc.state
            )));
        }
        if self.inner.cancel_requested.load(Ordering::Acquire) {
            Self::commit_canceled(&mut lc, Error::Canceled, &*self.inner.clock);
            return Ok(Commit::RoutedToCancel);
        }
        lc.state = RequestState::Completed;
        lc.processed_result = Some(processed);
        lc.error = None;
        lc.ended_at = Some(self.inner.clock.now());
        Ok(Commit::Landed)
    }

    /// `Running -> Failed` with the terminal error.
    ///
    /// As with [`complete`](Self::complete), cancellation intent observed
    /// under the lifecycle lock reroutes the commit to `Canceled`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] when the request is not `Running`.
    pub fn fail(&self, error: Error) -> Result<Commit, Error> {
        let mut lc = lock(&self.inner.lifecycle);
        if lc.state != RequestState::Running {
            return Err(Error::invalid_state(format!(
                "cannot fail a request in state {}",
                lc.state
            )));
        }
        if self.inner.cancel_requested.load(Ordering::Acquire) {
            Self::commit_canceled(&mut lc, Error::Canceled, &*self.inner.clock);
            return Ok(Commit::RoutedToCancel);
        }
        lc.state = RequestState::Failed;
        lc.error = Some(error);
        lc.ended_at = Some(self.inner.clock.now());
        Ok(Commit::Landed)
    }

    /// `Enqueued | Running | Reenqueued -> Canceled` with the cancellation
    /// error: [`Error::Canceled`] for caller and queue cancellations,
    /// [`Error::DependencyCanceled`] when a dependency was canceled or
    /// failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] from `Unqueued` or a terminal state.
    pub fn cancel_terminal(&self, error: Error) -> Result<(), Error> {
        let mut lc = lock(&self.inner.lifecycle);
        match lc.state {
            RequestState::Enqueued | RequestState::Running | RequestState::Reenqueued => {
                Self::commit_canceled(&mut lc, error, &*self.inner.clock);
                Ok(())
            }
            state => Err(Error::invalid_state(format!(
                "cannot cancel a request in state {state}"
            ))),
        }
    }

    fn commit_canceled(lc: &mut Lifecycle, error: Error, clock: &dyn Clock) {
        lc.state = RequestState::Canceled;
        lc.error = Some(error);
        lc.processed_result = None;
        lc.ended_at = Some(clock.now());
    }

    /// `Running -> Reenqueued`: put the request back for a fresh attempt.
    /// Clears the attempt's fetch and mapped results.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] when the request is not `Running`.
    pub fn reenqueue(&self) -> Result<(), Error> {
        let mut lc = lock(&self.inner.lifecycle);
        if lc.state != RequestState::Running {
            return Err(Error::invalid_state(format!(
                "cannot reenqueue a request in state {}",
                lc.state
            )));
        }
        lc.state = RequestState::Reenqueued;
        lc.raw_result = None;
        lc.mapped_result = None;
        lc.cached_response_used = false;
        Ok(())
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Request {}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn request() -> Request {
        let context = Arc::new(SessionContext::new("https://cases.example.com/api.asp"));
        let parameters = [("cmd".to_string(), "listCases".to_string())]
            .into_iter()
            .collect();
        Request::new(context, parameters)
    }

    #[test]
    fn new_request_is_unqueued_with_empty_results() {
        let req = request();
        assert_eq!(req.state(), RequestState::Unqueued);
        assert!(req.raw_result().is_none());
        assert!(req.mapped_result().is_none());
        assert!(req.processed_result().is_none());
        assert!(req.error().is_none());
        assert!(req.enqueued_at().is_none());
        assert_eq!(req.attempt(), 0);
    }

    #[test]
    fn lifecycle_happy_path_sets_fields_in_order() {
        let req = request();
        req.begin_enqueued().unwrap();
        assert_eq!(req.state(), RequestState::Enqueued);
        assert!(req.enqueued_at().is_some());

        req.begin_running().unwrap();
        assert_eq!(req.state(), RequestState::Running);
        assert!(req.started_at().is_some());
        assert_eq!(req.attempt(), 1);

        req.record_fetch(b"{}".to_vec(), false).unwrap();
        req.record_mapped(serde_json::json!({})).unwrap();
        req.complete(serde_json::json!({"ok": true})).unwrap();
        assert_eq!(req.state(), RequestState::Completed);
        assert!(req.ended_at().is_some());
        assert_eq!(req.processed_result(), Some(serde_json::json!({"ok": true})));
    }

    #[test]
    fn illegal_edges_are_rejected_and_state_unchanged() {
        let req = request();
        assert!(req.begin_running().is_err());
        assert!(req.complete(Value::Null).is_err());
        assert!(req
            .fail(Error::Transport(crate::error::TransportError::Timeout))
            .is_err());
        assert!(req.cancel_terminal(Error::Canceled).is_err());
        assert_eq!(req.state(), RequestState::Unqueued);

        req.begin_enqueued().unwrap();
        assert_eq!(req.begin_enqueued().unwrap_err(), Error::AlreadyQueued);
        assert!(req.record_fetch(vec![], false).is_err());
        assert_eq!(req.state(), RequestState::Enqueued);
    }

    #[test]
    fn terminal_states_admit_no_transitions() {
        let req = request();
        req.begin_enqueued().unwrap();
        req.begin_running().unwrap();
        req.fail(Error::Transport(crate::error::TransportError::Timeout))
            .unwrap();

        assert!(req.begin_running().is_err());
        assert!(req.cancel_terminal(Error::Canceled).is_err());
        assert!(req.complete(Value::Null).is_err());
        assert_eq!(req.state(), RequestState::Failed);
    }

    #[test]
    fn recycle_only_from_unqueued_or_terminal() {
        let req = request();
        // Idempotent from Unqueued.
        req.recycle().unwrap();
        req.recycle().unwrap();

        req.begin_enqueued().unwrap();
        assert!(req.recycle().is_err());
        req.begin_running().unwrap();
        assert!(req.recycle().is_err());
        req.record_fetch(b"{}".to_vec(), true).unwrap();
        req.complete(Value::Null).unwrap();

        req.recycle().unwrap();
        assert_eq!(req.state(), RequestState::Unqueued);
        assert!(req.raw_result().is_none());
        assert!(req.processed_result().is_none());
        assert!(req.ended_at().is_none());
        assert!(!req.cached_response_used());
        // Lifetime flag survives recycling.
        assert!(req.cached_response_ever_used());
        // Parameters are preserved.
        assert_eq!(req.parameters().get("cmd").map(String::as_str), Some("listCases"));
    }

    #[test]
    fn reenqueue_clears_attempt_results_and_counts_attempts() {
        let req = request();
        req.begin_enqueued().unwrap();
        req.begin_running().unwrap();
        req.record_fetch(b"stale".to_vec(), false).unwrap();
        req.reenqueue().unwrap();

        assert_eq!(req.state(), RequestState::Reenqueued);
        assert!(req.raw_result().is_none());

        req.begin_running().unwrap();
        assert_eq!(req.attempt(), 2);
    }

    #[test]
    fn completion_commit_observes_cancellation_intent() {
        let req = request();
        req.begin_enqueued().unwrap();
        req.begin_running().unwrap();
        // Intent set after the attempt started; the commit must see it even
        // though no other check ran in between.
        req.request_cancellation();

        let commit = req.complete(serde_json::json!({"ok": true})).unwrap();
        assert_eq!(commit, Commit::RoutedToCancel);
        assert_eq!(req.state(), RequestState::Canceled);
        assert_eq!(req.error(), Some(Error::Canceled));
        assert!(req.processed_result().is_none());
    }

    #[test]
    fn failure_commit_observes_cancellation_intent() {
        let req = request();
        req.begin_enqueued().unwrap();
        req.begin_running().unwrap();
        req.request_cancellation();

        let commit = req
            .fail(Error::Transport(crate::error::TransportError::Timeout))
            .unwrap();
        assert_eq!(commit, Commit::RoutedToCancel);
        assert_eq!(req.state(), RequestState::Canceled);
        // The cancellation wins over the attempt's own error.
        assert_eq!(req.error(), Some(Error::Canceled));
    }

    #[test]
    fn commit_lands_normally_without_intent() {
        let req = request();
        req.begin_enqueued().unwrap();
        req.begin_running().unwrap();
        let commit = req.complete(Value::Null).unwrap();
        assert_eq!(commit, Commit::Landed);
        assert_eq!(req.state(), RequestState::Completed);
    }

    #[test]
    fn ended_hook_captured_exactly_once() {
        let req = request();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        req.on_ended(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        req.begin_enqueued().unwrap();
        req.begin_running().unwrap();
        req.cancel_terminal(Error::Canceled).unwrap();

        if let Some(hook) = req.capture_hook(Phase::Ended) {
            hook(&req);
        }
        // Second capture is refused.
        assert!(req.capture_hook(Phase::Ended).is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hooks_registered_after_capture_do_not_fire_retroactively() {
        let req = request();
        req.begin_enqueued().unwrap();
        // Phase fired with no hook registered; capture consumed nothing.
        assert!(req.capture_hook(Phase::Enqueued).is_none());

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        req.on_enqueued(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        // The phase is not re-fired for late registration; nothing invokes
        // the hook unless the phase fires again in a later lifecycle.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn user_data_is_carried_and_readable_from_hooks() {
        let req = request();
        assert!(req.user_data().is_none());
        req.set_user_data(serde_json::json!({"view": "case-list"}));

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        req.on_enqueued(move |r| {
            *sink.lock().unwrap() = r.user_data();
        });
        req.begin_enqueued().unwrap();
        if let Some(hook) = req.capture_hook(Phase::Enqueued) {
            hook(&req);
        }
        assert_eq!(
            *seen.lock().unwrap(),
            Some(serde_json::json!({"view": "case-list"}))
        );
    }

    #[test]
    fn dependency_cycles_are_rejected() {
        let a = request();
        let b = request();
        let c = request();
        b.depends_on(&a).unwrap();
        c.depends_on(&b).unwrap();

        assert!(a.depends_on(&a).is_err());
        assert!(a.depends_on(&c).is_err());
        assert_eq!(b.dependencies().len(), 1);
    }

    #[test]
    fn diamond_shaped_dependencies_are_supported() {
        let root = request();
        let left = request();
        let right = request();
        let leaf = request();
        left.depends_on(&root).unwrap();
        right.depends_on(&root).unwrap();
        leaf.depends_on(&left).unwrap();
        leaf.depends_on(&right).unwrap();

        // Cycle detection walks both paths of the diamond.
        assert!(root.depends_on(&leaf).is_err());
        assert_eq!(leaf.dependencies().len(), 2);
    }

    #[test]
    fn descriptor_reflects_context_and_parameters() {
        let context = Arc::new(
            SessionContext::new("https://cases.example.com/api.asp").with_auth_token("tok-9"),
        );
        let req = Request::new(
            context,
            [("cmd".to_string(), "view".to_string())].into_iter().collect(),
        );
        let descriptor = req.descriptor();
        assert_eq!(descriptor.endpoint_url, "https://cases.example.com/api.asp");
        assert_eq!(descriptor.auth_token.as_deref(), Some("tok-9"));
        assert_eq!(
            req.signature(),
            "https://cases.example.com/api.asp?cmd=view"
        );
    }

    #[test]
    fn cancellation_intent_is_sticky_until_recycled() {
        let req = request();
        assert!(!req.cancel_requested());
        req.request_cancellation();
        assert!(req.cancel_requested());
        req.recycle().unwrap();
        assert!(!req.cancel_requested());
    }
}
