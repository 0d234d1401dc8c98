//! Admission control and ordering for requests sharing one transport session.
//!
//! The [`RequestQueue`] owns the pending sequence, the pause and synchronous
//! flags, the response cache, and the hook dispatcher. Requests are
//! dispatched in FIFO order of admission. A request whose dependency has not
//! resolved yet is skipped until the dependency reaches a terminal state,
//! keeping its slot in the sequence. FIFO therefore holds among mutually
//! independent requests while explicit dependencies are respected.
//!
//! Dispatch selection and the `Enqueued|Reenqueued -> Running` claim happen
//! atomically under the pending-sequence lock, which is what guarantees that
//! no two executors ever hold a live attempt on the same request.

use crate::executor::{AttemptOutcome, Executor, HookDispatcher, InlineDispatcher};
use casewire_core::{Error, Mapper, Phase, Request, RequestState, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared cache of raw responses keyed by request signature
/// (endpoint plus canonically ordered parameters).
///
/// Only requests that opted in via
/// [`Request::set_uses_cached_response`](casewire_core::Request::set_uses_cached_response)
/// read from or populate the cache. A cache hit still drives the full state
/// machine: mapping, validation, and postprocessing run against the cached
/// bytes.
#[derive(Clone, Default)]
pub struct ResponseCache {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl ResponseCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the cached raw response for a signature.
    #[must_use]
    pub fn get(&self, signature: &str) -> Option<Vec<u8>> {
        lock(&self.inner).get(signature).cloned()
    }

    /// Store the raw response for a signature.
    pub fn insert(&self, signature: String, raw: Vec<u8>) {
        lock(&self.inner).insert(signature, raw);
    }

    /// Whether a signature has a cached response.
    #[must_use]
    pub fn contains(&self, signature: &str) -> bool {
        lock(&self.inner).contains_key(signature)
    }

    /// Drop every cached response.
    pub fn clear(&self) {
        lock(&self.inner).clear();
    }

    /// Number of cached responses.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }
}

/// Configuration for a [`RequestQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    concurrency: usize,
    synchronous: bool,
}

impl QueueConfig {
    /// Default configuration: one executor at a time, asynchronous dispatch.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            concurrency: 1,
            synchronous: false,
        }
    }

    /// Allow up to `concurrency` executors to run in parallel. Ordering and
    /// dependency constraints still hold; values below 1 are clamped to 1.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = if concurrency == 0 { 1 } else { concurrency };
        self
    }

    /// Start the queue in synchronous mode (see
    /// [`RequestQueue::set_synchronous`]).
    #[must_use]
    pub const fn with_synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct Entry {
    request: Request,
    deferred: bool,
}

/// What `claim_next` decided for the first eligible pending request.
enum Claim {
    /// The request was claimed (`-> Running`); run an executor for it.
    Run(Request),
    /// The request must be finalized as canceled without running.
    Cancel(Request, Error),
}

struct QueueInner {
    transport: Arc<dyn Transport>,
    mapper: Arc<dyn Mapper>,
    dispatcher: Arc<dyn HookDispatcher>,
    cache: ResponseCache,
    entries: Mutex<Vec<Entry>>,
    paused: AtomicBool,
    synchronous: AtomicBool,
    shut_down: AtomicBool,
    running: AtomicUsize,
    concurrency: usize,
    wake: Notify,
}

/// Orchestrates admission, ordering, pausing, caching, and dispatch of
/// requests to a transport.
///
/// Cloning the queue is cheap; all clones share the same state.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    /// Create a queue with the default configuration and inline hook
    /// dispatch.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, mapper: Arc<dyn Mapper>) -> Self {
        Self::with_dispatcher(transport, mapper, QueueConfig::new(), Arc::new(InlineDispatcher))
    }

    /// Create a queue with a custom configuration.
    #[must_use]
    pub fn with_config(
        transport: Arc<dyn Transport>,
        mapper: Arc<dyn Mapper>,
        config: QueueConfig,
    ) -> Self {
        Self::with_dispatcher(transport, mapper, config, Arc::new(InlineDispatcher))
    }

    /// Create a queue with a custom configuration and hook dispatcher.
    #[must_use]
    pub fn with_dispatcher(
        transport: Arc<dyn Transport>,
        mapper: Arc<dyn Mapper>,
        config: QueueConfig,
        dispatcher: Arc<dyn HookDispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                transport,
                mapper,
                dispatcher,
                cache: ResponseCache::new(),
                entries: Mutex::new(Vec::new()),
                paused: AtomicBool::new(false),
                synchronous: AtomicBool::new(config.synchronous),
                shut_down: AtomicBool::new(false),
                running: AtomicUsize::new(0),
                concurrency: config.concurrency,
                wake: Notify::new(),
            }),
        }
    }

    /// The queue's response cache.
    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.inner.cache
    }

    /// Admit a request and schedule it for execution.
    ///
    /// In synchronous mode this does not return until the request reaches a
    /// terminal state; otherwise it returns immediately after admission.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyQueued`] if the request is not `Unqueued` or is
    ///   already recorded by this queue (recycle a finished request before
    ///   enqueueing it again).
    /// - [`Error::InvalidState`] if the queue has been shut down, or if a
    ///   synchronous enqueue stalls because a dependency of the request was
    ///   never admitted (the request itself stays `Enqueued`).
    #[tracing::instrument(skip_all, fields(request = %request.id()))]
    pub async fn enqueue(&self, request: &Request) -> Result<(), Error> {
        self.admit(request, false)?;
        if self.inner.synchronous.load(Ordering::Acquire) {
            Self::drive_synchronously(&self.inner, request).await?;
        } else {
            Self::pump(&self.inner);
        }
        Ok(())
    }

    /// Record a request without admitting it: it stays `Unqueued` until
    /// [`activate_deferred`](Self::activate_deferred) fires. Supports
    /// building a batch before starting any of it.
    ///
    /// # Errors
    ///
    /// Same contract as [`enqueue`](Self::enqueue).
    pub fn enqueue_deferred(&self, request: &Request) -> Result<(), Error> {
        self.admit(request, true)
    }

    /// Promote every deferred request to `Enqueued`, in admission order, and
    /// resume dispatch. In synchronous mode this drives each activated
    /// request to a terminal state before returning.
    ///
    /// # Errors
    ///
    /// In synchronous mode, [`Error::InvalidState`] if driving an activated
    /// request stalls because one of its dependencies was never admitted.
    pub async fn activate_deferred(&self) -> Result<(), Error> {
        let activated: Vec<Request> = {
            let mut entries = lock(&self.inner.entries);
            entries
                .iter_mut()
                .filter(|entry| entry.deferred)
                .map(|entry| {
                    entry.deferred = false;
                    entry.request.clone()
                })
                .collect()
        };
        for request in &activated {
            if request.begin_enqueued().is_ok() {
                tracing::debug!(request = %request.id(), "deferred request activated");
                Self::dispatch_hook(&self.inner, request, Phase::Enqueued);
            }
        }
        if self.inner.synchronous.load(Ordering::Acquire) {
            for request in &activated {
                Self::drive_synchronously(&self.inner, request).await?;
            }
        } else {
            Self::pump(&self.inner);
        }
        Ok(())
    }

    /// While paused, no pending request transitions to `Running`;
    /// already-running attempts finish normally. Unpausing resumes dispatch
    /// of the next eligible request.
    pub fn set_paused(&self, paused: bool) {
        self.inner.paused.store(paused, Ordering::Release);
        if !paused {
            self.inner.wake.notify_waiters();
            Self::pump(&self.inner);
        }
    }

    /// Whether dispatch is paused.
    #[must_use]
    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// In synchronous mode, [`enqueue`](Self::enqueue) blocks the caller
    /// until the enqueued request is terminal. Intended for deterministic
    /// testing.
    pub fn set_synchronous(&self, synchronous: bool) {
        self.inner.synchronous.store(synchronous, Ordering::Release);
        if !synchronous {
            Self::pump(&self.inner);
        }
    }

    /// Whether synchronous mode is on.
    #[must_use]
    pub fn synchronous(&self) -> bool {
        self.inner.synchronous.load(Ordering::Acquire)
    }

    /// Cancel a request and, eagerly, every request that transitively
    /// depends on it. Dependents are canceled (with
    /// [`Error::DependencyCanceled`]) before any of them can start,
    /// regardless of cancellation timing; the target itself is canceled with
    /// [`Error::Canceled`].
    ///
    /// A request that is already `Running` is not forcibly aborted: intent
    /// is marked and the terminal commit reroutes to `Canceled`.
    #[tracing::instrument(skip_all, fields(request = %request.id()))]
    pub fn cancel(&self, request: &Request) {
        let inner = &self.inner;
        let dependents = Self::transitive_dependents(inner, request);

        // Mark intent on the whole set first so dispatch cannot start any of
        // them between the finalization steps below.
        request.request_cancellation();
        for dependent in &dependents {
            dependent.request_cancellation();
        }

        for dependent in &dependents {
            Self::cancel_one(inner, dependent, Error::DependencyCanceled);
        }
        Self::cancel_one(inner, request, Error::Canceled);
        Self::pump(inner);
    }

    /// Cancel every admitted request that is not currently running.
    pub fn cancel_pending(&self) {
        let pending: Vec<Request> = lock(&self.inner.entries)
            .iter()
            .filter(|entry| entry.request.state() != RequestState::Running)
            .map(|entry| entry.request.clone())
            .collect();
        for request in &pending {
            request.request_cancellation();
        }
        for request in &pending {
            Self::cancel_one(&self.inner, request, Error::Canceled);
        }
    }

    /// Tear the queue down: stop admitting, cancel every non-terminal
    /// request (running attempts resolve cooperatively), and wait until the
    /// queue is idle. Every request that ever left `Unqueued` still fires
    /// `on_ended` exactly once.
    #[tracing::instrument(skip_all)]
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        let admitted: Vec<Request> = lock(&self.inner.entries)
            .iter()
            .map(|entry| entry.request.clone())
            .collect();
        for request in &admitted {
            request.request_cancellation();
        }
        for request in &admitted {
            if request.state() != RequestState::Running {
                Self::cancel_one(&self.inner, request, Error::Canceled);
            }
        }
        self.wait_idle().await;
        tracing::debug!("queue shut down");
    }

    /// Wait until no admitted request is `Enqueued`, `Running`, or
    /// `Reenqueued`.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.wake.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Whether no admitted request is awaiting or undergoing execution.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        if self.inner.running.load(Ordering::Acquire) > 0 {
            return false;
        }
        !lock(&self.inner.entries).iter().any(|entry| {
            matches!(
                entry.request.state(),
                RequestState::Enqueued | RequestState::Running | RequestState::Reenqueued
            )
        })
    }

    fn admit(&self, request: &Request, deferred: bool) -> Result<(), Error> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(Error::invalid_state("queue is shut down"));
        }
        {
            let mut entries = lock(&self.inner.entries);
            if entries.iter().any(|entry| entry.request == *request) {
                return Err(Error::AlreadyQueued);
            }
            if deferred {
                if request.state() != RequestState::Unqueued {
                    return Err(Error::AlreadyQueued);
                }
            } else {
                request.begin_enqueued()?;
            }
            entries.push(Entry {
                request: request.clone(),
                deferred,
            });
        }
        if !deferred {
            tracing::debug!(request = %request.id(), "request enqueued");
            Self::dispatch_hook(&self.inner, request, Phase::Enqueued);
        }
        Ok(())
    }

    /// Dispatch eligible requests onto executor tasks until the concurrency
    /// limit is reached or nothing is eligible.
    fn pump(inner: &Arc<QueueInner>) {
        loop {
            if inner.shut_down.load(Ordering::Acquire)
                || inner.paused.load(Ordering::Acquire)
                || inner.synchronous.load(Ordering::Acquire)
            {
                return;
            }
            // Reserve an executor slot before selecting.
            let reserved = inner.running.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |running| (running < inner.concurrency).then_some(running + 1),
            );
            if reserved.is_err() {
                return;
            }
            match Self::claim_next(inner) {
                None => {
                    inner.running.fetch_sub(1, Ordering::AcqRel);
                    inner.wake.notify_waiters();
                    return;
                }
                Some(Claim::Cancel(request, error)) => {
                    inner.running.fetch_sub(1, Ordering::AcqRel);
                    Self::finalize_cancel(inner, &request, error);
                }
                Some(Claim::Run(request)) => {
                    let inner = Arc::clone(inner);
                    tokio::spawn(async move {
                        let executor = Executor::new(
                            request.clone(),
                            Arc::clone(&inner.transport),
                            Arc::clone(&inner.mapper),
                            Arc::clone(&inner.dispatcher),
                            inner.cache.clone(),
                        );
                        let outcome = executor.run().await;
                        if matches!(outcome, AttemptOutcome::Terminal) {
                            Self::retire(&inner, &request);
                        }
                        inner.running.fetch_sub(1, Ordering::AcqRel);
                        inner.wake.notify_waiters();
                        Self::pump(&inner);
                    });
                }
            }
        }
    }

    /// Run pending requests on the caller's task until `target` is terminal.
    async fn drive_synchronously(inner: &Arc<QueueInner>, target: &Request) -> Result<(), Error> {
        while !target.state().is_terminal() {
            if inner.paused.load(Ordering::Acquire) {
                let notified = inner.wake.notified();
                if inner.paused.load(Ordering::Acquire) {
                    notified.await;
                }
                continue;
            }
            match Self::claim_next(inner) {
                Some(Claim::Cancel(request, error)) => {
                    Self::finalize_cancel(inner, &request, error);
                }
                Some(Claim::Run(request)) => {
                    let executor = Executor::new(
                        request.clone(),
                        Arc::clone(&inner.transport),
                        Arc::clone(&inner.mapper),
                        Arc::clone(&inner.dispatcher),
                        inner.cache.clone(),
                    );
                    let outcome = executor.run().await;
                    if matches!(outcome, AttemptOutcome::Terminal) {
                        Self::retire(inner, &request);
                    }
                }
                None => {
                    // Nothing is claimable and the target is not terminal:
                    // one of its dependencies was never admitted, so no
                    // amount of synchronous driving can resolve it.
                    tracing::warn!(
                        request = %target.id(),
                        "synchronous enqueue stalled with no eligible request"
                    );
                    return Err(Error::invalid_state(format!(
                        "synchronous enqueue of {} stalled: a dependency was never admitted",
                        target.id()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Select and claim the first eligible pending request, atomically with
    /// its `-> Running` transition.
    fn claim_next(inner: &Arc<QueueInner>) -> Option<Claim> {
        let entries = lock(&inner.entries);
        for entry in entries.iter() {
            if entry.deferred {
                continue;
            }
            if !matches!(
                entry.request.state(),
                RequestState::Enqueued | RequestState::Reenqueued
            ) {
                continue;
            }
            if entry.request.cancel_requested() {
                return Some(Claim::Cancel(entry.request.clone(), Error::Canceled));
            }
            let dependencies = entry.request.dependencies();
            if dependencies
                .iter()
                .any(|dep| matches!(dep.state(), RequestState::Canceled | RequestState::Failed))
            {
                return Some(Claim::Cancel(
                    entry.request.clone(),
                    Error::DependencyCanceled,
                ));
            }
            if dependencies.iter().any(|dep| !dep.state().is_terminal()) {
                // Dependency unresolved; keep the slot, skip for now.
                continue;
            }
            if entry.request.begin_running().is_ok() {
                return Some(Claim::Run(entry.request.clone()));
            }
        }
        None
    }

    /// Resolve a not-running request to `Canceled`, firing its hooks, and
    /// drop its entry. Deferred requests that never left `Unqueued` are
    /// dropped silently (no phase ever fired for them).
    fn finalize_cancel(inner: &Arc<QueueInner>, request: &Request, error: Error) {
        if request.cancel_terminal(error).is_ok() {
            tracing::debug!(request = %request.id(), "request canceled before running");
            Self::dispatch_hook(inner, request, Phase::Cancel);
            Self::dispatch_hook(inner, request, Phase::Ended);
        }
        Self::remove_entry(inner, request);
        inner.wake.notify_waiters();
    }

    fn cancel_one(inner: &Arc<QueueInner>, request: &Request, error: Error) {
        match request.state() {
            RequestState::Enqueued | RequestState::Reenqueued | RequestState::Unqueued => {
                Self::finalize_cancel(inner, request, error);
            }
            // Intent already marked; the terminal commit reroutes and the
            // entry retires through the normal path.
            RequestState::Running => {}
            _ => Self::remove_entry(inner, request),
        }
    }

    /// Admitted requests that transitively depend on `target`, in admission
    /// order.
    fn transitive_dependents(inner: &Arc<QueueInner>, target: &Request) -> Vec<Request> {
        let admitted: Vec<Request> = lock(&inner.entries)
            .iter()
            .map(|entry| entry.request.clone())
            .collect();
        let mut canceled_ids = vec![target.id()];
        let mut dependents: Vec<Request> = Vec::new();
        loop {
            let mut changed = false;
            for request in &admitted {
                if canceled_ids.contains(&request.id()) {
                    continue;
                }
                if request
                    .dependencies()
                    .iter()
                    .any(|dep| canceled_ids.contains(&dep.id()))
                {
                    canceled_ids.push(request.id());
                    dependents.push(request.clone());
                    changed = true;
                }
            }
            if !changed {
                return dependents;
            }
        }
    }

    fn retire(inner: &Arc<QueueInner>, request: &Request) {
        tracing::debug!(
            request = %request.id(),
            state = %request.state(),
            "request retired"
        );
        Self::remove_entry(inner, request);
        inner.wake.notify_waiters();
    }

    fn remove_entry(inner: &Arc<QueueInner>, request: &Request) {
        lock(&inner.entries).retain(|entry| entry.request != *request);
    }

    fn dispatch_hook(inner: &Arc<QueueInner>, request: &Request, phase: Phase) {
        if let Some(hook) = request.capture_hook(phase) {
            inner.dispatcher.dispatch(request, &hook);
        }
    }
}
