//! One attempt at satisfying a request.
//!
//! An [`Executor`] is transient: the queue creates one per attempt, and a
//! reenqueued request always gets a fresh one after the prior executor has
//! fully retired. The executor performs the fetch (or cache probe), drives
//! the mapping/validation/postprocessing pipeline, commits the terminal
//! transition, and funnels every hook invocation through the
//! [`HookDispatcher`] indirection.
//!
//! Cancellation is cooperative: an in-flight transport call is never
//! forcibly aborted. The terminal commit itself observes cancellation intent
//! under the request's lifecycle lock and reroutes to `Canceled`, discarding
//! an already-completed fetch if necessary.

use crate::queue::ResponseCache;
use casewire_core::request::Commit;
use casewire_core::{Error, Hook, Mapper, Phase, Request, Transport};
use std::sync::Arc;

/// Decides *where* lifecycle hooks run; the executor decides *when*.
///
/// The default [`InlineDispatcher`] invokes hooks in the execution context
/// that drove the transition. Override this to marshal hooks onto another
/// context (a UI event loop or a dedicated callback task) without altering
/// firing order or the exactly-once guarantee.
pub trait HookDispatcher: Send + Sync {
    /// Invoke `hook` for `request`.
    fn dispatch(&self, request: &Request, hook: &Hook);
}

/// Dispatcher that invokes hooks in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDispatcher;

impl HookDispatcher for InlineDispatcher {
    fn dispatch(&self, request: &Request, hook: &Hook) {
        hook(request);
    }
}

/// What the queue should do with the request after an attempt.
pub(crate) enum AttemptOutcome {
    /// The request reached a terminal state; retire its entry.
    Terminal,
    /// The request was put back (`Reenqueued`); dispatch it again later with
    /// a fresh executor.
    Reenqueue,
}

pub(crate) struct Executor {
    request: Request,
    transport: Arc<dyn Transport>,
    mapper: Arc<dyn Mapper>,
    dispatcher: Arc<dyn HookDispatcher>,
    cache: ResponseCache,
}

impl Executor {
    pub(crate) fn new(
        request: Request,
        transport: Arc<dyn Transport>,
        mapper: Arc<dyn Mapper>,
        dispatcher: Arc<dyn HookDispatcher>,
        cache: ResponseCache,
    ) -> Self {
        Self {
            request,
            transport,
            mapper,
            dispatcher,
            cache,
        }
    }

    /// Perform one attempt. The request is already `Running`: the queue
    /// claims the `Enqueued|Reenqueued -> Running` transition atomically with
    /// dispatch selection, so no two executors can ever hold a live attempt
    /// on the same request.
    #[tracing::instrument(
        skip(self),
        name = "executor_run",
        fields(request = %self.request.id(), attempt = self.request.attempt())
    )]
    pub(crate) async fn run(&self) -> AttemptOutcome {
        let request = &self.request;

        if request.cancel_requested() {
            self.finish_canceled(Error::Canceled);
            return AttemptOutcome::Terminal;
        }

        self.fire(Phase::BeforeStart);

        let descriptor = request.descriptor();
        let signature = descriptor.signature();
        let cached = if request.uses_cached_response() {
            self.cache.get(&signature)
        } else {
            None
        };

        let (raw, from_cache) = match cached {
            Some(bytes) => {
                tracing::debug!(request = %request.id(), "serving request from response cache");
                (bytes, true)
            }
            None => match self.transport.send(&descriptor).await {
                Ok(bytes) => (bytes, false),
                Err(transport_error) => {
                    tracing::debug!(
                        request = %request.id(),
                        error = %transport_error,
                        "transport call failed"
                    );
                    self.commit_failure(Error::Transport(transport_error));
                    return AttemptOutcome::Terminal;
                }
            },
        };

        if request.record_fetch(raw.clone(), from_cache).is_err() {
            return AttemptOutcome::Terminal;
        }

        let mapped = match self.mapper.map(&raw) {
            Ok(value) => value,
            Err(error) => {
                self.commit_failure(error);
                return AttemptOutcome::Terminal;
            }
        };
        if request.record_mapped(mapped.clone()).is_err() {
            return AttemptOutcome::Terminal;
        }

        let handler = request.handler();
        if let Err(error) = handler.validate(&mapped) {
            if !request.cancel_requested()
                && handler.should_reenqueue(&error, request.attempt())
                && request.reenqueue().is_ok()
            {
                tracing::debug!(
                    request = %request.id(),
                    error = %error,
                    "request reenqueued for another attempt"
                );
                return AttemptOutcome::Reenqueue;
            }
            self.commit_failure(error);
            return AttemptOutcome::Terminal;
        }

        if !from_cache && request.uses_cached_response() {
            self.cache.insert(signature, raw);
        }

        let processed = handler.process(&mapped);
        match request.complete(processed) {
            Ok(Commit::Landed) => {
                self.fire(Phase::Success);
                self.fire(Phase::Ended);
            }
            // The fetch succeeded but the caller no longer wants it; the
            // commit observed the intent and landed in `Canceled`.
            Ok(Commit::RoutedToCancel) => {
                self.fire(Phase::Cancel);
                self.fire(Phase::Ended);
            }
            Err(_) => {}
        }
        AttemptOutcome::Terminal
    }

    /// Commit a failure. The commit itself reroutes to `Canceled` when
    /// cancellation intent was set while the attempt was in flight.
    fn commit_failure(&self, error: Error) {
        match self.request.fail(error) {
            Ok(Commit::Landed) => {
                self.fire(Phase::Failure);
                self.fire(Phase::Ended);
            }
            Ok(Commit::RoutedToCancel) => {
                self.fire(Phase::Cancel);
                self.fire(Phase::Ended);
            }
            Err(_) => {}
        }
    }

    fn finish_canceled(&self, error: Error) {
        if self.request.cancel_terminal(error).is_ok() {
            self.fire(Phase::Cancel);
            self.fire(Phase::Ended);
        }
    }

    fn fire(&self, phase: Phase) {
        if let Some(hook) = self.request.capture_hook(phase) {
            self.dispatcher.dispatch(&self.request, &hook);
        }
    }
}
