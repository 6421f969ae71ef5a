//! # Asynchronous RPC Engine
//!
//! Purpose: Track many concurrent in-flight requests, resend them when the
//! service dies, and deliver each result exactly once through a callback,
//! a completion future, or a blocking `receive`.
//!
//! ## Design Principles
//!
//! 1. **Registry Keyed By Channel**: The worklist maps reply channels to
//!    pending requests. Atomic `remove` is the only way a request leaves it,
//!    so whoever removes a request owns its completion.
//! 2. **O(1) Critical Sections**: The worklist mutex covers map operations
//!    only; sending, decoding, and callbacks run unlocked.
//! 3. **Shared Retry Budget**: The first send and every resend after a death
//!    notice draw from the same `max_attempts` budget.
//! 4. **Mismatches Are Harmless**: Messages for untracked channels are
//!    dropped (releasing any out-of-line memory) and reported, never raised.
//!
//! ## Request Lifecycle
//!
//! ```text
//! start ──> CREATED ──send──> SENT ──┬── Reply ───> COMPLETED (callback once)
//!                                    ├── DeadName ─> resend ─> SENT
//!                                    │               (budget spent ─> COMPLETED(Err))
//!                                    └── cancel ───> CANCELLED (no callback)
//! ```

use std::sync::Arc;

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use li_common::{ChannelId, KvArray, Kvbuf, LiError, LiResult, Message, ProcedureId, ServiceHandle};

use crate::endpoint::Endpoint;

/// Terminal result of an async request.
pub type LookupResult = LiResult<Option<KvArray>>;

/// Completion callback; the closure carries whatever context it needs.
pub type Callback = Box<dyn FnOnce(LookupResult) + Send>;

/// What `handle_reply` did with a message.
#[derive(Debug)]
pub enum ReplyOutcome {
    /// The request completed and its callback ran.
    Delivered,
    /// The request completed; it has no callback, so the result is returned.
    Ready(LookupResult),
    /// The service died; the request was resent and is still pending.
    Resent,
    /// No tracked request matched the channel.
    Mismatch,
}

/// One outstanding request.
struct PendingRequest {
    procedure_name: Arc<str>,
    procedure: ProcedureId,
    service: ServiceHandle,
    request: Bytes,
    attempts: u32,
    callback: Option<Callback>,
}

/// Engine tracking in-flight requests on one endpoint.
#[derive(Clone)]
pub struct AsyncEngine {
    endpoint: Arc<Endpoint>,
    worklist: Arc<Mutex<HashMap<ChannelId, PendingRequest, RandomState>>>,
}

#[derive(Clone, Copy)]
enum Delivery {
    Callback,
    Return,
}

impl AsyncEngine {
    pub(crate) fn new(endpoint: Arc<Endpoint>) -> Self {
        AsyncEngine {
            endpoint,
            worklist: Arc::new(Mutex::new(HashMap::default())),
        }
    }

    /// Starts a request whose result is handed to `callback`.
    ///
    /// The returned channel is where replies and death notices arrive; the
    /// caller owns waiting on it and feeding messages to `handle_reply`.
    pub fn start(
        &self,
        procedure: &str,
        request: &Kvbuf,
        callback: impl FnOnce(LookupResult) + Send + 'static,
    ) -> LiResult<ChannelId> {
        self.start_inner(procedure, request, Some(Box::new(callback)))
    }

    /// Starts a request whose result will be collected with `receive`.
    pub fn start_blocking(&self, procedure: &str, request: &Kvbuf) -> LiResult<ChannelId> {
        self.start_inner(procedure, request, None)
    }

    /// Starts a request and returns a future resolving to its result.
    ///
    /// The receiver reports an error if the request is cancelled.
    pub fn start_with_completion(
        &self,
        procedure: &str,
        request: &Kvbuf,
    ) -> LiResult<(ChannelId, oneshot::Receiver<LookupResult>)> {
        let (tx, rx) = oneshot::channel();
        let channel = self.start(procedure, request, move |result| {
            // Receiver may have been dropped; nothing to do then.
            let _ = tx.send(result);
        })?;
        Ok((channel, rx))
    }

    /// Number of requests currently in the worklist.
    pub fn pending(&self) -> usize {
        self.worklist.lock().len()
    }

    /// Processes one message from a reply channel.
    pub fn handle_reply(&self, message: Message) -> ReplyOutcome {
        self.process(message, Delivery::Callback)
    }

    /// Blocks on `channel` until its request completes, resending on deaths.
    ///
    /// Any callback registered for the request is dropped without running.
    /// A transport failure while waiting is terminal: the request leaves the
    /// worklist and its channel is released before the error is returned.
    pub fn receive(&self, channel: ChannelId) -> LookupResult {
        loop {
            let message = match self.endpoint.transport().receive(channel) {
                Ok(message) => message,
                Err(err) => {
                    let removed = self.worklist.lock().remove(&channel);
                    if let Some(pending) = removed {
                        drop(pending);
                        self.endpoint.transport().release_channel(channel);
                        self.endpoint.stats().record_async_complete();
                        warn!(
                            channel = %channel,
                            error = %err,
                            "receive failed; request abandoned"
                        );
                    }
                    return Err(err);
                }
            };
            match self.process(message, Delivery::Return) {
                ReplyOutcome::Ready(result) => return result,
                ReplyOutcome::Resent => continue,
                ReplyOutcome::Delivered | ReplyOutcome::Mismatch => {
                    return Err(LiError::ProtocolMismatch)
                }
            }
        }
    }

    /// Cancels the request on `channel`.
    ///
    /// Returns true if a pending request was removed; only then is the
    /// channel released, so repeated or late cancels are no-ops.
    pub fn cancel(&self, channel: ChannelId) -> bool {
        let removed = self.worklist.lock().remove(&channel);
        match removed {
            Some(pending) => {
                drop(pending);
                self.endpoint.transport().release_channel(channel);
                self.endpoint.stats().record_async_cancel();
                debug!(channel = %channel, "async request cancelled");
                true
            }
            None => {
                trace!(channel = %channel, "cancel for untracked channel");
                false
            }
        }
    }

    fn start_inner(
        &self,
        procedure: &str,
        request: &Kvbuf,
        callback: Option<Callback>,
    ) -> LiResult<ChannelId> {
        if request.is_failed() {
            return Err(LiError::AllocationFailed);
        }
        let max = self.endpoint.config().max_inline_request;
        if request.len() > max {
            return Err(LiError::RequestTooLarge {
                len: request.len(),
                max,
            });
        }

        let service = self.endpoint.handle()?;
        let id = self.endpoint.procedure(service, procedure)?;
        let transport = self.endpoint.transport();
        let channel = transport.allocate_channel()?;
        if let Err(err) = transport.request_death_notification(channel) {
            transport.release_channel(channel);
            return Err(err);
        }

        let body = Bytes::copy_from_slice(request.as_bytes());
        self.worklist.lock().insert(
            channel,
            PendingRequest {
                procedure_name: Arc::from(procedure),
                procedure: id,
                service,
                request: body.clone(),
                attempts: 1,
                callback,
            },
        );
        self.endpoint.stats().record_async_start();
        self.endpoint.stats().record_attempt();

        match transport.send_async(service, channel, id, &body) {
            Ok(()) => Ok(channel),
            Err(err) if err.is_retryable() => {
                debug!(channel = %channel, procedure, error = %err, "service died during send");
                match self.resend(channel, service) {
                    ResendOutcome::Sent => Ok(channel),
                    ResendOutcome::Gone => Err(LiError::ProtocolMismatch),
                    ResendOutcome::Failed(pending, err) => {
                        drop(pending);
                        transport.release_channel(channel);
                        Err(err)
                    }
                }
            }
            Err(err) => {
                if self.worklist.lock().remove(&channel).is_some() {
                    transport.release_channel(channel);
                }
                Err(err)
            }
        }
    }

    fn process(&self, message: Message, delivery: Delivery) -> ReplyOutcome {
        match message {
            Message::DeadName { channel } => {
                let (service, procedure) = {
                    let worklist = self.worklist.lock();
                    match worklist.get(&channel) {
                        Some(pending) => (pending.service, pending.procedure),
                        None => return self.mismatch(channel),
                    }
                };
                debug!(channel = %channel, procedure = %procedure, "death notice; resending");
                match self.resend(channel, service) {
                    ResendOutcome::Sent => ReplyOutcome::Resent,
                    ResendOutcome::Gone => self.mismatch(channel),
                    ResendOutcome::Failed(pending, err) => {
                        self.endpoint.transport().release_channel(channel);
                        self.complete(pending, Err(err), delivery)
                    }
                }
            }
            Message::Reply { channel, reply } => {
                let removed = self.worklist.lock().remove(&channel);
                let Some(pending) = removed else {
                    drop(reply);
                    return self.mismatch(channel);
                };
                self.endpoint.transport().release_channel(channel);
                let result = self.endpoint.accept(reply);
                self.complete(pending, result, delivery)
            }
        }
    }

    /// Resends the request on `channel` after the service behind `died`
    /// went away, drawing from the request's retry budget.
    ///
    /// On `Failed` the request has already been removed from the worklist.
    fn resend(&self, channel: ChannelId, died: ServiceHandle) -> ResendOutcome {
        let endpoint = &self.endpoint;
        let max_attempts = endpoint.config().max_attempts;
        let mut died = died;

        loop {
            endpoint.invalidate(died);

            // Reserve one attempt, or take the request out if none are left.
            let (name, body, attempt) = {
                let mut worklist = self.worklist.lock();
                let Some(pending) = worklist.get_mut(&channel) else {
                    return ResendOutcome::Gone;
                };
                if pending.attempts >= max_attempts {
                    let attempts = pending.attempts;
                    return match worklist.remove(&channel) {
                        Some(pending) => {
                            warn!(channel = %channel, attempts, "async retry budget exhausted");
                            ResendOutcome::Failed(pending, LiError::RetriesExhausted { attempts })
                        }
                        None => ResendOutcome::Gone,
                    };
                }
                pending.attempts += 1;
                (
                    Arc::clone(&pending.procedure_name),
                    pending.request.clone(),
                    pending.attempts,
                )
            };
            endpoint.stats().record_retry();
            endpoint.stats().record_attempt();

            let service = match endpoint.handle() {
                Ok(service) => service,
                Err(err) => return self.take_failed(channel, err),
            };
            let sent = endpoint.procedure(service, &name).and_then(|id| {
                if let Some(pending) = self.worklist.lock().get_mut(&channel) {
                    pending.service = service;
                    pending.procedure = id;
                }
                endpoint.transport().send_async(service, channel, id, &body)
            });

            match sent {
                Ok(()) => {
                    trace!(channel = %channel, attempt, "request resent");
                    return ResendOutcome::Sent;
                }
                Err(err) if err.is_retryable() => {
                    trace!(channel = %channel, attempt, error = %err, "resend hit a dead service");
                    died = service;
                }
                Err(err) => return self.take_failed(channel, err),
            }
        }
    }

    /// Removes the request for a terminal failure, if it is still tracked.
    fn take_failed(&self, channel: ChannelId, err: LiError) -> ResendOutcome {
        match self.worklist.lock().remove(&channel) {
            Some(pending) => ResendOutcome::Failed(pending, err),
            None => ResendOutcome::Gone,
        }
    }

    fn complete(
        &self,
        mut pending: PendingRequest,
        result: LookupResult,
        delivery: Delivery,
    ) -> ReplyOutcome {
        self.endpoint.stats().record_async_complete();
        match (delivery, pending.callback.take()) {
            (Delivery::Callback, Some(callback)) => {
                callback(result);
                ReplyOutcome::Delivered
            }
            _ => ReplyOutcome::Ready(result),
        }
    }

    fn mismatch(&self, channel: ChannelId) -> ReplyOutcome {
        self.endpoint.stats().record_mismatch();
        trace!(channel = %channel, "message for untracked channel dropped");
        ReplyOutcome::Mismatch
    }
}

enum ResendOutcome {
    Sent,
    Gone,
    Failed(PendingRequest, LiError),
}

impl std::fmt::Debug for AsyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncEngine")
            .field("pending", &self.pending())
            .finish()
    }
}
