//! # Loopback Transport
//!
//! Purpose: An in-process stand-in for the directory service, scriptable
//! enough to exercise every engine path: unavailability, server restarts,
//! inline and out-of-line replies, foreign senders, and death notices.
//!
//! ## Design Principles
//!
//! 1. **Same Contract**: Implements `Transport` exactly as a real binding
//!    would, including generation-scoped handles and procedure ids.
//! 2. **Observable Resources**: Counters track channels and out-of-line
//!    regions so tests can assert that every resource is released once.
//! 3. **Responders Run Unlocked**: Procedure handlers execute with the state
//!    mutex released.
//!
//! ## Procedure Ids
//!
//! ```text
//! id = generation * PROCEDURE_STRIDE + (index + 1)
//! ```
//!
//! A restart bumps the generation, so ids linked before it stop resolving.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use li_common::{
    ChannelId, Credential, LiError, LiResult, Message, OutOfLine, ProcedureId, Reply,
    ServiceHandle,
};

use crate::transport::{SendMode, Transport};

/// Spacing between procedure-id generations.
pub const PROCEDURE_STRIDE: u32 = 1000;

/// Default time `receive` waits for a message.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Handler turning request bytes into reply bytes.
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Shape of replies produced by the loopback service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    Inline,
    OutOfLine,
}

#[derive(Default)]
struct ChannelState {
    queue: VecDeque<Message>,
    death_notify: bool,
}

struct LoopState {
    available: bool,
    generation: u64,
    pending_deaths: u32,
    procedures: Vec<(String, Responder)>,
    reply_mode: ReplyMode,
    sender: Credential,
    hold_replies: bool,
    next_channel: u64,
    channels: HashMap<ChannelId, ChannelState, RandomState>,
}

#[derive(Default)]
struct Counters {
    lookups: AtomicUsize,
    calls: AtomicUsize,
    async_sends: AtomicUsize,
    ool_requests: AtomicUsize,
    ool_replies: AtomicUsize,
    ool_released: Arc<AtomicUsize>,
    channels_allocated: AtomicUsize,
    channels_released: AtomicUsize,
    double_releases: AtomicUsize,
}

/// Scriptable in-process directory service.
pub struct LoopbackTransport {
    state: Mutex<LoopState>,
    arrived: Condvar,
    counters: Counters,
    receive_timeout: Duration,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        LoopbackTransport::new()
    }
}

impl LoopbackTransport {
    /// Creates an available service with no procedures.
    pub fn new() -> Self {
        LoopbackTransport {
            state: Mutex::new(LoopState {
                available: true,
                generation: 1,
                pending_deaths: 0,
                procedures: Vec::new(),
                reply_mode: ReplyMode::Inline,
                sender: Credential::ROOT,
                hold_replies: false,
                next_channel: 0,
                channels: HashMap::default(),
            }),
            arrived: Condvar::new(),
            counters: Counters::default(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }

    /// Changes how long `receive` waits before failing.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Exports `name`, replacing any earlier handler.
    pub fn serve(&self, name: &str, responder: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) {
        let responder: Responder = Arc::new(responder);
        let mut state = self.state.lock();
        match state.procedures.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = responder,
            None => state.procedures.push((name.to_string(), responder)),
        }
    }

    /// Makes the service (un)reachable.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// The next `count` calls or sends report a server death.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().pending_deaths = count;
    }

    /// Simulates a server restart; returns how many death notices were queued.
    pub fn restart(&self) -> usize {
        let mut state = self.state.lock();
        state.generation += 1;
        let mut queued = 0;
        for (channel, entry) in state.channels.iter_mut() {
            if entry.death_notify {
                entry.queue.push_back(Message::DeadName { channel: *channel });
                queued += 1;
            }
        }
        drop(state);
        self.arrived.notify_all();
        queued
    }

    pub fn set_reply_mode(&self, mode: ReplyMode) {
        self.state.lock().reply_mode = mode;
    }

    /// Signs subsequent replies with `uid`.
    pub fn set_sender_uid(&self, uid: u32) {
        self.state.lock().sender = Credential::for_uid(uid);
    }

    /// While set, async sends succeed but queue no reply.
    pub fn hold_replies(&self, hold: bool) {
        self.state.lock().hold_replies = hold;
    }

    /// Queues a death notice on `channel`; false if the channel is unknown.
    pub fn inject_death(&self, channel: ChannelId) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.channels.get_mut(&channel) else {
            return false;
        };
        entry.queue.push_back(Message::DeadName { channel });
        drop(state);
        self.arrived.notify_all();
        true
    }

    /// Pops the next queued message without waiting.
    pub fn try_receive(&self, channel: ChannelId) -> Option<Message> {
        self.state
            .lock()
            .channels
            .get_mut(&channel)
            .and_then(|entry| entry.queue.pop_front())
    }

    /// Messages waiting on `channel`.
    pub fn queued(&self, channel: ChannelId) -> usize {
        self.state
            .lock()
            .channels
            .get(&channel)
            .map_or(0, |entry| entry.queue.len())
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn lookups(&self) -> usize {
        self.counters.lookups.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.counters.calls.load(Ordering::SeqCst)
    }

    pub fn async_sends(&self) -> usize {
        self.counters.async_sends.load(Ordering::SeqCst)
    }

    pub fn ool_requests(&self) -> usize {
        self.counters.ool_requests.load(Ordering::SeqCst)
    }

    pub fn ool_replies(&self) -> usize {
        self.counters.ool_replies.load(Ordering::SeqCst)
    }

    pub fn ool_released(&self) -> usize {
        self.counters.ool_released.load(Ordering::SeqCst)
    }

    pub fn channels_allocated(&self) -> usize {
        self.counters.channels_allocated.load(Ordering::SeqCst)
    }

    pub fn channels_released(&self) -> usize {
        self.counters.channels_released.load(Ordering::SeqCst)
    }

    pub fn double_releases(&self) -> usize {
        self.counters.double_releases.load(Ordering::SeqCst)
    }

    /// Common gate for `call` and `send_async`.
    fn admit(&self, state: &mut LoopState, service: ServiceHandle) -> LiResult<()> {
        if !state.available {
            return Err(LiError::TransportUnavailable);
        }
        if service.generation != state.generation {
            return Err(LiError::TransportDied);
        }
        if state.pending_deaths > 0 {
            state.pending_deaths -= 1;
            state.generation += 1;
            trace!(generation = state.generation, "loopback service restarted");
            return Err(LiError::TransportDied);
        }
        Ok(())
    }

    fn responder(state: &LoopState, procedure: ProcedureId) -> LiResult<Responder> {
        let id = procedure.get();
        if u64::from(id / PROCEDURE_STRIDE) != state.generation {
            return Err(LiError::TransportDied);
        }
        let index = (id % PROCEDURE_STRIDE) as usize;
        index
            .checked_sub(1)
            .and_then(|index| state.procedures.get(index))
            .map(|(_, responder)| Arc::clone(responder))
            .ok_or_else(|| LiError::Transport(format!("unknown {procedure}")))
    }

    fn make_reply(&self, sender: Credential, mode: ReplyMode, data: Vec<u8>) -> Reply {
        match mode {
            ReplyMode::Inline => Reply::inline(sender, data),
            ReplyMode::OutOfLine => {
                self.counters.ool_replies.fetch_add(1, Ordering::SeqCst);
                let released = Arc::clone(&self.counters.ool_released);
                let region = OutOfLine::new(data, move || {
                    released.fetch_add(1, Ordering::SeqCst);
                });
                Reply::out_of_line(sender, region)
            }
        }
    }
}

impl Transport for LoopbackTransport {
    fn lookup_service(&self, _name: &str) -> LiResult<ServiceHandle> {
        self.counters.lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if !state.available {
            return Err(LiError::TransportUnavailable);
        }
        Ok(ServiceHandle::new(state.generation))
    }

    fn link(&self, service: ServiceHandle, name: &str) -> LiResult<ProcedureId> {
        let state = self.state.lock();
        if !state.available {
            return Err(LiError::TransportUnavailable);
        }
        if service.generation != state.generation {
            return Err(LiError::TransportDied);
        }
        let index = state
            .procedures
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| LiError::UnknownProcedure(name.to_string()))?;
        let base = u32::try_from(state.generation)
            .ok()
            .and_then(|generation| generation.checked_mul(PROCEDURE_STRIDE))
            .ok_or_else(|| LiError::Transport("procedure id space exhausted".into()))?;
        Ok(ProcedureId::new(base + index as u32 + 1))
    }

    fn call(
        &self,
        service: ServiceHandle,
        procedure: ProcedureId,
        mode: SendMode,
        request: &[u8],
    ) -> LiResult<Reply> {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
        if mode == SendMode::OutOfLine {
            self.counters.ool_requests.fetch_add(1, Ordering::SeqCst);
        }
        let (responder, sender, reply_mode) = {
            let mut state = self.state.lock();
            self.admit(&mut state, service)?;
            let responder = Self::responder(&state, procedure)?;
            (responder, state.sender, state.reply_mode)
        };
        let data = responder(request);
        Ok(self.make_reply(sender, reply_mode, data))
    }

    fn allocate_channel(&self) -> LiResult<ChannelId> {
        let mut state = self.state.lock();
        state.next_channel += 1;
        let channel = ChannelId::new(state.next_channel);
        state.channels.insert(channel, ChannelState::default());
        self.counters.channels_allocated.fetch_add(1, Ordering::SeqCst);
        Ok(channel)
    }

    fn request_death_notification(&self, channel: ChannelId) -> LiResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .channels
            .get_mut(&channel)
            .ok_or_else(|| LiError::Transport(format!("unknown {channel}")))?;
        entry.death_notify = true;
        Ok(())
    }

    fn send_async(
        &self,
        service: ServiceHandle,
        channel: ChannelId,
        procedure: ProcedureId,
        request: &[u8],
    ) -> LiResult<()> {
        self.counters.async_sends.fetch_add(1, Ordering::SeqCst);
        let (responder, sender, reply_mode) = {
            let mut state = self.state.lock();
            if !state.channels.contains_key(&channel) {
                return Err(LiError::Transport(format!("unknown {channel}")));
            }
            self.admit(&mut state, service)?;
            let responder = Self::responder(&state, procedure)?;
            if state.hold_replies {
                return Ok(());
            }
            (responder, state.sender, state.reply_mode)
        };

        let reply = self.make_reply(sender, reply_mode, responder(request));
        let mut state = self.state.lock();
        if let Some(entry) = state.channels.get_mut(&channel) {
            entry.queue.push_back(Message::Reply { channel, reply });
            drop(state);
            self.arrived.notify_all();
        }
        Ok(())
    }

    fn receive(&self, channel: ChannelId) -> LiResult<Message> {
        let mut state = self.state.lock();
        loop {
            let entry = state
                .channels
                .get_mut(&channel)
                .ok_or_else(|| LiError::Transport(format!("unknown {channel}")))?;
            if let Some(message) = entry.queue.pop_front() {
                return Ok(message);
            }
            if self
                .arrived
                .wait_for(&mut state, self.receive_timeout)
                .timed_out()
            {
                return Err(LiError::Transport(format!("receive on {channel} timed out")));
            }
        }
    }

    fn release_channel(&self, channel: ChannelId) {
        let removed = self.state.lock().channels.remove(&channel);
        match removed {
            Some(_) => self.counters.channels_released.fetch_add(1, Ordering::SeqCst),
            None => self.counters.double_releases.fetch_add(1, Ordering::SeqCst),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> LoopbackTransport {
        let transport = LoopbackTransport::new();
        transport.serve("echo", |req| req.to_vec());
        transport
    }

    #[test]
    fn link_and_call() {
        let transport = echo();
        let service = transport.lookup_service("svc").unwrap();
        let id = transport.link(service, "echo").unwrap();
        assert_eq!(id, ProcedureId::new(PROCEDURE_STRIDE + 1));
        let reply = transport.call(service, id, SendMode::Inline, b"hi").unwrap();
        assert_eq!(&reply.into_bytes()[..], b"hi");
        assert!(matches!(
            transport.link(service, "nope"),
            Err(LiError::UnknownProcedure(_))
        ));
    }

    #[test]
    fn deaths_bump_generation() {
        let transport = echo();
        let service = transport.lookup_service("svc").unwrap();
        let id = transport.link(service, "echo").unwrap();
        transport.fail_next(1);
        assert_eq!(
            transport.call(service, id, SendMode::Inline, b"x").unwrap_err(),
            LiError::TransportDied
        );
        // Old handle is now stale.
        assert_eq!(
            transport.call(service, id, SendMode::Inline, b"x").unwrap_err(),
            LiError::TransportDied
        );
        assert_eq!(transport.generation(), 2);
    }

    #[test]
    fn out_of_line_replies_are_counted() {
        let transport = echo();
        transport.set_reply_mode(ReplyMode::OutOfLine);
        let service = transport.lookup_service("svc").unwrap();
        let id = transport.link(service, "echo").unwrap();
        let reply = transport.call(service, id, SendMode::OutOfLine, b"x").unwrap();
        assert_eq!(transport.ool_released(), 0);
        drop(reply);
        assert_eq!(transport.ool_replies(), 1);
        assert_eq!(transport.ool_released(), 1);
        assert_eq!(transport.ool_requests(), 1);
    }

    #[test]
    fn channel_lifecycle() {
        let transport = echo();
        let service = transport.lookup_service("svc").unwrap();
        let id = transport.link(service, "echo").unwrap();
        let channel = transport.allocate_channel().unwrap();
        transport.request_death_notification(channel).unwrap();
        transport.send_async(service, channel, id, b"ping").unwrap();
        assert_eq!(transport.queued(channel), 1);
        assert!(matches!(
            transport.receive(channel).unwrap(),
            Message::Reply { .. }
        ));
        assert_eq!(transport.restart(), 1);
        assert!(matches!(
            transport.try_receive(channel),
            Some(Message::DeadName { .. })
        ));
        transport.release_channel(channel);
        transport.release_channel(channel);
        assert_eq!(transport.channels_released(), 1);
        assert_eq!(transport.double_releases(), 1);
    }

    #[test]
    fn receive_times_out_when_idle() {
        let transport = echo().with_receive_timeout(Duration::from_millis(10));
        let channel = transport.allocate_channel().unwrap();
        assert!(matches!(
            transport.receive(channel),
            Err(LiError::Transport(_))
        ));
    }
}
