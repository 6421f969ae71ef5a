//! # Transport Contract
//!
//! Purpose: Describe the request/reply message transport the engines run on
//! without tying them to any particular kernel IPC mechanism.
//!
//! ## Design Principles
//!
//! 1. **Strategy Pattern**: Engines hold `Arc<dyn Transport>`; the loopback
//!    implementation and real IPC bindings are interchangeable.
//! 2. **Errors Carry Policy**: `TransportUnavailable` means "give up now",
//!    `TransportDied` means "re-resolve and resend". Anything else is opaque.
//! 3. **Ownership Of Regions**: Replies hand out-of-line memory to the caller
//!    as an `OutOfLine` whose drop returns it to the transport.

use li_common::{ChannelId, LiResult, Message, ProcedureId, Reply, ServiceHandle};

/// How a request body travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Copied into the message.
    Inline,
    /// Passed as a separate memory region.
    OutOfLine,
}

/// Request/reply transport to the directory service.
pub trait Transport: Send + Sync {
    /// Resolves the named service endpoint.
    ///
    /// `TransportUnavailable` when nothing is registered under `name`.
    fn lookup_service(&self, name: &str) -> LiResult<ServiceHandle>;

    /// Resolves a procedure name exported by `service`.
    fn link(&self, service: ServiceHandle, name: &str) -> LiResult<ProcedureId>;

    /// Sends one request and blocks for its reply.
    fn call(
        &self,
        service: ServiceHandle,
        procedure: ProcedureId,
        mode: SendMode,
        request: &[u8],
    ) -> LiResult<Reply>;

    /// Allocates a fresh reply channel.
    fn allocate_channel(&self) -> LiResult<ChannelId>;

    /// Asks for a `DeadName` message on `channel` if the service dies.
    fn request_death_notification(&self, channel: ChannelId) -> LiResult<()>;

    /// Sends an inline request whose reply will arrive on `channel`.
    fn send_async(
        &self,
        service: ServiceHandle,
        channel: ChannelId,
        procedure: ProcedureId,
        request: &[u8],
    ) -> LiResult<()>;

    /// Blocks until exactly one message arrives on `channel`.
    fn receive(&self, channel: ChannelId) -> LiResult<Message>;

    /// Returns `channel` to the transport.
    fn release_channel(&self, channel: ChannelId);
}
