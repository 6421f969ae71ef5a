//! # Message Structures
//!
//! Purpose: Describe what crosses the transport boundary: requests, replies
//! (inline or out-of-line), sender credentials, and death notifications.
//!
//! ## Design Principles
//!
//! 1. **RAII Regions**: Out-of-line reply memory is released by `Drop`, so a
//!    region can never leak on an early return (untrusted sender, decode
//!    failure, cancelled request).
//! 2. **One Owned Buffer**: `Reply::into_bytes` normalizes both payload shapes
//!    into a single `Bytes` before decoding.
//! 3. **Shared Budget**: Both engines use `MAX_LOOKUP_ATTEMPTS`.
//!
//! ## Message Shapes
//!
//! ```text
//! Message::Reply                     Message::DeadName
//! +-----------+--------------------+ +-----------+
//! | channel   | Reply              | | channel   |
//! +-----------+--------------------+ +-----------+
//!             | sender: Credential |
//!             | payload: Inline    |  (bytes carried in the message)
//!             |        | OutOfLine |  (region owned by the transport)
//!             +--------------------+
//! ```

use std::fmt;

use bytes::Bytes;

use crate::types::{ChannelId, Credential};

/// Total attempts (first send included) before a call is declared dead.
pub const MAX_LOOKUP_ATTEMPTS: u32 = 10;

/// Largest request that may be sent inline; async requests must fit.
pub const MAX_INLINE_DATA: usize = 16 * 1024;

/// Default name under which the directory service registers its endpoint.
pub const DEFAULT_SERVICE_NAME: &str = "com.apple.system.DirectoryService.libinfo_v1";

/// Resolved handle to the directory service endpoint.
///
/// The generation changes every time the endpoint is re-resolved, which lets
/// callers tell a fresh handle from a stale one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    pub generation: u64,
}

impl ServiceHandle {
    pub const fn new(generation: u64) -> Self {
        ServiceHandle { generation }
    }
}

/// Reply memory mapped out-of-line by the transport.
///
/// The release hook runs exactly once, when the region is dropped.
pub struct OutOfLine {
    data: Bytes,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl OutOfLine {
    /// Wraps a region together with the hook that hands it back.
    pub fn new(data: impl Into<Bytes>, release: impl FnOnce() + Send + 'static) -> Self {
        OutOfLine {
            data: data.into(),
            release: Some(Box::new(release)),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Copies the region into an owned buffer and releases the region.
    pub fn copy_out(self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }
}

impl Drop for OutOfLine {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for OutOfLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutOfLine({}B)", self.data.len())
    }
}

/// Body of a reply message.
#[derive(Debug)]
pub enum ReplyPayload {
    /// Bytes carried inside the message itself.
    Inline(Bytes),
    /// Region handed over separately; must be released after use.
    OutOfLine(OutOfLine),
}

/// One reply from the directory service.
#[derive(Debug)]
pub struct Reply {
    /// Credential of the process that sent the reply.
    pub sender: Credential,
    /// Reply body.
    pub payload: ReplyPayload,
}

impl Reply {
    /// Builds an inline reply.
    pub fn inline(sender: Credential, data: impl Into<Bytes>) -> Self {
        Reply {
            sender,
            payload: ReplyPayload::Inline(data.into()),
        }
    }

    /// Builds an out-of-line reply.
    pub fn out_of_line(sender: Credential, region: OutOfLine) -> Self {
        Reply {
            sender,
            payload: ReplyPayload::OutOfLine(region),
        }
    }

    /// Payload length in bytes, whichever shape it has.
    pub fn len(&self) -> usize {
        match &self.payload {
            ReplyPayload::Inline(data) => data.len(),
            ReplyPayload::OutOfLine(region) => region.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Normalizes the payload into one owned buffer.
    ///
    /// Out-of-line regions are copied and then released.
    pub fn into_bytes(self) -> Bytes {
        match self.payload {
            ReplyPayload::Inline(data) => data,
            ReplyPayload::OutOfLine(region) => region.copy_out(),
        }
    }
}

/// A message delivered on a reply channel.
#[derive(Debug)]
pub enum Message {
    /// A reply to the request sent on `channel`.
    Reply { channel: ChannelId, reply: Reply },
    /// The service side of `channel` died before replying.
    DeadName { channel: ChannelId },
}

impl Message {
    /// Channel the message arrived on.
    pub fn channel(&self) -> ChannelId {
        match self {
            Message::Reply { channel, .. } => *channel,
            Message::DeadName { channel } => *channel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counted_region(data: &'static [u8], counter: &Arc<AtomicUsize>) -> OutOfLine {
        let counter = Arc::clone(counter);
        OutOfLine::new(data, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn out_of_line_released_after_copy() {
        let released = Arc::new(AtomicUsize::new(0));
        let reply = Reply::out_of_line(Credential::ROOT, counted_region(b"abc", &released));
        assert_eq!(reply.len(), 3);
        let bytes = reply.into_bytes();
        assert_eq!(&bytes[..], b"abc");
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn out_of_line_released_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let reply = Reply::out_of_line(Credential::ROOT, counted_region(b"abc", &released));
        drop(reply);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inline_reply_passes_through() {
        let reply = Reply::inline(Credential::ROOT, &b""[..]);
        assert!(reply.is_empty());
        assert!(reply.into_bytes().is_empty());
    }

    #[test]
    fn message_channel() {
        let msg = Message::DeadName {
            channel: ChannelId::new(9),
        };
        assert_eq!(msg.channel(), ChannelId::new(9));
    }
}
