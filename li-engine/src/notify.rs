//! # Change Notification
//!
//! Purpose: Abstract the OS notification primitive the L1 gate is built on:
//! register interest in a named token, then check-and-reset its edge.
//!
//! ## Design Principles
//!
//! 1. **Strategy Pattern**: The gate talks to `dyn ChangeNotifier`, so tests
//!    and embedders can plug in any delivery mechanism.
//! 2. **Edge, Not Level**: `check` reports whether the token fired since the
//!    previous check and clears the edge in the same step.
//! 3. **Fan-Out**: Posting a name fires every token registered under it.

use std::fmt;

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::trace;

use li_common::{LiError, LiResult};

/// Handle returned by `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifyToken(pub u32);

impl fmt::Display for NotifyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token#{}", self.0)
    }
}

/// OS change-notification primitive.
pub trait ChangeNotifier: Send + Sync {
    /// Registers interest in `name` and returns a fresh token.
    fn register(&self, name: &str) -> LiResult<NotifyToken>;

    /// Returns true if `token` fired since the last check, resetting it.
    fn check(&self, token: NotifyToken) -> LiResult<bool>;
}

#[derive(Debug, Default)]
struct Registry {
    // name -> tokens registered under it
    names: HashMap<String, Vec<u32>, RandomState>,
    // token -> pending edge
    fired: Vec<bool>,
    // refuses new registrations while set
    refuse: bool,
}

/// In-process notifier: `post` plays the role of the OS broadcast.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    inner: Mutex<Registry>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        MemoryNotifier::default()
    }

    /// Fires every token registered under `name`; returns how many.
    pub fn post(&self, name: &str) -> usize {
        let mut inner = self.inner.lock();
        let Registry { names, fired, .. } = &mut *inner;
        let Some(tokens) = names.get(name) else {
            return 0;
        };
        for &token in tokens {
            fired[token as usize] = true;
        }
        trace!(name, tokens = tokens.len(), "notification posted");
        tokens.len()
    }

    /// Makes subsequent `register` calls fail (or succeed again).
    pub fn set_refuse_registration(&self, refuse: bool) {
        self.inner.lock().refuse = refuse;
    }

    /// Number of tokens handed out so far.
    pub fn registrations(&self) -> usize {
        self.inner.lock().fired.len()
    }
}

impl ChangeNotifier for MemoryNotifier {
    fn register(&self, name: &str) -> LiResult<NotifyToken> {
        let mut inner = self.inner.lock();
        if inner.refuse {
            return Err(LiError::Transport(format!(
                "notification registration refused for '{name}'"
            )));
        }
        let token = u32::try_from(inner.fired.len())
            .map_err(|_| LiError::Transport("notification tokens exhausted".into()))?;
        inner.fired.push(false);
        inner.names.entry(name.to_string()).or_default().push(token);
        Ok(NotifyToken(token))
    }

    fn check(&self, token: NotifyToken) -> LiResult<bool> {
        let mut inner = self.inner.lock();
        let slot = inner
            .fired
            .get_mut(token.0 as usize)
            .ok_or_else(|| LiError::Transport(format!("invalid {token}")))?;
        Ok(std::mem::take(slot))
    }
}
