//! # L1 Cache Gate
//!
//! Purpose: Decide whether a small process-local result cache may be trusted,
//! using one global change-notification token plus one token per database.
//!
//! ## Design Principles
//!
//! 1. **Lazy, At-Most-Once Registration**: Tokens are registered on first use
//!    under a mutex. A failed attempt keeps the tokens it did register and
//!    leaves the gate unregistered; a later check registers only the rest.
//! 2. **Lock-Free Steady State**: Once registered, `check` reads the token set
//!    through a `OnceLock` and only touches atomics and the notifier.
//! 3. **Global Fan-Out**: A global fire bumps a generation counter; every
//!    database that has not seen the new generation gets `Stale` once.
//! 4. **Flush Only On Stale**: `Disabled` and `Failed` bypass the cache but
//!    leave its contents alone.
//!
//! ## Status Flow
//!
//! ```text
//! check(db)
//!   ├── disabled ................................ Disabled
//!   ├── registration fails ...................... Failed
//!   ├── global generation moved since last look . Stale
//!   ├── per-database token fired ................ Stale
//!   └── otherwise ............................... Ok
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use li_common::{Database, LiResult};

use crate::notify::{ChangeNotifier, NotifyToken};

/// Global invalidation token posted by the directory service.
pub const DEFAULT_GLOBAL_TOKEN: &str = "com.apple.system.DirectoryService.InvalidateCache";

/// Default ring size for [`L1Cache`].
pub const DEFAULT_L1_CAPACITY: usize = 16;

/// Gate configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct L1Config {
    /// Opt-out switch; `false` makes every check return `Disabled`.
    pub enabled: bool,
    /// Name of the global token; per-database tokens append `.<db>`.
    pub global_token: String,
}

impl Default for L1Config {
    fn default() -> Self {
        L1Config {
            enabled: true,
            global_token: DEFAULT_GLOBAL_TOKEN.to_string(),
        }
    }
}

impl L1Config {
    /// Token name for one database.
    pub fn token_for(&self, db: Database) -> String {
        format!("{}.{}", self.global_token, db.notify_suffix())
    }
}

/// Result of a validity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L1Status {
    /// Cached entries are valid.
    Ok,
    /// Something changed; the owner must flush.
    Stale,
    /// Caching is switched off.
    Disabled,
    /// Notifications are unavailable; bypass without flushing.
    Failed,
}

#[derive(Debug)]
struct Tokens {
    global: NotifyToken,
    per_db: [NotifyToken; Database::COUNT],
}

/// Tokens registered so far; survives a failed attempt so a retry only
/// registers what is still missing.
#[derive(Debug, Default)]
struct Registration {
    global: Option<NotifyToken>,
    per_db: [Option<NotifyToken>; Database::COUNT],
}

/// Validity gate shared by every L1 cache in the process.
pub struct L1Gate {
    config: L1Config,
    enabled: AtomicBool,
    notifier: Arc<dyn ChangeNotifier>,
    tokens: OnceLock<Tokens>,
    registration: Mutex<Registration>,
    global_generation: AtomicU64,
    seen_generation: [AtomicU64; Database::COUNT],
}

impl L1Gate {
    pub fn new(config: L1Config, notifier: Arc<dyn ChangeNotifier>) -> Self {
        let enabled = AtomicBool::new(config.enabled);
        L1Gate {
            config,
            enabled,
            notifier,
            tokens: OnceLock::new(),
            registration: Mutex::new(Registration::default()),
            global_generation: AtomicU64::new(0),
            seen_generation: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Flips the opt-out switch at runtime.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// True once tokens have been registered.
    pub fn is_registered(&self) -> bool {
        self.tokens.get().is_some()
    }

    pub fn config(&self) -> &L1Config {
        &self.config
    }

    /// Checks whether the cache for `db` is still valid.
    pub fn check(&self, db: Database) -> L1Status {
        if !self.is_enabled() {
            return L1Status::Disabled;
        }
        let tokens = match self.tokens() {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(db = %db, error = %err, "l1 notification registration failed");
                return L1Status::Failed;
            }
        };

        match self.notifier.check(tokens.global) {
            Ok(true) => {
                let generation = self.global_generation.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(generation, "l1 global invalidation");
            }
            Ok(false) => {}
            Err(err) => {
                warn!(error = %err, "l1 global token check failed");
                return L1Status::Failed;
            }
        }

        // Always consume the per-database edge, even when already stale.
        let db_fired = match self.notifier.check(tokens.per_db[db.index()]) {
            Ok(fired) => fired,
            Err(err) => {
                warn!(db = %db, error = %err, "l1 database token check failed");
                return L1Status::Failed;
            }
        };

        let current = self.global_generation.load(Ordering::Acquire);
        let seen = self.seen_generation[db.index()].swap(current, Ordering::AcqRel);
        if seen != current || db_fired {
            debug!(db = %db, global = seen != current, "l1 cache stale");
            L1Status::Stale
        } else {
            L1Status::Ok
        }
    }

    fn tokens(&self) -> LiResult<&Tokens> {
        if let Some(tokens) = self.tokens.get() {
            return Ok(tokens);
        }
        let mut partial = self.registration.lock();
        if let Some(tokens) = self.tokens.get() {
            return Ok(tokens);
        }
        let global = match partial.global {
            Some(token) => token,
            None => {
                let token = self.notifier.register(&self.config.global_token)?;
                partial.global = Some(token);
                token
            }
        };
        let mut per_db = [NotifyToken(0); Database::COUNT];
        for db in Database::ALL {
            let slot = &mut partial.per_db[db.index()];
            per_db[db.index()] = match *slot {
                Some(token) => token,
                None => {
                    let token = self.notifier.register(&self.config.token_for(db))?;
                    *slot = Some(token);
                    token
                }
            };
        }
        debug!(global = %global, "l1 notification tokens registered");
        Ok(self.tokens.get_or_init(|| Tokens { global, per_db }))
    }
}

impl std::fmt::Debug for L1Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L1Gate")
            .field("config", &self.config)
            .field("enabled", &self.is_enabled())
            .field("registered", &self.is_registered())
            .finish()
    }
}

#[derive(Debug)]
struct Ring<T> {
    slots: Vec<Option<(String, T)>>,
    next: usize,
}

/// Fixed-size ring of recently resolved records for one database.
#[derive(Debug)]
pub struct L1Cache<T> {
    db: Database,
    ring: Mutex<Ring<T>>,
}

impl<T: Clone> L1Cache<T> {
    pub fn new(db: Database) -> Self {
        Self::with_capacity(db, DEFAULT_L1_CAPACITY)
    }

    /// Creates a ring holding at most `capacity` entries (at least one).
    pub fn with_capacity(db: Database, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        L1Cache {
            db,
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                next: 0,
            }),
        }
    }

    pub fn database(&self) -> Database {
        self.db
    }

    /// Looks up `key`, consulting the gate first.
    pub fn get(&self, gate: &L1Gate, key: &str) -> Option<T> {
        match gate.check(self.db) {
            L1Status::Ok => {
                let ring = self.ring.lock();
                ring.slots
                    .iter()
                    .flatten()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
            }
            L1Status::Stale => {
                self.flush();
                None
            }
            L1Status::Disabled | L1Status::Failed => None,
        }
    }

    /// Stores a freshly resolved record, overwriting the oldest slot.
    ///
    /// Returns false when the gate says the cache must be bypassed.
    pub fn insert(&self, gate: &L1Gate, key: &str, value: T) -> bool {
        match gate.check(self.db) {
            L1Status::Ok => {}
            L1Status::Stale => self.flush(),
            L1Status::Disabled | L1Status::Failed => return false,
        }
        let mut ring = self.ring.lock();
        let at = ring.next;
        ring.slots[at] = Some((key.to_string(), value));
        ring.next = (at + 1) % ring.slots.len();
        true
    }

    /// Drops every entry.
    pub fn flush(&self) {
        let mut ring = self.ring.lock();
        ring.slots.iter_mut().for_each(|slot| *slot = None);
        ring.next = 0;
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.ring.lock().slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;

    fn gate() -> (Arc<MemoryNotifier>, L1Gate) {
        let notifier = Arc::new(MemoryNotifier::new());
        let gate = L1Gate::new(L1Config::default(), notifier.clone());
        (notifier, gate)
    }

    #[test]
    fn quiet_tokens_report_ok() {
        let (_, gate) = gate();
        assert_eq!(gate.check(Database::User), L1Status::Ok);
        assert_eq!(gate.check(Database::User), L1Status::Ok);
        assert!(gate.is_registered());
    }

    #[test]
    fn registration_happens_once() {
        let (notifier, gate) = gate();
        gate.check(Database::User);
        gate.check(Database::Host);
        assert_eq!(notifier.registrations(), 1 + Database::COUNT);
    }

    #[test]
    fn global_fire_is_stale_for_every_database_once() {
        let (notifier, gate) = gate();
        for db in Database::ALL {
            assert_eq!(gate.check(db), L1Status::Ok);
        }
        notifier.post(DEFAULT_GLOBAL_TOKEN);
        for db in Database::ALL {
            assert_eq!(gate.check(db), L1Status::Stale, "{db}");
        }
        for db in Database::ALL {
            assert_eq!(gate.check(db), L1Status::Ok, "{db}");
        }
    }

    #[test]
    fn database_fire_is_local() {
        let (notifier, gate) = gate();
        gate.check(Database::User);
        gate.check(Database::Group);
        notifier.post(&gate.config().token_for(Database::Group));
        assert_eq!(gate.check(Database::User), L1Status::Ok);
        assert_eq!(gate.check(Database::Group), L1Status::Stale);
        assert_eq!(gate.check(Database::Group), L1Status::Ok);
    }

    #[test]
    fn disabled_short_circuits() {
        let (notifier, gate) = gate();
        gate.set_enabled(false);
        assert_eq!(gate.check(Database::User), L1Status::Disabled);
        assert!(!gate.is_registered());
        assert_eq!(notifier.registrations(), 0);
    }

    #[test]
    fn failed_registration_retries_later() {
        let (notifier, gate) = gate();
        notifier.set_refuse_registration(true);
        assert_eq!(gate.check(Database::User), L1Status::Failed);
        assert!(!gate.is_registered());
        notifier.set_refuse_registration(false);
        assert_eq!(gate.check(Database::User), L1Status::Ok);
    }

    /// Fails exactly one `register` call, the `fail_at`-th (1-based).
    struct FlakyNotifier {
        inner: MemoryNotifier,
        calls: AtomicU64,
        fail_at: u64,
    }

    impl ChangeNotifier for FlakyNotifier {
        fn register(&self, name: &str) -> LiResult<NotifyToken> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_at {
                return Err(li_common::LiError::Transport("flaky".into()));
            }
            self.inner.register(name)
        }

        fn check(&self, token: NotifyToken) -> LiResult<bool> {
            self.inner.check(token)
        }
    }

    #[test]
    fn partial_registration_keeps_registered_tokens() {
        let notifier = Arc::new(FlakyNotifier {
            inner: MemoryNotifier::new(),
            calls: AtomicU64::new(0),
            fail_at: 4,
        });
        let gate = L1Gate::new(L1Config::default(), notifier.clone());
        assert_eq!(gate.check(Database::User), L1Status::Failed);
        assert!(!gate.is_registered());
        assert_eq!(notifier.inner.registrations(), 3);

        assert_eq!(gate.check(Database::User), L1Status::Ok);
        assert_eq!(gate.check(Database::Host), L1Status::Ok);
        // One failed call plus one success per token.
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2 + Database::COUNT as u64);
        assert_eq!(notifier.inner.registrations(), 1 + Database::COUNT);

        notifier.inner.post(DEFAULT_GLOBAL_TOKEN);
        assert_eq!(gate.check(Database::User), L1Status::Stale);
    }

    #[test]
    fn ring_flushes_only_on_stale() {
        let (notifier, gate) = gate();
        let cache = L1Cache::with_capacity(Database::User, 2);
        assert!(cache.insert(&gate, "alice", 501u32));
        assert_eq!(cache.get(&gate, "alice"), Some(501));

        gate.set_enabled(false);
        assert_eq!(cache.get(&gate, "alice"), None);
        assert_eq!(cache.len(), 1);
        gate.set_enabled(true);

        notifier.post(&gate.config().token_for(Database::User));
        assert_eq!(cache.get(&gate, "alice"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn ring_overwrites_oldest() {
        let (_, gate) = gate();
        let cache = L1Cache::with_capacity(Database::Host, 2);
        cache.insert(&gate, "a", 1);
        cache.insert(&gate, "b", 2);
        cache.insert(&gate, "c", 3);
        assert_eq!(cache.get(&gate, "a"), None);
        assert_eq!(cache.get(&gate, "b"), Some(2));
        assert_eq!(cache.get(&gate, "c"), Some(3));
    }

    #[test]
    fn config_from_json() {
        let cfg: L1Config = serde_json::from_str(r#"{"enabled": false}"#).unwrap();
        assert!(!cfg.enabled);
        assert_eq!(cfg.global_token, DEFAULT_GLOBAL_TOKEN);
        assert_eq!(
            cfg.token_for(Database::Service),
            format!("{DEFAULT_GLOBAL_TOKEN}.service")
        );
    }
}
