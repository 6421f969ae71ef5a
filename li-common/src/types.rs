//! # Shared Type Definitions
//!
//! Small value types that flow between the engines, the transport contract,
//! and the caches.
//!
//! ## Design Principles
//!
//! 1. **Newtypes Over Integers**: Procedure numbers and channel identities are
//!    distinct types so they cannot be swapped by accident.
//! 2. **Copy Semantics**: Every type here is `Copy` and cheap to pass around.
//! 3. **Closed Database Set**: Logical databases form an enum so per-database
//!    tables can be plain arrays indexed by `Database::index()`.

use std::fmt;

/// Numeric procedure identifier exported by the directory service.
///
/// Obtained by linking a procedure name (see the client's link cache).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcedureId(pub u32);

impl ProcedureId {
    /// Creates a procedure id.
    #[inline]
    pub const fn new(id: u32) -> Self {
        ProcedureId(id)
    }

    /// Returns the raw procedure number.
    #[inline]
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcedureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc#{}", self.0)
    }
}

/// Identity of a reply channel allocated by the transport.
///
/// The async worklist is keyed by this value; it is also the handle returned
/// to callers of `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u64);

impl ChannelId {
    #[inline]
    pub const fn new(id: u64) -> Self {
        ChannelId(id)
    }

    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan#{}", self.0)
    }
}

/// Sender credential read off a reply message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credential {
    /// Effective user id of the responder.
    pub uid: u32,
    /// Effective group id of the responder.
    pub gid: u32,
    /// Process id of the responder.
    pub pid: i32,
}

impl Credential {
    /// Credential of a root-owned responder.
    pub const ROOT: Credential = Credential {
        uid: 0,
        gid: 0,
        pid: 1,
    };

    /// Builds a credential for an arbitrary uid (gid mirrors it).
    pub const fn for_uid(uid: u32) -> Self {
        Credential {
            uid,
            gid: uid,
            pid: 0,
        }
    }
}

/// Logical databases served by the directory service.
///
/// Each database owns one per-thread cache slot and one change-notification
/// token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Database {
    User,
    Group,
    Host,
    Network,
    Service,
    Protocol,
    Rpc,
    Fstab,
    Alias,
    Netgroup,
    Mac,
    Bootparam,
}

impl Database {
    /// Number of logical databases.
    pub const COUNT: usize = 12;

    /// All databases in index order.
    pub const ALL: [Database; Database::COUNT] = [
        Database::User,
        Database::Group,
        Database::Host,
        Database::Network,
        Database::Service,
        Database::Protocol,
        Database::Rpc,
        Database::Fstab,
        Database::Alias,
        Database::Netgroup,
        Database::Mac,
        Database::Bootparam,
    ];

    /// Dense index in `0..COUNT`.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Suffix appended to the global notification token name.
    pub const fn notify_suffix(self) -> &'static str {
        match self {
            Database::User => "user",
            Database::Group => "group",
            Database::Host => "host",
            Database::Network => "network",
            Database::Service => "service",
            Database::Protocol => "protocol",
            Database::Rpc => "rpc",
            Database::Fstab => "fstab",
            Database::Alias => "alias",
            Database::Netgroup => "netgroup",
            Database::Mac => "mac",
            Database::Bootparam => "bootparam",
        }
    }
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.notify_suffix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_indices_are_dense() {
        for (idx, db) in Database::ALL.iter().enumerate() {
            assert_eq!(db.index(), idx);
        }
    }

    #[test]
    fn notify_suffixes_are_unique() {
        let mut names: Vec<&str> = Database::ALL.iter().map(|db| db.notify_suffix()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Database::COUNT);
    }

    #[test]
    fn ids_display() {
        assert_eq!(ProcedureId::new(7).to_string(), "proc#7");
        assert_eq!(ChannelId::new(3).to_string(), "chan#3");
    }
}
