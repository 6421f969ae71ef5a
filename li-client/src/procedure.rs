//! # Procedure Link Cache
//!
//! Purpose: Remember procedure-name to id resolutions for the current service
//! endpoint so each lookup pays for `link` at most once per endpoint.
//!
//! ## Design Principles
//!
//! 1. **Generation Scoped**: Ids belong to one endpoint generation; a newer
//!    generation wipes the table, an older one is never cached.
//! 2. **No I/O Under Lock**: The link call runs with the mutex released.

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::trace;

use li_common::{LiResult, ProcedureId, ServiceHandle};

#[derive(Debug, Default)]
struct LinkTable {
    generation: Option<u64>,
    ids: HashMap<String, ProcedureId, RandomState>,
}

/// Process-wide procedure id cache.
#[derive(Debug, Default)]
pub struct ProcedureCache {
    inner: Mutex<LinkTable>,
}

impl ProcedureCache {
    pub fn new() -> Self {
        ProcedureCache::default()
    }

    /// Returns the cached id for `name`, linking it through `link` on a miss.
    pub fn resolve(
        &self,
        service: ServiceHandle,
        name: &str,
        link: impl FnOnce() -> LiResult<ProcedureId>,
    ) -> LiResult<ProcedureId> {
        {
            let table = self.inner.lock();
            if table.generation == Some(service.generation) {
                if let Some(id) = table.ids.get(name) {
                    return Ok(*id);
                }
            }
        }

        let id = link()?;
        trace!(procedure = name, id = %id, generation = service.generation, "procedure linked");

        let mut table = self.inner.lock();
        match table.generation {
            Some(current) if current > service.generation => return Ok(id),
            Some(current) if current == service.generation => {}
            _ => {
                table.ids.clear();
                table.generation = Some(service.generation);
            }
        }
        table.ids.insert(name.to_string(), id);
        Ok(id)
    }

    /// Forgets every resolution.
    pub fn flush(&self) {
        let mut table = self.inner.lock();
        table.ids.clear();
        table.generation = None;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use li_common::LiError;
    use std::cell::Cell;

    #[test]
    fn links_once_per_generation() {
        let cache = ProcedureCache::new();
        let calls = Cell::new(0);
        let link = || {
            calls.set(calls.get() + 1);
            Ok(ProcedureId::new(7))
        };
        let gen1 = ServiceHandle::new(1);
        assert_eq!(cache.resolve(gen1, "getpwnam", link).unwrap(), ProcedureId::new(7));
        assert_eq!(cache.resolve(gen1, "getpwnam", link).unwrap(), ProcedureId::new(7));
        assert_eq!(calls.get(), 1);

        let gen2 = ServiceHandle::new(2);
        cache.resolve(gen2, "getpwnam", link).unwrap();
        assert_eq!(calls.get(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn older_generation_is_not_cached() {
        let cache = ProcedureCache::new();
        cache
            .resolve(ServiceHandle::new(5), "a", || Ok(ProcedureId::new(1)))
            .unwrap();
        cache
            .resolve(ServiceHandle::new(4), "b", || Ok(ProcedureId::new(2)))
            .unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn link_errors_propagate_and_flush_clears() {
        let cache = ProcedureCache::new();
        let err = cache
            .resolve(ServiceHandle::new(1), "nope", || {
                Err(LiError::UnknownProcedure("nope".into()))
            })
            .unwrap_err();
        assert_eq!(err, LiError::UnknownProcedure("nope".into()));
        cache
            .resolve(ServiceHandle::new(1), "a", || Ok(ProcedureId::new(1)))
            .unwrap();
        cache.flush();
        assert!(cache.is_empty());
    }
}
