//! # Service Endpoint
//!
//! Purpose: Hold the state both engines share: the transport, the cached
//! service handle, the procedure link cache, and the counters.
//!
//! ## Design Principles
//!
//! 1. **Resolve Lazily, Invalidate Precisely**: The handle is resolved on
//!    first use and dropped only if the handle that died is still the cached
//!    one, so concurrent failures trigger one re-resolution, not many.
//! 2. **One Acceptance Path**: Trust check, out-of-line release, and decoding
//!    live here so sync and async replies are judged identically.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use li_common::{KvArray, LiError, LiResult, ProcedureId, Reply, ServiceHandle};

use crate::config::LookupConfig;
use crate::procedure::ProcedureCache;
use crate::stats::EngineStats;
use crate::transport::Transport;

/// Shared per-process view of the directory service.
pub struct Endpoint {
    transport: Arc<dyn Transport>,
    config: LookupConfig,
    service: Mutex<Option<ServiceHandle>>,
    procedures: ProcedureCache,
    stats: EngineStats,
}

impl Endpoint {
    pub fn new(transport: Arc<dyn Transport>, config: LookupConfig) -> Self {
        Endpoint {
            transport,
            config,
            service: Mutex::new(None),
            procedures: ProcedureCache::new(),
            stats: EngineStats::new(),
        }
    }

    #[inline]
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    #[inline]
    pub fn config(&self) -> &LookupConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    #[inline]
    pub fn procedures(&self) -> &ProcedureCache {
        &self.procedures
    }

    /// Returns the cached service handle, resolving it if needed.
    ///
    /// Resolution runs with the lock released; if another caller installed a
    /// handle meanwhile, that one wins.
    pub fn handle(&self) -> LiResult<ServiceHandle> {
        if let Some(handle) = *self.service.lock() {
            return Ok(handle);
        }
        let resolved = self.transport.lookup_service(&self.config.service_name)?;

        let mut service = self.service.lock();
        if let Some(current) = *service {
            return Ok(current);
        }
        debug!(
            service = %self.config.service_name,
            generation = resolved.generation,
            "service endpoint resolved"
        );
        *service = Some(resolved);
        Ok(resolved)
    }

    /// Drops `stale` if it is still cached, flushing the link cache with it.
    pub fn invalidate(&self, stale: ServiceHandle) -> bool {
        let mut service = self.service.lock();
        if *service != Some(stale) {
            return false;
        }
        *service = None;
        self.procedures.flush();
        debug!(generation = stale.generation, "service endpoint invalidated");
        true
    }

    /// Links `name` on `service`, using the cache.
    pub fn procedure(&self, service: ServiceHandle, name: &str) -> LiResult<ProcedureId> {
        self.procedures
            .resolve(service, name, || self.transport.link(service, name))
    }

    /// Applies the trust check and decodes a reply.
    ///
    /// Empty replies mean "no data". Out-of-line regions are released on
    /// every path.
    pub fn accept(&self, reply: Reply) -> LiResult<Option<KvArray>> {
        let uid = reply.sender.uid;
        if uid != self.config.trusted_uid {
            drop(reply);
            self.stats.record_untrusted();
            warn!(uid, trusted = self.config.trusted_uid, "reply from untrusted sender");
            return Err(LiError::Untrusted { uid });
        }
        if reply.is_empty() {
            return Ok(None);
        }
        match KvArray::decode(reply.into_bytes()) {
            Ok(array) => Ok(Some(array)),
            Err(err) => {
                self.stats.record_malformed();
                warn!(error = %err, "reply failed to decode");
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("config", &self.config)
            .field("service", &*self.service.lock())
            .finish()
    }
}
