//! # Synchronous Lookup Client
//!
//! Purpose: Expose a compact, blocking API for issuing kvbuf queries to the
//! directory service, with reconnect-on-death retry.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `LookupClient` hides endpoint resolution, procedure
//!    linking, and reply normalization.
//! 2. **Bounded Retry**: A server death re-resolves the endpoint and resends,
//!    up to `max_attempts` transport calls per query.
//! 3. **Fail Fast**: An unreachable service or a non-death error ends the
//!    query on the spot.
//! 4. **Shared Endpoint**: The async engine built from a client shares its
//!    handle, link cache, and counters.
//!
//! ## Retry Loop
//!
//! ```text
//! attempt 1..=max_attempts
//!   handle()  ── Unavailable ──────────────────────────> Err
//!   link()    ── Died ──> invalidate(handle) ──> next attempt
//!   call()    ── Died ──> invalidate(handle) ──> next attempt
//!             ── Ok(reply) ──> trust check ──> decode ──> Ok
//! exhausted ─────────────────────────────────────────> RetriesExhausted
//! ```

use std::sync::Arc;

use tracing::{debug, warn};

use li_common::{KvArray, Kvbuf, LiError, LiResult};

use crate::async_engine::AsyncEngine;
use crate::config::{ConfigError, LookupConfig};
use crate::endpoint::Endpoint;
use crate::stats::StatsSnapshot;
use crate::transport::{SendMode, Transport};

/// Synchronous client for the directory service.
#[derive(Debug, Clone)]
pub struct LookupClient {
    endpoint: Arc<Endpoint>,
}

impl LookupClient {
    /// Creates a client with default configuration.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        LookupClient {
            endpoint: Arc::new(Endpoint::new(transport, LookupConfig::default())),
        }
    }

    /// Creates a client with a custom configuration.
    pub fn with_config(
        transport: Arc<dyn Transport>,
        config: LookupConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(LookupClient {
            endpoint: Arc::new(Endpoint::new(transport, config)),
        })
    }

    /// Async engine sharing this client's endpoint.
    pub fn async_engine(&self) -> AsyncEngine {
        AsyncEngine::new(Arc::clone(&self.endpoint))
    }

    pub fn config(&self) -> &LookupConfig {
        self.endpoint.config()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.endpoint.stats().snapshot()
    }

    /// Runs one query against `procedure`.
    ///
    /// Returns `Ok(None)` for an empty reply.
    pub fn query(&self, procedure: &str, request: &Kvbuf) -> LiResult<Option<KvArray>> {
        if request.is_failed() {
            return Err(LiError::AllocationFailed);
        }
        let endpoint = &self.endpoint;
        let config = endpoint.config();
        let stats = endpoint.stats();
        stats.record_query();

        let body = request.as_bytes();
        let mode = if body.len() > config.max_inline_request {
            SendMode::OutOfLine
        } else {
            SendMode::Inline
        };

        for attempt in 1..=config.max_attempts {
            let handle = endpoint.handle()?;
            let result = endpoint.procedure(handle, procedure).and_then(|id| {
                stats.record_attempt();
                endpoint.transport().call(handle, id, mode, body)
            });
            match result {
                Ok(reply) => return endpoint.accept(reply),
                Err(err) if err.is_retryable() => {
                    debug!(procedure, attempt, error = %err, "service died; re-resolving");
                    endpoint.invalidate(handle);
                    if attempt < config.max_attempts {
                        stats.record_retry();
                    }
                }
                Err(err) => return Err(err),
            }
        }

        warn!(procedure, attempts = config.max_attempts, "query retry budget exhausted");
        Err(LiError::RetriesExhausted {
            attempts: config.max_attempts,
        })
    }

    /// Builds a one-key, one-value query and runs it.
    pub fn query_key_val(
        &self,
        procedure: &str,
        key: &str,
        val: &str,
    ) -> LiResult<Option<KvArray>> {
        self.query(procedure, &Kvbuf::query_key_val(key, val))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackTransport, ReplyMode};

    fn user_reply() -> Vec<u8> {
        let mut kv = Kvbuf::new();
        kv.add_dict();
        kv.add_key("name");
        kv.add_val("alice");
        kv.add_key("uid");
        kv.add_val("501");
        kv.freeze().to_vec()
    }

    fn setup() -> (Arc<LoopbackTransport>, LookupClient) {
        let transport = Arc::new(LoopbackTransport::new());
        transport.serve("getpwnam", |_| user_reply());
        transport.serve("nothing", |_| Vec::new());
        let client = LookupClient::new(transport.clone());
        (transport, client)
    }

    #[test]
    fn query_decodes_reply() {
        let (_, client) = setup();
        let array = client
            .query_key_val("getpwnam", "login", "alice")
            .unwrap()
            .unwrap();
        assert_eq!(array.len(), 1);
        let dict = array.dict(0).unwrap();
        assert_eq!(dict.first_str("name"), Some("alice"));
        assert_eq!(dict.first_str("uid"), Some("501"));
    }

    #[test]
    fn empty_reply_is_no_data() {
        let (_, client) = setup();
        assert!(client.query("nothing", &Kvbuf::new()).unwrap().is_none());
    }

    #[test]
    fn unavailable_fails_without_retry() {
        let (transport, client) = setup();
        transport.set_available(false);
        assert_eq!(
            client.query("getpwnam", &Kvbuf::new()).unwrap_err(),
            LiError::TransportUnavailable
        );
        assert_eq!(transport.calls(), 0);
        assert_eq!(transport.lookups(), 1);
    }

    #[test]
    fn recovers_after_restart() {
        let (transport, client) = setup();
        client.query("getpwnam", &Kvbuf::new()).unwrap();
        transport.fail_next(3);
        assert!(client.query("getpwnam", &Kvbuf::new()).unwrap().is_some());
        assert_eq!(transport.calls(), 5);
        assert_eq!(client.stats().retries, 3);
    }

    #[test]
    fn large_requests_go_out_of_line() {
        let (transport, client) = setup();
        let big = "x".repeat(client.config().max_inline_request + 1);
        client.query_key_val("getpwnam", "login", &big).unwrap();
        assert_eq!(transport.ool_requests(), 1);
    }

    #[test]
    fn out_of_line_reply_is_released() {
        let (transport, client) = setup();
        transport.set_reply_mode(ReplyMode::OutOfLine);
        client.query("getpwnam", &Kvbuf::new()).unwrap().unwrap();
        assert_eq!(transport.ool_replies(), 1);
        assert_eq!(transport.ool_released(), 1);
    }

    #[test]
    fn unknown_procedure_surfaces() {
        let (_, client) = setup();
        assert_eq!(
            client.query("getfoo", &Kvbuf::new()).unwrap_err(),
            LiError::UnknownProcedure("getfoo".into())
        );
    }

    #[test]
    fn invalid_config_rejected() {
        let transport = Arc::new(LoopbackTransport::new());
        let config = LookupConfig {
            max_attempts: 0,
            ..LookupConfig::default()
        };
        assert!(LookupClient::with_config(transport, config).is_err());
    }
}
