//! # Lookup Pipeline
//!
//! Purpose: The one query-and-cache path every NSS-style wrapper runs:
//! encode, query, extract a native record, publish it through the
//! per-thread slot.
//!
//! ## Design Principles
//!
//! 1. **One Extractor Per Database**: Wrappers implement `RecordExtractor`;
//!    the pipeline stays generic.
//! 2. **Stable Borrows**: Results are returned as borrows of the slot's
//!    recycled record, valid until the next lookup on that slot.
//! 3. **Untrusted Means Nothing**: A reply from an untrusted sender reads as
//!    "no result" to the wrapper; the distinction stays in logs and stats.

use tracing::debug;

use li_common::{Database, DictView, IlsRecord, KvArray, Kvbuf, LiError, LiResult};
use li_engine::EntrySlot;

use crate::client::LookupClient;

/// Turns one decoded dictionary into a native record.
pub trait RecordExtractor {
    /// Database whose slot the records are published in.
    fn database(&self) -> Database;

    /// Builds the record for `dict`.
    fn extract(&self, dict: DictView<'_>) -> LiResult<IlsRecord>;
}

impl LookupClient {
    /// Runs a single-record lookup and publishes the first match.
    pub fn get_one<'s, E: RecordExtractor + ?Sized>(
        &self,
        slot: &'s mut EntrySlot,
        extractor: &E,
        procedure: &str,
        request: &Kvbuf,
    ) -> LiResult<Option<&'s IlsRecord>> {
        debug_assert_eq!(slot.database(), extractor.database());
        let Some(array) = self.trusted_query(procedure, request)? else {
            return Ok(None);
        };
        let Some(dict) = array.dict(0) else {
            return Ok(None);
        };
        let record = extractor.extract(dict)?;
        Ok(Some(slot.recycle(record)))
    }

    /// Rewinds the iterator for `slot`, dropping any fetched results.
    pub fn set_ent(&self, slot: &mut EntrySlot) {
        slot.end();
    }

    /// Returns the next record of a full enumeration.
    ///
    /// The first call fetches every entry through `procedure`; later calls
    /// walk the cached results.
    pub fn get_ent<'s, E: RecordExtractor + ?Sized>(
        &self,
        slot: &'s mut EntrySlot,
        extractor: &E,
        procedure: &str,
    ) -> LiResult<Option<&'s IlsRecord>> {
        debug_assert_eq!(slot.database(), extractor.database());
        if !slot.has_results() {
            let array = self
                .trusted_query(procedure, &Kvbuf::new())?
                .unwrap_or_else(KvArray::empty);
            debug!(db = %slot.database(), entries = array.len(), "enumeration fetched");
            slot.set_results(array);
        }
        let record = match slot.next_dict() {
            Some(dict) => extractor.extract(dict)?,
            None => return Ok(None),
        };
        Ok(Some(slot.recycle(record)))
    }

    /// Ends an enumeration, freeing its results.
    pub fn end_ent(&self, slot: &mut EntrySlot) {
        slot.end();
    }

    fn trusted_query(&self, procedure: &str, request: &Kvbuf) -> LiResult<Option<KvArray>> {
        match self.query(procedure, request) {
            Err(LiError::Untrusted { uid }) => {
                debug!(procedure, uid, "untrusted reply treated as no result");
                Ok(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use li_common::IlsValue;

    use crate::loopback::LoopbackTransport;

    struct PasswdExtractor;

    impl RecordExtractor for PasswdExtractor {
        fn database(&self) -> Database {
            Database::User
        }

        fn extract(&self, dict: DictView<'_>) -> LiResult<IlsRecord> {
            let uid = dict
                .first_str("uid")
                .and_then(|v| v.parse().ok())
                .ok_or(LiError::Malformed("uid"))?;
            IlsRecord::build(
                "s4",
                &[IlsValue::Str(dict.first_str("name")), IlsValue::U32(uid)],
            )
        }
    }

    fn users(names: &[(&str, u32)]) -> Vec<u8> {
        let mut kv = Kvbuf::new();
        for (name, uid) in names {
            kv.add_dict();
            kv.add_key("name");
            kv.add_val(name);
            kv.add_key("uid");
            kv.add_val(&uid.to_string());
        }
        kv.freeze().to_vec()
    }

    fn setup() -> (Arc<LoopbackTransport>, LookupClient) {
        let transport = Arc::new(LoopbackTransport::new());
        transport.serve("getpwnam", |_| users(&[("alice", 501)]));
        transport.serve("getpwent", |_| users(&[("root", 0), ("alice", 501)]));
        let client = LookupClient::new(transport.clone());
        (transport, client)
    }

    #[test]
    fn get_one_publishes_record() {
        let (_, client) = setup();
        let mut slot = EntrySlot::new(Database::User);
        let request = Kvbuf::query_key_val("login", "alice");
        let record = client
            .get_one(&mut slot, &PasswdExtractor, "getpwnam", &request)
            .unwrap()
            .unwrap();
        assert_eq!(record.read_str(0), Some("alice"));
        assert_eq!(record.read_u32(record.field_offset(1).unwrap()), Some(501));
    }

    #[test]
    fn untrusted_reply_is_no_result() {
        let (transport, client) = setup();
        transport.set_sender_uid(501);
        let mut slot = EntrySlot::new(Database::User);
        let found = client
            .get_one(&mut slot, &PasswdExtractor, "getpwnam", &Kvbuf::new())
            .unwrap();
        assert!(found.is_none());
        assert_eq!(client.stats().untrusted, 1);
    }

    #[test]
    fn enumeration_walks_and_rewinds() {
        let (transport, client) = setup();
        let mut slot = EntrySlot::new(Database::User);
        let mut names = Vec::new();
        while let Some(record) = client
            .get_ent(&mut slot, &PasswdExtractor, "getpwent")
            .unwrap()
        {
            names.push(record.read_str(0).unwrap().to_string());
        }
        assert_eq!(names, vec!["root", "alice"]);
        assert_eq!(transport.calls(), 1);

        client.set_ent(&mut slot);
        let first = client
            .get_ent(&mut slot, &PasswdExtractor, "getpwent")
            .unwrap()
            .unwrap();
        assert_eq!(first.read_str(0), Some("root"));
        assert_eq!(transport.calls(), 2);

        client.end_ent(&mut slot);
        assert!(!slot.has_results());
        assert!(slot.current().is_some());
    }
}
