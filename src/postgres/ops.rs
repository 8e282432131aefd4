//! The PostgreSQL `ProtocolOps` capability: the extended-query frame sequence
//! (`Parse | Bind | Describe | Execute | Sync`), with a small cache eliding `Parse` on repeat
//! for the three transaction keywords (§4.4).

use std::num::NonZeroUsize;

use bytes::BytesMut;
use lru::LruCache;

use crate::error::Error;
use crate::ops::ProtocolOps;
use crate::postgres::messages::{encode_bind, encode_describe, encode_execute, encode_parse, encode_sync};

const DEFAULT_PORTAL: &str = "";
const UNNAMED_STATEMENT: &str = "";

pub struct PgOps {
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) database: String,
    /// Maps the literal SQL text of `BEGIN`/`COMMIT`/`ROLLBACK` to the server-assigned prepared
    /// statement name, so repeat transaction keywords skip `Parse`.
    statement_cache: LruCache<String, String>,
    next_statement_id: u64,
}

impl PgOps {
    pub(crate) fn new(username: String, password: String, database: String) -> Self {
        Self {
            username,
            password,
            database,
            statement_cache: LruCache::new(NonZeroUsize::new(4).unwrap()),
            next_statement_id: 0,
        }
    }

    fn encode_cached(&mut self, sql: &str, out: &mut BytesMut) -> Result<(), Error> {
        let statement_name = match self.statement_cache.get(sql) {
            Some(name) => name.clone(),
            None => {
                let name = format!("S_{}", self.next_statement_id);
                self.next_statement_id += 1;
                encode_parse(&name, sql, out);
                self.statement_cache.put(sql.to_string(), name.clone());
                name
            }
        };
        encode_bind(DEFAULT_PORTAL, &statement_name, out);
        encode_describe(b'P', DEFAULT_PORTAL, out);
        encode_execute(DEFAULT_PORTAL, 0, out);
        encode_sync(out);
        Ok(())
    }
}

impl ProtocolOps for PgOps {
    fn encode_begin(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.encode_cached("BEGIN", out)
    }

    fn encode_commit(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.encode_cached("COMMIT", out)
    }

    fn encode_rollback(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.encode_cached("ROLLBACK", out)
    }

    fn encode_query(&mut self, sql: &str, out: &mut BytesMut) -> Result<(), Error> {
        // Plain queries always use the unnamed statement: binding a new query to it implicitly
        // discards whatever it held, so there is nothing worth caching here.
        encode_parse(UNNAMED_STATEMENT, sql, out);
        encode_bind(DEFAULT_PORTAL, UNNAMED_STATEMENT, out);
        encode_describe(b'P', DEFAULT_PORTAL, out);
        encode_execute(DEFAULT_PORTAL, 0, out);
        encode_sync(out);
        Ok(())
    }

    fn encode_terminate(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        crate::postgres::messages::encode_terminate(out);
        Ok(())
    }
}
