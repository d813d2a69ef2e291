//! Transport layer abstraction for the storage server.

use crate::error::{SyncError, SyncResult};
use bsosync_protocol::{
    Bso, CollectionPage, CollectionQuery, InfoCollections, MetaGlobal, ServerTimestamp,
    SortOrder, UploadResponse, GLOBAL_ID, META_COLLECTION,
};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// Access to the storage server.
///
/// This trait abstracts the network layer so the engine can run against
/// HTTP or against an in-memory server in tests. Every method is a plain
/// blocking call.
pub trait StorageTransport: Send + Sync {
    /// Last-modified time of every non-empty collection.
    fn info_collections(&self) -> SyncResult<InfoCollections>;

    /// Fetches one record; `None` if it does not exist.
    fn get_record(&self, collection: &str, id: &str) -> SyncResult<Option<Bso>>;

    /// Lists full records.
    fn get(&self, collection: &str, query: &CollectionQuery) -> SyncResult<CollectionPage>;

    /// Lists record IDs.
    fn get_ids(&self, collection: &str, query: &CollectionQuery) -> SyncResult<Vec<String>>;

    /// Uploads records.
    fn post(&self, collection: &str, records: &[Bso]) -> SyncResult<UploadResponse>;

    /// Deletes the given records, or the whole collection when `ids` is `None`.
    fn delete(&self, collection: &str, ids: Option<&[String]>) -> SyncResult<ServerTimestamp>;

    /// Fetches `meta/global`; `None` if the server has none.
    fn fetch_meta_global(&self) -> SyncResult<Option<MetaGlobal>> {
        match self.get_record(META_COLLECTION, GLOBAL_ID)? {
            Some(bso) => Ok(Some(MetaGlobal::from_bso(&bso)?)),
            None => Ok(None),
        }
    }

    /// Uploads `meta/global`.
    fn put_meta_global(&self, meta: &MetaGlobal) -> SyncResult<ServerTimestamp> {
        let response = self.post(META_COLLECTION, &[meta.to_bso()?])?;
        if !response.is_fully_successful() {
            return Err(SyncError::ServerError {
                status: 400,
                message: format!("meta/global rejected: {:?}", response.failed),
            });
        }
        Ok(response.modified)
    }
}

/// Request kind, as recorded by [`MemoryServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Listing or single-record fetch.
    Get,
    /// Upload.
    Post,
    /// Deletion.
    Delete,
}

/// One request received by a [`MemoryServer`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedRequest {
    /// Request kind.
    pub method: Method,
    /// Target collection.
    pub collection: String,
    /// Listing parameters, for listings.
    pub query: Option<CollectionQuery>,
    /// Uploaded, deleted or fetched IDs.
    pub ids: Vec<String>,
}

#[derive(Debug)]
struct FailRule {
    method: Method,
    collection: String,
    skip: usize,
    persistent: bool,
}

#[derive(Debug, Default)]
struct ServerCollection {
    records: BTreeMap<String, Bso>,
    modified: ServerTimestamp,
}

#[derive(Debug)]
struct ServerInner {
    collections: BTreeMap<String, ServerCollection>,
    clock: i64,
    log: Vec<LoggedRequest>,
    rules: Vec<FailRule>,
    rejected: BTreeSet<String>,
}

impl ServerInner {
    fn tick(&mut self) -> ServerTimestamp {
        self.clock += 10;
        ServerTimestamp::from_millis(self.clock)
    }

    fn now(&self) -> ServerTimestamp {
        ServerTimestamp::from_millis(self.clock)
    }

    fn receive(&mut self, request: LoggedRequest) -> SyncResult<()> {
        trace!(method = ?request.method, collection = %request.collection, "request");
        let mut failure = None;
        let mut index = 0;
        while index < self.rules.len() {
            let rule = &mut self.rules[index];
            if rule.method != request.method || rule.collection != request.collection {
                index += 1;
                continue;
            }
            if rule.skip > 0 {
                rule.skip -= 1;
                index += 1;
                continue;
            }
            if failure.is_none() {
                failure = Some(SyncError::transport_retryable(format!(
                    "injected failure: {:?} {}",
                    request.method, request.collection
                )));
            }
            if rule.persistent {
                index += 1;
            } else {
                self.rules.remove(index);
            }
        }
        self.log.push(request);
        failure.map_or(Ok(()), Err)
    }

    fn select(&self, collection: &str, query: &CollectionQuery) -> Vec<Bso> {
        let Some(coll) = self.collections.get(collection) else {
            return Vec::new();
        };
        let wanted: Option<BTreeSet<&str>> = query
            .ids
            .as_ref()
            .map(|ids| ids.iter().map(String::as_str).collect());

        let mut records: Vec<Bso> = coll
            .records
            .values()
            .filter(|bso| wanted.as_ref().map_or(true, |w| w.contains(bso.id.as_str())))
            .filter(|bso| query.newer.map_or(true, |newer| bso.modified > newer))
            .filter(|bso| query.older.map_or(true, |older| bso.modified < older))
            .cloned()
            .collect();

        match query.sort.unwrap_or(SortOrder::Oldest) {
            SortOrder::Oldest => records.sort_by(|a, b| (a.modified, &a.id).cmp(&(b.modified, &b.id))),
            SortOrder::Newest => {
                records.sort_by(|a, b| (Reverse(a.modified), &a.id).cmp(&(Reverse(b.modified), &b.id)))
            }
            SortOrder::Index => records.sort_by(|a, b| {
                (Reverse(a.sortindex.unwrap_or(0)), &a.id)
                    .cmp(&(Reverse(b.sortindex.unwrap_or(0)), &b.id))
            }),
        }
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        records
    }
}

/// An in-memory storage server.
///
/// Behaves like the real server for the subset of the protocol the engine
/// uses. Timestamps advance by 10 ms per write. Requests can be made to
/// fail, and every request is logged.
#[derive(Debug)]
pub struct MemoryServer {
    inner: Mutex<ServerInner>,
}

impl MemoryServer {
    /// Creates an empty server whose clock reads 1000.00 seconds.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ServerInner {
                collections: BTreeMap::new(),
                clock: 1_000_000,
                log: Vec::new(),
                rules: Vec::new(),
                rejected: BTreeSet::new(),
            }),
        }
    }

    /// The server clock.
    pub fn now(&self) -> ServerTimestamp {
        self.inner.lock().now()
    }

    /// Sets the server clock, rounded down to 10 ms.
    pub fn set_time(&self, time: ServerTimestamp) {
        self.inner.lock().clock = time.as_millis() / 10 * 10;
    }

    /// Moves the server clock forward.
    pub fn advance(&self, millis: i64) {
        let mut inner = self.inner.lock();
        inner.clock += millis.max(0) / 10 * 10;
    }

    /// Stores a record directly. A zero `modified` is replaced by the next
    /// server tick.
    pub fn insert_record(&self, collection: &str, mut bso: Bso) {
        let mut inner = self.inner.lock();
        if bso.modified.is_zero() {
            bso.modified = inner.tick();
        }
        let coll = inner.collections.entry(collection.to_string()).or_default();
        coll.modified = coll.modified.max(bso.modified);
        coll.records.insert(bso.id.clone(), bso);
    }

    /// Stores `meta/global` directly.
    pub fn set_meta_global(&self, meta: &MetaGlobal) -> SyncResult<()> {
        self.insert_record(META_COLLECTION, meta.to_bso()?);
        Ok(())
    }

    /// Returns a stored record.
    pub fn record(&self, collection: &str, id: &str) -> Option<Bso> {
        self.inner
            .lock()
            .collections
            .get(collection)
            .and_then(|coll| coll.records.get(id).cloned())
    }

    /// Returns every stored record of a collection, ordered by ID.
    pub fn records(&self, collection: &str) -> Vec<Bso> {
        self.inner
            .lock()
            .collections
            .get(collection)
            .map(|coll| coll.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns every stored ID of a collection.
    pub fn ids(&self, collection: &str) -> Vec<String> {
        self.records(collection).into_iter().map(|bso| bso.id).collect()
    }

    /// Returns the request log.
    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.inner.lock().log.clone()
    }

    /// Returns logged requests of one kind against one collection.
    pub fn requests_to(&self, method: Method, collection: &str) -> Vec<LoggedRequest> {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|r| r.method == method && r.collection == collection)
            .cloned()
            .collect()
    }

    /// Empties the request log.
    pub fn clear_requests(&self) {
        self.inner.lock().log.clear();
    }

    /// Makes the `n`th (0-based) next request of this kind against this
    /// collection fail with a retryable transport error.
    pub fn fail_nth(&self, method: Method, collection: &str, n: usize) {
        self.inner.lock().rules.push(FailRule {
            method,
            collection: collection.to_string(),
            skip: n,
            persistent: false,
        });
    }

    /// Makes every request of this kind against this collection fail.
    pub fn fail_always(&self, method: Method, collection: &str) {
        self.inner.lock().rules.push(FailRule {
            method,
            collection: collection.to_string(),
            skip: 0,
            persistent: true,
        });
    }

    /// Removes every injected failure.
    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock();
        inner.rules.clear();
        inner.rejected.clear();
    }

    /// Makes uploads of these IDs fail per item.
    pub fn reject_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .lock()
            .rejected
            .extend(ids.into_iter().map(Into::into));
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageTransport for MemoryServer {
    fn info_collections(&self) -> SyncResult<InfoCollections> {
        let mut inner = self.inner.lock();
        inner.receive(LoggedRequest {
            method: Method::Get,
            collection: "info/collections".into(),
            query: None,
            ids: Vec::new(),
        })?;
        Ok(inner
            .collections
            .iter()
            .filter(|(_, coll)| !coll.records.is_empty())
            .map(|(name, coll)| (name.clone(), coll.modified))
            .collect())
    }

    fn get_record(&self, collection: &str, id: &str) -> SyncResult<Option<Bso>> {
        let mut inner = self.inner.lock();
        inner.receive(LoggedRequest {
            method: Method::Get,
            collection: collection.to_string(),
            query: None,
            ids: vec![id.to_string()],
        })?;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|coll| coll.records.get(id).cloned()))
    }

    fn get(&self, collection: &str, query: &CollectionQuery) -> SyncResult<CollectionPage> {
        let mut inner = self.inner.lock();
        inner.receive(LoggedRequest {
            method: Method::Get,
            collection: collection.to_string(),
            query: Some(query.clone()),
            ids: query.ids.clone().unwrap_or_default(),
        })?;
        let records = inner.select(collection, query);
        Ok(CollectionPage::new(records, inner.now()))
    }

    fn get_ids(&self, collection: &str, query: &CollectionQuery) -> SyncResult<Vec<String>> {
        let mut inner = self.inner.lock();
        inner.receive(LoggedRequest {
            method: Method::Get,
            collection: collection.to_string(),
            query: Some(query.clone()),
            ids: query.ids.clone().unwrap_or_default(),
        })?;
        Ok(inner
            .select(collection, query)
            .into_iter()
            .map(|bso| bso.id)
            .collect())
    }

    fn post(&self, collection: &str, records: &[Bso]) -> SyncResult<UploadResponse> {
        let mut inner = self.inner.lock();
        inner.receive(LoggedRequest {
            method: Method::Post,
            collection: collection.to_string(),
            query: None,
            ids: records.iter().map(|bso| bso.id.clone()).collect(),
        })?;

        let modified = inner.tick();
        let mut response = UploadResponse {
            modified,
            ..Default::default()
        };
        let rejected = inner.rejected.clone();
        let coll = inner.collections.entry(collection.to_string()).or_default();
        for bso in records {
            if rejected.contains(&bso.id) {
                response
                    .failed
                    .insert(bso.id.clone(), vec!["rejected".to_string()]);
                continue;
            }
            let mut stored = bso.clone();
            stored.modified = modified;
            coll.records.insert(stored.id.clone(), stored);
            response.success.push(bso.id.clone());
        }
        if !response.success.is_empty() {
            coll.modified = modified;
        }
        Ok(response)
    }

    fn delete(&self, collection: &str, ids: Option<&[String]>) -> SyncResult<ServerTimestamp> {
        let mut inner = self.inner.lock();
        inner.receive(LoggedRequest {
            method: Method::Delete,
            collection: collection.to_string(),
            query: None,
            ids: ids.map(<[String]>::to_vec).unwrap_or_default(),
        })?;

        let modified = inner.tick();
        match ids {
            None => {
                inner.collections.remove(collection);
            }
            Some(ids) => {
                if let Some(coll) = inner.collections.get_mut(collection) {
                    for id in ids {
                        coll.records.remove(id);
                    }
                    coll.modified = modified;
                }
            }
        }
        Ok(modified)
    }
}
