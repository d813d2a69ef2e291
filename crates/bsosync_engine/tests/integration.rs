//! End-to-end sync passes against the in-memory server.

use bsosync_crypto::{CollectionKeys, CryptoKeysPayload, EncryptedRecord, KeyBundle, KeyChange};
use bsosync_engine::{
    ClientType, EngineConfig, JsonFileStateStore, KeyRecovery, KeyRefresher, MemoryServer,
    MemoryStateStore, MemoryStore, MemoryTracker, Method, Phase, RecordingSink, RecoveryStrategy,
    StateStore, StorageTransport, Store, SyncEngine, SyncError, SyncEvent, SyncResult, Tracker,
};
use bsosync_protocol::{
    Cleartext, MetaGlobal, ServerTimestamp, CRYPTO_COLLECTION, GLOBAL_ID, KEYS_ID, META_COLLECTION,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

const COLLECTION: &str = "bookmarks";
const VERSION: u32 = 2;
const SYNC_ID: &str = "bookmarksAAA";

type Engine = SyncEngine<MemoryServer, MemoryStore, MemoryTracker>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

fn item(id: &str, title: &str) -> Cleartext {
    Cleartext::new(id).with_field("title", title)
}

struct Harness {
    server: Arc<MemoryServer>,
    store: Arc<MemoryStore>,
    tracker: Arc<MemoryTracker>,
    keys: Arc<RwLock<CollectionKeys>>,
    states: Arc<MemoryStateStore>,
    events: Arc<RecordingSink>,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    fn with_store(store: MemoryStore) -> Self {
        init_tracing();
        let harness = Self {
            server: Arc::new(MemoryServer::new()),
            store: Arc::new(store),
            tracker: Arc::new(MemoryTracker::new(COLLECTION)),
            keys: Arc::new(RwLock::new(CollectionKeys::new_keys([COLLECTION]))),
            states: Arc::new(MemoryStateStore::new()),
            events: Arc::new(RecordingSink::new()),
        };
        harness.publish_meta(VERSION, SYNC_ID);
        harness
    }

    fn publish_meta(&self, version: u32, sync_id: &str) {
        let mut meta = MetaGlobal::default();
        meta.set_engine(COLLECTION, version, sync_id);
        self.server.set_meta_global(&meta).unwrap();
    }

    fn config(&self) -> EngineConfig {
        EngineConfig::new(COLLECTION, VERSION)
    }

    fn engine(&self) -> Engine {
        self.engine_with(self.config())
    }

    fn engine_with(&self, config: EngineConfig) -> Engine {
        SyncEngine::new(
            config,
            Arc::clone(&self.server),
            Arc::clone(&self.store),
            Arc::clone(&self.tracker),
        )
        .with_keys(Arc::clone(&self.keys))
        .with_state_store(self.states.clone())
        .with_event_sink(self.events.clone())
    }

    fn bundle(&self) -> KeyBundle {
        self.keys
            .read()
            .key_for_collection(COLLECTION)
            .unwrap()
            .clone()
    }

    /// Stores `record` on the server encrypted under `bundle`.
    fn put_remote_with(&self, bundle: &KeyBundle, record: Cleartext, modified: ServerTimestamp) {
        let mut record = EncryptedRecord::from_cleartext(record);
        record.encrypt(bundle).unwrap();
        let mut bso = record.to_bso().unwrap();
        bso.modified = modified;
        self.server.insert_record(COLLECTION, bso);
    }

    fn put_remote(&self, record: Cleartext) {
        self.put_remote_with(&self.bundle(), record, ServerTimestamp::ZERO);
    }

    fn put_remote_at(&self, record: Cleartext, modified: ServerTimestamp) {
        self.put_remote_with(&self.bundle(), record, modified);
    }

    fn remote(&self, id: &str) -> Option<Cleartext> {
        let bso = self.server.record(COLLECTION, id)?;
        let mut record = EncryptedRecord::from_bso(&bso).unwrap();
        Some(record.decrypt(&self.bundle()).unwrap().clone())
    }

    fn uploaded_ids(&self) -> Vec<String> {
        self.server
            .requests_to(Method::Post, COLLECTION)
            .into_iter()
            .flat_map(|request| request.ids)
            .collect()
    }

    fn state(&self) -> bsosync_engine::CollectionSyncState {
        self.states.load(COLLECTION).unwrap()
    }

    /// Runs a first pass with one local item so later passes are not
    /// first syncs.
    fn seed(&self, engine: &Engine) {
        self.store.insert(item("seed", "seed"));
        engine.sync().unwrap();
        assert!(!self.state().last_sync.is_zero());
        self.server.clear_requests();
    }
}

#[test]
fn first_sync_uploads_every_local_item() {
    let h = Harness::new();
    h.store.insert(item("x", "hello"));
    let engine = h.engine();

    let outcome = engine.sync().unwrap();

    assert_eq!(outcome.uploaded, 1);
    assert_eq!(h.remote("x"), Some(item("x", "hello")));
    assert!(h.tracker.changed_ids().is_empty());
    assert!(h.server.requests_to(Method::Delete, COLLECTION).is_empty());

    let state = h.state();
    assert_eq!(state.sync_id.as_deref(), Some(SYNC_ID));
    assert_eq!(state.last_sync, h.server.record(COLLECTION, "x").unwrap().modified);
    assert_eq!(engine.stats().passes_completed, 1);
}

#[test]
fn newer_remote_version_stops_before_any_other_request() {
    let h = Harness::new();
    h.publish_meta(VERSION + 1, SYNC_ID);
    h.tracker.add_changed_id("a", 10);
    h.server.clear_requests();

    let err = h.engine().sync().unwrap_err();

    assert!(matches!(
        err,
        SyncError::VersionOutOfDate { local, remote } if local == VERSION && remote == VERSION + 1
    ));
    assert!(!err.is_retryable());
    let requests = h.server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].collection, META_COLLECTION);
    assert_eq!(h.tracker.changed_at("a"), Some(10));
}

#[test]
fn older_remote_version_is_replaced_and_collection_wiped() {
    let h = Harness::new();
    h.publish_meta(VERSION - 1, "oldSyncIdAAA");
    h.put_remote(item("stale", "old format"));
    h.store.insert(item("x", "hello"));

    h.engine().sync().unwrap();

    let meta = MetaGlobal::from_bso(&h.server.record(META_COLLECTION, GLOBAL_ID).unwrap()).unwrap();
    let entry = meta.engine(COLLECTION);
    assert_eq!(entry.version, VERSION);
    assert_eq!(entry.sync_id.len(), 12);
    assert_ne!(entry.sync_id, "oldSyncIdAAA");
    assert_eq!(h.state().sync_id, Some(entry.sync_id));

    let wipes = h.server.requests_to(Method::Delete, COLLECTION);
    assert_eq!(wipes.len(), 1);
    assert!(wipes[0].ids.is_empty());
    assert_eq!(h.server.ids(COLLECTION), vec!["x"]);
    assert!(!h.store.item_exists("stale"));
}

#[test]
fn missing_manifest_is_published() {
    let h = Harness::new();
    h.server.delete(META_COLLECTION, None).unwrap();
    h.store.insert(item("x", "hello"));

    h.engine().sync().unwrap();

    let meta = MetaGlobal::from_bso(&h.server.record(META_COLLECTION, GLOBAL_ID).unwrap()).unwrap();
    assert_eq!(meta.engine(COLLECTION).version, VERSION);
    assert!(meta.sync_id.is_some());
    assert!(meta.storage_version.is_some());
    assert_eq!(h.server.ids(COLLECTION), vec!["x"]);
}

#[test]
fn changed_sync_id_is_adopted_and_resets_watermark() {
    let h = Harness::new();
    let engine = h.engine();
    h.seed(&engine);

    h.publish_meta(VERSION, "bookmarksBBB");
    h.server.clear_requests();
    engine.sync().unwrap();

    let state = h.state();
    assert_eq!(state.sync_id.as_deref(), Some("bookmarksBBB"));
    let listings = h.server.requests_to(Method::Get, COLLECTION);
    assert!(listings[0].query.as_ref().unwrap().newer.is_none());
    // Everything on the server matched local data.
    assert!(h.uploaded_ids().is_empty());
}

#[test]
fn identical_conflict_is_dropped_on_both_sides() {
    let h = Harness::new();
    let engine = h.engine();
    h.seed(&engine);

    h.server.advance(60_000);
    let server_time = ServerTimestamp::from_millis(h.server.now().as_millis() - 10_000);
    h.put_remote_at(item("y", "same"), server_time);
    h.store.insert(item("y", "same"));
    h.tracker.add_changed_id("y", now_ms() - 30_000);

    let outcome = engine.sync().unwrap();

    assert_eq!(outcome.incoming.applied, 0);
    assert_eq!(outcome.incoming.reconciled, 1);
    assert!(!h.uploaded_ids().contains(&"y".to_string()));
    assert!(!h.store.applied_ids().contains(&"y".to_string()));
    assert_eq!(h.tracker.changed_at("y"), None);
}

#[test]
fn more_recent_remote_change_wins() {
    let h = Harness::new();
    let engine = h.engine();
    h.seed(&engine);

    h.server.advance(60_000);
    let server_time = ServerTimestamp::from_millis(h.server.now().as_millis() - 10_000);
    h.put_remote_at(item("y", "remote"), server_time);
    h.store.insert(item("y", "local"));
    h.tracker.add_changed_id("y", now_ms() - 30_000);

    let outcome = engine.sync().unwrap();

    assert_eq!(outcome.incoming.applied, 1);
    assert_eq!(h.store.get("y"), Some(item("y", "remote")));
    assert!(!h.uploaded_ids().contains(&"y".to_string()));
    assert_eq!(h.tracker.changed_at("y"), None);
}

#[test]
fn more_recent_local_change_wins() {
    let h = Harness::new();
    let engine = h.engine();
    h.seed(&engine);

    h.server.advance(60_000);
    let server_time = ServerTimestamp::from_millis(h.server.now().as_millis() - 30_000);
    h.put_remote_at(item("y", "remote"), server_time);
    h.store.insert(item("y", "local"));
    h.tracker.add_changed_id("y", now_ms() - 10_000);

    let outcome = engine.sync().unwrap();

    assert_eq!(outcome.incoming.reconciled, 1);
    assert_eq!(outcome.uploaded, 1);
    assert_eq!(h.store.get("y"), Some(item("y", "local")));
    assert_eq!(h.remote("y"), Some(item("y", "local")));
}

#[test]
fn failed_upload_batch_returns_unsent_changes() {
    let h = Harness::new();
    let engine = h.engine_with(h.config().with_max_upload_records(2));
    h.seed(&engine);

    for (offset, id) in ["a", "b", "c", "d", "e", "f"].into_iter().enumerate() {
        h.store.insert(item(id, id));
        h.tracker.add_changed_id(id, 1_000 + offset as i64);
    }
    h.server.fail_nth(Method::Post, COLLECTION, 1);

    let err = engine.sync().unwrap_err();

    assert!(matches!(err, SyncError::UploadFailed { .. }));
    assert!(err.is_retryable());
    let pending = h.tracker.changed_ids();
    assert_eq!(
        pending.into_iter().collect::<Vec<_>>(),
        vec![
            ("c".to_string(), 1_002),
            ("d".to_string(), 1_003),
            ("e".to_string(), 1_004),
            ("f".to_string(), 1_005),
        ]
    );
    assert!(h.remote("a").is_some());
    assert!(h.remote("b").is_some());
    assert!(h.remote("c").is_none());

    // The next pass finishes the job.
    let outcome = engine.sync().unwrap();
    assert_eq!(outcome.uploaded, 4);
    assert!(h.tracker.changed_ids().is_empty());
}

#[test]
fn rejected_records_stay_pending() {
    let h = Harness::new();
    let engine = h.engine();
    h.seed(&engine);

    h.store.insert(item("ok", "1"));
    h.store.insert(item("bad", "2"));
    h.tracker.add_changed_id("ok", 5);
    h.tracker.add_changed_id("bad", 6);
    h.server.reject_ids(["bad"]);

    let outcome = engine.sync().unwrap();

    assert_eq!(outcome.uploaded, 1);
    assert_eq!(outcome.upload_failed, 1);
    assert_eq!(h.tracker.changed_at("bad"), Some(6));
    assert_eq!(h.tracker.changed_at("ok"), None);
}

fn title_dupes() -> MemoryStore {
    MemoryStore::new().with_dupe_key(|record| {
        record
            .get("title")
            .and_then(|title| title.as_str())
            .map(str::to_string)
    })
}

#[test]
fn duplicate_takes_shorter_remote_id() {
    let h = Harness::with_store(title_dupes());
    h.store.insert(item("abcd", "Example"));
    h.put_remote(item("abc", "Example"));

    let outcome = h.engine().sync().unwrap();

    assert_eq!(outcome.deleted, 1);
    assert!(h.store.item_exists("abc"));
    assert!(!h.store.item_exists("abcd"));
    assert_eq!(h.server.ids(COLLECTION), vec!["abc"]);
    let deletes = h.server.requests_to(Method::Delete, COLLECTION);
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].ids, vec!["abcd"]);
}

#[test]
fn duplicate_keeps_shorter_local_id() {
    let h = Harness::with_store(title_dupes());
    h.store.insert(item("abc", "Example"));
    h.put_remote(item("abcd", "Example"));

    let outcome = h.engine().sync().unwrap();

    assert_eq!(outcome.deleted, 1);
    assert!(h.store.item_exists("abc"));
    assert!(!h.store.item_exists("abcd"));
    assert_eq!(h.server.ids(COLLECTION), vec!["abc"]);
    assert_eq!(h.remote("abc"), Some(item("abc", "Example")));
    assert_eq!(
        h.server.requests_to(Method::Delete, COLLECTION)[0].ids,
        vec!["abcd"]
    );
    assert_eq!(h.tracker.changed_at("abc"), Some(0));
}

#[test]
fn reapplying_the_same_records_changes_nothing() {
    let h = Harness::new();
    for id in ["r1", "r2", "r3"] {
        h.put_remote(item(id, id));
    }
    let engine = h.engine();

    let first = engine.sync().unwrap();
    assert_eq!(first.incoming.applied, 3);

    engine.reset_client().unwrap();
    h.server.clear_requests();
    let second = engine.sync().unwrap();

    assert_eq!(second.incoming.applied, 0);
    assert_eq!(second.incoming.reconciled, 3);
    assert!(h.uploaded_ids().is_empty());
    assert_eq!(h.store.len(), 3);
}

#[test]
fn remote_tombstone_removes_local_item() {
    let h = Harness::new();
    let engine = h.engine();
    h.seed(&engine);

    h.store.insert(item("gone", "x"));
    h.put_remote(Cleartext::tombstone("gone"));
    engine.sync().unwrap();

    assert!(!h.store.item_exists("gone"));
}

#[test]
fn apply_failures_get_one_retry() {
    let h = Harness::new();
    h.put_remote(item("good", "1"));
    h.put_remote(item("bad", "2"));
    h.store.fail_apply_for("bad");
    let engine = h.engine();

    let first = engine.sync().unwrap();
    assert_eq!(first.incoming.applied, 1);
    assert_eq!(first.incoming.failed, 1);
    assert_eq!(first.incoming.new_failed, 1);
    assert_eq!(h.state().previous_failed, vec!["bad"]);
    assert_eq!(h.events.apply_failures(), vec![first.incoming]);

    h.server.clear_requests();
    let second = engine.sync().unwrap();
    assert_eq!(second.incoming.failed, 1);
    assert_eq!(second.incoming.new_failed, 0);
    assert_eq!(second.incoming.repeat_failed(), 1);
    let fetches = h.server.requests_to(Method::Get, COLLECTION);
    assert!(fetches.iter().any(|request| request.ids == vec!["bad"]));
    assert!(h.state().previous_failed.is_empty());

    h.store.heal();
    h.server.clear_requests();
    let third = engine.sync().unwrap();
    assert_eq!(third.incoming.failed, 0);
    assert!(!h.store.item_exists("bad"));
    assert_eq!(h.events.apply_failures().len(), 2);
}

#[test]
fn mobile_client_fetches_overflow_by_id() {
    let h = Harness::new();
    for id in ["r1", "r2", "r3", "r4", "r5"] {
        h.put_remote(item(id, id));
    }
    let config = h
        .config()
        .with_client_type(ClientType::Mobile)
        .with_mobile_batch_size(2)
        .with_guid_fetch_batch_size(2);
    let engine = h.engine_with(config);

    let outcome = engine.sync().unwrap();

    assert_eq!(outcome.incoming.applied, 5);
    assert_eq!(h.store.len(), 5);
    let state = h.state();
    assert!(state.to_fetch.is_empty());
    assert_eq!(
        state.last_sync,
        h.server.record(COLLECTION, "r5").unwrap().modified
    );

    let gets = h.server.requests_to(Method::Get, COLLECTION);
    assert_eq!(gets[0].query.as_ref().unwrap().limit, Some(2));
    let by_id: Vec<_> = gets.iter().filter(|request| !request.ids.is_empty()).collect();
    assert_eq!(by_id.len(), 2);
}

#[test]
fn failed_backlog_batch_keeps_ids_for_next_pass() {
    let h = Harness::new();
    for id in ["r1", "r2", "r3", "r4", "r5"] {
        h.put_remote(item(id, id));
    }
    let config = h
        .config()
        .with_client_type(ClientType::Mobile)
        .with_mobile_batch_size(2)
        .with_guid_fetch_batch_size(1)
        .with_fetch_concurrency(1);
    let engine = h.engine_with(config);
    // First page, ID listing, r3, then r4 fails.
    h.server.fail_nth(Method::Get, COLLECTION, 3);

    let err = engine.sync().unwrap_err();

    assert!(matches!(err, SyncError::DownloadFailed { .. }));
    let state = h.state();
    assert!(state.to_fetch.contains(&"r4".to_string()));
    assert!(state.to_fetch.contains(&"r5".to_string()));
    assert!(h.store.item_exists("r1"));
    assert!(h.store.item_exists("r2"));
    assert!(!h.store.item_exists("r4"));

    engine.sync().unwrap();
    assert_eq!(h.store.len(), 5);
    assert!(h.state().to_fetch.is_empty());
}

#[test]
fn concurrent_backlog_fetch_applies_everything() {
    let h = Harness::new();
    let ids: Vec<String> = (0..40).map(|i| format!("item{i:02}")).collect();
    for id in &ids {
        h.put_remote(item(id, id));
    }
    let config = h
        .config()
        .with_client_type(ClientType::Mobile)
        .with_mobile_batch_size(5)
        .with_guid_fetch_batch_size(3)
        .with_fetch_concurrency(4)
        .with_apply_batch_size(4);
    let engine = h.engine_with(config);

    let outcome = engine.sync().unwrap();

    assert_eq!(outcome.incoming.applied, 40);
    assert_eq!(h.store.len(), 40);
    assert!(h.state().to_fetch.is_empty());
}

#[test]
fn rotated_keys_are_refreshed_on_hmac_mismatch() {
    let h = Harness::new();
    let root = KeyBundle::derive_from_root(b"account secret", "user@example.com").unwrap();

    let old = CollectionKeys::new_keys([COLLECTION]);
    let mut record = old.as_record().unwrap();
    record.encrypt(&root).unwrap();
    h.server
        .insert_record(CRYPTO_COLLECTION, record.to_bso().unwrap());
    let keys_modified = h.server.record(CRYPTO_COLLECTION, KEYS_ID).unwrap().modified;

    let keys = Arc::new(RwLock::new(CollectionKeys::new()));
    let refresher = Arc::new(
        KeyRefresher::new(Arc::clone(&h.server), root.clone(), Arc::clone(&keys))
            .with_interval(Duration::ZERO),
    );
    let engine = h
        .engine()
        .with_keys(Arc::clone(&keys))
        .with_key_recovery(refresher);
    engine.sync().unwrap();

    // Another client replaces the keys without the timestamp moving.
    let new = CollectionKeys::new_keys([COLLECTION]);
    let mut record = new.as_record().unwrap();
    record.encrypt(&root).unwrap();
    let mut bso = record.to_bso().unwrap();
    bso.modified = keys_modified;
    h.server.insert_record(CRYPTO_COLLECTION, bso);
    let new_bundle = new.key_for_collection(COLLECTION).unwrap().clone();
    h.put_remote_with(&new_bundle, item("fresh", "x"), ServerTimestamp::ZERO);

    let outcome = engine.sync().unwrap();

    assert_eq!(outcome.incoming.applied, 1);
    assert_eq!(outcome.incoming.failed, 0);
    assert!(h.store.item_exists("fresh"));
    assert_eq!(keys.read().key_for_collection(COLLECTION), Some(&new_bundle));
}

/// An engine whose keys are managed on the server under `root`.
fn engine_with_server_keys(
    h: &Harness,
    root: &KeyBundle,
    collections: &[&str],
) -> (Engine, Arc<RwLock<CollectionKeys>>) {
    let keys = Arc::new(RwLock::new(CollectionKeys::new()));
    let refresher = Arc::new(
        KeyRefresher::new(Arc::clone(&h.server), root.clone(), Arc::clone(&keys))
            .with_collections(collections.iter().copied())
            .with_interval(Duration::ZERO),
    );
    let engine = h
        .engine()
        .with_keys(Arc::clone(&keys))
        .with_key_recovery(refresher);
    (engine, keys)
}

/// Uploads `payload` as `crypto/keys`, as another client would.
fn replace_server_keys(h: &Harness, root: &KeyBundle, payload: &CryptoKeysPayload) {
    let mut keys = CollectionKeys::new();
    keys.set_contents(payload, ServerTimestamp::from_millis(1)).unwrap();
    let mut record = keys.as_record().unwrap();
    record.encrypt(root).unwrap();
    let mut bso = record.to_bso().unwrap();
    bso.modified = ServerTimestamp::ZERO;
    h.server.insert_record(CRYPTO_COLLECTION, bso);
}

fn server_copy_under(h: &Harness, id: &str, bundle: &KeyBundle) -> Option<Cleartext> {
    let bso = h.server.record(COLLECTION, id)?;
    let mut record = EncryptedRecord::from_bso(&bso).unwrap();
    record.decrypt(bundle).ok().cloned()
}

#[test]
fn new_default_key_resyncs_everything() {
    let h = Harness::new();
    let root = KeyBundle::generate_random();
    let (engine, keys) = engine_with_server_keys(&h, &root, &[]);
    h.store.insert(item("x", "hello"));
    engine.sync().unwrap();
    assert!(!h.state().last_sync.is_zero());

    let mut payload = keys.read().to_payload().unwrap();
    payload.default = Some(KeyBundle::generate_random().key_pair());
    replace_server_keys(&h, &root, &payload);
    h.server.clear_requests();

    let outcome = engine.sync().unwrap();

    let listings = h.server.requests_to(Method::Get, COLLECTION);
    assert!(listings[0].query.as_ref().unwrap().newer.is_none());
    assert_eq!(outcome.uploaded, 1);
    let current = keys.read().key_for_collection(COLLECTION).unwrap().clone();
    assert_eq!(server_copy_under(&h, "x", &current), Some(item("x", "hello")));
}

#[test]
fn new_collection_key_resyncs_only_that_collection() {
    let h = Harness::new();
    let root = KeyBundle::generate_random();
    let (engine, keys) = engine_with_server_keys(&h, &root, &[COLLECTION]);
    h.store.insert(item("x", "hello"));
    engine.sync().unwrap();

    // A rotated key for another collection leaves this one alone.
    let mut payload = keys.read().to_payload().unwrap();
    payload
        .collections
        .insert("tabs".into(), KeyBundle::generate_random().key_pair());
    replace_server_keys(&h, &root, &payload);
    let watermark = h.state().last_sync;

    let outcome = engine.sync().unwrap();

    assert_eq!(outcome.uploaded, 0);
    assert_eq!(h.state().last_sync, watermark);

    payload
        .collections
        .insert(COLLECTION.into(), KeyBundle::generate_random().key_pair());
    replace_server_keys(&h, &root, &payload);
    h.server.clear_requests();

    let outcome = engine.sync().unwrap();

    let listings = h.server.requests_to(Method::Get, COLLECTION);
    assert!(listings[0].query.as_ref().unwrap().newer.is_none());
    assert_eq!(outcome.uploaded, 1);
    let current = keys.read().key_for_collection(COLLECTION).unwrap().clone();
    assert_ne!(keys.read().default_bundle(), Some(&current));
    assert_eq!(server_copy_under(&h, "x", &current), Some(item("x", "hello")));
}

#[test]
fn records_under_unknown_keys_fail_without_recovery() {
    let h = Harness::new();
    h.put_remote_with(&KeyBundle::generate_random(), item("foreign", "x"), ServerTimestamp::ZERO);

    let outcome = h.engine().sync().unwrap();

    assert_eq!(outcome.incoming.failed, 1);
    assert!(!h.store.item_exists("foreign"));
    assert!(!h.engine().can_decrypt().unwrap());
}

struct SkipUndecryptable;

impl KeyRecovery for SkipUndecryptable {
    fn ensure_keys(&self) -> SyncResult<KeyChange> {
        Ok(KeyChange::Unchanged)
    }

    fn handle_hmac_event(&self) -> SyncResult<bool> {
        Ok(false)
    }

    fn handle_hmac_mismatch(&self, _id: &str, _may_retry: bool) -> RecoveryStrategy {
        RecoveryStrategy::Ignore
    }
}

#[test]
fn recovery_can_ignore_records() {
    let h = Harness::new();
    h.put_remote_with(&KeyBundle::generate_random(), item("foreign", "x"), ServerTimestamp::ZERO);

    let outcome = h
        .engine()
        .with_key_recovery(Arc::new(SkipUndecryptable))
        .sync()
        .unwrap();

    assert_eq!(outcome.incoming.failed, 0);
    assert_eq!(outcome.incoming.applied, 0);
    assert!(h.events.apply_failures().is_empty());
}

#[test]
fn can_decrypt_with_current_keys() {
    let h = Harness::new();
    h.store.insert(item("x", "hello"));
    let engine = h.engine();
    engine.sync().unwrap();

    assert!(engine.can_decrypt().unwrap());
}

#[test]
fn wipes() {
    let h = Harness::new();
    let engine = h.engine();
    h.seed(&engine);
    h.tracker.add_changed_id("seed", 99);

    engine.wipe_server().unwrap();
    assert!(h.server.ids(COLLECTION).is_empty());
    assert!(h.state().last_sync.is_zero());

    engine.wipe_client().unwrap();
    assert!(h.store.is_empty());
    assert!(h.tracker.changed_ids().is_empty());
    assert_eq!(h.state().sync_id.as_deref(), Some(SYNC_ID));
}

#[test]
fn unchanged_collection_skips_first_page() {
    let h = Harness::new();
    let engine = h.engine();
    h.seed(&engine);
    let last_sync = h.state().last_sync;

    h.put_remote(item("late", "x"));
    engine.set_remote_last_modified(last_sync);
    engine.sync().unwrap();

    assert!(h.server.requests_to(Method::Get, COLLECTION).is_empty());
    assert!(!h.store.item_exists("late"));

    engine.sync().unwrap();
    assert!(h.store.item_exists("late"));
}

#[test]
fn pass_reports_phases_and_resets_score() {
    let h = Harness::new();
    let engine = h.engine();
    h.tracker.set_score(7);

    engine.sync().unwrap();

    let phases: Vec<Phase> = h
        .events
        .events()
        .into_iter()
        .filter_map(|event| match event {
            SyncEvent::Status { phase, .. } => Some(phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            Phase::Startup,
            Phase::Incoming,
            Phase::Outgoing,
            Phase::Finish,
            Phase::Cleanup
        ]
    );
    assert_eq!(h.tracker.score(), 0);
}

#[test]
fn failed_pass_still_cleans_up() {
    let h = Harness::new();
    let engine = h.engine();
    h.seed(&engine);
    h.tracker.add_changed_id("seed", 42);
    h.server.fail_always(Method::Get, COLLECTION);

    let err = engine.sync().unwrap_err();

    assert!(matches!(err, SyncError::DownloadFailed { .. }));
    assert_eq!(h.tracker.changed_at("seed"), Some(42));
    assert!(matches!(
        h.events.events().last(),
        Some(SyncEvent::Status {
            phase: Phase::Cleanup,
            ..
        })
    ));
    assert!(engine.stats().last_error.is_some());
    assert!(!engine.is_syncing());
}

#[test]
fn state_survives_restart_in_files() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new();
    h.store.insert(item("x", "hello"));

    let states: Arc<dyn StateStore> = Arc::new(JsonFileStateStore::open(dir.path()).unwrap());
    h.engine()
        .with_state_store(Arc::clone(&states))
        .sync()
        .unwrap();
    let saved = states.load(COLLECTION).unwrap();
    assert!(!saved.last_sync.is_zero());

    let reopened = JsonFileStateStore::open(dir.path()).unwrap();
    let engine = h.engine().with_state_store(Arc::new(reopened));
    assert_eq!(engine.sync_state().unwrap(), saved);

    h.server.clear_requests();
    engine.sync().unwrap();
    let listing = &h.server.requests_to(Method::Get, COLLECTION)[0];
    assert_eq!(listing.query.as_ref().unwrap().newer, Some(saved.last_sync));
}
