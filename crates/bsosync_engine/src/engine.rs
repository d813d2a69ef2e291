//! The collection sync engine.
//!
//! One [`SyncEngine`] syncs one collection. A pass runs
//! `STARTUP → INCOMING → OUTGOING → FINISH`, then `CLEANUP` whatever
//! happened before it.

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventSink, IncomingCounts, NullSink, Phase, SyncEvent};
use crate::keys::{KeyRecovery, RecoveryStrategy};
use crate::reconcile::{reconcile, Clocks, Decision};
use crate::state::{CollectionSyncState, MemoryStateStore, StateStore};
use crate::store::Store;
use crate::tracker::{IgnoreAllGuard, Tracker};
use crate::transport::StorageTransport;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bsosync_crypto::{CollectionKeys, CryptoError, EncryptedRecord};
use bsosync_protocol::{
    Bso, Cleartext, CollectionPage, CollectionQuery, MetaGlobal, ServerTimestamp, SortOrder,
    STORAGE_VERSION,
};
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};

/// Statistics accumulated over the engine's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Passes that completed without error.
    pub passes_completed: u64,
    /// Incoming records applied.
    pub records_applied: u64,
    /// Incoming records that failed.
    pub records_failed: u64,
    /// Incoming records dropped by reconciliation.
    pub records_reconciled: u64,
    /// Outgoing records accepted by the server.
    pub records_uploaded: u64,
    /// Error of the last failed pass, cleared by a successful one.
    pub last_error: Option<String>,
    /// When the last successful pass ended.
    pub last_sync_time: Option<Instant>,
}

/// Result of one successful pass.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// Incoming counters.
    pub incoming: IncomingCounts,
    /// Records accepted by the server.
    pub uploaded: usize,
    /// Records rejected by the server or not built.
    pub upload_failed: usize,
    /// IDs deleted on the server.
    pub deleted: usize,
    /// Wall time of the pass.
    pub duration: Duration,
}

/// Working state of one pass. Never persisted.
#[derive(Debug, Default)]
struct Pass {
    state: CollectionSyncState,
    /// Outgoing candidates and their local change times.
    modified: BTreeMap<String, i64>,
    /// IDs to delete on the server in FINISH.
    delete_ids: Vec<String>,
}

/// Progress of the INCOMING phase.
#[derive(Debug, Default)]
struct Incoming {
    handled: BTreeSet<String>,
    failed: BTreeSet<String>,
    pending: Vec<Cleartext>,
    counts: IncomingCounts,
}

enum BatchOutcome {
    Fetched { index: usize, page: CollectionPage },
    Failed { index: usize, error: SyncError },
}

/// Clears the syncing flag when a pass ends.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Syncs one collection between a [`Store`] and a storage server.
pub struct SyncEngine<T: StorageTransport, S: Store, K: Tracker> {
    config: EngineConfig,
    transport: Arc<T>,
    store: Arc<S>,
    tracker: Arc<K>,
    keys: Arc<RwLock<CollectionKeys>>,
    recovery: Option<Arc<dyn KeyRecovery>>,
    state_store: Arc<dyn StateStore>,
    events: Arc<dyn EventSink>,
    remote_last_modified: RwLock<Option<ServerTimestamp>>,
    stats: RwLock<SyncStats>,
    syncing: AtomicBool,
}

impl<T: StorageTransport, S: Store, K: Tracker> SyncEngine<T, S, K> {
    /// Creates an engine with in-memory sync state and no keys.
    pub fn new(config: EngineConfig, transport: Arc<T>, store: Arc<S>, tracker: Arc<K>) -> Self {
        Self {
            config,
            transport,
            store,
            tracker,
            keys: Arc::new(RwLock::new(CollectionKeys::new())),
            recovery: None,
            state_store: Arc::new(MemoryStateStore::new()),
            events: Arc::new(NullSink),
            remote_last_modified: RwLock::new(None),
            stats: RwLock::new(SyncStats::default()),
            syncing: AtomicBool::new(false),
        }
    }

    /// Persists sync state in `state_store`.
    pub fn with_state_store(mut self, state_store: Arc<dyn StateStore>) -> Self {
        self.state_store = state_store;
        self
    }

    /// Sends events to `events`.
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Uses a shared key set.
    pub fn with_keys(mut self, keys: Arc<RwLock<CollectionKeys>>) -> Self {
        self.keys = keys;
        self
    }

    /// Calls `recovery` at startup and on HMAC failures.
    pub fn with_key_recovery(mut self, recovery: Arc<dyn KeyRecovery>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Gets the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns true while a pass is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Loads the persisted sync state.
    pub fn sync_state(&self) -> SyncResult<CollectionSyncState> {
        self.state_store.load(&self.config.collection)
    }

    /// Tells the next pass when the collection last changed on the server.
    /// The first page is skipped if nothing changed since the last pass.
    pub fn set_remote_last_modified(&self, modified: ServerTimestamp) {
        *self.remote_last_modified.write() = Some(modified);
    }

    /// Runs one sync pass.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AlreadySyncing`] if a pass is running, or the
    /// error that stopped the pass. Local changes not uploaded are handed
    /// back to the tracker either way.
    pub fn sync(&self) -> SyncResult<SyncOutcome> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadySyncing);
        }
        let _running = Running(&self.syncing);

        let start = Instant::now();
        let mut pass = Pass::default();
        let result = self.run_phases(&mut pass);
        self.cleanup(&mut pass);

        let mut stats = self.stats.write();
        match result {
            Ok(mut outcome) => {
                outcome.duration = start.elapsed();
                stats.passes_completed += 1;
                stats.records_applied += outcome.incoming.applied as u64;
                stats.records_failed += outcome.incoming.failed as u64;
                stats.records_reconciled += outcome.incoming.reconciled as u64;
                stats.records_uploaded += outcome.uploaded as u64;
                stats.last_error = None;
                stats.last_sync_time = Some(Instant::now());
                info!(
                    collection = %self.config.collection,
                    applied = outcome.incoming.applied,
                    failed = outcome.incoming.failed,
                    uploaded = outcome.uploaded,
                    ms = outcome.duration.as_millis() as u64,
                    "sync pass complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(collection = %self.config.collection, error = %e, "sync pass failed");
                stats.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn run_phases(&self, pass: &mut Pass) -> SyncResult<SyncOutcome> {
        let mut outcome = SyncOutcome::default();

        self.status(Phase::Startup);
        self.startup(pass)?;

        self.status(Phase::Incoming);
        outcome.incoming = self.process_incoming(pass)?;

        self.status(Phase::Outgoing);
        let (uploaded, upload_failed) = self.upload_outgoing(pass)?;
        outcome.uploaded = uploaded;
        outcome.upload_failed = upload_failed;

        self.status(Phase::Finish);
        outcome.deleted = self.finish(pass)?;

        Ok(outcome)
    }

    fn status(&self, phase: Phase) {
        trace!(collection = %self.config.collection, phase = phase.as_str(), "phase");
        self.events.notify(&SyncEvent::Status {
            collection: self.config.collection.clone(),
            phase,
        });
    }

    // ---- STARTUP ----

    fn startup(&self, pass: &mut Pass) -> SyncResult<()> {
        let collection = self.config.collection.as_str();
        let version = self.config.version;

        let meta = self.transport.fetch_meta_global()?;
        let remote = meta
            .as_ref()
            .map(|meta| meta.engine(collection))
            .unwrap_or_default();

        if remote.version > version {
            return Err(SyncError::VersionOutOfDate {
                local: version,
                remote: remote.version,
            });
        }

        let mut state = self.state_store.load(collection)?;

        if remote.version < version {
            let sync_id = new_sync_id();
            info!(
                collection,
                remote = remote.version,
                local = version,
                sync_id = %sync_id,
                "publishing new engine version"
            );
            let mut meta = meta.unwrap_or_else(|| MetaGlobal {
                sync_id: Some(new_sync_id()),
                storage_version: Some(STORAGE_VERSION),
                ..MetaGlobal::default()
            });
            meta.set_engine(collection, version, sync_id.clone());
            self.transport.put_meta_global(&meta)?;
            self.transport.delete(collection, None)?;

            state.reset();
            state.sync_id = Some(sync_id);
            self.state_store.save(collection, &state)?;
        } else if state.sync_id.as_deref() != Some(remote.sync_id.as_str()) {
            info!(collection, sync_id = %remote.sync_id, "adopting remote sync id");
            state.reset();
            state.sync_id = Some(remote.sync_id);
            self.state_store.save(collection, &state)?;
        }

        if let Some(recovery) = &self.recovery {
            let change = recovery.ensure_keys()?;
            if change.affects(collection) && !state.last_sync.is_zero() {
                info!(collection, ?change, "collection keys changed, resyncing everything");
                state.reset();
                self.state_store.save(collection, &state)?;
            }
        }
        self.keys.read().require_key_for(collection).map(|_| ())?;

        state.last_sync_local = now_millis();
        pass.modified = if state.last_sync.is_zero() {
            self.store
                .get_all_ids()?
                .into_iter()
                .map(|id| (id, 0))
                .collect()
        } else {
            self.tracker.changed_ids()
        };
        self.tracker.clear_changed_ids();
        pass.state = state;

        debug!(
            collection,
            outgoing = pass.modified.len(),
            last_sync = %pass.state.last_sync,
            "startup complete"
        );
        Ok(())
    }

    // ---- INCOMING ----

    fn process_incoming(&self, pass: &mut Pass) -> SyncResult<IncomingCounts> {
        let collection = self.config.collection.as_str();
        let previous_failed: BTreeSet<String> =
            pass.state.previous_failed.iter().cloned().collect();
        let mut incoming = Incoming::default();

        let hint = self.remote_last_modified.write().take();
        let unchanged = matches!(hint, Some(modified) if modified <= pass.state.last_sync);

        if unchanged {
            debug!(collection, "collection unchanged, skipping first page");
        } else {
            self.fetch_first_page(pass, &mut incoming)?;
        }

        let backlog: Vec<String> = pass
            .state
            .to_fetch
            .iter()
            .chain(previous_failed.iter())
            .filter(|id| !incoming.handled.contains(*id))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let fetched = self.fetch_backlog(pass, &mut incoming, backlog);

        let repeat: BTreeSet<&String> = incoming.failed.intersection(&previous_failed).collect();
        incoming.counts.failed = incoming.failed.len();
        incoming.counts.new_failed = incoming.failed.len() - repeat.len();

        let mut still_pending: BTreeSet<String> = previous_failed
            .iter()
            .filter(|id| !incoming.handled.contains(*id))
            .cloned()
            .collect();
        still_pending.extend(
            incoming
                .failed
                .iter()
                .filter(|id| !previous_failed.contains(*id))
                .cloned(),
        );
        pass.state.previous_failed = still_pending.into_iter().collect();
        self.state_store.save(collection, &pass.state)?;

        if incoming.counts.failed > 0 {
            warn!(
                collection,
                failed = incoming.counts.failed,
                new_failed = incoming.counts.new_failed,
                "some incoming records failed"
            );
            self.events.notify(&SyncEvent::ApplyFailed {
                collection: collection.to_string(),
                counts: incoming.counts,
            });
        }

        fetched?;
        debug!(
            collection,
            applied = incoming.counts.applied,
            reconciled = incoming.counts.reconciled,
            "incoming complete"
        );
        Ok(incoming.counts)
    }

    fn fetch_first_page(&self, pass: &mut Pass, incoming: &mut Incoming) -> SyncResult<()> {
        let collection = self.config.collection.as_str();
        let limit = self.config.first_page_limit();

        let mut query = CollectionQuery::new()
            .full()
            .newer_than(pass.state.last_sync);
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        let page = self
            .transport
            .get(collection, &query)
            .map_err(SyncError::download_failed)?;
        trace!(collection, records = page.len(), "first page");

        self.handle_page(pass, incoming, &page)?;

        if limit.is_some_and(|limit| page.len() >= limit) {
            let mut ids_query = CollectionQuery::new()
                .newer_than(pass.state.last_sync)
                .sort(SortOrder::Index);
            if let Some(download_limit) = self.config.download_limit {
                ids_query = ids_query.limit(download_limit);
            }
            let ids = self
                .transport
                .get_ids(collection, &ids_query)
                .map_err(SyncError::download_failed)?;

            let mut to_fetch: BTreeSet<String> = pass.state.to_fetch.drain(..).collect();
            to_fetch.extend(ids.into_iter().filter(|id| !incoming.handled.contains(id)));
            debug!(collection, to_fetch = to_fetch.len(), "first page overflowed");
            pass.state.to_fetch = to_fetch.into_iter().collect();
        }

        advance(&mut pass.state.last_sync, page.max_modified());
        pass.state
            .to_fetch
            .retain(|id| !incoming.handled.contains(id));
        self.state_store.save(collection, &pass.state)
    }

    /// Fetches `backlog` by ID on scoped worker threads. Pages are handled
    /// on this thread in completion order. After a failure nothing further
    /// is handled; in-flight requests are drained and the first error is
    /// returned.
    fn fetch_backlog(
        &self,
        pass: &mut Pass,
        incoming: &mut Incoming,
        backlog: Vec<String>,
    ) -> SyncResult<()> {
        if backlog.is_empty() {
            return Ok(());
        }
        let collection = self.config.collection.as_str();
        let chunks: Vec<Vec<String>> = backlog
            .chunks(self.config.guid_batch_size())
            .map(<[String]>::to_vec)
            .collect();
        let workers = self.config.fetch_concurrency.clamp(1, chunks.len());
        debug!(collection, ids = backlog.len(), batches = chunks.len(), workers, "fetching backlog");

        let next = AtomicUsize::new(0);
        let aborting = AtomicBool::new(false);
        let transport = &*self.transport;
        let chunks = &chunks;
        let mut first_error = None;

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                let aborting = &aborting;
                scope.spawn(move || loop {
                    if aborting.load(Ordering::SeqCst) {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(ids) = chunks.get(index) else {
                        break;
                    };
                    let query = CollectionQuery::new().full().ids(ids.iter().cloned());
                    let outcome = match transport.get(collection, &query) {
                        Ok(page) => BatchOutcome::Fetched { index, page },
                        Err(error) => {
                            aborting.store(true, Ordering::SeqCst);
                            BatchOutcome::Failed { index, error }
                        }
                    };
                    if tx.send(outcome).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            for outcome in rx {
                match outcome {
                    BatchOutcome::Fetched { index, page } => {
                        if aborting.load(Ordering::SeqCst) {
                            trace!(collection, index, "aborting, batch dropped");
                            continue;
                        }
                        if let Err(e) = self.complete_batch(pass, incoming, &chunks[index], &page)
                        {
                            aborting.store(true, Ordering::SeqCst);
                            first_error.get_or_insert(e);
                        }
                    }
                    BatchOutcome::Failed { index, error } => {
                        warn!(collection, index, error = %error, "backlog batch failed");
                        first_error.get_or_insert(error.download_failed());
                    }
                }
            }
        });

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn complete_batch(
        &self,
        pass: &mut Pass,
        incoming: &mut Incoming,
        ids: &[String],
        page: &CollectionPage,
    ) -> SyncResult<()> {
        self.handle_page(pass, incoming, page)?;
        incoming.handled.extend(ids.iter().cloned());
        pass.state.to_fetch.retain(|id| !ids.contains(id));
        advance(&mut pass.state.last_sync, page.max_modified());
        self.state_store.save(&self.config.collection, &pass.state)
    }

    fn handle_page(
        &self,
        pass: &mut Pass,
        incoming: &mut Incoming,
        page: &CollectionPage,
    ) -> SyncResult<()> {
        for bso in &page.records {
            self.handle_record(pass, incoming, bso, page.server_time);
            if incoming.pending.len() >= self.config.apply_batch_size {
                self.flush(incoming);
            }
        }
        self.flush(incoming);
        Ok(())
    }

    fn handle_record(
        &self,
        pass: &mut Pass,
        incoming: &mut Incoming,
        bso: &Bso,
        server_now: ServerTimestamp,
    ) {
        let id = bso.id.as_str();
        incoming.handled.insert(bso.id.clone());

        let mut record = match self.decrypt(bso) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(id, error = %e, "could not decrypt incoming record");
                incoming.failed.insert(bso.id.clone());
                return;
            }
        };

        let clocks = Clocks {
            server_now,
            local_now: now_millis(),
        };
        let decision = match reconcile(&record, bso.modified, &pass.modified, &*self.store, clocks) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(id, error = %e, "could not reconcile incoming record");
                incoming.failed.insert(bso.id.clone());
                return;
            }
        };
        trace!(id, ?decision, "reconciled");

        match &decision {
            Decision::SkipIdentical | Decision::TakeRemote => {
                pass.modified.remove(id);
            }
            Decision::MergeDuplicate {
                winner,
                loser,
                local_wins,
            } => {
                if *local_wins {
                    record.id = winner.clone();
                    self.tracker.add_changed_id(winner, 0);
                } else {
                    let _ignore = IgnoreAllGuard::new(&*self.tracker);
                    if let Err(e) = self.store.change_item_id(loser, winner) {
                        warn!(id, error = %e, "could not rename duplicate");
                        incoming.failed.insert(bso.id.clone());
                        return;
                    }
                }
                pass.modified.remove(loser);
                pass.delete_ids.push(loser.clone());
            }
            _ => {}
        }

        if decision.should_apply() {
            incoming.pending.push(record);
        } else {
            incoming.counts.reconciled += 1;
        }
    }

    /// Decrypts an incoming envelope. `Ok(None)` means recovery chose to
    /// skip the record.
    fn decrypt(&self, bso: &Bso) -> SyncResult<Option<Cleartext>> {
        let collection = self.config.collection.as_str();
        let mut may_retry = true;
        loop {
            let mut record = EncryptedRecord::from_bso(bso)?;
            let result = {
                let keys = self.keys.read();
                let bundle = keys.require_key_for(collection)?;
                record.decrypt(bundle).map(|_| ())
            };

            match result {
                Ok(()) => {
                    return record
                        .into_cleartext()
                        .map(Some)
                        .ok_or_else(|| CryptoError::NoCleartext { id: bso.id.clone() }.into());
                }
                Err(e) if e.is_hmac_mismatch() => {
                    let strategy = match &self.recovery {
                        Some(recovery) => recovery.handle_hmac_mismatch(&bso.id, may_retry),
                        None => RecoveryStrategy::Error,
                    };
                    debug!(id = %bso.id, ?strategy, "HMAC mismatch");
                    match strategy {
                        RecoveryStrategy::Retry => may_retry = false,
                        RecoveryStrategy::Ignore => return Ok(None),
                        RecoveryStrategy::Error => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn flush(&self, incoming: &mut Incoming) {
        if incoming.pending.is_empty() {
            return;
        }
        let records = std::mem::take(&mut incoming.pending);
        let failed = {
            let _ignore = IgnoreAllGuard::new(&*self.tracker);
            self.store.apply_incoming_batch(&records)
        };
        incoming.counts.applied += records.len() - failed.len();
        incoming.failed.extend(failed);
    }

    // ---- OUTGOING ----

    fn upload_outgoing(&self, pass: &mut Pass) -> SyncResult<(usize, usize)> {
        if pass.modified.is_empty() {
            return Ok((0, 0));
        }
        let collection = self.config.collection.as_str();
        let ids: Vec<String> = pass.modified.keys().cloned().collect();
        debug!(collection, outgoing = ids.len(), "uploading");

        let mut uploaded = 0;
        let mut failed = 0;
        let mut batch = Vec::new();
        for id in &ids {
            match self.build_outgoing(id) {
                Ok(bso) => batch.push(bso),
                Err(e) => {
                    warn!(collection, id = %id, error = %e, "could not build outgoing record");
                    failed += 1;
                }
            }
            if batch.len() >= self.config.max_upload_records {
                let (ok, rejected) = self.post_batch(pass, std::mem::take(&mut batch))?;
                uploaded += ok;
                failed += rejected;
            }
        }
        if !batch.is_empty() {
            let (ok, rejected) = self.post_batch(pass, batch)?;
            uploaded += ok;
            failed += rejected;
        }
        Ok((uploaded, failed))
    }

    fn build_outgoing(&self, id: &str) -> SyncResult<Bso> {
        let cleartext = self.store.create_record(id)?;
        let mut record = EncryptedRecord::from_cleartext(cleartext);
        {
            let keys = self.keys.read();
            record.encrypt(keys.require_key_for(&self.config.collection)?)?;
        }
        Ok(record.to_bso()?)
    }

    fn post_batch(&self, pass: &mut Pass, batch: Vec<Bso>) -> SyncResult<(usize, usize)> {
        let collection = self.config.collection.as_str();
        let response = self
            .transport
            .post(collection, &batch)
            .map_err(SyncError::upload_failed)?;

        for id in &response.success {
            pass.modified.remove(id);
        }
        for (id, reasons) in &response.failed {
            warn!(collection, id = %id, ?reasons, "server rejected record");
        }
        advance(&mut pass.state.last_sync, Some(response.modified));
        self.state_store.save(collection, &pass.state)?;

        Ok((response.success.len(), response.failed.len()))
    }

    // ---- FINISH / CLEANUP ----

    fn finish(&self, pass: &mut Pass) -> SyncResult<usize> {
        let ids: Vec<String> = std::mem::take(&mut pass.delete_ids)
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for chunk in ids.chunks(self.config.delete_batch_size()) {
            self.transport.delete(&self.config.collection, Some(chunk))?;
        }
        if !ids.is_empty() {
            debug!(collection = %self.config.collection, deleted = ids.len(), "deleted duplicates");
        }
        self.tracker.reset_score();
        Ok(ids.len())
    }

    fn cleanup(&self, pass: &mut Pass) {
        self.status(Phase::Cleanup);
        let remaining = std::mem::take(&mut pass.modified);
        if !remaining.is_empty() {
            debug!(
                collection = %self.config.collection,
                remaining = remaining.len(),
                "returning changes to tracker"
            );
        }
        for (id, when) in remaining {
            self.tracker.add_changed_id(&id, when);
        }
        pass.delete_ids.clear();
    }

    // ---- Maintenance ----

    /// Forgets timestamps and pending fetches so the next pass starts over.
    pub fn reset_client(&self) -> SyncResult<()> {
        let collection = self.config.collection.as_str();
        let mut state = self.state_store.load(collection)?;
        state.reset();
        self.state_store.save(collection, &state)?;
        info!(collection, "client state reset");
        Ok(())
    }

    /// Deletes the whole collection on the server and resets local state.
    pub fn wipe_server(&self) -> SyncResult<()> {
        self.transport.delete(&self.config.collection, None)?;
        self.reset_client()
    }

    /// Deletes every local item and pending change, then resets local state.
    pub fn wipe_client(&self) -> SyncResult<()> {
        {
            let _ignore = IgnoreAllGuard::new(&*self.tracker);
            self.store.wipe()?;
        }
        self.tracker.clear_changed_ids();
        self.reset_client()
    }

    /// Returns true if the newest record on the server decrypts with the
    /// current keys. An empty collection cannot be decrypted.
    pub fn can_decrypt(&self) -> SyncResult<bool> {
        let collection = self.config.collection.as_str();
        let query = CollectionQuery::new()
            .full()
            .sort(SortOrder::Newest)
            .limit(1);
        let page = self.transport.get(collection, &query)?;
        let Some(bso) = page.records.first() else {
            return Ok(false);
        };

        let mut record = match EncryptedRecord::from_bso(bso) {
            Ok(record) => record,
            Err(e) => {
                debug!(collection, error = %e, "newest record is not an encrypted envelope");
                return Ok(false);
            }
        };
        let keys = self.keys.read();
        let Some(bundle) = keys.key_for_collection(collection) else {
            return Ok(false);
        };
        match record.decrypt(bundle) {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!(collection, error = %e, "cannot decrypt newest record");
                Ok(false)
            }
        }
    }
}

fn advance(watermark: &mut ServerTimestamp, candidate: Option<ServerTimestamp>) {
    if let Some(candidate) = candidate {
        if candidate > *watermark {
            *watermark = candidate;
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A fresh 12-character sync ID.
fn new_sync_id() -> String {
    let mut bytes = [0u8; 9];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
