//! The classification manager.
//!
//! Owns the discrimination trie, the class object cache, and the persistent
//! trees, and exposes the engine's public surface: classify, index, class
//! lifecycle transactions, bulk reclassification, and the recovery entry
//! points.
//!
//! Lock order: the structural lock guards the trie and is taken shared for
//! classification, exclusive for class creation/drop; per-class index locks
//! are taken only while it is held (see [`StructuralToken`]), ascending by
//! class id during a flush (the pending map's iteration order).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use sled::Db;
use tracing::{debug, info, warn};

use taxodb_proto::{PropertyId, RecordAddr, RecordId, RecordView, Value};

use crate::class::{
    ClassCatalog, ClassDef, ClassDescriptor, ClassId, ClassState, Condition,
};
use crate::classify::cache::{ClassEntry, ClassObjectCache, DEFAULT_CLASS_CACHE_SIZE};
use crate::classify::result::ClassificationResult;
use crate::classify::trie::PropertyDiscriminationIndex;
use crate::error::Error;
use crate::index::{self, ClassIndex, IndexParams, MembershipTree, PostingsTree, KEY_FORMAT_V1};
use crate::lock::StructuralToken;
use crate::txn::{IndexOp, PendingClassOp, PendingKey, PendingPosting, Session};

/// Records per batch in bulk (re)classification; bounds peak memory to
/// O(batch) instead of O(dataset).
pub const BATCH_SIZE: usize = 1000;

/// Sled tree holding index parameter blocks keyed by class id.
const PARAMS_TREE: &str = "classes:idxparams";

/// How long a commit waits for the exclusive structural lock before
/// reporting `Busy`.
const LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// A property value change carried by an update, so index maintenance can
/// derive the posting key the record had before the mutation.
#[derive(Debug, Clone)]
pub struct PropertyDelta {
    /// Changed property.
    pub prop: PropertyId,
    /// Value before the update; None when the property was absent.
    pub old: Option<Value>,
    /// Value after the update; None when the property was removed.
    pub new: Option<Value>,
}

/// An owned record produced by a [`RecordSource`].
#[derive(Debug, Clone)]
pub struct OwnedRecord {
    /// Persistent record id.
    pub id: RecordId,
    /// Physical location hint.
    pub addr: RecordAddr,
    /// Sorted (property id, value) pairs.
    pub props: Vec<(PropertyId, Value)>,
}

impl OwnedRecord {
    /// Borrow as a classification view.
    pub fn view(&self) -> RecordView<'_> {
        RecordView::new(self.id, self.addr, &self.props)
    }
}

/// Source of records for bulk reclassification: the record-enumeration
/// collaborator of the storage layer.
pub trait RecordSource {
    /// Produce the next batch of records, at most `max`. An empty batch
    /// ends the scan.
    fn next_batch(&mut self, max: usize) -> Result<Vec<OwnedRecord>, Error>;
}

/// A record source over an in-memory collection.
pub struct MemoryRecordSource {
    records: Vec<OwnedRecord>,
    pos: usize,
}

impl MemoryRecordSource {
    /// Wrap a collection of records.
    pub fn new(records: Vec<OwnedRecord>) -> Self {
        Self { records, pos: 0 }
    }
}

impl RecordSource for MemoryRecordSource {
    fn next_batch(&mut self, max: usize) -> Result<Vec<OwnedRecord>, Error> {
        let end = (self.pos + max).min(self.records.len());
        let batch = self.records[self.pos..end].to_vec();
        self.pos = end;
        Ok(batch)
    }
}

/// A held shared structural lock.
///
/// Mints the [`StructuralToken`] that per-class index operations demand, so
/// membership scans outside the classifier (query-time lookups,
/// notification) follow the same lock order as everything else.
pub struct StructuralGuard<'a> {
    _guard: parking_lot::RwLockReadGuard<'a, PropertyDiscriminationIndex>,
}

impl StructuralGuard<'_> {
    /// Proof of the held structural lock.
    pub fn token(&self) -> StructuralToken<'_> {
        StructuralToken::new()
    }
}

/// The classification manager.
pub struct Classifier {
    _db: Db,
    catalog: ClassCatalog,
    postings: PostingsTree,
    members: MembershipTree,
    params_tree: sled::Tree,
    structural: RwLock<PropertyDiscriminationIndex>,
    cache: ClassObjectCache,
    next_class_id: AtomicU32,
    max_property_id: AtomicU32,
}

impl Classifier {
    /// Open or create a classifier rooted at the given directory and
    /// rehydrate the class set from the persisted definitions.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with_cache_size(dir, DEFAULT_CLASS_CACHE_SIZE)
    }

    /// Open with an explicit class cache target size.
    pub fn open_with_cache_size(dir: impl AsRef<Path>, cache_size: usize) -> Result<Self, Error> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| Error::Internal(e.to_string()))?;
        let db: Db = sled::Config::new().path(dir.join("catalog")).open()?;
        let catalog = ClassCatalog::open(&db)?;
        let members = MembershipTree::open(&db)?;
        let params_tree = db.open_tree(PARAMS_TREE)?;
        let postings = PostingsTree::open(dir.join("postings"))?;

        let classifier = Self {
            _db: db,
            catalog,
            postings,
            members,
            params_tree,
            structural: RwLock::new(PropertyDiscriminationIndex::new()),
            cache: ClassObjectCache::new(cache_size),
            next_class_id: AtomicU32::new(1),
            max_property_id: AtomicU32::new(0),
        };
        classifier.init_classes()?;
        Ok(classifier)
    }

    /// Rehydrate the class set and discrimination trie from the persisted
    /// catalog. Corrupt definitions are quarantined: logged, skipped, and
    /// left untouched on disk. Returns the number of classes loaded.
    pub fn init_classes(&self) -> Result<usize, Error> {
        let (defs, quarantined) = self.catalog.load_all()?;

        let mut trie = self.structural.write();
        *trie = PropertyDiscriminationIndex::new();
        self.cache.clear();

        let mut max_class = 0;
        let mut max_prop = 0;
        for def in &defs {
            max_class = max_class.max(def.id);
            max_prop = max_prop.max(
                def.condition
                    .referenced_properties()
                    .last()
                    .copied()
                    .unwrap_or(0),
            );
            let descriptor = Arc::new(ClassDescriptor::from_def(def.clone(), ClassState::Active));
            trie.add(Arc::clone(&descriptor))?;
            self.cache
                .insert(def.id, Arc::new(self.build_entry(descriptor)?));
        }

        let stored_next = self.catalog.next_class_id()?;
        self.next_class_id
            .store(stored_next.max(max_class + 1), Ordering::SeqCst);
        let stored_prop = self.catalog.max_property_id()?.unwrap_or(0);
        self.max_property_id
            .store(stored_prop.max(max_prop), Ordering::SeqCst);

        info!(
            classes = defs.len(),
            quarantined = quarantined.len(),
            "class set initialized"
        );
        Ok(defs.len())
    }

    /// Determine the classes a record currently satisfies.
    ///
    /// Takes the structural lock shared for the whole trie walk plus
    /// confirmation, so a concurrent class create/drop serializes entirely
    /// before or after this call. A predicate failure (panic in the
    /// evaluation collaborator) is isolated to its class: logged, skipped,
    /// and the remaining candidates still evaluated.
    pub fn classify(
        &self,
        record: &RecordView<'_>,
        result: &mut ClassificationResult,
    ) -> Result<(), Error> {
        let trie = self.structural.read();
        Self::classify_locked(&trie, record, result)
    }

    fn classify_locked(
        trie: &PropertyDiscriminationIndex,
        record: &RecordView<'_>,
        result: &mut ClassificationResult,
    ) -> Result<(), Error> {
        let props: Vec<PropertyId> = record.property_ids().collect();
        for candidates in trie.candidates(&props) {
            for descriptor in candidates {
                if !descriptor.is_classifiable() {
                    continue;
                }
                let confirmed =
                    catch_unwind(AssertUnwindSafe(|| descriptor.condition().matches(record)));
                match confirmed {
                    Ok(true) => {
                        result.insert(Arc::clone(descriptor))?;
                    }
                    Ok(false) => {}
                    Err(_) => {
                        // Isolated to this candidate; the classify call
                        // itself carries on.
                        warn!(
                            class = descriptor.id(),
                            record = record.id,
                            "predicate evaluation panicked; class skipped"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Bulk (re)classification in fixed-size batches. Each batch is
    /// classified, confirmed, and indexed before the next starts, and the
    /// structural lock is released between batches so concurrent
    /// single-record classification is never starved.
    ///
    /// With `deleting` set the matched classes receive DELETE postings
    /// (used when dropping a class against existing data).
    pub fn classify_all(
        &self,
        source: &mut dyn RecordSource,
        session: &mut Session,
        deleting: bool,
    ) -> Result<u64, Error> {
        let op = if deleting {
            IndexOp::Delete
        } else {
            IndexOp::Insert
        };
        let mut total = 0u64;
        loop {
            let batch = source.next_batch(BATCH_SIZE)?;
            if batch.is_empty() {
                break;
            }
            let mut results = Vec::with_capacity(batch.len());
            {
                let trie = self.structural.read();
                for record in &batch {
                    let mut result = ClassificationResult::new();
                    Self::classify_locked(&trie, &record.view(), &mut result)?;
                    results.push(result);
                }
            } // lock released before indexing and before the next batch
            for (record, result) in batch.iter().zip(&results) {
                self.index(session, &record.view(), result, op, &[])?;
            }
            total += batch.len() as u64;
        }
        Ok(total)
    }

    /// Translate a record mutation into posting operations on every class in
    /// `result`, buffered in the session until commit.
    pub fn index(
        &self,
        session: &mut Session,
        record: &RecordView<'_>,
        result: &ClassificationResult,
        op: IndexOp,
        deltas: &[PropertyDelta],
    ) -> Result<(), Error> {
        for descriptor in result.classes() {
            if !descriptor.is_indexed() {
                session.buffer_posting(
                    PendingKey {
                        class: descriptor.id(),
                        key: Vec::new(),
                        record: record.id,
                    },
                    op,
                );
                continue;
            }

            let Some(new_key) = Self::posting_key_of(descriptor, record) else {
                // The record no longer carries every index property; there
                // is no key to maintain.
                debug!(
                    class = descriptor.id(),
                    record = record.id,
                    "record lacks index properties; no posting"
                );
                continue;
            };

            if op == IndexOp::Update {
                match Self::old_posting_key_of(descriptor, record, deltas) {
                    Some(old_key) if old_key != new_key => {
                        session.buffer_posting(
                            PendingKey {
                                class: descriptor.id(),
                                key: old_key,
                                record: record.id,
                            },
                            IndexOp::Delete,
                        );
                        session.buffer_posting(
                            PendingKey {
                                class: descriptor.id(),
                                key: new_key,
                                record: record.id,
                            },
                            IndexOp::Insert,
                        );
                    }
                    Some(_) => {
                        session.buffer_posting(
                            PendingKey {
                                class: descriptor.id(),
                                key: new_key,
                                record: record.id,
                            },
                            IndexOp::Update,
                        );
                    }
                    None => {
                        // No prior key: the record just gained the index
                        // properties, so this update inserts its posting.
                        session.buffer_posting(
                            PendingKey {
                                class: descriptor.id(),
                                key: new_key,
                                record: record.id,
                            },
                            IndexOp::Insert,
                        );
                    }
                }
            } else {
                session.buffer_posting(
                    PendingKey {
                        class: descriptor.id(),
                        key: new_key,
                        record: record.id,
                    },
                    op,
                );
            }
        }
        Ok(())
    }

    /// Register a class inside the session's transaction. The id is
    /// assigned immediately from the monotonic counter and never reused,
    /// but the class is published only at commit.
    pub fn add_class(
        &self,
        session: &mut Session,
        name: impl Into<String>,
        condition: Condition,
        notifications: u16,
    ) -> Result<ClassId, Error> {
        let id = self.next_class_id.fetch_add(1, Ordering::SeqCst);
        let def = ClassDef::new(id, name, condition).with_notifications(notifications);
        debug!(class = id, name = %def.name, "class creation buffered");
        session.push_class_op(PendingClassOp::Create(def));
        Ok(id)
    }

    /// Register a class that opts out of trie narrowing: no index
    /// properties, evaluated against every record.
    pub fn add_unindexed_class(
        &self,
        session: &mut Session,
        name: impl Into<String>,
        condition: Condition,
        notifications: u16,
    ) -> Result<ClassId, Error> {
        let id = self.next_class_id.fetch_add(1, Ordering::SeqCst);
        let def = ClassDef::new(id, name, condition)
            .with_notifications(notifications)
            .unindexed();
        debug!(class = id, name = %def.name, "escape class creation buffered");
        session.push_class_op(PendingClassOp::Create(def));
        Ok(id)
    }

    /// Request a class drop inside the session's transaction. The
    /// descriptor moves to PendingDelete (rolled back by an aborting
    /// `class_tx`); the drop takes effect at commit.
    pub fn drop_class(&self, session: &mut Session, id: ClassId) -> Result<(), Error> {
        let pending_create = session
            .pending_class_ops()
            .iter()
            .any(|op| matches!(op, PendingClassOp::Create(def) if def.id == id));
        if !pending_create {
            let trie = self.structural.read();
            let entry = self.load_entry(&trie, id)?;
            entry
                .descriptor
                .transition(ClassState::Active, ClassState::PendingDelete);
        }
        debug!(class = id, "class drop buffered");
        session.push_class_op(PendingClassOp::Drop(id));
        Ok(())
    }

    /// Commit or roll back the session's pending class definitions and
    /// posting operations.
    ///
    /// On commit, net class changes are merged into the catalog and trie
    /// under the exclusive structural lock, then the pending postings flush
    /// in (class, key) order. On rollback both pending lists are discarded
    /// and PendingDelete descriptors return to Active; no partial flush is
    /// ever visible to other sessions.
    pub fn class_tx(&self, session: &mut Session, commit: bool) -> Result<(), Error> {
        if !commit {
            let trie = self.structural.read();
            for op in session.pending_class_ops() {
                if let PendingClassOp::Drop(id) = op {
                    if let Ok(entry) = self.load_entry(&trie, *id) {
                        entry
                            .descriptor
                            .transition(ClassState::PendingDelete, ClassState::Active);
                    }
                }
            }
            drop(trie);
            session.discard();
            return Ok(());
        }

        let (class_ops, postings) = session.take_pending();
        let net_ops = Session::net_class_ops(class_ops);

        // Bounded wait: a commit that cannot take the structural lock
        // signals a retryable condition instead of blocking indefinitely.
        let mut trie = self
            .structural
            .try_write_for(LOCK_TIMEOUT)
            .ok_or(Error::Busy)?;
        let token = StructuralToken::new();

        for op in net_ops {
            match op {
                PendingClassOp::Create(def) => self.commit_create(&mut trie, def)?,
                PendingClassOp::Drop(id) => self.commit_drop(&mut trie, &token, id)?,
            }
        }

        for (key, state) in postings {
            self.apply_posting(&trie, &token, key, state)?;
        }
        drop(trie);

        self.catalog.flush()?;
        self.members.flush()?;
        Ok(())
    }

    fn commit_create(
        &self,
        trie: &mut PropertyDiscriminationIndex,
        def: ClassDef,
    ) -> Result<(), Error> {
        if self.catalog.contains(def.id)? {
            return Err(Error::AlreadyExists(def.id));
        }
        self.catalog.put(&def)?;
        if !def.index_props.is_empty() {
            let params = IndexParams {
                class: def.id,
                format: KEY_FORMAT_V1,
                segments: def.index_props.clone(),
            };
            self.params_tree
                .insert(def.id.to_be_bytes(), params.encode())?;
        }
        self.catalog
            .store_next_class_id(self.next_class_id.load(Ordering::SeqCst))?;
        if let Some(&max) = def.condition.referenced_properties().last() {
            self.set_max_property_id(max)?;
        }

        let descriptor = Arc::new(ClassDescriptor::from_def(
            def.clone(),
            ClassState::PendingCreate,
        ));
        descriptor.transition(ClassState::PendingCreate, ClassState::Active);
        trie.add(Arc::clone(&descriptor))?;
        self.cache
            .insert(def.id, Arc::new(self.build_entry(descriptor)?));
        info!(class = def.id, name = %def.name, "class published");
        Ok(())
    }

    fn commit_drop(
        &self,
        trie: &mut PropertyDiscriminationIndex,
        token: &StructuralToken<'_>,
        id: ClassId,
    ) -> Result<(), Error> {
        let entry = match self.load_entry(trie, id) {
            Ok(entry) => entry,
            Err(Error::NotFound) => {
                warn!(class = id, "drop of unknown class ignored");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let descriptor = &entry.descriptor;

        // Stop new classification matches; in-flight readers that already
        // hold the descriptor see the state change at confirmation.
        if !descriptor.transition(ClassState::PendingDelete, ClassState::Dying) {
            descriptor.transition(ClassState::Active, ClassState::Dying);
        }
        trie.remove(id, descriptor.index_props())?;

        let dropped = match &entry.index {
            Some(index) => index.drop_postings(token)?,
            None => self.members.drop_class(token, id)?,
        };
        self.catalog.remove(id)?;
        self.params_tree.remove(id.to_be_bytes())?;
        self.cache.remove(id);

        // With the trie and cache references gone, the last handle to drop
        // retires the descriptor.
        if Arc::strong_count(&entry) == 1 {
            descriptor.transition(ClassState::Dying, ClassState::Destroyed);
        }
        info!(class = id, postings = dropped, "class dropped");
        Ok(())
    }

    fn apply_posting(
        &self,
        trie: &PropertyDiscriminationIndex,
        token: &StructuralToken<'_>,
        key: PendingKey,
        state: PendingPosting,
    ) -> Result<(), Error> {
        let entry = match self.load_entry(trie, key.class) {
            Ok(entry) => entry,
            Err(Error::NotFound) => {
                debug!(class = key.class, "posting for dropped class skipped");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if key.key.is_empty() {
            match state {
                PendingPosting::Put { soft_deleted, .. } => {
                    self.members.insert(token, key.class, key.record, soft_deleted)?
                }
                PendingPosting::Remove => self.members.remove(token, key.class, key.record)?,
            }
        } else {
            let Some(index) = &entry.index else {
                debug!(class = key.class, "posting for unindexed class skipped");
                return Ok(());
            };
            match state {
                PendingPosting::Put { soft_deleted, .. } => {
                    index.insert_key(token, &key.key, key.record, soft_deleted)
                }
                PendingPosting::Remove => index.remove_key(token, &key.key),
            }
        }
        Ok(())
    }

    /// Load a class, from cache or catalog.
    pub fn get_class(&self, id: ClassId) -> Result<Arc<ClassDescriptor>, Error> {
        let trie = self.structural.read();
        Ok(Arc::clone(&self.load_entry(&trie, id)?.descriptor))
    }

    /// Load a class plus its (live, soft-deleted) member counts.
    pub fn get_class_info(
        &self,
        id: ClassId,
    ) -> Result<(Arc<ClassDescriptor>, u64, u64), Error> {
        let trie = self.structural.read();
        let token = StructuralToken::new();
        let entry = self.load_entry(&trie, id)?;
        let (live, soft) = match &entry.index {
            Some(index) => index.member_counts(&token)?,
            None => self.members.member_counts(&token, id)?,
        };
        Ok((Arc::clone(&entry.descriptor), live, soft))
    }

    /// Set and clear CLASS_* flag bits, persisting the change. Returns the
    /// previous flags.
    pub fn set_flags(&self, id: ClassId, set: u32, clear: u32) -> Result<u32, Error> {
        let trie = self.structural.read();
        let entry = self.load_entry(&trie, id)?;
        let prev = entry.descriptor.update_flags(set, clear);
        self.catalog.put(&entry.descriptor.to_def())?;
        Ok(prev)
    }

    /// Subscribe to notifications for a class, persisting the mask.
    pub fn enable(&self, id: ClassId, notifications: u16) -> Result<(), Error> {
        let trie = self.structural.read();
        let entry = self.load_entry(&trie, id)?;
        entry.descriptor.subscribe(notifications);
        self.catalog.put(&entry.descriptor.to_def())?;
        Ok(())
    }

    /// Unsubscribe from notifications for a class, persisting the mask.
    pub fn disable(&self, id: ClassId, notifications: u16) -> Result<(), Error> {
        let trie = self.structural.read();
        let entry = self.load_entry(&trie, id)?;
        entry.descriptor.unsubscribe(notifications);
        self.catalog.put(&entry.descriptor.to_def())?;
        Ok(())
    }

    /// Drop a class outside any caller transaction (a one-shot commit).
    pub fn remove(&self, id: ClassId) -> Result<(), Error> {
        let mut session = Session::new();
        self.drop_class(&mut session, id)?;
        self.class_tx(&mut session, true)
    }

    /// Rebuild the trie from the catalog, sweep every class's postings, and
    /// reindex the given records from scratch. Used after recovery when the
    /// membership indexes cannot be trusted.
    pub fn rebuild_all(
        &self,
        session: &mut Session,
        source: &mut dyn RecordSource,
    ) -> Result<u64, Error> {
        let loaded = self.init_classes()?;
        {
            let trie = self.structural.read();
            let token = StructuralToken::new();
            let (defs, _) = self.catalog.load_all()?;
            for def in defs {
                let entry = self.load_entry(&trie, def.id)?;
                match &entry.index {
                    Some(index) => {
                        index.drop_postings(&token)?;
                    }
                    None => {
                        self.members.drop_class(&token, def.id)?;
                    }
                }
            }
        }
        let total = self.classify_all(source, session, false)?;
        self.class_tx(session, true)?;
        info!(classes = loaded, records = total, "full rebuild complete");
        Ok(total)
    }

    /// Recompute the property id high-water mark from the persisted class
    /// definitions and store it.
    pub fn restore_max_property_id(&self) -> Result<PropertyId, Error> {
        let (defs, _) = self.catalog.load_all()?;
        let max = defs
            .iter()
            .filter_map(|def| def.condition.referenced_properties().last().copied())
            .max()
            .unwrap_or(0);
        self.max_property_id.store(max, Ordering::SeqCst);
        self.catalog.store_max_property_id(max)?;
        Ok(max)
    }

    /// Raise the property id high-water mark (monotonic), persisting it.
    pub fn set_max_property_id(&self, id: PropertyId) -> Result<(), Error> {
        let prev = self.max_property_id.fetch_max(id, Ordering::SeqCst);
        if id > prev {
            self.catalog.store_max_property_id(id)?;
        }
        Ok(())
    }

    /// Current property id high-water mark.
    pub fn max_property_id(&self) -> PropertyId {
        self.max_property_id.load(Ordering::SeqCst)
    }

    /// The persisted parameter block of a class's index.
    pub fn index_params(&self, id: ClassId) -> Result<IndexParams, Error> {
        match self.params_tree.get(id.to_be_bytes())? {
            Some(bytes) => IndexParams::decode(&bytes),
            None => Err(Error::NotFound),
        }
    }

    /// Rehydrate an index handle from a parameter block (the tree-connect
    /// hook used after restart).
    pub fn connect_index(&self, params: IndexParams) -> ClassIndex {
        ClassIndex::connect(params, &self.postings)
    }

    /// Number of classes currently anchored for classification.
    pub fn class_count(&self) -> usize {
        self.structural.read().len()
    }

    /// Take the structural lock shared, for callers driving per-class index
    /// scans themselves.
    pub fn lock_shared(&self) -> StructuralGuard<'_> {
        StructuralGuard {
            _guard: self.structural.read(),
        }
    }

    /// A class's current membership postings, in key order.
    pub fn class_members(&self, id: ClassId) -> Result<Vec<index::Posting>, Error> {
        let trie = self.structural.read();
        let token = StructuralToken::new();
        let entry = self.load_entry(&trie, id)?;
        match &entry.index {
            Some(idx) => idx.scan_all(&token),
            None => self.members.scan_class(&token, id),
        }
    }

    /// A class's postings whose key segments equal the given values
    /// (equality membership lookup; only meaningful for indexed classes).
    pub fn class_members_at(
        &self,
        id: ClassId,
        segments: &[&Value],
    ) -> Result<Vec<index::Posting>, Error> {
        let trie = self.structural.read();
        let token = StructuralToken::new();
        let entry = self.load_entry(&trie, id)?;
        match &entry.index {
            Some(idx) => idx.scan_equal(&token, segments),
            None => Err(Error::InvalidParams(
                "class has no key segments to search".into(),
            )),
        }
    }

    fn posting_key_of(descriptor: &ClassDescriptor, record: &RecordView<'_>) -> Option<Vec<u8>> {
        let segments: Option<Vec<&Value>> = descriptor
            .index_props()
            .iter()
            .map(|&p| record.get(p))
            .collect();
        segments.map(|segs| index::key::posting_key(descriptor.id(), &segs, record.id))
    }

    fn old_posting_key_of(
        descriptor: &ClassDescriptor,
        record: &RecordView<'_>,
        deltas: &[PropertyDelta],
    ) -> Option<Vec<u8>> {
        let segments: Option<Vec<&Value>> = descriptor
            .index_props()
            .iter()
            .map(|&p| match deltas.iter().find(|d| d.prop == p) {
                Some(delta) => delta.old.as_ref(),
                None => record.get(p),
            })
            .collect();
        segments.map(|segs| index::key::posting_key(descriptor.id(), &segs, record.id))
    }

    fn build_entry(&self, descriptor: Arc<ClassDescriptor>) -> Result<ClassEntry, Error> {
        let index = if descriptor.is_indexed() {
            let params = match self.params_tree.get(descriptor.id().to_be_bytes())? {
                Some(bytes) => IndexParams::decode(&bytes)?,
                None => IndexParams {
                    class: descriptor.id(),
                    format: KEY_FORMAT_V1,
                    segments: descriptor.index_props().to_vec(),
                },
            };
            Some(Arc::new(ClassIndex::connect(params, &self.postings)))
        } else {
            None
        };
        Ok(ClassEntry { descriptor, index })
    }

    /// Look up a class entry in the cache, loading it from the catalog on a
    /// miss. The trie reference keeps every caller on the same descriptor
    /// instance the classifier publishes to.
    fn load_entry(
        &self,
        trie: &PropertyDiscriminationIndex,
        id: ClassId,
    ) -> Result<Arc<ClassEntry>, Error> {
        if let Some(entry) = self.cache.get(id) {
            return Ok(entry);
        }
        let def = self.catalog.get(id)?.ok_or(Error::NotFound)?;
        let descriptor = trie
            .descriptor_of(id, &def.index_props)
            .unwrap_or_else(|| Arc::new(ClassDescriptor::from_def(def, ClassState::Active)));
        let entry = Arc::new(self.build_entry(descriptor)?);
        self.cache.insert(id, Arc::clone(&entry));
        Ok(entry)
    }
}
