//! Per-class persistent membership index.
//!
//! Postings for every indexed class live in one shared bf-tree under
//! class-id key prefixes; a [`ClassIndex`] is the per-class handle carrying
//! the class's key format, its own lock, and the parameter block that
//! rehydrates the handle after a restart. Page management (splits,
//! multi-root growth, recovery) belongs to the tree engine.

use std::path::Path;
use std::sync::Arc;

use bf_tree::{BfTree, Config, ScanReturnField};
use parking_lot::RwLock;
use taxodb_proto::{PropertyId, RecordId, RecordView, Value};

use super::key;
use crate::class::ClassId;
use crate::error::Error;
use crate::lock::StructuralToken;

/// Default cache size for the postings tree (64MB).
const DEFAULT_CACHE_SIZE: usize = 64 * 1024 * 1024;

/// Max key length (class id + segments + record id).
const DEFAULT_MAX_KEY_LEN: usize = 256;

/// Max record size for leaf pages.
const DEFAULT_MAX_RECORD_SIZE: usize = 1536;

/// Buffer size for scan operations.
const SCAN_BUFFER_SIZE: usize = 1024;

/// Posting key format understood by this build.
pub const KEY_FORMAT_V1: u8 = 1;

/// Length of an encoded posting payload: record id + state byte.
const POSTING_VALUE_LEN: usize = 9;

/// Posting state: live member.
const STATE_LIVE: u8 = 0x00;
/// Posting state: member soft-deleted, restorable.
const STATE_SOFT_DELETED: u8 = 0x01;

/// One membership posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    /// Member record id.
    pub record: RecordId,
    /// Whether the member is currently soft-deleted.
    pub soft_deleted: bool,
}

/// The shared postings tree backing every class index.
pub struct PostingsTree {
    tree: Arc<BfTree>,
}

impl PostingsTree {
    /// Open or create the postings tree at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut config = Config::new(path.as_ref(), DEFAULT_CACHE_SIZE);
        config.cb_max_key_len(DEFAULT_MAX_KEY_LEN);
        config.cb_max_record_size(DEFAULT_MAX_RECORD_SIZE);
        let tree = BfTree::with_config(config, None)
            .map_err(|e| Error::Index(format!("failed to open postings tree: {:?}", e)))?;
        Ok(Self {
            tree: Arc::new(tree),
        })
    }
}

/// Serialized identity of one class index, persisted so the handle can be
/// reconnected after a restart without recompiling the class definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexParams {
    /// Owning class.
    pub class: ClassId,
    /// Posting key format version.
    pub format: u8,
    /// Key segment property ids, in key order.
    pub segments: Vec<PropertyId>,
}

impl IndexParams {
    /// Encode to the parameter block layout:
    /// `[format:1][class:4][n_segs:2][seg:4 …]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(7 + self.segments.len() * 4);
        buf.push(self.format);
        buf.extend_from_slice(&self.class.to_be_bytes());
        buf.extend_from_slice(&(self.segments.len() as u16).to_be_bytes());
        for seg in &self.segments {
            buf.extend_from_slice(&seg.to_be_bytes());
        }
        buf
    }

    /// Decode a parameter block.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 7 {
            return Err(Error::InvalidParams(format!(
                "parameter block truncated to {} bytes",
                bytes.len()
            )));
        }
        let format = bytes[0];
        if format != KEY_FORMAT_V1 {
            return Err(Error::InvalidParams(format!(
                "unsupported key format {format}"
            )));
        }
        let mut class_buf = [0u8; 4];
        class_buf.copy_from_slice(&bytes[1..5]);
        let class = ClassId::from_be_bytes(class_buf);
        let mut n_buf = [0u8; 2];
        n_buf.copy_from_slice(&bytes[5..7]);
        let n_segs = u16::from_be_bytes(n_buf) as usize;
        if bytes.len() != 7 + n_segs * 4 {
            return Err(Error::InvalidParams(format!(
                "expected {} segment bytes, got {}",
                n_segs * 4,
                bytes.len() - 7
            )));
        }
        let mut segments = Vec::with_capacity(n_segs);
        for chunk in bytes[7..].chunks_exact(4) {
            let mut seg = [0u8; 4];
            seg.copy_from_slice(chunk);
            segments.push(PropertyId::from_be_bytes(seg));
        }
        Ok(Self {
            class,
            format,
            segments,
        })
    }
}

/// Per-class handle over the shared postings tree.
///
/// Carries its own reader/writer lock so concurrent classification of
/// unrelated classes never contends; every operation demands a
/// [`StructuralToken`], making the structural-before-class lock order a
/// compile-time property.
pub struct ClassIndex {
    class: ClassId,
    segments: Vec<PropertyId>,
    format: u8,
    tree: Arc<BfTree>,
    lock: RwLock<()>,
}

impl ClassIndex {
    /// Create the handle for a class's index properties.
    pub fn new(class: ClassId, segments: Vec<PropertyId>, postings: &PostingsTree) -> Self {
        Self {
            class,
            segments,
            format: KEY_FORMAT_V1,
            tree: Arc::clone(&postings.tree),
            lock: RwLock::new(()),
        }
    }

    /// Rehydrate a handle from a persisted parameter block.
    pub fn connect(params: IndexParams, postings: &PostingsTree) -> Self {
        Self {
            class: params.class,
            segments: params.segments,
            format: params.format,
            tree: Arc::clone(&postings.tree),
            lock: RwLock::new(()),
        }
    }

    /// The parameter block identifying this index.
    pub fn params(&self) -> IndexParams {
        IndexParams {
            class: self.class,
            format: self.format,
            segments: self.segments.clone(),
        }
    }

    /// Owning class id.
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// Key segment property ids.
    pub fn segments(&self) -> &[PropertyId] {
        &self.segments
    }

    /// Collect the record's values for this index's key segments; None when
    /// the record lacks one (it then has no posting key in this index).
    pub fn segment_values<'a>(&self, record: &RecordView<'a>) -> Option<Vec<&'a Value>> {
        self.segments.iter().map(|&p| record.get(p)).collect()
    }

    /// The record's full posting key, if it carries every segment.
    pub fn posting_key(&self, record: &RecordView<'_>) -> Option<Vec<u8>> {
        self.segment_values(record)
            .map(|segs| key::posting_key(self.class, &segs, record.id))
    }

    /// Insert (or overwrite) a posting. Inserting the same key twice leaves
    /// one posting.
    pub fn insert_key(
        &self,
        _proof: &StructuralToken<'_>,
        key: &[u8],
        record: RecordId,
        soft_deleted: bool,
    ) {
        let _guard = self.lock.write();
        let mut value = [0u8; POSTING_VALUE_LEN];
        value[..8].copy_from_slice(&record.to_be_bytes());
        value[8] = if soft_deleted {
            STATE_SOFT_DELETED
        } else {
            STATE_LIVE
        };
        self.tree.insert(key, &value);
    }

    /// Remove a posting. Removing an absent posting is a no-op.
    pub fn remove_key(&self, _proof: &StructuralToken<'_>, key: &[u8]) {
        let _guard = self.lock.write();
        self.tree.delete(key);
    }

    /// All postings of the class, in key order.
    pub fn scan_all(&self, _proof: &StructuralToken<'_>) -> Result<Vec<Posting>, Error> {
        let _guard = self.lock.read();
        let prefix = key::class_prefix(self.class);
        self.tree_scan(&key::range_min(&prefix), &key::range_max(&prefix))
    }

    /// Postings whose key segments equal the given values.
    pub fn scan_equal(
        &self,
        _proof: &StructuralToken<'_>,
        segments: &[&Value],
    ) -> Result<Vec<Posting>, Error> {
        let _guard = self.lock.read();
        let prefix = key::search_prefix(self.class, segments);
        self.tree_scan(&key::range_min(&prefix), &key::range_max(&prefix))
    }

    /// Postings with segment values in `[low, high]`.
    pub fn scan_range(
        &self,
        _proof: &StructuralToken<'_>,
        low: &[&Value],
        high: &[&Value],
    ) -> Result<Vec<Posting>, Error> {
        let _guard = self.lock.read();
        let start = key::range_min(&key::search_prefix(self.class, low));
        let end = key::range_max(&key::search_prefix(self.class, high));
        self.tree_scan(&start, &end)
    }

    /// (live, soft-deleted) member counts.
    pub fn member_counts(&self, proof: &StructuralToken<'_>) -> Result<(u64, u64), Error> {
        let postings = self.scan_all(proof)?;
        let soft = postings.iter().filter(|p| p.soft_deleted).count() as u64;
        Ok((postings.len() as u64 - soft, soft))
    }

    /// Remove every posting of the class. Used when the class is dropped.
    ///
    /// Collects the keys first, then deletes, so the sweep does not race its
    /// own scan cursor.
    pub fn drop_postings(&self, _proof: &StructuralToken<'_>) -> Result<usize, Error> {
        let _guard = self.lock.write();
        let prefix = key::class_prefix(self.class);
        let keys = self.tree_scan_keys(&key::range_min(&prefix), &key::range_max(&prefix))?;
        let n = keys.len();
        for k in &keys {
            self.tree.delete(k);
        }
        Ok(n)
    }

    fn tree_scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<Posting>, Error> {
        let mut out = Vec::new();
        let mut buffer = vec![0u8; SCAN_BUFFER_SIZE];
        let mut iter = self
            .tree
            .scan_with_end_key(start, end, ScanReturnField::KeyAndValue)
            .map_err(|e| Error::Index(format!("scan error: {:?}", e)))?;
        while let Some((key_len, value_len)) = iter.next(&mut buffer) {
            let value_end = key_len + value_len;
            if value_len >= POSTING_VALUE_LEN && value_end <= buffer.len() {
                let mut id = [0u8; 8];
                id.copy_from_slice(&buffer[key_len..key_len + 8]);
                out.push(Posting {
                    record: RecordId::from_be_bytes(id),
                    soft_deleted: buffer[key_len + 8] == STATE_SOFT_DELETED,
                });
            }
        }
        Ok(out)
    }

    fn tree_scan_keys(&self, start: &[u8], end: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        let mut keys = Vec::new();
        let mut buffer = vec![0u8; SCAN_BUFFER_SIZE];
        let mut iter = self
            .tree
            .scan_with_end_key(start, end, ScanReturnField::Key)
            .map_err(|e| Error::Index(format!("scan error: {:?}", e)))?;
        while let Some((key_len, _value_len)) = iter.next(&mut buffer) {
            keys.push(buffer[..key_len].to_vec());
        }
        Ok(keys)
    }
}
