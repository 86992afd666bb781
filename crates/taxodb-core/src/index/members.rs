//! Flat membership tree for classes without index properties.
//!
//! An escape-list class has no key segments to build postings from, but its
//! membership still has to survive restarts and support counting, scans, and
//! drop-cleanup. Entries live in a sled tree keyed
//! `[class_id:4 BE][record_id:8 BE]` with the posting state as the value
//! byte.

use sled::{Db, Tree};
use taxodb_proto::RecordId;

use super::class_index::Posting;
use crate::class::ClassId;
use crate::error::Error;
use crate::lock::StructuralToken;

/// Tree name for flat class membership.
const MEMBERS_TREE: &str = "classes:members";

/// Posting state: live member.
const STATE_LIVE: u8 = 0x00;
/// Posting state: member soft-deleted, restorable.
const STATE_SOFT_DELETED: u8 = 0x01;

/// Membership tree shared by every escape-list class.
pub struct MembershipTree {
    tree: Tree,
}

impl MembershipTree {
    /// Open or create the membership tree in the given sled database.
    pub fn open(db: &Db) -> Result<Self, Error> {
        Ok(Self {
            tree: db.open_tree(MEMBERS_TREE)?,
        })
    }

    fn key(class: ClassId, record: RecordId) -> [u8; 12] {
        let mut key = [0u8; 12];
        key[..4].copy_from_slice(&class.to_be_bytes());
        key[4..].copy_from_slice(&record.to_be_bytes());
        key
    }

    /// Insert (or overwrite) a membership entry.
    pub fn insert(
        &self,
        _proof: &StructuralToken<'_>,
        class: ClassId,
        record: RecordId,
        soft_deleted: bool,
    ) -> Result<(), Error> {
        let state = if soft_deleted {
            STATE_SOFT_DELETED
        } else {
            STATE_LIVE
        };
        self.tree.insert(Self::key(class, record), &[state][..])?;
        Ok(())
    }

    /// Remove a membership entry. Removing an absent entry is a no-op.
    pub fn remove(
        &self,
        _proof: &StructuralToken<'_>,
        class: ClassId,
        record: RecordId,
    ) -> Result<(), Error> {
        self.tree.remove(Self::key(class, record))?;
        Ok(())
    }

    /// Whether the record is a member (live or soft-deleted).
    pub fn contains(
        &self,
        _proof: &StructuralToken<'_>,
        class: ClassId,
        record: RecordId,
    ) -> Result<bool, Error> {
        Ok(self.tree.contains_key(Self::key(class, record))?)
    }

    /// All members of the class, ascending by record id.
    pub fn scan_class(
        &self,
        _proof: &StructuralToken<'_>,
        class: ClassId,
    ) -> Result<Vec<Posting>, Error> {
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(class.to_be_bytes()) {
            let (key, value) = entry?;
            if key.len() != 12 {
                continue;
            }
            let mut rid = [0u8; 8];
            rid.copy_from_slice(&key[4..]);
            out.push(Posting {
                record: RecordId::from_be_bytes(rid),
                soft_deleted: value.first() == Some(&STATE_SOFT_DELETED),
            });
        }
        Ok(out)
    }

    /// (live, soft-deleted) member counts.
    pub fn member_counts(
        &self,
        proof: &StructuralToken<'_>,
        class: ClassId,
    ) -> Result<(u64, u64), Error> {
        let members = self.scan_class(proof, class)?;
        let soft = members.iter().filter(|p| p.soft_deleted).count() as u64;
        Ok((members.len() as u64 - soft, soft))
    }

    /// Remove every member of the class. Used when the class is dropped.
    pub fn drop_class(
        &self,
        proof: &StructuralToken<'_>,
        class: ClassId,
    ) -> Result<usize, Error> {
        let members = self.scan_class(proof, class)?;
        for posting in &members {
            self.tree.remove(Self::key(class, posting.record))?;
        }
        Ok(members.len())
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.tree.flush()?;
        Ok(())
    }
}
