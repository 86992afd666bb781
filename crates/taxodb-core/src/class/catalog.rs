//! Persistent class catalog.
//!
//! Committed class definitions live in a sled tree keyed by class id. Each
//! stored value is a blake3 checksum followed by the rkyv payload, so a
//! damaged definition is detected at load time and quarantined instead of
//! producing a garbage descriptor.

use sled::{Db, Tree};
use taxodb_proto::PropertyId;
use tracing::warn;

use super::descriptor::{ClassDef, ClassId};
use crate::error::Error;

/// Tree name for class definitions.
const DEFS_TREE: &str = "classes:defs";

/// Tree name for catalog metadata.
const META_TREE: &str = "classes:meta";

/// Key for the class id high-water mark in the meta tree.
const NEXT_CLASS_ID_KEY: &[u8] = b"next_class_id";

/// Key for the property id high-water mark in the meta tree.
const MAX_PROPERTY_ID_KEY: &[u8] = b"max_property_id";

/// Length of the blake3 checksum prefix.
const CHECKSUM_LEN: usize = 32;

/// The persistent catalog of committed class definitions.
pub struct ClassCatalog {
    defs_tree: Tree,
    meta_tree: Tree,
}

impl ClassCatalog {
    /// Open or create the catalog trees in the given sled database.
    pub fn open(db: &Db) -> Result<Self, Error> {
        let defs_tree = db.open_tree(DEFS_TREE)?;
        let meta_tree = db.open_tree(META_TREE)?;
        Ok(Self {
            defs_tree,
            meta_tree,
        })
    }

    /// Persist a class definition (insert or overwrite).
    pub fn put(&self, def: &ClassDef) -> Result<(), Error> {
        let payload = def.to_bytes()?;
        let mut value = Vec::with_capacity(CHECKSUM_LEN + payload.len());
        value.extend_from_slice(blake3::hash(&payload).as_bytes());
        value.extend_from_slice(&payload);
        self.defs_tree.insert(def.id.to_be_bytes(), value)?;
        Ok(())
    }

    /// Load one class definition.
    pub fn get(&self, id: ClassId) -> Result<Option<ClassDef>, Error> {
        match self.defs_tree.get(id.to_be_bytes())? {
            Some(bytes) => Self::decode(id, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Whether a definition is stored for the id.
    pub fn contains(&self, id: ClassId) -> Result<bool, Error> {
        Ok(self.defs_tree.contains_key(id.to_be_bytes())?)
    }

    /// Remove a class definition.
    pub fn remove(&self, id: ClassId) -> Result<(), Error> {
        self.defs_tree.remove(id.to_be_bytes())?;
        Ok(())
    }

    /// Load every stored definition. Corrupt entries are quarantined: they
    /// are returned separately and do not fail the load.
    pub fn load_all(&self) -> Result<(Vec<ClassDef>, Vec<(ClassId, Error)>), Error> {
        let mut defs = Vec::new();
        let mut quarantined = Vec::new();
        for entry in self.defs_tree.iter() {
            let (key, value) = entry?;
            let id = Self::decode_key(&key)?;
            match Self::decode(id, &value) {
                Ok(def) => defs.push(def),
                Err(err) => {
                    warn!(class = id, error = %err, "quarantining corrupt class definition");
                    quarantined.push((id, err));
                }
            }
        }
        Ok((defs, quarantined))
    }

    /// Next class id to hand out (high-water mark).
    pub fn next_class_id(&self) -> Result<ClassId, Error> {
        Ok(self
            .meta_tree
            .get(NEXT_CLASS_ID_KEY)?
            .map(|b| Self::decode_u32(&b))
            .transpose()?
            .unwrap_or(1))
    }

    /// Persist the class id high-water mark.
    pub fn store_next_class_id(&self, id: ClassId) -> Result<(), Error> {
        self.meta_tree.insert(NEXT_CLASS_ID_KEY, &id.to_be_bytes())?;
        Ok(())
    }

    /// Stored property id high-water mark, if any.
    pub fn max_property_id(&self) -> Result<Option<PropertyId>, Error> {
        self.meta_tree
            .get(MAX_PROPERTY_ID_KEY)?
            .map(|b| Self::decode_u32(&b))
            .transpose()
    }

    /// Persist the property id high-water mark.
    pub fn store_max_property_id(&self, id: PropertyId) -> Result<(), Error> {
        self.meta_tree
            .insert(MAX_PROPERTY_ID_KEY, &id.to_be_bytes())?;
        Ok(())
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.defs_tree.flush()?;
        self.meta_tree.flush()?;
        Ok(())
    }

    fn decode(id: ClassId, bytes: &[u8]) -> Result<ClassDef, Error> {
        if bytes.len() < CHECKSUM_LEN {
            return Err(Error::Corrupt {
                class: id,
                reason: format!("definition truncated to {} bytes", bytes.len()),
            });
        }
        let (checksum, payload) = bytes.split_at(CHECKSUM_LEN);
        let actual = blake3::hash(payload);
        if actual.as_bytes() != checksum {
            return Err(Error::Corrupt {
                class: id,
                reason: format!(
                    "checksum mismatch: stored {}, computed {}",
                    hex::encode(checksum),
                    actual.to_hex()
                ),
            });
        }
        let def = ClassDef::from_bytes(payload).map_err(|e| Error::Corrupt {
            class: id,
            reason: e.to_string(),
        })?;
        if def.id != id {
            return Err(Error::Corrupt {
                class: id,
                reason: format!("definition carries id {}", def.id),
            });
        }
        Ok(def)
    }

    fn decode_key(key: &[u8]) -> Result<ClassId, Error> {
        if key.len() != 4 {
            return Err(Error::Deserialization(format!(
                "bad catalog key: {}",
                hex::encode(key)
            )));
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(key);
        Ok(u32::from_be_bytes(buf))
    }

    fn decode_u32(bytes: &[u8]) -> Result<u32, Error> {
        if bytes.len() != 4 {
            return Err(Error::Deserialization(format!(
                "bad counter value: {}",
                hex::encode(bytes)
            )));
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(buf))
    }
}
