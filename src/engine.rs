/*!
 * Storage engine contract
 * The narrow interface the catalog consumes from a concrete backend: record
 * stores and sorted-data interfaces addressed by opaque idents
 */

use bson::{doc, Bson, Document};

use crate::error::Result;
use crate::recovery_unit::{OperationContext, RecoveryUnit};

/// Engine-opaque handle to a record inside a record store; stable for the
/// record's lifetime except when an update relocates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RecordId(pub i64);

impl RecordId {
    pub const NULL: RecordId = RecordId(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

pub type RecordData = Vec<u8>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// One binary patch of an update-with-damages call.
#[derive(Debug, Clone)]
pub struct Damage {
    pub offset: usize,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CappedSettings {
    pub max_size_bytes: i64,
    pub max_docs: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollectionOptions {
    pub capped: bool,
    pub capped_size: i64,
    pub capped_max_docs: i64,
    pub temp: bool,
}

impl CollectionOptions {
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        if self.capped {
            doc.insert("capped", true);
            doc.insert("size", self.capped_size);
            if self.capped_max_docs > 0 {
                doc.insert("max", self.capped_max_docs);
            }
        }
        if self.temp {
            doc.insert("temp", true);
        }
        doc
    }

    pub fn from_document(doc: &Document) -> CollectionOptions {
        CollectionOptions {
            capped: doc.get_bool("capped").unwrap_or(false),
            capped_size: doc.get_i64("size").unwrap_or(0),
            capped_max_docs: doc.get_i64("max").unwrap_or(0),
            temp: doc.get_bool("temp").unwrap_or(false),
        }
    }

    pub fn capped_settings(&self) -> Option<CappedSettings> {
        if self.capped {
            Some(CappedSettings {
                max_size_bytes: self.capped_size,
                max_docs: if self.capped_max_docs > 0 {
                    Some(self.capped_max_docs)
                } else {
                    None
                },
            })
        } else {
            None
        }
    }
}

/// Index description as persisted in the catalog's `md.indexes[].spec`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDescriptor {
    pub name: String,
    pub key_pattern: Document,
    pub unique: bool,
    /// Collation name applied at compare time; None means binary order.
    pub collation: Option<String>,
}

impl IndexDescriptor {
    pub fn new(name: &str, key_pattern: Document) -> Self {
        Self {
            name: name.to_string(),
            key_pattern,
            unique: false,
            collation: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn to_document(&self) -> Document {
        let mut doc = doc! {
            "name": self.name.clone(),
            "key": self.key_pattern.clone(),
        };
        if self.unique {
            doc.insert("unique", true);
        }
        if let Some(collation) = &self.collation {
            doc.insert("collation", collation.clone());
        }
        doc
    }

    pub fn from_document(doc: &Document) -> Option<IndexDescriptor> {
        Some(IndexDescriptor {
            name: doc.get_str("name").ok()?.to_string(),
            key_pattern: doc.get_document("key").ok()?.clone(),
            unique: doc.get_bool("unique").unwrap_or(false),
            collation: doc.get_str("collation").ok().map(|s| s.to_string()),
        })
    }

    /// Field directions in key-pattern order: 1 ascending, -1 descending.
    pub fn directions(&self) -> Vec<i8> {
        self.key_pattern
            .values()
            .map(|v| match v {
                Bson::Int32(n) if *n < 0 => -1,
                Bson::Int64(n) if *n < 0 => -1,
                Bson::Double(n) if *n < 0.0 => -1,
                _ => 1,
            })
            .collect()
    }
}

pub trait RecordIterator {
    /// Next record in iteration order; a tailable iterator may yield again
    /// after returning None once new records land.
    fn next(&mut self) -> Option<(RecordId, RecordData)>;
}

/// One physical collection store. All mutation participates in the ambient
/// recovery unit of the operation context.
pub trait RecordStore: Send + Sync {
    fn insert_record(&self, opctx: &OperationContext, data: &[u8]) -> Result<RecordId>;

    /// Update in place where possible; returns the (possibly relocated)
    /// record id.
    fn update_record(&self, opctx: &OperationContext, loc: RecordId, data: &[u8]) -> Result<RecordId>;

    fn update_with_damages(
        &self,
        opctx: &OperationContext,
        loc: RecordId,
        damages: &[Damage],
    ) -> Result<()>;

    fn delete_record(&self, opctx: &OperationContext, loc: RecordId) -> Result<()>;

    fn data_for(&self, opctx: &OperationContext, loc: RecordId) -> Result<RecordData>;

    fn iterator(
        &self,
        opctx: &OperationContext,
        start: Option<RecordId>,
        direction: Direction,
        tailable: bool,
    ) -> Box<dyn RecordIterator>;

    fn truncate(&self, opctx: &OperationContext) -> Result<()>;

    fn num_records(&self) -> i64;

    fn data_size(&self) -> i64;

    fn capped_settings(&self) -> Option<CappedSettings>;
}

pub trait SortedDataCursor {
    /// Position at the first entry with exactly (key, loc); returns whether
    /// it exists. The cursor is positioned for iteration either way.
    fn seek_exact(&mut self, key: &[u8], loc: RecordId) -> bool;

    /// Position at the nearest entry at-or-after (forward) / at-or-before
    /// (backward) the given key.
    fn seek(&mut self, key: &[u8]);

    fn next(&mut self) -> Option<(Vec<u8>, RecordId)>;
}

/// One sorted index store. For non-unique indexes the persisted key carries
/// the record id suffix so duplicates order by location; unique indexes map
/// the bare key to one or more locations.
pub trait SortedDataInterface: Send + Sync {
    fn insert(
        &self,
        opctx: &OperationContext,
        key: &[u8],
        loc: RecordId,
        dups_allowed: bool,
    ) -> Result<()>;

    fn unindex(&self, opctx: &OperationContext, key: &[u8], loc: RecordId) -> Result<()>;

    fn cursor(&self, opctx: &OperationContext, direction: Direction) -> Box<dyn SortedDataCursor>;

    fn is_empty(&self, opctx: &OperationContext) -> bool;

    fn num_entries(&self, opctx: &OperationContext) -> i64;
}

/// The contract the catalog consumes. An ident is a one-time-use string:
/// used for one store instance and never again, even across restarts.
pub trait KvEngine: Send + Sync {
    fn new_recovery_unit(&self) -> Box<dyn RecoveryUnit>;

    fn create_record_store(
        &self,
        opctx: &OperationContext,
        ident: &str,
        options: &CollectionOptions,
    ) -> Result<()>;

    /// Opening an ident that was never created is a caller logic error.
    fn get_record_store(
        &self,
        opctx: &OperationContext,
        ns: &str,
        ident: &str,
        options: &CollectionOptions,
    ) -> Result<Box<dyn RecordStore>>;

    fn drop_record_store(&self, opctx: &OperationContext, ident: &str) -> Result<()>;

    fn create_sorted_data_interface(
        &self,
        opctx: &OperationContext,
        ident: &str,
        descriptor: &IndexDescriptor,
    ) -> Result<()>;

    fn get_sorted_data_interface(
        &self,
        opctx: &OperationContext,
        ident: &str,
        descriptor: &IndexDescriptor,
    ) -> Result<Box<dyn SortedDataInterface>>;

    fn drop_sorted_data_interface(&self, opctx: &OperationContext, ident: &str) -> Result<()>;

    fn all_idents(&self) -> Vec<String>;

    /// Purge idents whose drop never fully completed before the last
    /// shutdown. Returns the reclaimed idents.
    fn reclaim_deleted_idents(&self) -> Vec<String> {
        Vec::new()
    }
}

// ---- order-preserving index key encoding ------------------------------------

const TAG_NULL: u8 = 0x10;
const TAG_NUMBER: u8 = 0x20;
const TAG_STRING: u8 = 0x30;
const TAG_OBJECT_ID: u8 = 0x38;
const TAG_BOOL: u8 = 0x40;
const TAG_OTHER: u8 = 0x70;

/// Encode index key values into a byte string whose bytewise order matches
/// the key order, honoring per-field direction and the index collation.
pub struct IndexKeyEncoder {
    directions: Vec<i8>,
    collation: Option<String>,
}

impl IndexKeyEncoder {
    pub fn for_descriptor(descriptor: &IndexDescriptor) -> Self {
        Self {
            directions: descriptor.directions(),
            collation: descriptor.collation.clone(),
        }
    }

    pub fn encode(&self, values: &[Bson]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, value) in values.iter().enumerate() {
            let descending = self.directions.get(i).copied().unwrap_or(1) < 0;
            let mut field = Vec::new();
            self.encode_value(value, &mut field);
            if descending {
                for byte in &mut field {
                    *byte = !*byte;
                }
            }
            out.extend_from_slice(&field);
        }
        out
    }

    fn encode_value(&self, value: &Bson, out: &mut Vec<u8>) {
        match value {
            Bson::Null => out.push(TAG_NULL),
            Bson::Int32(n) => encode_number(*n as f64, out),
            Bson::Int64(n) => encode_number(*n as f64, out),
            Bson::Double(n) => encode_number(*n, out),
            Bson::String(s) => {
                out.push(TAG_STRING);
                let folded;
                let bytes = match self.collation.as_deref() {
                    Some("lowercase") => {
                        folded = s.to_lowercase();
                        folded.as_bytes()
                    }
                    _ => s.as_bytes(),
                };
                out.extend_from_slice(bytes);
                out.push(0x00);
            }
            Bson::ObjectId(oid) => {
                out.push(TAG_OBJECT_ID);
                out.extend_from_slice(&oid.bytes());
            }
            Bson::Boolean(b) => {
                out.push(TAG_BOOL);
                out.push(if *b { 1 } else { 0 });
            }
            other => {
                // Deterministic but not order-preserving; acceptable for
                // types the key encoder does not specialize.
                out.push(TAG_OTHER);
                out.extend_from_slice(format!("{:?}", other).as_bytes());
                out.push(0x00);
            }
        }
    }
}

fn encode_number(value: f64, out: &mut Vec<u8>) {
    out.push(TAG_NUMBER);
    let bits = value.to_bits();
    let ordered = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    };
    out.extend_from_slice(&ordered.to_be_bytes());
}

/// Record id suffix appended to non-unique index keys so duplicates order by
/// location.
pub fn encode_record_id(loc: RecordId) -> [u8; 8] {
    ((loc.0 as u64) ^ (1 << 63)).to_be_bytes()
}
