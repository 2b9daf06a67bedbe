/*!
 * Collection catalog entries
 * Parsed form of the per-collection metadata document and the handle object
 * the database catalog hands out: record store access plus the index
 * bookkeeping surface
 */

use std::sync::Arc;

use bson::{doc, Bson, Document};

use crate::catalog::KvCatalog;
use crate::engine::{CollectionOptions, IndexDescriptor, KvEngine, RecordId, RecordStore, SortedDataInterface};
use crate::error::{Result, RookDBError};
use crate::recovery_unit::OperationContext;

pub const MAX_ALLOWED_INDEXES: usize = 64;

/// One element of `md.indexes`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMetaData {
    pub spec: Document,
    pub ready: bool,
    pub head: RecordId,
    pub multikey: bool,
}

impl IndexMetaData {
    pub fn new(descriptor: &IndexDescriptor) -> Self {
        Self {
            spec: descriptor.to_document(),
            ready: false,
            head: RecordId::NULL,
            multikey: false,
        }
    }

    pub fn name(&self) -> &str {
        self.spec.get_str("name").unwrap_or("")
    }

    pub fn descriptor(&self) -> Option<IndexDescriptor> {
        IndexDescriptor::from_document(&self.spec)
    }

    fn to_document(&self) -> Document {
        doc! {
            "spec": self.spec.clone(),
            "ready": self.ready,
            "head": self.head.0,
            "multikey": self.multikey,
        }
    }

    fn from_document(doc: &Document) -> Option<IndexMetaData> {
        Some(IndexMetaData {
            spec: doc.get_document("spec").ok()?.clone(),
            ready: doc.get_bool("ready").unwrap_or(false),
            head: RecordId(doc.get_i64("head").unwrap_or(0)),
            multikey: doc.get_bool("multikey").unwrap_or(false),
        })
    }
}

/// Parsed `md` document of a catalog record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollectionMetaData {
    pub ns: String,
    pub options: CollectionOptions,
    pub indexes: Vec<IndexMetaData>,
}

impl CollectionMetaData {
    pub fn find_index(&self, name: &str) -> Option<usize> {
        self.indexes.iter().position(|i| i.name() == name)
    }

    pub fn to_document(&self) -> Document {
        let indexes: Vec<Bson> = self
            .indexes
            .iter()
            .map(|i| Bson::Document(i.to_document()))
            .collect();
        doc! {
            "ns": self.ns.clone(),
            "options": self.options.to_document(),
            "indexes": indexes,
        }
    }

    pub fn from_document(doc: &Document) -> Option<CollectionMetaData> {
        let mut md = CollectionMetaData {
            ns: doc.get_str("ns").ok()?.to_string(),
            options: CollectionOptions::from_document(doc.get_document("options").ok()?),
            indexes: Vec::new(),
        };
        if let Ok(indexes) = doc.get_array("indexes") {
            for entry in indexes {
                if let Bson::Document(d) = entry {
                    md.indexes.push(IndexMetaData::from_document(d)?);
                }
            }
        }
        Some(md)
    }
}

/// Runtime handle for one collection: owns the opened record store and
/// routes metadata mutation through the catalog.
pub struct CollectionCatalogEntry {
    ns: String,
    ident: String,
    engine: Arc<dyn KvEngine>,
    catalog: Arc<KvCatalog>,
    record_store: Arc<dyn RecordStore>,
}

impl CollectionCatalogEntry {
    pub fn new(
        engine: Arc<dyn KvEngine>,
        catalog: Arc<KvCatalog>,
        ns: &str,
        ident: &str,
        record_store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            ns: ns.to_string(),
            ident: ident.to_string(),
            engine,
            catalog,
            record_store,
        }
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn record_store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.record_store)
    }

    pub fn max_allowed_indexes(&self) -> usize {
        MAX_ALLOWED_INDEXES
    }

    pub fn get_metadata(&self, opctx: &OperationContext) -> Result<CollectionMetaData> {
        self.catalog.get_metadata(opctx, &self.ns)
    }

    /// Add the index to the metadata (not yet ready) and create its physical
    /// store; both inside the caller's write unit of work.
    pub fn prepare_for_index_build(
        &self,
        opctx: &OperationContext,
        descriptor: &IndexDescriptor,
    ) -> Result<()> {
        let mut md = self.get_metadata(opctx)?;
        if md.find_index(&descriptor.name).is_some() {
            return Err(RookDBError::BadValue(format!(
                "index {} already exists on {}",
                descriptor.name, self.ns
            )));
        }
        if md.indexes.len() >= MAX_ALLOWED_INDEXES {
            return Err(RookDBError::BadValue(format!(
                "cannot have more than {} indexes on {}",
                MAX_ALLOWED_INDEXES, self.ns
            )));
        }
        md.indexes.push(IndexMetaData::new(descriptor));
        self.catalog.put_metadata(opctx, &self.ns, &md)?;

        let ident = self.catalog.get_index_ident(opctx, &self.ns, &descriptor.name);
        self.engine
            .create_sorted_data_interface(opctx, &ident, descriptor)
    }

    pub fn index_build_success(&self, opctx: &OperationContext, index_name: &str) -> Result<()> {
        let mut md = self.get_metadata(opctx)?;
        let idx = md.find_index(index_name).ok_or_else(|| {
            RookDBError::NamespaceNotFound(format!("index {} not found on {}", index_name, self.ns))
        })?;
        md.indexes[idx].ready = true;
        self.catalog.put_metadata(opctx, &self.ns, &md)
    }

    /// Returns whether the flag actually changed.
    pub fn set_index_is_multikey(
        &self,
        opctx: &OperationContext,
        index_name: &str,
        multikey: bool,
    ) -> Result<bool> {
        let mut md = self.get_metadata(opctx)?;
        let idx = md.find_index(index_name).ok_or_else(|| {
            RookDBError::NamespaceNotFound(format!("index {} not found on {}", index_name, self.ns))
        })?;
        if md.indexes[idx].multikey == multikey {
            return Ok(false);
        }
        md.indexes[idx].multikey = multikey;
        self.catalog.put_metadata(opctx, &self.ns, &md)?;
        Ok(true)
    }

    pub fn set_index_head(
        &self,
        opctx: &OperationContext,
        index_name: &str,
        new_head: RecordId,
    ) -> Result<()> {
        let mut md = self.get_metadata(opctx)?;
        let idx = md.find_index(index_name).ok_or_else(|| {
            RookDBError::NamespaceNotFound(format!("index {} not found on {}", index_name, self.ns))
        })?;
        md.indexes[idx].head = new_head;
        self.catalog.put_metadata(opctx, &self.ns, &md)
    }

    pub fn remove_index(&self, opctx: &OperationContext, index_name: &str) -> Result<()> {
        let mut md = self.get_metadata(opctx)?;
        let idx = md.find_index(index_name).ok_or_else(|| {
            RookDBError::NamespaceNotFound(format!("index {} not found on {}", index_name, self.ns))
        })?;
        let ident = self.catalog.get_index_ident(opctx, &self.ns, index_name);
        md.indexes.remove(idx);
        self.catalog.put_metadata(opctx, &self.ns, &md)?;
        self.engine.drop_sorted_data_interface(opctx, &ident)
    }

    /// The index must already carry an `expireAfterSeconds` field.
    pub fn update_ttl_setting(
        &self,
        opctx: &OperationContext,
        index_name: &str,
        new_expire_seconds: i64,
    ) -> Result<()> {
        let mut md = self.get_metadata(opctx)?;
        let idx = md.find_index(index_name).ok_or_else(|| {
            RookDBError::NamespaceNotFound(format!("index {} not found on {}", index_name, self.ns))
        })?;
        if md.indexes[idx].spec.get("expireAfterSeconds").is_none() {
            return Err(RookDBError::BadValue(format!(
                "index {} on {} has no expireAfterSeconds field",
                index_name, self.ns
            )));
        }
        md.indexes[idx]
            .spec
            .insert("expireAfterSeconds", new_expire_seconds);
        self.catalog.put_metadata(opctx, &self.ns, &md)
    }

    /// Resolve an index by name to an opened sorted-data handle.
    pub fn get_index(
        &self,
        opctx: &OperationContext,
        index_name: &str,
    ) -> Result<Box<dyn SortedDataInterface>> {
        let md = self.get_metadata(opctx)?;
        let idx = md.find_index(index_name).ok_or_else(|| {
            RookDBError::NamespaceNotFound(format!("index {} not found on {}", index_name, self.ns))
        })?;
        let descriptor = md.indexes[idx].descriptor().ok_or_else(|| {
            RookDBError::Storage(format!(
                "index spec for {} on {} does not parse",
                index_name, self.ns
            ))
        })?;
        let ident = self.catalog.get_index_ident(opctx, &self.ns, index_name);
        self.engine.get_sorted_data_interface(opctx, &ident, &descriptor)
    }
}
