/*!
 * KV catalog
 * The reserved `_mdb_catalog` record store holds one document per
 * collection: `{ns, ident, md, idxIdent}`. The in-memory namespace map is
 * rebuilt from it at start and is the runtime source of truth.
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bson::{doc, Document};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::catalog_entry::CollectionMetaData;
use crate::engine::{CollectionOptions, Direction, RecordId, RecordStore};
use crate::error::{Result, RookDBError};
use crate::recovery_unit::{Change, OperationContext};
use tracing::debug;

/// Reserved name of the catalog's own record store; never a user namespace.
pub const CATALOG_IDENT: &str = "_mdb_catalog";

#[derive(Debug, Clone)]
struct Entry {
    ident: String,
    loc: RecordId,
}

type IdentMap = Arc<Mutex<IndexMap<String, Entry>>>;

struct MapInsertUndo {
    idents: IdentMap,
    ns: String,
}

impl Change for MapInsertUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        self.idents.lock().shift_remove(&self.ns);
    }
}

struct MapRemoveUndo {
    idents: IdentMap,
    ns: String,
    entry: Option<Entry>,
}

impl Change for MapRemoveUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.idents.lock().insert(self.ns.clone(), entry);
        }
    }
}

struct MapRenameUndo {
    idents: IdentMap,
    from: String,
    to: String,
    entry: Option<Entry>,
}

impl Change for MapRenameUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        if let Some(entry) = self.entry.take() {
            let mut idents = self.idents.lock();
            idents.shift_remove(&self.to);
            idents.insert(self.from.clone(), entry);
        }
    }
}

struct MapRelocateUndo {
    idents: IdentMap,
    ns: String,
    old_loc: RecordId,
}

impl Change for MapRelocateUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        if let Some(entry) = self.idents.lock().get_mut(&self.ns) {
            entry.loc = self.old_loc;
        }
    }
}

/// The catalog proper. One per storage engine instance; callers serialize
/// per-namespace mutation through the higher-layer namespace lock, the
/// internal mutex only guards the map itself.
pub struct KvCatalog {
    rs: Arc<dyn RecordStore>,
    rand: String,
    next: AtomicU64,
    idents: IdentMap,
}

impl KvCatalog {
    pub fn new(rs: Arc<dyn RecordStore>) -> Self {
        let mut rng = OsRng;
        Self {
            rs,
            rand: format!("{:x}", rng.next_u64()),
            next: AtomicU64::new(0),
            idents: Arc::new(Mutex::new(IndexMap::new())),
        }
    }

    /// Rebuild the namespace map from the catalog record store.
    pub fn init(&self, opctx: &OperationContext) -> Result<()> {
        let mut iter = self.rs.iterator(opctx, None, Direction::Forward, false);
        let mut idents = self.idents.lock();
        while let Some((loc, data)) = iter.next() {
            let obj: Document = bson::from_slice(&data)?;
            let ns = obj
                .get_str("ns")
                .map_err(|_| RookDBError::Storage("catalog record missing ns".to_string()))?;
            let ident = obj
                .get_str("ident")
                .map_err(|_| RookDBError::Storage("catalog record missing ident".to_string()))?;
            idents.insert(
                ns.to_string(),
                Entry {
                    ident: ident.to_string(),
                    loc,
                },
            );
        }
        debug!("catalog initialized with {} collections", idents.len());
        Ok(())
    }

    pub fn all_collections(&self) -> Vec<String> {
        self.idents.lock().keys().cloned().collect()
    }

    fn generate_ident(&self, prefix: &str) -> String {
        format!(
            "{}-{}-{}",
            prefix,
            self.rand,
            self.next.fetch_add(1, Ordering::SeqCst)
        )
    }

    pub fn new_collection(
        &self,
        opctx: &OperationContext,
        ns: &str,
        options: &CollectionOptions,
    ) -> Result<()> {
        let ident = self.generate_ident(ns);

        let mut idents = self.idents.lock();
        if idents.contains_key(ns) {
            return Err(RookDBError::NamespaceExists(format!(
                "collection {} already exists",
                ns
            )));
        }

        let md = CollectionMetaData {
            ns: ns.to_string(),
            options: options.clone(),
            indexes: Vec::new(),
        };
        let obj = doc! {
            "ns": ns,
            "ident": ident.clone(),
            "md": md.to_document(),
            "idxIdent": {},
        };
        let data = bson::to_vec(&obj)?;
        let loc = self.rs.insert_record(opctx, &data)?;

        idents.insert(ns.to_string(), Entry { ident, loc });
        opctx
            .recovery_unit()
            .register_change(Box::new(MapInsertUndo {
                idents: Arc::clone(&self.idents),
                ns: ns.to_string(),
            }));
        Ok(())
    }

    /// The namespace must be known; the catalog is the source of truth and
    /// callers materialize entries before resolving them.
    pub fn get_collection_ident(&self, ns: &str) -> String {
        let idents = self.idents.lock();
        idents
            .get(ns)
            .unwrap_or_else(|| panic!("getCollectionIdent for unknown namespace '{}'", ns))
            .ident
            .clone()
    }

    pub fn get_index_ident(&self, opctx: &OperationContext, ns: &str, index_name: &str) -> String {
        let obj = self
            .read_document(opctx, ns)
            .unwrap_or_else(|err| panic!("getIndexIdent could not read '{}': {}", ns, err));
        let idx_idents = obj
            .get_document("idxIdent")
            .unwrap_or_else(|_| panic!("catalog record for '{}' missing idxIdent", ns));
        idx_idents
            .get_str(index_name)
            .unwrap_or_else(|_| {
                panic!("getIndexIdent for unknown index '{}' on '{}'", index_name, ns)
            })
            .to_string()
    }

    fn entry(&self, ns: &str) -> Result<Entry> {
        self.idents.lock().get(ns).cloned().ok_or_else(|| {
            RookDBError::NamespaceNotFound(format!("collection {} not found", ns))
        })
    }

    fn read_document(&self, opctx: &OperationContext, ns: &str) -> Result<Document> {
        let entry = self.entry(ns)?;
        let data = self.rs.data_for(opctx, entry.loc)?;
        Ok(bson::from_slice(&data)?)
    }

    pub fn get_metadata(&self, opctx: &OperationContext, ns: &str) -> Result<CollectionMetaData> {
        let obj = self.read_document(opctx, ns)?;
        let md = obj
            .get_document("md")
            .map_err(|_| RookDBError::Storage(format!("catalog record for {} missing md", ns)))?;
        CollectionMetaData::from_document(md).ok_or_else(|| {
            RookDBError::Storage(format!("catalog metadata for {} does not parse", ns))
        })
    }

    /// Rewrite the metadata document. Index idents for names already mapped
    /// are preserved; new index names get fresh idents. The collection's own
    /// ident is never regenerated.
    pub fn put_metadata(
        &self,
        opctx: &OperationContext,
        ns: &str,
        md: &CollectionMetaData,
    ) -> Result<()> {
        let entry = self.entry(ns)?;
        let obj = self.read_document(opctx, ns)?;

        let old_idx_idents = obj
            .get_document("idxIdent")
            .map(|d| d.clone())
            .unwrap_or_default();
        let mut idx_idents = Document::new();
        for index in &md.indexes {
            let name = index.name();
            match old_idx_idents.get_str(name) {
                Ok(existing) => {
                    idx_idents.insert(name, existing);
                }
                Err(_) => {
                    let ident = self.generate_ident(&format!("{}${}", entry.ident, name));
                    idx_idents.insert(name, ident);
                }
            }
        }

        let new_obj = doc! {
            "ns": obj.get_str("ns").unwrap_or(ns),
            "ident": entry.ident.clone(),
            "md": md.to_document(),
            "idxIdent": idx_idents,
        };
        let data = bson::to_vec(&new_obj)?;
        let new_loc = self.rs.update_record(opctx, entry.loc, &data)?;
        if new_loc != entry.loc {
            let mut idents = self.idents.lock();
            if let Some(e) = idents.get_mut(ns) {
                e.loc = new_loc;
            }
            opctx
                .recovery_unit()
                .register_change(Box::new(MapRelocateUndo {
                    idents: Arc::clone(&self.idents),
                    ns: ns.to_string(),
                    old_loc: entry.loc,
                }));
        }
        Ok(())
    }

    /// Rewrite `ns` and `md.ns`, clear the temp flag unless `stay_temp`, and
    /// move the in-memory entry to the new name. Ident and record location
    /// are preserved.
    pub fn rename_collection(
        &self,
        opctx: &OperationContext,
        from: &str,
        to: &str,
        stay_temp: bool,
    ) -> Result<()> {
        let entry = self.entry(from)?;
        {
            let idents = self.idents.lock();
            if idents.contains_key(to) {
                return Err(RookDBError::NamespaceExists(format!(
                    "target collection {} already exists",
                    to
                )));
            }
        }
        let obj = self.read_document(opctx, from)?;
        let md_doc = obj
            .get_document("md")
            .map_err(|_| RookDBError::Storage(format!("catalog record for {} missing md", from)))?;
        let mut md = CollectionMetaData::from_document(md_doc).ok_or_else(|| {
            RookDBError::Storage(format!("catalog metadata for {} does not parse", from))
        })?;
        md.ns = to.to_string();
        if !stay_temp {
            md.options.temp = false;
        }

        let new_obj = doc! {
            "ns": to,
            "ident": entry.ident.clone(),
            "md": md.to_document(),
            "idxIdent": obj.get_document("idxIdent").map(|d| d.clone()).unwrap_or_default(),
        };
        let data = bson::to_vec(&new_obj)?;
        let new_loc = self.rs.update_record(opctx, entry.loc, &data)?;

        let mut idents = self.idents.lock();
        idents.shift_remove(from);
        idents.insert(
            to.to_string(),
            Entry {
                ident: entry.ident.clone(),
                loc: new_loc,
            },
        );
        opctx
            .recovery_unit()
            .register_change(Box::new(MapRenameUndo {
                idents: Arc::clone(&self.idents),
                from: from.to_string(),
                to: to.to_string(),
                entry: Some(entry),
            }));
        Ok(())
    }

    pub fn drop_collection(&self, opctx: &OperationContext, ns: &str) -> Result<()> {
        let entry = self.entry(ns)?;
        self.rs.delete_record(opctx, entry.loc)?;
        self.idents.lock().shift_remove(ns);
        opctx
            .recovery_unit()
            .register_change(Box::new(MapRemoveUndo {
                idents: Arc::clone(&self.idents),
                ns: ns.to_string(),
                entry: Some(entry),
            }));
        Ok(())
    }
}
