/*!
 * Per-database catalog entries
 * Collection tables for one logical database: create, drop and rename
 * collections, and resolve namespaces to opened record stores
 */

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::catalog::KvCatalog;
use crate::catalog_entry::CollectionCatalogEntry;
use crate::engine::{CollectionOptions, KvEngine, RecordStore};
use crate::error::{Result, RookDBError};
use crate::recovery_unit::{Change, OperationContext};
use tracing::info;

type CollectionMap = Arc<Mutex<HashMap<String, Arc<CollectionCatalogEntry>>>>;

struct CollectionsInsertUndo {
    collections: CollectionMap,
    ns: String,
}

impl Change for CollectionsInsertUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        self.collections.lock().remove(&self.ns);
    }
}

struct CollectionsRemoveUndo {
    collections: CollectionMap,
    ns: String,
    entry: Option<Arc<CollectionCatalogEntry>>,
}

impl Change for CollectionsRemoveUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.collections.lock().insert(self.ns.clone(), entry);
        }
    }
}

struct CollectionsRenameUndo {
    collections: CollectionMap,
    from: String,
    to: String,
    entry: Option<Arc<CollectionCatalogEntry>>,
}

impl Change for CollectionsRenameUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        if let Some(entry) = self.entry.take() {
            let mut collections = self.collections.lock();
            collections.remove(&self.to);
            collections.insert(self.from.clone(), entry);
        }
    }
}

/// The collection table of one database. The owning storage engine
/// serializes structural changes per namespace; the internal mutex guards
/// only the map.
pub struct DatabaseCatalogEntry {
    name: String,
    engine: Arc<dyn KvEngine>,
    catalog: Arc<KvCatalog>,
    collections: CollectionMap,
}

impl DatabaseCatalogEntry {
    pub fn new(name: &str, engine: Arc<dyn KvEngine>, catalog: Arc<KvCatalog>) -> Self {
        Self {
            name: name.to_string(),
            engine,
            catalog,
            collections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exists(&self) -> bool {
        !self.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.lock().is_empty()
    }

    pub fn collection_namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self.collections.lock().keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    pub fn get_collection_catalog_entry(&self, ns: &str) -> Option<Arc<CollectionCatalogEntry>> {
        self.collections.lock().get(ns).cloned()
    }

    pub fn get_record_store(&self, ns: &str) -> Option<Arc<dyn RecordStore>> {
        self.collections.lock().get(ns).map(|e| e.record_store())
    }

    fn check_namespace(&self, ns: &str) -> Result<()> {
        let prefix = format!("{}.", self.name);
        if !ns.starts_with(&prefix) {
            return Err(RookDBError::BadValue(format!(
                "namespace {} does not belong to database {}",
                ns, self.name
            )));
        }
        Ok(())
    }

    /// Materialize an entry for a namespace already present in the catalog;
    /// used while rebuilding state at startup.
    pub fn init_collection(&self, opctx: &OperationContext, ns: &str) -> Result<()> {
        self.check_namespace(ns)?;
        let ident = self.catalog.get_collection_ident(ns);
        let md = self.catalog.get_metadata(opctx, ns)?;
        let rs = self
            .engine
            .get_record_store(opctx, ns, &ident, &md.options)?;
        let entry = Arc::new(CollectionCatalogEntry::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.catalog),
            ns,
            &ident,
            Arc::from(rs),
        ));
        self.collections.lock().insert(ns.to_string(), entry);
        Ok(())
    }

    /// Create the catalog entry and the physical record store in one write
    /// unit of work; a crash before commit leaves neither.
    pub fn create_collection(
        &self,
        opctx: &OperationContext,
        ns: &str,
        options: &CollectionOptions,
    ) -> Result<()> {
        self.check_namespace(ns)?;
        {
            let collections = self.collections.lock();
            if collections.contains_key(ns) {
                return Err(RookDBError::NamespaceExists(format!(
                    "collection {} already exists",
                    ns
                )));
            }
        }

        self.catalog.new_collection(opctx, ns, options)?;
        let ident = self.catalog.get_collection_ident(ns);
        self.engine.create_record_store(opctx, &ident, options)?;
        let rs = self.engine.get_record_store(opctx, ns, &ident, options)?;

        let entry = Arc::new(CollectionCatalogEntry::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.catalog),
            ns,
            &ident,
            Arc::from(rs),
        ));
        self.collections.lock().insert(ns.to_string(), entry);
        opctx
            .recovery_unit()
            .register_change(Box::new(CollectionsInsertUndo {
                collections: Arc::clone(&self.collections),
                ns: ns.to_string(),
            }));
        info!("created collection {} with ident {}", ns, ident);
        Ok(())
    }

    /// Physical stores are dropped before the catalog record so a crash in
    /// between leaves a deleted-but-present ident the engine reclaims on the
    /// next open.
    pub fn drop_collection(&self, opctx: &OperationContext, ns: &str) -> Result<()> {
        self.check_namespace(ns)?;
        let entry = {
            let collections = self.collections.lock();
            collections.get(ns).cloned()
        };
        let entry = entry.ok_or_else(|| {
            RookDBError::NamespaceNotFound(format!("collection {} not found", ns))
        })?;

        let md = entry.get_metadata(opctx)?;
        for index in &md.indexes {
            let ident = self.catalog.get_index_ident(opctx, ns, index.name());
            self.engine.drop_sorted_data_interface(opctx, &ident)?;
        }
        self.engine.drop_record_store(opctx, entry.ident())?;
        self.catalog.drop_collection(opctx, ns)?;

        let removed = self.collections.lock().remove(ns);
        opctx
            .recovery_unit()
            .register_change(Box::new(CollectionsRemoveUndo {
                collections: Arc::clone(&self.collections),
                ns: ns.to_string(),
                entry: removed,
            }));
        info!("dropped collection {}", ns);
        Ok(())
    }

    /// The entry at the old name is destroyed and a fresh one is built at the
    /// new name; consumers holding the old handle keep the old view.
    pub fn rename_collection(
        &self,
        opctx: &OperationContext,
        from: &str,
        to: &str,
        stay_temp: bool,
    ) -> Result<()> {
        self.check_namespace(from)?;
        self.check_namespace(to)?;
        {
            let collections = self.collections.lock();
            if !collections.contains_key(from) {
                return Err(RookDBError::NamespaceNotFound(format!(
                    "collection {} not found",
                    from
                )));
            }
            if collections.contains_key(to) {
                return Err(RookDBError::NamespaceExists(format!(
                    "target collection {} already exists",
                    to
                )));
            }
        }

        self.catalog.rename_collection(opctx, from, to, stay_temp)?;

        let ident = self.catalog.get_collection_ident(to);
        let md = self.catalog.get_metadata(opctx, to)?;
        let rs = self
            .engine
            .get_record_store(opctx, to, &ident, &md.options)?;
        let new_entry = Arc::new(CollectionCatalogEntry::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.catalog),
            to,
            &ident,
            Arc::from(rs),
        ));

        let mut collections = self.collections.lock();
        let old_entry = collections.remove(from);
        collections.insert(to.to_string(), new_entry);
        drop(collections);
        opctx
            .recovery_unit()
            .register_change(Box::new(CollectionsRenameUndo {
                collections: Arc::clone(&self.collections),
                from: from.to_string(),
                to: to.to_string(),
                entry: old_entry,
            }));
        info!("renamed collection {} to {}", from, to);
        Ok(())
    }
}
