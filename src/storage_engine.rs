/*!
 * KV storage engine
 * Top-level storage object: owns the backend engine and the catalog, rebuilds
 * the namespace map on open and hands out per-database catalog entries
 */

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::catalog::{KvCatalog, CATALOG_IDENT};
use crate::database_catalog::DatabaseCatalogEntry;
use crate::engine::{CollectionOptions, KvEngine};
use crate::error::Result;
use crate::recovery_unit::{OperationContext, WriteUnitOfWork};
use tracing::{debug, info};

pub fn db_of(ns: &str) -> &str {
    ns.split('.').next().unwrap_or(ns)
}

pub struct KvStorageEngine {
    engine: Arc<dyn KvEngine>,
    catalog: Arc<KvCatalog>,
    dbs: Mutex<HashMap<String, Arc<DatabaseCatalogEntry>>>,
}

impl KvStorageEngine {
    /// Open the storage layer over a backend engine: reclaim idents whose
    /// drop never completed, open or create `_mdb_catalog`, scan it and
    /// materialize an entry for every known collection.
    pub fn open(engine: Arc<dyn KvEngine>) -> Result<Self> {
        let reclaimed = engine.reclaim_deleted_idents();
        if !reclaimed.is_empty() {
            info!(
                "reclaimed {} idents pending delete from a previous run",
                reclaimed.len()
            );
        }

        let opctx = OperationContext::new(engine.new_recovery_unit());
        let options = CollectionOptions::default();

        let catalog_exists = engine.all_idents().iter().any(|i| i == CATALOG_IDENT);
        let catalog_rs = {
            let mut wuow = WriteUnitOfWork::new(&opctx);
            if !catalog_exists {
                engine.create_record_store(&opctx, CATALOG_IDENT, &options)?;
                debug!("created catalog record store");
            }
            let rs = engine.get_record_store(&opctx, CATALOG_IDENT, CATALOG_IDENT, &options)?;
            wuow.commit();
            rs
        };

        let catalog = Arc::new(KvCatalog::new(Arc::from(catalog_rs)));
        catalog.init(&opctx)?;

        let storage = Self {
            engine,
            catalog,
            dbs: Mutex::new(HashMap::new()),
        };

        for ns in storage.catalog.all_collections() {
            let db = storage.get_database_catalog_entry(db_of(&ns));
            db.init_collection(&opctx, &ns)?;
        }
        info!(
            "storage engine opened with {} collections",
            storage.catalog.all_collections().len()
        );
        Ok(storage)
    }

    pub fn engine(&self) -> Arc<dyn KvEngine> {
        Arc::clone(&self.engine)
    }

    pub fn catalog(&self) -> Arc<KvCatalog> {
        Arc::clone(&self.catalog)
    }

    pub fn new_operation_context(&self) -> OperationContext {
        OperationContext::new(self.engine.new_recovery_unit())
    }

    /// Database entries materialize lazily on first reference.
    pub fn get_database_catalog_entry(&self, db: &str) -> Arc<DatabaseCatalogEntry> {
        let mut dbs = self.dbs.lock();
        dbs.entry(db.to_string())
            .or_insert_with(|| {
                Arc::new(DatabaseCatalogEntry::new(
                    db,
                    Arc::clone(&self.engine),
                    Arc::clone(&self.catalog),
                ))
            })
            .clone()
    }

    pub fn list_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .dbs
            .lock()
            .values()
            .filter(|db| db.exists())
            .map(|db| db.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn drop_database(&self, opctx: &OperationContext, db: &str) -> Result<()> {
        let entry = self.get_database_catalog_entry(db);
        for ns in entry.collection_namespaces() {
            entry.drop_collection(opctx, &ns)?;
        }
        self.dbs.lock().remove(db);
        info!("dropped database {}", db);
        Ok(())
    }

    /// Forget the in-memory entry; the persisted state is untouched.
    pub fn close_database(&self, db: &str) {
        self.dbs.lock().remove(db);
    }
}
