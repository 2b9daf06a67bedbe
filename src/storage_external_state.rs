/*!
 * Storage-backed external state
 * Persists the coordinator's durable artifacts through the storage catalog:
 * the configuration document in `local.system.replset`, the node identity in
 * `local.me`, and the applied-position marker in `local.replset.minvalid`
 */

use std::sync::Arc;

use bson::{doc, Document};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::engine::{CollectionOptions, Direction};
use crate::error::{Result, RookDBError};
use crate::external_state::{ExternalState, GlobalLock};
use crate::optime::OpTime;
use crate::protocol::Rid;
use crate::recovery_unit::{OperationContext, WriteUnitOfWork};
use crate::replica_set_config::HostAndPort;
use crate::storage_engine::{db_of, KvStorageEngine};
use tracing::debug;

const REPLSET_CONFIG_NS: &str = "local.system.replset";
const ME_NS: &str = "local.me";
const MIN_VALID_NS: &str = "local.replset.minvalid";

pub struct StorageExternalState {
    me: HostAndPort,
    storage: Arc<KvStorageEngine>,
    global: GlobalLock,
    cached_rid: Mutex<Option<Rid>>,
}

impl StorageExternalState {
    pub fn new(me: HostAndPort, storage: Arc<KvStorageEngine>) -> Self {
        Self {
            me,
            storage,
            global: GlobalLock::new(),
            cached_rid: Mutex::new(None),
        }
    }

    fn read_single_document(&self, opctx: &OperationContext, ns: &str) -> Result<Document> {
        let db = self.storage.get_database_catalog_entry(db_of(ns));
        let rs = db.get_record_store(ns).ok_or_else(|| {
            RookDBError::NamespaceNotFound(format!("collection {} not found", ns))
        })?;
        let mut iter = rs.iterator(opctx, None, Direction::Forward, false);
        match iter.next() {
            Some((_, data)) => Ok(bson::from_slice(&data)?),
            None => Err(RookDBError::NamespaceNotFound(format!(
                "collection {} is empty",
                ns
            ))),
        }
    }

    /// Replace the sole document of a single-document collection, creating
    /// the collection on first use.
    fn write_single_document(
        &self,
        opctx: &OperationContext,
        ns: &str,
        document: &Document,
    ) -> Result<()> {
        let db = self.storage.get_database_catalog_entry(db_of(ns));
        let mut wuow = WriteUnitOfWork::new(opctx);
        if db.get_record_store(ns).is_none() {
            db.create_collection(opctx, ns, &CollectionOptions::default())?;
        }
        let rs = db
            .get_record_store(ns)
            .expect("collection must exist after create");
        rs.truncate(opctx)?;
        rs.insert_record(opctx, &bson::to_vec(document)?)?;
        wuow.commit();
        Ok(())
    }

    /// Durably record the node's applied position; the applier calls this as
    /// it advances.
    pub fn store_last_op_time(&self, op_time: OpTime) -> Result<()> {
        let opctx = self.storage.new_operation_context();
        self.write_single_document(&opctx, MIN_VALID_NS, &doc! { "ts": op_time.to_document() })
    }
}

impl ExternalState for StorageExternalState {
    fn load_local_config_document(&self) -> Result<Document> {
        let opctx = self.storage.new_operation_context();
        self.read_single_document(&opctx, REPLSET_CONFIG_NS)
    }

    fn store_local_config_document(&self, document: &Document) -> Result<()> {
        let opctx = self.storage.new_operation_context();
        self.write_single_document(&opctx, REPLSET_CONFIG_NS, document)
    }

    fn load_last_op_time(&self) -> Result<OpTime> {
        let opctx = self.storage.new_operation_context();
        match self.read_single_document(&opctx, MIN_VALID_NS) {
            Ok(document) => Ok(document
                .get_document("ts")
                .ok()
                .and_then(OpTime::from_document)
                .unwrap_or(OpTime::NULL)),
            Err(RookDBError::NamespaceNotFound(_)) => Ok(OpTime::NULL),
            Err(err) => Err(err),
        }
    }

    fn ensure_me(&self) -> Rid {
        let mut cached = self.cached_rid.lock();
        if let Some(rid) = *cached {
            return rid;
        }
        let opctx = self.storage.new_operation_context();
        let rid = match self.read_single_document(&opctx, ME_NS) {
            Ok(document) => document
                .get_str("rid")
                .ok()
                .and_then(|s| Uuid::parse_str(s).ok())
                .unwrap_or_else(Uuid::new_v4),
            Err(_) => {
                let rid = Uuid::new_v4();
                let doc = doc! { "rid": rid.to_string(), "host": self.me.to_string() };
                if let Err(err) = self.write_single_document(&opctx, ME_NS, &doc) {
                    debug!("could not persist local identity: {}", err);
                }
                rid
            }
        };
        *cached = Some(rid);
        rid
    }

    fn start_threads(&self) {
        debug!("external state starting background workers");
    }

    fn start_master_slave(&self) {
        debug!("external state starting master/slave workers");
    }

    fn forward_slave_progress(&self) {
        debug!("forwarding progress upstream");
    }

    fn forward_slave_handshake(&self) {
        debug!("forwarding handshake upstream");
    }

    fn signal_applier_to_choose_new_sync_source(&self) {
        debug!("signaling applier to choose a new sync source");
    }

    fn close_connections(&self) {
        debug!("closing replication connections");
    }

    fn create_operation_context(&self) -> OperationContext {
        self.storage.new_operation_context()
    }

    fn drop_all_temp_collections(&self, opctx: &OperationContext) {
        for ns in self.storage.catalog().all_collections() {
            let md = match self.storage.catalog().get_metadata(opctx, &ns) {
                Ok(md) => md,
                Err(_) => continue,
            };
            if !md.options.temp {
                continue;
            }
            let db = self.storage.get_database_catalog_entry(db_of(&ns));
            let mut wuow = WriteUnitOfWork::new(opctx);
            match db.drop_collection(opctx, &ns) {
                Ok(()) => wuow.commit(),
                Err(err) => debug!("could not drop temp collection {}: {}", ns, err),
            }
        }
    }

    fn global_lock(&self) -> &GlobalLock {
        &self.global
    }

    fn is_self(&self, host: &HostAndPort) -> bool {
        host == &self.me
    }

    fn shutdown(&self) {}
}
