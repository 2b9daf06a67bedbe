/*!
 * Replication external state
 * Everything the coordinator needs from the rest of the node goes through
 * this seam: the stored configuration document, the local identity, applier
 * signals and the global exclusive lock
 */

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bson::Document;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::error::{Result, RookDBError};
use crate::heap_engine::HeapRecoveryUnit;
use crate::optime::OpTime;
use crate::protocol::Rid;
use crate::recovery_unit::OperationContext;
use crate::replica_set_config::HostAndPort;

/// The process-wide lock the coordinator takes to serialize drain cleanup
/// and stepdown transitions against writes.
#[derive(Default)]
pub struct GlobalLock {
    inner: RwLock<()>,
}

impl GlobalLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.write()
    }

    pub fn try_exclusive_for(&self, timeout: Duration) -> Option<RwLockWriteGuard<'_, ()>> {
        self.inner.try_write_for(timeout)
    }

    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.read()
    }
}

pub trait ExternalState: Send + Sync {
    /// The stored replica set configuration document, if any.
    fn load_local_config_document(&self) -> Result<Document>;

    fn store_local_config_document(&self, doc: &Document) -> Result<()>;

    /// The last locally applied position; null when nothing was applied.
    fn load_last_op_time(&self) -> Result<OpTime>;

    /// The local node's stable RID, created on first use.
    fn ensure_me(&self) -> Rid;

    fn start_threads(&self);

    fn start_master_slave(&self);

    /// Notify upstream that this node's progress advanced.
    fn forward_slave_progress(&self);

    /// Notify upstream of a downstream handshake.
    fn forward_slave_handshake(&self);

    fn signal_applier_to_choose_new_sync_source(&self);

    fn close_connections(&self);

    fn create_operation_context(&self) -> OperationContext;

    fn drop_all_temp_collections(&self, opctx: &OperationContext);

    fn global_lock(&self) -> &GlobalLock;

    /// Whether the given address names this node.
    fn is_self(&self, host: &HostAndPort) -> bool;

    fn shutdown(&self);
}

/// In-memory external state for tests and single-process bootstrap. Counters
/// record how often the coordinator pulled each lever.
pub struct MemoryExternalState {
    me: HostAndPort,
    rid: Rid,
    config_doc: Mutex<Option<Document>>,
    last_op_time: Mutex<OpTime>,
    global: GlobalLock,
    temp_collection_drops: AtomicU32,
    connection_closes: AtomicU32,
    progress_forwards: AtomicU32,
    handshake_forwards: AtomicU32,
    sync_source_signals: AtomicU32,
}

impl MemoryExternalState {
    pub fn new(me: HostAndPort) -> Self {
        Self {
            me,
            rid: Uuid::new_v4(),
            config_doc: Mutex::new(None),
            last_op_time: Mutex::new(OpTime::NULL),
            global: GlobalLock::new(),
            temp_collection_drops: AtomicU32::new(0),
            connection_closes: AtomicU32::new(0),
            progress_forwards: AtomicU32::new(0),
            handshake_forwards: AtomicU32::new(0),
            sync_source_signals: AtomicU32::new(0),
        }
    }

    pub fn set_stored_config(&self, doc: Document) {
        *self.config_doc.lock() = Some(doc);
    }

    pub fn set_last_op_time(&self, op_time: OpTime) {
        *self.last_op_time.lock() = op_time;
    }

    pub fn temp_collection_drops(&self) -> u32 {
        self.temp_collection_drops.load(Ordering::SeqCst)
    }

    pub fn connection_closes(&self) -> u32 {
        self.connection_closes.load(Ordering::SeqCst)
    }

    pub fn progress_forwards(&self) -> u32 {
        self.progress_forwards.load(Ordering::SeqCst)
    }

    pub fn handshake_forwards(&self) -> u32 {
        self.handshake_forwards.load(Ordering::SeqCst)
    }

    pub fn sync_source_signals(&self) -> u32 {
        self.sync_source_signals.load(Ordering::SeqCst)
    }

    pub fn stored_config(&self) -> Option<Document> {
        self.config_doc.lock().clone()
    }
}

impl ExternalState for MemoryExternalState {
    fn load_local_config_document(&self) -> Result<Document> {
        self.config_doc.lock().clone().ok_or_else(|| {
            RookDBError::NamespaceNotFound(
                "no local replica set configuration document".to_string(),
            )
        })
    }

    fn store_local_config_document(&self, doc: &Document) -> Result<()> {
        *self.config_doc.lock() = Some(doc.clone());
        Ok(())
    }

    fn load_last_op_time(&self) -> Result<OpTime> {
        Ok(*self.last_op_time.lock())
    }

    fn ensure_me(&self) -> Rid {
        self.rid
    }

    fn start_threads(&self) {}

    fn start_master_slave(&self) {}

    fn forward_slave_progress(&self) {
        self.progress_forwards.fetch_add(1, Ordering::SeqCst);
    }

    fn forward_slave_handshake(&self) {
        self.handshake_forwards.fetch_add(1, Ordering::SeqCst);
    }

    fn signal_applier_to_choose_new_sync_source(&self) {
        self.sync_source_signals.fetch_add(1, Ordering::SeqCst);
    }

    fn close_connections(&self) {
        self.connection_closes.fetch_add(1, Ordering::SeqCst);
    }

    fn create_operation_context(&self) -> OperationContext {
        OperationContext::new(Box::new(HeapRecoveryUnit::new()))
    }

    fn drop_all_temp_collections(&self, _opctx: &OperationContext) {
        self.temp_collection_drops.fetch_add(1, Ordering::SeqCst);
    }

    fn global_lock(&self) -> &GlobalLock {
        &self.global
    }

    fn is_self(&self, host: &HostAndPort) -> bool {
        host == &self.me
    }

    fn shutdown(&self) {}
}
