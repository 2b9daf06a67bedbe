/*!
 * Heap storage engine
 * In-memory backend satisfying the engine contract. Stores live behind
 * shared handles, so new catalog wrappers opened over the same engine handle
 * observe the data written before a "restart".
 */

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::{
    encode_record_id, CappedSettings, CollectionOptions, Damage, Direction, IndexDescriptor,
    KvEngine, RecordData, RecordId, RecordIterator, RecordStore, SortedDataCursor,
    SortedDataInterface,
};
use crate::error::{Result, RookDBError};
use crate::recovery_unit::{Change, OperationContext, RecoveryUnit};
use tracing::debug;

// ---- recovery unit ----------------------------------------------------------

/// Recovery unit for the heap engine: mutations apply eagerly and register
/// compensating changes that undo them if the unit of work unwinds.
pub struct HeapRecoveryUnit {
    depth: u32,
    changes: Vec<Box<dyn Change>>,
}

impl HeapRecoveryUnit {
    pub fn new() -> Self {
        Self {
            depth: 0,
            changes: Vec::new(),
        }
    }
}

impl Default for HeapRecoveryUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryUnit for HeapRecoveryUnit {
    fn begin_unit_of_work(&mut self) {
        self.depth += 1;
    }

    fn commit_unit_of_work(&mut self) {
        assert!(self.depth > 0, "commit outside a unit of work");
        if self.depth == 1 {
            for mut change in self.changes.drain(..).rev() {
                change.commit();
            }
        }
    }

    fn end_unit_of_work(&mut self) {
        assert!(self.depth > 0, "unit of work depth underflow");
        self.depth -= 1;
        if self.depth == 0 && !self.changes.is_empty() {
            for mut change in self.changes.drain(..).rev() {
                change.rollback();
            }
        }
    }

    fn register_change(&mut self, change: Box<dyn Change>) {
        assert!(
            self.depth > 0,
            "storage mutation outside a write unit of work"
        );
        self.changes.push(change);
    }

    fn in_unit_of_work(&self) -> bool {
        self.depth > 0
    }
}

impl Drop for HeapRecoveryUnit {
    fn drop(&mut self) {
        debug_assert!(self.depth == 0, "recovery unit dropped inside a unit of work");
    }
}

// ---- record store -----------------------------------------------------------

struct TableData {
    records: BTreeMap<i64, Vec<u8>>,
    next_id: i64,
    data_size: i64,
}

struct HeapTable {
    capped: Option<CappedSettings>,
    data: Mutex<TableData>,
}

impl HeapTable {
    fn new(options: &CollectionOptions) -> Self {
        Self {
            capped: options.capped_settings(),
            data: Mutex::new(TableData {
                records: BTreeMap::new(),
                next_id: 1,
                data_size: 0,
            }),
        }
    }
}

struct InsertUndo {
    table: Arc<HeapTable>,
    loc: i64,
}

impl Change for InsertUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        let mut data = self.table.data.lock();
        if let Some(removed) = data.records.remove(&self.loc) {
            data.data_size -= removed.len() as i64;
        }
    }
}

struct RemoveUndo {
    table: Arc<HeapTable>,
    loc: i64,
    old: Vec<u8>,
}

impl Change for RemoveUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        let mut data = self.table.data.lock();
        data.data_size += self.old.len() as i64;
        data.records.insert(self.loc, std::mem::take(&mut self.old));
    }
}

struct UpdateUndo {
    table: Arc<HeapTable>,
    loc: i64,
    old: Vec<u8>,
}

impl Change for UpdateUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        let mut data = self.table.data.lock();
        let old = std::mem::take(&mut self.old);
        if let Some(current) = data.records.get(&self.loc) {
            let delta = old.len() as i64 - current.len() as i64;
            data.data_size += delta;
        }
        data.records.insert(self.loc, old);
    }
}

struct TruncateUndo {
    table: Arc<HeapTable>,
    old: BTreeMap<i64, Vec<u8>>,
    old_size: i64,
}

impl Change for TruncateUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        let mut data = self.table.data.lock();
        data.records = std::mem::take(&mut self.old);
        data.data_size = self.old_size;
    }
}

struct HeapRecordStore {
    ns: String,
    table: Arc<HeapTable>,
}

impl HeapRecordStore {
    fn enforce_capped(&self, opctx: &OperationContext, data: &mut TableData) {
        let capped = match self.table.capped {
            Some(c) => c,
            None => return,
        };
        loop {
            let over_size = data.data_size > capped.max_size_bytes;
            let over_docs = capped
                .max_docs
                .map(|max| data.records.len() as i64 > max)
                .unwrap_or(false);
            if !over_size && !over_docs {
                break;
            }
            let oldest = match data.records.keys().next().copied() {
                Some(k) => k,
                None => break,
            };
            let removed = data.records.remove(&oldest).unwrap();
            data.data_size -= removed.len() as i64;
            opctx.recovery_unit().register_change(Box::new(RemoveUndo {
                table: Arc::clone(&self.table),
                loc: oldest,
                old: removed,
            }));
        }
    }
}

impl RecordStore for HeapRecordStore {
    fn insert_record(&self, opctx: &OperationContext, data: &[u8]) -> Result<RecordId> {
        let mut table = self.table.data.lock();
        let loc = table.next_id;
        table.next_id += 1;
        table.records.insert(loc, data.to_vec());
        table.data_size += data.len() as i64;
        opctx.recovery_unit().register_change(Box::new(InsertUndo {
            table: Arc::clone(&self.table),
            loc,
        }));
        self.enforce_capped(opctx, &mut table);
        Ok(RecordId(loc))
    }

    fn update_record(&self, opctx: &OperationContext, loc: RecordId, data: &[u8]) -> Result<RecordId> {
        let mut table = self.table.data.lock();
        let old = table.records.get(&loc.0).cloned().ok_or_else(|| {
            RookDBError::Storage(format!("update of missing record {:?} in {}", loc, self.ns))
        })?;
        table.data_size += data.len() as i64 - old.len() as i64;
        table.records.insert(loc.0, data.to_vec());
        opctx.recovery_unit().register_change(Box::new(UpdateUndo {
            table: Arc::clone(&self.table),
            loc: loc.0,
            old,
        }));
        // The heap store never relocates on update.
        Ok(loc)
    }

    fn update_with_damages(
        &self,
        opctx: &OperationContext,
        loc: RecordId,
        damages: &[Damage],
    ) -> Result<()> {
        let mut table = self.table.data.lock();
        let old = table.records.get(&loc.0).cloned().ok_or_else(|| {
            RookDBError::Storage(format!("damage of missing record {:?} in {}", loc, self.ns))
        })?;
        let mut patched = old.clone();
        for damage in damages {
            let end = damage.offset + damage.data.len();
            if patched.len() < end {
                patched.resize(end, 0);
            }
            patched[damage.offset..end].copy_from_slice(&damage.data);
        }
        table.data_size += patched.len() as i64 - old.len() as i64;
        table.records.insert(loc.0, patched);
        opctx.recovery_unit().register_change(Box::new(UpdateUndo {
            table: Arc::clone(&self.table),
            loc: loc.0,
            old,
        }));
        Ok(())
    }

    fn delete_record(&self, opctx: &OperationContext, loc: RecordId) -> Result<()> {
        let mut table = self.table.data.lock();
        let old = table.records.remove(&loc.0).ok_or_else(|| {
            RookDBError::Storage(format!("delete of missing record {:?} in {}", loc, self.ns))
        })?;
        table.data_size -= old.len() as i64;
        opctx.recovery_unit().register_change(Box::new(RemoveUndo {
            table: Arc::clone(&self.table),
            loc: loc.0,
            old,
        }));
        Ok(())
    }

    fn data_for(&self, _opctx: &OperationContext, loc: RecordId) -> Result<RecordData> {
        let table = self.table.data.lock();
        table.records.get(&loc.0).cloned().ok_or_else(|| {
            RookDBError::Storage(format!("no record at {:?} in {}", loc, self.ns))
        })
    }

    fn iterator(
        &self,
        _opctx: &OperationContext,
        start: Option<RecordId>,
        direction: Direction,
        tailable: bool,
    ) -> Box<dyn RecordIterator> {
        let table = self.table.data.lock();
        let mut buffered: VecDeque<(RecordId, RecordData)> = match direction {
            Direction::Forward => table
                .records
                .range(start.map(|s| s.0).unwrap_or(i64::MIN)..)
                .map(|(k, v)| (RecordId(*k), v.clone()))
                .collect(),
            Direction::Backward => table
                .records
                .range(..=start.map(|s| s.0).unwrap_or(i64::MAX))
                .rev()
                .map(|(k, v)| (RecordId(*k), v.clone()))
                .collect(),
        };
        buffered.shrink_to_fit();
        Box::new(HeapRecordIterator {
            table: Arc::clone(&self.table),
            buffered,
            last_seen: None,
            direction,
            tailable,
        })
    }

    fn truncate(&self, opctx: &OperationContext) -> Result<()> {
        let mut table = self.table.data.lock();
        let old = std::mem::take(&mut table.records);
        let old_size = table.data_size;
        table.data_size = 0;
        opctx.recovery_unit().register_change(Box::new(TruncateUndo {
            table: Arc::clone(&self.table),
            old,
            old_size,
        }));
        Ok(())
    }

    fn num_records(&self) -> i64 {
        self.table.data.lock().records.len() as i64
    }

    fn data_size(&self) -> i64 {
        self.table.data.lock().data_size
    }

    fn capped_settings(&self) -> Option<CappedSettings> {
        self.table.capped
    }
}

struct HeapRecordIterator {
    table: Arc<HeapTable>,
    buffered: VecDeque<(RecordId, RecordData)>,
    last_seen: Option<i64>,
    direction: Direction,
    tailable: bool,
}

impl RecordIterator for HeapRecordIterator {
    fn next(&mut self) -> Option<(RecordId, RecordData)> {
        if let Some(entry) = self.buffered.pop_front() {
            self.last_seen = Some(entry.0 .0);
            return Some(entry);
        }
        if self.tailable && self.direction == Direction::Forward {
            let floor = self.last_seen.map(|l| l + 1).unwrap_or(i64::MIN);
            let table = self.table.data.lock();
            self.buffered = table
                .records
                .range(floor..)
                .map(|(k, v)| (RecordId(*k), v.clone()))
                .collect();
            drop(table);
            if let Some(entry) = self.buffered.pop_front() {
                self.last_seen = Some(entry.0 .0);
                return Some(entry);
            }
        }
        None
    }
}

// ---- sorted data ------------------------------------------------------------

struct HeapIndex {
    unique: bool,
    entries: Mutex<BTreeMap<Vec<u8>, Vec<RecordId>>>,
}

struct IndexInsertUndo {
    index: Arc<HeapIndex>,
    key: Vec<u8>,
    loc: RecordId,
}

impl Change for IndexInsertUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        let mut entries = self.index.entries.lock();
        if let Some(locs) = entries.get_mut(&self.key) {
            locs.retain(|l| *l != self.loc);
            if locs.is_empty() {
                entries.remove(&self.key);
            }
        }
    }
}

struct IndexRemoveUndo {
    index: Arc<HeapIndex>,
    key: Vec<u8>,
    loc: RecordId,
}

impl Change for IndexRemoveUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        let mut entries = self.index.entries.lock();
        let locs = entries.entry(self.key.clone()).or_default();
        if !locs.contains(&self.loc) {
            locs.push(self.loc);
            locs.sort();
        }
    }
}

struct HeapSortedData {
    index: Arc<HeapIndex>,
}

impl HeapSortedData {
    fn stored_key(&self, key: &[u8], loc: RecordId) -> Vec<u8> {
        if self.index.unique {
            key.to_vec()
        } else {
            let mut stored = key.to_vec();
            stored.extend_from_slice(&encode_record_id(loc));
            stored
        }
    }
}

impl SortedDataInterface for HeapSortedData {
    fn insert(
        &self,
        opctx: &OperationContext,
        key: &[u8],
        loc: RecordId,
        dups_allowed: bool,
    ) -> Result<()> {
        let stored = self.stored_key(key, loc);
        let mut entries = self.index.entries.lock();
        let locs = entries.entry(stored.clone()).or_default();
        if self.index.unique && !dups_allowed && !locs.is_empty() && !locs.contains(&loc) {
            return Err(RookDBError::DuplicateKey(
                "insertion would violate a unique index".to_string(),
            ));
        }
        if !locs.contains(&loc) {
            locs.push(loc);
            locs.sort();
            opctx
                .recovery_unit()
                .register_change(Box::new(IndexInsertUndo {
                    index: Arc::clone(&self.index),
                    key: stored,
                    loc,
                }));
        }
        Ok(())
    }

    fn unindex(&self, opctx: &OperationContext, key: &[u8], loc: RecordId) -> Result<()> {
        let stored = self.stored_key(key, loc);
        let mut entries = self.index.entries.lock();
        if let Some(locs) = entries.get_mut(&stored) {
            if locs.contains(&loc) {
                locs.retain(|l| *l != loc);
                if locs.is_empty() {
                    entries.remove(&stored);
                }
                opctx
                    .recovery_unit()
                    .register_change(Box::new(IndexRemoveUndo {
                        index: Arc::clone(&self.index),
                        key: stored,
                        loc,
                    }));
            }
        }
        Ok(())
    }

    fn cursor(&self, _opctx: &OperationContext, direction: Direction) -> Box<dyn SortedDataCursor> {
        let entries = self.index.entries.lock();
        let mut flattened: Vec<(Vec<u8>, RecordId)> = Vec::new();
        for (stored, locs) in entries.iter() {
            let user_key = if self.index.unique {
                stored.clone()
            } else {
                stored[..stored.len() - 8].to_vec()
            };
            for loc in locs {
                flattened.push((user_key.clone(), *loc));
            }
        }
        let pos = match direction {
            Direction::Forward => {
                if flattened.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
            Direction::Backward => flattened.len().checked_sub(1),
        };
        Box::new(HeapSortedCursor {
            entries: flattened,
            pos,
            direction,
        })
    }

    fn is_empty(&self, _opctx: &OperationContext) -> bool {
        self.index.entries.lock().is_empty()
    }

    fn num_entries(&self, _opctx: &OperationContext) -> i64 {
        self.index
            .entries
            .lock()
            .values()
            .map(|locs| locs.len() as i64)
            .sum()
    }
}

struct HeapSortedCursor {
    entries: Vec<(Vec<u8>, RecordId)>,
    pos: Option<usize>,
    direction: Direction,
}

impl SortedDataCursor for HeapSortedCursor {
    fn seek_exact(&mut self, key: &[u8], loc: RecordId) -> bool {
        match self
            .entries
            .iter()
            .position(|(k, l)| k.as_slice() == key && *l == loc)
        {
            Some(i) => {
                self.pos = Some(i);
                true
            }
            None => {
                self.seek(key);
                false
            }
        }
    }

    fn seek(&mut self, key: &[u8]) {
        match self.direction {
            Direction::Forward => {
                let i = self.entries.partition_point(|(k, _)| k.as_slice() < key);
                self.pos = if i < self.entries.len() { Some(i) } else { None };
            }
            Direction::Backward => {
                let i = self.entries.partition_point(|(k, _)| k.as_slice() <= key);
                self.pos = i.checked_sub(1);
            }
        }
    }

    fn next(&mut self) -> Option<(Vec<u8>, RecordId)> {
        let pos = self.pos?;
        let entry = self.entries.get(pos)?.clone();
        self.pos = match self.direction {
            Direction::Forward => {
                if pos + 1 < self.entries.len() {
                    Some(pos + 1)
                } else {
                    None
                }
            }
            Direction::Backward => pos.checked_sub(1),
        };
        Some(entry)
    }
}

// ---- engine -----------------------------------------------------------------

struct HeapShared {
    tables: Mutex<HashMap<String, Arc<HeapTable>>>,
    indexes: Mutex<HashMap<String, Arc<HeapIndex>>>,
    drop_pending: Mutex<HashSet<String>>,
}

struct TableCreateUndo {
    shared: Arc<HeapShared>,
    ident: String,
}

impl Change for TableCreateUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        self.shared.tables.lock().remove(&self.ident);
    }
}

struct TableDropUndo {
    shared: Arc<HeapShared>,
    ident: String,
    table: Option<Arc<HeapTable>>,
}

impl Change for TableDropUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        if let Some(table) = self.table.take() {
            self.shared.tables.lock().insert(self.ident.clone(), table);
        }
        self.shared.drop_pending.lock().remove(&self.ident);
    }
}

struct IndexCreateUndo {
    shared: Arc<HeapShared>,
    ident: String,
}

impl Change for IndexCreateUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        self.shared.indexes.lock().remove(&self.ident);
    }
}

struct IndexDropUndo {
    shared: Arc<HeapShared>,
    ident: String,
    index: Option<Arc<HeapIndex>>,
}

impl Change for IndexDropUndo {
    fn commit(&mut self) {}

    fn rollback(&mut self) {
        if let Some(index) = self.index.take() {
            self.shared.indexes.lock().insert(self.ident.clone(), index);
        }
        self.shared.drop_pending.lock().remove(&self.ident);
    }
}

/// The engine handle. Cloning yields another handle over the same underlying
/// storage; dropping every catalog wrapper and rebuilding over a clone models
/// a process restart.
#[derive(Clone)]
pub struct HeapEngine {
    shared: Arc<HeapShared>,
}

impl HeapEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(HeapShared {
                tables: Mutex::new(HashMap::new()),
                indexes: Mutex::new(HashMap::new()),
                drop_pending: Mutex::new(HashSet::new()),
            }),
        }
    }
}

impl Default for HeapEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KvEngine for HeapEngine {
    fn new_recovery_unit(&self) -> Box<dyn RecoveryUnit> {
        Box::new(HeapRecoveryUnit::new())
    }

    fn create_record_store(
        &self,
        opctx: &OperationContext,
        ident: &str,
        options: &CollectionOptions,
    ) -> Result<()> {
        let mut tables = self.shared.tables.lock();
        if tables.contains_key(ident) {
            return Err(RookDBError::Storage(format!(
                "record store ident '{}' already in use",
                ident
            )));
        }
        tables.insert(ident.to_string(), Arc::new(HeapTable::new(options)));
        opctx
            .recovery_unit()
            .register_change(Box::new(TableCreateUndo {
                shared: Arc::clone(&self.shared),
                ident: ident.to_string(),
            }));
        Ok(())
    }

    fn get_record_store(
        &self,
        _opctx: &OperationContext,
        ns: &str,
        ident: &str,
        _options: &CollectionOptions,
    ) -> Result<Box<dyn RecordStore>> {
        let tables = self.shared.tables.lock();
        let table = tables
            .get(ident)
            .unwrap_or_else(|| panic!("getRecordStore for unknown ident '{}'", ident));
        Ok(Box::new(HeapRecordStore {
            ns: ns.to_string(),
            table: Arc::clone(table),
        }))
    }

    fn drop_record_store(&self, opctx: &OperationContext, ident: &str) -> Result<()> {
        let table = self.shared.tables.lock().remove(ident).ok_or_else(|| {
            RookDBError::Storage(format!("dropRecordStore for unknown ident '{}'", ident))
        })?;
        self.shared.drop_pending.lock().insert(ident.to_string());
        opctx
            .recovery_unit()
            .register_change(Box::new(TableDropUndo {
                shared: Arc::clone(&self.shared),
                ident: ident.to_string(),
                table: Some(table),
            }));
        Ok(())
    }

    fn create_sorted_data_interface(
        &self,
        opctx: &OperationContext,
        ident: &str,
        descriptor: &IndexDescriptor,
    ) -> Result<()> {
        let mut indexes = self.shared.indexes.lock();
        if indexes.contains_key(ident) {
            return Err(RookDBError::Storage(format!(
                "sorted data ident '{}' already in use",
                ident
            )));
        }
        indexes.insert(
            ident.to_string(),
            Arc::new(HeapIndex {
                unique: descriptor.unique,
                entries: Mutex::new(BTreeMap::new()),
            }),
        );
        opctx
            .recovery_unit()
            .register_change(Box::new(IndexCreateUndo {
                shared: Arc::clone(&self.shared),
                ident: ident.to_string(),
            }));
        Ok(())
    }

    fn get_sorted_data_interface(
        &self,
        _opctx: &OperationContext,
        ident: &str,
        _descriptor: &IndexDescriptor,
    ) -> Result<Box<dyn SortedDataInterface>> {
        let indexes = self.shared.indexes.lock();
        let index = indexes
            .get(ident)
            .unwrap_or_else(|| panic!("getSortedDataInterface for unknown ident '{}'", ident));
        Ok(Box::new(HeapSortedData {
            index: Arc::clone(index),
        }))
    }

    fn drop_sorted_data_interface(&self, opctx: &OperationContext, ident: &str) -> Result<()> {
        let index = self.shared.indexes.lock().remove(ident).ok_or_else(|| {
            RookDBError::Storage(format!(
                "dropSortedDataInterface for unknown ident '{}'",
                ident
            ))
        })?;
        self.shared.drop_pending.lock().insert(ident.to_string());
        opctx
            .recovery_unit()
            .register_change(Box::new(IndexDropUndo {
                shared: Arc::clone(&self.shared),
                ident: ident.to_string(),
                index: Some(index),
            }));
        Ok(())
    }

    fn all_idents(&self) -> Vec<String> {
        let mut idents: Vec<String> = self.shared.tables.lock().keys().cloned().collect();
        idents.extend(self.shared.indexes.lock().keys().cloned());
        idents.sort();
        idents
    }

    fn reclaim_deleted_idents(&self) -> Vec<String> {
        let mut pending = self.shared.drop_pending.lock();
        let reclaimed: Vec<String> = pending.drain().collect();
        for ident in &reclaimed {
            // A crash may interleave the catalog record drop and the store
            // drop; any table still present under a pending ident goes now.
            self.shared.tables.lock().remove(ident);
            self.shared.indexes.lock().remove(ident);
            debug!("reclaimed orphaned ident '{}'", ident);
        }
        reclaimed
    }
}
