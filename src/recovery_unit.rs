/*!
 * Recovery units and operation contexts
 * A recovery unit is the transactional scope an operation runs in: changes
 * registered inside a write unit of work commit atomically or roll back when
 * the scope unwinds
 */

use std::cell::{RefCell, RefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, RookDBError};

/// A reversible side effect registered with the recovery unit. On commit the
/// callbacks fire in reverse order of registration; on rollback likewise.
pub trait Change: Send {
    fn commit(&mut self);
    fn rollback(&mut self);
}

pub trait RecoveryUnit: Send {
    /// Nested units stack; only the outermost commit publishes.
    fn begin_unit_of_work(&mut self);

    fn commit_unit_of_work(&mut self);

    /// Close the innermost unit. When the outermost unit closes without a
    /// commit, every uncommitted change rolls back.
    fn end_unit_of_work(&mut self);

    fn register_change(&mut self, change: Box<dyn Change>);

    fn in_unit_of_work(&self) -> bool;
}

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Per-operation context: identity for interruption plus the transactional
/// scope storage operations participate in.
pub struct OperationContext {
    op_id: u64,
    killed: Arc<AtomicBool>,
    recovery_unit: RefCell<Box<dyn RecoveryUnit>>,
}

impl OperationContext {
    pub fn new(recovery_unit: Box<dyn RecoveryUnit>) -> Self {
        Self {
            op_id: NEXT_OP_ID.fetch_add(1, Ordering::Relaxed),
            killed: Arc::new(AtomicBool::new(false)),
            recovery_unit: RefCell::new(recovery_unit),
        }
    }

    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    /// Handle another thread can use to interrupt this operation.
    pub fn kill_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.killed)
    }

    pub fn check_for_interrupt(&self) -> Result<()> {
        if self.killed.load(Ordering::SeqCst) {
            Err(RookDBError::Interrupted(format!(
                "operation {} was interrupted",
                self.op_id
            )))
        } else {
            Ok(())
        }
    }

    pub fn recovery_unit(&self) -> RefMut<'_, Box<dyn RecoveryUnit>> {
        self.recovery_unit.borrow_mut()
    }
}

/// RAII write scope: `commit` publishes, dropping without commit rolls back.
pub struct WriteUnitOfWork<'a> {
    opctx: &'a OperationContext,
    committed: bool,
}

impl<'a> WriteUnitOfWork<'a> {
    pub fn new(opctx: &'a OperationContext) -> Self {
        opctx.recovery_unit().begin_unit_of_work();
        Self {
            opctx,
            committed: false,
        }
    }

    pub fn commit(&mut self) {
        self.opctx.recovery_unit().commit_unit_of_work();
        self.committed = true;
    }
}

impl Drop for WriteUnitOfWork<'_> {
    fn drop(&mut self) {
        self.opctx.recovery_unit().end_unit_of_work();
    }
}
