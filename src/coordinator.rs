/*!
 * Replication coordinator
 * The per-node facade over replica set state: write-concern waiting, member
 * progress, role transitions, reconfiguration and heartbeat handling. Public
 * operations are thread safe; topology mutation is serialized on the driver.
 */

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bson::Document;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

use crate::config::ReplicationSettings;
use crate::election::{ElectCmdRunner, ElectionState};
use crate::error::{Result, RookDBError};
use crate::executor::{TaskContext, TopologyExecutor};
use crate::external_state::ExternalState;
use crate::member_state::MemberState;
use crate::network::ReplicationNetwork;
use crate::optime::OpTime;
use crate::protocol::{
    ElectRequest, ElectResponse, FreshRequest, FreshResponse, HandshakeArgs, HeartbeatRequest,
    HeartbeatResponse, IsMasterResponse, Rid, UpdatePositionArgs, UpdatePositionEntry,
};
use crate::recovery_unit::OperationContext;
use crate::replica_set_config::{
    increment_config_version_by_random, HostAndPort, ReplicaSetConfig, TagMatcher,
};
use crate::topology::{HeartbeatAction, Role, TopologyCoordinator};
use crate::write_concern::{WriteConcern, MAJORITY_MODE, STEP_DOWN_CHECK_MODE};
use tracing::{debug, error, info, warn};

use crate::quorum;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    None,
    MasterSlave,
    ReplSet,
}

/// Configuration-state machine; the sole gate for admin reconfig commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigState {
    PreStart,
    StartingUp,
    Uninitialized,
    Initiating,
    Steady,
    Reconfiguring,
    HBReconfiguring,
    ReplicationDisabled,
}

#[derive(Debug, Clone, Default)]
struct SlaveInfo {
    member_id: Option<i64>,
    host: Option<HostAndPort>,
    op_time: OpTime,
}

/// One blocked `awaitReplication` caller. Pushed on entry, popped on every
/// exit path; the master flag flips to false when leadership is lost.
struct Waiter {
    op_id: u64,
    op_time: OpTime,
    write_concern: WriteConcern,
    cond: Condvar,
    master: AtomicBool,
}

struct Inner {
    in_shutdown: bool,
    config_state: ConfigState,
    current_state: MemberState,
    is_waiting_for_drain: bool,
    rs_config: ReplicaSetConfig,
    self_index: Option<usize>,
    my_rid: Rid,
    rbid: i64,
    election_id: Option<Uuid>,
    progress: HashMap<Rid, SlaveInfo>,
    waiters: Vec<Arc<Waiter>>,
    seed_list: HashSet<HostAndPort>,
    hb_generation: u64,
    election: Option<ElectionState>,
}

struct CoordShared {
    settings: ReplicationSettings,
    executor: TopologyExecutor,
    external: Arc<dyn ExternalState>,
    network: Arc<dyn ReplicationNetwork>,
    inner: Mutex<Inner>,
    config_state_cond: Condvar,
    config_snapshot: ArcSwap<ReplicaSetConfig>,
}

/// What a config install asks the caller to do once the coordinator mutex is
/// released.
enum PostInstallAction {
    CloseConnections,
    SignalApplier,
}

pub struct ReplicationCoordinator {
    shared: Arc<CoordShared>,
}

impl ReplicationCoordinator {
    pub fn new(
        settings: ReplicationSettings,
        external: Arc<dyn ExternalState>,
        network: Arc<dyn ReplicationNetwork>,
    ) -> Self {
        let topology = TopologyCoordinator::new(
            settings.election_timeout(),
            settings.heartbeat_interval(),
        );
        let executor = TopologyExecutor::spawn(topology);
        let rbid = (OsRng.next_u64() >> 1) as i64;
        let shared = Arc::new(CoordShared {
            settings,
            executor,
            external,
            network,
            inner: Mutex::new(Inner {
                in_shutdown: false,
                config_state: ConfigState::PreStart,
                current_state: MemberState::Startup,
                is_waiting_for_drain: false,
                rs_config: ReplicaSetConfig::default(),
                self_index: None,
                my_rid: Uuid::nil(),
                rbid,
                election_id: None,
                progress: HashMap::new(),
                waiters: Vec::new(),
                seed_list: HashSet::new(),
                hb_generation: 0,
                election: None,
            }),
            config_state_cond: Condvar::new(),
            config_snapshot: ArcSwap::from_pointee(ReplicaSetConfig::default()),
        });
        Self { shared }
    }

    // ---- lifecycle ----------------------------------------------------------

    pub fn start_replication(&self) {
        if !self.shared.settings.repl_enabled() {
            let mut inner = self.shared.inner.lock();
            set_config_state(&self.shared, &mut inner, ConfigState::ReplicationDisabled);
            return;
        }

        {
            let mut inner = self.shared.inner.lock();
            assert!(!inner.in_shutdown, "startReplication after shutdown");
            set_config_state(&self.shared, &mut inner, ConfigState::StartingUp);
            inner.my_rid = self.shared.external.ensure_me();
            let my_rid = inner.my_rid;
            inner.progress.entry(my_rid).or_default();
        }

        if !self.shared.settings.using_repl_sets() {
            self.shared.external.start_master_slave();
            let mut inner = self.shared.inner.lock();
            set_config_state(&self.shared, &mut inner, ConfigState::Uninitialized);
            return;
        }

        self.shared.external.start_threads();

        if self.start_load_local_config() {
            let mut inner = self.shared.inner.lock();
            assert!(!inner.rs_config.is_initialized());
            set_config_state(&self.shared, &mut inner, ConfigState::Uninitialized);
        }
    }

    /// Returns true when loading finished synchronously (no stored config);
    /// otherwise the driver task completes startup.
    fn start_load_local_config(&self) -> bool {
        let doc = match self.shared.external.load_local_config_document() {
            Err(status) => {
                info!(
                    "did not find local replica set configuration document at startup; {}",
                    status
                );
                return true;
            }
            Ok(doc) => doc,
        };
        let config = match ReplicaSetConfig::initialize(&doc) {
            Err(status) => {
                warn!(
                    "locally stored replica set configuration does not parse; waiting for \
                     initiate or remote heartbeat; got {}",
                    status
                );
                return true;
            }
            Ok(config) => config,
        };
        let last_op_time = match self.shared.external.load_last_op_time() {
            Err(status) => {
                warn!(
                    "failed to load timestamp of most recently applied operation; {}",
                    status
                );
                OpTime::NULL
            }
            Ok(op_time) => op_time,
        };

        let shared = Arc::clone(&self.shared);
        let _ = self.shared.executor.schedule(move |topo, ctx| {
            finish_load_local_config(&shared, topo, ctx, config, last_op_time);
        });
        false
    }

    pub fn shutdown(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.in_shutdown = true;
            if inner.config_state == ConfigState::PreStart {
                warn!(
                    "replication coordinator shutdown called before startReplication finished; \
                     shutting down without cleaning up the replication system"
                );
            }
            for waiter in &inner.waiters {
                waiter.cond.notify_all();
            }
        }
        self.shared.executor.shutdown();
        self.shared.executor.join();
        self.shared.external.shutdown();
    }

    pub fn wait_for_startup_complete(&self) {
        let mut inner = self.shared.inner.lock();
        while matches!(
            inner.config_state,
            ConfigState::PreStart | ConfigState::StartingUp
        ) {
            self.shared.config_state_cond.wait(&mut inner);
        }
    }

    // ---- identity and mode --------------------------------------------------

    pub fn settings(&self) -> &ReplicationSettings {
        &self.shared.settings
    }

    pub fn is_repl_enabled(&self) -> bool {
        self.shared.settings.repl_enabled()
    }

    pub fn get_replication_mode(&self) -> ReplicationMode {
        let inner = self.shared.inner.lock();
        mode_inlock(&inner, &self.shared.settings)
    }

    pub fn get_current_member_state(&self) -> MemberState {
        self.shared.inner.lock().current_state
    }

    pub fn get_config_state(&self) -> ConfigState {
        self.shared.inner.lock().config_state
    }

    pub fn get_replica_set_config(&self) -> ReplicaSetConfig {
        (**self.shared.config_snapshot.load()).clone()
    }

    pub fn get_my_rid(&self) -> Rid {
        self.shared.inner.lock().my_rid
    }

    pub fn get_my_id(&self) -> Option<i64> {
        let inner = self.shared.inner.lock();
        inner
            .self_index
            .map(|i| inner.rs_config.member_at(i).id)
    }

    pub fn get_election_id(&self) -> Option<Uuid> {
        self.shared.inner.lock().election_id
    }

    pub fn get_rollback_id(&self) -> i64 {
        self.shared.inner.lock().rbid
    }

    pub fn increment_rollback_id(&self) {
        self.shared.inner.lock().rbid += 1;
    }

    pub fn get_slave_delay(&self) -> Result<Duration> {
        let inner = self.shared.inner.lock();
        let index = inner.self_index.ok_or_else(|| {
            RookDBError::NodeNotFound(
                "node is not a member of the current set configuration".to_string(),
            )
        })?;
        Ok(inner.rs_config.member_at(index).slave_delay)
    }

    pub fn builds_indexes(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner
            .self_index
            .map(|i| inner.rs_config.member_at(i).build_indexes)
            .unwrap_or(true)
    }

    // ---- progress map -------------------------------------------------------

    pub fn get_my_last_optime(&self) -> OpTime {
        let inner = self.shared.inner.lock();
        my_last_applied(&inner)
    }

    pub fn set_my_last_optime(&self, ts: OpTime) -> Result<()> {
        let rid = self.shared.inner.lock().my_rid;
        self.set_last_optime(rid, ts)
    }

    /// Apply one progress observation. Remote positions are monotonic; the
    /// local position may rewind to support rollback. Advancement wakes every
    /// waiter whose predicate now holds, then forwards progress upstream when
    /// this node is not primary.
    pub fn set_last_optime(&self, rid: Rid, ts: OpTime) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        debug!("node with RID {} has reached optime {}", rid, ts);

        let mode = mode_inlock(&inner, &self.shared.settings);
        if !inner.progress.contains_key(&rid) {
            if mode == ReplicationMode::ReplSet && rid != inner.my_rid {
                return Err(RookDBError::NodeNotFound(format!(
                    "received a position for node with RID {} with no handshake for that node",
                    rid
                )));
            }
            inner.progress.insert(rid, SlaveInfo::default());
        }

        let my_rid = inner.my_rid;
        let entry = inner.progress.get_mut(&rid).expect("entry just ensured");
        if entry.op_time < ts || rid == my_rid {
            entry.op_time = ts;

            for waiter in &inner.waiters {
                if done_waiting_for_replication(&inner, waiter.op_time, &waiter.write_concern) {
                    waiter.cond.notify_all();
                }
            }

            if mode == ReplicationMode::ReplSet && !inner.current_state.primary() {
                drop(inner);
                // Must happen outside the coordinator mutex.
                self.shared.external.forward_slave_progress();
            }
        }
        Ok(())
    }

    pub fn process_replset_update_position(&self, updates: &UpdatePositionArgs) -> Result<()> {
        for update in &updates.updates {
            self.set_last_optime(update.rid, update.op_time)?;
        }
        Ok(())
    }

    pub fn process_handshake(&self, handshake: &HandshakeArgs) -> Result<()> {
        debug!("received handshake for member {}", handshake.member_id);
        let mut inner = self.shared.inner.lock();
        if mode_inlock(&inner, &self.shared.settings) == ReplicationMode::ReplSet {
            let member = inner
                .rs_config
                .find_member_by_id(handshake.member_id)
                .cloned()
                .ok_or_else(|| {
                    RookDBError::NodeNotFound(format!(
                        "node with member ID {} could not be found in the replica set \
                         configuration during handshake",
                        handshake.member_id
                    ))
                })?;
            let entry = inner.progress.entry(handshake.rid).or_default();
            entry.member_id = Some(member.id);
            entry.host = Some(member.host.clone());

            if !inner.current_state.primary() {
                drop(inner);
                self.shared.external.forward_slave_handshake();
            }
        } else {
            inner.progress.entry(handshake.rid).or_default();
        }
        Ok(())
    }

    /// Progress report to send upstream: every known position with a member
    /// identity.
    pub fn prepare_update_position(&self) -> UpdatePositionArgs {
        let inner = self.shared.inner.lock();
        let mut updates: Vec<UpdatePositionEntry> = inner
            .progress
            .iter()
            .filter(|(_, info)| info.member_id.is_some())
            .map(|(rid, info)| UpdatePositionEntry {
                rid: *rid,
                op_time: info.op_time,
            })
            .collect();
        updates.sort_by_key(|u| u.rid);
        UpdatePositionArgs { updates }
    }

    pub fn get_hosts_written_to(&self, op: OpTime) -> Vec<HostAndPort> {
        let inner = self.shared.inner.lock();
        let mode = mode_inlock(&inner, &self.shared.settings);
        let mut hosts = Vec::new();
        for (rid, info) in &inner.progress {
            if info.op_time < op {
                continue;
            }
            if mode == ReplicationMode::ReplSet {
                let member = info
                    .member_id
                    .and_then(|id| inner.rs_config.find_member_by_id(id));
                match member {
                    // A node removed in a reconfig no longer counts.
                    None => continue,
                    Some(member) => hosts.push(member.host.clone()),
                }
            } else {
                if *rid == inner.my_rid {
                    continue;
                }
                if let Some(host) = &info.host {
                    hosts.push(host.clone());
                }
            }
        }
        hosts
    }

    pub fn get_other_nodes_in_repl_set(&self) -> Vec<HostAndPort> {
        let inner = self.shared.inner.lock();
        inner
            .rs_config
            .members
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != inner.self_index)
            .map(|(_, m)| m.host.clone())
            .collect()
    }

    /// Re-read the applied position from durable storage, e.g. after
    /// rollback truncated the log.
    pub fn reset_last_op_time_from_storage(&self) {
        let last = match self.shared.external.load_last_op_time() {
            Ok(op_time) => op_time,
            Err(status) => {
                warn!(
                    "failed to load timestamp of most recently applied operation; {}",
                    status
                );
                OpTime::NULL
            }
        };
        let _ = self.set_my_last_optime(last);
    }

    // ---- write concern waiting ----------------------------------------------

    pub fn await_replication(
        &self,
        opctx: &OperationContext,
        op_time: OpTime,
        write_concern: &WriteConcern,
    ) -> (Result<()>, Duration) {
        let start = Instant::now();
        let mut inner = self.shared.inner.lock();
        let status = self.await_replication_inlock(&mut inner, opctx, op_time, write_concern, start);
        (status, start.elapsed())
    }

    pub fn await_replication_of_last_op_applied(
        &self,
        opctx: &OperationContext,
        write_concern: &WriteConcern,
    ) -> (Result<()>, Duration) {
        let start = Instant::now();
        let mut inner = self.shared.inner.lock();
        let op_time = my_last_applied(&inner);
        let status = self.await_replication_inlock(&mut inner, opctx, op_time, write_concern, start);
        (status, start.elapsed())
    }

    fn await_replication_inlock(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        opctx: &OperationContext,
        op_time: OpTime,
        write_concern: &WriteConcern,
        start: Instant,
    ) -> Result<()> {
        let mode = mode_inlock(inner, &self.shared.settings);
        if mode == ReplicationMode::None || self.shared.settings.config_server {
            return Ok(());
        }
        if mode == ReplicationMode::MasterSlave && write_concern.w_mode == MAJORITY_MODE {
            // With master/slave, majority is equivalent to w=1.
            return Ok(());
        }
        if op_time.is_null() {
            return Ok(());
        }
        if mode == ReplicationMode::ReplSet && !inner.current_state.primary() {
            return Err(RookDBError::NotMaster(
                "not master while waiting for replication".to_string(),
            ));
        }
        if write_concern.is_numeric() {
            if write_concern.w_num_nodes < 1 {
                return Ok(());
            }
            if write_concern.w_num_nodes == 1 && my_last_applied(inner) >= op_time {
                return Ok(());
            }
        }

        let waiter = Arc::new(Waiter {
            op_id: opctx.op_id(),
            op_time,
            write_concern: write_concern.clone(),
            cond: Condvar::new(),
            master: AtomicBool::new(true),
        });
        inner.waiters.push(Arc::clone(&waiter));

        let status = loop {
            if done_waiting_for_replication(inner, op_time, write_concern) {
                break check_write_concern_satisfiable_inlock(
                    inner,
                    &self.shared.settings,
                    write_concern,
                );
            }

            if let Err(status) = opctx.check_for_interrupt() {
                break Err(status);
            }
            if !waiter.master.load(Ordering::SeqCst) {
                break Err(RookDBError::NotMaster(
                    "not master anymore while waiting for replication - this most likely means \
                     that a step down occurred while waiting for replication"
                        .to_string(),
                ));
            }
            let elapsed = start.elapsed();
            if let Some(timeout) = write_concern.w_timeout {
                if elapsed >= timeout {
                    break Err(RookDBError::ExceededTimeLimit(
                        "waiting for replication timed out".to_string(),
                    ));
                }
            }
            if inner.in_shutdown {
                break Err(RookDBError::ShutdownInProgress(
                    "replication is being shut down".to_string(),
                ));
            }

            match write_concern.w_timeout {
                None => waiter.cond.wait(inner),
                Some(timeout) => {
                    let _ = waiter.cond.wait_for(inner, timeout - start.elapsed().min(timeout));
                }
            }
        };

        inner.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
        status
    }

    pub fn check_if_write_concern_can_be_satisfied(&self, write_concern: &WriteConcern) -> Result<()> {
        let inner = self.shared.inner.lock();
        check_write_concern_satisfiable_inlock(&inner, &self.shared.settings, write_concern)
    }

    /// Wake a specific blocked waiter so it can observe interruption.
    pub fn interrupt(&self, op_id: u64) {
        let inner = self.shared.inner.lock();
        for waiter in &inner.waiters {
            if waiter.op_id == op_id {
                waiter.cond.notify_all();
                return;
            }
        }
    }

    pub fn interrupt_all(&self) {
        let inner = self.shared.inner.lock();
        for waiter in &inner.waiters {
            waiter.cond.notify_all();
        }
    }

    // ---- role reporting and gating ------------------------------------------

    pub fn is_master_for_reporting_purposes(&self) -> bool {
        if self.shared.settings.using_repl_sets() {
            let inner = self.shared.inner.lock();
            return mode_inlock(&inner, &self.shared.settings) == ReplicationMode::ReplSet
                && inner.current_state.primary();
        }
        if !self.shared.settings.slave {
            return true;
        }
        self.shared.settings.master
    }

    pub fn can_accept_writes_for_database(&self, db: &str) -> bool {
        let inner = self.shared.inner.lock();
        if self.shared.settings.using_repl_sets() {
            if mode_inlock(&inner, &self.shared.settings) == ReplicationMode::ReplSet
                && inner.current_state.primary()
                && !inner.is_waiting_for_drain
            {
                return true;
            }
            return db == "local";
        }
        if !self.shared.settings.slave {
            return true;
        }
        if self.shared.settings.master {
            return true;
        }
        db == "local"
    }

    pub fn check_can_serve_reads_for(&self, db: &str, slave_ok: bool) -> Result<()> {
        if self.can_accept_writes_for_database(db) {
            return Ok(());
        }
        let inner = self.shared.inner.lock();
        let mode = mode_inlock(&inner, &self.shared.settings);
        if slave_ok {
            if mode == ReplicationMode::MasterSlave || mode == ReplicationMode::None {
                return Ok(());
            }
            if inner.current_state.secondary() {
                return Ok(());
            }
            return Err(RookDBError::NotMasterOrSecondary(
                "not master or secondary; cannot currently read from this replica set member"
                    .to_string(),
            ));
        }
        Err(RookDBError::NotMaster(
            "not master and slaveOk=false".to_string(),
        ))
    }

    /// Unique constraints are relaxed while this node replays operations it
    /// did not coordinate (initial sync, recovery, rollback).
    pub fn should_ignore_unique_index(&self, unique: bool, is_id_index: bool) -> bool {
        if !unique || is_id_index {
            return false;
        }
        let inner = self.shared.inner.lock();
        if mode_inlock(&inner, &self.shared.settings) != ReplicationMode::ReplSet {
            return false;
        }
        matches!(
            inner.current_state,
            MemberState::Startup2 | MemberState::Recovering | MemberState::Rollback
        )
    }

    pub fn check_repl_enabled_for_command(&self) -> Result<()> {
        if !self.shared.settings.using_repl_sets() {
            return Err(RookDBError::NoReplicationEnabled(
                "not running with a replica set name".to_string(),
            ));
        }
        if self.get_replication_mode() != ReplicationMode::ReplSet {
            return Err(RookDBError::NotYetInitialized(
                "no replica set configuration has been received".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fill_is_master_response(&self) -> IsMasterResponse {
        let response = Arc::new(Mutex::new(IsMasterResponse::default()));
        let response_for_task = Arc::clone(&response);
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            let mut response = response_for_task.lock();
            if ctx.canceled {
                response.mark_shutdown_in_progress();
            } else {
                topo.fill_is_master(&mut response);
            }
        });
        match cbh {
            Ok(handle) => self.shared.executor.wait(handle),
            Err(_) => {
                let mut r = response.lock();
                r.mark_shutdown_in_progress();
            }
        }
        let mut result = response.lock().clone();
        if self.is_waiting_for_applier_to_drain() {
            // Report not-master while draining the applier.
            result.is_master = false;
        }
        result
    }

    // ---- drain protocol -----------------------------------------------------

    pub fn is_waiting_for_applier_to_drain(&self) -> bool {
        self.shared.inner.lock().is_waiting_for_drain
    }

    /// The applier may call this whenever it wants, not only when the
    /// coordinator expects it, so every step re-checks the flag: check under
    /// the mutex, release it, take the global exclusive lock (writes are
    /// frozen from here), re-check, clear, drop temp collections.
    pub fn signal_drain_complete(&self) {
        let inner = self.shared.inner.lock();
        if !inner.is_waiting_for_drain {
            return;
        }
        drop(inner);

        let opctx = self.shared.external.create_operation_context();
        let _global = self.shared.external.global_lock().exclusive();
        let mut inner = self.shared.inner.lock();
        if !inner.is_waiting_for_drain {
            return;
        }
        inner.is_waiting_for_drain = false;
        drop(inner);
        self.shared.external.drop_all_temp_collections(&opctx);
        info!("drain complete; accepting writes");
    }

    // ---- follower mode and maintenance --------------------------------------

    pub fn set_follower_mode(&self, new_state: MemberState) -> bool {
        let finish_event = match self.shared.executor.make_event() {
            Ok(event) => event,
            Err(_) => return false,
        };
        let success = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let success_for_task = Arc::clone(&success);
        let scheduled = self.shared.executor.schedule(move |topo, ctx| {
            set_follower_mode_finish(&shared, topo, ctx, new_state, finish_event, success_for_task);
        });
        if scheduled.is_err() {
            return false;
        }
        self.shared.executor.wait_for_event(finish_event);
        success.load(Ordering::SeqCst)
    }

    pub fn get_maintenance_mode(&self) -> bool {
        let result = Arc::new(AtomicBool::new(false));
        let result_for_task = Arc::clone(&result);
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            if !ctx.canceled {
                result_for_task.store(topo.maintenance_count() > 0, Ordering::SeqCst);
            }
        });
        if let Ok(handle) = cbh {
            self.shared.executor.wait(handle);
        }
        result.load(Ordering::SeqCst)
    }

    pub fn set_maintenance_mode(&self, activate: bool) -> Result<()> {
        let result = new_result_slot();
        let shared = Arc::clone(&self.shared);
        let result_for_task = Arc::clone(&result);
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            if ctx.canceled {
                set_result(&result_for_task, Err(RookDBError::ShutdownInProgress(
                    "replication system is shutting down".to_string(),
                )));
                return;
            }
            let status = (|| {
                let mut inner = shared.inner.lock();
                if inner.current_state.primary() || topo.role() != Role::Follower {
                    return Err(RookDBError::NotSecondary(
                        "primaries cannot modify maintenance mode".to_string(),
                    ));
                }
                let current = topo.maintenance_count();
                if activate {
                    info!(
                        "going into maintenance mode with {} other maintenance mode tasks in \
                         progress",
                        current
                    );
                    topo.adjust_maintenance_count_by(1);
                } else if current > 0 {
                    topo.adjust_maintenance_count_by(-1);
                    info!(
                        "leaving maintenance mode ({} other maintenance mode tasks ongoing)",
                        current - 1
                    );
                } else {
                    warn!("attempted to leave maintenance mode but it is not active");
                    return Err(RookDBError::OperationFailed(
                        "already out of maintenance mode".to_string(),
                    ));
                }
                update_member_state_from_topology(&mut inner, topo);
                Ok(())
            })();
            set_result(&result_for_task, status);
        });
        let handle = cbh?;
        self.shared.executor.wait(handle);
        take_result(&result)
    }

    pub fn process_replset_freeze(&self, secs: i64) -> Result<String> {
        let result: Arc<Mutex<Option<Result<String>>>> = Arc::new(Mutex::new(None));
        let result_for_task = Arc::clone(&result);
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            let status = if ctx.canceled {
                Err(RookDBError::ShutdownInProgress(
                    "replication shutdown in progress".to_string(),
                ))
            } else {
                topo.prepare_freeze_response(Instant::now(), secs)
            };
            *result_for_task.lock() = Some(status);
        });
        let handle = cbh?;
        self.shared.executor.wait(handle);
        let __result = result
            .lock()
            .take()
            .unwrap_or_else(|| Err(RookDBError::status_never_set()));
        __result
    }

    pub fn process_replset_sync_from(&self, target: &HostAndPort) -> Result<String> {
        let result: Arc<Mutex<Option<Result<String>>>> = Arc::new(Mutex::new(None));
        let result_for_task = Arc::clone(&result);
        let target = target.clone();
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            let status = if ctx.canceled {
                Err(RookDBError::ShutdownInProgress(
                    "replication shutdown in progress".to_string(),
                ))
            } else {
                topo.prepare_sync_from_response(&target)
            };
            *result_for_task.lock() = Some(status);
        });
        let handle = cbh?;
        self.shared.executor.wait(handle);
        let __result = result
            .lock()
            .take()
            .unwrap_or_else(|| Err(RookDBError::status_never_set()));
        __result
    }

    // ---- stepdown -----------------------------------------------------------

    /// Wait (bounded by `wait_time`) for another electable member to catch
    /// up, then relinquish leadership until `step_down_time` has passed.
    pub fn step_down(
        &self,
        opctx: &OperationContext,
        force: bool,
        wait_time: Duration,
        step_down_time: Duration,
    ) -> Result<()> {
        let step_down_until = Instant::now() + step_down_time;

        let external = Arc::clone(&self.shared.external);
        let _global = external
            .global_lock()
            .try_exclusive_for(step_down_time)
            .ok_or_else(|| {
                RookDBError::ExceededTimeLimit(
                    "could not acquire the global lock within the amount of time specified that \
                     we should step down for"
                        .to_string(),
                )
            })?;

        let mut inner = self.shared.inner.lock();
        if !inner.current_state.primary() {
            return Err(RookDBError::NotMaster(
                "not primary so can't step down".to_string(),
            ));
        }

        // Make sure at least one other electable node is caught up, clamping
        // the wait so it cannot run past the stepdown deadline.
        let mut write_concern = WriteConcern::mode(STEP_DOWN_CHECK_MODE);
        let remaining = step_down_until.saturating_duration_since(Instant::now());
        write_concern.w_timeout = Some(wait_time.min(remaining));

        let last_op = my_last_applied(&inner);
        let start = Instant::now();
        let status = self.await_replication_inlock(&mut inner, opctx, last_op, &write_concern, start);
        if let Err(status) = status {
            if !status.is_exceeded_time_limit() {
                return Err(status);
            }
            if !force {
                return Err(RookDBError::ExceededTimeLimit(format!(
                    "after {} milliseconds there were no secondaries caught up in replication",
                    start.elapsed().as_millis()
                )));
            }
            // "force" means the timeout is ignored.
        }

        let result = new_result_slot();
        let shared = Arc::clone(&self.shared);
        let result_for_task = Arc::clone(&result);
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            step_down_finish(&shared, topo, ctx, step_down_until, &result_for_task);
        });
        let handle = cbh?;
        drop(inner);
        self.shared.executor.wait(handle);
        take_result(&result)
    }

    // ---- heartbeats ---------------------------------------------------------

    pub fn process_heartbeat(&self, args: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        {
            let inner = self.shared.inner.lock();
            if matches!(
                inner.config_state,
                ConfigState::PreStart | ConfigState::StartingUp
            ) {
                return Err(RookDBError::NotYetInitialized(
                    "received heartbeat while still initializing replication system".to_string(),
                ));
            }
        }

        let result: Arc<Mutex<Option<Result<HeartbeatResponse>>>> = Arc::new(Mutex::new(None));
        let result_for_task = Arc::clone(&result);
        let shared = Arc::clone(&self.shared);
        let args = args.clone();
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            if ctx.canceled {
                *result_for_task.lock() = Some(Err(RookDBError::ShutdownInProgress(
                    "replication shutdown in progress".to_string(),
                )));
                return;
            }
            let last_applied = my_last_applied(&shared.inner.lock());
            let status = topo.prepare_heartbeat_response(
                Instant::now(),
                &args,
                shared.settings.our_set_name(),
                last_applied,
            );
            let respond_ok = status.is_ok();
            *result_for_task.lock() = Some(status);

            if respond_ok && topo.self_index().is_none() {
                // This node is not in the configuration it knows about. Any
                // node heartbeating us probably has a configuration that
                // contains us, so probe it back once.
                if let Some(sender) = &args.sender_host {
                    let mut inner = shared.inner.lock();
                    if inner.seed_list.insert(sender.clone()) {
                        let generation = inner.hb_generation;
                        drop(inner);
                        schedule_heartbeat_to_target(&shared, sender.clone(), generation, Instant::now());
                    }
                }
            }
        });
        match cbh {
            Ok(handle) => self.shared.executor.wait(handle),
            Err(_) => {
                return Err(RookDBError::ShutdownInProgress(
                    "replication shutdown in progress".to_string(),
                ))
            }
        }
        let __result = result
            .lock()
            .take()
            .unwrap_or_else(|| Err(RookDBError::status_never_set()));
        __result
    }

    pub fn process_replset_fresh(&self, args: &FreshRequest) -> Result<FreshResponse> {
        let result: Arc<Mutex<Option<Result<FreshResponse>>>> = Arc::new(Mutex::new(None));
        let result_for_task = Arc::clone(&result);
        let shared = Arc::clone(&self.shared);
        let args = args.clone();
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            let status = if ctx.canceled {
                Err(RookDBError::ShutdownInProgress(
                    "replication shutdown in progress".to_string(),
                ))
            } else {
                let last_applied = my_last_applied(&shared.inner.lock());
                topo.prepare_fresh_response(&args, Instant::now(), last_applied)
            };
            *result_for_task.lock() = Some(status);
        });
        let handle = cbh?;
        self.shared.executor.wait(handle);
        let __result = result
            .lock()
            .take()
            .unwrap_or_else(|| Err(RookDBError::status_never_set()));
        __result
    }

    pub fn process_replset_elect(&self, args: &ElectRequest) -> Result<ElectResponse> {
        let result: Arc<Mutex<Option<Result<ElectResponse>>>> = Arc::new(Mutex::new(None));
        let result_for_task = Arc::clone(&result);
        let shared = Arc::clone(&self.shared);
        let args = args.clone();
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            let status = if ctx.canceled {
                Err(RookDBError::ShutdownInProgress(
                    "replication shutdown in progress".to_string(),
                ))
            } else {
                let last_applied = my_last_applied(&shared.inner.lock());
                topo.prepare_elect_response(&args, Instant::now(), last_applied)
            };
            *result_for_task.lock() = Some(status);
        });
        let handle = cbh?;
        self.shared.executor.wait(handle);
        let __result = result
            .lock()
            .take()
            .unwrap_or_else(|| Err(RookDBError::status_never_set()));
        __result
    }

    // ---- sync source policy -------------------------------------------------

    pub fn choose_new_sync_source(&self) -> Option<HostAndPort> {
        let result: Arc<Mutex<Option<HostAndPort>>> = Arc::new(Mutex::new(None));
        let result_for_task = Arc::clone(&result);
        let shared = Arc::clone(&self.shared);
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            if ctx.canceled {
                return;
            }
            let last_applied = my_last_applied(&shared.inner.lock());
            *result_for_task.lock() = topo.choose_new_sync_source(Instant::now(), last_applied);
        });
        match cbh {
            Ok(handle) => self.shared.executor.wait(handle),
            Err(_) => return None,
        }
        let source = result.lock().take();
        source
    }

    pub fn blacklist_sync_source(&self, host: &HostAndPort, until: Instant) {
        let host = host.clone();
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            if ctx.canceled {
                return;
            }
            topo.blacklist_sync_source(&host, until);
        });
        if let Ok(handle) = cbh {
            self.shared.executor.wait(handle);
        }
    }

    pub fn clear_sync_source_blacklist(&self) {
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            if ctx.canceled {
                return;
            }
            topo.clear_sync_source_blacklist();
        });
        if let Ok(handle) = cbh {
            self.shared.executor.wait(handle);
        }
    }

    pub fn should_change_sync_source(&self, current: &HostAndPort) -> bool {
        let result = Arc::new(AtomicBool::new(false));
        let result_for_task = Arc::clone(&result);
        let current = current.clone();
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            if ctx.canceled {
                return;
            }
            result_for_task.store(
                topo.should_change_sync_source(&current, Instant::now()),
                Ordering::SeqCst,
            );
        });
        match cbh {
            Ok(handle) => self.shared.executor.wait(handle),
            Err(_) => return false,
        }
        result.load(Ordering::SeqCst)
    }

    // ---- configuration changes ----------------------------------------------

    pub fn process_replset_get_config(&self) -> Document {
        self.shared.inner.lock().rs_config.to_document()
    }

    pub fn process_replset_initiate(&self, config_obj: &Document) -> Result<()> {
        info!("replSetInitiate admin command received from client");

        let mut inner = self.shared.inner.lock();
        if !self.shared.settings.using_repl_sets() {
            return Err(RookDBError::NoReplicationEnabled(
                "server is not running with a replica set name".to_string(),
            ));
        }
        while matches!(
            inner.config_state,
            ConfigState::PreStart | ConfigState::StartingUp
        ) {
            self.shared.config_state_cond.wait(&mut inner);
        }
        if inner.config_state != ConfigState::Uninitialized {
            return Err(RookDBError::AlreadyInitialized(
                "already initialized; query the stored configuration to see it".to_string(),
            ));
        }
        assert!(!inner.rs_config.is_initialized());
        set_config_state(&self.shared, &mut inner, ConfigState::Initiating);
        let guard = ConfigStateGuard::new(&self.shared, ConfigState::Uninitialized);
        drop(inner);

        let mut config = ReplicaSetConfig::initialize(config_obj)?;
        if config.name.is_empty() {
            config.name = self.shared.settings.our_set_name().to_string();
        } else if config.name != self.shared.settings.our_set_name() {
            let errmsg = format!(
                "attempting to initiate a replica set with name {}, but this node's setting is \
                 {}; rejecting",
                config.name,
                self.shared.settings.our_set_name()
            );
            error!("{}", errmsg);
            return Err(RookDBError::BadValue(errmsg));
        }
        config.validate()?;

        let external = Arc::clone(&self.shared.external);
        let my_index = config.find_self(|host| external.is_self(host))?;
        info!(
            "replSetInitiate config object with {} members parses ok",
            config.num_members()
        );

        quorum::check_quorum_for_initiate(
            self.shared.network.as_ref(),
            &config,
            my_index,
            self.shared.settings.quorum_check_timeout(),
        )?;

        self.shared
            .external
            .store_local_config_document(&config.to_document())?;

        let shared = Arc::clone(&self.shared);
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            if ctx.canceled {
                return;
            }
            let mut inner = shared.inner.lock();
            assert!(inner.config_state == ConfigState::Initiating);
            assert!(!inner.rs_config.is_initialized());
            let action = install_config(&shared, topo, &mut inner, config, Some(my_index));
            drop(inner);
            perform_post_install(&shared, action);
        });
        let handle = cbh?;
        guard.dismiss();
        self.shared.executor.wait(handle);
        Ok(())
    }

    pub fn process_replset_reconfig(&self, new_config_obj: &Document, force: bool) -> Result<()> {
        info!("replSetReconfig admin command received from client");

        let mut inner = self.shared.inner.lock();
        if !self.shared.settings.using_repl_sets() {
            return Err(RookDBError::NoReplicationEnabled(
                "server is not running with a replica set name".to_string(),
            ));
        }
        while matches!(
            inner.config_state,
            ConfigState::PreStart | ConfigState::StartingUp
        ) {
            self.shared.config_state_cond.wait(&mut inner);
        }
        match inner.config_state {
            ConfigState::Steady => {}
            ConfigState::Uninitialized => {
                return Err(RookDBError::NotYetInitialized(
                    "node not yet initialized; use the replSetInitiate command".to_string(),
                ))
            }
            ConfigState::ReplicationDisabled => {
                return Err(RookDBError::NoReplicationEnabled(
                    "node is not a replica set member".to_string(),
                ))
            }
            ConfigState::Initiating
            | ConfigState::Reconfiguring
            | ConfigState::HBReconfiguring => {
                return Err(RookDBError::ConfigurationInProgress(
                    "cannot run replSetReconfig because the node is currently updating its \
                     configuration"
                        .to_string(),
                ))
            }
            state => panic!("unexpected config state {:?}", state),
        }
        assert!(inner.rs_config.is_initialized());

        if !force && !inner.current_state.primary() {
            return Err(RookDBError::NotMaster(format!(
                "replSetReconfig should only be run on PRIMARY, but my state is {}; use the \
                 \"force\" argument to override",
                inner.current_state
            )));
        }

        set_config_state(&self.shared, &mut inner, ConfigState::Reconfiguring);
        let guard = ConfigStateGuard::new(&self.shared, ConfigState::Steady);
        let old_config = inner.rs_config.clone();
        drop(inner);

        let config_obj = if force {
            increment_config_version_by_random(new_config_obj)
        } else {
            new_config_obj.clone()
        };
        let mut config = match ReplicaSetConfig::initialize(&config_obj) {
            Ok(config) => config,
            Err(status) => {
                error!("replSetReconfig got {} while parsing the new config", status);
                return Err(status);
            }
        };
        if config.name.is_empty() {
            config.name = self.shared.settings.our_set_name().to_string();
        } else if config.name != self.shared.settings.our_set_name() {
            let errmsg = format!(
                "attempting to reconfigure a replica set with name {}, but this node's setting \
                 is {}; rejecting",
                config.name,
                self.shared.settings.our_set_name()
            );
            error!("{}", errmsg);
            return Err(RookDBError::BadValue(errmsg));
        }
        config.validate()?;
        if !force && config.version <= old_config.version {
            return Err(RookDBError::BadValue(format!(
                "new config version {} must be greater than the current version {}",
                config.version, old_config.version
            )));
        }

        let external = Arc::clone(&self.shared.external);
        let my_index = match config.find_self(|host| external.is_self(host)) {
            Ok(index) => Some(index),
            Err(status) => {
                if !force {
                    error!("replSetReconfig got {} while validating the new config", status);
                    return Err(status);
                }
                None
            }
        };
        info!(
            "replSetReconfig config object with {} members parses ok",
            config.num_members()
        );

        if !force {
            let my_index = my_index.expect("non-forced reconfig resolved self above");
            quorum::check_quorum_for_reconfig(
                self.shared.network.as_ref(),
                &config,
                my_index,
                self.shared.settings.quorum_check_timeout(),
            )?;
        }

        self.shared
            .external
            .store_local_config_document(&config.to_document())?;

        let shared = Arc::clone(&self.shared);
        let cbh = self.shared.executor.schedule(move |topo, ctx| {
            if ctx.canceled {
                return;
            }
            let mut inner = shared.inner.lock();
            assert!(inner.config_state == ConfigState::Reconfiguring);
            assert!(inner.rs_config.is_initialized());
            let action = install_config(&shared, topo, &mut inner, config, my_index);
            drop(inner);
            perform_post_install(&shared, action);
        });
        let handle = cbh?;
        guard.dismiss();
        self.shared.executor.wait(handle);
        Ok(())
    }
}

// ---- free helpers shared with driver tasks ----------------------------------

type ResultSlot = Arc<Mutex<Option<Result<()>>>>;

fn new_result_slot() -> ResultSlot {
    Arc::new(Mutex::new(None))
}

fn set_result(slot: &ResultSlot, status: Result<()>) {
    *slot.lock() = Some(status);
}

fn take_result(slot: &ResultSlot) -> Result<()> {
    slot.lock()
        .take()
        .unwrap_or_else(|| Err(RookDBError::status_never_set()))
}

fn mode_inlock(inner: &Inner, settings: &ReplicationSettings) -> ReplicationMode {
    if inner.rs_config.is_initialized() {
        ReplicationMode::ReplSet
    } else if settings.master || settings.slave {
        ReplicationMode::MasterSlave
    } else {
        ReplicationMode::None
    }
}

fn my_last_applied(inner: &Inner) -> OpTime {
    inner
        .progress
        .get(&inner.my_rid)
        .map(|info| info.op_time)
        .unwrap_or(OpTime::NULL)
}

/// The write-concern predicate. The local applied position is a
/// precondition: secondaries ahead of us cannot satisfy a concern we have
/// not satisfied ourselves.
fn done_waiting_for_replication(inner: &Inner, op_time: OpTime, write_concern: &WriteConcern) -> bool {
    if my_last_applied(inner) < op_time {
        return false;
    }
    if !write_concern.w_mode.is_empty() {
        if write_concern.w_mode == MAJORITY_MODE {
            return have_num_nodes_reached(inner, op_time, inner.rs_config.majority_vote_count());
        }
        match inner.rs_config.find_custom_write_mode(&write_concern.w_mode) {
            // A missing pattern unblocks the waiter so the final status check
            // can report the unknown mode instead of hanging.
            Err(_) => true,
            Ok(pattern) => {
                let mut matcher = TagMatcher::new(&pattern);
                for info in inner.progress.values() {
                    if info.op_time < op_time {
                        continue;
                    }
                    let member = match info
                        .member_id
                        .and_then(|id| inner.rs_config.find_member_by_id(id))
                    {
                        Some(member) => member,
                        None => continue,
                    };
                    for (key, value) in member.effective_tags() {
                        if matcher.update(&key, &value) {
                            return true;
                        }
                    }
                }
                false
            }
        }
    } else {
        have_num_nodes_reached(inner, op_time, write_concern.w_num_nodes)
    }
}

fn have_num_nodes_reached(inner: &Inner, op_time: OpTime, num_nodes: i32) -> bool {
    let mut remaining = num_nodes;
    for info in inner.progress.values() {
        if info.op_time >= op_time {
            remaining -= 1;
        }
        if remaining <= 0 {
            return true;
        }
    }
    false
}

fn check_write_concern_satisfiable_inlock(
    inner: &Inner,
    settings: &ReplicationSettings,
    write_concern: &WriteConcern,
) -> Result<()> {
    match mode_inlock(inner, settings) {
        ReplicationMode::None => Err(RookDBError::NoReplicationEnabled(
            "no replication enabled when checking if write concern can be satisfied".to_string(),
        )),
        ReplicationMode::MasterSlave => {
            if !write_concern.w_mode.is_empty() {
                return Err(RookDBError::UnknownReplWriteConcern(
                    "cannot use named write concern modes in master-slave".to_string(),
                ));
            }
            // No way to know how many slaves there are, so assume any numeric
            // mode is possible.
            Ok(())
        }
        ReplicationMode::ReplSet => inner
            .rs_config
            .check_if_write_concern_can_be_satisfied(write_concern),
    }
}

fn set_config_state(shared: &Arc<CoordShared>, inner: &mut Inner, new_state: ConfigState) {
    if inner.config_state != new_state {
        inner.config_state = new_state;
        shared.config_state_cond.notify_all();
    }
}

fn update_member_state_from_topology(inner: &mut Inner, topo: &TopologyCoordinator) {
    let new_state = topo.member_state();
    if new_state != inner.current_state {
        info!("transition to {}", new_state);
        let was_primary = inner.current_state.primary();
        inner.current_state = new_state;
        if was_primary && !new_state.primary() {
            for waiter in &inner.waiters {
                waiter.master.store(false, Ordering::SeqCst);
                waiter.cond.notify_all();
            }
        }
    }
}

/// Prune progress entries for members removed by a reconfig and (re)bind the
/// local node's entry to its member identity.
fn update_progress_from_config(inner: &mut Inner) {
    let config = inner.rs_config.clone();
    let my_rid = inner.my_rid;
    inner.progress.retain(|rid, info| {
        *rid == my_rid
            || info
                .member_id
                .map(|id| config.find_member_by_id(id).is_some())
                .unwrap_or(false)
    });
    let self_member = inner
        .self_index
        .map(|i| config.member_at(i).clone());
    let entry = inner.progress.entry(my_rid).or_default();
    match self_member {
        Some(member) => {
            entry.member_id = Some(member.id);
            entry.host = Some(member.host);
        }
        None => {
            entry.member_id = None;
            entry.host = None;
        }
    }
}

/// Install a configuration: cancel heartbeats, move to Steady, hand the new
/// config to the topology, short-circuit a one-node election, refresh the
/// visible member state and restart heartbeats. Runs on the driver with the
/// coordinator mutex held briefly; the returned action is performed by the
/// caller after release.
fn install_config(
    shared: &Arc<CoordShared>,
    topo: &mut TopologyCoordinator,
    inner: &mut Inner,
    config: ReplicaSetConfig,
    my_index: Option<usize>,
) -> PostInstallAction {
    inner.hb_generation += 1;
    // Votes from a round started under the old configuration must not elect
    // us under the new one.
    if let Some(election) = inner.election.as_mut() {
        election.cancel();
    }
    set_config_state(shared, inner, ConfigState::Steady);
    inner.rs_config = config.clone();
    inner.self_index = my_index;
    shared.config_snapshot.store(Arc::new(config.clone()));

    let my_last = my_last_applied(inner);
    let became_candidate = topo.update_config(config, my_index, Instant::now(), my_last);
    if became_candidate {
        // One-node set: no heartbeat round trip can elect us, so win now.
        topo.process_win_election(Uuid::new_v4(), my_last);
        inner.election_id = topo.election_id();
        inner.is_waiting_for_drain = true;
    }

    let previous_state = inner.current_state;
    update_member_state_from_topology(inner, topo);

    let action = if inner.current_state.removed()
        || (previous_state.primary() && !inner.current_state.primary())
    {
        // Closing connections also makes the applier pick a new sync source.
        PostInstallAction::CloseConnections
    } else {
        PostInstallAction::SignalApplier
    };

    update_progress_from_config(inner);
    start_heartbeats(shared, inner);
    action
}

fn perform_post_install(shared: &Arc<CoordShared>, action: PostInstallAction) {
    match action {
        PostInstallAction::CloseConnections => shared.external.close_connections(),
        PostInstallAction::SignalApplier => {
            shared.external.signal_applier_to_choose_new_sync_source()
        }
    }
}

fn finish_load_local_config(
    shared: &Arc<CoordShared>,
    topo: &mut TopologyCoordinator,
    ctx: &TaskContext,
    config: ReplicaSetConfig,
    last_op_time: OpTime,
) {
    if ctx.canceled {
        return;
    }

    let mut my_index = match config.find_self(|host| shared.external.is_self(host)) {
        Ok(index) => Some(index),
        Err(status) => {
            warn!(
                "locally stored replica set configuration not valid for current node; waiting \
                 for reconfig or remote heartbeat; got {}",
                status
            );
            None
        }
    };
    if config.name != shared.settings.our_set_name() {
        warn!(
            "local replica set configuration document reports set name {}, but this node's \
             setting is {}; waiting for reconfig or remote heartbeat",
            config.name,
            shared.settings.our_set_name()
        );
        my_index = None;
    }

    let mut inner = shared.inner.lock();
    assert!(inner.config_state == ConfigState::StartingUp);
    let action = install_config(shared, topo, &mut inner, config, my_index);
    let my_rid = inner.my_rid;
    if let Some(entry) = inner.progress.get_mut(&my_rid) {
        entry.op_time = last_op_time;
    }
    drop(inner);
    perform_post_install(shared, action);
}

fn set_follower_mode_finish(
    shared: &Arc<CoordShared>,
    topo: &mut TopologyCoordinator,
    ctx: &TaskContext,
    new_state: MemberState,
    finish_event: crate::executor::EventHandle,
    success: Arc<AtomicBool>,
) {
    if ctx.canceled {
        return;
    }
    if new_state == topo.member_state() {
        success.store(true, Ordering::SeqCst);
        shared.executor.signal_event(finish_event);
        return;
    }
    if topo.role() == Role::Leader {
        // Leaders must step down instead.
        shared.executor.signal_event(finish_event);
        return;
    }

    if topo.role() == Role::Candidate {
        // An election is in flight; cancel it and finish setting the
        // follower mode once the election wraps up.
        let mut inner = shared.inner.lock();
        let election = inner
            .election
            .as_mut()
            .expect("candidate role implies an in-flight election");
        election.cancel();
        let election_finished = election.finish_event;
        drop(inner);
        let shared_for_retry = Arc::clone(shared);
        let _ = shared.executor.on_event(election_finished, move |topo, ctx| {
            set_follower_mode_finish(&shared_for_retry, topo, ctx, new_state, finish_event, success);
        });
        return;
    }

    let became_candidate = topo.set_follower_mode(new_state);
    let mut inner = shared.inner.lock();
    if became_candidate {
        // One-node replica set entering SECONDARY: short-circuit an election.
        let my_last = my_last_applied(&inner);
        topo.process_win_election(Uuid::new_v4(), my_last);
        inner.election_id = topo.election_id();
        inner.is_waiting_for_drain = true;
    }
    update_member_state_from_topology(&mut inner, topo);
    drop(inner);
    success.store(true, Ordering::SeqCst);
    shared.executor.signal_event(finish_event);
}

fn step_down_finish(
    shared: &Arc<CoordShared>,
    topo: &mut TopologyCoordinator,
    ctx: &TaskContext,
    step_down_until: Instant,
    result: &ResultSlot,
) {
    if ctx.canceled {
        set_result(result, Err(RookDBError::ShutdownInProgress(
            "replication shutdown in progress".to_string(),
        )));
        return;
    }
    if topo.role() != Role::Leader {
        set_result(result, Err(RookDBError::NotMaster(
            "already stepped down from primary while processing step down request".to_string(),
        )));
        return;
    }
    if Instant::now() >= step_down_until {
        set_result(result, Err(RookDBError::ExceededTimeLimit(
            "by the time we were ready to step down, we were already past the time we were \
             supposed to step down until"
                .to_string(),
        )));
        return;
    }

    topo.set_step_down_time(step_down_until);
    topo.step_down();

    let mut inner = shared.inner.lock();
    update_member_state_from_topology(&mut inner, topo);
    // Wake every thread blocked in awaitReplication.
    for waiter in &inner.waiters {
        waiter.master.store(false, Ordering::SeqCst);
        waiter.cond.notify_all();
    }
    drop(inner);
    shared.external.close_connections();
    set_result(result, Ok(()));
}

// ---- heartbeat scheduling ---------------------------------------------------

fn start_heartbeats(shared: &Arc<CoordShared>, inner: &Inner) {
    let generation = inner.hb_generation;
    let now = Instant::now();
    for (i, member) in inner.rs_config.members.iter().enumerate() {
        if Some(i) == inner.self_index {
            continue;
        }
        schedule_heartbeat_to_target(shared, member.host.clone(), generation, now);
    }
}

fn schedule_heartbeat_to_target(
    shared: &Arc<CoordShared>,
    target: HostAndPort,
    generation: u64,
    when: Instant,
) {
    let shared_for_task = Arc::clone(shared);
    let _ = shared.executor.schedule_at(when, move |_topo, ctx| {
        if ctx.canceled {
            return;
        }
        let request = {
            let inner = shared_for_task.inner.lock();
            if inner.in_shutdown || inner.hb_generation != generation {
                return;
            }
            HeartbeatRequest {
                set_name: shared_for_task.settings.our_set_name().to_string(),
                sender_host: inner
                    .self_index
                    .map(|i| inner.rs_config.member_at(i).host.clone()),
                sender_id: inner.self_index.map(|i| inner.rs_config.member_at(i).id),
                config_version: inner.rs_config.version,
            }
        };
        let shared_for_reply = Arc::clone(&shared_for_task);
        let target_for_reply = target.clone();
        shared_for_task.network.start_heartbeat(
            &target,
            request,
            Box::new(move |response| {
                let shared_for_handler = Arc::clone(&shared_for_reply);
                let target_for_handler = target_for_reply.clone();
                let _ = shared_for_reply.executor.schedule(move |topo, ctx| {
                    handle_heartbeat_response(
                        &shared_for_handler,
                        topo,
                        ctx,
                        target_for_handler,
                        generation,
                        response,
                    );
                });
            }),
        );
    });
}

fn handle_heartbeat_response(
    shared: &Arc<CoordShared>,
    topo: &mut TopologyCoordinator,
    ctx: &TaskContext,
    target: HostAndPort,
    generation: u64,
    response: Result<HeartbeatResponse>,
) {
    if ctx.canceled {
        return;
    }
    {
        let inner = shared.inner.lock();
        if inner.in_shutdown || inner.hb_generation != generation {
            return;
        }
    }

    let disposition = topo.process_heartbeat_response(Instant::now(), &target, &response);
    // Bootstrap probes to hosts outside the configuration are one-shot.
    if topo.config().find_member_by_host(&target).is_some() {
        schedule_heartbeat_to_target(shared, target, generation, disposition.next_heartbeat_at);
    }

    match disposition.action {
        HeartbeatAction::None => {}
        HeartbeatAction::StartElection => start_elect_self(shared, topo),
        HeartbeatAction::StepDownSelf => {
            if topo.role() == Role::Leader {
                info!("stepping down: a higher-priority primary is up");
                topo.step_down();
                let mut inner = shared.inner.lock();
                update_member_state_from_topology(&mut inner, topo);
                for waiter in &inner.waiters {
                    waiter.master.store(false, Ordering::SeqCst);
                    waiter.cond.notify_all();
                }
                drop(inner);
                shared.external.close_connections();
            }
        }
        HeartbeatAction::Reconfig(doc) => heartbeat_reconfig(shared, topo, doc),
    }
}

/// A peer advertised a newer configuration; adopt it through the standard
/// install path.
fn heartbeat_reconfig(shared: &Arc<CoordShared>, topo: &mut TopologyCoordinator, doc: Document) {
    let config = match ReplicaSetConfig::initialize(&doc) {
        Ok(config) => config,
        Err(status) => {
            warn!("heartbeat carried a configuration that does not parse: {}", status);
            return;
        }
    };

    {
        let mut inner = shared.inner.lock();
        match inner.config_state {
            ConfigState::Steady | ConfigState::Uninitialized => {}
            // Another configuration change is already in flight.
            _ => return,
        }
        if inner.rs_config.is_initialized() && config.version <= inner.rs_config.version {
            return;
        }
        set_config_state(shared, &mut inner, ConfigState::HBReconfiguring);
    }

    let my_index = config
        .find_self(|host| shared.external.is_self(host))
        .ok();
    if let Err(status) = shared
        .external
        .store_local_config_document(&config.to_document())
    {
        warn!("could not store heartbeat-propagated configuration: {}", status);
    }

    info!(
        "adopting configuration version {} learned via heartbeat",
        config.version
    );
    let mut inner = shared.inner.lock();
    assert!(inner.config_state == ConfigState::HBReconfiguring);
    let action = install_config(shared, topo, &mut inner, config, my_index);
    drop(inner);
    perform_post_install(shared, action);
}

// ---- elections --------------------------------------------------------------

fn start_elect_self(shared: &Arc<CoordShared>, topo: &mut TopologyCoordinator) {
    if !topo.become_candidate_if_electable(Instant::now()) {
        return;
    }

    let (targets, request, my_votes) = {
        let inner = shared.inner.lock();
        if inner.election.is_some() {
            // A previous round has not fully wound down.
            topo.process_lose_election();
            return;
        }
        let self_index = match inner.self_index {
            Some(index) => index,
            None => {
                topo.process_lose_election();
                return;
            }
        };
        let me = inner.rs_config.member_at(self_index);
        let targets: Vec<HostAndPort> = inner
            .rs_config
            .members
            .iter()
            .enumerate()
            .filter(|(i, m)| *i != self_index && m.is_voter())
            .map(|(_, m)| m.host.clone())
            .collect();
        let request = FreshRequest {
            set_name: inner.rs_config.name.clone(),
            who: me.host.clone(),
            candidate_id: me.id,
            config_version: inner.rs_config.version,
            op_time: my_last_applied(&inner),
        };
        (targets, request, me.votes)
    };

    if targets.is_empty() {
        // Nobody to ask; the config made us the only voter.
        let my_last = request.op_time;
        topo.process_win_election(Uuid::new_v4(), my_last);
        let mut inner = shared.inner.lock();
        inner.election_id = topo.election_id();
        inner.is_waiting_for_drain = true;
        update_member_state_from_topology(&mut inner, topo);
        return;
    }

    let finish_event = match shared.executor.make_event() {
        Ok(event) => event,
        Err(_) => {
            topo.process_lose_election();
            return;
        }
    };
    let round = Uuid::new_v4();
    info!("standing for election (round {})", round);
    {
        let mut inner = shared.inner.lock();
        inner.election = Some(ElectionState::new(round, targets.len(), finish_event));
    }

    for target in targets {
        let shared_for_reply = Arc::clone(shared);
        shared.network.start_fresh(
            &target,
            request.clone(),
            Box::new(move |response| {
                let shared_for_handler = Arc::clone(&shared_for_reply);
                let _ = shared_for_reply.executor.schedule(move |topo, ctx| {
                    handle_fresh_response(&shared_for_handler, topo, ctx, my_votes, response);
                });
            }),
        );
    }
}

fn finish_election(
    shared: &Arc<CoordShared>,
    topo: &mut TopologyCoordinator,
    inner: &mut MutexGuard<'_, Inner>,
    won: bool,
) {
    let election = inner.election.take().expect("election must be in flight");
    if won {
        let my_last = my_last_applied(inner);
        topo.process_win_election(Uuid::new_v4(), my_last);
        inner.election_id = topo.election_id();
        inner.is_waiting_for_drain = true;
        info!("election succeeded; assuming primary role");
    } else if topo.role() == Role::Candidate {
        topo.process_lose_election();
    }
    update_member_state_from_topology(inner, topo);
    shared.executor.signal_event(election.finish_event);
}

fn handle_fresh_response(
    shared: &Arc<CoordShared>,
    topo: &mut TopologyCoordinator,
    ctx: &TaskContext,
    my_votes: i64,
    response: Result<crate::protocol::FreshResponse>,
) {
    let mut inner = shared.inner.lock();
    let state = match inner.election.as_mut() {
        Some(state) => state,
        None => return,
    };
    state.freshness.process_response(&response);
    if !state.freshness.done() {
        return;
    }
    let canceled = ctx.canceled || state.is_canceled();
    if canceled || state.freshness.should_abort_election() {
        if state.freshness.should_abort_election() {
            info!("not electing self; a fresher or vetoing member responded");
        }
        finish_election(shared, topo, &mut inner, false);
        return;
    }

    // Freshness round passed; gather votes.
    let round = state.round;
    let (targets, request) = {
        let self_index = match inner.self_index {
            Some(index) => index,
            None => {
                finish_election(shared, topo, &mut inner, false);
                return;
            }
        };
        let me = inner.rs_config.member_at(self_index);
        let targets: Vec<HostAndPort> = inner
            .rs_config
            .members
            .iter()
            .enumerate()
            .filter(|(i, m)| *i != self_index && m.is_voter())
            .map(|(_, m)| m.host.clone())
            .collect();
        let request = ElectRequest {
            set_name: inner.rs_config.name.clone(),
            candidate_id: me.id,
            config_version: inner.rs_config.version,
            round,
        };
        (targets, request)
    };
    let state = inner.election.as_mut().expect("still in flight");
    state.elect = Some(ElectCmdRunner::new(round, targets.len(), my_votes));
    drop(inner);

    for target in targets {
        let shared_for_reply = Arc::clone(shared);
        shared.network.start_elect(
            &target,
            request.clone(),
            Box::new(move |response| {
                let shared_for_handler = Arc::clone(&shared_for_reply);
                let _ = shared_for_reply.executor.schedule(move |topo, ctx| {
                    handle_elect_response(&shared_for_handler, topo, ctx, response);
                });
            }),
        );
    }
}

fn handle_elect_response(
    shared: &Arc<CoordShared>,
    topo: &mut TopologyCoordinator,
    ctx: &TaskContext,
    response: Result<ElectResponse>,
) {
    let mut inner = shared.inner.lock();
    let state = match inner.election.as_mut() {
        Some(state) => state,
        None => return,
    };
    let runner = match state.elect.as_mut() {
        Some(runner) => runner,
        None => return,
    };
    runner.process_response(&response);
    if !runner.done() {
        return;
    }
    let votes = runner.received_votes();
    let canceled = ctx.canceled || state.is_canceled();
    let majority = inner.rs_config.majority_vote_count() as i64;
    let won = !canceled && votes >= majority;
    if !won {
        info!(
            "election lost or cancelled: received {} of {} required votes",
            votes,
            majority
        );
    }
    finish_election(shared, topo, &mut inner, won);
}

/// Reverts the configuration-state on drop unless dismissed, so a failed
/// initiate or reconfig leaves the state machine where it started.
struct ConfigStateGuard {
    shared: Arc<CoordShared>,
    revert_to: ConfigState,
    dismissed: bool,
}

impl ConfigStateGuard {
    fn new(shared: &Arc<CoordShared>, revert_to: ConfigState) -> Self {
        Self {
            shared: Arc::clone(shared),
            revert_to,
            dismissed: false,
        }
    }

    fn dismiss(mut self) {
        self.dismissed = true;
    }
}

impl Drop for ConfigStateGuard {
    fn drop(&mut self) {
        if !self.dismissed {
            let mut inner = self.shared.inner.lock();
            set_config_state(&self.shared, &mut inner, self.revert_to);
        }
    }
}
