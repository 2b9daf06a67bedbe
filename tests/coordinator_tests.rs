/*!
 * Replication coordinator tests
 * End-to-end scenarios: elections and drain, write-concern waiting,
 * stepdown, reconfiguration and progress tracking
 */

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bson::doc;
use uuid::Uuid;

use rookdb::config::ReplicationSettings;
use rookdb::coordinator::{ConfigState, ReplicationCoordinator};
use rookdb::error::RookDBError;
use rookdb::external_state::MemoryExternalState;
use rookdb::heap_engine::HeapRecoveryUnit;
use rookdb::member_state::MemberState;
use rookdb::network::MockNetwork;
use rookdb::optime::OpTime;
use rookdb::protocol::{HandshakeArgs, HeartbeatRequest, UpdatePositionArgs, UpdatePositionEntry};
use rookdb::recovery_unit::OperationContext;
use rookdb::replica_set_config::HostAndPort;
use rookdb::write_concern::WriteConcern;

struct Fixture {
    coordinator: Arc<ReplicationCoordinator>,
    external: Arc<MemoryExternalState>,
    network: Arc<MockNetwork>,
}

fn settings() -> ReplicationSettings {
    ReplicationSettings {
        replset: Some("rs0".to_string()),
        heartbeat_interval_ms: 10,
        heartbeat_timeout_ms: 200,
        election_timeout_ms: 40,
        quorum_check_timeout_ms: 1000,
        ..Default::default()
    }
}

fn fixture() -> Fixture {
    let external = Arc::new(MemoryExternalState::new(HostAndPort::new("h", 1)));
    let network = Arc::new(MockNetwork::healthy());
    let coordinator = Arc::new(ReplicationCoordinator::new(
        settings(),
        external.clone(),
        network.clone(),
    ));
    coordinator.start_replication();
    coordinator.wait_for_startup_complete();
    Fixture {
        coordinator,
        external,
        network,
    }
}

fn new_opctx() -> OperationContext {
    OperationContext::new(Box::new(HeapRecoveryUnit::new()))
}

fn one_node_config() -> bson::Document {
    doc! { "_id": "rs0", "version": 1, "members": [ { "_id": 0, "host": "h:1" } ] }
}

fn three_node_config(version: i64) -> bson::Document {
    doc! {
        "_id": "rs0",
        "version": version,
        "members": [
            { "_id": 0, "host": "h:1" },
            { "_id": 1, "host": "h:2" },
            { "_id": 2, "host": "h:3" },
        ],
    }
}

fn wait_for_member_state(
    coordinator: &ReplicationCoordinator,
    state: MemberState,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if coordinator.get_current_member_state() == state {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Install a three-node config and win the election so the local node is
/// primary with the drain already completed.
fn become_three_node_primary(f: &Fixture) {
    f.network.set_fresh_handler(|_, req| {
        Ok(rookdb::protocol::FreshResponse {
            id: 99,
            set_name: req.set_name.clone(),
            op_time: OpTime::NULL,
            fresher: false,
            veto: false,
            errmsg: None,
        })
    });
    f.network.set_elect_handler(|_, req| {
        Ok(rookdb::protocol::ElectResponse {
            vote: 1,
            round: req.round,
        })
    });

    f.coordinator
        .process_replset_initiate(&three_node_config(1))
        .unwrap();
    assert!(f.coordinator.set_follower_mode(MemberState::Secondary));
    assert!(wait_for_member_state(
        &f.coordinator,
        MemberState::Primary,
        Duration::from_secs(5)
    ));
    f.coordinator.signal_drain_complete();
}

/// Register a downstream member's progress entry and report its position.
fn report_progress(f: &Fixture, member_id: i64, op_time: OpTime) -> Uuid {
    let rid = Uuid::new_v4();
    f.coordinator
        .process_handshake(&HandshakeArgs { rid, member_id })
        .unwrap();
    f.coordinator.set_last_optime(rid, op_time).unwrap();
    rid
}

#[test]
fn single_node_election_and_drain() {
    let f = fixture();
    assert_eq!(f.coordinator.get_config_state(), ConfigState::Uninitialized);

    f.coordinator.process_replset_initiate(&one_node_config()).unwrap();
    assert_eq!(f.coordinator.get_config_state(), ConfigState::Steady);
    assert_eq!(f.coordinator.get_current_member_state(), MemberState::Primary);
    assert!(f.coordinator.is_waiting_for_applier_to_drain());
    assert!(!f.coordinator.can_accept_writes_for_database("app"));
    assert!(f.coordinator.can_accept_writes_for_database("local"));

    f.coordinator.signal_drain_complete();
    assert!(!f.coordinator.is_waiting_for_applier_to_drain());
    assert_eq!(f.external.temp_collection_drops(), 1);
    assert!(f.coordinator.can_accept_writes_for_database("app"));

    // The applier may signal whenever it wants; a second call is a no-op.
    f.coordinator.signal_drain_complete();
    assert_eq!(f.external.temp_collection_drops(), 1);

    f.coordinator.shutdown();
}

#[test]
fn initiate_requires_uninitialized_state() {
    let f = fixture();
    f.coordinator.process_replset_initiate(&one_node_config()).unwrap();
    let err = f
        .coordinator
        .process_replset_initiate(&one_node_config())
        .unwrap_err();
    assert!(matches!(err, RookDBError::AlreadyInitialized(_)));
    f.coordinator.shutdown();
}

#[test]
fn majority_write_succeeds_when_a_secondary_catches_up() {
    let f = fixture();
    become_three_node_primary(&f);
    f.coordinator.set_my_last_optime(OpTime::new(1, 10)).unwrap();

    let coordinator = Arc::clone(&f.coordinator);
    let rid = report_progress(&f, 1, OpTime::NULL);
    let updater = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        coordinator.set_last_optime(rid, OpTime::new(1, 10)).unwrap();
    });

    let opctx = new_opctx();
    let wc = WriteConcern::majority().with_timeout(Duration::from_millis(1000));
    let (status, elapsed) = f.coordinator.await_replication(&opctx, OpTime::new(1, 10), &wc);
    updater.join().unwrap();

    assert!(status.is_ok(), "await failed: {:?}", status);
    assert!(elapsed <= Duration::from_millis(1000));
    f.coordinator.shutdown();
}

#[test]
fn majority_write_times_out_when_secondaries_lag() {
    let f = fixture();
    become_three_node_primary(&f);
    f.coordinator.set_my_last_optime(OpTime::new(1, 10)).unwrap();
    report_progress(&f, 1, OpTime::new(1, 9));

    let opctx = new_opctx();
    let wc = WriteConcern::majority().with_timeout(Duration::from_millis(300));
    let (status, _) = f.coordinator.await_replication(&opctx, OpTime::new(1, 10), &wc);
    assert!(matches!(status, Err(RookDBError::ExceededTimeLimit(_))));
    f.coordinator.shutdown();
}

#[test]
fn stepdown_races_with_a_blocked_waiter() {
    let f = fixture();
    become_three_node_primary(&f);
    f.coordinator.set_my_last_optime(OpTime::new(1, 10)).unwrap();
    // One electable secondary is caught up, so the stepdown check passes.
    report_progress(&f, 1, OpTime::new(1, 10));

    let coordinator = Arc::clone(&f.coordinator);
    let waiter = thread::spawn(move || {
        let opctx = new_opctx();
        let wc = WriteConcern::number(3).with_timeout(Duration::from_secs(30));
        coordinator.await_replication(&opctx, OpTime::new(1, 10), &wc)
    });
    thread::sleep(Duration::from_millis(100));

    let opctx = new_opctx();
    f.coordinator
        .step_down(
            &opctx,
            false,
            Duration::from_millis(1000),
            Duration::from_secs(10),
        )
        .unwrap();

    let (status, _) = waiter.join().unwrap();
    assert!(matches!(status, Err(RookDBError::NotMaster(_))));
    assert_eq!(f.coordinator.get_current_member_state(), MemberState::Secondary);

    let err = f
        .coordinator
        .step_down(&opctx, false, Duration::from_millis(100), Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, RookDBError::NotMaster(_)));
    f.coordinator.shutdown();
}

#[test]
fn stepdown_without_caught_up_secondary_requires_force() {
    let f = fixture();
    f.coordinator.process_replset_initiate(&one_node_config()).unwrap();
    assert_eq!(f.coordinator.get_current_member_state(), MemberState::Primary);

    // A lone node has no other electable member to hand off to.
    let opctx = new_opctx();
    let err = f
        .coordinator
        .step_down(
            &opctx,
            false,
            Duration::from_millis(100),
            Duration::from_secs(10),
        )
        .unwrap_err();
    assert!(matches!(err, RookDBError::ExceededTimeLimit(_)));
    assert_eq!(f.coordinator.get_current_member_state(), MemberState::Primary);

    f.coordinator
        .step_down(
            &opctx,
            true,
            Duration::from_millis(100),
            Duration::from_secs(10),
        )
        .unwrap();
    assert_eq!(f.coordinator.get_current_member_state(), MemberState::Secondary);
    f.coordinator.shutdown();
}

#[test]
fn force_reconfig_bumps_version_by_large_random() {
    let f = fixture();
    f.coordinator
        .process_replset_initiate(&three_node_config(7))
        .unwrap();
    assert_eq!(f.coordinator.get_current_member_state(), MemberState::Startup);

    // Not primary, but force proceeds anyway.
    f.coordinator
        .process_replset_reconfig(&three_node_config(7), true)
        .unwrap();

    let version = f.coordinator.get_replica_set_config().version;
    assert!((10_007..110_007).contains(&version), "version {}", version);
    let stored = f.external.stored_config().unwrap();
    assert_eq!(stored.get_i64("version").unwrap(), version);
    f.coordinator.shutdown();
}

#[test]
fn reconfig_gates_on_config_state() {
    let f = fixture();
    let err = f
        .coordinator
        .process_replset_reconfig(&three_node_config(2), false)
        .unwrap_err();
    assert!(matches!(err, RookDBError::NotYetInitialized(_)));

    f.coordinator.process_replset_initiate(&three_node_config(1)).unwrap();
    // Non-forced reconfig on a non-primary is rejected.
    let err = f
        .coordinator
        .process_replset_reconfig(&three_node_config(2), false)
        .unwrap_err();
    assert!(matches!(err, RookDBError::NotMaster(_)));

    // A failed reconfig leaves the state machine in Steady.
    assert_eq!(f.coordinator.get_config_state(), ConfigState::Steady);
    f.coordinator.shutdown();
}

#[test]
fn unknown_rid_progress_is_rejected() {
    let f = fixture();
    f.coordinator.process_replset_initiate(&three_node_config(1)).unwrap();

    let err = f
        .coordinator
        .set_last_optime(Uuid::new_v4(), OpTime::new(1, 5))
        .unwrap_err();
    assert!(matches!(err, RookDBError::NodeNotFound(_)));

    let err = f
        .coordinator
        .process_replset_update_position(&UpdatePositionArgs {
            updates: vec![UpdatePositionEntry {
                rid: Uuid::new_v4(),
                op_time: OpTime::new(1, 5),
            }],
        })
        .unwrap_err();
    assert!(matches!(err, RookDBError::NodeNotFound(_)));
    f.coordinator.shutdown();
}

#[test]
fn handshake_for_unknown_member_is_rejected() {
    let f = fixture();
    f.coordinator.process_replset_initiate(&three_node_config(1)).unwrap();
    let err = f
        .coordinator
        .process_handshake(&HandshakeArgs {
            rid: Uuid::new_v4(),
            member_id: 42,
        })
        .unwrap_err();
    assert!(matches!(err, RookDBError::NodeNotFound(_)));
    f.coordinator.shutdown();
}

#[test]
fn config_round_trips_through_install() {
    let f = fixture();
    f.coordinator.process_replset_initiate(&three_node_config(1)).unwrap();

    let config = f.coordinator.get_replica_set_config();
    assert_eq!(config.name, "rs0");
    assert_eq!(config.version, 1);
    assert_eq!(config.num_members(), 3);
    assert_eq!(f.coordinator.get_my_id(), Some(0));
    assert_eq!(
        f.coordinator.get_other_nodes_in_repl_set(),
        vec![HostAndPort::new("h", 2), HostAndPort::new("h", 3)]
    );
    f.coordinator.shutdown();
}

#[test]
fn hosts_written_to_tracks_configured_members() {
    let f = fixture();
    become_three_node_primary(&f);
    f.coordinator.set_my_last_optime(OpTime::new(1, 7)).unwrap();
    report_progress(&f, 1, OpTime::new(1, 7));
    report_progress(&f, 2, OpTime::new(1, 3));

    let hosts = f.coordinator.get_hosts_written_to(OpTime::new(1, 7));
    assert!(hosts.contains(&HostAndPort::new("h", 1)));
    assert!(hosts.contains(&HostAndPort::new("h", 2)));
    assert!(!hosts.contains(&HostAndPort::new("h", 3)));
    f.coordinator.shutdown();
}

#[test]
fn await_replication_fast_paths() {
    let f = fixture();
    f.coordinator.process_replset_initiate(&one_node_config()).unwrap();
    let opctx = new_opctx();

    // A zero node count needs no waiting at all.
    let (status, _) =
        f.coordinator
            .await_replication(&opctx, OpTime::new(5, 5), &WriteConcern::number(0));
    assert!(status.is_ok());

    // The null position is trivially replicated, even off-primary.
    let (status, _) =
        f.coordinator
            .await_replication(&opctx, OpTime::NULL, &WriteConcern::number(3));
    assert!(status.is_ok());

    // Majority on a one-node set is satisfied once self has applied it.
    f.coordinator.set_my_last_optime(OpTime::new(1, 1)).unwrap();
    let (status, _) =
        f.coordinator
            .await_replication(&opctx, OpTime::new(1, 1), &WriteConcern::majority());
    assert!(status.is_ok());
    f.coordinator.shutdown();
}

#[test]
fn await_replication_rejects_non_primary() {
    let f = fixture();
    f.coordinator.process_replset_initiate(&three_node_config(1)).unwrap();
    let opctx = new_opctx();
    let (status, _) =
        f.coordinator
            .await_replication(&opctx, OpTime::new(1, 1), &WriteConcern::number(1));
    assert!(matches!(status, Err(RookDBError::NotMaster(_))));
    f.coordinator.shutdown();
}

#[test]
fn unknown_write_concern_mode_reports_instead_of_hanging() {
    let f = fixture();
    become_three_node_primary(&f);
    f.coordinator.set_my_last_optime(OpTime::new(1, 1)).unwrap();

    let opctx = new_opctx();
    let wc = WriteConcern::mode("no-such-mode").with_timeout(Duration::from_secs(30));
    let start = Instant::now();
    let (status, _) = f.coordinator.await_replication(&opctx, OpTime::new(1, 1), &wc);
    assert!(matches!(status, Err(RookDBError::UnknownReplWriteConcern(_))));
    assert!(start.elapsed() < Duration::from_secs(5));
    f.coordinator.shutdown();
}

#[test]
fn tagged_write_concern_counts_distinct_tag_values() {
    let external = Arc::new(MemoryExternalState::new(HostAndPort::new("h", 1)));
    let network = Arc::new(MockNetwork::healthy());
    let coordinator = Arc::new(ReplicationCoordinator::new(
        settings(),
        external.clone(),
        network.clone(),
    ));
    coordinator.start_replication();
    coordinator.wait_for_startup_complete();
    let f = Fixture {
        coordinator,
        external,
        network,
    };

    f.network.set_fresh_handler(|_, req| {
        Ok(rookdb::protocol::FreshResponse {
            id: 99,
            set_name: req.set_name.clone(),
            op_time: OpTime::NULL,
            fresher: false,
            veto: false,
            errmsg: None,
        })
    });
    f.network.set_elect_handler(|_, req| {
        Ok(rookdb::protocol::ElectResponse {
            vote: 1,
            round: req.round,
        })
    });

    let config = doc! {
        "_id": "rs0",
        "version": 1,
        "members": [
            { "_id": 0, "host": "h:1", "tags": { "dc": "east" } },
            { "_id": 1, "host": "h:2", "tags": { "dc": "west" } },
            { "_id": 2, "host": "h:3", "tags": { "dc": "west" } },
        ],
        "settings": { "getLastErrorModes": { "multiDC": { "dc": 2 } } },
    };
    f.coordinator.process_replset_initiate(&config).unwrap();
    assert!(f.coordinator.set_follower_mode(MemberState::Secondary));
    assert!(wait_for_member_state(
        &f.coordinator,
        MemberState::Primary,
        Duration::from_secs(5)
    ));
    f.coordinator.signal_drain_complete();
    f.coordinator.set_my_last_optime(OpTime::new(1, 5)).unwrap();

    let opctx = new_opctx();
    let wc = WriteConcern::mode("multiDC").with_timeout(Duration::from_millis(300));
    // Only "east" has reached the position: not satisfied.
    let (status, _) = f.coordinator.await_replication(&opctx, OpTime::new(1, 5), &wc);
    assert!(matches!(status, Err(RookDBError::ExceededTimeLimit(_))));

    // A "west" member catches up: two distinct datacenters.
    report_progress(&f, 1, OpTime::new(1, 5));
    let wc = WriteConcern::mode("multiDC").with_timeout(Duration::from_millis(1000));
    let (status, _) = f.coordinator.await_replication(&opctx, OpTime::new(1, 5), &wc);
    assert!(status.is_ok(), "await failed: {:?}", status);
    f.coordinator.shutdown();
}

#[test]
fn interrupted_waiter_observes_interruption() {
    let f = fixture();
    f.coordinator.process_replset_initiate(&one_node_config()).unwrap();
    f.coordinator.set_my_last_optime(OpTime::new(1, 1)).unwrap();

    let opctx = new_opctx();
    let op_id = opctx.op_id();
    let kill = opctx.kill_handle();
    let coordinator = Arc::clone(&f.coordinator);
    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        kill.store(true, std::sync::atomic::Ordering::SeqCst);
        coordinator.interrupt(op_id);
    });

    let wc = WriteConcern::number(2).with_timeout(Duration::from_secs(30));
    let (status, _) = f.coordinator.await_replication(&opctx, OpTime::new(1, 1), &wc);
    killer.join().unwrap();
    assert!(matches!(status, Err(RookDBError::Interrupted(_))));
    f.coordinator.shutdown();
}

#[test]
fn read_gating_follows_member_state() {
    let f = fixture();
    f.coordinator.process_replset_initiate(&three_node_config(1)).unwrap();

    // STARTUP with slaveOk: not readable yet.
    let err = f.coordinator.check_can_serve_reads_for("app", true).unwrap_err();
    assert!(matches!(err, RookDBError::NotMasterOrSecondary(_)));
    let err = f.coordinator.check_can_serve_reads_for("app", false).unwrap_err();
    assert!(matches!(err, RookDBError::NotMaster(_)));

    assert!(f.coordinator.set_follower_mode(MemberState::Secondary));
    assert!(f.coordinator.check_can_serve_reads_for("app", true).is_ok());
    assert!(f.coordinator.check_can_serve_reads_for("app", false).is_err());
    f.coordinator.shutdown();
}

#[test]
fn maintenance_mode_only_on_secondaries() {
    let f = fixture();
    // Priority zero keeps this node out of elections for the whole test.
    let config = doc! {
        "_id": "rs0",
        "version": 1,
        "members": [
            { "_id": 0, "host": "h:1", "priority": 0.0 },
            { "_id": 1, "host": "h:2" },
            { "_id": 2, "host": "h:3" },
        ],
    };
    f.coordinator.process_replset_initiate(&config).unwrap();
    assert!(f.coordinator.set_follower_mode(MemberState::Secondary));

    assert!(!f.coordinator.get_maintenance_mode());
    f.coordinator.set_maintenance_mode(true).unwrap();
    assert!(f.coordinator.get_maintenance_mode());
    assert_eq!(
        f.coordinator.get_current_member_state(),
        MemberState::Recovering
    );
    f.coordinator.set_maintenance_mode(false).unwrap();
    assert!(!f.coordinator.get_maintenance_mode());

    // Leaving maintenance mode twice fails.
    let err = f.coordinator.set_maintenance_mode(false).unwrap_err();
    assert!(matches!(err, RookDBError::OperationFailed(_)));
    f.coordinator.shutdown();
}

#[test]
fn heartbeat_gated_until_startup_completes() {
    let external = Arc::new(MemoryExternalState::new(HostAndPort::new("h", 1)));
    let network = Arc::new(MockNetwork::healthy());
    let coordinator = ReplicationCoordinator::new(settings(), external, network);

    let request = HeartbeatRequest {
        set_name: "rs0".to_string(),
        sender_host: Some(HostAndPort::new("h", 9)),
        sender_id: Some(9),
        config_version: 1,
    };
    let err = coordinator.process_heartbeat(&request).unwrap_err();
    assert!(matches!(err, RookDBError::NotYetInitialized(_)));

    coordinator.start_replication();
    coordinator.wait_for_startup_complete();
    let response = coordinator.process_heartbeat(&request).unwrap();
    assert_eq!(response.set_name, "rs0");
    coordinator.shutdown();
}

#[test]
fn heartbeat_from_unknown_sender_seeds_a_probe_when_unconfigured() {
    use std::sync::Mutex;

    let external = Arc::new(MemoryExternalState::new(HostAndPort::new("h", 1)));
    let network = Arc::new(MockNetwork::new());
    let probed: Arc<Mutex<Vec<HostAndPort>>> = Arc::new(Mutex::new(Vec::new()));
    let probed_for_handler = Arc::clone(&probed);
    network.set_heartbeat_handler(move |target, req| {
        probed_for_handler.lock().unwrap().push(target.clone());
        Ok(rookdb::protocol::HeartbeatResponse {
            set_name: req.set_name.clone(),
            state: MemberState::Secondary,
            config_version: 0,
            op_time: OpTime::NULL,
            sender_up: true,
            config: None,
        })
    });
    let coordinator =
        ReplicationCoordinator::new(settings(), external, network.clone());
    coordinator.start_replication();
    coordinator.wait_for_startup_complete();

    let request = HeartbeatRequest {
        set_name: "rs0".to_string(),
        sender_host: Some(HostAndPort::new("h", 9)),
        sender_id: Some(9),
        config_version: 3,
    };
    coordinator.process_heartbeat(&request).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if probed.lock().unwrap().contains(&HostAndPort::new("h", 9)) {
            break;
        }
        assert!(Instant::now() < deadline, "no rescue heartbeat was sent");
        thread::sleep(Duration::from_millis(5));
    }
    coordinator.shutdown();
}

#[test]
fn shutdown_wakes_waiters_and_rejects_operations() {
    let f = fixture();
    f.coordinator.process_replset_initiate(&one_node_config()).unwrap();
    f.coordinator.set_my_last_optime(OpTime::new(1, 1)).unwrap();

    let coordinator = Arc::clone(&f.coordinator);
    let waiter = thread::spawn(move || {
        let opctx = new_opctx();
        let wc = WriteConcern::number(2).with_timeout(Duration::from_secs(30));
        coordinator.await_replication(&opctx, OpTime::new(1, 1), &wc)
    });
    thread::sleep(Duration::from_millis(100));

    f.coordinator.shutdown();
    let (status, _) = waiter.join().unwrap();
    assert!(matches!(status, Err(RookDBError::ShutdownInProgress(_))));
}
